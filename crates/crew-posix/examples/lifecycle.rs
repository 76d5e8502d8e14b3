//! End-to-end worker lifecycle demo
//!
//! Spawns a compute worker on a kernel stack, a sleeper on an mmap-leased
//! stack, and a stuck worker that gets forcibly destroyed, then prints the
//! pool diagnostics.
//!
//! ```bash
//! cargo run -p crew-posix --example lifecycle
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crew_core::{PoolConfig, WorkerConfig, WorkerPool};
use crew_posix::{MappedRegions, PosixKernel};

fn main() {
    let pool = WorkerPool::with_config_and_memory(
        Arc::new(PosixKernel::new()),
        PoolConfig::default(),
        Arc::new(MappedRegions::new()),
    );
    pool.on_event(Arc::new(|id, event| println!("[{id}] {event}")));
    pool.on_error(Arc::new(|err| eprintln!("spawn failed: {err}")));

    let crunch = pool
        .spawn(
            || {
                let mut acc: u64 = 0;
                for i in 0..5_000_000u64 {
                    acc = acc.wrapping_add(i * i);
                }
                println!("crunch result: {acc}");
            },
            WorkerConfig::named("crunch"),
        )
        .expect("spawn crunch");

    let mapped = pool
        .spawn_external(
            || {
                thread::sleep(Duration::from_millis(50));
                println!("mapped-stack worker done");
            },
            WorkerConfig::named("mapped"),
        )
        .expect("spawn mapped");

    let stuck = pool
        .spawn(
            || loop {
                thread::sleep(Duration::from_millis(10));
            },
            WorkerConfig::named("stuck"),
        )
        .expect("spawn stuck");

    crunch.wait();
    mapped.wait();
    println!("destroying {}: {}", stuck.name(), stuck.destroy());

    // Give finalization a moment to settle before reading the counters.
    thread::sleep(Duration::from_millis(100));
    let diag = pool.diag();
    println!(
        "pool: {} tracked, {} running, max runtime {:?}",
        diag.total_workers, diag.running_workers, diag.max_runtime
    );
}
