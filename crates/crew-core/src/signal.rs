//! One-shot completion signal

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A latch set at most once and waited on any number of times
///
/// Waiters blocked before the set are woken; waiters arriving after it
/// return immediately.
pub(crate) struct Signal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Set the latch and wake every waiter; later calls are no-ops
    pub(crate) fn set(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.cond.notify_all();
    }

    /// Whether the latch has been set
    pub(crate) fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    /// Block until set
    pub(crate) fn wait(&self) {
        let mut flag = self.flag.lock();
        while !*flag {
            self.cond.wait(&mut flag);
        }
    }

    /// Block until set or `timeout` elapses; returns whether it was set
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut flag = self.flag.lock();
        if !*flag {
            self.cond.wait_for(&mut flag, timeout);
        }
        *flag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_set_before_wait_returns_immediately() {
        let signal = Signal::new();
        signal.set();

        assert!(signal.is_set());
        signal.wait();
        assert!(signal.wait_timeout(Duration::from_millis(0)));
    }

    #[test]
    fn test_wait_blocks_until_set() {
        let signal = Arc::new(Signal::new());
        let setter = Arc::clone(&signal);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            setter.set();
        });

        signal.wait();
        assert!(signal.is_set());
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let signal = Signal::new();
        let start = Instant::now();

        assert!(!signal.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(!signal.is_set());
    }

    #[test]
    fn test_set_is_idempotent() {
        let signal = Signal::new();
        signal.set();
        signal.set();
        assert!(signal.is_set());
    }
}
