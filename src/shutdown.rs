//! Cooperative cancellation
//!
//! Every wait and sleep in the agent and the change monitor goes through a
//! `ShutdownSignal`, so cancelling it wakes all of them within one call.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

/// Cloneable cancellation flag with bounded waits
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every waiter
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        // Notify under the lock so a waiter between its check and its wait
        // cannot miss the wakeup.
        let _guard = self.inner.lock.lock();
        self.inner.wake.notify_all();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Block for at most `timeout`; returns true if shutdown was requested
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.is_cancelled() {
            if self.inner.wake.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_cancelled()
    }

    /// Sleep for `duration` unless cancelled first; returns true if cancelled
    pub fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.is_cancelled();
        }
        self.wait_timeout(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_times_out_without_cancel() {
        let signal = ShutdownSignal::new();
        let start = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_wakes_sleeper() {
        let signal = ShutdownSignal::new();
        let sleeper = signal.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let cancelled = sleeper.sleep(Duration::from_secs(30));
            (cancelled, start.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        signal.cancel();

        let (cancelled, waited) = handle.join().unwrap();
        assert!(cancelled);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn test_cancelled_signal_returns_immediately() {
        let signal = ShutdownSignal::new();
        signal.cancel();
        assert!(signal.sleep(Duration::from_secs(30)));
        assert!(signal.sleep(Duration::ZERO));
    }
}
