// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Writer throttling (spec §4.3 "Throttling", §5 "Suspension points").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// `write` blocks inside here when `unacked_bytes > whc_high` and the
/// writer is not an implicit built-in (spec §4.3 "Throttling"). Deletion
/// broadcasts [`WriterThrottle::interrupt`] and discards in-progress
/// throttles, matching the writer state machine's `INTERRUPT` transition
/// (spec §4.2 "State machines").
pub struct WriterThrottle {
    lock: Mutex<()>,
    condvar: Condvar,
    interrupted: AtomicBool,
    blocked: AtomicBool,
}

impl WriterThrottle {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            condvar: Condvar::new(),
            interrupted: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    /// Block until `unblocked` reports the writer may proceed, an
    /// interrupt is signaled, or `max_blocking_time` elapses. The caller
    /// is expected to have already forced out a heartbeat before calling
    /// this (spec §4.3: "forces out a heartbeat to hasten acks").
    pub fn wait_while_throttled(&self, max_blocking_time: Duration, mut still_over_highwater: impl FnMut() -> bool) -> Result<()> {
        let deadline = Instant::now() + max_blocking_time;
        self.blocked.store(true, Ordering::Release);
        let result = (|| {
            let mut guard = self.lock();
            while still_over_highwater() {
                if self.interrupted.swap(false, Ordering::AcqRel) {
                    return Ok(());
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout);
                }
                let (next_guard, timeout) = self
                    .condvar
                    .wait_timeout(guard, deadline - now)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                guard = next_guard;
                if timeout.timed_out() && still_over_highwater() && !self.interrupted.load(Ordering::Acquire) {
                    return Err(Error::Timeout);
                }
            }
            Ok(())
        })();
        self.blocked.store(false, Ordering::Release);
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.lock.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                log::debug!("writer throttle mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Unblock any waiter because acks arrived and `unacked_bytes` has
    /// dropped back under the low-water mark.
    pub fn notify_acked(&self) {
        let _guard = self.lock();
        self.condvar.notify_all();
    }

    /// Writer deletion unblocks throttled writes via `INTERRUPT` (spec
    /// §4.2 "State machines", §5 "Cancellation and timeouts").
    pub fn interrupt(&self) {
        let _guard = self.lock();
        self.interrupted.store(true, Ordering::Release);
        self.condvar.notify_all();
    }
}

impl Default for WriterThrottle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_immediately_when_not_over_highwater() {
        let throttle = WriterThrottle::new();
        let result = throttle.wait_while_throttled(Duration::from_millis(50), || false);
        assert!(result.is_ok());
        assert!(!throttle.is_blocked());
    }

    #[test]
    fn wait_times_out_when_never_unblocked() {
        let throttle = WriterThrottle::new();
        let result = throttle.wait_while_throttled(Duration::from_millis(20), || true);
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[test]
    fn interrupt_unblocks_a_waiting_writer() {
        let throttle = Arc::new(WriterThrottle::new());
        let t2 = Arc::clone(&throttle);
        let handle = thread::spawn(move || t2.wait_while_throttled(Duration::from_secs(5), || true));
        while !throttle.is_blocked() {
            thread::yield_now();
        }
        throttle.interrupt();
        let result = handle.join().unwrap();
        assert!(result.is_ok());
    }
}
