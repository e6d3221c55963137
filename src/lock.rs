//! Simple Spin Lock
//!
//! The basic mutual-exclusion word used by local gates and by the loopback
//! broker's process locks. Unlike a plain spin lock, every blocking acquire
//! takes a [`Deadline`] so a crashed holder cannot starve a waiter forever.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::platform::{Deadline, Platform};

/// How a waiter passes time while the lock is held elsewhere
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Spin with a CPU hint (interrupts are usually masked)
    Spin,
    /// Yield to the scheduler between attempts
    Yield,
}

/// A simple spin lock
#[repr(C)]
pub struct SimpleLock {
    lock_data: AtomicBool,
}

impl core::fmt::Debug for SimpleLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimpleLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl SimpleLock {
    /// Create a new unlocked simple lock
    pub const fn new() -> Self {
        Self {
            lock_data: AtomicBool::new(false),
        }
    }

    /// Acquire the lock, waiting until it is free or `deadline` passes
    ///
    /// Returns `false` on timeout, in which case the lock is not held.
    pub fn lock_until(
        &self,
        platform: &dyn Platform,
        policy: WaitPolicy,
        deadline: &Deadline,
    ) -> bool {
        loop {
            if self.try_lock() {
                return true;
            }
            while self.lock_data.load(Ordering::Relaxed) {
                if deadline.expired(platform) {
                    return false;
                }
                match policy {
                    WaitPolicy::Spin => platform.relax(),
                    WaitPolicy::Yield => platform.yield_now(),
                }
            }
        }
    }

    /// Release the lock
    pub fn unlock(&self) {
        self.lock_data.store(false, Ordering::Release);
    }

    /// Try to acquire the lock without blocking
    pub fn try_lock(&self) -> bool {
        self.lock_data
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Check if the lock is held
    pub fn is_locked(&self) -> bool {
        self.lock_data.load(Ordering::Relaxed)
    }
}

impl Default for SimpleLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{HostPlatform, Timeout};
    use core::time::Duration;

    #[test]
    fn test_simple_lock_try() {
        let lock = SimpleLock::new();

        assert!(lock.try_lock());
        assert!(!lock.try_lock());

        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn test_lock_until_times_out_while_held() {
        let platform = HostPlatform::new();
        let lock = SimpleLock::new();
        assert!(lock.try_lock());

        let deadline = Deadline::start(&platform, Timeout::After(Duration::from_millis(5)));
        assert!(!lock.lock_until(&platform, WaitPolicy::Yield, &deadline));
        assert!(lock.is_locked());

        lock.unlock();
        let deadline = Deadline::start(&platform, Timeout::Forever);
        assert!(lock.lock_until(&platform, WaitPolicy::Spin, &deadline));
        lock.unlock();
    }
}
