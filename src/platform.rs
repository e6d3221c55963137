//! Platform services consumed by the coordination layer
//!
//! Every core this layer runs on must provide a clock, a way to mask local
//! interrupts, and explicit cache maintenance for shared memory. Shared
//! regions are not assumed to be cache coherent: a writer pushes its lines
//! out with [`Platform::cache_writeback`] before a peer may look, and a
//! reader drops stale lines with [`Platform::cache_invalidate`] first.

use core::time::Duration;

/// Common platform hooks that every core port must implement
pub trait Platform: Send + Sync {
    /// Monotonic time since an arbitrary, fixed origin
    fn now(&self) -> Duration;

    /// Busy-wait hint used inside spin loops
    fn relax(&self) {
        core::hint::spin_loop();
    }

    /// Give up the CPU to another runnable task
    fn yield_now(&self) {
        self.relax();
    }

    /// Mask local interrupts, returning the previous state
    fn disable_interrupts(&self) -> usize;

    /// Restore the interrupt state returned by `disable_interrupts`
    fn restore_interrupts(&self, key: usize);

    /// Write back dirty cache lines covering `[addr, addr + len)`
    fn cache_writeback(&self, addr: usize, len: usize);

    /// Invalidate cache lines covering `[addr, addr + len)`
    fn cache_invalidate(&self, addr: usize, len: usize);
}

// ============================================================================
// Timeouts
// ============================================================================

/// How long a blocking operation may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Wait until the operation completes
    #[default]
    Forever,
    /// Give up after the given duration
    After(Duration),
}

impl Timeout {
    /// Do not wait at all
    pub const NONE: Self = Timeout::After(Duration::ZERO);

    pub const fn from_millis(ms: u64) -> Self {
        Timeout::After(Duration::from_millis(ms))
    }
}

/// A point in platform time after which a wait gives up
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Duration>,
}

impl Deadline {
    /// Start a deadline from `timeout`, measured on `platform`'s clock
    pub fn start(platform: &dyn Platform, timeout: Timeout) -> Self {
        let at = match timeout {
            Timeout::Forever => None,
            Timeout::After(d) => Some(platform.now().saturating_add(d)),
        };
        Self { at }
    }

    /// Check whether the deadline has passed
    pub fn expired(&self, platform: &dyn Platform) -> bool {
        match self.at {
            None => false,
            Some(at) => platform.now() >= at,
        }
    }
}

// ============================================================================
// Host Platform
// ============================================================================

#[cfg(any(test, feature = "std"))]
pub use host::HostPlatform;

#[cfg(any(test, feature = "std"))]
mod host {
    use super::Platform;
    use core::cell::Cell;
    use core::sync::atomic::{fence, Ordering};
    use core::time::Duration;
    use std::time::Instant;

    std::thread_local! {
        static IRQ_MASKED: Cell<bool> = const { Cell::new(false) };
    }

    /// Platform for hosted builds and tests
    ///
    /// Interrupt masking is emulated per thread. Host memory is coherent,
    /// so cache maintenance reduces to full fences.
    #[derive(Debug)]
    pub struct HostPlatform {
        origin: Instant,
    }

    impl HostPlatform {
        pub fn new() -> Self {
            Self {
                origin: Instant::now(),
            }
        }

        /// Whether the calling thread currently has interrupts masked
        pub fn interrupts_masked(&self) -> bool {
            IRQ_MASKED.with(|m| m.get())
        }
    }

    impl Default for HostPlatform {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Platform for HostPlatform {
        fn now(&self) -> Duration {
            self.origin.elapsed()
        }

        fn yield_now(&self) {
            std::thread::yield_now();
        }

        fn disable_interrupts(&self) -> usize {
            IRQ_MASKED.with(|m| m.replace(true)) as usize
        }

        fn restore_interrupts(&self, key: usize) {
            IRQ_MASKED.with(|m| m.set(key != 0));
        }

        fn cache_writeback(&self, _addr: usize, _len: usize) {
            fence(Ordering::SeqCst);
        }

        fn cache_invalidate(&self, _addr: usize, _len: usize) {
            fence(Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_forever_never_expires() {
        let platform = HostPlatform::new();
        let deadline = Deadline::start(&platform, Timeout::Forever);
        assert!(!deadline.expired(&platform));
    }

    #[test]
    fn test_deadline_zero_expires_immediately() {
        let platform = HostPlatform::new();
        let deadline = Deadline::start(&platform, Timeout::NONE);
        assert!(deadline.expired(&platform));
    }

    #[test]
    fn test_interrupt_mask_nests() {
        let platform = HostPlatform::new();
        assert!(!platform.interrupts_masked());

        let outer = platform.disable_interrupts();
        let inner = platform.disable_interrupts();
        assert!(platform.interrupts_masked());

        platform.restore_interrupts(inner);
        assert!(platform.interrupts_masked());
        platform.restore_interrupts(outer);
        assert!(!platform.interrupts_masked());
    }
}
