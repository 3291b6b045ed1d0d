//! Synchronization primitives shared between interrupt and thread context
//!
//! Both primitives are plain atomics: releasing never blocks, so they can be
//! signalled from an interrupt handler. Waiting goes through the platform
//! (`relax`/`sleep_us`) and always has a bound.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::platform::{Platform, Timeout};

/// Relax rounds before a waiter starts sleeping
pub const SPIN_BUDGET: u32 = 64;

/// Sleep step of a waiter past its spin budget
pub const WAIT_SLEEP_US: u64 = 50;

/// Counting semaphore
pub struct Semaphore {
    count: AtomicU32,
}

impl Semaphore {
    pub const fn new(initial: u32) -> Self {
        Self {
            count: AtomicU32::new(initial),
        }
    }

    /// Add one permit. Interrupt safe.
    pub fn release(&self) {
        self.count.fetch_add(1, Ordering::Release);
    }

    /// Take a permit if one is available
    pub fn try_acquire(&self) -> bool {
        let mut current = self.count.load(Ordering::Relaxed);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Take a permit, waiting at most `timeout_us`
    ///
    /// Spins for [`SPIN_BUDGET`] rounds, then sleeps in steps of
    /// [`WAIT_SLEEP_US`] until the deadline.
    pub fn acquire(&self, platform: &dyn Platform, timeout_us: u64) -> Result<()> {
        let timeout = Timeout::from_us(platform, timeout_us);
        let mut spins = 0;
        loop {
            if self.try_acquire() {
                return Ok(());
            }
            if timeout.is_expired() {
                return Err(Error::Timeout);
            }
            if spins < SPIN_BUDGET {
                spins += 1;
                platform.relax();
            } else {
                platform.sleep_us(WAIT_SLEEP_US.min(timeout.remaining_us()).max(1));
            }
        }
    }

    /// Permits currently available
    pub fn available(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Coalescing "please rescan" flag
///
/// Any number of `signal()` calls between two waits wake the waiter once.
pub struct ScanSignal {
    pending: AtomicBool,
}

impl ScanSignal {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
        }
    }

    /// Request a scan. Interrupt safe.
    pub fn signal(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Consume a pending request
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Sleep until a request is pending, checking every `poll_us`
    pub fn wait(&self, platform: &dyn Platform, poll_us: u64) {
        while !self.take() {
            platform.sleep_us(poll_us);
        }
    }
}

impl Default for ScanSignal {
    fn default() -> Self {
        Self::new()
    }
}
