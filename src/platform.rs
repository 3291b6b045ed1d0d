//! Kernel services consumed by the drivers
//!
//! The drivers never call into a kernel directly. Everything they need
//! (time, threads, IRQ registration, DMA-able memory) comes through the
//! [`Platform`] trait, handed to constructors as an `Arc<dyn Platform>`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ptr::NonNull;

use crate::error::Result;

/// Outcome of an interrupt handler invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqResult {
    /// The interrupt was raised by this device
    Handled,
    /// Not ours (shared line, or the device is gone)
    Unhandled,
}

/// Handler attached to an IRQ line
///
/// Runs in interrupt context: must not block, sleep or allocate.
pub trait InterruptHandler: Send + Sync {
    fn handle_interrupt(&self) -> IrqResult;
}

/// Joinable handle to a spawned kernel thread
pub trait ThreadHandle: Send + Sync {
    /// Block until the thread function has returned
    fn join(self: Box<Self>);
}

/// Physically contiguous memory usable for DMA
pub struct DmaBuffer {
    virt: NonNull<u8>,
    phys: u64,
    len: usize,
}

// SAFETY: the buffer is exclusively owned memory; the raw pointer is only
// dereferenced through `&self`/`&mut self` borrows.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Wrap an allocation made by a [`Platform`]
    ///
    /// # Safety
    ///
    /// `virt` must point to `len` writable bytes that stay mapped until the
    /// buffer is handed back to [`Platform::free_dma`], and `phys` must be
    /// the bus address of the same memory.
    pub unsafe fn from_raw(virt: NonNull<u8>, phys: u64, len: usize) -> Self {
        Self { virt, phys, len }
    }

    /// Bus address of the first byte
    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: see `from_raw`
        unsafe { core::slice::from_raw_parts(self.virt.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `from_raw`
        unsafe { core::slice::from_raw_parts_mut(self.virt.as_ptr(), self.len) }
    }
}

/// Kernel services
pub trait Platform: Send + Sync {
    /// Monotonic clock in microseconds
    fn now_us(&self) -> u64;

    /// Put the calling thread to sleep
    fn sleep_us(&self, us: u64);

    /// Give up the CPU briefly inside a wait loop
    fn relax(&self) {
        core::hint::spin_loop();
    }

    /// Start a kernel thread running `entry`
    fn spawn(
        &self,
        name: &'static str,
        entry: Box<dyn FnOnce() + Send + 'static>,
    ) -> Result<Box<dyn ThreadHandle>>;

    /// Attach `handler` to interrupt line `irq`
    fn install_interrupt_handler(&self, irq: u32, handler: Arc<dyn InterruptHandler>)
    -> Result<()>;

    /// Detach the handler from `irq`; returns once no invocation is running
    fn remove_interrupt_handler(&self, irq: u32);

    /// Allocate `len` bytes of contiguous DMA memory below `max_address`
    fn alloc_dma(&self, len: usize, max_address: u64) -> Result<DmaBuffer>;

    fn free_dma(&self, buffer: DmaBuffer);
}

/// A deadline on the platform clock
///
/// ```ignore
/// let timeout = Timeout::from_us(platform, 20_000);
/// while !timeout.is_expired() {
///     if ready() {
///         return Ok(());
///     }
///     platform.relax();
/// }
/// return Err(Error::TimedOut);
/// ```
#[derive(Clone, Copy)]
pub struct Timeout<'a> {
    platform: &'a dyn Platform,
    deadline: u64,
}

impl<'a> Timeout<'a> {
    /// Create a timeout that expires after `us` microseconds
    pub fn from_us(platform: &'a dyn Platform, us: u64) -> Self {
        Self {
            platform,
            deadline: platform.now_us().saturating_add(us),
        }
    }

    /// Create a timeout that expires after `ms` milliseconds
    pub fn from_ms(platform: &'a dyn Platform, ms: u64) -> Self {
        Self::from_us(platform, ms.saturating_mul(1000))
    }

    /// Check if the timeout has expired
    pub fn is_expired(&self) -> bool {
        self.platform.now_us() >= self.deadline
    }

    /// Microseconds left before the deadline
    pub fn remaining_us(&self) -> u64 {
        self.deadline.saturating_sub(self.platform.now_us())
    }
}

/// Spin until `condition()` holds or `timeout_us` elapses
///
/// Returns `true` if the condition was met.
pub fn wait_for<F>(platform: &dyn Platform, timeout_us: u64, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let timeout = Timeout::from_us(platform, timeout_us);
    loop {
        if condition() {
            return true;
        }
        if timeout.is_expired() {
            // One last look; the condition may have turned true while the
            // deadline passed
            return condition();
        }
        platform.relax();
    }
}
