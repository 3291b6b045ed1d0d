//! Memory-Mapped I/O (MMIO) register access
//!
//! Controller drivers do not touch raw pointers. They go through
//! [`RegisterIo`], which the kernel glue implements with [`MmioRegion`] over
//! the mapped BAR and unit tests implement with a simulated device.
//!
//! # Example
//!
//! ```rust,ignore
//! use crabmmc::drivers::mmio::{MmioRegion, RegisterIo};
//!
//! let mmio = unsafe { MmioRegion::new(0xFED0_0000, 0x100) }.ok_or(Error::BadData)?;
//! let version = mmio.read16(0xFE);
//! mmio.write32(0x30, 0xFFFF_FFFF);
//! ```

use core::ptr::NonNull;
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::{ReadOnly, WriteOnly};

/// Width-specific volatile register access at byte offsets
///
/// Every call is one bus access, performed in program order.
pub trait RegisterIo: Send + Sync {
    fn read8(&self, offset: usize) -> u8;
    fn read16(&self, offset: usize) -> u16;
    fn read32(&self, offset: usize) -> u32;
    fn write8(&self, offset: usize, value: u8);
    fn write16(&self, offset: usize, value: u16);
    fn write32(&self, offset: usize, value: u32);
}

impl<T: RegisterIo + ?Sized> RegisterIo for alloc::sync::Arc<T> {
    fn read8(&self, offset: usize) -> u8 {
        (**self).read8(offset)
    }
    fn read16(&self, offset: usize) -> u16 {
        (**self).read16(offset)
    }
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }
    fn write8(&self, offset: usize, value: u8) {
        (**self).write8(offset, value)
    }
    fn write16(&self, offset: usize, value: u16) {
        (**self).write16(offset, value)
    }
    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }
}

/// A mapped register window
///
/// In debug builds every access is bounds checked against the window size.
pub struct MmioRegion {
    base: NonNull<u8>,
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    size: usize,
}

// SAFETY: MmioRegion only contains a pointer to device register space that
// stays mapped for the lifetime of the region; accesses are volatile.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Wrap a mapped register window; `None` for a null base
    ///
    /// # Safety
    ///
    /// `[base, base + size)` must be mapped device memory that stays valid
    /// for the lifetime of the returned region.
    pub unsafe fn new(base: u64, size: usize) -> Option<Self> {
        NonNull::new(base as *mut u8).map(|base| Self { base, size })
    }

    pub fn base(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    #[cfg(debug_assertions)]
    #[inline]
    fn check_bounds(&self, offset: usize, access_size: usize) {
        let end = offset.saturating_add(access_size);
        assert!(
            end <= self.size,
            "MMIO access out of bounds: offset={:#x}, access_size={}, region_size={:#x}",
            offset,
            access_size,
            self.size
        );
    }

    #[inline]
    fn reg<T>(&self, offset: usize) -> *const T {
        #[cfg(debug_assertions)]
        self.check_bounds(offset, core::mem::size_of::<T>());
        // SAFETY: in bounds of the mapped window (checked in debug builds)
        unsafe { self.base.as_ptr().add(offset) as *const T }
    }
}

impl RegisterIo for MmioRegion {
    #[inline]
    fn read8(&self, offset: usize) -> u8 {
        unsafe { &*self.reg::<ReadOnly<u8>>(offset) }.get()
    }

    #[inline]
    fn read16(&self, offset: usize) -> u16 {
        unsafe { &*self.reg::<ReadOnly<u16>>(offset) }.get()
    }

    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        unsafe { &*self.reg::<ReadOnly<u32>>(offset) }.get()
    }

    #[inline]
    fn write8(&self, offset: usize, value: u8) {
        unsafe { &*self.reg::<WriteOnly<u8>>(offset) }.set(value)
    }

    #[inline]
    fn write16(&self, offset: usize, value: u16) {
        unsafe { &*self.reg::<WriteOnly<u16>>(offset) }.set(value)
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        unsafe { &*self.reg::<WriteOnly<u32>>(offset) }.set(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mmio_region_over_memory() {
        let mut backing = [0u32; 64];
        let region = unsafe { MmioRegion::new(backing.as_mut_ptr() as u64, 256) }.unwrap();

        region.write32(0x30, 0xDEAD_BEEF);
        assert_eq!(region.read32(0x30), 0xDEAD_BEEF);
        assert_eq!(region.read16(0x30), 0xBEEF);
        region.write8(0x29, 0x0F);
        assert_eq!(region.read8(0x29), 0x0F);
    }

    #[test]
    fn test_null_base_rejected() {
        assert!(unsafe { MmioRegion::new(0, 0x100) }.is_none());
    }
}
