//! DMA restrictions, scatter-gather operations and the I/O scheduler
//!
//! The disk driver never hands caller memory to the controller. Requests
//! are split by an [`IoScheduler`] into operations that fit the
//! controller's [`DmaRestrictions`], and each operation moves through a
//! [`DmaResource`] bounce buffer allocated from the platform.

use alloc::sync::Arc;

use crate::drivers::block::SECTOR_SIZE;
use crate::error::{Error, Result};
use crate::platform::{DmaBuffer, Platform};

/// Controller DMA limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRestrictions {
    /// Address mask that must be clear (511 = 512-byte aligned)
    pub alignment: u64,
    /// Buffers must end below this address
    pub high_address: u64,
    /// Transfers may not cross a multiple of this size
    pub boundary: u64,
    pub max_segment_count: usize,
    pub max_segment_blocks: usize,
}

impl DmaRestrictions {
    /// SDMA: one 32-bit segment of at most 1023 blocks, never crossing a
    /// 512 KiB boundary
    pub const SDHCI: DmaRestrictions = DmaRestrictions {
        alignment: 511,
        high_address: 0x1_0000_0000,
        boundary: 512 * 1024,
        max_segment_count: 1,
        max_segment_blocks: 1023,
    };

    /// Largest single operation in bytes
    pub fn max_transfer(&self) -> usize {
        self.max_segment_count * self.max_segment_blocks * SECTOR_SIZE
    }

    /// Check one scatter-gather element against the restrictions
    pub fn check(&self, vec: &PhysVec) -> Result<()> {
        if vec.phys & self.alignment != 0 || vec.len % SECTOR_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }
        if vec.phys + vec.len as u64 > self.high_address {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

/// One contiguous piece of physical memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysVec {
    pub phys: u64,
    pub len: usize,
}

/// A scatter-gather list tagged with its device byte offset
#[derive(Debug, Clone, Copy)]
pub struct IoOperation<'a> {
    pub offset: u64,
    pub vecs: &'a [PhysVec],
}

impl IoOperation<'_> {
    pub fn length(&self) -> usize {
        self.vecs.iter().map(|v| v.len).sum()
    }
}

/// Bounce buffer satisfying the controller's restrictions
pub struct DmaResource {
    platform: Arc<dyn Platform>,
    buffer: Option<DmaBuffer>,
    restrictions: DmaRestrictions,
}

impl DmaResource {
    pub fn new(
        platform: Arc<dyn Platform>,
        restrictions: DmaRestrictions,
        size: usize,
    ) -> Result<Self> {
        // Whole blocks, no larger than one operation
        let size = (size.min(restrictions.max_transfer()) / SECTOR_SIZE) * SECTOR_SIZE;
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let buffer = platform.alloc_dma(size, restrictions.high_address)?;
        if buffer.phys() & restrictions.alignment != 0 {
            platform.free_dma(buffer);
            return Err(Error::NoMemory);
        }
        Ok(Self {
            platform,
            buffer: Some(buffer),
            restrictions,
        })
    }

    pub fn restrictions(&self) -> &DmaRestrictions {
        &self.restrictions
    }

    /// Bytes one operation can move
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.len())
    }

    pub fn phys(&self) -> u64 {
        self.buffer.as_ref().map_or(0, |b| b.phys())
    }

    pub fn bytes(&self, len: usize) -> &[u8] {
        match &self.buffer {
            Some(b) => &b.as_slice()[..len],
            None => &[],
        }
    }

    pub fn bytes_mut(&mut self, len: usize) -> &mut [u8] {
        match &mut self.buffer {
            Some(b) => &mut b.as_mut_slice()[..len],
            None => &mut [],
        }
    }
}

impl Drop for DmaResource {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.platform.free_dma(buffer);
        }
    }
}

/// A block request as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
    pub offset: u64,
    pub length: usize,
}

/// Outcome of a scheduled request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCompletion {
    /// Bytes moved before the first failure
    pub transferred: usize,
    pub status: Result<()>,
}

impl IoCompletion {
    pub fn into_result(self) -> Result<usize> {
        self.status.map(|()| self.transferred)
    }
}

/// Splits requests into operations and runs them
pub trait IoScheduler: Send + Sync {
    /// Execute `request` in operations of at most `max_operation` bytes.
    ///
    /// `execute(offset, length, request_position)` runs one operation;
    /// the first error stops the request.
    fn schedule(
        &self,
        request: &IoRequest,
        max_operation: usize,
        execute: &mut dyn FnMut(u64, usize, usize) -> Result<()>,
    ) -> IoCompletion;
}

/// In-order scheduler: one operation at a time, front to back
#[derive(Debug, Default)]
pub struct FifoScheduler;

impl IoScheduler for FifoScheduler {
    fn schedule(
        &self,
        request: &IoRequest,
        max_operation: usize,
        execute: &mut dyn FnMut(u64, usize, usize) -> Result<()>,
    ) -> IoCompletion {
        let step = (max_operation / SECTOR_SIZE) * SECTOR_SIZE;
        if step == 0 {
            return IoCompletion {
                transferred: 0,
                status: Err(Error::InvalidArgument),
            };
        }

        let mut done = 0;
        while done < request.length {
            let len = step.min(request.length - done);
            if let Err(e) = execute(request.offset + done as u64, len, done) {
                return IoCompletion {
                    transferred: done,
                    status: Err(e),
                };
            }
            done += len;
        }
        IoCompletion {
            transferred: done,
            status: Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test_support::StdPlatform;
    use std::vec::Vec;

    #[test]
    fn test_restrictions_check() {
        let r = DmaRestrictions::SDHCI;
        assert_eq!(r.max_transfer(), 1023 * 512);
        assert!(r.check(&PhysVec { phys: 0x20_0000, len: 1024 }).is_ok());
        assert_eq!(
            r.check(&PhysVec { phys: 0x20_0100, len: 512 }),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            r.check(&PhysVec { phys: 0x20_0000, len: 100 }),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            r.check(&PhysVec { phys: 0xFFFF_FE00, len: 1024 }),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_fifo_scheduler_splits_in_order() {
        let mut ops = Vec::new();
        let completion = FifoScheduler.schedule(
            &IoRequest { offset: 4096, length: 5 * 512 },
            2 * 512,
            &mut |offset, len, pos| {
                ops.push((offset, len, pos));
                Ok(())
            },
        );
        assert_eq!(completion.into_result(), Ok(5 * 512));
        assert_eq!(
            ops,
            [(4096, 1024, 0), (5120, 1024, 1024), (6144, 512, 2048)]
        );
    }

    #[test]
    fn test_fifo_scheduler_stops_on_error() {
        let mut calls = 0;
        let completion = FifoScheduler.schedule(
            &IoRequest { offset: 0, length: 4 * 512 },
            512,
            &mut |_, _, pos| {
                calls += 1;
                if pos == 1024 { Err(Error::BadValue) } else { Ok(()) }
            },
        );
        assert_eq!(calls, 3);
        assert_eq!(completion.transferred, 1024);
        assert_eq!(completion.status, Err(Error::BadValue));
    }

    #[test]
    fn test_dma_resource_frees_on_drop() {
        let platform = StdPlatform::new();
        {
            let res = DmaResource::new(platform.clone(), DmaRestrictions::SDHCI, 64 * 1024)
                .unwrap();
            assert_eq!(res.capacity(), 64 * 1024);
            assert_eq!(res.phys() & 511, 0);
            assert_eq!(platform.live_allocations(), 1);
        }
        assert_eq!(platform.live_allocations(), 0);
    }
}
