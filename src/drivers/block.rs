//! Block device abstraction
//!
//! The storage front ends (currently only the MMC disk) implement
//! [`BlockDevice`]; upper layers see [`BlockError`] instead of the
//! driver-level [`Error`].

use crate::error::Error;

/// Standard sector size (512 bytes)
pub const SECTOR_SIZE: usize = 512;

/// Information about a block device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockDeviceInfo {
    /// Total number of blocks on the device
    pub num_blocks: u64,
    /// Size of each block in bytes
    pub block_size: u32,
    pub removable: bool,
    pub read_only: bool,
}

/// Unified error type for block operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// Generic device error
    DeviceError,
    /// Invalid parameter (bad LBA, buffer too small, etc.)
    InvalidParameter,
    /// LBA out of range
    OutOfRange,
    /// No media present (for removable devices)
    NoMedia,
}

impl From<Error> for BlockError {
    fn from(e: Error) -> Self {
        match e {
            Error::NoCard | Error::ShuttingDown => BlockError::NoMedia,
            Error::InvalidArgument => BlockError::InvalidParameter,
            _ => BlockError::DeviceError,
        }
    }
}

/// Trait for block-level storage devices
pub trait BlockDevice {
    fn info(&self) -> Result<BlockDeviceInfo, BlockError>;

    /// Read `count` blocks starting at `lba` into `buffer`
    fn read_blocks(&self, lba: u64, count: u32, buffer: &mut [u8]) -> Result<(), BlockError>;

    /// Write `count` blocks starting at `lba` from `buffer`
    fn write_blocks(&self, lba: u64, count: u32, buffer: &[u8]) -> Result<(), BlockError>;

    /// Read a single block (convenience method)
    fn read_block(&self, lba: u64, buffer: &mut [u8]) -> Result<(), BlockError> {
        self.read_blocks(lba, 1, buffer)
    }
}
