//! MMC/SD bus layer
//!
//! [`bus::MmcBus`] enumerates cards over any host implementing [`MmcHost`]
//! and publishes one device node per card; [`disk::MmcDisk`] attaches to
//! those nodes and serves block I/O.

pub mod bus;
pub mod cid;
pub mod command;
pub mod csd;
pub mod disk;
pub mod dma;

use alloc::sync::Arc;

use crate::error::{Error, Result};
use crate::sync::ScanSignal;
use dma::IoOperation;

/// Command response as captured by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Command without reply
    None,
    /// 32 bits of a 48-bit reply (R1, R1b, R3, R6, R7)
    Short(u32),
    /// 128 bits of a 136-bit reply (R2), response register order
    Long([u32; 4]),
}

impl Response {
    /// The 32-bit reply; `BadData` for other shapes
    pub fn short(&self) -> Result<u32> {
        match self {
            Response::Short(v) => Ok(*v),
            _ => Err(Error::BadData),
        }
    }

    /// The 128-bit reply; `BadData` for other shapes
    pub fn long(&self) -> Result<[u32; 4]> {
        match self {
            Response::Long(v) => Ok(*v),
            _ => Err(Error::BadData),
        }
    }
}

/// Data bus width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusWidth {
    One,
    Four,
    Eight,
}

impl TryFrom<u8> for BusWidth {
    type Error = Error;

    fn try_from(bits: u8) -> Result<Self> {
        match bits {
            1 => Ok(BusWidth::One),
            4 => Ok(BusWidth::Four),
            8 => Ok(BusWidth::Eight),
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// Card family, published as the `mmc/type` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CardType {
    Mmc = 0,
    Sd = 1,
    Sdhc = 2,
    Uhs1 = 3,
    Uhs2 = 4,
    Sdio = 5,
}

impl CardType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CardType::Mmc),
            1 => Some(CardType::Sd),
            2 => Some(CardType::Sdhc),
            3 => Some(CardType::Uhs1),
            4 => Some(CardType::Uhs2),
            5 => Some(CardType::Sdio),
            _ => None,
        }
    }

    /// Block-addressed cards take sector numbers instead of byte offsets
    pub fn uses_sector_addressing(self) -> bool {
        matches!(self, CardType::Sdhc | CardType::Uhs1 | CardType::Uhs2)
    }

    pub fn name(self) -> &'static str {
        match self {
            CardType::Mmc => "MMC",
            CardType::Sd => "SD",
            CardType::Sdhc => "SDHC",
            CardType::Uhs1 => "UHS-I",
            CardType::Uhs2 => "UHS-II",
            CardType::Sdio => "SDIO",
        }
    }
}

/// Host controller interface used by the bus manager
///
/// Implementations accept one command at a time; callers serialize through
/// [`bus::MmcBus::acquire_bus`].
pub trait MmcHost: Send + Sync {
    /// Issue `opcode` with `argument` and return its reply
    fn execute_command(&self, opcode: u8, argument: u32) -> Result<Response>;

    /// Run a block data command over the scatter-gather list of `operation`
    ///
    /// `offset_as_sectors` selects sector (block-addressed cards) instead of
    /// byte addressing for the command argument.
    fn do_io(&self, opcode: u8, operation: &IoOperation<'_>, offset_as_sectors: bool)
    -> Result<()>;

    /// Program the SD clock; returns the frequency actually set, in kHz
    fn set_clock(&self, kilohertz: u32) -> Result<u32>;

    fn set_bus_width(&self, width: BusWidth) -> Result<()>;

    /// Hand over the signal raised when a card is inserted
    fn set_scan_signal(&self, signal: Arc<ScanSignal>);
}
