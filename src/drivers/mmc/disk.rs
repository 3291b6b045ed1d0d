//! SD memory card block driver
//!
//! Attaches to card nodes published by [`MmcBus`] and serves reads, writes
//! and trims through a DMA bounce buffer. Requests are split by the I/O
//! scheduler into operations the host controller can move in one go.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt::Write;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use super::bus::MmcBus;
use super::command::*;
use super::csd::{Csd, DeviceGeometry};
use super::dma::{
    DmaResource, DmaRestrictions, FifoScheduler, IoCompletion, IoOperation, IoRequest,
    IoScheduler, PhysVec,
};
use super::{BusWidth, CardType};
use crate::config::DiskConfig;
use crate::device::{
    DeviceManager, DriverModule, DriverState, Lifecycle, NodeAttributes, NodeId, attr,
};
use crate::drivers::block::{BlockDevice, BlockDeviceInfo, BlockError, SECTOR_SIZE};
use crate::error::{Error, Result};
use crate::platform::Platform;

/// Byte range to discard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimRange {
    pub offset: u64,
    pub size: u64,
}

/// Control requests understood by the disk
#[derive(Debug, Clone, Copy)]
pub enum IoctlRequest<'a> {
    GetGeometry,
    GetDeviceSize,
    Trim(&'a [TrimRange]),
    /// Anything else (icons, media status, ...)
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlReply {
    Geometry(DeviceGeometry),
    DeviceSize(u64),
    /// Bytes discarded
    Trimmed(u64),
}

/// Driver module for SD memory cards
pub struct MmcDiskModule {
    devices: Arc<dyn DeviceManager>,
    platform: Arc<dyn Platform>,
    config: DiskConfig,
    next_id: AtomicU32,
}

impl MmcDiskModule {
    pub fn new(
        devices: Arc<dyn DeviceManager>,
        platform: Arc<dyn Platform>,
        config: DiskConfig,
    ) -> Self {
        Self {
            devices,
            platform,
            config,
            next_id: AtomicU32::new(0),
        }
    }
}

impl DriverModule for MmcDiskModule {
    type Parent = Arc<MmcBus>;
    type Cookie = MmcDisk;

    fn supports_device(&self, attributes: &NodeAttributes) -> f32 {
        if attributes.get_str(attr::BUS) != Some(attr::BUS_MMC) {
            return 0.0;
        }
        match attributes.get_u8(attr::MMC_TYPE).and_then(CardType::from_u8) {
            Some(CardType::Sdio) | None => 0.0,
            Some(_) => 0.8,
        }
    }

    fn init_driver(&self, node: NodeId, parent: Arc<MmcBus>) -> Result<MmcDisk> {
        let attributes = self.devices.attributes(node).ok_or(Error::BadData)?;
        let rca = attributes.get_u16(attr::MMC_RCA).ok_or_else(|| {
            log::error!("mmc_disk: Node {} has no {} attribute", node, attr::MMC_RCA);
            Error::BadData
        })?;
        let card_type = attributes
            .get_u8(attr::MMC_TYPE)
            .and_then(CardType::from_u8)
            .ok_or(Error::BadData)?;

        let dma = DmaResource::new(
            self.platform.clone(),
            DmaRestrictions::SDHCI,
            self.config.bounce_buffer_size,
        )?;

        let disk = MmcDisk {
            node,
            rca,
            card_type,
            bus: parent,
            config: self.config,
            dma: Mutex::new(dma),
            scheduler: Box::new(FifoScheduler),
            geometry: Mutex::new(None),
            wide_bus: AtomicBool::new(false),
            lifecycle: Lifecycle::new(),
        };
        disk.lifecycle.advance(DriverState::Initialized)?;
        log::debug!(
            "mmc_disk: {} card at RCA {:#06x} ({} addressing)",
            card_type.name(),
            rca,
            if card_type.uses_sector_addressing() { "sector" } else { "byte" }
        );
        Ok(disk)
    }

    fn register_child_devices(&self, disk: &MmcDisk) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let mut path: heapless::String<32> = heapless::String::new();
        write!(path, "disk/mmc/{}/raw", id).map_err(|_| Error::NoMemory)?;
        self.devices.publish_device(disk.node, &path)?;
        disk.lifecycle.advance(DriverState::ChildrenRegistered)
    }

    fn uninit_driver(&self, disk: MmcDisk) {
        drop(disk);
    }
}

/// One SD memory card
pub struct MmcDisk {
    node: NodeId,
    rca: u16,
    card_type: CardType,
    bus: Arc<MmcBus>,
    config: DiskConfig,
    dma: Mutex<DmaResource>,
    scheduler: Box<dyn IoScheduler>,
    geometry: Mutex<Option<DeviceGeometry>>,
    wide_bus: AtomicBool,
    lifecycle: Lifecycle,
}

impl MmcDisk {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Current RCA; a rescan may have moved the card
    pub fn rca(&self) -> u16 {
        self.bus.rca_of(self.node).unwrap_or(self.rca)
    }

    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    pub fn state(&self) -> DriverState {
        self.lifecycle.state()
    }

    fn sector_addressing(&self) -> bool {
        self.card_type.uses_sector_addressing()
    }

    /// Geometry from the CSD, read once
    ///
    /// The first call also switches card and host to the 4-bit bus.
    pub fn geometry(&self) -> Result<DeviceGeometry> {
        self.lifecycle.ensure_ready()?;
        let mut cached = self.geometry.lock();
        if let Some(geometry) = *cached {
            return Ok(geometry);
        }

        let rca = self.rca();
        let mut bus = self.bus.acquire_bus()?;
        let csd = bus
            .execute_for(rca, SD_SEND_CSD, (rca as u32) << 16)?
            .long()?;
        let geometry = Csd::from_response(csd).geometry()?;

        if !self.wide_bus.load(Ordering::Acquire) {
            bus.app_command(rca, SD_SET_BUS_WIDTH, SD_BUS_WIDTH_4)?;
            bus.set_bus_width(BusWidth::Four)?;
            if self.config.transfer_clock_khz != 0 {
                let actual = bus.set_clock(self.config.transfer_clock_khz)?;
                log::debug!("mmc_disk: Transfer clock {} kHz", actual);
            }
            self.wide_bus.store(true, Ordering::Release);
        }

        log::info!(
            "mmc_disk: {} sectors of {} bytes{}",
            geometry.sector_count(),
            geometry.bytes_per_sector,
            if geometry.read_only { ", read-only" } else { "" }
        );
        *cached = Some(geometry);
        Ok(geometry)
    }

    fn check_request(&self, offset: u64, length: usize, write: bool) -> Result<()> {
        if offset % SECTOR_SIZE as u64 != 0 || length % SECTOR_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }
        let geometry = self.geometry()?;
        if write && geometry.read_only {
            return Err(Error::InvalidArgument);
        }
        match offset.checked_add(length as u64) {
            Some(end) if end <= geometry.size() => Ok(()),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Read `buffer.len()` bytes at byte `offset`
    pub fn read(&self, offset: u64, buffer: &mut [u8]) -> IoCompletion {
        if let Err(e) = self.check_request(offset, buffer.len(), false) {
            return IoCompletion {
                transferred: 0,
                status: Err(e),
            };
        }

        let dma = self.dma.lock();
        let request = IoRequest {
            offset,
            length: buffer.len(),
        };
        let capacity = dma.capacity();
        let rca = self.rca();
        let sectors = self.sector_addressing();
        self.scheduler
            .schedule(&request, capacity, &mut |op_offset, len, position| {
                let vecs = [PhysVec {
                    phys: dma.phys(),
                    len,
                }];
                let operation = IoOperation {
                    offset: op_offset,
                    vecs: &vecs,
                };
                self.bus.acquire_bus()?.do_io_for(
                    rca,
                    SD_READ_MULTIPLE_BLOCKS,
                    &operation,
                    sectors,
                )?;
                buffer[position..position + len].copy_from_slice(dma.bytes(len));
                Ok(())
            })
    }

    /// Write `buffer` at byte `offset`
    pub fn write(&self, offset: u64, buffer: &[u8]) -> IoCompletion {
        if let Err(e) = self.check_request(offset, buffer.len(), true) {
            return IoCompletion {
                transferred: 0,
                status: Err(e),
            };
        }

        let mut dma = self.dma.lock();
        let request = IoRequest {
            offset,
            length: buffer.len(),
        };
        let capacity = dma.capacity();
        let rca = self.rca();
        let sectors = self.sector_addressing();
        self.scheduler
            .schedule(&request, capacity, &mut |op_offset, len, position| {
                dma.bytes_mut(len)
                    .copy_from_slice(&buffer[position..position + len]);
                let vecs = [PhysVec {
                    phys: dma.phys(),
                    len,
                }];
                let operation = IoOperation {
                    offset: op_offset,
                    vecs: &vecs,
                };
                self.bus.acquire_bus()?.do_io_for(
                    rca,
                    SD_WRITE_MULTIPLE_BLOCKS,
                    &operation,
                    sectors,
                )
            })
    }

    /// Erase the whole blocks covered by `ranges`; returns the bytes erased
    pub fn trim(&self, ranges: &[TrimRange]) -> Result<u64> {
        let geometry = self.geometry()?;
        if geometry.read_only {
            return Err(Error::InvalidArgument);
        }
        let block = SECTOR_SIZE as u64;
        let rca = self.rca();
        let mut trimmed = 0;

        for range in ranges {
            let end = range
                .offset
                .checked_add(range.size)
                .ok_or(Error::InvalidArgument)?;
            if end > geometry.size() {
                return Err(Error::InvalidArgument);
            }
            // Partial blocks at either end are left alone
            let first = range.offset.div_ceil(block);
            let last = end / block;
            if first >= last {
                continue;
            }

            let (start_arg, end_arg) = if self.sector_addressing() {
                (first, last - 1)
            } else {
                (first * block, (last - 1) * block)
            };
            let start_arg = u32::try_from(start_arg).map_err(|_| Error::InvalidArgument)?;
            let end_arg = u32::try_from(end_arg).map_err(|_| Error::InvalidArgument)?;

            let mut bus = self.bus.acquire_bus()?;
            bus.execute_for(rca, SD_ERASE_WR_BLK_START, start_arg)?;
            bus.execute_for(rca, SD_ERASE_WR_BLK_END, end_arg)?;
            bus.execute_for(rca, SD_ERASE, 0)?;
            trimmed += (last - first) * block;
        }
        Ok(trimmed)
    }

    pub fn ioctl(&self, request: IoctlRequest<'_>) -> Result<IoctlReply> {
        match request {
            IoctlRequest::GetGeometry => self.geometry().map(IoctlReply::Geometry),
            IoctlRequest::GetDeviceSize => self.geometry().map(|g| IoctlReply::DeviceSize(g.size())),
            IoctlRequest::Trim(ranges) => self.trim(ranges).map(IoctlReply::Trimmed),
            IoctlRequest::Other(op) => {
                log::debug!("mmc_disk: Unsupported ioctl {:#x}", op);
                Err(Error::InvalidArgument)
            }
        }
    }
}

impl Drop for MmcDisk {
    fn drop(&mut self) {
        if self.lifecycle.state() != DriverState::Unloading {
            let _ = self.lifecycle.advance(DriverState::Unloading);
        }
        let _ = self.lifecycle.advance(DriverState::Unloaded);
    }
}

impl BlockDevice for MmcDisk {
    fn info(&self) -> core::result::Result<BlockDeviceInfo, BlockError> {
        // Always 512-byte blocks; CSD v1 cards may report 1024 or 2048
        let geometry = self.geometry()?;
        Ok(BlockDeviceInfo {
            num_blocks: geometry.size() / SECTOR_SIZE as u64,
            block_size: SECTOR_SIZE as u32,
            removable: geometry.removable,
            read_only: geometry.read_only,
        })
    }

    fn read_blocks(
        &self,
        lba: u64,
        count: u32,
        buffer: &mut [u8],
    ) -> core::result::Result<(), BlockError> {
        let length = count as usize * SECTOR_SIZE;
        if buffer.len() < length {
            return Err(BlockError::InvalidParameter);
        }
        let offset = lba.checked_mul(SECTOR_SIZE as u64).ok_or(BlockError::OutOfRange)?;
        if offset + length as u64 > self.geometry()?.size() {
            return Err(BlockError::OutOfRange);
        }
        self.read(offset, &mut buffer[..length]).status?;
        Ok(())
    }

    fn write_blocks(
        &self,
        lba: u64,
        count: u32,
        buffer: &[u8],
    ) -> core::result::Result<(), BlockError> {
        let length = count as usize * SECTOR_SIZE;
        if buffer.len() < length {
            return Err(BlockError::InvalidParameter);
        }
        let offset = lba.checked_mul(SECTOR_SIZE as u64).ok_or(BlockError::OutOfRange)?;
        if offset + length as u64 > self.geometry()?.size() {
            return Err(BlockError::OutOfRange);
        }
        self.write(offset, &buffer[..length]).status?;
        Ok(())
    }
}
