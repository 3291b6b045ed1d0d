//! MMC/SD bus manager
//!
//! Owns the card enumeration worker for one host. The worker sleeps on the
//! scan signal (raised by the host on card insertion or by [`MmcBus::rescan`])
//! and runs one identification pass per wake-up:
//!
//! 1. CMD0 puts every card into the idle state
//! 2. CMD8 probes the interface condition (no answer: version 1.x card)
//! 3. CMD55 + ACMD41 negotiate the OCR until the cards report ready
//! 4. CMD2 + CMD3 pull one card at a time into stand-by and assign its RCA
//! 5. A device node is registered for every new card
//!
//! All command sequences, including the ones issued by the disk driver, run
//! under [`MmcBus::acquire_bus`], which also tracks the selected card.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::Write;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::{Mutex, MutexGuard};

use super::cid::CardId;
use super::command::*;
use super::dma::IoOperation;
use super::{BusWidth, CardType, MmcHost, Response};
use crate::config::BusConfig;
use crate::device::{DeviceManager, DriverState, Lifecycle, NodeAttributes, NodeId, attr};
use crate::error::{Error, Result};
use crate::platform::{Platform, ThreadHandle};
use crate::sync::ScanSignal;

/// Cards tracked per bus
pub const MAX_CARDS: usize = 8;

/// A card published by the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    pub node: NodeId,
    pub rca: u16,
    pub card_type: CardType,
    pub id: CardId,
    cid: [u32; 4],
}

/// Bus state protected by the bus lock
struct BusState {
    /// RCA of the card in transfer state, 0 if none
    active_rca: u16,
}

struct BusShared {
    host: Arc<dyn MmcHost>,
    devices: Arc<dyn DeviceManager>,
    platform: Arc<dyn Platform>,
    node: NodeId,
    config: BusConfig,
    scan: Arc<ScanSignal>,
    shutting_down: AtomicBool,
    lock: Mutex<BusState>,
    cards: Mutex<heapless::Vec<CardInfo, MAX_CARDS>>,
    lifecycle: Lifecycle,
    passes: AtomicU32,
}

/// Exclusive access to the bus
///
/// Dropping the guard releases the bus. The selected card stays selected
/// until a command needs a different one.
pub struct BusGuard<'a> {
    shared: &'a BusShared,
    state: MutexGuard<'a, BusState>,
}

impl BusGuard<'_> {
    /// Forward a command to the host as is
    pub fn execute_command(&mut self, opcode: u8, argument: u32) -> Result<Response> {
        let response = self.shared.host.execute_command(opcode, argument);
        if opcode == SD_GO_IDLE_STATE {
            self.state.active_rca = 0;
        }
        response
    }

    /// Move card `rca` into transfer state
    pub fn select(&mut self, rca: u16) -> Result<()> {
        if self.state.active_rca == rca {
            return Ok(());
        }
        self.shared
            .host
            .execute_command(SD_SELECT_DESELECT_CARD, (rca as u32) << 16)?;
        self.state.active_rca = rca;
        Ok(())
    }

    /// Return the selected card to stand-by
    pub fn deselect(&mut self) -> Result<()> {
        if self.state.active_rca == 0 {
            return Ok(());
        }
        // Deselected cards do not answer CMD7
        match self.shared.host.execute_command(SD_SELECT_DESELECT_CARD, 0) {
            Ok(_) | Err(Error::TimedOut) => {}
            Err(e) => return Err(e),
        }
        self.state.active_rca = 0;
        Ok(())
    }

    fn prepare(&mut self, rca: u16, opcode: u8) -> Result<()> {
        if needs_transfer_state(opcode) {
            self.select(rca)
        } else if needs_standby_state(opcode) {
            self.deselect()
        } else {
            Ok(())
        }
    }

    /// Issue `opcode` to card `rca`, selecting or deselecting it first as
    /// the command requires
    pub fn execute_for(&mut self, rca: u16, opcode: u8, argument: u32) -> Result<Response> {
        self.prepare(rca, opcode)?;
        self.execute_command(opcode, argument)
    }

    /// CMD55 followed by application command `opcode`
    pub fn app_command(&mut self, rca: u16, opcode: u8, argument: u32) -> Result<Response> {
        self.prepare(rca, opcode)?;
        self.execute_command(SD_APP_CMD, (rca as u32) << 16)?;
        self.execute_command(opcode, argument)
    }

    /// Block transfer on card `rca`
    pub fn do_io_for(
        &mut self,
        rca: u16,
        opcode: u8,
        operation: &IoOperation<'_>,
        offset_as_sectors: bool,
    ) -> Result<()> {
        self.select(rca)?;
        self.shared.host.do_io(opcode, operation, offset_as_sectors)
    }

    pub fn set_bus_width(&mut self, width: BusWidth) -> Result<()> {
        self.shared.host.set_bus_width(width)
    }

    pub fn set_clock(&mut self, kilohertz: u32) -> Result<u32> {
        self.shared.host.set_clock(kilohertz)
    }
}

impl BusShared {
    fn acquire(&self) -> BusGuard<'_> {
        BusGuard {
            shared: self,
            state: self.lock.lock(),
        }
    }

    fn worker_loop(&self) {
        log::debug!("MMC: Bus worker started");
        loop {
            self.scan.wait(&*self.platform, self.config.scan_poll_us);
            if self.shutting_down.load(Ordering::Acquire) {
                break;
            }
            match self.scan_pass() {
                Ok(0) => log::debug!("MMC: Scan found no new cards"),
                Ok(n) => log::info!("MMC: Scan published {} new card(s)", n),
                Err(e) => log::warn!("MMC: Scan aborted: {}", e),
            }
            self.passes.fetch_add(1, Ordering::AcqRel);
        }
        log::debug!("MMC: Bus worker exiting");
    }

    /// One identification pass; returns the number of newly published cards
    fn scan_pass(&self) -> Result<usize> {
        let mut bus = self.acquire();

        if let Err(e) = bus.execute_command(SD_GO_IDLE_STATE, 0) {
            log::debug!("MMC: GO_IDLE_STATE failed: {}", e);
        }

        let mut high_capacity = true;
        match bus.execute_command(SD_SEND_IF_COND, SD_IF_COND_ARGUMENT) {
            Ok(response) => {
                let echo = response.short()? & SD_IF_COND_ECHO_MASK;
                if echo != SD_IF_COND_ARGUMENT {
                    log::warn!(
                        "MMC: SEND_IF_COND echoed {:#x}, expected {:#x} (voltage mismatch)",
                        echo,
                        SD_IF_COND_ARGUMENT
                    );
                    if self.config.strict_voltage_check {
                        return Err(Error::BadValue);
                    }
                }
            }
            Err(e) => {
                log::info!("MMC: No answer to SEND_IF_COND ({}), assuming SD 1.x card", e);
                high_capacity = false;
            }
        }

        // The bus is released while the card powers up
        drop(bus);
        let ocr = self.negotiate_ocr(high_capacity)?;
        let mut bus = self.acquire();
        let card_type = match (ocr & OCR_CCS != 0, ocr & OCR_UHS2 != 0) {
            (true, true) => CardType::Uhs2,
            (true, false) => CardType::Sdhc,
            (false, _) => CardType::Sd,
        };
        log::debug!("MMC: OCR {:#010x}, card type {}", ocr, card_type.name());

        let mut assigned: heapless::Vec<u16, MAX_CARDS> = heapless::Vec::new();
        let mut published = 0;
        loop {
            let cid = match bus.execute_command(SD_ALL_SEND_CID, 0) {
                Ok(response) => response.long()?,
                Err(_) => break,
            };
            let status = match bus.execute_command(SD_SEND_RELATIVE_ADDR, 0) {
                Ok(response) => response.short()?,
                Err(e) => {
                    log::warn!("MMC: SEND_RELATIVE_ADDR failed: {}", e);
                    break;
                }
            };
            if status & R6_STATE_MASK != R6_IDENT_READY {
                log::debug!("MMC: Card left identification (status {:#06x})", status & 0xFFFF);
                break;
            }

            let rca = (status >> 16) as u16;
            if rca == 0 || assigned.contains(&rca) {
                log::error!("MMC: Card published duplicate RCA {:#06x}", rca);
                break;
            }
            if assigned.push(rca).is_err() {
                log::warn!("MMC: More than {} cards on the bus, ignoring the rest", MAX_CARDS);
                break;
            }

            if self.publish(cid, rca, card_type)? {
                published += 1;
            }
        }

        if published > 0 && self.lifecycle.state() == DriverState::Initialized {
            self.lifecycle.advance(DriverState::ChildrenRegistered)?;
        }
        Ok(published)
    }

    /// ACMD41 loop; the bus lock is held per poll, never across a sleep
    fn negotiate_ocr(&self, high_capacity: bool) -> Result<u32> {
        let mut argument = OCR_VOLTAGE_WINDOW;
        if high_capacity {
            argument |= OCR_CCS;
        }

        for _ in 0..self.config.ocr_retry_limit {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Error::ShuttingDown);
            }
            let mut bus = self.acquire();
            match bus.execute_command(SD_APP_CMD, 0) {
                Ok(_) => {}
                Err(Error::Busy) => {
                    log::warn!("MMC: Card locked, retrying");
                    drop(bus);
                    self.platform.sleep_us(self.config.card_locked_delay_us);
                    continue;
                }
                Err(e) => return Err(e),
            }

            let ocr = bus.execute_command(SD_SEND_OP_COND, argument)?.short()?;
            if ocr & OCR_READY != 0 {
                return Ok(ocr);
            }
            drop(bus);
            self.platform.sleep_us(self.config.ocr_busy_delay_us);
        }

        log::error!(
            "MMC: Card not ready after {} SD_SEND_OP_COND polls",
            self.config.ocr_retry_limit
        );
        Err(Error::TimedOut)
    }

    /// Register a node for the card; `false` if it was already published
    fn publish(&self, cid: [u32; 4], rca: u16, card_type: CardType) -> Result<bool> {
        let mut cards = self.cards.lock();
        if let Some(known) = cards.iter_mut().find(|c| c.cid == cid) {
            log::debug!(
                "MMC: Card {} already published, RCA {:#06x} -> {:#06x}",
                known.id.product,
                known.rca,
                rca
            );
            known.rca = rca;
            return Ok(false);
        }

        let id = CardId::from_response(cid)?;
        let mut name: heapless::String<64> = heapless::String::new();
        let _ = write!(name, "{} card {}", card_type.name(), id.product);

        let mut attrs = NodeAttributes::new();
        attrs.push_str(attr::BUS, attr::BUS_MMC)?;
        attrs.push_str(attr::PRETTY_NAME, &name)?;
        attrs.push_u32(attr::VENDOR, id.vendor as u32)?;
        attrs.push_str(attr::ID, &id.product)?;
        attrs.push_u32(attr::UNIQUE_ID, id.serial)?;
        attrs.push_u16(attr::MMC_REVISION, id.revision)?;
        attrs.push_u8(attr::MMC_MONTH, id.month)?;
        attrs.push_u16(attr::MMC_YEAR, id.year)?;
        attrs.push_u16(attr::MMC_RCA, rca)?;
        attrs.push_u8(attr::MMC_TYPE, card_type as u8)?;

        let node = self.devices.register_node(self.node, attrs)?;
        log::info!(
            "MMC: {} (vendor {:#04x}, serial {:#010x}, {}/{}) at RCA {:#06x}",
            name,
            id.vendor,
            id.serial,
            id.month,
            id.year,
            rca
        );

        cards
            .push(CardInfo {
                node,
                rca,
                card_type,
                id,
                cid,
            })
            .map_err(|_| Error::NoMemory)?;
        Ok(true)
    }
}

/// One MMC/SD bus
pub struct MmcBus {
    shared: Arc<BusShared>,
    worker: Mutex<Option<Box<dyn ThreadHandle>>>,
    status: Result<()>,
}

impl MmcBus {
    /// Attach to `host` and start the enumeration worker
    ///
    /// Construction itself does not fail; a worker that could not be
    /// started is reported by [`MmcBus::init_check`].
    pub fn new(
        host: Arc<dyn MmcHost>,
        devices: Arc<dyn DeviceManager>,
        node: NodeId,
        platform: Arc<dyn Platform>,
        config: BusConfig,
    ) -> Self {
        let scan = Arc::new(ScanSignal::new());
        let shared = Arc::new(BusShared {
            host,
            devices,
            platform: platform.clone(),
            node,
            config,
            scan: scan.clone(),
            shutting_down: AtomicBool::new(false),
            lock: Mutex::new(BusState { active_rca: 0 }),
            cards: Mutex::new(heapless::Vec::new()),
            lifecycle: Lifecycle::new(),
            passes: AtomicU32::new(0),
        });

        let worker_shared = shared.clone();
        let (worker, status) = match shared
            .lifecycle
            .advance(DriverState::Initialized)
            .and_then(|()| {
                platform.spawn("mmc bus worker", Box::new(move || worker_shared.worker_loop()))
            }) {
            Ok(handle) => (Some(handle), Ok(())),
            Err(e) => {
                log::error!("MMC: Failed to start bus worker: {}", e);
                (None, Err(e))
            }
        };

        if worker.is_some() {
            // The host signals right away if a card is already inserted
            shared.host.set_scan_signal(scan);
        }

        Self {
            shared,
            worker: Mutex::new(worker),
            status,
        }
    }

    /// Construction status
    pub fn init_check(&self) -> Result<()> {
        self.status
    }

    /// Request an enumeration pass; requests made before the worker wakes
    /// collapse into one
    pub fn rescan(&self) {
        self.shared.scan.signal();
    }

    /// Serialize a command sequence on the bus
    pub fn acquire_bus(&self) -> Result<BusGuard<'_>> {
        self.status?;
        self.shared.lifecycle.ensure_ready()?;
        Ok(self.shared.acquire())
    }

    pub fn execute_command(&self, opcode: u8, argument: u32) -> Result<Response> {
        self.acquire_bus()?.execute_command(opcode, argument)
    }

    /// Cards published so far
    pub fn cards(&self) -> Vec<CardInfo> {
        self.shared.cards.lock().iter().cloned().collect()
    }

    /// Current RCA of the card behind `node`
    pub fn rca_of(&self, node: NodeId) -> Option<u16> {
        self.shared
            .cards
            .lock()
            .iter()
            .find(|c| c.node == node)
            .map(|c| c.rca)
    }

    /// Completed enumeration passes
    pub fn scan_count(&self) -> u32 {
        self.shared.passes.load(Ordering::Acquire)
    }

    pub fn node(&self) -> NodeId {
        self.shared.node
    }

    pub fn state(&self) -> DriverState {
        self.shared.lifecycle.state()
    }
}

impl Drop for MmcBus {
    fn drop(&mut self) {
        if self.shared.lifecycle.advance(DriverState::Unloading).is_err() {
            log::warn!("MMC: Bus dropped in state {:?}", self.shared.lifecycle.state());
        }
        self.shared.shutting_down.store(true, Ordering::Release);
        self.shared.scan.signal();
        if let Some(worker) = self.worker.lock().take() {
            worker.join();
        }
        let _ = self.shared.lifecycle.advance(DriverState::Unloaded);
        log::debug!("MMC: Bus shut down");
    }
}
