//! SDHCI (SD Host Controller Interface) Driver
//!
//! This module drives one slot of a standard SDHCI controller: it issues SD
//! commands, runs SDMA block transfers, and configures power, clock and bus
//! width. Completion is interrupt driven; when the glue has no IRQ line for
//! the slot, a poller thread takes the interrupt handler's place.
//!
//! Only one command may be outstanding at a time. The MMC bus manager
//! serializes its users; a second concurrent caller is rejected with
//! [`Error::ProtocolViolation`].

pub mod command;
pub mod regs;

#[cfg(test)]
pub(crate) mod sim;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Once;
use tock_registers::LocalRegisterCopy;
use tock_registers::fields::FieldValue;

use crate::config::SdhciConfig;
use crate::drivers::block::SECTOR_SIZE;
use crate::drivers::mmc::command::{
    DataDirection, ReplyFlags, ReplySize, SD_STOP_TRANSMISSION, data_direction, reply_for,
};
use crate::drivers::mmc::dma::{DmaRestrictions, IoOperation};
use crate::drivers::mmc::{BusWidth, MmcHost, Response};
use crate::drivers::mmio::RegisterIo;
use crate::error::{Error, Result};
use crate::platform::{InterruptHandler, IrqResult, Platform, ThreadHandle, Timeout, wait_for};
use crate::sync::{ScanSignal, Semaphore};
use command::{encode_command, encode_transfer_mode};
use regs::*;

/// Per-command trace output, compiled in with the `sdhci-trace` feature
macro_rules! sdhci_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "sdhci-trace")]
        {
            log::trace!($($arg)*);
        }
    };
}

/// Clock divider for `target_khz` from a `base_khz` controller clock
///
/// Returns the raw divider field (10-bit `N` with SD clock = base / 2N for
/// SDHCI 3.0+, the power-of-two divisor / 2 before that) and the resulting
/// SD clock in kHz. The result never exceeds the target.
pub fn compute_divider(base_khz: u32, target_khz: u32, spec_version: u8) -> (u16, u32) {
    if target_khz == 0 || base_khz == 0 {
        return (0, 0);
    }
    if spec_version >= SDHCI_SPEC_300 {
        if target_khz >= base_khz {
            return (0, base_khz);
        }
        let n = base_khz
            .div_ceil(2 * target_khz)
            .min(SDHCI_MAX_DIV_SPEC_300 / 2);
        (n as u16, base_khz / (2 * n))
    } else {
        let mut divisor = 1u32;
        while divisor < SDHCI_MAX_DIV_SPEC_200 && base_khz > target_khz.saturating_mul(divisor) {
            divisor *= 2;
        }
        ((divisor / 2) as u16, base_khz / divisor)
    }
}

/// Claim of the single outstanding-command slot
struct CommandSlot<'a>(&'a AtomicBool);

impl<'a> CommandSlot<'a> {
    fn claim(flag: &'a AtomicBool, opcode: u8) -> Result<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            log::error!(
                "SDHCI: CMD{} issued while another command is outstanding",
                opcode
            );
            return Err(Error::ProtocolViolation);
        }
        Ok(Self(flag))
    }
}

impl Drop for CommandSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// State shared with the interrupt handler and the poller
struct Inner {
    io: Box<dyn RegisterIo>,
    platform: Arc<dyn Platform>,
    config: SdhciConfig,
    irq: Option<u32>,
    /// SDHCI specification version (2 = 3.00)
    version: u8,
    base_clock_khz: u32,
    /// Released once per captured completion/error group
    command_done: Semaphore,
    /// Completion and error bits captured by the interrupt handler
    command_result: AtomicU32,
    in_flight: AtomicBool,
    polling: AtomicBool,
    scan_signal: Once<Arc<ScanSignal>>,
}

impl Inner {
    fn regs(&self) -> SdhciRegs<'_> {
        SdhciRegs::new(&*self.io)
    }

    fn card_present(&self) -> bool {
        self.regs()
            .present_state()
            .is_set(PRESENT_STATE::CARD_INSERTED)
    }

    fn reset(&self, mask: FieldValue<u8, SOFTWARE_RESET::Register>) -> Result<()> {
        let regs = self.regs();
        regs.start_reset(mask);
        if wait_for(&*self.platform, self.config.reset_timeout_us, || {
            !regs.reset_pending(mask)
        }) {
            Ok(())
        } else {
            log::error!("SDHCI: Reset timeout (mask={:#x})", mask.value);
            Err(Error::TimedOut)
        }
    }

    fn power_on(&self) -> bool {
        if !self.card_present() {
            return false;
        }
        let regs = self.regs();
        let caps = regs.capabilities();
        let voltage = if caps.is_set(CAPABILITIES::VOLTAGE_3V3) {
            POWER_CONTROL::BUS_VOLTAGE::V3_3
        } else if caps.is_set(CAPABILITIES::VOLTAGE_3V0) {
            POWER_CONTROL::BUS_VOLTAGE::V3_0
        } else if caps.is_set(CAPABILITIES::VOLTAGE_1V8) {
            POWER_CONTROL::BUS_VOLTAGE::V1_8
        } else {
            log::error!("SDHCI: No supported bus voltage in capabilities");
            regs.power_off();
            return false;
        };
        regs.set_power_control(POWER_CONTROL::BUS_POWER::SET + voltage);
        true
    }

    fn set_clock(&self, kilohertz: u32) -> Result<u32> {
        let regs = self.regs();
        regs.set_clock_control(LocalRegisterCopy::new(0));
        if kilohertz == 0 {
            return Ok(0);
        }
        if self.base_clock_khz == 0 {
            log::error!("SDHCI: Base clock unknown, cannot set clock");
            return Err(Error::IoError);
        }

        let (divider, actual) = compute_divider(self.base_clock_khz, kilohertz, self.version);
        log::debug!(
            "SDHCI: Setting clock to {} kHz (divider={}, actual={} kHz)",
            kilohertz,
            divider,
            actual
        );

        let mut clock: LocalRegisterCopy<u16, CLOCK_CONTROL::Register> = LocalRegisterCopy::new(0);
        clock.modify(
            CLOCK_CONTROL::DIVIDER.val(divider & 0xFF)
                + CLOCK_CONTROL::DIVIDER_HI.val((divider >> 8) & 0x3)
                + CLOCK_CONTROL::INTERNAL_CLOCK_ENABLE::SET,
        );
        regs.set_clock_control(clock);
        self.wait_clock_stable("internal clock")?;

        clock.modify(CLOCK_CONTROL::PLL_ENABLE::SET);
        regs.set_clock_control(clock);
        self.wait_clock_stable("PLL")?;

        clock.modify(CLOCK_CONTROL::SD_CLOCK_ENABLE::SET);
        regs.set_clock_control(clock);
        Ok(actual)
    }

    fn wait_clock_stable(&self, what: &str) -> Result<()> {
        let regs = self.regs();
        if wait_for(&*self.platform, self.config.clock_stable_timeout_us, || {
            regs.clock_control()
                .is_set(CLOCK_CONTROL::INTERNAL_CLOCK_STABLE)
        }) {
            Ok(())
        } else {
            log::error!("SDHCI: {} not stable", what);
            Err(Error::TimedOut)
        }
    }

    fn set_bus_width(&self, width: BusWidth) -> Result<()> {
        let regs = self.regs();
        let mut control = regs.host_control();
        control.modify(HOST_CONTROL::DATA_WIDTH_4BIT::CLEAR + HOST_CONTROL::DATA_WIDTH_8BIT::CLEAR);
        match width {
            BusWidth::One => {}
            BusWidth::Four => control.modify(HOST_CONTROL::DATA_WIDTH_4BIT::SET),
            BusWidth::Eight => {
                if !regs.capabilities().is_set(CAPABILITIES::BUS_8BIT) {
                    return Err(Error::InvalidArgument);
                }
                control.modify(HOST_CONTROL::DATA_WIDTH_8BIT::SET)
            }
        }
        regs.set_host_control(control);
        log::debug!("SDHCI: Bus width set to {:?}", width);
        Ok(())
    }

    /// Record completion/error bits of `status` for the waiting thread
    fn capture_completion(&self, status: u32) {
        let completion = status & SDHCI_INT_COMPLETION_MASK;
        if completion != 0 {
            self.regs().ack(completion);
            self.command_result.fetch_or(completion, Ordering::AcqRel);
            self.command_done.release();
        }
    }

    fn handle_interrupt(&self) -> IrqResult {
        let regs = self.regs();
        let status = regs.int_status();
        if status == 0 || status == u32::MAX {
            return IrqResult::Unhandled;
        }

        if status & SDHCI_INT_CARD_REMOVE != 0 {
            regs.ack(SDHCI_INT_CARD_REMOVE);
            if !self.card_present() {
                log::info!("SDHCI: Card removed");
                regs.power_off();
            }
        }

        if status & SDHCI_INT_CARD_INSERT != 0 {
            regs.ack(SDHCI_INT_CARD_INSERT);
            if self.card_present() {
                log::info!("SDHCI: Card inserted");
                if self.power_on() {
                    if let Err(e) = self.set_clock(self.config.identification_clock_khz) {
                        log::warn!("SDHCI: Failed to start card clock: {}", e);
                    }
                }
                if let Some(signal) = self.scan_signal.get() {
                    signal.signal();
                }
            }
        }

        self.capture_completion(status);

        if status & SDHCI_INT_BUS_POWER != 0 {
            regs.ack(SDHCI_INT_BUS_POWER);
            log::warn!("SDHCI: Bus power fault");
        }

        let leftover = regs.int_status() & !SDHCI_INT_ERROR;
        if leftover != 0 {
            log::debug!("SDHCI: Interrupt bits left unhandled: {:#010x}", leftover);
        }
        IrqResult::Handled
    }

    /// Interrupt handler stand-in for slots without an IRQ line
    fn poll_loop(&self) {
        while self.polling.load(Ordering::Acquire) {
            self.handle_interrupt();
            self.platform.sleep_us(self.config.poll_interval_us);
        }
    }

    /// Wait until any bit of `mask` was captured; errors win over completion
    fn wait_completion(&self, mask: u32, timeout_us: u64) -> Result<u32> {
        let timeout = Timeout::from_us(&*self.platform, timeout_us);
        loop {
            let status = self.command_result.load(Ordering::Acquire);
            if status & SDHCI_INT_COMPLETION_ERRORS != 0 {
                self.command_result.fetch_and(!status, Ordering::AcqRel);
                return Err(self.classify_error(status));
            }
            if status & mask != 0 {
                self.command_result.fetch_and(!mask, Ordering::AcqRel);
                return Ok(status);
            }

            // Stray permits from earlier completions only cause another
            // pass through the status check
            let acquired = self
                .command_done
                .acquire(&*self.platform, timeout.remaining_us());
            if acquired.is_err() {
                let status = self.command_result.load(Ordering::Acquire);
                if status & (mask | SDHCI_INT_COMPLETION_ERRORS) != 0 {
                    continue;
                }
                log::error!(
                    "SDHCI: No completion (want {:#x}, status {:#010x})",
                    mask,
                    self.regs().int_status()
                );
                return Err(Error::Timeout);
            }
        }
    }

    fn classify_error(&self, status: u32) -> Error {
        let regs = self.regs();
        regs.ack(status & SDHCI_INT_ERROR_MASK);

        if status & SDHCI_INT_TIMEOUT_MASK != 0 {
            if regs.present_state().is_set(PRESENT_STATE::CMD_INHIBIT) {
                if let Err(e) = self.reset(SOFTWARE_RESET::RESET_CMD::SET) {
                    log::warn!("SDHCI: Command line reset after timeout failed: {}", e);
                }
            }
            Error::TimedOut
        } else if status & SDHCI_INT_CRC_MASK != 0 {
            log::error!("SDHCI: CRC error (status {:#010x})", status);
            Error::BadValue
        } else {
            log::error!("SDHCI: Controller error (status {:#010x})", status);
            Error::IoError
        }
    }

    fn execute_command(&self, opcode: u8, argument: u32) -> Result<Response> {
        let _slot = CommandSlot::claim(&self.in_flight, opcode)?;
        let regs = self.regs();

        let state = regs.present_state();
        if state.is_set(PRESENT_STATE::CMD_INHIBIT) {
            log::error!("SDHCI: Command line busy, CMD{} rejected", opcode);
            return Err(Error::Busy);
        }

        let Some((reply, flags)) = reply_for(opcode) else {
            log::error!("SDHCI: Unknown command CMD{}", opcode);
            return Err(Error::InvalidArgument);
        };

        if flags.contains(ReplyFlags::CHECK_BUSY)
            && opcode != SD_STOP_TRANSMISSION
            && state.is_set(PRESENT_STATE::DAT_INHIBIT)
        {
            log::error!("SDHCI: Data line busy, CMD{} rejected", opcode);
            return Err(Error::Busy);
        }

        sdhci_trace!("SDHCI: CMD{} arg={:#010x}", opcode, argument);

        self.command_result.store(0, Ordering::Release);
        regs.write_argument(argument);
        regs.write_command(encode_command(opcode, reply, flags));

        self.wait_completion(SDHCI_INT_CMD_COMPLETE, self.config.command_timeout_us)?;

        if regs.present_state().is_set(PRESENT_STATE::CMD_INHIBIT) {
            log::error!("SDHCI: Command line stuck after CMD{}, resetting", opcode);
            if let Err(e) = self.reset(SOFTWARE_RESET::RESET_CMD::SET) {
                log::warn!("SDHCI: Command line reset after CMD{} failed: {}", opcode, e);
            }
            return Err(Error::IoError);
        }

        let response = match reply.size() {
            ReplySize::None => Response::None,
            ReplySize::Bits48 => Response::Short(regs.response(0)),
            ReplySize::Bits136 => Response::Long([
                regs.response(0),
                regs.response(1),
                regs.response(2),
                regs.response(3),
            ]),
        };

        if reply.is_busy() {
            self.wait_completion(SDHCI_INT_TRANSFER_COMPLETE, self.config.data_timeout_us)?;
        }

        sdhci_trace!("SDHCI: CMD{} -> {:x?}", opcode, response);
        Ok(response)
    }

    fn do_io(&self, opcode: u8, operation: &IoOperation<'_>, offset_as_sectors: bool) -> Result<()> {
        let Some((direction, multi_block)) = data_direction(opcode) else {
            log::error!("SDHCI: CMD{} is not a block data command", opcode);
            return Err(Error::InvalidArgument);
        };
        if operation.offset % SECTOR_SIZE as u64 != 0 {
            return Err(Error::InvalidArgument);
        }
        let restrictions = DmaRestrictions::SDHCI;
        for vec in operation.vecs {
            restrictions.check(vec)?;
        }

        let max_chunk = if multi_block {
            restrictions.max_segment_blocks * SECTOR_SIZE
        } else {
            SECTOR_SIZE
        };

        let mut offset = operation.offset;
        for vec in operation.vecs {
            let mut phys = vec.phys;
            let mut remaining = vec.len;
            while remaining > 0 {
                let to_boundary = (SDHCI_DEFAULT_BOUNDARY_SIZE
                    - phys % SDHCI_DEFAULT_BOUNDARY_SIZE) as usize;
                let len = remaining.min(to_boundary).min(max_chunk);
                self.transfer(
                    opcode,
                    direction,
                    multi_block,
                    phys,
                    len,
                    offset,
                    offset_as_sectors,
                )?;
                phys += len as u64;
                offset += len as u64;
                remaining -= len;
            }
        }
        Ok(())
    }

    /// One SDMA transfer that stays inside a boundary window
    #[allow(clippy::too_many_arguments)]
    fn transfer(
        &self,
        opcode: u8,
        direction: DataDirection,
        multi_block: bool,
        phys: u64,
        len: usize,
        offset: u64,
        offset_as_sectors: bool,
    ) -> Result<()> {
        let argument = if offset_as_sectors {
            offset / SECTOR_SIZE as u64
        } else {
            offset
        };
        let argument = u32::try_from(argument).map_err(|_| Error::InvalidArgument)?;
        let blocks = (len / SECTOR_SIZE) as u16;
        let (reply, flags) = reply_for(opcode).ok_or(Error::InvalidArgument)?;

        let _slot = CommandSlot::claim(&self.in_flight, opcode)?;
        let regs = self.regs();
        let state = regs.present_state();
        if state.is_set(PRESENT_STATE::CMD_INHIBIT) || state.is_set(PRESENT_STATE::DAT_INHIBIT) {
            log::error!("SDHCI: Lines busy, CMD{} transfer rejected", opcode);
            return Err(Error::Busy);
        }

        sdhci_trace!(
            "SDHCI: CMD{} {} blocks at {:#x} (dma {:#x})",
            opcode,
            blocks,
            argument,
            phys
        );

        self.command_result.store(0, Ordering::Release);
        regs.set_dma_address(phys as u32);
        regs.set_block_size(
            BLOCK_SIZE::SIZE.val(SDHCI_BLOCK_LEN as u16) + BLOCK_SIZE::SDMA_BOUNDARY::Boundary512K,
        );
        regs.set_block_count(blocks);
        regs.set_transfer_mode(encode_transfer_mode(direction, multi_block));
        regs.write_argument(argument);
        regs.write_command(encode_command(opcode, reply, flags));

        let result = self
            .wait_completion(SDHCI_INT_CMD_COMPLETE, self.config.command_timeout_us)
            .and_then(|_| {
                self.wait_completion(SDHCI_INT_TRANSFER_COMPLETE, self.config.data_timeout_us)
            });

        if let Err(e) = result {
            log::error!(
                "SDHCI: CMD{} transfer of {} blocks at {:#x} failed: {}",
                opcode,
                blocks,
                argument,
                e
            );
            if regs.present_state().is_set(PRESENT_STATE::DAT_INHIBIT) {
                if let Err(e) = self.reset(SOFTWARE_RESET::RESET_DATA::SET) {
                    log::warn!("SDHCI: Data line reset after CMD{} failed: {}", opcode, e);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn set_scan_signal(&self, signal: Arc<ScanSignal>) {
        let stored = self.scan_signal.call_once(|| signal.clone());
        if !Arc::ptr_eq(stored, &signal) {
            log::warn!("SDHCI: Scan signal already set, ignoring the new one");
        }

        let regs = self.regs();
        regs.set_int_enable(regs.int_enable() | SDHCI_INT_CARD_DETECT_MASK);
        if self.irq.is_some() {
            regs.set_signal_enable(regs.signal_enable() | SDHCI_INT_CARD_DETECT_MASK);
        }

        if self.card_present() {
            stored.signal();
        }
    }
}

impl InterruptHandler for Inner {
    fn handle_interrupt(&self) -> IrqResult {
        Inner::handle_interrupt(self)
    }
}

/// One SDHCI slot
pub struct SdhciBus {
    inner: Arc<Inner>,
    poller: Option<Box<dyn ThreadHandle>>,
}

impl SdhciBus {
    /// Bring up the slot behind `io`
    ///
    /// Resets the controller, enables interrupts, attaches to `irq` (or
    /// starts the completion poller when there is none) and, if a card is
    /// already inserted, powers it and starts the identification clock.
    pub fn new(
        io: Box<dyn RegisterIo>,
        irq: Option<u32>,
        platform: Arc<dyn Platform>,
        config: SdhciConfig,
    ) -> Result<Self> {
        let regs = SdhciRegs::new(&*io);
        let version = regs.spec_version();
        let caps = regs.capabilities();
        let base_mhz = if version >= SDHCI_SPEC_300 {
            caps.read(CAPABILITIES::BASE_CLOCK)
        } else {
            caps.read(CAPABILITIES::BASE_CLOCK) & 0x3F
        };
        log::info!(
            "SDHCI: Controller version {}, base clock {} MHz, caps={:#010x}",
            version,
            base_mhz,
            caps.get()
        );
        if base_mhz == 0 {
            log::warn!("SDHCI: Capabilities report no base clock");
        }

        let inner = Arc::new(Inner {
            io,
            platform: platform.clone(),
            config,
            irq,
            version,
            base_clock_khz: base_mhz * 1000,
            command_done: Semaphore::new(0),
            command_result: AtomicU32::new(0),
            in_flight: AtomicBool::new(false),
            polling: AtomicBool::new(irq.is_none()),
            scan_signal: Once::new(),
        });

        inner.reset(SOFTWARE_RESET::RESET_ALL::SET)?;

        let regs = inner.regs();
        // Maximum data timeout counter
        regs.set_timeout_control(0x0E);
        regs.set_int_enable(SDHCI_INT_BASE_ENABLE);
        regs.ack(u32::MAX);

        let poller = match irq {
            Some(line) => {
                regs.set_signal_enable(SDHCI_INT_BASE_ENABLE);
                platform.install_interrupt_handler(line, inner.clone())?;
                None
            }
            None => {
                regs.set_signal_enable(0);
                log::info!("SDHCI: No IRQ, polling every {} us", config.poll_interval_us);
                let worker = inner.clone();
                Some(platform.spawn("sdhci poller", Box::new(move || worker.poll_loop()))?)
            }
        };

        let bus = Self { inner, poller };
        if bus.inner.power_on() {
            log::info!("SDHCI: Card present at startup");
            if let Err(e) = bus.inner.set_clock(config.identification_clock_khz) {
                log::warn!("SDHCI: Failed to start card clock: {}", e);
            }
        }
        Ok(bus)
    }

    pub fn card_present(&self) -> bool {
        self.inner.card_present()
    }

    /// Power the card with the best supported voltage; `false` without a
    /// card or a usable voltage
    pub fn power_on(&self) -> bool {
        self.inner.power_on()
    }

    pub fn power_off(&self) {
        self.inner.regs().power_off();
    }

    pub fn reset(&self, mask: FieldValue<u8, SOFTWARE_RESET::Register>) -> Result<()> {
        self.inner.reset(mask)
    }

    /// Interrupt entry point (also installed on the IRQ line)
    pub fn handle_interrupt(&self) -> IrqResult {
        self.inner.handle_interrupt()
    }

    pub fn spec_version(&self) -> u8 {
        self.inner.version
    }

    pub fn base_clock_khz(&self) -> u32 {
        self.inner.base_clock_khz
    }
}

impl MmcHost for SdhciBus {
    fn execute_command(&self, opcode: u8, argument: u32) -> Result<Response> {
        self.inner.execute_command(opcode, argument)
    }

    fn do_io(&self, opcode: u8, operation: &IoOperation<'_>, offset_as_sectors: bool) -> Result<()> {
        self.inner.do_io(opcode, operation, offset_as_sectors)
    }

    fn set_clock(&self, kilohertz: u32) -> Result<u32> {
        self.inner.set_clock(kilohertz)
    }

    fn set_bus_width(&self, width: BusWidth) -> Result<()> {
        self.inner.set_bus_width(width)
    }

    fn set_scan_signal(&self, signal: Arc<ScanSignal>) {
        self.inner.set_scan_signal(signal)
    }
}

impl Drop for SdhciBus {
    fn drop(&mut self) {
        let regs = self.inner.regs();
        regs.set_signal_enable(0);
        regs.set_int_enable(0);
        if let Some(irq) = self.inner.irq {
            self.inner.platform.remove_interrupt_handler(irq);
        }
        self.inner.polling.store(false, Ordering::Release);
        if let Some(poller) = self.poller.take() {
            poller.join();
        }
        log::debug!("SDHCI: Slot shut down");
    }
}
