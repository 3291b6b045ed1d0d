//! Simulated SDHCI slot with SD cards behind it
//!
//! Implements [`RegisterIo`] on top of a register file and a small SD card
//! state machine, so the controller and bus layers can be exercised without
//! hardware. DMA goes through [`StdPlatform::resolve`]. Interrupts are
//! delivered synchronously after a command write, as a level-triggered
//! line would fire once the status latches.

use std::sync::{Arc, Mutex, MutexGuard};
use std::vec::Vec;

use super::regs::*;
use crate::drivers::mmc::command::*;
use crate::drivers::mmio::RegisterIo;
use crate::platform::test_support::StdPlatform;

/// Version 3.00, 200 MHz base clock, 3.3 V and 1.8 V, SDMA
pub const DEFAULT_CAPS: u32 = (200 << 8) | (1 << 22) | (1 << 24) | (1 << 26);
pub const SIM_MEMORY: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Idle,
    Ready,
    Ident,
    Stby,
    Tran,
}

/// One SD card on the simulated bus
#[derive(Clone)]
pub struct SimCard {
    pub state: CardState,
    pub rca: u16,
    pub cid: u128,
    pub csd: u128,
    pub high_capacity: bool,
    pub uhs2: bool,
    /// `None`: CMD8 times out (version 1.x card)
    pub if_cond_echo: Option<u32>,
    /// ACMD41 polls answered busy before the card reports ready
    pub ready_after: u32,
    /// Card status bits returned in the R6 reply
    pub r6_status: u32,
    pub bus_width_arg: Option<u32>,
    polls: u32,
    app_pending: bool,
    erase_start: u32,
    erase_end: u32,
    pub memory: Vec<u8>,
}

/// 16 CID bytes as the card sends them (MID first, CRC last)
pub fn cid_bytes(
    mid: u8,
    oid: [u8; 2],
    pnm: &[u8; 5],
    prv: u8,
    psn: u32,
    year: u16,
    month: u8,
) -> [u8; 16] {
    let mdt = (((year - 2000) & 0xFF) << 4) | (month as u16 & 0xF);
    let psn = psn.to_be_bytes();
    let mdt = mdt.to_be_bytes();
    [
        mid, oid[0], oid[1], pnm[0], pnm[1], pnm[2], pnm[3], pnm[4], prv, psn[0], psn[1], psn[2],
        psn[3], mdt[0], mdt[1], 0x01,
    ]
}

/// CSD version 2.0 with the given C_SIZE
pub fn csd_v2(c_size: u32) -> u128 {
    (1u128 << 126) | (9u128 << 80) | ((c_size as u128 & 0x3F_FFFF) << 48) | 1
}

/// CSD version 1.0
pub fn csd_v1(read_bl_len: u8, c_size: u16, c_size_mult: u8) -> u128 {
    ((read_bl_len as u128 & 0xF) << 80)
        | ((c_size as u128 & 0xFFF) << 62)
        | ((c_size_mult as u128 & 0x7) << 47)
        | 1
}

impl SimCard {
    fn base(rca: u16, cid: u128, csd: u128) -> Self {
        Self {
            state: CardState::Idle,
            rca,
            cid,
            csd,
            high_capacity: false,
            uhs2: false,
            if_cond_echo: Some(SD_IF_COND_ARGUMENT),
            ready_after: 1,
            r6_status: R6_IDENT_READY,
            bus_width_arg: None,
            polls: 0,
            app_pending: false,
            erase_start: 0,
            erase_end: 0,
            memory: vec![0; SIM_MEMORY],
        }
    }

    /// Block-addressed SDHC card, "SD08G", 2021-03
    pub fn sdhc(rca: u16) -> Self {
        let cid = u128::from_be_bytes(cid_bytes(
            0x03,
            *b"SD",
            b"SD08G",
            0x80,
            0x1234_5678,
            2021,
            3,
        ));
        let mut card = Self::base(rca, cid, csd_v2(0x3B37));
        card.high_capacity = true;
        card
    }

    /// Byte-addressed 1 MiB legacy card without CMD8 support
    pub fn legacy(rca: u16) -> Self {
        let cid = u128::from_be_bytes(cid_bytes(
            0x1B,
            *b"SM",
            b"OLD01",
            0x10,
            0x0000_0042,
            2008,
            11,
        ));
        let mut card = Self::base(rca, cid, csd_v1(9, 3, 7));
        card.if_cond_echo = None;
        card
    }

    fn long(value: u128) -> [u32; 4] {
        let v = value >> 8;
        [v as u32, (v >> 32) as u32, (v >> 64) as u32, (v >> 96) as u32]
    }

    fn byte_address(&self, argument: u32) -> usize {
        if self.high_capacity {
            argument as usize * 512
        } else {
            argument as usize
        }
    }
}

/// One DMA transfer as issued by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimTransfer {
    pub opcode: u8,
    pub phys: u32,
    pub len: usize,
    pub argument: u32,
    pub mode: u16,
    pub block_size: u16,
}

pub struct SimState {
    pub version: u8,
    pub caps: u32,
    pub int_status: u32,
    pub int_enable: u32,
    pub signal_enable: u32,
    pub argument: u32,
    pub response: [u32; 4],
    pub dma_address: u32,
    pub block_size: u16,
    pub block_count: u16,
    pub transfer_mode: u16,
    pub clock: u16,
    pub host_control: u8,
    pub power: u8,
    pub timeout_control: u8,

    pub cards: Vec<SimCard>,
    pub card_inserted: bool,

    pub force_cmd_inhibit: bool,
    pub force_dat_inhibit: bool,
    /// CMD_INHIBIT stays set after the next command until a CMD reset
    pub stick_cmd_line: bool,
    cmd_stuck: bool,
    /// Error status latched by the next command instead of its completion
    pub inject_error: Option<u32>,
    /// Commands never complete
    pub silent: bool,
    pub clock_never_stable: bool,
    /// Returned for every INT_STATUS read when set
    pub status_override: Option<u32>,

    pub writes: Vec<(usize, u32)>,
    pub commands: Vec<(u8, u32)>,
    pub transfers: Vec<SimTransfer>,
    pub resets: Vec<u8>,
    pub power_writes: Vec<u8>,
    pub clock_writes: Vec<u16>,
}

impl SimState {
    fn present_state(&self) -> u32 {
        let mut state = 0;
        if self.card_inserted {
            state |= (1 << 16) | (1 << 17) | (1 << 18);
        }
        if self.force_cmd_inhibit || self.cmd_stuck {
            state |= 1;
        }
        if self.force_dat_inhibit {
            state |= 1 << 1;
        }
        state
    }

    fn latch(&mut self, bits: u32) {
        self.int_status |= bits & self.int_enable;
    }

    fn pending_signal(&self) -> bool {
        self.int_status & self.signal_enable != 0
    }

    fn software_reset(&mut self, mask: u8) {
        if mask & 0x1 != 0 {
            self.int_status = 0;
            self.int_enable = 0;
            self.signal_enable = 0;
            self.clock = 0;
            self.power = 0;
            self.host_control = 0;
            self.cmd_stuck = false;
        }
        if mask & 0x2 != 0 {
            self.cmd_stuck = false;
        }
    }

    fn selected(&mut self) -> Option<&mut SimCard> {
        self.cards.iter_mut().find(|c| c.state == CardState::Tran)
    }

    fn run_command(&mut self, platform: &StdPlatform, command: u16) {
        let opcode = ((command >> 8) & 0x3F) as u8;
        let argument = self.argument;
        self.commands.push((opcode, argument));

        if self.silent {
            return;
        }
        if self.stick_cmd_line {
            self.stick_cmd_line = false;
            self.cmd_stuck = true;
        }
        if let Some(bits) = self.inject_error.take() {
            self.latch(bits);
            return;
        }

        let status = self.card_command(platform, opcode, argument, command);
        self.latch(status);
    }

    /// Run `opcode` on the cards; returns the interrupt status it raises
    fn card_command(&mut self, platform: &StdPlatform, opcode: u8, argument: u32, command: u16) -> u32 {
        const DONE: u32 = SDHCI_INT_CMD_COMPLETE;
        const DONE_BUSY: u32 = SDHCI_INT_CMD_COMPLETE | SDHCI_INT_TRANSFER_COMPLETE;
        const NO_REPLY: u32 = SDHCI_INT_CMD_TIMEOUT;

        if !self.card_inserted {
            return NO_REPLY;
        }
        let app = self.cards.iter().any(|c| c.app_pending);
        for card in self.cards.iter_mut() {
            card.app_pending = false;
        }

        match opcode {
            SD_GO_IDLE_STATE => {
                for card in self.cards.iter_mut() {
                    card.state = CardState::Idle;
                    card.polls = 0;
                }
                DONE
            }
            SD_SEND_IF_COND => {
                match self.cards.iter().find(|c| c.state == CardState::Idle) {
                    Some(card) => match card.if_cond_echo {
                        Some(echo) => {
                            self.response[0] = if echo == SD_IF_COND_ARGUMENT {
                                argument & SD_IF_COND_ECHO_MASK
                            } else {
                                echo
                            };
                            DONE
                        }
                        None => NO_REPLY,
                    },
                    None => NO_REPLY,
                }
            }
            SD_APP_CMD => {
                for card in self.cards.iter_mut() {
                    card.app_pending = true;
                }
                self.response[0] = 0x0000_0120;
                DONE
            }
            SD_SEND_OP_COND if app => {
                let mut all_ready = true;
                let mut ocr = OCR_VOLTAGE_WINDOW;
                let mut any = false;
                for card in self.cards.iter_mut() {
                    if !matches!(card.state, CardState::Idle | CardState::Ready) {
                        continue;
                    }
                    any = true;
                    card.polls += 1;
                    if card.polls > card.ready_after {
                        card.state = CardState::Ready;
                    } else {
                        all_ready = false;
                    }
                    if card.high_capacity && argument & OCR_CCS != 0 {
                        ocr |= OCR_CCS;
                    }
                    if card.uhs2 {
                        ocr |= OCR_UHS2;
                    }
                }
                if !any {
                    return NO_REPLY;
                }
                if all_ready {
                    ocr |= OCR_READY;
                }
                self.response[0] = ocr;
                DONE
            }
            SD_SET_BUS_WIDTH if app => match self.selected() {
                Some(card) => {
                    card.bus_width_arg = Some(argument);
                    self.response[0] = 0x0000_0920;
                    DONE
                }
                None => NO_REPLY,
            },
            SD_ALL_SEND_CID => {
                match self.cards.iter_mut().find(|c| c.state == CardState::Ready) {
                    Some(card) => {
                        card.state = CardState::Ident;
                        let cid = card.cid;
                        self.response = SimCard::long(cid);
                        DONE
                    }
                    None => NO_REPLY,
                }
            }
            SD_SEND_RELATIVE_ADDR => {
                match self.cards.iter_mut().find(|c| c.state == CardState::Ident) {
                    Some(card) => {
                        card.state = CardState::Stby;
                        self.response[0] = ((card.rca as u32) << 16) | card.r6_status;
                        DONE
                    }
                    None => NO_REPLY,
                }
            }
            SD_SELECT_DESELECT_CARD => {
                let rca = (argument >> 16) as u16;
                let known = self
                    .cards
                    .iter()
                    .any(|c| c.rca == rca && matches!(c.state, CardState::Stby | CardState::Tran));
                for card in self.cards.iter_mut() {
                    if card.state == CardState::Tran {
                        card.state = CardState::Stby;
                    }
                }
                if rca == 0 || !known {
                    // Deselected cards do not answer
                    return NO_REPLY;
                }
                for card in self.cards.iter_mut().filter(|c| c.rca == rca) {
                    card.state = CardState::Tran;
                }
                self.response[0] = 0x0000_0700;
                DONE_BUSY
            }
            SD_SEND_CSD => {
                let rca = (argument >> 16) as u16;
                match self
                    .cards
                    .iter()
                    .find(|c| c.rca == rca && c.state == CardState::Stby)
                {
                    Some(card) => {
                        self.response = SimCard::long(card.csd);
                        DONE
                    }
                    None => NO_REPLY,
                }
            }
            SD_SEND_STATUS | SD_SET_BLOCKLEN => {
                self.response[0] = 0x0000_0900;
                DONE
            }
            SD_STOP_TRANSMISSION => {
                self.response[0] = 0x0000_0900;
                DONE_BUSY
            }
            SD_ERASE_WR_BLK_START | SD_ERASE_WR_BLK_END => match self.selected() {
                Some(card) => {
                    if opcode == SD_ERASE_WR_BLK_START {
                        card.erase_start = argument;
                    } else {
                        card.erase_end = argument;
                    }
                    self.response[0] = 0x0000_0900;
                    DONE
                }
                None => NO_REPLY,
            },
            SD_ERASE => match self.selected() {
                Some(card) => {
                    let start = card.byte_address(card.erase_start);
                    let unit = if card.high_capacity { 512 } else { 1 };
                    let end = (card.byte_address(card.erase_end) + unit).min(card.memory.len());
                    if start < end {
                        card.memory[start..end].fill(0);
                    }
                    self.response[0] = 0x0000_0900;
                    DONE_BUSY
                }
                None => NO_REPLY,
            },
            SD_READ_SINGLE_BLOCK
            | SD_READ_MULTIPLE_BLOCKS
            | SD_WRITE_SINGLE_BLOCK
            | SD_WRITE_MULTIPLE_BLOCKS => {
                if command & (1 << 5) == 0 {
                    return SDHCI_INT_CMD_INDEX_ERROR;
                }
                let blocks = match opcode {
                    SD_READ_SINGLE_BLOCK | SD_WRITE_SINGLE_BLOCK => 1,
                    _ => self.block_count as usize,
                };
                let len = blocks * 512;
                let phys = self.dma_address;
                self.transfers.push(SimTransfer {
                    opcode,
                    phys,
                    len,
                    argument,
                    mode: self.transfer_mode,
                    block_size: self.block_size,
                });
                let read = matches!(opcode, SD_READ_SINGLE_BLOCK | SD_READ_MULTIPLE_BLOCKS);
                let Some(card) = self.cards.iter_mut().find(|c| c.state == CardState::Tran) else {
                    return NO_REPLY;
                };
                let start = card.byte_address(argument);
                let Some(host) = platform.resolve(phys as u64, len) else {
                    return SDHCI_INT_CMD_COMPLETE | SDHCI_INT_ADMA_ERROR;
                };
                if start + len > card.memory.len() {
                    return SDHCI_INT_CMD_COMPLETE | SDHCI_INT_DATA_TIMEOUT;
                }
                // SAFETY: `resolve` checked the range against a live allocation
                let host = unsafe { std::slice::from_raw_parts_mut(host, len) };
                if read {
                    host.copy_from_slice(&card.memory[start..start + len]);
                } else {
                    card.memory[start..start + len].copy_from_slice(host);
                }
                self.response[0] = 0x0000_0900;
                DONE_BUSY
            }
            _ => NO_REPLY,
        }
    }
}

const SDHCI_INT_CMD_INDEX_ERROR: u32 = 1 << 19;
const SDHCI_INT_ADMA_ERROR: u32 = 1 << 25;

/// The simulated controller
pub struct SimController {
    state: Mutex<SimState>,
    platform: Arc<StdPlatform>,
    irq: u32,
}

impl SimController {
    pub fn new(platform: Arc<StdPlatform>, irq: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState {
                version: SDHCI_SPEC_300,
                caps: DEFAULT_CAPS,
                int_status: 0,
                int_enable: 0,
                signal_enable: 0,
                argument: 0,
                response: [0; 4],
                dma_address: 0,
                block_size: 0,
                block_count: 0,
                transfer_mode: 0,
                clock: 0,
                host_control: 0,
                power: 0,
                timeout_control: 0,
                cards: Vec::new(),
                card_inserted: false,
                force_cmd_inhibit: false,
                force_dat_inhibit: false,
                stick_cmd_line: false,
                cmd_stuck: false,
                inject_error: None,
                silent: false,
                clock_never_stable: false,
                status_override: None,
                writes: Vec::new(),
                commands: Vec::new(),
                transfers: Vec::new(),
                resets: Vec::new(),
                power_writes: Vec::new(),
                clock_writes: Vec::new(),
            }),
            platform,
            irq,
        })
    }

    /// Controller with `cards` already inserted
    pub fn with_cards(platform: Arc<StdPlatform>, irq: u32, cards: Vec<SimCard>) -> Arc<Self> {
        let sim = Self::new(platform, irq);
        {
            let mut state = sim.state();
            state.card_inserted = !cards.is_empty();
            state.cards = cards;
        }
        sim
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn clear_records(&self) {
        let mut state = self.state();
        state.writes.clear();
        state.commands.clear();
        state.transfers.clear();
        state.resets.clear();
        state.power_writes.clear();
        state.clock_writes.clear();
    }

    pub fn commands(&self) -> Vec<(u8, u32)> {
        self.state().commands.clone()
    }

    pub fn transfers(&self) -> Vec<SimTransfer> {
        self.state().transfers.clone()
    }

    /// Offsets written since the last `clear_records`
    pub fn written_offsets(&self) -> Vec<usize> {
        self.state().writes.iter().map(|(o, _)| *o).collect()
    }

    pub fn insert_card(&self, card: SimCard) {
        let raise = {
            let mut state = self.state();
            state.cards.push(card);
            state.card_inserted = true;
            state.latch(SDHCI_INT_CARD_INSERT);
            state.pending_signal()
        };
        if raise {
            self.platform.raise(self.irq);
        }
    }

    pub fn remove_cards(&self) {
        let raise = {
            let mut state = self.state();
            state.cards.clear();
            state.card_inserted = false;
            state.latch(SDHCI_INT_CARD_REMOVE);
            state.pending_signal()
        };
        if raise {
            self.platform.raise(self.irq);
        }
    }
}

impl RegisterIo for SimController {
    fn read8(&self, offset: usize) -> u8 {
        let state = self.state();
        match offset {
            SDHCI_HOST_CONTROL => state.host_control,
            SDHCI_POWER_CONTROL => state.power,
            SDHCI_TIMEOUT_CONTROL => state.timeout_control,
            _ => 0,
        }
    }

    fn read16(&self, offset: usize) -> u16 {
        let state = self.state();
        match offset {
            SDHCI_CLOCK_CONTROL => {
                let mut clock = state.clock;
                if clock & 0x1 != 0 && !state.clock_never_stable {
                    clock |= 0x2;
                }
                clock
            }
            SDHCI_HOST_VERSION => state.version as u16,
            SDHCI_BLOCK_COUNT => state.block_count,
            _ => 0,
        }
    }

    fn read32(&self, offset: usize) -> u32 {
        let state = self.state();
        match offset {
            SDHCI_PRESENT_STATE => state.present_state(),
            SDHCI_INT_STATUS => {
                if let Some(status) = state.status_override {
                    return status;
                }
                let mut status = state.int_status;
                if status & SDHCI_INT_ERROR_MASK != 0 {
                    status |= SDHCI_INT_ERROR;
                }
                status
            }
            SDHCI_INT_ENABLE => state.int_enable,
            SDHCI_SIGNAL_ENABLE => state.signal_enable,
            SDHCI_CAPABILITIES => state.caps,
            SDHCI_CAPABILITIES_1 => 0,
            o if (SDHCI_RESPONSE..SDHCI_RESPONSE + 16).contains(&o) => {
                state.response[(o - SDHCI_RESPONSE) / 4]
            }
            _ => 0,
        }
    }

    fn write8(&self, offset: usize, value: u8) {
        let mut state = self.state();
        state.writes.push((offset, value as u32));
        match offset {
            SDHCI_HOST_CONTROL => state.host_control = value,
            SDHCI_POWER_CONTROL => {
                state.power = value;
                state.power_writes.push(value);
            }
            SDHCI_TIMEOUT_CONTROL => state.timeout_control = value,
            SDHCI_SOFTWARE_RESET => {
                state.resets.push(value);
                state.software_reset(value);
            }
            _ => {}
        }
    }

    fn write16(&self, offset: usize, value: u16) {
        let raise = {
            let mut state = self.state();
            state.writes.push((offset, value as u32));
            match offset {
                SDHCI_BLOCK_SIZE => state.block_size = value,
                SDHCI_BLOCK_COUNT => state.block_count = value,
                SDHCI_TRANSFER_MODE => state.transfer_mode = value,
                SDHCI_CLOCK_CONTROL => {
                    state.clock = value;
                    state.clock_writes.push(value);
                }
                SDHCI_COMMAND => state.run_command(&self.platform, value),
                _ => {}
            }
            offset == SDHCI_COMMAND && state.pending_signal()
        };
        if raise {
            self.platform.raise(self.irq);
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut state = self.state();
        state.writes.push((offset, value));
        match offset {
            SDHCI_DMA_ADDRESS => state.dma_address = value,
            SDHCI_ARGUMENT => state.argument = value,
            SDHCI_INT_STATUS => state.int_status &= !value,
            SDHCI_INT_ENABLE => state.int_enable = value,
            SDHCI_SIGNAL_ENABLE => state.signal_enable = value,
            _ => {}
        }
    }
}
