//! SDHCI Register Definitions using tock-registers
//!
//! This module defines the standard SDHCI (SD Host Controller Interface)
//! registers and bitfields as specified in the SD Host Controller Simplified
//! Specification, using type-safe tock-registers, plus [`SdhciRegs`], a typed
//! view over a [`RegisterIo`] window.

use tock_registers::fields::FieldValue;
use tock_registers::{LocalRegisterCopy, register_bitfields};

use crate::drivers::mmio::RegisterIo;

// ============================================================================
// Register Offsets
// ============================================================================

/// SDMA System Address / Argument 2
pub const SDHCI_DMA_ADDRESS: usize = 0x00;

/// Block Size Register
pub const SDHCI_BLOCK_SIZE: usize = 0x04;

/// Block Count Register
pub const SDHCI_BLOCK_COUNT: usize = 0x06;

/// Argument Register
pub const SDHCI_ARGUMENT: usize = 0x08;

/// Transfer Mode Register
pub const SDHCI_TRANSFER_MODE: usize = 0x0C;

/// Command Register
pub const SDHCI_COMMAND: usize = 0x0E;

/// Response Register (4 DWORDs: 0x10, 0x14, 0x18, 0x1C)
pub const SDHCI_RESPONSE: usize = 0x10;

/// Present State Register
pub const SDHCI_PRESENT_STATE: usize = 0x24;

/// Host Control Register
pub const SDHCI_HOST_CONTROL: usize = 0x28;

/// Power Control Register
pub const SDHCI_POWER_CONTROL: usize = 0x29;

/// Clock Control Register
pub const SDHCI_CLOCK_CONTROL: usize = 0x2C;

/// Timeout Control Register
pub const SDHCI_TIMEOUT_CONTROL: usize = 0x2E;

/// Software Reset Register
pub const SDHCI_SOFTWARE_RESET: usize = 0x2F;

/// Normal/Error Interrupt Status Register
pub const SDHCI_INT_STATUS: usize = 0x30;

/// Interrupt Status Enable Register
pub const SDHCI_INT_ENABLE: usize = 0x34;

/// Interrupt Signal Enable Register
pub const SDHCI_SIGNAL_ENABLE: usize = 0x38;

/// Capabilities Register
pub const SDHCI_CAPABILITIES: usize = 0x40;

/// Capabilities Register 1 (upper 32 bits)
pub const SDHCI_CAPABILITIES_1: usize = 0x44;

/// Host Controller Version Register
pub const SDHCI_HOST_VERSION: usize = 0xFE;

/// Size of the register window
pub const SDHCI_REGISTER_SIZE: usize = 0x100;

// ============================================================================
// Register Bitfield Definitions
// ============================================================================

register_bitfields! [
    u32,
    /// Present State Register (0x24)
    pub PRESENT_STATE [
        /// Command Inhibit (CMD)
        CMD_INHIBIT OFFSET(0) NUMBITS(1) [],
        /// Command Inhibit (DAT)
        DAT_INHIBIT OFFSET(1) NUMBITS(1) [],
        /// DAT Line Active
        DAT_ACTIVE OFFSET(2) NUMBITS(1) [],
        /// Card Inserted
        CARD_INSERTED OFFSET(16) NUMBITS(1) [],
        /// Card State Stable
        CARD_STABLE OFFSET(17) NUMBITS(1) [],
        /// Card Detect Pin Level
        CARD_DETECT_PIN OFFSET(18) NUMBITS(1) [],
        /// Write Protect Switch Pin Level
        WRITE_PROTECT OFFSET(19) NUMBITS(1) []
    ],

    /// Interrupt Status / Status Enable / Signal Enable (0x30, 0x34, 0x38)
    pub INT_STATUS [
        CMD_COMPLETE OFFSET(0) NUMBITS(1) [],
        TRANSFER_COMPLETE OFFSET(1) NUMBITS(1) [],
        BLOCK_GAP OFFSET(2) NUMBITS(1) [],
        DMA_INT OFFSET(3) NUMBITS(1) [],
        BUFFER_WRITE_READY OFFSET(4) NUMBITS(1) [],
        BUFFER_READ_READY OFFSET(5) NUMBITS(1) [],
        CARD_INSERT OFFSET(6) NUMBITS(1) [],
        CARD_REMOVE OFFSET(7) NUMBITS(1) [],
        CARD_INT OFFSET(8) NUMBITS(1) [],
        /// Summary of bits 16..32; read-only
        ERROR OFFSET(15) NUMBITS(1) [],
        CMD_TIMEOUT OFFSET(16) NUMBITS(1) [],
        CMD_CRC OFFSET(17) NUMBITS(1) [],
        CMD_END_BIT OFFSET(18) NUMBITS(1) [],
        CMD_INDEX OFFSET(19) NUMBITS(1) [],
        DATA_TIMEOUT OFFSET(20) NUMBITS(1) [],
        DATA_CRC OFFSET(21) NUMBITS(1) [],
        DATA_END_BIT OFFSET(22) NUMBITS(1) [],
        /// Current limit error
        BUS_POWER OFFSET(23) NUMBITS(1) [],
        AUTO_CMD OFFSET(24) NUMBITS(1) [],
        ADMA OFFSET(25) NUMBITS(1) []
    ],

    /// Capabilities Register (0x40)
    pub CAPABILITIES [
        /// Timeout Clock Frequency
        TIMEOUT_CLOCK OFFSET(0) NUMBITS(6) [],
        /// Base Clock Frequency in MHz (6 bits before 3.0, 8 bits since)
        BASE_CLOCK OFFSET(8) NUMBITS(8) [],
        /// Max Block Length
        MAX_BLOCK_LEN OFFSET(16) NUMBITS(2) [],
        /// 8-bit Support For Embedded Device
        BUS_8BIT OFFSET(18) NUMBITS(1) [],
        ADMA2 OFFSET(19) NUMBITS(1) [],
        HIGH_SPEED OFFSET(21) NUMBITS(1) [],
        SDMA OFFSET(22) NUMBITS(1) [],
        SUSPEND_RESUME OFFSET(23) NUMBITS(1) [],
        VOLTAGE_3V3 OFFSET(24) NUMBITS(1) [],
        VOLTAGE_3V0 OFFSET(25) NUMBITS(1) [],
        VOLTAGE_1V8 OFFSET(26) NUMBITS(1) [],
        SYSTEM_BUS_64BIT OFFSET(28) NUMBITS(1) []
    ]
];

register_bitfields! [
    u16,
    /// Block Size Register (0x04)
    pub BLOCK_SIZE [
        /// Transfer Block Size
        SIZE OFFSET(0) NUMBITS(12) [],
        /// SDMA Buffer Boundary (4K << n)
        SDMA_BOUNDARY OFFSET(12) NUMBITS(3) [
            Boundary4K = 0,
            Boundary512K = 7
        ]
    ],

    /// Transfer Mode Register (0x0C)
    pub TRANSFER_MODE [
        DMA_ENABLE OFFSET(0) NUMBITS(1) [],
        BLOCK_COUNT_ENABLE OFFSET(1) NUMBITS(1) [],
        AUTO_CMD12 OFFSET(2) NUMBITS(1) [],
        /// 1 = card to host
        READ OFFSET(4) NUMBITS(1) [],
        MULTI_BLOCK OFFSET(5) NUMBITS(1) []
    ],

    /// Command Register (0x0E)
    pub COMMAND [
        RESPONSE_TYPE OFFSET(0) NUMBITS(2) [
            NoResponse = 0,
            Long136 = 1,
            Short48 = 2,
            Short48Busy = 3
        ],
        CRC_CHECK OFFSET(3) NUMBITS(1) [],
        INDEX_CHECK OFFSET(4) NUMBITS(1) [],
        DATA_PRESENT OFFSET(5) NUMBITS(1) [],
        TYPE OFFSET(6) NUMBITS(2) [
            Normal = 0,
            Abort = 3
        ],
        INDEX OFFSET(8) NUMBITS(6) []
    ],

    /// Clock Control Register (0x2C)
    pub CLOCK_CONTROL [
        INTERNAL_CLOCK_ENABLE OFFSET(0) NUMBITS(1) [],
        INTERNAL_CLOCK_STABLE OFFSET(1) NUMBITS(1) [],
        SD_CLOCK_ENABLE OFFSET(2) NUMBITS(1) [],
        /// PLL enable (SDHCI 4.10)
        PLL_ENABLE OFFSET(3) NUMBITS(1) [],
        /// Upper bits of the 10-bit divider (SDHCI 3.0+)
        DIVIDER_HI OFFSET(6) NUMBITS(2) [],
        /// SDCLK Frequency Select
        DIVIDER OFFSET(8) NUMBITS(8) []
    ],

    /// Host Controller Version (0xFE)
    pub HOST_VERSION [
        SPEC_VERSION OFFSET(0) NUMBITS(8) [],
        VENDOR_VERSION OFFSET(8) NUMBITS(8) []
    ]
];

register_bitfields! [
    u8,
    /// Host Control Register (0x28)
    pub HOST_CONTROL [
        LED OFFSET(0) NUMBITS(1) [],
        /// 4-bit data transfer width
        DATA_WIDTH_4BIT OFFSET(1) NUMBITS(1) [],
        HIGH_SPEED OFFSET(2) NUMBITS(1) [],
        DMA_SELECT OFFSET(3) NUMBITS(2) [
            Sdma = 0,
            Adma32 = 2
        ],
        /// 8-bit data transfer width
        DATA_WIDTH_8BIT OFFSET(5) NUMBITS(1) []
    ],

    /// Power Control Register (0x29)
    pub POWER_CONTROL [
        BUS_POWER OFFSET(0) NUMBITS(1) [],
        BUS_VOLTAGE OFFSET(1) NUMBITS(3) [
            V1_8 = 5,
            V3_0 = 6,
            V3_3 = 7
        ]
    ],

    /// Software Reset Register (0x2F)
    pub SOFTWARE_RESET [
        RESET_ALL OFFSET(0) NUMBITS(1) [],
        RESET_CMD OFFSET(1) NUMBITS(1) [],
        RESET_DATA OFFSET(2) NUMBITS(1) []
    ]
];

// ============================================================================
// Interrupt groups
// ============================================================================

pub const SDHCI_INT_CMD_COMPLETE: u32 = 1 << 0;
pub const SDHCI_INT_TRANSFER_COMPLETE: u32 = 1 << 1;
pub const SDHCI_INT_CARD_INSERT: u32 = 1 << 6;
pub const SDHCI_INT_CARD_REMOVE: u32 = 1 << 7;
pub const SDHCI_INT_ERROR: u32 = 1 << 15;
pub const SDHCI_INT_CMD_TIMEOUT: u32 = 1 << 16;
pub const SDHCI_INT_CMD_CRC: u32 = 1 << 17;
pub const SDHCI_INT_DATA_TIMEOUT: u32 = 1 << 20;
pub const SDHCI_INT_DATA_CRC: u32 = 1 << 21;
pub const SDHCI_INT_BUS_POWER: u32 = 1 << 23;

/// All error bits (16..32)
pub const SDHCI_INT_ERROR_MASK: u32 = 0xFFFF_0000;

/// Errors that terminate a command or transfer
pub const SDHCI_INT_COMPLETION_ERRORS: u32 = SDHCI_INT_ERROR_MASK & !SDHCI_INT_BUS_POWER;

/// Everything the completion waiter cares about
pub const SDHCI_INT_COMPLETION_MASK: u32 =
    SDHCI_INT_CMD_COMPLETE | SDHCI_INT_TRANSFER_COMPLETE | SDHCI_INT_COMPLETION_ERRORS;

pub const SDHCI_INT_TIMEOUT_MASK: u32 = SDHCI_INT_CMD_TIMEOUT | SDHCI_INT_DATA_TIMEOUT;
pub const SDHCI_INT_CRC_MASK: u32 = SDHCI_INT_CMD_CRC | SDHCI_INT_DATA_CRC;
pub const SDHCI_INT_CARD_DETECT_MASK: u32 = SDHCI_INT_CARD_INSERT | SDHCI_INT_CARD_REMOVE;

/// Interrupts enabled right after reset
pub const SDHCI_INT_BASE_ENABLE: u32 = SDHCI_INT_COMPLETION_MASK | SDHCI_INT_BUS_POWER;

// ============================================================================
// Misc constants
// ============================================================================

/// SDHCI Specification Version 3.00 (value of SPEC_VERSION)
pub const SDHCI_SPEC_300: u8 = 2;

/// Maximum divider for SDHCI 2.0 (8-bit, powers of 2)
pub const SDHCI_MAX_DIV_SPEC_200: u32 = 256;

/// Maximum divider for SDHCI 3.0+ (10-bit, SD clock = base / 2N)
pub const SDHCI_MAX_DIV_SPEC_300: u32 = 2046;

/// SDMA buffer boundary (512KB)
pub const SDHCI_DEFAULT_BOUNDARY_SIZE: u64 = 512 * 1024;

/// Transfer block size
pub const SDHCI_BLOCK_LEN: usize = 512;

/// Register value, read or about to be written, with its bitfield layout
pub type Snapshot<T, R> = LocalRegisterCopy<T, R>;

/// Typed view over the controller registers
///
/// Each accessor is one volatile access of the width the register has.
#[derive(Clone, Copy)]
pub struct SdhciRegs<'a> {
    io: &'a dyn RegisterIo,
}

impl<'a> SdhciRegs<'a> {
    pub fn new(io: &'a dyn RegisterIo) -> Self {
        Self { io }
    }

    pub fn present_state(&self) -> Snapshot<u32, PRESENT_STATE::Register> {
        LocalRegisterCopy::new(self.io.read32(SDHCI_PRESENT_STATE))
    }

    pub fn capabilities(&self) -> Snapshot<u32, CAPABILITIES::Register> {
        LocalRegisterCopy::new(self.io.read32(SDHCI_CAPABILITIES))
    }

    /// Specification version (0 = 1.00, 1 = 2.00, 2 = 3.00, ...)
    pub fn spec_version(&self) -> u8 {
        let version: Snapshot<u16, HOST_VERSION::Register> =
            LocalRegisterCopy::new(self.io.read16(SDHCI_HOST_VERSION));
        version.read(HOST_VERSION::SPEC_VERSION) as u8
    }

    pub fn int_status(&self) -> u32 {
        self.io.read32(SDHCI_INT_STATUS)
    }

    /// Write-1-to-clear the given status bits
    pub fn ack(&self, bits: u32) {
        self.io.write32(SDHCI_INT_STATUS, bits);
    }

    pub fn int_enable(&self) -> u32 {
        self.io.read32(SDHCI_INT_ENABLE)
    }

    pub fn set_int_enable(&self, mask: u32) {
        self.io.write32(SDHCI_INT_ENABLE, mask);
    }

    pub fn signal_enable(&self) -> u32 {
        self.io.read32(SDHCI_SIGNAL_ENABLE)
    }

    pub fn set_signal_enable(&self, mask: u32) {
        self.io.write32(SDHCI_SIGNAL_ENABLE, mask);
    }

    pub fn write_argument(&self, argument: u32) {
        self.io.write32(SDHCI_ARGUMENT, argument);
    }

    /// Writing the command register starts the command
    pub fn write_command(&self, command: FieldValue<u16, COMMAND::Register>) {
        self.io.write16(SDHCI_COMMAND, command.value);
    }

    pub fn response(&self, index: usize) -> u32 {
        self.io.read32(SDHCI_RESPONSE + index * 4)
    }

    pub fn set_dma_address(&self, address: u32) {
        self.io.write32(SDHCI_DMA_ADDRESS, address);
    }

    pub fn set_block_size(&self, value: FieldValue<u16, BLOCK_SIZE::Register>) {
        self.io.write16(SDHCI_BLOCK_SIZE, value.value);
    }

    pub fn set_block_count(&self, count: u16) {
        self.io.write16(SDHCI_BLOCK_COUNT, count);
    }

    pub fn set_transfer_mode(&self, mode: FieldValue<u16, TRANSFER_MODE::Register>) {
        self.io.write16(SDHCI_TRANSFER_MODE, mode.value);
    }

    pub fn clock_control(&self) -> Snapshot<u16, CLOCK_CONTROL::Register> {
        LocalRegisterCopy::new(self.io.read16(SDHCI_CLOCK_CONTROL))
    }

    pub fn set_clock_control(&self, value: Snapshot<u16, CLOCK_CONTROL::Register>) {
        self.io.write16(SDHCI_CLOCK_CONTROL, value.get());
    }

    pub fn host_control(&self) -> Snapshot<u8, HOST_CONTROL::Register> {
        LocalRegisterCopy::new(self.io.read8(SDHCI_HOST_CONTROL))
    }

    pub fn set_host_control(&self, value: Snapshot<u8, HOST_CONTROL::Register>) {
        self.io.write8(SDHCI_HOST_CONTROL, value.get());
    }

    pub fn power_control(&self) -> Snapshot<u8, POWER_CONTROL::Register> {
        LocalRegisterCopy::new(self.io.read8(SDHCI_POWER_CONTROL))
    }

    pub fn set_power_control(&self, value: FieldValue<u8, POWER_CONTROL::Register>) {
        self.io.write8(SDHCI_POWER_CONTROL, value.value);
    }

    pub fn power_off(&self) {
        self.io.write8(SDHCI_POWER_CONTROL, 0);
    }

    pub fn set_timeout_control(&self, value: u8) {
        self.io.write8(SDHCI_TIMEOUT_CONTROL, value);
    }

    pub fn start_reset(&self, mask: FieldValue<u8, SOFTWARE_RESET::Register>) {
        self.io.write8(SDHCI_SOFTWARE_RESET, mask.value);
    }

    /// Reset bits still set (cleared by hardware on completion)
    pub fn reset_pending(&self, mask: FieldValue<u8, SOFTWARE_RESET::Register>) -> bool {
        self.io.read8(SDHCI_SOFTWARE_RESET) & mask.value != 0
    }
}
