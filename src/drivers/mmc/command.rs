//! SD command set
//!
//! Opcodes used by the bus manager and the disk driver, and the reply each
//! opcode produces. The reply type is a property of the opcode alone, so
//! hosts look it up here instead of having callers pass it in.

use bitflags::bitflags;

// ============================================================================
// Opcodes
// ============================================================================

/// GO_IDLE_STATE - Resets all cards to idle state
pub const SD_GO_IDLE_STATE: u8 = 0;

/// ALL_SEND_CID - Asks all cards to send their CID
pub const SD_ALL_SEND_CID: u8 = 2;

/// SEND_RELATIVE_ADDR - Ask card to publish a new RCA
pub const SD_SEND_RELATIVE_ADDR: u8 = 3;

/// SET_BUS_WIDTH (ACMD6)
pub const SD_SET_BUS_WIDTH: u8 = 6;

/// SELECT/DESELECT_CARD - Toggles card between stand-by and transfer states
pub const SD_SELECT_DESELECT_CARD: u8 = 7;

/// SEND_IF_COND - Sends SD interface condition
pub const SD_SEND_IF_COND: u8 = 8;

/// SEND_CSD - Asks card to send its CSD
pub const SD_SEND_CSD: u8 = 9;

/// STOP_TRANSMISSION - Forces card to stop transmission
pub const SD_STOP_TRANSMISSION: u8 = 12;

/// SEND_STATUS - Asks card to send its status
pub const SD_SEND_STATUS: u8 = 13;

/// SET_BLOCKLEN - Sets block length for block commands
pub const SD_SET_BLOCKLEN: u8 = 16;

/// READ_SINGLE_BLOCK
pub const SD_READ_SINGLE_BLOCK: u8 = 17;

/// READ_MULTIPLE_BLOCK - Reads blocks until STOP_TRANSMISSION
pub const SD_READ_MULTIPLE_BLOCKS: u8 = 18;

/// WRITE_SINGLE_BLOCK
pub const SD_WRITE_SINGLE_BLOCK: u8 = 24;

/// WRITE_MULTIPLE_BLOCK - Writes blocks until STOP_TRANSMISSION
pub const SD_WRITE_MULTIPLE_BLOCKS: u8 = 25;

/// ERASE_WR_BLK_START - First block of the erase range
pub const SD_ERASE_WR_BLK_START: u8 = 32;

/// ERASE_WR_BLK_END - Last block of the erase range
pub const SD_ERASE_WR_BLK_END: u8 = 33;

/// ERASE - Erases the selected range
pub const SD_ERASE: u8 = 38;

/// SD_SEND_OP_COND (ACMD41) - Sends host capacity support info
pub const SD_SEND_OP_COND: u8 = 41;

/// APP_CMD - Next command is application specific
pub const SD_APP_CMD: u8 = 55;

// ============================================================================
// Argument / response fields
// ============================================================================

/// CMD8 argument: 2.7-3.6V supply, check pattern 0xAA
pub const SD_IF_COND_ARGUMENT: u32 = 0x1AA;

/// Bits of the R7 reply echoing the CMD8 argument
pub const SD_IF_COND_ECHO_MASK: u32 = 0xFFF;

/// OCR: power-up complete (card ready)
pub const OCR_READY: u32 = 1 << 31;

/// OCR: Card Capacity Status in replies, Host Capacity Support in requests
pub const OCR_CCS: u32 = 1 << 30;

/// OCR: UHS-II card status
pub const OCR_UHS2: u32 = 1 << 29;

/// OCR: 2.7V - 3.6V voltage window
pub const OCR_VOLTAGE_WINDOW: u32 = 0x00FF_8000;

/// ACMD6 argument selecting a 4-bit bus
pub const SD_BUS_WIDTH_4: u32 = 2;

/// R6 card-status bits: CURRENT_STATE (12:9) and READY_FOR_DATA (8)
pub const R6_STATE_MASK: u32 = 0x1F00;

/// R6 card status after CMD3: identification state, ready for data
pub const R6_IDENT_READY: u32 = 0x0500;

// ============================================================================
// Reply types
// ============================================================================

/// Response format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyType {
    None,
    /// Normal card status
    R1,
    /// R1 with busy signalled on DAT0
    R1b,
    /// CID/CSD (136 bits)
    R2,
    /// OCR, no CRC
    R3,
    /// Published RCA
    R6,
    /// Interface condition
    R7,
}

/// How many response bits the controller captures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySize {
    None,
    Bits48,
    Bits136,
}

impl ReplyType {
    pub fn size(self) -> ReplySize {
        match self {
            ReplyType::None => ReplySize::None,
            ReplyType::R2 => ReplySize::Bits136,
            _ => ReplySize::Bits48,
        }
    }

    pub fn is_busy(self) -> bool {
        self == ReplyType::R1b
    }

    /// Whether the response carries a valid CRC7
    pub fn has_crc(self) -> bool {
        !matches!(self, ReplyType::None | ReplyType::R3)
    }

    /// Whether the response echoes the command index
    pub fn has_index(self) -> bool {
        matches!(
            self,
            ReplyType::R1 | ReplyType::R1b | ReplyType::R6 | ReplyType::R7
        )
    }
}

bitflags! {
    /// Command properties beyond the reply format
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReplyFlags: u8 {
        /// A data block transfer follows the command
        const DATA_PRESENT = 1 << 0;
        /// 32-bit response; the command uses the DAT line, so it must not
        /// be issued while the data line is inhibited
        const CHECK_BUSY = 1 << 1;
    }
}

/// Reply format of `opcode`, or `None` for opcodes the stack never issues
pub fn reply_for(opcode: u8) -> Option<(ReplyType, ReplyFlags)> {
    let data = ReplyFlags::DATA_PRESENT | ReplyFlags::CHECK_BUSY;
    let reply = match opcode {
        SD_GO_IDLE_STATE => (ReplyType::None, ReplyFlags::empty()),
        SD_ALL_SEND_CID | SD_SEND_CSD => (ReplyType::R2, ReplyFlags::empty()),
        SD_SEND_RELATIVE_ADDR => (ReplyType::R6, ReplyFlags::empty()),
        SD_SET_BUS_WIDTH | SD_SEND_STATUS | SD_SET_BLOCKLEN | SD_APP_CMD => {
            (ReplyType::R1, ReplyFlags::empty())
        }
        SD_ERASE_WR_BLK_START | SD_ERASE_WR_BLK_END => (ReplyType::R1, ReplyFlags::empty()),
        SD_SELECT_DESELECT_CARD | SD_STOP_TRANSMISSION | SD_ERASE => {
            (ReplyType::R1b, ReplyFlags::CHECK_BUSY)
        }
        SD_SEND_IF_COND => (ReplyType::R7, ReplyFlags::empty()),
        SD_READ_SINGLE_BLOCK | SD_READ_MULTIPLE_BLOCKS => (ReplyType::R1, data),
        SD_WRITE_SINGLE_BLOCK | SD_WRITE_MULTIPLE_BLOCKS => (ReplyType::R1, data),
        SD_SEND_OP_COND => (ReplyType::R3, ReplyFlags::empty()),
        _ => return None,
    };
    Some(reply)
}

/// Direction of a block data command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    Read,
    Write,
}

/// Direction and multi-block flag of a data opcode
pub fn data_direction(opcode: u8) -> Option<(DataDirection, bool)> {
    match opcode {
        SD_READ_SINGLE_BLOCK => Some((DataDirection::Read, false)),
        SD_READ_MULTIPLE_BLOCKS => Some((DataDirection::Read, true)),
        SD_WRITE_SINGLE_BLOCK => Some((DataDirection::Write, false)),
        SD_WRITE_MULTIPLE_BLOCKS => Some((DataDirection::Write, true)),
        _ => None,
    }
}

/// Commands only accepted in the transfer state (card selected)
pub fn needs_transfer_state(opcode: u8) -> bool {
    matches!(
        opcode,
        SD_SET_BUS_WIDTH
            | SD_STOP_TRANSMISSION
            | SD_SET_BLOCKLEN
            | SD_READ_SINGLE_BLOCK
            | SD_READ_MULTIPLE_BLOCKS
            | SD_WRITE_SINGLE_BLOCK
            | SD_WRITE_MULTIPLE_BLOCKS
            | SD_ERASE_WR_BLK_START
            | SD_ERASE_WR_BLK_END
            | SD_ERASE
    )
}

/// Commands only accepted in the stand-by state (card deselected)
pub fn needs_standby_state(opcode: u8) -> bool {
    opcode == SD_SEND_CSD
}
