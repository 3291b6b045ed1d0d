//! Command register encoding
//!
//! Maps an SD opcode and its reply format onto the SDHCI command and
//! transfer-mode registers.

use tock_registers::fields::FieldValue;

use super::regs::{COMMAND, TRANSFER_MODE};
use crate::drivers::mmc::command::{
    DataDirection, ReplyFlags, ReplySize, ReplyType, SD_STOP_TRANSMISSION,
};

/// Command register value for `opcode`
pub fn encode_command(
    opcode: u8,
    reply: ReplyType,
    flags: ReplyFlags,
) -> FieldValue<u16, COMMAND::Register> {
    let mut value = COMMAND::INDEX.val(opcode as u16 & 0x3F);

    value += match reply.size() {
        ReplySize::None => COMMAND::RESPONSE_TYPE::NoResponse,
        ReplySize::Bits136 => COMMAND::RESPONSE_TYPE::Long136,
        ReplySize::Bits48 if reply.is_busy() => COMMAND::RESPONSE_TYPE::Short48Busy,
        ReplySize::Bits48 => COMMAND::RESPONSE_TYPE::Short48,
    };
    if reply.has_crc() {
        value += COMMAND::CRC_CHECK::SET;
    }
    if reply.has_index() {
        value += COMMAND::INDEX_CHECK::SET;
    }
    if flags.contains(ReplyFlags::DATA_PRESENT) {
        value += COMMAND::DATA_PRESENT::SET;
    }
    if opcode == SD_STOP_TRANSMISSION {
        value += COMMAND::TYPE::Abort;
    }
    value
}

/// Transfer mode for an SDMA block transfer
pub fn encode_transfer_mode(
    direction: DataDirection,
    multi_block: bool,
) -> FieldValue<u16, TRANSFER_MODE::Register> {
    let mut mode = TRANSFER_MODE::DMA_ENABLE::SET + TRANSFER_MODE::BLOCK_COUNT_ENABLE::SET;
    if multi_block {
        mode += TRANSFER_MODE::MULTI_BLOCK::SET + TRANSFER_MODE::AUTO_CMD12::SET;
    }
    if direction == DataDirection::Read {
        mode += TRANSFER_MODE::READ::SET;
    }
    mode
}
