//! Error type shared by the SDHCI driver, the MMC bus and the disk front end

use core::fmt;

/// Errors surfaced by the command and block I/O primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Command or data line is occupied; retry later
    Busy,
    /// The controller reported a command or data timeout
    TimedOut,
    /// No completion arrived within the software wait limit
    Timeout,
    /// CRC mismatch on a response or data block
    BadValue,
    /// Hardware error not otherwise classified
    IoError,
    /// Unknown opcode or malformed request
    InvalidArgument,
    /// Allocation failed
    NoMemory,
    /// Missing or malformed data (device node attribute, CID/CSD contents)
    BadData,
    /// A caller broke the one-command-at-a-time contract or the card
    /// answered outside the enumeration protocol
    ProtocolViolation,
    /// No card in the slot
    NoCard,
    /// The bus or driver is being torn down
    ShuttingDown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::Busy => "device busy",
            Error::TimedOut => "hardware timeout",
            Error::Timeout => "wait timed out",
            Error::BadValue => "CRC error",
            Error::IoError => "I/O error",
            Error::InvalidArgument => "invalid argument",
            Error::NoMemory => "out of memory",
            Error::BadData => "bad data",
            Error::ProtocolViolation => "protocol violation",
            Error::NoCard => "no card present",
            Error::ShuttingDown => "shutting down",
        };
        f.write_str(msg)
    }
}

/// Result type used throughout the crate
pub type Result<T> = core::result::Result<T, Error>;
