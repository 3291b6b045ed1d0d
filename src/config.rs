//! Tunables for the host controller, the bus manager and the disk driver
//!
//! All defaults come from the named constants below. The `with_*` setters
//! exist mostly so tests and slow emulated controllers can shrink or stretch
//! the waits without touching driver code.

/// Command completion timeout (1 second)
pub const CMD_TIMEOUT_US: u64 = 1_000_000;

/// Data transfer completion timeout (5 seconds)
pub const DATA_TIMEOUT_US: u64 = 5_000_000;

/// Interval of the completion poller when no IRQ line is available
pub const POLL_INTERVAL_US: u64 = 100;

/// Bound for internal clock / PLL stabilization spin-waits (20 ms)
pub const CLOCK_STABLE_TIMEOUT_US: u64 = 20_000;

/// Bound for software reset completion (100 ms)
pub const RESET_TIMEOUT_US: u64 = 100_000;

/// Clock used during card identification
pub const IDENTIFICATION_CLOCK_KHZ: u32 = 400;

/// Default-speed transfer clock
pub const TRANSFER_CLOCK_KHZ: u32 = 25_000;

/// Number of ACMD41 polls before giving up on a card
pub const OCR_RETRY_LIMIT: u32 = 20;

/// Delay between ACMD41 polls while the card is still powering up
pub const OCR_BUSY_DELAY_US: u64 = 100_000;

/// Delay after CMD55 reported a busy (locked) card
pub const CARD_LOCKED_DELAY_US: u64 = 1_000_000;

/// How often the idle enumeration worker re-checks its scan signal
pub const SCAN_POLL_US: u64 = 1_000;

/// Size of the per-disk DMA bounce buffer
pub const BOUNCE_BUFFER_SIZE: usize = 64 * 1024;

/// SDHCI host controller settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdhciConfig {
    pub command_timeout_us: u64,
    pub data_timeout_us: u64,
    pub poll_interval_us: u64,
    pub clock_stable_timeout_us: u64,
    pub reset_timeout_us: u64,
    pub identification_clock_khz: u32,
}

impl Default for SdhciConfig {
    fn default() -> Self {
        Self {
            command_timeout_us: CMD_TIMEOUT_US,
            data_timeout_us: DATA_TIMEOUT_US,
            poll_interval_us: POLL_INTERVAL_US,
            clock_stable_timeout_us: CLOCK_STABLE_TIMEOUT_US,
            reset_timeout_us: RESET_TIMEOUT_US,
            identification_clock_khz: IDENTIFICATION_CLOCK_KHZ,
        }
    }
}

impl SdhciConfig {
    pub fn with_command_timeout_us(mut self, us: u64) -> Self {
        self.command_timeout_us = us;
        self
    }

    pub fn with_data_timeout_us(mut self, us: u64) -> Self {
        self.data_timeout_us = us;
        self
    }

    pub fn with_poll_interval_us(mut self, us: u64) -> Self {
        self.poll_interval_us = us;
        self
    }

    pub fn with_identification_clock_khz(mut self, khz: u32) -> Self {
        self.identification_clock_khz = khz;
        self
    }
}

/// MMC bus manager settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    /// ACMD41 polls before the pass is aborted with `TimedOut`
    pub ocr_retry_limit: u32,
    pub ocr_busy_delay_us: u64,
    pub card_locked_delay_us: u64,
    /// Abort the pass when a card echoes a wrong CMD8 check pattern
    pub strict_voltage_check: bool,
    pub scan_poll_us: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ocr_retry_limit: OCR_RETRY_LIMIT,
            ocr_busy_delay_us: OCR_BUSY_DELAY_US,
            card_locked_delay_us: CARD_LOCKED_DELAY_US,
            strict_voltage_check: false,
            scan_poll_us: SCAN_POLL_US,
        }
    }
}

impl BusConfig {
    pub fn with_ocr_retry_limit(mut self, limit: u32) -> Self {
        self.ocr_retry_limit = limit;
        self
    }

    pub fn with_ocr_delays_us(mut self, busy: u64, locked: u64) -> Self {
        self.ocr_busy_delay_us = busy;
        self.card_locked_delay_us = locked;
        self
    }

    pub fn with_strict_voltage_check(mut self, strict: bool) -> Self {
        self.strict_voltage_check = strict;
        self
    }
}

/// Block front end settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskConfig {
    pub bounce_buffer_size: usize,
    /// Clock programmed together with the switch to the 4-bit bus;
    /// 0 keeps the identification clock
    pub transfer_clock_khz: u32,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            bounce_buffer_size: BOUNCE_BUFFER_SIZE,
            transfer_clock_khz: TRANSFER_CLOCK_KHZ,
        }
    }
}

impl DiskConfig {
    pub fn with_bounce_buffer_size(mut self, size: usize) -> Self {
        self.bounce_buffer_size = size;
        self
    }

    pub fn with_transfer_clock_khz(mut self, khz: u32) -> Self {
        self.transfer_clock_khz = khz;
        self
    }
}
