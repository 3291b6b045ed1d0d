//! CrabMMC - SD/MMC storage stack for kernel use
//!
//! This library provides the pieces needed to drive SD cards behind a standard
//! SD Host Controller Interface (SDHCI):
//!
//! - [`drivers::sdhci`]: the host controller protocol engine (commands, SDMA
//!   block transfers, power/clock/bus-width setup, interrupt handling)
//! - [`drivers::mmc::bus`]: card enumeration and addressing on top of any
//!   [`drivers::mmc::MmcHost`]
//! - [`drivers::mmc::disk`]: a block-device front end for enumerated cards
//!
//! Kernel services (clock, threads, IRQ registration, DMA memory) and the
//! device manager are injected through the [`platform::Platform`] and
//! [`device::DeviceManager`] traits.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_op_in_unsafe_fn)]
#![allow(clippy::result_unit_err)]

extern crate alloc;

pub mod config;
pub mod device;
pub mod drivers;
pub mod error;
pub mod logger;
pub mod platform;
pub mod sync;

pub use error::{Error, Result};
