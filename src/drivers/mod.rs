//! Hardware drivers for CrabMMC
//!
//! This module contains the SDHCI host controller driver, the MMC bus
//! manager and disk driver, and the register/block plumbing they share.

pub mod block;
pub mod mmc;
pub mod mmio;
pub mod sdhci;
