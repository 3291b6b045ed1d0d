//! Card-Specific Data (CSD) register
//!
//! Only the capacity fields are decoded. Field positions are given in
//! register bit numbers ([127:0], CRC in [7:1]).

use crate::error::{Error, Result};

/// Disk geometry derived from the CSD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    pub bytes_per_sector: u32,
    pub sectors_per_track: u32,
    pub cylinder_count: u32,
    pub head_count: u32,
    pub removable: bool,
    pub read_only: bool,
}

impl DeviceGeometry {
    pub fn sector_count(&self) -> u64 {
        self.sectors_per_track as u64 * self.cylinder_count as u64 * self.head_count as u64
    }

    /// Capacity in bytes
    pub fn size(&self) -> u64 {
        self.sector_count() * self.bytes_per_sector as u64
    }
}

/// Raw CSD register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Csd(u128);

impl Csd {
    /// Rebuild the register from the four response words of CMD9
    pub fn from_response(words: [u32; 4]) -> Self {
        let raw = (words[0] as u128)
            | (words[1] as u128) << 32
            | (words[2] as u128) << 64
            | (words[3] as u128) << 96;
        Self(raw << 8)
    }

    fn bits(&self, high: u32, low: u32) -> u32 {
        let width = high - low + 1;
        ((self.0 >> low) & ((1u128 << width) - 1)) as u32
    }

    /// CSD_STRUCTURE: 0 = standard capacity, 1 = SDHC/SDXC, 2 = SDUC
    pub fn structure_version(&self) -> u8 {
        self.bits(127, 126) as u8
    }

    pub fn read_bl_len(&self) -> u8 {
        self.bits(83, 80) as u8
    }

    pub fn c_size(&self) -> u32 {
        match self.structure_version() {
            0 => self.bits(73, 62),
            1 => self.bits(69, 48),
            _ => self.bits(75, 48),
        }
    }

    pub fn c_size_mult(&self) -> u8 {
        self.bits(49, 47) as u8
    }

    /// Permanent or temporary write protection
    pub fn write_protected(&self) -> bool {
        self.bits(13, 12) != 0
    }

    pub fn geometry(&self) -> Result<DeviceGeometry> {
        let (bytes_per_sector, sectors_per_track, cylinder_count) = match self.structure_version()
        {
            0 => {
                let bl_len = self.read_bl_len();
                if !(9..=11).contains(&bl_len) {
                    log::error!("MMC: Invalid READ_BL_LEN {} in CSD", bl_len);
                    return Err(Error::BadData);
                }
                (
                    1u32 << bl_len,
                    self.c_size() + 1,
                    1u32 << (self.c_size_mult() + 2),
                )
            }
            // C_SIZE counts 512 KiB units
            1 | 2 => (512, self.c_size() + 1, 1024),
            v => {
                log::error!("MMC: Unknown CSD structure version {}", v);
                return Err(Error::BadData);
            }
        };

        Ok(DeviceGeometry {
            bytes_per_sector,
            sectors_per_track,
            cylinder_count,
            head_count: 1,
            removable: true,
            read_only: self.write_protected(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(raw: u128) -> [u32; 4] {
        let v = raw >> 8;
        [v as u32, (v >> 32) as u32, (v >> 64) as u32, (v >> 96) as u32]
    }

    #[test]
    fn test_csd_v1_geometry() {
        // 512-byte blocks, C_SIZE 3, C_SIZE_MULT 7: 1 MiB
        let raw = (9u128 << 80) | (3u128 << 62) | (7u128 << 47) | 1;
        let csd = Csd::from_response(words(raw));
        assert_eq!(csd.structure_version(), 0);
        assert_eq!(csd.read_bl_len(), 9);

        let geometry = csd.geometry().unwrap();
        assert_eq!(geometry.bytes_per_sector, 512);
        assert_eq!(geometry.sector_count(), 2048);
        assert_eq!(geometry.size(), 1024 * 1024);
        assert!(!geometry.read_only);
    }

    #[test]
    fn test_csd_v2_geometry() {
        let raw = (1u128 << 126) | (9u128 << 80) | (0x3B37u128 << 48) | 1;
        let geometry = Csd::from_response(words(raw)).geometry().unwrap();
        assert_eq!(geometry.bytes_per_sector, 512);
        assert_eq!(geometry.sector_count(), (0x3B37 + 1) * 1024);
    }

    #[test]
    fn test_csd_v3_uses_wide_c_size() {
        let raw = (2u128 << 126) | (0x0800_0000u128 << 48);
        let geometry = Csd::from_response(words(raw)).geometry().unwrap();
        assert_eq!(geometry.sector_count(), (0x0800_0000u64 + 1) * 1024);
    }

    #[test]
    fn test_invalid_csd_rejected() {
        let reserved = Csd::from_response(words(3u128 << 126));
        assert_eq!(reserved.geometry(), Err(Error::BadData));
        let bad_block_len = Csd::from_response(words(4u128 << 80));
        assert_eq!(bad_block_len.geometry(), Err(Error::BadData));
    }

    #[test]
    fn test_write_protect_bits() {
        let raw = (1u128 << 126) | (1u128 << 12);
        let geometry = Csd::from_response(words(raw)).geometry().unwrap();
        assert!(geometry.read_only);
    }
}
