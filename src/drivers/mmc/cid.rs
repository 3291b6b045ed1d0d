//! Card Identification (CID) register
//!
//! CMD2 returns the CID as a 136-bit reply; the host strips the CRC byte and
//! hands over bits [127:8] in four response words. Shifting back by 8 bits
//! restores the register image, which is then read in its on-card (big
//! endian) byte order.

use heapless::String;
use zerocopy::byteorder::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use crate::error::{Error, Result};

/// CID register image, MID first
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct RawCid {
    /// Manufacturer ID
    mid: u8,
    /// OEM/Application ID
    oid: [u8; 2],
    /// Product name
    pnm: [u8; 5],
    /// Product revision, BCD n.m
    prv: u8,
    /// Product serial number
    psn: U32,
    /// Reserved nibble, then year offset from 2000 and month
    mdt: U16,
    #[allow(dead_code)]
    crc: u8,
}

/// Decoded card identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardId {
    pub vendor: u8,
    pub oem: [u8; 2],
    pub product: String<5>,
    /// Product revision as major * 100 + minor
    pub revision: u16,
    pub serial: u32,
    pub year: u16,
    pub month: u8,
}

impl CardId {
    /// Decode the four response words of CMD2
    pub fn from_response(words: [u32; 4]) -> Result<Self> {
        let raw = (words[0] as u128)
            | (words[1] as u128) << 32
            | (words[2] as u128) << 64
            | (words[3] as u128) << 96;
        let bytes = (raw << 8).to_be_bytes();
        let cid = RawCid::read_from_bytes(&bytes).map_err(|_| Error::BadData)?;

        let mut product = String::new();
        for &c in &cid.pnm {
            let c = if c.is_ascii_graphic() || c == b' ' {
                c as char
            } else {
                '?'
            };
            product.push(c).map_err(|_| Error::BadData)?;
        }

        let mdt = cid.mdt.get();
        Ok(Self {
            vendor: cid.mid,
            oem: cid.oid,
            product,
            revision: (cid.prv >> 4) as u16 * 100 + (cid.prv & 0xF) as u16,
            serial: cid.psn.get(),
            year: 2000 + ((mdt >> 4) & 0xFF),
            month: (mdt & 0xF) as u8,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(bytes: [u8; 16]) -> [u32; 4] {
        let v = u128::from_be_bytes(bytes) >> 8;
        [v as u32, (v >> 32) as u32, (v >> 64) as u32, (v >> 96) as u32]
    }

    #[test]
    fn test_decode_cid() {
        let bytes = [
            0x03, b'S', b'D', b'S', b'D', b'0', b'8', b'G', 0x80, 0x12, 0x34, 0x56, 0x78, 0x01,
            0x53, 0x01,
        ];
        let cid = CardId::from_response(words(bytes)).unwrap();
        assert_eq!(cid.vendor, 0x03);
        assert_eq!(&cid.oem, b"SD");
        assert_eq!(cid.product.as_str(), "SD08G");
        assert_eq!(cid.revision, 800);
        assert_eq!(cid.serial, 0x1234_5678);
        assert_eq!(cid.year, 2021);
        assert_eq!(cid.month, 3);
    }

    #[test]
    fn test_revision_nibbles() {
        let mut bytes = [0u8; 16];
        bytes[3..8].copy_from_slice(b"ABCDE");
        bytes[8] = 0x21;
        let cid = CardId::from_response(words(bytes)).unwrap();
        assert_eq!(cid.revision, 201);
        assert_eq!(cid.year, 2000);
    }

    #[test]
    fn test_unprintable_product_name() {
        let mut bytes = [0u8; 16];
        bytes[3..8].copy_from_slice(&[b'A', 0x00, b'B', 0xFF, b'C']);
        let cid = CardId::from_response(words(bytes)).unwrap();
        assert_eq!(cid.product.as_str(), "A?B?C");
    }
}
