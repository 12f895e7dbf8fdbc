//! STK500v1 and urprotocol wire constants, sync-pair decoding and the
//! urboot capability/metadata byte layouts.

use bitflags::bitflags;

// - MARK: classic STK500v1 bytes (bit-exact)

pub const STK_GET_SYNC: u8 = 0x30;
pub const STK_CRC_EOP: u8 = 0x20;
pub const STK_INSYNC: u8 = 0x14;
pub const STK_OK: u8 = 0x10;
pub const STK_LOAD_ADDRESS: u8 = 0x55;
pub const STK_PROG_PAGE: u8 = 0x64;
pub const STK_READ_PAGE: u8 = 0x74;
pub const STK_READ_SIGN: u8 = 0x75;
pub const STK_LEAVE_PROGMODE: u8 = 0x51;
pub const STK_UNIVERSAL: u8 = 0x56;

/// Memory type tag in classic PROG/READ page commands.
pub const STK_MEMTYPE_FLASH: u8 = b'F';
pub const STK_MEMTYPE_EEPROM: u8 = b'E';

// - MARK: urprotocol command bytes

pub const UR_PROG_PAGE_FL: u8 = b'F';
pub const UR_PROG_PAGE_EE: u8 = b'E';
pub const UR_READ_PAGE_FL: u8 = b'f';
pub const UR_READ_PAGE_EE: u8 = b'e';
pub const UR_PAGE_ERASE: u8 = b'P';
pub const UR_CHIP_ERASE: u8 = b'C';
pub const UR_LEAVE_PROGMODE: u8 = b'L';

/// The pair some legacy optiboots answer with; remapped to classic.
pub const LEGACY_PAIR: (u8, u8) = (0xff, 0xfe);

bitflags! {
    /// Capability flags carried in the low five bits of the sync code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UrFeatures: u8 {
        /// Bootloader speaks the urprotocol variant.
        const URPROTOCOL = 1 << 0;
        /// Bootloader implements chip erase.
        const CHIP_ERASE = 1 << 1;
        /// Flash can be read back.
        const READ_FLASH = 1 << 2;
        /// EEPROM read/write supported.
        const EEPROM     = 1 << 3;
        /// Flash writes have low-level NOR semantics (no implicit erase).
        const NOR_LL     = 1 << 4;
    }
}

/// The 16-bit information content of a non-classic sync pair.
pub fn sync_code(insync: u8, ok: u8) -> u32 {
    u32::from(insync) * 255 + u32::from(ok)
}

/// Upper 11 bits of the sync code: the MCU id.
pub fn mcuid_from_code(code: u32) -> i32 {
    (code / 32) as i32
}

/// Low 5 bits of the sync code: the capability flags.
pub fn features_from_code(code: u32) -> UrFeatures {
    UrFeatures::from_bits_truncate((code % 32) as u8)
}

/// Sync pair a bootloader with this identity would answer; the inverse
/// of the decoding above (device-side, used by emulators and tests).
pub fn pair_for(mcuid: i32, features: UrFeatures) -> (u8, u8) {
    let code = mcuid as u32 * 32 + u32::from(features.bits());
    ((code / 255) as u8, (code % 255) as u8)
}

// - MARK: urboot trailer

/// Urboot bootloaders keep six bytes at the very top of flash:
/// `[wp rjmp lo, wp rjmp hi, vector number, pages, capabilities, version]`.
pub const BL_INFO_LEN: usize = 6;

/// Capability byte: low two bits are the vector-bootloader level.
pub const CAP_VBL_MASK: u8 = 0x03;
pub const CAP_EEPROM: u8 = 1 << 2;
pub const CAP_CHIP_ERASE: u8 = 1 << 3;
/// Bootloader refuses writes to its own reset vector.
pub const CAP_PROTECTRESET: u8 = 1 << 4;

/// Version byte: major in the high five bits, minor in the low three.
pub fn version_major(v: u8) -> u8 {
    v >> 3
}

pub fn version_minor(v: u8) -> u8 {
    v & 7
}

/// From u7.2 on, the trailer carries the vector number and page count.
pub fn has_extended_info(v: u8) -> bool {
    v >= (7 << 3) + 2
}

// - MARK: metadata codes

/// No metadata present (erased flash).
pub const MCODE_NONE: u8 = 0xff;
/// Store fields only.
pub const MCODE_NO_DATE: u8 = 0;
/// Store fields and date.
pub const MCODE_DATE_ONLY: u8 = 1;
// 2..=254: filename length including the terminating nul; implies date.

/// Width of the store start/size fields for a given flash size.
pub fn store_field_width(flashsize: usize) -> usize {
    if flashsize <= 65536 {
        2
    } else {
        4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_code_decodes_scenario_pair() {
        // insync 0x55, ok 0x54
        let code = sync_code(0x55, 0x54);
        assert_eq!(code, 0x55 * 255 + 0x54);
        assert_eq!(mcuid_from_code(code), 679);
        assert_eq!(features_from_code(code), UrFeatures::all());
    }

    #[test]
    fn pair_roundtrip() {
        for mcuid in [0, 1, 9, 21, 29, 700, 2039] {
            for bits in 0..32u8 {
                let f = UrFeatures::from_bits_truncate(bits);
                let (i, o) = pair_for(mcuid, f);
                let code = sync_code(i, o);
                assert_eq!(mcuid_from_code(code), mcuid);
                assert_eq!(features_from_code(code), f);
            }
        }
    }

    #[test]
    fn version_byte_split() {
        let v = (7 << 3) + 7; // u7.7
        assert_eq!(version_major(v), 7);
        assert_eq!(version_minor(v), 7);
        assert!(has_extended_info(v));
        assert!(!has_extended_info((7 << 3) + 1)); // u7.1
    }

    #[test]
    fn store_field_widths() {
        assert_eq!(store_field_width(32768), 2);
        assert_eq!(store_field_width(65536), 2);
        assert_eq!(store_field_width(131072), 4);
    }
}
