//! Memory type bits and the canonical memory-name table.
//!
//! The type word encodes identity and attributes in one place: the low
//! nibble is the fuse offset for individual fuses, the middle bits name
//! the region, the high bits carry attributes.

use bitflags::bitflags;

bitflags! {
    /// Memory region classification.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemType: u32 {
        // region identity
        const EEPROM      = 1 << 4;
        const FLASH       = 1 << 5;
        const APPLICATION = 1 << 6;
        const APPTABLE    = 1 << 7;
        const BOOT        = 1 << 8;
        const FUSES       = 1 << 9;
        const LOCK        = 1 << 10;
        const SIGROW      = 1 << 11;
        const SIGNATURE   = 1 << 12;
        const CALIBRATION = 1 << 13;
        const USERROW     = 1 << 14;
        const BOOTROW     = 1 << 15;
        const SRAM        = 1 << 16;
        const IO          = 1 << 17;
        const SIB         = 1 << 18;

        // attributes
        const IN_FLASH    = 1 << 24;
        const IS_A_FUSE   = 1 << 25;
        const USER_TYPE   = 1 << 26;
        const IN_SIGROW   = 1 << 27;
        const READONLY    = 1 << 28;

        // low nibble holds the fuse offset (0..=10)
        const _ = 0xf;
    }
}

impl MemType {
    /// Attach a fuse offset to an `IS_A_FUSE` type.
    pub fn with_fuse_offset(self, offset: u8) -> Self {
        debug_assert!(offset <= 10);
        Self::from_bits_retain((self.bits() & !0xf) | u32::from(offset & 0xf))
    }

    /// Fuse offset of an individual fuse.
    pub fn fuse_offset(self) -> u8 {
        (self.bits() & 0xf) as u8
    }

    pub fn is_eeprom(self) -> bool {
        self.contains(Self::EEPROM)
    }

    /// True for flash and its windows (application, apptable, boot).
    pub fn in_flash(self) -> bool {
        self.contains(Self::IN_FLASH)
    }

    /// True for the collective `fuses` region.
    pub fn is_fuses(self) -> bool {
        self.contains(Self::FUSES) && !self.contains(Self::IS_A_FUSE)
    }

    /// True for an individual fuse byte/word.
    pub fn is_a_fuse(self) -> bool {
        self.contains(Self::IS_A_FUSE)
    }

    pub fn is_lock(self) -> bool {
        self.contains(Self::LOCK)
    }

    pub fn is_signature(self) -> bool {
        self.contains(Self::SIGNATURE)
    }

    pub fn is_readonly(self) -> bool {
        self.contains(Self::READONLY)
    }

    pub fn in_sigrow(self) -> bool {
        self.intersects(Self::SIGROW | Self::IN_SIGROW)
    }
}

/// Canonical memory names with their type pattern. Config-sourced names
/// not in this table are interned per session as `USER_TYPE`.
pub(crate) const KNOWN_MEMS: &[(&str, MemType)] = &[
    ("eeprom", MemType::EEPROM),
    ("flash", MemType::FLASH.union(MemType::IN_FLASH)),
    ("application", MemType::APPLICATION.union(MemType::IN_FLASH)),
    ("apptable", MemType::APPTABLE.union(MemType::IN_FLASH)),
    ("boot", MemType::BOOT.union(MemType::IN_FLASH)),
    ("fuses", MemType::FUSES),
    ("fuse", MemType::IS_A_FUSE),
    ("lfuse", MemType::IS_A_FUSE),
    ("hfuse", MemType::IS_A_FUSE),
    ("efuse", MemType::IS_A_FUSE),
    ("fuse0", MemType::IS_A_FUSE),
    ("wdtcfg", MemType::IS_A_FUSE),
    ("fuse1", MemType::IS_A_FUSE),
    ("bodcfg", MemType::IS_A_FUSE),
    ("fuse2", MemType::IS_A_FUSE),
    ("osccfg", MemType::IS_A_FUSE),
    ("fuse4", MemType::IS_A_FUSE),
    ("tcd0cfg", MemType::IS_A_FUSE),
    ("fuse5", MemType::IS_A_FUSE),
    ("syscfg0", MemType::IS_A_FUSE),
    ("fuse6", MemType::IS_A_FUSE),
    ("syscfg1", MemType::IS_A_FUSE),
    ("fuse7", MemType::IS_A_FUSE),
    ("append", MemType::IS_A_FUSE),
    ("codesize", MemType::IS_A_FUSE),
    ("fuse8", MemType::IS_A_FUSE),
    ("bootend", MemType::IS_A_FUSE),
    ("bootsize", MemType::IS_A_FUSE),
    ("fuse10", MemType::IS_A_FUSE),
    ("pdicfg", MemType::IS_A_FUSE),
    ("lock", MemType::LOCK),
    ("signature", MemType::SIGNATURE.union(MemType::READONLY)),
    ("calibration", MemType::CALIBRATION.union(MemType::READONLY)),
    ("sigrow", MemType::SIGROW.union(MemType::READONLY)),
    ("prodsig", MemType::SIGROW.union(MemType::READONLY)),
    ("tempsense", MemType::IN_SIGROW.union(MemType::READONLY)),
    ("sernum", MemType::IN_SIGROW.union(MemType::READONLY)),
    ("osccal16", MemType::IN_SIGROW.union(MemType::READONLY)),
    ("osccal20", MemType::IN_SIGROW.union(MemType::READONLY)),
    ("userrow", MemType::USERROW),
    ("usersig", MemType::USERROW),
    ("bootrow", MemType::BOOTROW),
    ("sram", MemType::SRAM),
    ("io", MemType::IO),
    ("sib", MemType::SIB.union(MemType::READONLY)),
];

/// Offsets the individual fuse names above conventionally sit at.
pub(crate) fn default_fuse_offset(name: &str) -> Option<u8> {
    Some(match name {
        "fuse" | "lfuse" | "fuse0" | "wdtcfg" => 0,
        "hfuse" | "fuse1" | "bodcfg" => 1,
        "efuse" | "fuse2" | "osccfg" => 2,
        "fuse4" | "tcd0cfg" => 4,
        "fuse5" | "syscfg0" => 5,
        "fuse6" | "syscfg1" => 6,
        "fuse7" | "append" | "codesize" => 7,
        "fuse8" | "bootend" | "bootsize" => 8,
        "fuse10" | "pdicfg" => 10,
        _ => return None,
    })
}

/// Look up a canonical memory name; individual fuses get their
/// conventional offset attached.
pub fn lookup(name: &str) -> Option<MemType> {
    KNOWN_MEMS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|&(n, t)| match default_fuse_offset(n) {
            Some(off) if t.is_a_fuse() => t.with_fuse_offset(off),
            _ => t,
        })
}
