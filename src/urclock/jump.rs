//! AVR jump instruction arithmetic for vector bootloaders.
//!
//! Parts up to 8 KiB use rjmp, whose 12-bit word offset wraps around the
//! small flash; larger parts use the 4-byte jmp. Both directions of both
//! encodings live here, away from the protocol plumbing.

/// Size in bytes of one vector slot.
pub fn vecsz(flashsize: usize) -> usize {
    if flashsize <= 8192 {
        2
    } else {
        4
    }
}

/// True for an rjmp instruction word.
pub fn is_rjmp(op: u16) -> bool {
    op & 0xf000 == 0xc000
}

/// rjmp with a byte distance `dist` (target minus instruction address).
/// The distance wraps modulo the flash size on parts below 8 KiB, so
/// every target is reachable from everywhere.
pub fn rjmp_opcode(dist: i32, flashsize: usize) -> u16 {
    let modw = (flashsize.min(8192) / 2) as i32;
    let k = (dist / 2 - 1).rem_euclid(modw);
    0xc000 | (k as u16 & 0x0fff)
}

/// Byte distance covered by an rjmp, folded into
/// `[-min(flashsize, 8192)/2, min(flashsize, 8192)/2)`.
pub fn dist_rjmp(op: u16, flashsize: usize) -> i32 {
    let window = flashsize.min(8192) as i32;
    let k = i32::from(op & 0x0fff) % (window / 2);
    let d = 2 * (k + 1);
    if d >= window / 2 {
        d - window
    } else {
        d
    }
}

/// True when `word1` is the first word of a jmp instruction.
pub fn is_jmp(word1: u16) -> bool {
    word1 & 0xfe0e == 0x940c
}

/// 4-byte jmp to the even byte address `addr`, packed as
/// `(word1 << 16) | word2`.
pub fn jmp_opcode(addr: u32) -> u32 {
    let k = addr / 2;
    let word1 = 0x940c | (((k >> 17) & 0x1f) << 4) | ((k >> 16) & 1);
    (word1 << 16) | (k & 0xffff)
}

/// Byte address a jmp instruction targets.
pub fn addr_jmp(op: u32) -> u32 {
    let word1 = op >> 16;
    let word2 = op & 0xffff;
    let k = (((word1 >> 4) & 0x1f) << 17) | ((word1 & 1) << 16) | word2;
    k * 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn vector_slot_sizes() {
        assert_eq!(vecsz(2048), 2);
        assert_eq!(vecsz(8192), 2);
        assert_eq!(vecsz(16384), 4);
        assert_eq!(vecsz(262144), 4);
    }

    #[test]
    fn rjmp_backward_two() {
        // "rjmp .-2" on a full 8 KiB flash keeps its canonical encoding
        let op = rjmp_opcode(-2, 8192);
        assert_eq!(op, 0xcffe);
        assert_eq!(dist_rjmp(op, 8192), -2);
    }

    #[test]
    fn rjmp_next_instruction() {
        let op = rjmp_opcode(2, 4096);
        assert_eq!(op, 0xc000);
        assert_eq!(dist_rjmp(op, 4096), 2);
    }

    #[test]
    fn rjmp_wraps_on_small_flash() {
        // on a 2 KiB part a forward jump past the end lands low again:
        // from 0x7fe, distance +4 reaches 0x002
        let fs = 2048;
        let op = rjmp_opcode(4, fs);
        let d = dist_rjmp(op, fs);
        assert_eq!((0x7fe + d).rem_euclid(fs as i32), 0x002);
    }

    #[test]
    fn rjmp_reaches_bootloader_backwards() {
        // reset vector of a 2 KiB part jumping to a bootloader at 0x700:
        // encoded forward, decoded as the wrapped equivalent
        let fs = 2048usize;
        let dist = 0x700i32; // from address 0 to 0x700
        let op = rjmp_opcode(dist, fs);
        assert!(is_rjmp(op));
        let back = dist_rjmp(op, fs);
        assert_eq!(back.rem_euclid(fs as i32), 0x700);
    }

    #[test]
    fn jmp_roundtrip_extremes() {
        for addr in [0u32, 2, 0x3ffe, 0x1_0000, 0x3_fffe] {
            let op = jmp_opcode(addr);
            assert!(is_jmp((op >> 16) as u16), "{addr:#x}");
            assert_eq!(addr_jmp(op), addr, "{addr:#x}");
        }
    }

    #[test]
    fn rjmp_is_not_jmp() {
        assert!(!is_jmp(rjmp_opcode(2, 8192)));
        assert!(!is_rjmp(0x940c));
    }

    proptest! {
        #[test]
        fn rjmp_roundtrip_law(
            fs_exp in 10u32..=13, // 1 KiB to 8 KiB
            raw in -4096i32..4096,
        ) {
            let flashsize = 1usize << fs_exp;
            let half = (flashsize / 2) as i32;
            let d = (raw.rem_euclid(2 * half)) - half; // into [-half, half)
            let d = d & !1;
            prop_assume!(d != 0 && d >= -half && d < half);
            prop_assert_eq!(dist_rjmp(rjmp_opcode(d, flashsize), flashsize), d);
        }

        #[test]
        fn jmp_roundtrip_law(waddr in 0u32..0x20_0000) {
            let addr = waddr * 2;
            prop_assert_eq!(addr_jmp(jmp_opcode(addr)), addr);
        }
    }
}
