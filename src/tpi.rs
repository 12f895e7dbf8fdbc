//! TPI, the Tiny Programming Interface of reduced-core AVRs.
//!
//! Two layers live here: the command/register constants with the NVM
//! sequencing helpers (driven through [`Programmer::cmd_tpi`]), and the
//! 12-bit wire framing the bit-bang back-end needs.

use crate::error::{Error, Result};
use crate::pgm::Programmer;
use crate::progress::{self, Session};

// - MARK: commands

/// Load data byte, no pointer increment.
pub const SLD: u8 = 0x20;
/// Load data byte with post-increment.
pub const SLD_PI: u8 = 0x24;
/// Store data byte, no pointer increment.
pub const SST: u8 = 0x60;
/// Store data byte with post-increment.
pub const SST_PI: u8 = 0x64;
/// Set pointer register low byte.
pub const SSTPR_LO: u8 = 0x68;
/// Set pointer register high byte.
pub const SSTPR_HI: u8 = 0x69;
/// Key load command.
pub const SKEY: u8 = 0xe0;

/// NVM program-enable key, sent after [`SKEY`].
pub const NVM_KEY: [u8; 8] = [0xff, 0x88, 0xd8, 0xcd, 0x45, 0xab, 0x89, 0x12];

/// Serial IN from I/O space.
pub fn sin(addr: u8) -> u8 {
    0x10 | ((addr & 0x30) << 1) | (addr & 0x0f)
}

/// Serial OUT to I/O space.
pub fn sout(addr: u8) -> u8 {
    0x90 | ((addr & 0x30) << 1) | (addr & 0x0f)
}

/// Load TPI control/status register.
pub fn sldcs(reg: u8) -> u8 {
    0x80 | (reg & 0x0f)
}

/// Store TPI control/status register.
pub fn sstcs(reg: u8) -> u8 {
    0xc0 | (reg & 0x0f)
}

// - MARK: registers

/// TPI status register; NVMEN reads 1 while NVM programming is enabled.
pub const REG_TPISR: u8 = 0x00;
pub const TPISR_NVMEN: u8 = 1 << 1;

/// NVM control/status, I/O space. NVMBSY is bit 7.
pub const IO_NVMCSR: u8 = 0x32;
pub const NVMCSR_BSY: u8 = 1 << 7;

/// NVM command register, I/O space.
pub const IO_NVMCMD: u8 = 0x33;

pub const NVMCMD_NO_OPERATION: u8 = 0x00;
pub const NVMCMD_CHIP_ERASE: u8 = 0x10;
pub const NVMCMD_SECTION_ERASE: u8 = 0x14;
pub const NVMCMD_WORD_WRITE: u8 = 0x1d;

// - MARK: NVM sequencing

const NVM_BUSY_TRIES: u32 = 100;

/// Poll NVMCSR until NVMBSY clears.
pub fn nvm_wait<P: Programmer + ?Sized>(pgm: &mut P, _s: &mut Session) -> Result<()> {
    let mut res = [0u8; 1];
    for _ in 0..NVM_BUSY_TRIES {
        pgm.cmd_tpi(&[sin(IO_NVMCSR)], &mut res)?;
        if res[0] & NVMCSR_BSY == 0 {
            return Ok(());
        }
        progress::usleep(1000);
    }
    Err(Error::Timeout("NVM ready"))
}

/// Select the NVM command for the next data access.
pub fn set_nvmcmd<P: Programmer + ?Sized>(pgm: &mut P, cmd: u8) -> Result<()> {
    pgm.cmd_tpi(&[sout(IO_NVMCMD), cmd], &mut [])
}

/// Load the pointer register.
pub fn set_pointer<P: Programmer + ?Sized>(pgm: &mut P, addr: u16) -> Result<()> {
    pgm.cmd_tpi(&[SSTPR_LO, addr as u8], &mut [])?;
    pgm.cmd_tpi(&[SSTPR_HI, (addr >> 8) as u8], &mut [])
}

/// Read one byte at the pointer, post-incrementing.
pub fn read_byte_pi<P: Programmer + ?Sized>(pgm: &mut P) -> Result<u8> {
    let mut res = [0u8; 1];
    pgm.cmd_tpi(&[SLD_PI], &mut res)?;
    Ok(res[0])
}

/// Write one word at the pointer, post-incrementing. The NVM command
/// must already be `WORD_WRITE`; the write starts on the high byte.
pub fn write_word_pi<P: Programmer + ?Sized>(pgm: &mut P, lo: u8, hi: u8) -> Result<()> {
    pgm.cmd_tpi(&[SST_PI, lo], &mut [])?;
    pgm.cmd_tpi(&[SST_PI, hi], &mut [])
}

/// Erase the NVM section containing `addr` (a device address).
pub fn section_erase<P: Programmer + ?Sized>(
    pgm: &mut P,
    s: &mut Session,
    addr: u16,
) -> Result<()> {
    nvm_wait(pgm, s)?;
    set_nvmcmd(pgm, NVMCMD_SECTION_ERASE)?;
    set_pointer(pgm, addr | 1)?;
    pgm.cmd_tpi(&[SST, 0xff], &mut [])?;
    nvm_wait(pgm, s)
}

/// Erase the whole chip: point into the flash section and store 0xff
/// under the CHIP_ERASE command.
pub fn chip_erase<P: Programmer + ?Sized>(
    pgm: &mut P,
    s: &mut Session,
    flash_offset: u16,
) -> Result<()> {
    nvm_wait(pgm, s)?;
    set_nvmcmd(pgm, NVMCMD_CHIP_ERASE)?;
    set_pointer(pgm, flash_offset | 1)?;
    pgm.cmd_tpi(&[SST, 0xff], &mut [])?;
    nvm_wait(pgm, s)
}

/// Send the NVM key and poll TPISR.NVMEN, up to 10 times.
pub fn enable_nvm<P: Programmer + ?Sized>(pgm: &mut P, _s: &mut Session) -> Result<()> {
    let mut cmd = [0u8; 9];
    cmd[0] = SKEY;
    cmd[1..].copy_from_slice(&NVM_KEY);
    pgm.cmd_tpi(&cmd, &mut [])?;

    let mut res = [0u8; 1];
    for _ in 0..10 {
        pgm.cmd_tpi(&[sldcs(REG_TPISR)], &mut res)?;
        if res[0] & TPISR_NVMEN != 0 {
            return Ok(());
        }
        progress::usleep(1000);
    }
    Err(Error::Timeout("NVM enable"))
}

// - MARK: wire framing

/// Bits per TPI frame: start, 8 data, even parity, two stop bits.
pub const FRAME_BITS: usize = 12;

/// Even parity over the 8 data bits.
pub fn parity(b: u8) -> u8 {
    (b.count_ones() & 1) as u8
}

/// Frame a byte for the wire. Bit 0 of the result is transmitted first:
/// start(0), data LSB first, parity, stop(1), stop(1).
pub fn frame(b: u8) -> u16 {
    let data = (b as u16) << 1;
    let par = (parity(b) as u16) << 9;
    let stop = 0b11 << 10;
    data | par | stop
}

/// Decode a frame; start and stop bits must be in place and parity even.
pub fn unframe(f: u16) -> Result<u8> {
    if f & 1 != 0 {
        return Err(Error::Protocol("TPI frame without start bit".into()));
    }
    if f >> 10 != 0b11 {
        return Err(Error::Protocol("TPI frame with bad stop bits".into()));
    }
    let b = (f >> 1) as u8;
    if ((f >> 9) & 1) as u8 != parity(b) {
        return Err(Error::Protocol("TPI frame parity error".into()));
    }
    Ok(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_space_opcodes() {
        // NVMCSR (0x32) and NVMCMD (0x33) cross the 0x30 boundary that
        // the split encoding exists for
        assert_eq!(sin(IO_NVMCSR), 0x72);
        assert_eq!(sout(IO_NVMCMD), 0xf3);
        assert_eq!(sin(0x0f), 0x1f);
        assert_eq!(sout(0x00), 0x90);
    }

    #[test]
    fn cs_space_opcodes() {
        assert_eq!(sldcs(REG_TPISR), 0x80);
        assert_eq!(sstcs(0x02), 0xc2);
    }

    #[test]
    fn parity_is_even() {
        assert_eq!(parity(0x00), 0);
        assert_eq!(parity(0x01), 1);
        assert_eq!(parity(0xff), 0);
        assert_eq!(parity(0x7f), 1);
    }

    #[test]
    fn frame_layout() {
        // 0x00: start 0, eight 0 bits, parity 0, two stop 1s
        assert_eq!(frame(0x00), 0b1100_0000_0000);
        // 0x01: data LSB right after the start bit
        assert_eq!(frame(0x01), 0b1110_0000_0010);
        assert_eq!(frame(0xff), 0b1101_1111_1110);
    }

    #[test]
    fn frame_roundtrip() {
        for b in 0..=255u8 {
            assert_eq!(unframe(frame(b)).unwrap(), b);
        }
    }

    #[test]
    fn unframe_rejects_damage() {
        let good = frame(0xa5);
        assert!(unframe(good | 1).is_err()); // start bit high
        assert!(unframe(good & !(1 << 10)).is_err()); // stop bit low
        assert!(unframe(good ^ (1 << 3)).is_err()); // data flip breaks parity
    }
}
