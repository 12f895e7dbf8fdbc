//! Built-in part descriptors.
//!
//! A representative spread of classic ISP parts, a TPI part and the
//! large-flash parts that exercise extended addressing. Geometry and
//! instruction templates follow the datasheets.

use crate::opcode::{Op, Opcode};
use crate::part::memtype::MemType;
use crate::part::{Memory, Part, PgmModes};

fn op(spec: &str) -> Opcode {
    Opcode::parse(spec).expect("static opcode template")
}

const PGM_ENABLE: &str = "1010 1100 0101 0011 xxxx xxxx xxxx xxxx";
const CHIP_ERASE: &str = "1010 1100 100x xxxx xxxx xxxx xxxx xxxx";
const SIG_READ: &str = "0011 0000 000x xxxx xxxx xxaa oooo oooo";
const CAL_READ: &str = "0011 1000 000x xxxx 0000 0000 oooo oooo";

fn fuse(name: &str, off: u8, read: &str, write: &str, bitmask: u32, initval: u16) -> Memory {
    let mut m = Memory::new(name, MemType::IS_A_FUSE.with_fuse_offset(off), 1);
    m.bitmask = bitmask;
    m.initval = Some(initval);
    m.min_write_delay = 4500;
    m.max_write_delay = 4500;
    m.set_op(Op::Read, op(read));
    m.set_op(Op::Write, op(write));
    m
}

fn lock(read: &str, write: &str, bitmask: u32) -> Memory {
    let mut m = Memory::new("lock", MemType::LOCK, 1);
    m.bitmask = bitmask;
    m.min_write_delay = 4500;
    m.max_write_delay = 4500;
    m.set_op(Op::Read, op(read));
    m.set_op(Op::Write, op(write));
    m
}

fn signature() -> Memory {
    let mut m = Memory::new("signature", MemType::SIGNATURE | MemType::READONLY, 3);
    m.set_op(Op::Read, op(SIG_READ));
    m
}

fn calibration() -> Memory {
    let mut m = Memory::new(
        "calibration",
        MemType::CALIBRATION | MemType::READONLY,
        1,
    );
    m.set_op(Op::Read, op(CAL_READ));
    m
}

fn classic_aliases() -> Vec<(String, String)> {
    vec![("lockbits".into(), "lock".into())]
}

/// ATmega328P: 32 KiB flash in 128-byte pages, the workhorse target.
pub fn atmega328p() -> Part {
    let mut p = Part::new("m328p", "ATmega328P", [0x1e, 0x95, 0x0f]);
    p.prog_modes = PgmModes::ISP | PgmModes::SPM | PgmModes::HVPP | PgmModes::DEBUGWIRE;
    p.n_interrupts = 26;
    p.n_boot_sections = 4;
    p.boot_section_size = 512;
    p.chip_erase_delay = 9000;
    p.mcuid = 9;
    p.aliases = classic_aliases();

    let mut flash = Memory::new("flash", MemType::FLASH | MemType::IN_FLASH, 32768);
    flash.page_size = 128;
    flash.num_pages = 256;
    flash.min_write_delay = 4500;
    flash.max_write_delay = 4500;
    flash.readback = [0xff, 0xff];
    flash.set_op(Op::ReadLo, op("0010 0000 00aa aaaa aaaa aaaa oooo oooo"));
    flash.set_op(Op::ReadHi, op("0010 1000 00aa aaaa aaaa aaaa oooo oooo"));
    flash.set_op(Op::LoadPageLo, op("0100 0000 xxxx xxxx xxaa aaaa iiii iiii"));
    flash.set_op(Op::LoadPageHi, op("0100 1000 xxxx xxxx xxaa aaaa iiii iiii"));
    flash.set_op(
        Op::WritePage,
        op("0100 1100 00 a13 a12 a11 a10 a9 a8 a7 a6 xx xxxx xxxx xxxx"),
    );
    flash.set_op(Op::ChipErase, op(CHIP_ERASE));
    flash.set_op(Op::PgmEnable, op(PGM_ENABLE));
    p.mems.push(flash);

    let mut eeprom = Memory::new("eeprom", MemType::EEPROM, 1024);
    eeprom.page_size = 4;
    eeprom.num_pages = 256;
    eeprom.min_write_delay = 3600;
    eeprom.max_write_delay = 3600;
    eeprom.readback = [0xff, 0xff];
    eeprom.set_op(Op::Read, op("1010 0000 000x xxaa aaaa aaaa oooo oooo"));
    eeprom.set_op(Op::Write, op("1100 0000 000x xxaa aaaa aaaa iiii iiii"));
    p.mems.push(eeprom);

    p.mems.push(Memory::new("fuses", MemType::FUSES, 3));
    p.mems.push(fuse(
        "lfuse",
        0,
        "0101 0000 0000 0000 xxxx xxxx oooo oooo",
        "1010 1100 1010 0000 xxxx xxxx iiii iiii",
        0xff,
        0x62,
    ));
    p.mems.push(fuse(
        "hfuse",
        1,
        "0101 1000 0000 1000 xxxx xxxx oooo oooo",
        "1010 1100 1010 1000 xxxx xxxx iiii iiii",
        0xff,
        0xd9,
    ));
    p.mems.push(fuse(
        "efuse",
        2,
        "0101 0000 0000 1000 xxxx xxxx oooo oooo",
        "1010 1100 1010 0100 xxxx xxxx iiii iiii",
        0x07,
        0xff,
    ));
    p.mems.push(lock(
        "0101 1000 0000 0000 xxxx xxxx oooo oooo",
        "1010 1100 111x xxxx xxxx xxxx 11ii iiii",
        0x3f,
    ));
    p.mems.push(signature());
    p.mems.push(calibration());
    p
}

/// ATmega2560: 256 KiB flash, needs the extended address byte.
pub fn atmega2560() -> Part {
    let mut p = Part::new("m2560", "ATmega2560", [0x1e, 0x98, 0x01]);
    p.prog_modes = PgmModes::ISP | PgmModes::SPM | PgmModes::HVPP | PgmModes::JTAG;
    p.n_interrupts = 57;
    p.n_boot_sections = 4;
    p.boot_section_size = 1024;
    p.chip_erase_delay = 9000;
    p.mcuid = 29;
    p.aliases = classic_aliases();

    let mut flash = Memory::new("flash", MemType::FLASH | MemType::IN_FLASH, 262144);
    flash.page_size = 256;
    flash.num_pages = 1024;
    flash.min_write_delay = 4500;
    flash.max_write_delay = 4500;
    flash.readback = [0xff, 0xff];
    flash.set_op(Op::ReadLo, op("0010 0000 aaaa aaaa aaaa aaaa oooo oooo"));
    flash.set_op(Op::ReadHi, op("0010 1000 aaaa aaaa aaaa aaaa oooo oooo"));
    flash.set_op(Op::LoadPageLo, op("0100 0000 xxxx xxxx xaaa aaaa iiii iiii"));
    flash.set_op(Op::LoadPageHi, op("0100 1000 xxxx xxxx xaaa aaaa iiii iiii"));
    flash.set_op(
        Op::WritePage,
        op("0100 1100 a15 a14 a13 a12 a11 a10 a9 a8 a7 xxx xxxx xxxx xxxx"),
    );
    flash.set_op(
        Op::LoadExtAddr,
        op("0100 1101 0000 0000 0000 000 a16 0000 0000"),
    );
    flash.set_op(Op::ChipErase, op(CHIP_ERASE));
    flash.set_op(Op::PgmEnable, op(PGM_ENABLE));
    p.mems.push(flash);

    let mut eeprom = Memory::new("eeprom", MemType::EEPROM, 4096);
    eeprom.page_size = 8;
    eeprom.num_pages = 512;
    eeprom.min_write_delay = 3600;
    eeprom.max_write_delay = 3600;
    eeprom.readback = [0xff, 0xff];
    eeprom.set_op(Op::Read, op("1010 0000 000x aaaa aaaa aaaa oooo oooo"));
    eeprom.set_op(Op::Write, op("1100 0000 000x aaaa aaaa aaaa iiii iiii"));
    p.mems.push(eeprom);

    p.mems.push(Memory::new("fuses", MemType::FUSES, 3));
    p.mems.push(fuse(
        "lfuse",
        0,
        "0101 0000 0000 0000 xxxx xxxx oooo oooo",
        "1010 1100 1010 0000 xxxx xxxx iiii iiii",
        0xff,
        0x62,
    ));
    p.mems.push(fuse(
        "hfuse",
        1,
        "0101 1000 0000 1000 xxxx xxxx oooo oooo",
        "1010 1100 1010 1000 xxxx xxxx iiii iiii",
        0xff,
        0x99,
    ));
    p.mems.push(fuse(
        "efuse",
        2,
        "0101 0000 0000 1000 xxxx xxxx oooo oooo",
        "1010 1100 1010 0100 xxxx xxxx iiii iiii",
        0x07,
        0xff,
    ));
    p.mems.push(lock(
        "0101 1000 0000 0000 xxxx xxxx oooo oooo",
        "1010 1100 111x xxxx xxxx xxxx 11ii iiii",
        0x3f,
    ));
    p.mems.push(signature());
    p.mems.push(calibration());
    p
}

/// ATmega1284P: 128 KiB flash, the largest part still addressable with
/// 16-bit word addresses.
pub fn atmega1284p() -> Part {
    let mut p = Part::new("m1284p", "ATmega1284P", [0x1e, 0x97, 0x05]);
    p.prog_modes = PgmModes::ISP | PgmModes::SPM | PgmModes::HVPP | PgmModes::JTAG;
    p.n_interrupts = 35;
    p.n_boot_sections = 4;
    p.boot_section_size = 1024;
    p.chip_erase_delay = 9000;
    p.mcuid = 21;
    p.aliases = classic_aliases();

    let mut flash = Memory::new("flash", MemType::FLASH | MemType::IN_FLASH, 131072);
    flash.page_size = 256;
    flash.num_pages = 512;
    flash.min_write_delay = 4500;
    flash.max_write_delay = 4500;
    flash.readback = [0xff, 0xff];
    flash.set_op(Op::ReadLo, op("0010 0000 aaaa aaaa aaaa aaaa oooo oooo"));
    flash.set_op(Op::ReadHi, op("0010 1000 aaaa aaaa aaaa aaaa oooo oooo"));
    flash.set_op(Op::LoadPageLo, op("0100 0000 xxxx xxxx xaaa aaaa iiii iiii"));
    flash.set_op(Op::LoadPageHi, op("0100 1000 xxxx xxxx xaaa aaaa iiii iiii"));
    flash.set_op(
        Op::WritePage,
        op("0100 1100 a15 a14 a13 a12 a11 a10 a9 a8 a7 xxx xxxx xxxx xxxx"),
    );
    flash.set_op(Op::ChipErase, op(CHIP_ERASE));
    flash.set_op(Op::PgmEnable, op(PGM_ENABLE));
    p.mems.push(flash);

    let mut eeprom = Memory::new("eeprom", MemType::EEPROM, 4096);
    eeprom.page_size = 8;
    eeprom.num_pages = 512;
    eeprom.min_write_delay = 3600;
    eeprom.max_write_delay = 3600;
    eeprom.readback = [0xff, 0xff];
    eeprom.set_op(Op::Read, op("1010 0000 000x aaaa aaaa aaaa oooo oooo"));
    eeprom.set_op(Op::Write, op("1100 0000 000x aaaa aaaa aaaa iiii iiii"));
    p.mems.push(eeprom);

    p.mems.push(Memory::new("fuses", MemType::FUSES, 3));
    p.mems.push(fuse(
        "lfuse",
        0,
        "0101 0000 0000 0000 xxxx xxxx oooo oooo",
        "1010 1100 1010 0000 xxxx xxxx iiii iiii",
        0xff,
        0x62,
    ));
    p.mems.push(fuse(
        "hfuse",
        1,
        "0101 1000 0000 1000 xxxx xxxx oooo oooo",
        "1010 1100 1010 1000 xxxx xxxx iiii iiii",
        0xff,
        0x99,
    ));
    p.mems.push(fuse(
        "efuse",
        2,
        "0101 0000 0000 1000 xxxx xxxx oooo oooo",
        "1010 1100 1010 0100 xxxx xxxx iiii iiii",
        0x07,
        0xff,
    ));
    p.mems.push(lock(
        "0101 1000 0000 0000 xxxx xxxx oooo oooo",
        "1010 1100 111x xxxx xxxx xxxx 11ii iiii",
        0x3f,
    ));
    p.mems.push(signature());
    p.mems.push(calibration());
    p
}

/// ATtiny2313: 2 KiB flash, the classic vector-bootloader target.
pub fn attiny2313() -> Part {
    let mut p = Part::new("t2313", "ATtiny2313", [0x1e, 0x91, 0x0a]);
    p.prog_modes = PgmModes::ISP | PgmModes::SPM | PgmModes::HVPP | PgmModes::DEBUGWIRE;
    p.n_interrupts = 19;
    p.chip_erase_delay = 9000;
    p.mcuid = 1;
    p.aliases = classic_aliases();

    let mut flash = Memory::new("flash", MemType::FLASH | MemType::IN_FLASH, 2048);
    flash.page_size = 32;
    flash.num_pages = 64;
    flash.min_write_delay = 4500;
    flash.max_write_delay = 4500;
    flash.readback = [0xff, 0xff];
    flash.set_op(Op::ReadLo, op("0010 0000 xxxx xxaa aaaa aaaa oooo oooo"));
    flash.set_op(Op::ReadHi, op("0010 1000 xxxx xxaa aaaa aaaa oooo oooo"));
    flash.set_op(Op::LoadPageLo, op("0100 0000 xxxx xxxx xxxx aaaa iiii iiii"));
    flash.set_op(Op::LoadPageHi, op("0100 1000 xxxx xxxx xxxx aaaa iiii iiii"));
    flash.set_op(
        Op::WritePage,
        op("0100 1100 xxxx xx a9 a8 a7 a6 a5 a4 xxxx xxxx xxxx"),
    );
    flash.set_op(Op::ChipErase, op(CHIP_ERASE));
    flash.set_op(Op::PgmEnable, op(PGM_ENABLE));
    p.mems.push(flash);

    let mut eeprom = Memory::new("eeprom", MemType::EEPROM, 128);
    eeprom.page_size = 4;
    eeprom.num_pages = 32;
    eeprom.min_write_delay = 4000;
    eeprom.max_write_delay = 4000;
    eeprom.readback = [0xff, 0xff];
    eeprom.set_op(Op::Read, op("1010 0000 000x xxxx xaaa aaaa oooo oooo"));
    eeprom.set_op(Op::Write, op("1100 0000 000x xxxx xaaa aaaa iiii iiii"));
    p.mems.push(eeprom);

    p.mems.push(Memory::new("fuses", MemType::FUSES, 3));
    p.mems.push(fuse(
        "lfuse",
        0,
        "0101 0000 0000 0000 xxxx xxxx oooo oooo",
        "1010 1100 1010 0000 xxxx xxxx iiii iiii",
        0xff,
        0x64,
    ));
    p.mems.push(fuse(
        "hfuse",
        1,
        "0101 1000 0000 1000 xxxx xxxx oooo oooo",
        "1010 1100 1010 1000 xxxx xxxx iiii iiii",
        0xff,
        0xdf,
    ));
    p.mems.push(fuse(
        "efuse",
        2,
        "0101 0000 0000 1000 xxxx xxxx oooo oooo",
        "1010 1100 1010 0100 xxxx xxxx iiii iiii",
        0x01,
        0xff,
    ));
    p.mems.push(lock(
        "0101 1000 0000 0000 xxxx xxxx oooo oooo",
        "1010 1100 111x xxxx xxxx xxxx 1111 11ii",
        0x03,
    ));
    p.mems.push(signature());
    p.mems.push(calibration());
    p
}

/// ATtiny13: 1 KiB flash.
pub fn attiny13() -> Part {
    let mut p = Part::new("t13", "ATtiny13", [0x1e, 0x90, 0x07]);
    p.prog_modes = PgmModes::ISP | PgmModes::SPM | PgmModes::HVSP | PgmModes::DEBUGWIRE;
    p.n_interrupts = 10;
    p.chip_erase_delay = 4000;
    p.mcuid = 0;
    p.aliases = classic_aliases();

    let mut flash = Memory::new("flash", MemType::FLASH | MemType::IN_FLASH, 1024);
    flash.page_size = 32;
    flash.num_pages = 32;
    flash.min_write_delay = 4500;
    flash.max_write_delay = 4500;
    flash.readback = [0xff, 0xff];
    flash.set_op(Op::ReadLo, op("0010 0000 xxxx xxxa aaaa aaaa oooo oooo"));
    flash.set_op(Op::ReadHi, op("0010 1000 xxxx xxxa aaaa aaaa oooo oooo"));
    flash.set_op(Op::LoadPageLo, op("0100 0000 xxxx xxxx xxxx aaaa iiii iiii"));
    flash.set_op(Op::LoadPageHi, op("0100 1000 xxxx xxxx xxxx aaaa iiii iiii"));
    flash.set_op(
        Op::WritePage,
        op("0100 1100 xxxx xxx a8 a7 a6 a5 a4 xxxx xxxx xxxx"),
    );
    flash.set_op(Op::ChipErase, op(CHIP_ERASE));
    flash.set_op(Op::PgmEnable, op(PGM_ENABLE));
    p.mems.push(flash);

    let mut eeprom = Memory::new("eeprom", MemType::EEPROM, 64);
    eeprom.page_size = 4;
    eeprom.num_pages = 16;
    eeprom.min_write_delay = 4000;
    eeprom.max_write_delay = 4000;
    eeprom.readback = [0xff, 0xff];
    eeprom.set_op(Op::Read, op("1010 0000 000x xxxx xxaa aaaa oooo oooo"));
    eeprom.set_op(Op::Write, op("1100 0000 000x xxxx xxaa aaaa iiii iiii"));
    p.mems.push(eeprom);

    p.mems.push(Memory::new("fuses", MemType::FUSES, 2));
    p.mems.push(fuse(
        "lfuse",
        0,
        "0101 0000 0000 0000 xxxx xxxx oooo oooo",
        "1010 1100 1010 0000 xxxx xxxx iiii iiii",
        0xff,
        0x6a,
    ));
    p.mems.push(fuse(
        "hfuse",
        1,
        "0101 1000 0000 1000 xxxx xxxx oooo oooo",
        "1010 1100 1010 1000 xxxx xxxx iiii iiii",
        0x1f,
        0xff,
    ));
    p.mems.push(lock(
        "0101 1000 0000 0000 xxxx xxxx oooo oooo",
        "1010 1100 111x xxxx xxxx xxxx 1111 11ii",
        0x03,
    ));
    p.mems.push(signature());
    p.mems.push(calibration());
    p
}

/// ATtiny10: reduced-core TPI part. Memories live in the NVM address
/// space; the offsets below are the data-space locations TPI uses.
pub fn attiny10() -> Part {
    let mut p = Part::new("t10", "ATtiny10", [0x1e, 0x90, 0x03]);
    p.prog_modes = PgmModes::TPI;
    p.n_interrupts = 11;
    p.chip_erase_delay = 32000;

    let mut flash = Memory::new("flash", MemType::FLASH | MemType::IN_FLASH, 1024);
    flash.page_size = 16;
    flash.num_pages = 64;
    flash.offset = 0x4000;
    flash.min_write_delay = 2000;
    flash.max_write_delay = 2000;
    flash.n_word_writes = 1;
    p.mems.push(flash);

    let mut f = Memory::new("fuse", MemType::IS_A_FUSE, 1);
    f.offset = 0x3f40;
    f.bitmask = 0x07;
    f.initval = Some(0xff);
    f.min_write_delay = 2000;
    f.max_write_delay = 2000;
    p.mems.push(f);

    let mut l = Memory::new("lock", MemType::LOCK, 1);
    l.offset = 0x3f00;
    l.bitmask = 0x03;
    l.min_write_delay = 2000;
    l.max_write_delay = 2000;
    p.mems.push(l);

    let mut sig = Memory::new("signature", MemType::SIGNATURE | MemType::READONLY, 3);
    sig.offset = 0x3fc0;
    p.mems.push(sig);

    p.aliases = classic_aliases();
    p
}

/// AT90S1200: unpaged flash and the read-latch quirk.
pub fn at90s1200() -> Part {
    let mut p = Part::new("1200", "AT90S1200", [0x1e, 0x90, 0x01]);
    p.prog_modes = PgmModes::ISP | PgmModes::HVPP;
    p.n_interrupts = 4;
    p.chip_erase_delay = 20000;
    p.preread_unsafe = true;

    let mut flash = Memory::new("flash", MemType::FLASH | MemType::IN_FLASH, 1024);
    flash.min_write_delay = 9000;
    flash.max_write_delay = 20000;
    flash.readback = [0x00, 0xff];
    flash.set_op(Op::ReadLo, op("0010 0000 xxxx xxxa aaaa aaaa oooo oooo"));
    flash.set_op(Op::ReadHi, op("0010 1000 xxxx xxxa aaaa aaaa oooo oooo"));
    flash.set_op(Op::WriteLo, op("0100 0000 xxxx xxxa aaaa aaaa iiii iiii"));
    flash.set_op(Op::WriteHi, op("0100 1000 xxxx xxxa aaaa aaaa iiii iiii"));
    flash.set_op(Op::ChipErase, op(CHIP_ERASE));
    flash.set_op(Op::PgmEnable, op(PGM_ENABLE));
    p.mems.push(flash);

    let mut eeprom = Memory::new("eeprom", MemType::EEPROM, 64);
    eeprom.min_write_delay = 9000;
    eeprom.max_write_delay = 20000;
    eeprom.readback = [0x00, 0xff];
    eeprom.set_op(Op::Read, op("1010 0000 000x xxxx xxaa aaaa oooo oooo"));
    eeprom.set_op(Op::Write, op("1100 0000 000x xxxx xxaa aaaa iiii iiii"));
    p.mems.push(eeprom);

    p.mems.push(signature());
    p
}

/// All built-in parts.
pub fn parts() -> Vec<Part> {
    vec![
        at90s1200(),
        attiny10(),
        attiny13(),
        attiny2313(),
        atmega328p(),
        atmega1284p(),
        atmega2560(),
    ]
}
