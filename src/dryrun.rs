//! Dryrun: an in-memory device emulation behind the programmer
//! interface.
//!
//! Initialise it against a part and it behaves like a freshly erased
//! specimen: ISP commands are decoded against the part's own opcode
//! templates, TPI accesses walk the NVM address space, paged operations
//! hit the emulated memories directly. Nothing leaves the process, which
//! makes it both a safe no-hardware target and the engine's test rig.

use log::debug;

use crate::error::{Error, Result};
use crate::led::Leds;
use crate::opcode::Op;
use crate::part::{Memory, Part, PgmModes};
use crate::pgm::{Capabilities, ConnType, PgmDesc, Programmer};
use crate::progress::Session;
use crate::tpi;

/// Operation counters, for curiosity and for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryStats {
    pub page_loads: usize,
    pub page_writes: usize,
    pub page_erases: usize,
    pub chip_erases: usize,
    pub spi_cmds: usize,
    pub tpi_cmds: usize,
}

#[derive(Default)]
struct TpiState {
    pointer: u16,
    nvmcmd: u8,
    nvm_enabled: bool,
}

/// The emulated-device programmer.
pub struct Dryrun {
    desc: PgmDesc,
    leds: Leds,
    /// Device-side image, cloned from the part on initialise.
    dev: Option<Part>,
    /// Treat flash writes as NOR (bits only go 1 -> 0).
    nor_flash: bool,
    page_buffer: Vec<(usize, u8)>,
    ext_addr: u32,
    tpi: TpiState,
    pub stats: DryStats,
}

impl Dryrun {
    pub fn new() -> Self {
        let mut desc = PgmDesc::new("dryrun", "Emulates programming without a programmer", ConnType::Usb);
        desc.prog_modes = PgmModes::ISP | PgmModes::TPI | PgmModes::SPM;
        Self {
            desc,
            leds: Leds::new(),
            dev: None,
            nor_flash: false,
            page_buffer: Vec::new(),
            ext_addr: 0,
            tpi: TpiState::default(),
            stats: DryStats::default(),
        }
    }

    /// Emulate NOR flash: writes can only clear bits, erases set them.
    pub fn with_nor_flash(mut self) -> Self {
        self.nor_flash = true;
        self
    }

    /// Direct view of an emulated memory, mainly for tests.
    pub fn device_mem(&self, name: &str) -> Option<&Memory> {
        self.dev.as_ref().and_then(|d| d.locate_mem(name))
    }

    /// Mutable view, for seeding device state in tests.
    pub fn device_mem_mut(&mut self, name: &str) -> Option<&mut Memory> {
        self.dev.as_mut().and_then(|d| d.locate_mem_mut(name))
    }

    fn dev_ref(&self) -> Result<&Part> {
        self.dev
            .as_ref()
            .ok_or_else(|| Error::Setup("dryrun used before initialize".into()))
    }

    fn dev_mut(&mut self) -> Result<&mut Part> {
        self.dev
            .as_mut()
            .ok_or_else(|| Error::Setup("dryrun used before initialize".into()))
    }

    /// Factory-fresh buffer contents for one memory.
    fn factory_reset(mem: &mut Memory, signature: [u8; 3]) {
        match () {
            _ if mem.mtype.is_signature() => {
                mem.buf.iter_mut().for_each(|b| *b = 0xff);
                mem.buf[..3.min(mem.size)]
                    .copy_from_slice(&signature[..3.min(mem.size)]);
            }
            _ if mem.mtype.is_a_fuse() || mem.mtype.is_lock() => {
                let iv = mem.initval.unwrap_or(0xffff);
                for (i, b) in mem.buf.iter_mut().enumerate() {
                    *b = (iv >> (8 * i.min(1))) as u8;
                }
            }
            _ => mem.buf.iter_mut().for_each(|b| *b = 0xff),
        }
    }

    fn store_byte(&mut self, name: &str, addr: usize, value: u8) -> Result<()> {
        let nor = self.nor_flash;
        let dev = self.dev_mut()?;
        let mem = dev
            .locate_mem_mut(name)
            .ok_or_else(|| Error::Setup(format!("no emulated memory {name}")))?;
        if addr >= mem.size {
            return Err(Error::Device(format!("address {addr:#06x} beyond {name}")));
        }
        if nor && mem.mtype.in_flash() {
            mem.buf[addr] &= value;
        } else {
            mem.buf[addr] = value;
        }
        Ok(())
    }

    fn erase_all(&mut self) -> Result<()> {
        let dev = self.dev_mut()?;
        for mem in &mut dev.mems {
            if mem.mtype.in_flash() || mem.mtype.is_eeprom() || mem.mtype.is_lock() {
                let sig = dev.signature;
                Self::factory_reset(mem, sig);
            }
        }
        Ok(())
    }

    // - MARK: ISP emulation

    /// Decode a 4-byte ISP command against the part's templates and act
    /// on the emulated memories. The response mimics the AVR byte echo.
    fn isp_execute(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
        self.stats.spi_cmds += 1;
        let mut res = [0, cmd[0], cmd[1], cmd[2]];
        let dev = self.dev_ref()?;

        // find the template whose fixed bits match
        let mut hit: Option<(String, Op, u32, u8)> = None;
        'outer: for mem in &dev.mems {
            for opk in Op::ALL {
                let Some(t) = mem.op(opk) else { continue };
                let mut probe = *cmd;
                t.set_bits(&mut probe);
                t.set_addr(&mut probe, t.extract_addr(cmd));
                t.set_input(&mut probe, t.extract_input(cmd));
                if probe == *cmd {
                    hit = Some((
                        mem.name.clone(),
                        opk,
                        t.extract_addr(cmd),
                        t.extract_input(cmd),
                    ));
                    break 'outer;
                }
            }
        }
        let Some((name, opk, mut caddr, data)) = hit else {
            debug!("dryrun: unrecognised command {cmd:02x?}");
            return Ok(res);
        };

        let mem = dev.locate_mem(&name).cloned().ok_or(Error::Unsupported)?;
        let fuse_mask = dev.mem_bitmask(&mem, caddr as usize);
        let word_addressed = mem.op(Op::ReadLo).is_some() || mem.op(Op::LoadPageLo).is_some();
        if word_addressed && mem.mtype.in_flash() && mem.size / 2 > 0x1_0000 {
            caddr |= self.ext_addr << 16;
        }

        match opk {
            Op::Read => {
                let t = mem.op(opk).ok_or(Error::Unsupported)?;
                let b = *mem.buf.get(caddr as usize).unwrap_or(&0xff);
                t.set_output(&mut res, b);
            }
            Op::ReadLo | Op::ReadHi => {
                let t = mem.op(opk).ok_or(Error::Unsupported)?;
                let a = caddr as usize * 2 + usize::from(opk == Op::ReadHi);
                let b = *mem.buf.get(a).unwrap_or(&0xff);
                t.set_output(&mut res, b);
            }
            Op::Write => {
                let value = if mem.mtype.is_a_fuse() || mem.mtype.is_lock() {
                    // unwritable bits keep whatever the device holds
                    let cur = *mem.buf.get(caddr as usize).unwrap_or(&0xff);
                    (data & fuse_mask) | (cur & !fuse_mask)
                } else {
                    data
                };
                self.store_byte(&name, caddr as usize, value)?;
            }
            Op::WriteLo | Op::WriteHi => {
                let a = caddr as usize * 2 + usize::from(opk == Op::WriteHi);
                self.store_byte(&name, a, data)?;
            }
            Op::LoadPageLo | Op::LoadPageHi => {
                let a = caddr as usize * 2 + usize::from(opk == Op::LoadPageHi);
                self.page_buffer.push((a, data));
            }
            Op::WritePage => {
                let base = caddr as usize * 2 & !(mem.page_size.max(1) - 1);
                let entries: Vec<(usize, u8)> = self.page_buffer.drain(..).collect();
                for (a, v) in entries {
                    // the page buffer only commits inside the addressed page
                    let a = base + (a & (mem.page_size.max(1) - 1));
                    self.store_byte(&name, a, v)?;
                }
                self.stats.page_writes += 1;
            }
            Op::LoadExtAddr => {
                self.ext_addr = caddr >> 16;
            }
            Op::ChipErase => {
                self.erase_all()?;
                self.stats.chip_erases += 1;
            }
            Op::PgmEnable => {}
        }
        Ok(res)
    }

    // - MARK: TPI emulation

    fn tpi_mem_at(&self, addr: usize) -> Option<(String, usize)> {
        let dev = self.dev.as_ref()?;
        dev.mems
            .iter()
            .find(|m| addr >= m.offset && addr < m.offset + m.size)
            .map(|m| (m.name.clone(), addr - m.offset))
    }

    fn tpi_execute(&mut self, cmd: &[u8], res: &mut [u8]) -> Result<()> {
        self.stats.tpi_cmds += 1;
        let op = cmd[0];
        match op {
            tpi::SSTPR_LO => self.tpi.pointer = (self.tpi.pointer & 0xff00) | u16::from(cmd[1]),
            tpi::SSTPR_HI => {
                self.tpi.pointer = (self.tpi.pointer & 0x00ff) | (u16::from(cmd[1]) << 8)
            }
            tpi::SLD | tpi::SLD_PI => {
                let addr = self.tpi.pointer as usize;
                let b = match self.tpi_mem_at(addr) {
                    Some((name, off)) => {
                        let dev = self.dev_ref()?;
                        *dev
                            .locate_mem(&name)
                            .and_then(|m| m.buf.get(off))
                            .unwrap_or(&0xff)
                    }
                    None => 0xff,
                };
                if let Some(slot) = res.first_mut() {
                    *slot = b;
                }
                if op == tpi::SLD_PI {
                    self.tpi.pointer = self.tpi.pointer.wrapping_add(1);
                }
                return Ok(());
            }
            tpi::SST | tpi::SST_PI => {
                let addr = self.tpi.pointer as usize;
                let data = cmd[1];
                match self.tpi.nvmcmd {
                    tpi::NVMCMD_CHIP_ERASE => {
                        self.erase_all()?;
                        self.stats.chip_erases += 1;
                    }
                    tpi::NVMCMD_SECTION_ERASE => {
                        if let Some((name, _)) = self.tpi_mem_at(addr) {
                            let dev = self.dev_mut()?;
                            if let Some(m) = dev.locate_mem_mut(&name) {
                                if !m.mtype.is_readonly() {
                                    m.buf.iter_mut().for_each(|b| *b = 0xff);
                                }
                            }
                            self.stats.page_erases += 1;
                        }
                    }
                    tpi::NVMCMD_WORD_WRITE => {
                        if let Some((name, off)) = self.tpi_mem_at(addr) {
                            let dev = self.dev_mut()?;
                            if let Some(m) = dev.locate_mem_mut(&name) {
                                if off < m.size && !m.mtype.is_readonly() {
                                    m.buf[off] = data;
                                }
                            }
                        }
                    }
                    _ => {}
                }
                if op == tpi::SST_PI {
                    self.tpi.pointer = self.tpi.pointer.wrapping_add(1);
                }
            }
            tpi::SKEY => self.tpi.nvm_enabled = true,
            _ if op == tpi::sout(tpi::IO_NVMCMD) => self.tpi.nvmcmd = cmd[1],
            _ if op == tpi::sin(tpi::IO_NVMCSR) => {
                // never busy
                if let Some(slot) = res.first_mut() {
                    *slot = 0;
                }
            }
            _ if op == tpi::sldcs(tpi::REG_TPISR) => {
                if let Some(slot) = res.first_mut() {
                    *slot = if self.tpi.nvm_enabled {
                        tpi::TPISR_NVMEN
                    } else {
                        0
                    };
                }
            }
            _ => debug!("dryrun: unrecognised TPI command {cmd:02x?}"),
        }
        Ok(())
    }
}

impl Default for Dryrun {
    fn default() -> Self {
        Self::new()
    }
}

impl Programmer for Dryrun {
    fn desc(&self) -> &PgmDesc {
        &self.desc
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::CMD
            | Capabilities::CMD_TPI
            | Capabilities::PAGED_LOAD
            | Capabilities::PAGED_WRITE
            | Capabilities::PAGE_ERASE
            | Capabilities::CHIP_ERASE
            | Capabilities::READ_SIG_BYTES
            | Capabilities::UNLOCK
    }

    fn leds(&self) -> &Leds {
        &self.leds
    }

    fn leds_mut(&mut self) -> &mut Leds {
        &mut self.leds
    }

    fn open(&mut self, _s: &mut Session, port: &str) -> Result<()> {
        debug!("dryrun session on {port}");
        Ok(())
    }

    fn initialize(&mut self, _s: &mut Session, p: &Part) -> Result<()> {
        let mut dev = p.clone();
        let sig = dev.signature;
        for mem in &mut dev.mems {
            mem.clear();
            Self::factory_reset(mem, sig);
        }
        self.dev = Some(dev);
        self.page_buffer.clear();
        self.ext_addr = 0;
        self.tpi = TpiState::default();
        Ok(())
    }

    fn program_enable(&mut self, _s: &mut Session, _p: &Part) -> Result<()> {
        self.dev_ref().map(|_| ())
    }

    fn chip_erase(&mut self, _s: &mut Session, _p: &Part) -> Result<()> {
        self.erase_all()?;
        self.stats.chip_erases += 1;
        Ok(())
    }

    fn unlock(&mut self, _s: &mut Session, _p: &Part) -> Result<()> {
        let dev = self.dev_mut()?;
        let sig = dev.signature;
        if let Some(lock) = dev.mems.iter_mut().find(|m| m.mtype.is_lock()) {
            Self::factory_reset(lock, sig);
        }
        Ok(())
    }

    fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
        self.isp_execute(cmd)
    }

    fn cmd_tpi(&mut self, cmd: &[u8], res: &mut [u8]) -> Result<()> {
        if cmd.is_empty() {
            return Err(Error::Setup("empty TPI command".into()));
        }
        self.tpi_execute(cmd, res)
    }

    fn paged_load(
        &mut self,
        _s: &mut Session,
        _p: &Part,
        m: &mut Memory,
        _page_size: usize,
        addr: usize,
        n_bytes: usize,
    ) -> Result<()> {
        let dev = self.dev_ref()?;
        let src = dev
            .locate_mem(&m.name)
            .ok_or_else(|| Error::Setup(format!("no emulated memory {}", m.name)))?;
        if addr + n_bytes > src.size {
            return Err(Error::Device(format!(
                "paged load beyond {}: {:#06x}+{}",
                m.name, addr, n_bytes
            )));
        }
        m.buf[addr..addr + n_bytes].copy_from_slice(&src.buf[addr..addr + n_bytes]);
        self.stats.page_loads += 1;
        Ok(())
    }

    fn paged_write(
        &mut self,
        _s: &mut Session,
        _p: &Part,
        m: &Memory,
        _page_size: usize,
        addr: usize,
        n_bytes: usize,
    ) -> Result<()> {
        let nor = self.nor_flash;
        let dev = self.dev_mut()?;
        let dst = dev
            .locate_mem_mut(&m.name)
            .ok_or_else(|| Error::Setup(format!("no emulated memory {}", m.name)))?;
        if addr + n_bytes > dst.size {
            return Err(Error::Device(format!(
                "paged write beyond {}: {:#06x}+{}",
                m.name, addr, n_bytes
            )));
        }
        for i in 0..n_bytes {
            if nor && dst.mtype.in_flash() {
                dst.buf[addr + i] &= m.buf[addr + i];
            } else {
                dst.buf[addr + i] = m.buf[addr + i];
            }
        }
        self.stats.page_writes += 1;
        Ok(())
    }

    fn page_erase(&mut self, _s: &mut Session, p: &Part, m: &Memory, addr: usize) -> Result<()> {
        let span = m.page_size.max(1) * p.n_page_erase.max(1);
        let base = addr - addr % span;
        let dev = self.dev_mut()?;
        let dst = dev
            .locate_mem_mut(&m.name)
            .ok_or_else(|| Error::Setup(format!("no emulated memory {}", m.name)))?;
        for b in dst.buf[base..(base + span).min(dst.size)].iter_mut() {
            *b = 0xff;
        }
        self.stats.page_erases += 1;
        Ok(())
    }

    fn read_sig_bytes(&mut self, _s: &mut Session, _p: &Part, m: &mut Memory) -> Result<()> {
        let dev = self.dev_ref()?;
        let src = dev
            .locate_mem("signature")
            .ok_or_else(|| Error::Setup("no emulated signature".into()))?;
        let n = m.size.min(src.size);
        m.buf[..n].copy_from_slice(&src.buf[..n]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::registry;

    fn init(p: &Part) -> (Dryrun, Session) {
        let mut dr = Dryrun::new();
        let mut s = Session::new();
        dr.open(&mut s, "dryrun").unwrap();
        dr.initialize(&mut s, p).unwrap();
        (dr, s)
    }

    #[test]
    fn fresh_device_reads_erased_flash_and_factory_fuses() {
        let p = registry::atmega328p();
        let (dr, _) = init(&p);
        assert_eq!(dr.device_mem("flash").unwrap().buf[0], 0xff);
        assert_eq!(dr.device_mem("lfuse").unwrap().buf[0], 0x62);
        assert_eq!(dr.device_mem("signature").unwrap().buf[..3], p.signature);
    }

    #[test]
    fn isp_read_signature_via_templates() {
        let p = registry::atmega328p();
        let (mut dr, _) = init(&p);
        // signature read: 0x30 0x00 <idx> 0x00
        for (i, want) in p.signature.iter().enumerate() {
            let res = dr.cmd(&[0x30, 0x00, i as u8, 0x00]).unwrap();
            assert_eq!(res[3], *want);
        }
    }

    #[test]
    fn isp_fuse_write_keeps_unwritable_bits() {
        let p = registry::atmega328p();
        let (mut dr, _) = init(&p);
        // efuse bitmask 0x07, factory 0xff: writing 0xa5 keeps the
        // high bits and lands as 0xfd
        let res = dr.cmd(&[0xac, 0xa4, 0x00, 0xa5]).unwrap();
        assert_eq!(res[2], 0xa4); // echo
        assert_eq!(dr.device_mem("efuse").unwrap().buf[0], 0xfd);
        // efuse read: 0x50 0x08
        let res = dr.cmd(&[0x50, 0x08, 0x00, 0x00]).unwrap();
        assert_eq!(res[3], 0xfd);
    }

    #[test]
    fn isp_page_buffer_commits_on_write_page() {
        let p = registry::atmega328p();
        let (mut dr, _) = init(&p);
        // load word 0 of page at byte 0x80: lo 0x11, hi 0x22
        dr.cmd(&[0x40, 0x00, 0x40, 0x11]).unwrap();
        dr.cmd(&[0x48, 0x00, 0x40, 0x22]).unwrap();
        // commit page containing word address 0x40
        dr.cmd(&[0x4c, 0x00, 0x40, 0x00]).unwrap();
        let flash = dr.device_mem("flash").unwrap();
        assert_eq!(flash.buf[0x80], 0x11);
        assert_eq!(flash.buf[0x81], 0x22);
        assert_eq!(dr.stats.page_writes, 1);
    }

    #[test]
    fn isp_chip_erase_resets_flash() {
        let p = registry::atmega328p();
        let (mut dr, mut s) = init(&p);
        let m = p.locate_mem("flash").unwrap().clone();
        dr.paged_write(&mut s, &p, &{
            let mut m = m.clone();
            m.buf[0] = 0x42;
            m
        }, 128, 0, 128)
            .unwrap();
        assert_eq!(dr.device_mem("flash").unwrap().buf[0], 0x42);
        dr.cmd(&[0xac, 0x80, 0x00, 0x00]).unwrap();
        assert_eq!(dr.device_mem("flash").unwrap().buf[0], 0xff);
        assert_eq!(dr.stats.chip_erases, 1);
    }

    #[test]
    fn tpi_pointer_walk_reads_signature() {
        let p = registry::attiny10();
        let (mut dr, _) = init(&p);
        tpi::set_pointer(&mut dr, 0x3fc0).unwrap();
        let mut got = [0u8; 3];
        for slot in got.iter_mut() {
            *slot = tpi::read_byte_pi(&mut dr).unwrap();
        }
        assert_eq!(got, p.signature);
    }

    #[test]
    fn tpi_word_write_lands_in_flash() {
        let p = registry::attiny10();
        let (mut dr, _) = init(&p);
        tpi::set_nvmcmd(&mut dr, tpi::NVMCMD_WORD_WRITE).unwrap();
        tpi::set_pointer(&mut dr, 0x4010).unwrap();
        tpi::write_word_pi(&mut dr, 0xaa, 0x55).unwrap();
        let flash = dr.device_mem("flash").unwrap();
        assert_eq!(flash.buf[0x10], 0xaa);
        assert_eq!(flash.buf[0x11], 0x55);
    }
}
