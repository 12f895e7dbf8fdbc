//! Generic read/write/verify engine.
//!
//! Drives byte- and page-oriented transfers through a [`Programmer`],
//! honouring allocation tags, page geometry and NOR flash semantics.
//! Progress and LED updates happen here; back-ends only move bytes.

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::led::{self, Led};
use crate::opcode::{Op, Opcode};
use crate::part::{MemType, Memory, Part, PgmModes, TAG_ALLOCATED};
use crate::pgm::{Capabilities, Programmer};
use crate::progress::{self, Session};
use crate::tpi;

/// Readback poll retries inside one byte write, each a max-delay wait.
const WRITE_POLL_TRIES: u32 = 5;

/// Trailing-0xff bound of a flash image: the smallest even index
/// strictly greater than the highest non-0xff byte. Flash readers and
/// writers can stop there.
pub fn mem_hiaddr(mem: &Memory) -> usize {
    let mut hi = 0;
    for (i, &b) in mem.buf.iter().enumerate() {
        if b != 0xff {
            hi = i + 1;
        }
    }
    (hi + 1) & !1
}

fn read_return(s: &Session, mem: &Memory) -> usize {
    if mem.mtype.in_flash() && !s.read_full_flash {
        mem_hiaddr(mem)
    } else {
        mem.size
    }
}

fn take_mem(p: &mut Part, idx: usize) -> Memory {
    std::mem::replace(&mut p.mems[idx], Memory::new("", MemType::empty(), 0))
}

// - MARK: read

/// Read all of memory `memname` of `p` into its buffer.
///
/// With a reference part, only bytes tagged ALLOCATED in the reference's
/// same-named memory are fetched; the rest stays at the 0xff fill.
/// Returns [`mem_hiaddr`] for flash-type memories (unless the session
/// disables trimming), the memory size otherwise.
pub fn read_mem<P: Programmer + ?Sized>(
    pgm: &mut P,
    s: &mut Session,
    p: &mut Part,
    memname: &str,
    vref: Option<&Part>,
) -> Result<usize> {
    let idx = p
        .mem_index(memname)
        .ok_or_else(|| Error::Setup(format!("no memory {memname} in part {}", p.desc)))?;

    led::led_clr(pgm, s, Led::Err);
    led::led_set(pgm, s, Led::Pgm);
    s.progress_begin("Reading");

    let mut mem = take_mem(p, idx);
    let refmem = vref.and_then(|r| r.locate_mem(memname));
    let result = read_mem_taken(pgm, s, p, &mut mem, refmem);
    p.mems[idx] = mem;

    match &result {
        Ok(_) => {
            s.progress_end(true);
            led::led_clr(pgm, s, Led::Pgm);
        }
        Err(_) => {
            s.progress_end(false);
            led::led_set(pgm, s, Led::Err);
            led::led_clr(pgm, s, Led::Pgm);
        }
    }
    result
}

fn read_mem_taken<P: Programmer + ?Sized>(
    pgm: &mut P,
    s: &mut Session,
    p: &Part,
    mem: &mut Memory,
    refmem: Option<&Memory>,
) -> Result<usize> {
    mem.clear();
    if mem.size == 0 {
        return Ok(0);
    }
    let needed = |i: usize| refmem.map_or(true, |r| i < r.size && r.tags[i] & TAG_ALLOCATED != 0);

    // TPI pageable memories: pointer register plus load-post-increment
    if p.has_mode(PgmModes::TPI) && mem.paged() {
        if !pgm.capabilities().contains(Capabilities::CMD_TPI) {
            return Err(Error::Unsupported);
        }
        tpi::nvm_wait(pgm, s)?;
        tpi::set_nvmcmd(pgm, tpi::NVMCMD_NO_OPERATION)?;
        let mut ptr_valid = false;
        for i in 0..mem.size {
            if !needed(i) {
                // gap: the auto-increment pointer is stale now
                ptr_valid = false;
                continue;
            }
            if !ptr_valid {
                tpi::set_pointer(pgm, (mem.offset + i) as u16)?;
                ptr_valid = true;
            }
            mem.buf[i] = tpi::read_byte_pi(pgm)?;
            s.progress_step(i + 1, mem.size);
        }
        return Ok(read_return(s, mem));
    }

    let caps = pgm.capabilities();
    let mut byte_from = 0;
    if caps.contains(Capabilities::PAGED_LOAD) && mem.paged() && mem.size % mem.page_size == 0 {
        let page = mem.page_size;
        let mut fallback = None;
        for base in (0..mem.size).step_by(page) {
            let wanted = refmem.map_or(true, |r| r.any_allocated(base, (base + page).min(r.size)));
            if !wanted {
                s.progress_step(base + page, mem.size);
                continue;
            }
            if let Err(e) = pgm.paged_load(s, p, mem, page, base, page) {
                debug!(
                    "paged load of {} failed at {:#06x} ({}); falling back to byte reads",
                    mem.name, base, e
                );
                fallback = Some(base);
                break;
            }
            s.progress_step(base + page, mem.size);
        }
        match fallback {
            None => return Ok(read_return(s, mem)),
            Some(base) => byte_from = base,
        }
    }

    if byte_from == 0 && mem.mtype.is_signature() && caps.contains(Capabilities::READ_SIG_BYTES) {
        pgm.read_sig_bytes(s, p, mem)?;
        return Ok(read_return(s, mem));
    }

    for i in byte_from..mem.size {
        if !needed(i) {
            continue;
        }
        mem.buf[i] = match pgm.read_byte(s, p, mem, i) {
            Ok(b) => b,
            Err(Error::Unsupported) => return Err(Error::Unsupported),
            Err(e) => {
                debug!("byte read of {} at {:#06x} failed: {}", mem.name, i, e);
                return Err(Error::SoftFail);
            }
        };
        s.progress_step(i + 1, mem.size);
    }
    Ok(read_return(s, mem))
}

// - MARK: write

/// Write up to `size` bytes of memory `memname` from its buffer, where
/// tagged ALLOCATED. `size <= 0` is a no-op returning `size`.
pub fn write_mem<P: Programmer + ?Sized>(
    pgm: &mut P,
    s: &mut Session,
    p: &mut Part,
    memname: &str,
    size: isize,
    auto_erase: bool,
) -> Result<isize> {
    if size <= 0 {
        return Ok(size);
    }
    let idx = p
        .mem_index(memname)
        .ok_or_else(|| Error::Setup(format!("no memory {memname} in part {}", p.desc)))?;

    led::led_clr(pgm, s, Led::Err);
    led::led_set(pgm, s, Led::Pgm);
    s.progress_begin("Writing");

    let mut mem = take_mem(p, idx);
    let result = write_mem_taken(pgm, s, p, &mut mem, size as usize, auto_erase);
    p.mems[idx] = mem;

    match &result {
        Ok(_) => {
            s.progress_end(true);
            led::led_clr(pgm, s, Led::Pgm);
        }
        Err(_) => {
            s.progress_end(false);
            led::led_set(pgm, s, Led::Err);
            led::led_clr(pgm, s, Led::Pgm);
        }
    }
    result.map(|n| n as isize)
}

fn write_mem_taken<P: Programmer + ?Sized>(
    pgm: &mut P,
    s: &mut Session,
    p: &Part,
    mem: &mut Memory,
    mut wsize: usize,
    auto_erase: bool,
) -> Result<usize> {
    if wsize > mem.size {
        warn!(
            "{} bytes requested, but memory {} holds only {}; truncating",
            wsize, mem.name, mem.size
        );
        wsize = mem.size;
    }

    if mem.mtype.in_flash() && pgm.capabilities().contains(Capabilities::FLASH_WRITE_HOOK) {
        pgm.flash_write_hook(s, p, mem)?;
        // the hook may have tagged bytes beyond the requested size
        let tagged_end = mem
            .tags
            .iter()
            .rposition(|t| t & TAG_ALLOCATED != 0)
            .map_or(0, |i| i + 1);
        wsize = wsize.max(tagged_end).min(mem.size);
    }

    if p.has_mode(PgmModes::TPI) {
        if mem.size == 1 {
            // single-byte fuse or lock: plain byte write
            if mem.allocated(0) {
                pgm.write_byte(s, p, mem, 0, mem.buf[0])?;
            }
            return Ok(wsize);
        }
        return tpi_write_chunks(pgm, s, mem, wsize);
    }

    if pgm.capabilities().contains(Capabilities::PAGED_WRITE) && mem.paged() {
        match paged_write_all(pgm, s, p, mem, wsize, auto_erase) {
            Ok(n) => return Ok(n),
            Err((resume_at, e)) => {
                debug!(
                    "paged write of {} failed at {:#06x} ({}); falling back to byte writes",
                    mem.name, resume_at, e
                );
                byte_write_range(pgm, s, p, mem, resume_at, wsize)?;
                return Ok(wsize);
            }
        }
    }

    byte_write_range(pgm, s, p, mem, 0, wsize)
}

fn tpi_write_chunks<P: Programmer + ?Sized>(
    pgm: &mut P,
    s: &mut Session,
    mem: &mut Memory,
    wsize: usize,
) -> Result<usize> {
    let nww = mem.n_word_writes as usize;
    if nww != 1 && nww != 2 && nww != 4 {
        return Err(Error::Setup(format!(
            "invalid n_word_writes {} for TPI memory {}; must be 1, 2 or 4",
            nww, mem.name
        )));
    }
    if !pgm.capabilities().contains(Capabilities::CMD_TPI) {
        return Err(Error::Unsupported);
    }
    let chunk = 2 * nww;
    let aligned = wsize.div_ceil(chunk) * chunk;
    let aligned = aligned.min(mem.size);

    tpi::nvm_wait(pgm, s)?;
    let mut ptr_valid = false;
    for base in (0..aligned).step_by(chunk) {
        let end = (base + chunk).min(mem.size);
        if !mem.any_allocated(base, end) {
            ptr_valid = false;
            s.progress_step(end, aligned);
            continue;
        }
        tpi::set_nvmcmd(pgm, tpi::NVMCMD_WORD_WRITE)?;
        if !ptr_valid {
            tpi::set_pointer(pgm, (mem.offset + base) as u16)?;
            ptr_valid = true;
        }
        for w in 0..nww {
            let i = base + 2 * w;
            let lo = mem.buf.get(i).copied().unwrap_or(0xff);
            let hi = mem.buf.get(i + 1).copied().unwrap_or(0xff);
            tpi::write_word_pi(pgm, lo, hi)?;
        }
        tpi::nvm_wait(pgm, s)?;
        s.progress_step(end, aligned);
    }
    Ok(wsize)
}

/// Paged write path. On a page-level failure returns the address to
/// resume byte-wise from.
fn paged_write_all<P: Programmer + ?Sized>(
    pgm: &mut P,
    s: &mut Session,
    p: &Part,
    mem: &mut Memory,
    wsize: usize,
    auto_erase: bool,
) -> std::result::Result<usize, (usize, Error)> {
    let page = mem.page_size;
    // some parts erase several pages at once
    let epage = page * p.n_page_erase.max(1);
    let caps = pgm.capabilities();

    // NOR semantics: a partial effective page would erase the bytes we
    // do not have, so read the device and fill the holes first.
    let mut scratch: Option<Memory> = None;
    for base in (0..wsize).step_by(epage) {
        let end = (base + epage).min(mem.size);
        if !mem.any_allocated(base, end) {
            continue;
        }
        let holes = (base..end).any(|i| !mem.allocated(i));
        if !holes {
            continue;
        }
        let sc = scratch.get_or_insert_with(|| {
            let mut m = mem.clone();
            m.clear();
            m
        });
        let mut have_device = true;
        for pbase in (base..end).step_by(page) {
            if pgm.paged_load(s, p, sc, page, pbase, page).is_err() {
                have_device = false;
                break;
            }
        }
        for i in base..end {
            if !mem.allocated(i) {
                mem.buf[i] = if have_device { sc.buf[i] } else { 0xff };
            }
        }
    }

    for base in (0..wsize).step_by(epage) {
        let end = (base + epage).min(mem.size);
        if !mem.any_allocated(base, end) {
            s.progress_step(end, wsize);
            continue;
        }
        if auto_erase && caps.contains(Capabilities::PAGE_ERASE) && !mem.mtype.is_eeprom() {
            if let Err(e) = pgm.page_erase(s, p, mem, base) {
                warn!("page erase at {:#06x} failed: {}", base, e);
            }
        }
        for pbase in (base..end).step_by(page) {
            if !mem.any_allocated(pbase, (pbase + page).min(mem.size)) {
                continue;
            }
            if let Err(e) = pgm.paged_write(s, p, mem, page, pbase, page) {
                return Err((pbase, e));
            }
        }
        s.progress_step(end, wsize);
    }
    Ok(wsize)
}

fn byte_write_range<P: Programmer + ?Sized>(
    pgm: &mut P,
    s: &mut Session,
    p: &Part,
    mem: &mut Memory,
    from: usize,
    mut wsize: usize,
) -> Result<usize> {
    pgm.write_setup(s, p, mem)?;

    let flash_paged = mem.mtype.in_flash() && mem.paged();
    if flash_paged && wsize % 2 != 0 {
        // loadpage works on words
        wsize = (wsize + 1).min(mem.size);
    }
    let page = mem.page_size.max(1);
    let mut page_tainted = false;

    for i in from..wsize {
        if flash_paged {
            if mem.allocated(i) {
                pgm.write_byte(s, p, mem, i, mem.buf[i])?;
                page_tainted = true;
            }
            let page_end = i % page == page - 1 || i == wsize - 1;
            if page_end && page_tainted {
                write_page(pgm, s, p, mem, i)?;
                page_tainted = false;
            }
        } else if mem.allocated(i) {
            pgm.write_byte(s, p, mem, i, mem.buf[i])?;
        }
        s.progress_step(i + 1 - from, wsize - from);
    }
    Ok(wsize)
}

/// Commit the device-side page buffer holding `addr`.
pub fn write_page<P: Programmer + ?Sized>(
    pgm: &mut P,
    s: &mut Session,
    p: &Part,
    mem: &Memory,
    addr: usize,
) -> Result<()> {
    let _ = (s, p);
    let op = mem
        .op(Op::WritePage)
        .ok_or_else(|| Error::Setup(format!("memory {} has no write-page instruction", mem.name)))?;
    let waddr = if mem.mtype.in_flash() {
        (addr / 2) as u32
    } else {
        addr as u32
    };
    load_ext_addr(pgm, mem, waddr)?;
    let mut cmd = [0u8; 4];
    op.set_bits(&mut cmd);
    op.set_addr(&mut cmd, waddr);
    pgm.cmd(&cmd)?;
    progress::usleep(mem.max_write_delay);
    Ok(())
}

fn load_ext_addr<P: Programmer + ?Sized>(pgm: &mut P, mem: &Memory, waddr: u32) -> Result<()> {
    if let Some(lea) = mem.op(Op::LoadExtAddr) {
        let mut cmd = [0u8; 4];
        lea.set_bits(&mut cmd);
        lea.set_addr(&mut cmd, waddr);
        pgm.cmd(&cmd)?;
    }
    Ok(())
}

// - MARK: byte primitives

/// Default single-byte write over the programmer's SPI/TPI primitives.
pub fn write_byte_default<P: Programmer + ?Sized>(
    pgm: &mut P,
    s: &mut Session,
    p: &Part,
    mem: &Memory,
    addr: usize,
    mut data: u8,
) -> Result<()> {
    if mem.mtype.is_readonly() {
        // writing the value already there is fine, anything else is not
        let cur = pgm.read_byte(s, p, mem, addr)?;
        if cur == data {
            return Ok(());
        }
        return Err(Error::Setup(format!(
            "cannot write {:#04x} to read-only memory {} of {}",
            data, mem.name, p.desc
        )));
    }

    if mem.mtype.is_a_fuse() || mem.mtype.is_lock() || mem.mtype.is_fuses() {
        let mask = p.mem_bitmask(mem, addr);
        if mask != 0xff {
            // bits outside the mask come from the device, or failing
            // that from the factory default
            let can_read = readable(mem) || p.has_mode(PgmModes::TPI);
            let cur = if can_read && !p.preread_unsafe {
                pgm.read_byte(s, p, mem, addr).ok()
            } else {
                None
            }
            .or_else(|| mem.initval.map(|iv| (iv >> (8 * addr.min(1))) as u8));
            let cur = cur.unwrap_or_else(|| {
                debug!("no current value for masked {} write; assuming erased", mem.name);
                0xff
            });
            data = (cur & !mask) | (data & mask);
        }
    }

    if p.has_mode(PgmModes::TPI) {
        if !pgm.capabilities().contains(Capabilities::CMD_TPI) {
            return Err(Error::Unsupported);
        }
        if mem.mtype.in_flash() {
            return Err(Error::Setup(
                "TPI flash is written in words, not bytes".into(),
            ));
        }
        if addr % 2 != 0 {
            return Err(Error::Setup(format!(
                "TPI byte writes must start on an even address, not {addr:#06x}"
            )));
        }
        let dev_addr = (mem.offset + addr) as u16;
        tpi::nvm_wait(pgm, s)?;
        if mem.mtype.is_a_fuse() {
            tpi::section_erase(pgm, s, dev_addr)?;
        }
        tpi::set_nvmcmd(pgm, tpi::NVMCMD_WORD_WRITE)?;
        tpi::set_pointer(pgm, dev_addr)?;
        tpi::write_word_pi(pgm, data, 0xff)?;
        return tpi::nvm_wait(pgm, s);
    }

    // pick the instruction variant
    let flash_paged = mem.mtype.in_flash() && mem.paged();
    let (opk, caddr) = if flash_paged {
        let k = if addr % 2 == 0 {
            Op::LoadPageLo
        } else {
            Op::LoadPageHi
        };
        (k, (addr / 2) as u32)
    } else if mem.op(Op::WriteLo).is_some() {
        let k = if addr % 2 == 0 { Op::WriteLo } else { Op::WriteHi };
        (k, (addr / 2) as u32)
    } else {
        (Op::Write, addr as u32)
    };
    let Some(op) = mem.op(opk) else {
        return Err(Error::Unsupported);
    };

    if !flash_paged && !p.preread_unsafe && readable(mem) {
        // skip the write when the device already holds the value
        if let Ok(cur) = pgm.read_byte(s, p, mem, addr) {
            if cur == data {
                return Ok(());
            }
        }
    }

    load_ext_addr(pgm, mem, caddr)?;
    let mut cmd = [0u8; 4];
    op.set_bits(&mut cmd);
    op.set_addr(&mut cmd, caddr);
    op.set_input(&mut cmd, data);
    pgm.cmd(&cmd)?;

    if flash_paged {
        // only the page buffer was loaded; write_page commits it
        return Ok(());
    }

    // poll by readback unless the value aliases the busy patterns or the
    // memory cannot be read at all
    let pollable = readable(mem) && data != mem.readback[0] && data != mem.readback[1];
    if !pollable {
        progress::usleep(mem.max_write_delay);
        return Ok(());
    }

    progress::usleep(mem.min_write_delay);
    for _ in 0..WRITE_POLL_TRIES {
        if pgm.read_byte(s, p, mem, addr)? == data {
            return Ok(());
        }
        progress::usleep(mem.max_write_delay);
    }

    if mem.pwroff_after_write {
        if pgm.capabilities().contains(Capabilities::VCC_CONTROL) {
            debug!("write at {addr:#06x} needs a power cycle");
            pgm.set_vcc(false)?;
            progress::usleep(250_000);
            pgm.set_vcc(true)?;
            pgm.initialize(s, p)?;
            if pgm.read_byte(s, p, mem, addr)? == data {
                return Ok(());
            }
        } else {
            return Err(Error::Device(format!(
                "memory {} needs a power cycle after writing, but programmer {} has no VCC control",
                mem.name,
                pgm.desc().id
            )));
        }
    }
    Err(Error::Device(format!(
        "write of {:#04x} to {} at {:#06x} did not read back",
        data, mem.name, addr
    )))
}

fn readable(mem: &Memory) -> bool {
    mem.op(Op::Read).is_some() || mem.op(Op::ReadLo).is_some()
}

/// Default single-byte read over the programmer's SPI/TPI primitives.
pub fn read_byte_default<P: Programmer + ?Sized>(
    pgm: &mut P,
    s: &mut Session,
    p: &Part,
    mem: &Memory,
    addr: usize,
) -> Result<u8> {
    if p.has_mode(PgmModes::TPI) {
        if !pgm.capabilities().contains(Capabilities::CMD_TPI) {
            return Err(Error::Unsupported);
        }
        tpi::nvm_wait(pgm, s)?;
        tpi::set_nvmcmd(pgm, tpi::NVMCMD_NO_OPERATION)?;
        tpi::set_pointer(pgm, (mem.offset + addr) as u16)?;
        return tpi::read_byte_pi(pgm);
    }

    let (opk, caddr) = if mem.op(Op::ReadLo).is_some() {
        let k = if addr % 2 == 0 { Op::ReadLo } else { Op::ReadHi };
        (k, (addr / 2) as u32)
    } else {
        (Op::Read, addr as u32)
    };
    let Some(op) = mem.op(opk) else {
        return Err(Error::Unsupported);
    };
    let op: &Opcode = op;

    load_ext_addr(pgm, mem, caddr)?;
    let mut cmd = [0u8; 4];
    op.set_bits(&mut cmd);
    op.set_addr(&mut cmd, caddr);
    let res = pgm.cmd(&cmd)?;
    Ok(op.get_output(&res))
}

// - MARK: verify

/// Fuse verify mask on ISP parts: only bits that can be both written
/// and read back take part in the comparison.
fn verify_bitmask(p: &Part, mem: &Memory, addr: usize) -> u8 {
    if p.has_mode(PgmModes::ISP)
        && (mem.mtype.is_a_fuse() || mem.mtype.is_lock())
        && mem.size == 1
    {
        if let (Some(w), Some(r)) = (mem.op(Op::Write), mem.op(Op::Read)) {
            return Opcode::rw_bit_intersection(w, r) & p.mem_bitmask(mem, addr);
        }
    }
    p.mem_bitmask(mem, addr)
}

/// Maximum mismatches reported in detail before going quiet.
const VERIFY_LOG_MAX: usize = 10;

/// Compare the device part's buffer against the reference part's,
/// byte by byte where the reference is tagged. Returns the compare size
/// on a clean verify.
pub fn verify_mem<P: Programmer + ?Sized>(
    pgm: &mut P,
    s: &mut Session,
    p_dev: &Part,
    p_ref: &Part,
    memname: &str,
    size: usize,
) -> Result<usize> {
    let dev = p_dev
        .locate_mem(memname)
        .ok_or_else(|| Error::Setup(format!("no memory {memname} in part {}", p_dev.desc)))?;
    let refm = p_ref
        .locate_mem(memname)
        .ok_or_else(|| Error::Setup(format!("no memory {memname} in part {}", p_ref.desc)))?;

    led::led_clr(pgm, s, Led::Err);
    led::led_set(pgm, s, Led::Vfy);

    let size = size.min(dev.size).min(refm.size);
    let mut mismatches = 0usize;
    let mut ro_mismatches = 0usize;
    let mut first_addr = 0usize;

    for i in 0..size {
        if !refm.allocated(i) {
            continue;
        }
        if dev.buf[i] == refm.buf[i] {
            continue;
        }
        if dev.mtype.is_readonly() || pgm.readonly(s, p_dev, dev, i) {
            ro_mismatches += 1;
            if ro_mismatches <= VERIFY_LOG_MAX {
                warn!(
                    "protected byte {}:{:#06x} differs: device {:#04x}, input {:#04x}",
                    memname, i, dev.buf[i], refm.buf[i]
                );
            }
            continue;
        }
        let mask = verify_bitmask(p_dev, dev, i);
        if (dev.buf[i] ^ refm.buf[i]) & mask != 0 {
            if mismatches == 0 {
                first_addr = i;
            }
            mismatches += 1;
            if mismatches <= VERIFY_LOG_MAX {
                warn!(
                    "mismatch at {}:{:#06x}: device {:#04x}, input {:#04x} (mask {:#04x})",
                    memname, i, dev.buf[i], refm.buf[i], mask
                );
            }
        } else {
            warn!(
                "only unused bits differ at {}:{:#06x}: device {:#04x}, input {:#04x} (mask {:#04x})",
                memname, i, dev.buf[i], refm.buf[i], mask
            );
        }
    }

    if ro_mismatches > 0 {
        warn!("{ro_mismatches} mismatch(es) in protected areas of {memname} not counted");
    }
    if mismatches > 0 {
        led::led_set(pgm, s, Led::Err);
        led::led_clr(pgm, s, Led::Vfy);
        return Err(Error::Verify {
            mismatches,
            first_addr,
        });
    }
    led::led_clr(pgm, s, Led::Vfy);
    Ok(size)
}

// - MARK: part-level operations

/// Read the device signature. A soft read failure surfaces as
/// [`Error::SoftFail`] so callers may offer "erase first".
pub fn read_signature<P: Programmer + ?Sized>(
    pgm: &mut P,
    s: &mut Session,
    p: &mut Part,
) -> Result<[u8; 3]> {
    read_mem(pgm, s, p, "signature", None)?;
    let m = p
        .locate_mem("signature")
        .ok_or_else(|| Error::Setup(format!("part {} has no signature memory", p.desc)))?;
    if m.size < 3 {
        return Err(Error::Setup(format!(
            "signature memory of {} is {} bytes",
            p.desc, m.size
        )));
    }
    Ok([m.buf[0], m.buf[1], m.buf[2]])
}

/// Erase the chip and wait out the part's erase delay.
pub fn chip_erase<P: Programmer + ?Sized>(pgm: &mut P, s: &mut Session, p: &Part) -> Result<()> {
    led::led_clr(pgm, s, Led::Err);
    led::led_set(pgm, s, Led::Pgm);
    let result = pgm.chip_erase(s, p);
    match &result {
        Ok(_) => led::led_clr(pgm, s, Led::Pgm),
        Err(_) => {
            led::led_set(pgm, s, Led::Err);
            led::led_clr(pgm, s, Led::Pgm);
        }
    }
    result
}

/// Unlock the device where the programmer knows how.
pub fn unlock<P: Programmer + ?Sized>(pgm: &mut P, s: &mut Session, p: &Part) -> Result<()> {
    pgm.unlock(s, p)
}
