//! Urclock: the urboot/STK500v1 bootloader programmer.
//!
//! A small wire protocol in two flavours. Classic STK500v1 keeps the
//! fixed `0x14/0x10` sync pair and word addressing; under urprotocol the
//! bootloader picks its own sync pair, which encodes an MCU id and five
//! capability bits. On top sit vector patching for bootloaders that hide
//! in an interrupt vector, an optional metadata trailer below the
//! bootloader, and chip-erase emulation for bootloaders without one.

use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::led::Leds;
use crate::opcode::Op;
use crate::part::{Memory, Part, PgmModes, TAG_ALLOCATED};
use crate::pgm::{Capabilities, ConnType, PgmDesc, Programmer};
use crate::progress::{self, Session};
use crate::transport::{SerialParams, Transport, DEFAULT_RECV_TIMEOUT};

pub mod jump;
pub mod protocol;

use protocol::*;

const SYNC_ATTEMPTS: u32 = 20;
const SYNC_RECV_TIMEOUT: Duration = Duration::from_millis(100);
const DRAIN_WINDOW: Duration = Duration::from_millis(80);
const CHIP_ERASE_TIMEOUT_CAP_MS: u64 = 20_000;

/// User-facing knobs, usually filled from `-x` extended parameters via
/// [`Programmer::parse_ext_params`].
#[derive(Debug, Clone, Default)]
pub struct UrclockConfig {
    /// Bootloader size in bytes when the bootloader cannot be asked.
    pub bootsize: Option<usize>,
    /// Vector number used by a vector bootloader.
    pub vectornum: Option<i32>,
    /// Log the device's metadata trailer during initialisation.
    pub showall: bool,
    /// Leave the area below the bootloader untouched.
    pub nometadata: bool,
    pub nodate: bool,
    pub nofilename: bool,
    pub nostore: bool,
    /// Upload the image exactly as given: no patching, no metadata.
    pub restore: bool,
    /// Fill the free store region with 0xff.
    pub initstore: bool,
    /// Strict classic STK500v1 framing.
    pub strict: bool,
    /// Patch vectors even when the image looks implausible.
    pub force: bool,
    /// Extra delay after the autoreset pulse, milliseconds.
    pub extra_reset_delay_ms: u32,
    /// Input file name recorded in the metadata trailer.
    pub filename: String,
    /// Timestamp recorded in the metadata trailer: yyyy, mm, dd, hr, mn.
    pub date: Option<(u16, u8, u8, u8, u8)>,
}

/// The Urclock programmer over an opened serial transport.
pub struct Urclock<T: Transport> {
    desc: PgmDesc,
    leds: Leds,
    conn: T,
    cfg: UrclockConfig,

    // learnt during sync, constant for the rest of the session
    insync: u8,
    ok: u8,
    urprot: bool,
    features: UrFeatures,
    mcuid: i32,

    // discovered bootloader layout
    blstart: usize,
    vbl_level: u8,
    vblvecnum: i32,
    bl_version: u8,

    // session caches
    ext_addr: Option<u8>,
    emulate_ce: bool,
    done_ce: bool,
    store_start: usize,
    store_size: usize,
}

impl<T: Transport> Urclock<T> {
    /// Wrap an opened transport. The port itself is owned by the
    /// transport layer; [`Programmer::open`] performs the reset dance
    /// and synchronisation.
    pub fn new(conn: T) -> Self {
        Self::with_config(conn, UrclockConfig::default())
    }

    pub fn with_config(conn: T, cfg: UrclockConfig) -> Self {
        let mut desc = PgmDesc::new("urclock", "Urclock/urboot bootloader", ConnType::Serial);
        desc.prog_modes = PgmModes::SPM;
        desc.baudrate = Some(115200);
        Self {
            desc,
            leds: Leds::new(),
            conn,
            cfg,
            insync: STK_INSYNC,
            ok: STK_OK,
            urprot: false,
            features: UrFeatures::empty(),
            mcuid: -1,
            blstart: 0,
            vbl_level: 0,
            vblvecnum: -1,
            bl_version: 0,
            ext_addr: None,
            emulate_ce: false,
            done_ce: false,
            store_start: 0,
            store_size: 0,
        }
    }

    /// Sync pair learnt from the bootloader; fixed for the session.
    pub fn sync_pair(&self) -> (u8, u8) {
        (self.insync, self.ok)
    }

    pub fn bootloader_start(&self) -> usize {
        self.blstart
    }

    /// The wrapped transport, e.g. to close it or inspect a test double.
    pub fn transport(&self) -> &T {
        &self.conn
    }

    fn flash_geom(p: &Part) -> Result<(usize, usize)> {
        let flash = p
            .locate_mem("flash")
            .ok_or_else(|| Error::Setup(format!("part {} has no flash", p.desc)))?;
        Ok((flash.size, flash.page_size.max(1)))
    }

    // - MARK: framing

    /// Send `<cmd..> EOP`, expect `<insync> [payload] <ok>`.
    fn xmit(&mut self, cmd: &[u8], payload: &mut [u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(cmd.len() + 1);
        frame.extend_from_slice(cmd);
        frame.push(STK_CRC_EOP);
        self.conn.send(&frame)?;

        let mut b = [0u8; 1];
        self.conn.recv(&mut b)?;
        if b[0] != self.insync {
            self.conn.drain(DRAIN_WINDOW)?;
            return Err(Error::Protocol(format!(
                "expected insync {:#04x}, got {:#04x}",
                self.insync, b[0]
            )));
        }
        if !payload.is_empty() {
            self.conn.recv(payload)?;
        }
        self.conn.recv(&mut b)?;
        if b[0] != self.ok {
            self.conn.drain(DRAIN_WINDOW)?;
            return Err(Error::Protocol(format!(
                "expected ok {:#04x}, got {:#04x}",
                self.ok, b[0]
            )));
        }
        Ok(())
    }

    /// Learn the sync pair: accept it only when two consecutive attempts
    /// agree. Short timeouts keep the bootloader watchdog quiet.
    fn getsync(&mut self) -> Result<()> {
        self.conn.set_recv_timeout(SYNC_RECV_TIMEOUT);
        let mut prev: Option<(u8, u8)> = None;
        let mut synced = false;

        for attempt in 0..SYNC_ATTEMPTS {
            self.conn.send(&[STK_GET_SYNC, STK_CRC_EOP])?;
            let mut pair = [0u8; 2];
            match self.conn.recv(&mut pair) {
                Ok(()) => {
                    let got = (pair[0], pair[1]);
                    if prev == Some(got) {
                        self.adopt_sync_pair(got);
                        synced = true;
                        break;
                    }
                    prev = Some(got);
                }
                Err(e) => {
                    debug!("sync attempt {} failed: {}", attempt + 1, e);
                    prev = None;
                    self.conn.drain(DRAIN_WINDOW)?;
                }
            }
        }
        self.conn.set_recv_timeout(DEFAULT_RECV_TIMEOUT);
        if !synced {
            return Err(Error::Protocol(format!(
                "bootloader not in sync after {SYNC_ATTEMPTS} attempts"
            )));
        }
        Ok(())
    }

    fn adopt_sync_pair(&mut self, mut pair: (u8, u8)) {
        if pair == LEGACY_PAIR {
            // old optiboot answering 0xff/0xfe speaks classic STK500v1
            pair = (STK_INSYNC, STK_OK);
        }
        self.insync = pair.0;
        self.ok = pair.1;
        if pair == (STK_INSYNC, STK_OK) {
            self.urprot = false;
            self.features = UrFeatures::empty();
            self.mcuid = -1;
            debug!("classic STK500v1 bootloader");
        } else {
            let code = sync_code(pair.0, pair.1);
            self.features = features_from_code(code);
            self.mcuid = mcuid_from_code(code);
            self.urprot = self.features.contains(UrFeatures::URPROTOCOL);
            debug!(
                "sync pair ({:#04x}, {:#04x}): mcuid {}, features {:?}",
                pair.0, pair.1, self.mcuid, self.features
            );
        }
    }

    // - MARK: addressing

    /// Classic mode: word address via LOAD_ADDRESS, with the extended
    /// address byte sent through UNIVERSAL only when it changes.
    fn load_addr_classic(&mut self, p: &Part, mem: &Memory, addr: usize) -> Result<()> {
        let _ = p;
        let word_addressed = mem.mtype.in_flash();
        let caddr = if word_addressed { addr / 2 } else { addr };
        if word_addressed {
            if let Some(lea) = mem.op(Op::LoadExtAddr) {
                let ext = (caddr >> 16) as u8;
                // after reset the device's extended byte is 0, so the
                // first emission can wait until it actually changes
                let stale = match self.ext_addr {
                    None => ext != 0,
                    Some(e) => e != ext,
                };
                if stale {
                    let mut cmd = [0u8; 4];
                    lea.set_bits(&mut cmd);
                    lea.set_addr(&mut cmd, caddr as u32);
                    let mut res = [0u8; 1];
                    self.xmit(&[STK_UNIVERSAL, cmd[0], cmd[1], cmd[2], cmd[3]], &mut res)?;
                    self.ext_addr = Some(ext);
                }
            }
        }
        self.xmit(&[STK_LOAD_ADDRESS, caddr as u8, (caddr >> 8) as u8], &mut [])
    }

    /// urprotocol: byte address little-endian (2 or 3 bytes by flash
    /// size), length big-endian (1 or 2 bytes by page size, 0 encoding
    /// the maximum).
    fn push_addr_len(frame: &mut Vec<u8>, addr: usize, len: usize, flashsize: usize, page: usize) {
        frame.push(addr as u8);
        frame.push((addr >> 8) as u8);
        if flashsize > 65536 {
            frame.push((addr >> 16) as u8);
        }
        if page > 256 {
            frame.push((len >> 8) as u8);
            frame.push(len as u8);
        } else {
            frame.push(len as u8);
        }
    }

    /// Read up to one page of `flash`/`eeprom` at `addr`.
    fn read_page_raw(
        &mut self,
        p: &Part,
        mem: &Memory,
        addr: usize,
        out: &mut [u8],
    ) -> Result<()> {
        let (fs, page) = Self::flash_geom(p)?;
        let is_flash = mem.mtype.in_flash();
        if self.urprot {
            let want = if is_flash {
                UrFeatures::READ_FLASH
            } else {
                UrFeatures::EEPROM
            };
            if !self.features.contains(want) {
                return Err(Error::Unsupported);
            }
            let cmd = if is_flash {
                UR_READ_PAGE_FL
            } else {
                UR_READ_PAGE_EE
            };
            let mut frame = vec![cmd];
            Self::push_addr_len(&mut frame, addr, out.len(), fs, page);
            self.xmit(&frame, out)
        } else {
            self.load_addr_classic(p, mem, addr)?;
            let kind = if is_flash {
                STK_MEMTYPE_FLASH
            } else {
                STK_MEMTYPE_EEPROM
            };
            let n = out.len();
            self.xmit(
                &[STK_READ_PAGE, (n >> 8) as u8, n as u8, kind],
                out,
            )
        }
    }

    /// Read an arbitrary-length chunk, split into page-sized reads.
    fn read_chunk(&mut self, p: &Part, mem: &Memory, addr: usize, out: &mut [u8]) -> Result<()> {
        let (_, page) = Self::flash_geom(p)?;
        let mut done = 0;
        while done < out.len() {
            let n = (out.len() - done).min(page);
            let a = addr + done;
            self.read_page_raw(p, mem, a, &mut out[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    // - MARK: discovery

    fn discover(&mut self, p: &Part) -> Result<()> {
        let (fs, page) = Self::flash_geom(p)?;
        let flash = p.locate_mem("flash").cloned();
        let flash = flash.ok_or_else(|| Error::Setup("no flash".into()))?;

        // classic STK500v1 bootloaders can always read flash back;
        // under urprotocol that is a feature bit
        let can_read = !self.urprot || self.features.contains(UrFeatures::READ_FLASH);
        if can_read {
            let mut tail = [0u8; BL_INFO_LEN];
            self.read_chunk(p, &flash, fs - BL_INFO_LEN, &mut tail)?;
            let version = tail[5];
            let cap = tail[4];
            let pages = tail[3] as usize;
            if has_extended_info(version) && pages > 0 && pages * page < fs {
                self.bl_version = version;
                self.blstart = fs - pages * page;
                self.vbl_level = cap & CAP_VBL_MASK;
                self.vblvecnum = if self.vbl_level > 0 { tail[2] as i32 } else { -1 };
                if cap & CAP_CHIP_ERASE != 0 {
                    self.features |= UrFeatures::CHIP_ERASE;
                }
                if cap & CAP_EEPROM != 0 {
                    self.features |= UrFeatures::EEPROM;
                }
                debug!(
                    "urboot u{}.{}: bootloader [{:#06x}, {:#06x}), vbl level {}, vector {}",
                    version_major(version),
                    version_minor(version),
                    self.blstart,
                    fs,
                    self.vbl_level,
                    self.vblvecnum
                );
            } else if let Err(e) = self.infer_bootloader(p, &flash, fs) {
                // not an urboot; without user-supplied geometry there is
                // no bootloader protection
                debug!("no urboot layout found ({e}); bootloader geometry unknown");
                self.blstart = 0;
                self.vbl_level = 0;
                self.vblvecnum = -1;
            }
        } else {
            let bs = self.cfg.bootsize.ok_or_else(|| {
                Error::Setup(
                    "bootloader cannot read flash back; supply -xbootsize=<n> (and -xvectornum=<n> for a vector bootloader)"
                        .into(),
                )
            })?;
            let bs = bs.div_ceil(page) * page;
            if bs == 0 || bs >= fs {
                return Err(Error::Setup(format!("implausible bootsize {bs}")));
            }
            self.blstart = fs - bs;
        }

        // explicit user knowledge wins over discovery
        if let Some(bs) = self.cfg.bootsize {
            let bs = bs.div_ceil(page) * page;
            if bs == 0 || bs >= fs {
                return Err(Error::Setup(format!("implausible bootsize {bs}")));
            }
            self.blstart = fs - bs;
        }
        if let Some(v) = self.cfg.vectornum {
            if v < 0 || v as usize >= p.n_interrupts.max(1) {
                return Err(Error::Setup(format!("implausible vectornum {v}")));
            }
            self.vbl_level = self.vbl_level.max(1);
            self.vblvecnum = v;
        }
        Ok(())
    }

    /// Older urboots carry no page/vector fields: take the bootloader
    /// start from the reset jump and scan its code for the vector-table
    /// jump that a vector bootloader must contain.
    fn infer_bootloader(&mut self, p: &Part, flash: &Memory, fs: usize) -> Result<()> {
        let mut v0 = [0u8; 4];
        self.read_chunk(p, flash, 0, &mut v0)?;
        let w0 = u16::from_le_bytes([v0[0], v0[1]]);
        let target = if jump::is_rjmp(w0) {
            jump::dist_rjmp(w0, fs).rem_euclid(fs.min(8192) as i32) as usize
        } else if jump::is_jmp(w0) {
            let w1 = u16::from_le_bytes([v0[2], v0[3]]);
            jump::addr_jmp((u32::from(w0) << 16) | u32::from(w1)) as usize
        } else {
            return Err(Error::Protocol(
                "reset vector holds no jump; cannot locate the bootloader".into(),
            ));
        };
        // a patched reset vector jumps into the top of flash; anything
        // else means there is no vector bootloader to find
        if target < fs / 2 || target >= fs {
            return Err(Error::Protocol(format!(
                "reset vector jumps to {target:#06x}, not into a bootloader"
            )));
        }
        self.blstart = target;
        debug!("bootloader inferred at {:#06x}", self.blstart);

        // find the vbl vector: a jump inside the bootloader landing in
        // the vector table
        let vecs = jump::vecsz(fs);
        let blsize = fs - self.blstart;
        let mut code = vec![0u8; blsize];
        self.read_chunk(p, flash, self.blstart, &mut code)?;
        let table_end = p.n_interrupts.max(1) * vecs;
        let mut i = 0;
        while i + 2 <= code.len() {
            let here = self.blstart + i;
            let w = u16::from_le_bytes([code[i], code[i + 1]]);
            let land = if jump::is_rjmp(w) {
                Some(
                    (here as i32 + jump::dist_rjmp(w, fs)).rem_euclid(fs.min(8192) as i32) as usize,
                )
            } else if jump::is_jmp(w) && i + 4 <= code.len() {
                let w1 = u16::from_le_bytes([code[i + 2], code[i + 3]]);
                Some(jump::addr_jmp((u32::from(w) << 16) | u32::from(w1)) as usize)
            } else {
                None
            };
            if let Some(t) = land {
                if t > 0 && t < table_end && t % vecs == 0 {
                    self.vbl_level = 1;
                    self.vblvecnum = (t / vecs) as i32;
                    debug!("vector bootloader uses vector {}", self.vblvecnum);
                    break;
                }
            }
            i += 2;
        }
        Ok(())
    }

    fn show_device_metadata(&mut self, p: &Part) -> Result<()> {
        let flash = p
            .locate_mem("flash")
            .cloned()
            .ok_or_else(|| Error::Setup("no flash".into()))?;
        let can_read = !self.urprot || self.features.contains(UrFeatures::READ_FLASH);
        if self.blstart == 0 || !can_read {
            return Ok(());
        }
        let fs = flash.size;
        let wid = store_field_width(fs);
        // classic mode reads flash word-addressed; keep reads even-aligned
        let mstart = (self.blstart - 1) & !1;
        let mut pair = vec![0u8; self.blstart - mstart];
        self.read_chunk(p, &flash, mstart, &mut pair)?;
        let mcode = pair[self.blstart - 1 - mstart];
        if mcode == MCODE_NONE {
            info!("no metadata below the bootloader");
            return Ok(());
        }
        let nmeta = metadata_len(mcode, wid);
        if nmeta > self.blstart {
            return Ok(());
        }
        let lo = self.blstart - nmeta;
        let astart = lo & !1;
        let mut raw = vec![0u8; self.blstart - astart];
        self.read_chunk(p, &flash, astart, &mut raw)?;
        let trailer = &raw[lo - astart..];

        let mut at = 0;
        let fname = if mcode >= 2 {
            let raw = &trailer[..mcode as usize];
            at += mcode as usize;
            String::from_utf8_lossy(raw.split(|&b| b == 0).next().unwrap_or(&[])).into_owned()
        } else {
            String::new()
        };
        if mcode >= 1 {
            let yy = u16::from_le_bytes([trailer[at], trailer[at + 1]]);
            let (mm, dd, hr, mn) = (
                trailer[at + 2],
                trailer[at + 3],
                trailer[at + 4],
                trailer[at + 5],
            );
            at += 6;
            info!(
                "metadata: {} written {:04}-{:02}-{:02} {:02}:{:02}",
                if fname.is_empty() { "(no file)" } else { &fname },
                yy,
                mm,
                dd,
                hr,
                mn
            );
        }
        let ss = read_le(&trailer[at..at + wid]);
        let sz = read_le(&trailer[at + wid..at + 2 * wid]);
        info!("pgm store: [{ss:#06x}, {:#06x}), {sz} bytes", ss + sz);
        Ok(())
    }

    // - MARK: image preparation

    fn patch_vectors(&mut self, p: &Part, mem: &mut Memory) -> Result<()> {
        let fs = mem.size;
        let vecs = jump::vecsz(fs);
        let vb = self.vblvecnum;
        if vb <= 0 || vb as usize >= p.n_interrupts.max(1) {
            if self.cfg.force {
                warn!("no usable vector number; skipping vector patch");
                return Ok(());
            }
            return Err(Error::Setup(format!(
                "vector bootloader needs a vector number in [1, {}), got {}",
                p.n_interrupts.max(1),
                vb
            )));
        }

        // recover the application entry from the image's reset vector
        let w0 = u16::from_le_bytes([mem.buf[0], mem.buf[1]]);
        let appstart = if vecs == 2 {
            if !jump::is_rjmp(w0) {
                return self.patch_refusal("image does not start with rjmp");
            }
            jump::dist_rjmp(w0, fs).rem_euclid(fs.min(8192) as i32) as usize
        } else if jump::is_jmp(w0) {
            let w1 = u16::from_le_bytes([mem.buf[2], mem.buf[3]]);
            jump::addr_jmp((u32::from(w0) << 16) | u32::from(w1)) as usize
        } else if jump::is_rjmp(w0) {
            let d = jump::dist_rjmp(w0, fs);
            if d <= 0 {
                return self.patch_refusal("reset rjmp points backwards");
            }
            d as usize
        } else {
            return self.patch_refusal("image does not start with a jump");
        };

        let table_end = p.n_interrupts.max(1) * vecs;
        let code_top = if self.blstart > 0 { self.blstart } else { fs };
        if !self.cfg.force && !(appstart >= table_end && appstart < code_top) {
            return Err(Error::Setup(format!(
                "application entry {appstart:#06x} outside code area [{table_end:#06x}, {code_top:#06x}); \
                 use force to patch anyway"
            )));
        }

        let va = vb as usize * vecs;
        self.write_jump(mem, 0, self.blstart)?;
        self.write_jump(mem, va, appstart)?;
        debug!(
            "vectors patched: reset -> {:#06x}, vector {} -> {:#06x}",
            self.blstart, vb, appstart
        );
        Ok(())
    }

    fn patch_refusal(&self, what: &str) -> Result<()> {
        if self.cfg.force {
            warn!("{what}; skipping vector patch");
            Ok(())
        } else {
            Err(Error::Protocol(format!("{what}; refusing to patch vectors")))
        }
    }

    fn write_jump(&self, mem: &mut Memory, at: usize, target: usize) -> Result<()> {
        let fs = mem.size;
        if jump::vecsz(fs) == 2 {
            let op = jump::rjmp_opcode(target as i32 - at as i32, fs);
            mem.buf[at..at + 2].copy_from_slice(&op.to_le_bytes());
            mem.tags[at] |= TAG_ALLOCATED;
            mem.tags[at + 1] |= TAG_ALLOCATED;
        } else {
            let op = jump::jmp_opcode(target as u32);
            let w1 = (op >> 16) as u16;
            let w2 = op as u16;
            mem.buf[at..at + 2].copy_from_slice(&w1.to_le_bytes());
            mem.buf[at + 2..at + 4].copy_from_slice(&w2.to_le_bytes());
            for t in &mut mem.tags[at..at + 4] {
                *t |= TAG_ALLOCATED;
            }
        }
        Ok(())
    }

    fn write_metadata_trailer(&mut self, mem: &mut Memory) {
        let fs = mem.size;
        let wid = store_field_width(fs);
        let base = self.cfg.filename.rsplit(['/', '\\']).next().unwrap_or("");
        let mut cut = base.len().min(253);
        while !base.is_char_boundary(cut) {
            cut -= 1;
        }
        let fname = base[..cut].to_string();
        let mcode: u8 = if self.cfg.nofilename || fname.is_empty() {
            if self.cfg.nodate {
                MCODE_NO_DATE
            } else {
                MCODE_DATE_ONLY
            }
        } else {
            (fname.len() + 1) as u8
        };
        let nmeta = metadata_len(mcode, wid);
        if self.blstart < nmeta {
            return;
        }
        let lo = self.blstart - nmeta;
        if mem.any_allocated(lo, self.blstart) {
            warn!("image reaches into the metadata area; trailer not written");
            return;
        }

        let app_end = mem.tags[..lo]
            .iter()
            .rposition(|t| t & TAG_ALLOCATED != 0)
            .map_or(0, |i| i + 1);
        self.store_start = app_end;
        self.store_size = lo - app_end;

        let mut at = lo;
        if mcode >= 2 {
            let bytes = fname.as_bytes();
            mem.buf[at..at + bytes.len()].copy_from_slice(bytes);
            mem.buf[at + bytes.len()] = 0;
            at += mcode as usize;
        }
        if mcode >= 1 && mcode != MCODE_NONE {
            let (yy, mm, dd, hr, mn) = if self.cfg.nodate {
                (0, 0, 0, 0, 0)
            } else {
                self.cfg.date.unwrap_or((0, 0, 0, 0, 0))
            };
            mem.buf[at..at + 2].copy_from_slice(&yy.to_le_bytes());
            mem.buf[at + 2] = mm;
            mem.buf[at + 3] = dd;
            mem.buf[at + 4] = hr;
            mem.buf[at + 5] = mn;
            at += 6;
        }
        let (ss, sz) = if self.cfg.nostore {
            (0, 0)
        } else {
            (self.store_start, self.store_size)
        };
        write_le(&mut mem.buf[at..at + wid], ss);
        write_le(&mut mem.buf[at + wid..at + 2 * wid], sz);
        at += 2 * wid;
        mem.buf[at] = mcode;
        debug_assert_eq!(at, self.blstart - 1);

        for t in &mut mem.tags[lo..self.blstart] {
            *t |= TAG_ALLOCATED;
        }
        if self.cfg.initstore && !self.cfg.nostore {
            for i in self.store_start..lo {
                if !mem.allocated(i) {
                    mem.buf[i] = 0xff;
                    mem.tags[i] |= TAG_ALLOCATED;
                }
            }
        }
        debug!(
            "metadata trailer at [{lo:#06x}, {:#06x}), store [{:#06x}, {:#06x})",
            self.blstart,
            self.store_start,
            self.store_start + self.store_size
        );
    }
}

fn metadata_len(mcode: u8, wid: usize) -> usize {
    let date = if mcode >= 1 && mcode != MCODE_NONE { 6 } else { 0 };
    let name = if (2..=254).contains(&mcode) {
        mcode as usize
    } else {
        0
    };
    1 + 2 * wid + date + name
}

fn write_le(out: &mut [u8], mut v: usize) {
    for b in out.iter_mut() {
        *b = v as u8;
        v >>= 8;
    }
}

fn read_le(bytes: &[u8]) -> usize {
    let mut v = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        v |= (b as usize) << (8 * i);
    }
    v
}

impl<T: Transport> Programmer for Urclock<T> {
    fn desc(&self) -> &PgmDesc {
        &self.desc
    }

    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::PAGED_LOAD
            | Capabilities::PAGED_WRITE
            | Capabilities::READ_SIG_BYTES
            | Capabilities::CHIP_ERASE
            | Capabilities::FLASH_WRITE_HOOK
            | Capabilities::READONLY_MAP;
        if self.urprot && self.features.contains(UrFeatures::NOR_LL) {
            caps |= Capabilities::PAGE_ERASE;
        }
        caps
    }

    fn leds(&self) -> &Leds {
        &self.leds
    }

    fn leds_mut(&mut self) -> &mut Leds {
        &mut self.leds
    }

    fn open(&mut self, _s: &mut Session, port: &str) -> Result<()> {
        debug!("urclock session on {port}");
        let params = SerialParams {
            baudrate: self.desc.baudrate.unwrap_or(115200),
            ..SerialParams::default()
        };
        self.conn.set_params(&params)?;

        // autoreset: pulse DTR/RTS so the bootloader gets to run
        match self.conn.set_dtr_rts(false) {
            Ok(()) => {
                progress::usleep(250_000);
                self.conn.set_dtr_rts(true)?;
                progress::usleep(50_000 + self.cfg.extra_reset_delay_ms * 1000);
            }
            Err(Error::Unsupported) => {}
            Err(e) => return Err(e),
        }
        self.conn.drain(DRAIN_WINDOW)?;
        self.getsync()
    }

    fn initialize(&mut self, _s: &mut Session, p: &Part) -> Result<()> {
        if !p.has_mode(PgmModes::SPM) {
            return Err(Error::Setup(format!(
                "part {} cannot host a bootloader",
                p.desc
            )));
        }
        if self.urprot && self.mcuid >= 0 && p.mcuid >= 0 && self.mcuid != p.mcuid {
            return Err(Error::Setup(format!(
                "bootloader reports mcuid {}, but part {} has mcuid {}",
                self.mcuid, p.desc, p.mcuid
            )));
        }
        if self.cfg.restore && self.cfg.vectornum.is_some() {
            return Err(Error::Setup(
                "restore uploads the image verbatim; vectornum cannot be honoured".into(),
            ));
        }
        self.discover(p)?;
        if self.cfg.showall {
            self.show_device_metadata(p)?;
        }
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        let cmd = if self.urprot {
            UR_LEAVE_PROGMODE
        } else {
            STK_LEAVE_PROGMODE
        };
        // the bootloader may jump straight into the application and
        // never answer; that is fine
        if let Err(e) = self.xmit(&[cmd], &mut []) {
            debug!("leave progmode not acknowledged: {e}");
        }
        Ok(())
    }

    fn program_enable(&mut self, _s: &mut Session, _p: &Part) -> Result<()> {
        // being in sync with the bootloader is all there is
        Ok(())
    }

    fn chip_erase(&mut self, _s: &mut Session, p: &Part) -> Result<()> {
        if !self.features.contains(UrFeatures::CHIP_ERASE) {
            debug!("bootloader has no chip erase; emulating on next flash write");
            self.emulate_ce = true;
            self.done_ce = false;
            return Ok(());
        }
        let (fs, page) = Self::flash_geom(p)?;
        let ms = (500 + (fs / page) as u64 * 20).min(CHIP_ERASE_TIMEOUT_CAP_MS);
        self.conn.set_recv_timeout(Duration::from_millis(ms));
        let result = if self.urprot {
            self.xmit(&[UR_CHIP_ERASE], &mut [])
        } else {
            let ce = p
                .any_op(Op::ChipErase)
                .ok_or_else(|| Error::Setup(format!("part {} has no chip-erase opcode", p.desc)))?;
            let mut cmd = [0u8; 4];
            ce.set_bits(&mut cmd);
            let mut res = [0u8; 1];
            self.xmit(&[STK_UNIVERSAL, cmd[0], cmd[1], cmd[2], cmd[3]], &mut res)
        };
        self.conn.set_recv_timeout(DEFAULT_RECV_TIMEOUT);
        result
    }

    fn paged_load(
        &mut self,
        _s: &mut Session,
        p: &Part,
        m: &mut Memory,
        page_size: usize,
        addr: usize,
        n_bytes: usize,
    ) -> Result<()> {
        if n_bytes > page_size || addr + n_bytes > m.size {
            return Err(Error::Setup(format!(
                "paged load of {n_bytes} bytes at {addr:#06x} exceeds a page"
            )));
        }
        let mut chunk = vec![0u8; n_bytes];
        self.read_page_raw(p, &*m, addr, &mut chunk)?;
        m.buf[addr..addr + n_bytes].copy_from_slice(&chunk);
        Ok(())
    }

    fn paged_write(
        &mut self,
        _s: &mut Session,
        p: &Part,
        m: &Memory,
        page_size: usize,
        addr: usize,
        n_bytes: usize,
    ) -> Result<()> {
        let (fs, page) = Self::flash_geom(p)?;
        let is_flash = m.mtype.in_flash();
        if is_flash {
            if n_bytes != page_size {
                return Err(Error::Setup(format!(
                    "flash paged write must be exactly one page, got {n_bytes}"
                )));
            }
            if self.blstart > 0 && addr + n_bytes > self.blstart {
                return Err(Error::BootloaderOverlap(format!(
                    "write of [{addr:#06x}, {:#06x}) reaches the bootloader at {:#06x}",
                    addr + n_bytes,
                    self.blstart
                )));
            }
        } else {
            if !self.urprot && self.cfg.strict && n_bytes > 256 {
                return Err(Error::Setup("EEPROM writes limited to 256 bytes".into()));
            }
            if n_bytes > page_size.max(256) {
                return Err(Error::Setup(format!(
                    "EEPROM paged write of {n_bytes} bytes exceeds the limit"
                )));
            }
            if self.urprot && !self.features.contains(UrFeatures::EEPROM) {
                return Err(Error::Unsupported);
            }
        }

        let data = &m.buf[addr..addr + n_bytes];
        if self.urprot {
            let cmd = if is_flash {
                UR_PROG_PAGE_FL
            } else {
                UR_PROG_PAGE_EE
            };
            let mut frame = vec![cmd];
            Self::push_addr_len(&mut frame, addr, n_bytes, fs, page);
            frame.extend_from_slice(data);
            self.xmit(&frame, &mut [])
        } else {
            self.load_addr_classic(p, m, addr)?;
            let kind = if is_flash {
                STK_MEMTYPE_FLASH
            } else {
                STK_MEMTYPE_EEPROM
            };
            let mut frame = vec![STK_PROG_PAGE, (n_bytes >> 8) as u8, n_bytes as u8, kind];
            frame.extend_from_slice(data);
            self.xmit(&frame, &mut [])
        }
    }

    fn page_erase(&mut self, _s: &mut Session, p: &Part, m: &Memory, addr: usize) -> Result<()> {
        if !(self.urprot && self.features.contains(UrFeatures::NOR_LL)) {
            return Err(Error::Unsupported);
        }
        if !m.mtype.in_flash() {
            return Err(Error::Unsupported);
        }
        let (fs, page) = Self::flash_geom(p)?;
        let mut frame = vec![UR_PAGE_ERASE];
        Self::push_addr_len(&mut frame, addr, page, fs, page);
        self.xmit(&frame, &mut [])
    }

    fn read_sig_bytes(&mut self, _s: &mut Session, p: &Part, m: &mut Memory) -> Result<()> {
        if m.size < 3 {
            return Err(Error::Setup("signature memory too small".into()));
        }
        if self.urprot {
            // identity came with the sync pair; initialize() verified it
            m.buf[..3].copy_from_slice(&p.signature);
            for t in &mut m.tags[..3] {
                *t |= TAG_ALLOCATED;
            }
            return Ok(());
        }
        let mut sig = [0u8; 3];
        match self.xmit(&[STK_READ_SIGN], &mut sig) {
            Ok(()) => {
                m.buf[..3].copy_from_slice(&sig);
                Ok(())
            }
            Err(e) => {
                warn!("bootloader did not answer READ_SIGN ({e}); using part signature");
                m.buf[..3].copy_from_slice(&p.signature);
                Ok(())
            }
        }
    }

    fn readonly(&self, _s: &Session, _p: &Part, m: &Memory, addr: usize) -> bool {
        if !m.mtype.in_flash() {
            return false;
        }
        if self.blstart > 0 && addr >= self.blstart {
            return true;
        }
        // a vector bootloader owns the patched reset vector
        self.vbl_level >= 1 && addr < jump::vecsz(m.size)
    }

    fn flash_write_hook(&mut self, _s: &mut Session, p: &Part, mem: &mut Memory) -> Result<()> {
        if self.blstart > 0 && mem.any_allocated(self.blstart, mem.size) {
            return Err(Error::BootloaderOverlap(format!(
                "input image reaches into the bootloader at [{:#06x}, {:#06x})",
                self.blstart, mem.size
            )));
        }
        if self.cfg.restore {
            debug!("restore: image goes out verbatim");
        } else {
            if self.vbl_level >= 1 && self.blstart > 0 {
                self.patch_vectors(p, mem)?;
            }
            if !self.cfg.nometadata && self.blstart > 0 {
                self.write_metadata_trailer(mem);
            }
        }
        if self.emulate_ce && !self.done_ce {
            // emulate the chip erase: write 0xff over everything the
            // image does not cover, up to the bootloader
            let end = if self.blstart > 0 {
                self.blstart
            } else {
                mem.size
            };
            for i in 0..end {
                if !mem.allocated(i) {
                    mem.buf[i] = 0xff;
                    mem.tags[i] |= TAG_ALLOCATED;
                }
            }
            self.done_ce = true;
        }
        Ok(())
    }

    fn parse_ext_params(&mut self, _s: &mut Session, params: &[String]) -> Result<()> {
        for raw in params {
            let (key, val) = match raw.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (raw.as_str(), None),
            };
            match (key, val) {
                ("bootsize", Some(v)) => {
                    self.cfg.bootsize = Some(parse_num(v)?);
                }
                ("vectornum", Some(v)) => {
                    self.cfg.vectornum = Some(parse_num(v)? as i32);
                }
                ("delay", Some(v)) => {
                    self.cfg.extra_reset_delay_ms = parse_num(v)? as u32;
                }
                ("showall", None) => self.cfg.showall = true,
                ("nometadata", None) => self.cfg.nometadata = true,
                ("nodate", None) => self.cfg.nodate = true,
                ("nofilename", None) => self.cfg.nofilename = true,
                ("nostore", None) => self.cfg.nostore = true,
                ("restore", None) => self.cfg.restore = true,
                ("initstore", None) => self.cfg.initstore = true,
                ("strict", None) => self.cfg.strict = true,
                ("force", None) => self.cfg.force = true,
                _ => {
                    return Err(Error::Setup(format!(
                        "unknown extended parameter {raw:?} for urclock"
                    )));
                }
            }
        }
        if self.cfg.restore && self.cfg.vectornum.is_some() {
            return Err(Error::Setup(
                "restore and vectornum are mutually exclusive".into(),
            ));
        }
        Ok(())
    }
}

fn parse_num(v: &str) -> Result<usize> {
    let (body, radix) = if let Some(hex) = v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        (hex, 16)
    } else {
        (v, 10)
    };
    usize::from_str_radix(body, radix)
        .map_err(|_| Error::Setup(format!("bad numeric value {v:?}")))
}
