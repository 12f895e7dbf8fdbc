//! Urclock protocol tests against an in-process bootloader double.

use std::collections::VecDeque;
use std::time::Duration;

use avrprog::engine;
use avrprog::error::{Error, Result};
use avrprog::part::{registry, Part};
use avrprog::pgm::Programmer;
use avrprog::progress::Session;
use avrprog::transport::Transport;
use avrprog::urclock::protocol::{self, UrFeatures};
use avrprog::urclock::{jump, Urclock, UrclockConfig};

/// A bootloader on the other end of the wire: answers STK500v1 or
/// urprotocol framing against its own flash/eeprom arrays.
struct MockBoot {
    pair: (u8, u8),
    legacy_sync: bool,
    urprot: bool,
    flash: Vec<u8>,
    eeprom: Vec<u8>,
    page: usize,
    blstart: usize,

    // classic-mode address state
    word_addr: usize,
    ext: usize,

    inbuf: Vec<u8>,
    out: VecDeque<u8>,

    page_writes: usize,
    ce_count: usize,
    universal_cmds: usize,
}

impl MockBoot {
    /// An urboot bootloader with the extended info trailer in place.
    fn urboot(
        fs: usize,
        page: usize,
        mcuid: i32,
        features: UrFeatures,
        blpages: u8,
        vblvecnum: u8,
        cap: u8,
    ) -> Self {
        let mut flash = vec![0xff; fs];
        let version = (7 << 3) + 7; // u7.7
        let tail = fs - protocol::BL_INFO_LEN;
        flash[tail + 2] = vblvecnum;
        flash[tail + 3] = blpages;
        flash[tail + 4] = cap;
        flash[tail + 5] = version;
        Self {
            pair: protocol::pair_for(mcuid, features),
            legacy_sync: false,
            urprot: features.contains(UrFeatures::URPROTOCOL),
            flash,
            eeprom: vec![0xff; 1024],
            page,
            blstart: fs - blpages as usize * page,
            word_addr: 0,
            ext: 0,
            inbuf: Vec::new(),
            out: VecDeque::new(),
            page_writes: 0,
            ce_count: 0,
            universal_cmds: 0,
        }
    }

    /// A plain classic STK500v1 bootloader (optiboot-like).
    fn classic(fs: usize, page: usize, legacy_sync: bool) -> Self {
        Self {
            pair: (protocol::STK_INSYNC, protocol::STK_OK),
            legacy_sync,
            urprot: false,
            flash: vec![0xff; fs],
            eeprom: vec![0xff; 1024],
            page,
            blstart: 0,
            word_addr: 0,
            ext: 0,
            inbuf: Vec::new(),
            out: VecDeque::new(),
            page_writes: 0,
            ce_count: 0,
            universal_cmds: 0,
        }
    }

    fn fs(&self) -> usize {
        self.flash.len()
    }

    fn addr_width(&self) -> usize {
        if self.fs() > 65536 {
            3
        } else {
            2
        }
    }

    fn len_width(&self) -> usize {
        if self.page > 256 {
            2
        } else {
            1
        }
    }

    fn reply(&mut self, payload: &[u8]) {
        let (i, o) = if self.urprot || !self.legacy_sync {
            self.pair
        } else {
            (protocol::STK_INSYNC, protocol::STK_OK)
        };
        self.out.push_back(i);
        self.out.extend(payload.iter().copied());
        self.out.push_back(o);
    }

    fn reply_sync(&mut self) {
        // the legacy quirk only shows in the bare sync answer
        if self.legacy_sync {
            self.out.push_back(protocol::LEGACY_PAIR.0);
            self.out.push_back(protocol::LEGACY_PAIR.1);
        } else {
            let (i, o) = self.pair;
            self.out.push_back(i);
            self.out.push_back(o);
        }
    }

    fn take(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.inbuf.len() < n {
            return None;
        }
        Some(self.inbuf.drain(..n).collect())
    }

    fn ur_addr(&self, raw: &[u8]) -> usize {
        raw.iter()
            .enumerate()
            .fold(0usize, |a, (i, &b)| a | (b as usize) << (8 * i))
    }

    fn ur_len(&self, raw: &[u8]) -> usize {
        let v = raw.iter().fold(0usize, |a, &b| (a << 8) | b as usize);
        if v == 0 {
            if self.len_width() == 1 {
                256
            } else {
                65536
            }
        } else {
            v
        }
    }

    fn process(&mut self) {
        loop {
            let Some(&cmd) = self.inbuf.first() else { return };
            let aw = self.addr_width();
            let lw = self.len_width();
            let consumed = if self.urprot && cmd == protocol::UR_PROG_PAGE_FL
                || self.urprot && cmd == protocol::UR_PROG_PAGE_EE
            {
                let Some(head) = self.take(1 + aw + lw) else { return };
                let addr = self.ur_addr(&head[1..1 + aw]);
                let len = self.ur_len(&head[1 + aw..]);
                let Some(body) = self.take(len + 1) else {
                    // data not complete yet: put the head back
                    let mut rest = std::mem::take(&mut self.inbuf);
                    self.inbuf = head;
                    self.inbuf.append(&mut rest);
                    return;
                };
                let data = &body[..len];
                if cmd == protocol::UR_PROG_PAGE_FL {
                    self.flash[addr..addr + len].copy_from_slice(data);
                    self.page_writes += 1;
                } else {
                    self.eeprom[addr..addr + len].copy_from_slice(data);
                }
                self.reply(&[]);
                true
            } else if self.urprot
                && (cmd == protocol::UR_READ_PAGE_FL || cmd == protocol::UR_READ_PAGE_EE)
            {
                let Some(head) = self.take(1 + aw + lw + 1) else { return };
                let addr = self.ur_addr(&head[1..1 + aw]);
                let len = self.ur_len(&head[1 + aw..1 + aw + lw]);
                let src = if cmd == protocol::UR_READ_PAGE_FL {
                    &self.flash
                } else {
                    &self.eeprom
                };
                let data: Vec<u8> = src[addr..addr + len].to_vec();
                self.reply(&data);
                true
            } else if self.urprot && cmd == protocol::UR_CHIP_ERASE {
                let Some(_) = self.take(2) else { return };
                let bl = self.blstart;
                self.flash[..bl].iter_mut().for_each(|b| *b = 0xff);
                self.ce_count += 1;
                self.reply(&[]);
                true
            } else if self.urprot && cmd == protocol::UR_PAGE_ERASE {
                let Some(head) = self.take(1 + aw + lw + 1) else { return };
                let addr = self.ur_addr(&head[1..1 + aw]);
                let page = self.page;
                let end = (addr + page).min(self.fs());
                self.flash[addr..end]
                    .iter_mut()
                    .for_each(|b| *b = 0xff);
                self.reply(&[]);
                true
            } else if !self.urprot && cmd == protocol::STK_LOAD_ADDRESS {
                let Some(f) = self.take(4) else { return };
                self.word_addr = f[1] as usize | (f[2] as usize) << 8;
                self.reply(&[]);
                true
            } else if !self.urprot && cmd == protocol::STK_UNIVERSAL {
                let Some(f) = self.take(6) else { return };
                self.universal_cmds += 1;
                if f[1] == 0x4d {
                    self.ext = f[3] as usize;
                }
                self.reply(&[0]);
                true
            } else if !self.urprot && cmd == protocol::STK_PROG_PAGE {
                let Some(head) = self.take(4) else { return };
                let len = (head[1] as usize) << 8 | head[2] as usize;
                let kind = head[3];
                let Some(body) = self.take(len + 1) else {
                    let mut rest = std::mem::take(&mut self.inbuf);
                    self.inbuf = head;
                    self.inbuf.append(&mut rest);
                    return;
                };
                let data = &body[..len];
                if kind == protocol::STK_MEMTYPE_FLASH {
                    let addr = (self.ext << 16 | self.word_addr) * 2;
                    self.flash[addr..addr + len].copy_from_slice(data);
                    self.page_writes += 1;
                } else {
                    let addr = self.word_addr;
                    self.eeprom[addr..addr + len].copy_from_slice(data);
                }
                self.reply(&[]);
                true
            } else if !self.urprot && cmd == protocol::STK_READ_PAGE {
                let Some(head) = self.take(5) else { return };
                let len = (head[1] as usize) << 8 | head[2] as usize;
                let kind = head[3];
                let data: Vec<u8> = if kind == protocol::STK_MEMTYPE_FLASH {
                    let addr = (self.ext << 16 | self.word_addr) * 2;
                    self.flash[addr..addr + len].to_vec()
                } else {
                    self.eeprom[self.word_addr..self.word_addr + len].to_vec()
                };
                self.reply(&data);
                true
            } else if !self.urprot && cmd == protocol::STK_READ_SIGN {
                let Some(_) = self.take(2) else { return };
                self.reply(&[0x1e, 0x95, 0x0f]);
                true
            } else if cmd == protocol::STK_GET_SYNC {
                let Some(_) = self.take(2) else { return };
                self.reply_sync();
                true
            } else {
                // anything else behaves as get-sync
                let Some(_) = self.take(2) else { return };
                self.reply_sync();
                true
            };
            if !consumed {
                return;
            }
        }
    }
}

impl Transport for MockBoot {
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.inbuf.extend_from_slice(buf);
        self.process();
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<()> {
        for slot in buf.iter_mut() {
            *slot = self
                .out
                .pop_front()
                .ok_or(Error::Timeout("mock bootloader response"))?;
        }
        Ok(())
    }

    fn drain(&mut self, _window: Duration) -> Result<()> {
        self.out.clear();
        Ok(())
    }

    fn set_recv_timeout(&mut self, _timeout: Duration) {}

    fn set_dtr_rts(&mut self, _on: bool) -> Result<()> {
        Ok(())
    }
}

fn m328p_with_mcuid(mcuid: i32) -> Part {
    let mut p = registry::atmega328p();
    p.mcuid = mcuid;
    p
}

fn connect(
    mock: MockBoot,
    p: &Part,
    cfg: UrclockConfig,
) -> (Urclock<MockBoot>, Session) {
    let mut ur = Urclock::with_config(mock, cfg);
    let mut s = Session::new();
    ur.open(&mut s, "mock").unwrap();
    ur.initialize(&mut s, p).unwrap();
    (ur, s)
}

#[test]
fn sync_learns_bootloader_pair_and_features() {
    // scenario: insync 0x55, ok 0x54 carries mcuid 679 and all features
    let p = m328p_with_mcuid(679);
    let mock = MockBoot::urboot(32768, 128, 679, UrFeatures::all(), 4, 0, 0);
    let (ur, _s) = connect(mock, &p, UrclockConfig::default());
    assert_eq!(ur.sync_pair(), (0x55, 0x54));
    assert_eq!(ur.bootloader_start(), 32768 - 512);
}

#[test]
fn mcuid_mismatch_is_a_setup_error() {
    let p = m328p_with_mcuid(9);
    let mock = MockBoot::urboot(32768, 128, 679, UrFeatures::all(), 4, 0, 0);
    let mut ur = Urclock::new(mock);
    let mut s = Session::new();
    ur.open(&mut s, "mock").unwrap();
    assert!(matches!(ur.initialize(&mut s, &p), Err(Error::Setup(_))));
}

#[test]
fn urprot_flash_upload_roundtrip() {
    let p = m328p_with_mcuid(679);
    let feats = UrFeatures::URPROTOCOL
        | UrFeatures::CHIP_ERASE
        | UrFeatures::READ_FLASH
        | UrFeatures::EEPROM;
    let mock = MockBoot::urboot(32768, 128, 679, feats, 4, 0, 0);
    let cfg = UrclockConfig {
        nometadata: true,
        ..UrclockConfig::default()
    };
    let (mut ur, mut s) = connect(mock, &p, cfg);

    let image: Vec<u8> = (0..600).map(|i| (i * 7 % 251) as u8).collect();
    let mut part_ref = p.clone();
    part_ref.locate_mem_mut("flash").unwrap().load(0, &image);

    let mut part_wr = part_ref.clone();
    engine::write_mem(&mut ur, &mut s, &mut part_wr, "flash", 32768, false).unwrap();

    // whole pages, ascending: ceil(600/128) pages
    let mut part_rd = p.clone();
    engine::read_mem(&mut ur, &mut s, &mut part_rd, "flash", None).unwrap();
    engine::verify_mem(&mut ur, &mut s, &part_rd, &part_ref, "flash", 32768).unwrap();
}

#[test]
fn urprot_eeprom_roundtrip() {
    let p = m328p_with_mcuid(679);
    let feats = UrFeatures::URPROTOCOL
        | UrFeatures::CHIP_ERASE
        | UrFeatures::READ_FLASH
        | UrFeatures::EEPROM;
    let mock = MockBoot::urboot(32768, 128, 679, feats, 4, 0, 0);
    let (mut ur, mut s) = connect(mock, &p, UrclockConfig::default());

    let mut part_ref = p.clone();
    part_ref
        .locate_mem_mut("eeprom")
        .unwrap()
        .load(16, &[0xde, 0xad, 0xbe, 0xef]);
    let mut part_wr = part_ref.clone();
    engine::write_mem(&mut ur, &mut s, &mut part_wr, "eeprom", 1024, false).unwrap();

    let mut part_rd = p.clone();
    engine::read_mem(&mut ur, &mut s, &mut part_rd, "eeprom", None).unwrap();
    engine::verify_mem(&mut ur, &mut s, &part_rd, &part_ref, "eeprom", 1024).unwrap();
}

#[test]
fn bootloader_area_writes_are_refused() {
    let p = m328p_with_mcuid(679);
    let mock = MockBoot::urboot(32768, 128, 679, UrFeatures::all(), 4, 0, 0);
    let (mut ur, mut s) = connect(mock, &p, UrclockConfig::default());

    let mut part = p.clone();
    part.locate_mem_mut("flash")
        .unwrap()
        .load(32768 - 512, &[0; 4]); // first bootloader byte
    let err = engine::write_mem(&mut ur, &mut s, &mut part, "flash", 32768, false).unwrap_err();
    assert!(matches!(err, Error::BootloaderOverlap(_)));
}

#[test]
fn signature_comes_from_the_sync_identity() {
    let p = m328p_with_mcuid(679);
    let mock = MockBoot::urboot(32768, 128, 679, UrFeatures::all(), 4, 0, 0);
    let (mut ur, mut s) = connect(mock, &p, UrclockConfig::default());
    let mut part = p.clone();
    let sig = engine::read_signature(&mut ur, &mut s, &mut part).unwrap();
    assert_eq!(sig, p.signature);
}

#[test]
fn chip_erase_emulation_floods_the_application_area() {
    // scenario: bootloader without CHIP_ERASE; the first upload turns
    // into a full application-area write
    let p = m328p_with_mcuid(679);
    let feats = UrFeatures::URPROTOCOL | UrFeatures::READ_FLASH | UrFeatures::EEPROM;
    let mock = MockBoot::urboot(32768, 128, 679, feats, 4, 0, 0);
    let cfg = UrclockConfig {
        nometadata: true,
        ..UrclockConfig::default()
    };
    let (mut ur, mut s) = connect(mock, &p, cfg);

    engine::chip_erase(&mut ur, &mut s, &p).unwrap();

    let mut part = p.clone();
    part.locate_mem_mut("flash").unwrap().load(0, &[1, 2, 3, 4]);
    engine::write_mem(&mut ur, &mut s, &mut part, "flash", 32768, false).unwrap();

    let blstart = 32768 - 512;
    assert_eq!(ur.transport().page_writes, blstart / 128);
    assert_eq!(&ur.transport().flash[..4], &[1, 2, 3, 4]);
    assert!(ur.transport().flash[4..blstart].iter().all(|&b| b == 0xff));
    assert_eq!(ur.transport().ce_count, 0);

    // emulation happens once: the next upload only writes its pages
    let before = ur.transport().page_writes;
    let mut part2 = p.clone();
    part2.locate_mem_mut("flash").unwrap().load(0, &[9, 9]);
    engine::write_mem(&mut ur, &mut s, &mut part2, "flash", 32768, false).unwrap();
    assert_eq!(ur.transport().page_writes, before + 1);
}

#[test]
fn real_chip_erase_is_used_when_offered() {
    let p = m328p_with_mcuid(679);
    let mock = MockBoot::urboot(32768, 128, 679, UrFeatures::all(), 4, 0, 0);
    let (mut ur, mut s) = connect(mock, &p, UrclockConfig::default());
    engine::chip_erase(&mut ur, &mut s, &p).unwrap();
    assert_eq!(ur.transport().ce_count, 1);
}

#[test]
fn vector_bootloader_patches_reset_and_vbl_slot() {
    // scenario: ATtiny2313 with a vector bootloader at 0x700, vector 16
    let mut p = registry::attiny2313();
    p.mcuid = 1;
    let feats = UrFeatures::URPROTOCOL
        | UrFeatures::CHIP_ERASE
        | UrFeatures::READ_FLASH
        | UrFeatures::EEPROM;
    let cap = 1 | protocol::CAP_CHIP_ERASE | protocol::CAP_EEPROM; // vbl level 1
    let mock = MockBoot::urboot(2048, 32, 1, feats, 8, 16, cap);
    let cfg = UrclockConfig {
        nometadata: true,
        ..UrclockConfig::default()
    };
    let (mut ur, mut s) = connect(mock, &p, cfg);
    assert_eq!(ur.bootloader_start(), 0x700);

    // application starting at 0x40
    let mut part_ref = p.clone();
    {
        let flash = part_ref.locate_mem_mut("flash").unwrap();
        flash.load(0, &jump::rjmp_opcode(0x40, 2048).to_le_bytes());
        flash.load(0x40, &[0x0f, 0xef, 0x08, 0x95]);
    }
    let mut part_wr = part_ref.clone();
    engine::write_mem(&mut ur, &mut s, &mut part_wr, "flash", 2048, false).unwrap();

    let dev_flash = &ur.transport().flash;
    // on-device reset vector jumps to the bootloader, wrapped mod 2 KiB
    let w0 = u16::from_le_bytes([dev_flash[0], dev_flash[1]]);
    assert!(jump::is_rjmp(w0));
    assert_eq!(jump::dist_rjmp(w0, 2048).rem_euclid(2048), 0x700);
    // vector slot 16 jumps back to the application entry
    let va = 16 * 2;
    let wv = u16::from_le_bytes([dev_flash[va], dev_flash[va + 1]]);
    assert!(jump::is_rjmp(wv));
    assert_eq!(
        (va as i32 + jump::dist_rjmp(wv, 2048)).rem_euclid(2048),
        0x40
    );

    // read back and verify: the patched vectors are protected, so the
    // verify passes against the unpatched input
    let mut part_rd = p.clone();
    engine::read_mem(&mut ur, &mut s, &mut part_rd, "flash", None).unwrap();
    engine::verify_mem(&mut ur, &mut s, &part_rd, &part_ref, "flash", 2048).unwrap();
}

#[test]
fn classic_bootloader_remaps_legacy_sync_pair() {
    let p = registry::atmega328p();
    let mock = MockBoot::classic(32768, 128, true);
    let (ur, _s) = connect(mock, &p, UrclockConfig::default());
    assert_eq!(ur.sync_pair(), (protocol::STK_INSYNC, protocol::STK_OK));
    // no urboot trailer: bootloader geometry stays unknown
    assert_eq!(ur.bootloader_start(), 0);
}

#[test]
fn classic_flash_upload_uses_word_addresses() {
    let p = registry::atmega328p();
    let mock = MockBoot::classic(32768, 128, false);
    let (mut ur, mut s) = connect(mock, &p, UrclockConfig::default());

    let image: Vec<u8> = (0..256).map(|i| i as u8).collect();
    let mut part_ref = p.clone();
    part_ref.locate_mem_mut("flash").unwrap().load(0x100, &image);
    let mut part_wr = part_ref.clone();
    engine::write_mem(&mut ur, &mut s, &mut part_wr, "flash", 32768, false).unwrap();
    assert_eq!(&ur.transport().flash[0x100..0x200], &image[..]);

    let mut part_rd = p.clone();
    engine::read_mem(&mut ur, &mut s, &mut part_rd, "flash", None).unwrap();
    engine::verify_mem(&mut ur, &mut s, &part_rd, &part_ref, "flash", 32768).unwrap();
}

#[test]
fn classic_extended_address_is_cached() {
    let p = registry::atmega2560();
    let mock = MockBoot::classic(262144, 256, false);
    let (mut ur, mut s) = connect(mock, &p, UrclockConfig::default());
    let before = ur.transport().universal_cmds;

    // two pages beyond the 64 K word boundary
    let mut part = p.clone();
    part.locate_mem_mut("flash")
        .unwrap()
        .load(0x20000, &[0xab; 512]);
    engine::write_mem(&mut ur, &mut s, &mut part, "flash", 262144, false).unwrap();

    assert_eq!(&ur.transport().flash[0x20000..0x20200], &[0xab; 512][..]);
    // one LOAD_EXT_ADDR covers both pages in the same bank
    assert_eq!(ur.transport().universal_cmds, before + 1);
}

#[test]
fn classic_eeprom_uses_byte_addresses() {
    let p = registry::atmega328p();
    let mock = MockBoot::classic(32768, 128, false);
    let (mut ur, mut s) = connect(mock, &p, UrclockConfig::default());

    let mut part_ref = p.clone();
    part_ref
        .locate_mem_mut("eeprom")
        .unwrap()
        .load(0x33, &[0xca, 0xfe]);
    let mut part_wr = part_ref.clone();
    engine::write_mem(&mut ur, &mut s, &mut part_wr, "eeprom", 1024, false).unwrap();
    // eeprom page 4: the tagged page starts at 0x30, byte-addressed
    assert_eq!(&ur.transport().eeprom[0x33..0x35], &[0xca, 0xfe]);

    let mut part_rd = p.clone();
    engine::read_mem(&mut ur, &mut s, &mut part_rd, "eeprom", None).unwrap();
    engine::verify_mem(&mut ur, &mut s, &part_rd, &part_ref, "eeprom", 1024).unwrap();
}

#[test]
fn page_erase_is_advertised_for_nor_bootloaders() {
    use avrprog::Capabilities;
    let p = m328p_with_mcuid(679);
    let feats = UrFeatures::URPROTOCOL | UrFeatures::READ_FLASH | UrFeatures::NOR_LL;
    let mock = MockBoot::urboot(32768, 128, 679, feats, 4, 0, 0);
    let (ur, _s) = connect(mock, &p, UrclockConfig::default());
    assert!(ur.capabilities().contains(Capabilities::PAGE_ERASE));

    let feats = UrFeatures::URPROTOCOL | UrFeatures::READ_FLASH;
    let mock = MockBoot::urboot(32768, 128, 679, feats, 4, 0, 0);
    let (ur, _s) = connect(mock, &p, UrclockConfig::default());
    assert!(!ur.capabilities().contains(Capabilities::PAGE_ERASE));
}
