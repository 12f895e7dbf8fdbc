//! AVR part and memory descriptors.
//!
//! A [`Part`] describes one MCU: its programming modes, signature and an
//! ordered list of [`Memory`] regions with geometry, opcode templates and
//! the session buffers the engine reads into and writes from.

use bitflags::bitflags;

use crate::opcode::{Op, Opcode, NUM_OPS};

pub mod memtype;
pub mod registry;

pub use memtype::MemType;

bitflags! {
    /// Programming modes a part or programmer supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PgmModes: u16 {
        const SPM       = 1 << 0;
        const TPI       = 1 << 1;
        const ISP       = 1 << 2;
        const PDI       = 1 << 3;
        const UPDI      = 1 << 4;
        const HVSP      = 1 << 5;
        const HVPP      = 1 << 6;
        const DEBUGWIRE = 1 << 7;
        const JTAG      = 1 << 8;
    }
}

/// The ALLOCATED bit of a tag byte: the file layer supplied this byte.
pub const TAG_ALLOCATED: u8 = 0x01;

/// What the RESET pin does on this part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetDisposition {
    #[default]
    Dedicated,
    Io,
}

/// ISP timing parameters some back-ends forward to the hardware. The
/// engine passes them through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IspTiming {
    pub timeout: u8,
    pub stab_delay: u8,
    pub cmd_exe_delay: u8,
    pub synch_loops: u8,
    pub byte_delay: u8,
    pub pool_index: u8,
    pub pool_value: u8,
}

/// One memory region of a part, together with its session buffers.
#[derive(Debug, Clone)]
pub struct Memory {
    /// Canonical descriptor name.
    pub name: String,
    pub mtype: MemType,
    /// Total size in bytes.
    pub size: usize,
    /// Page size in bytes; 0 or 1 means unpaged.
    pub page_size: usize,
    pub num_pages: usize,
    /// Device address-space offset (TPI/PDI/UPDI parts).
    pub offset: usize,
    /// Factory initialisation value, where the datasheet defines one.
    pub initval: Option<u16>,
    /// Active-bit mask; per-byte slices for multi-byte lock regions.
    pub bitmask: u32,
    /// Min/max write delay, microseconds.
    pub min_write_delay: u32,
    pub max_write_delay: u32,
    /// The part must be power-cycled after writing this memory.
    pub pwroff_after_write: bool,
    /// Values polling reads return while a write is still in progress.
    pub readback: [u8; 2],
    /// TPI: words per write chunk (1, 2 or 4).
    pub n_word_writes: u8,
    pub ops: [Option<Opcode>; NUM_OPS],
    pub buf: Vec<u8>,
    pub tags: Vec<u8>,
}

impl Memory {
    pub fn new(name: &str, mtype: MemType, size: usize) -> Self {
        Self {
            name: name.to_string(),
            mtype,
            size,
            page_size: 0,
            num_pages: 0,
            offset: 0,
            initval: None,
            bitmask: 0xff,
            min_write_delay: 4500,
            max_write_delay: 9000,
            pwroff_after_write: false,
            readback: [0x00, 0x00],
            n_word_writes: 0,
            ops: std::array::from_fn(|_| None),
            buf: vec![0xff; size],
            tags: vec![0; size],
        }
    }

    pub fn op(&self, op: Op) -> Option<&Opcode> {
        self.ops[op.index()].as_ref()
    }

    pub fn set_op(&mut self, op: Op, template: Opcode) {
        self.ops[op.index()] = Some(template);
    }

    /// True when the memory is programmed in pages.
    pub fn paged(&self) -> bool {
        self.page_size > 1
    }

    /// Reset the session buffer: 0xff data, no allocation tags.
    pub fn clear(&mut self) {
        self.buf.iter_mut().for_each(|b| *b = 0xff);
        self.tags.iter_mut().for_each(|t| *t = 0);
    }

    pub fn allocated(&self, i: usize) -> bool {
        self.tags[i] & TAG_ALLOCATED != 0
    }

    /// Load input bytes at `start`, tagging them as file-supplied.
    pub fn load(&mut self, start: usize, data: &[u8]) {
        self.buf[start..start + data.len()].copy_from_slice(data);
        for t in &mut self.tags[start..start + data.len()] {
            *t |= TAG_ALLOCATED;
        }
    }

    /// Any allocated byte in `[from, to)`?
    pub fn any_allocated(&self, from: usize, to: usize) -> bool {
        self.tags[from..to.min(self.size)]
            .iter()
            .any(|t| t & TAG_ALLOCATED != 0)
    }
}

/// One MCU descriptor. Immutable once loaded except for the memory
/// session buffers.
#[derive(Debug, Clone)]
pub struct Part {
    /// Human description, e.g. `"ATmega328P"`.
    pub desc: String,
    /// Short identifier, e.g. `"m328p"`.
    pub id: String,
    pub family_id: String,
    pub prog_modes: PgmModes,
    pub signature: [u8; 3],
    /// Number of interrupt vectors (including reset).
    pub n_interrupts: usize,
    /// Pages erased by one page-erase; 0/1 means a single page.
    pub n_page_erase: usize,
    pub n_boot_sections: usize,
    pub boot_section_size: usize,
    /// HV-UPDI variant, -1 when not applicable.
    pub hvupdi_variant: i8,
    /// Chip erase time, microseconds.
    pub chip_erase_delay: u32,
    pub reset_disposition: ResetDisposition,
    /// AT90S1200: a read issued between program enable and a write
    /// corrupts the write latch, so the read-skip optimisation is off.
    pub preread_unsafe: bool,
    /// Urclock MCU id, -1 when the part has none assigned.
    pub mcuid: i32,
    pub timing: IspTiming,
    /// Memory-name aliases, `(alias, canonical)`.
    pub aliases: Vec<(String, String)>,
    pub mems: Vec<Memory>,
}

impl Part {
    pub fn new(id: &str, desc: &str, signature: [u8; 3]) -> Self {
        Self {
            desc: desc.to_string(),
            id: id.to_string(),
            family_id: String::new(),
            prog_modes: PgmModes::empty(),
            signature,
            n_interrupts: 0,
            n_page_erase: 0,
            n_boot_sections: 0,
            boot_section_size: 0,
            hvupdi_variant: -1,
            chip_erase_delay: 9000,
            reset_disposition: ResetDisposition::Dedicated,
            preread_unsafe: false,
            mcuid: -1,
            timing: IspTiming::default(),
            aliases: Vec::new(),
            mems: Vec::new(),
        }
    }

    /// Resolve an alias to its canonical memory name.
    fn canonical<'n>(&'n self, name: &'n str) -> &'n str {
        self.aliases
            .iter()
            .find(|(a, _)| a == name)
            .map(|(_, c)| c.as_str())
            .unwrap_or(name)
    }

    pub fn mem_index(&self, name: &str) -> Option<usize> {
        let canonical = self.canonical(name);
        self.mems.iter().position(|m| m.name == canonical)
    }

    pub fn locate_mem(&self, name: &str) -> Option<&Memory> {
        self.mem_index(name).map(|i| &self.mems[i])
    }

    pub fn locate_mem_mut(&mut self, name: &str) -> Option<&mut Memory> {
        self.mem_index(name).map(move |i| &mut self.mems[i])
    }

    /// First memory whose type carries all of `t`.
    pub fn locate_mem_by_type(&self, t: MemType) -> Option<&Memory> {
        self.mems.iter().find(|m| m.mtype.contains(t))
    }

    /// The individual fuse at byte offset `off` of the fuses region; a
    /// two-byte fuse also answers for its high-byte offset.
    pub fn locate_fuse_by_offset(&self, off: u8) -> Option<&Memory> {
        self.mems.iter().find(|m| {
            m.mtype.is_a_fuse()
                && (m.mtype.fuse_offset() == off
                    || (m.size == 2 && off > 0 && m.mtype.fuse_offset() == off - 1))
        })
    }

    pub fn has_mode(&self, mode: PgmModes) -> bool {
        self.prog_modes.intersects(mode)
    }

    /// Active-bit mask governing byte `addr` of memory `mem`.
    pub fn mem_bitmask(&self, mem: &Memory, addr: usize) -> u8 {
        if mem.mtype.is_fuses() {
            // collective region: defer to the individual fuse
            if let Some(fuse) = self.locate_fuse_by_offset(addr as u8) {
                let mut bm = fuse.bitmask;
                if fuse.size == 2 && usize::from(fuse.mtype.fuse_offset()) + 1 == addr {
                    bm >>= 8;
                }
                return (bm & 0xff) as u8;
            }
        } else if mem.mtype.is_a_fuse() && mem.size == 2 && addr == 1 {
            return ((mem.bitmask >> 8) & 0xff) as u8;
        } else if mem.mtype.is_lock() && mem.size > 1 && mem.size <= 4 && addr < mem.size {
            return ((mem.bitmask >> (8 * addr)) & 0xff) as u8;
        }
        (mem.bitmask & 0xff) as u8
    }

    /// Opcode attached to any memory, used for the part-wide chip-erase
    /// and program-enable templates.
    pub fn any_op(&self, op: Op) -> Option<&Opcode> {
        self.mems.iter().find_map(|m| m.op(op))
    }
}

/// Find a part by its short id (case-insensitive) or exact description.
pub fn locate_part<'a>(parts: &'a [Part], id: &str) -> Option<&'a Part> {
    parts
        .iter()
        .find(|p| p.id.eq_ignore_ascii_case(id))
        .or_else(|| parts.iter().find(|p| p.desc.eq_ignore_ascii_case(id)))
}

/// Find a part by device signature.
pub fn locate_part_by_signature<'a>(parts: &'a [Part], sig: &[u8; 3]) -> Option<&'a Part> {
    parts.iter().find(|p| p.signature == *sig)
}
