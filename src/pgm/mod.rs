//! Programmer abstraction.
//!
//! Back-ends implement [`Programmer`]; the engine only talks through it.
//! Optional operations have probing defaults that report
//! [`Error::Unsupported`], and [`Programmer::capabilities`] answers the
//! "can it?" question without a trial call.

use bitflags::bitflags;

use crate::engine;
use crate::error::{Error, Result};
use crate::led::{Led, Leds};
use crate::part::{Memory, Part, PgmModes};
use crate::progress::Session;

bitflags! {
    /// Operations a back-end implements beyond the mandatory set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u32 {
        /// 4-byte SPI command passthrough.
        const CMD             = 1 << 0;
        /// Raw TPI command exchange.
        const CMD_TPI         = 1 << 1;
        /// Free-form SPI exchange.
        const SPI             = 1 << 2;
        const PAGED_LOAD      = 1 << 3;
        const PAGED_WRITE     = 1 << 4;
        const PAGE_ERASE      = 1 << 5;
        const CHIP_ERASE      = 1 << 6;
        const UNLOCK          = 1 << 7;
        const READ_SIG_BYTES  = 1 << 8;
        const READ_SIB        = 1 << 9;
        /// Target power can be switched on and off.
        const POWER_CONTROL   = 1 << 10;
        /// VCC pin control, required by the power-cycle write recovery.
        const VCC_CONTROL     = 1 << 11;
        /// Physical LED pins are wired up.
        const LED_PINS        = 1 << 12;
        /// `readonly` reports a per-address protection map.
        const READONLY_MAP    = 1 << 13;
        /// Back-end wants `flash_write_hook` before flash writes.
        const FLASH_WRITE_HOOK = 1 << 14;
    }
}

/// How the programmer hardware attaches to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    Serial,
    Usb,
    Spi,
    LinuxGpio,
    Parallel,
}

/// One semantic pin: physical pin number, optionally inverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinDef {
    pub num: u8,
    pub invert: bool,
}

/// Semantic pin assignments of a programmer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PinMap {
    pub vcc: Option<PinDef>,
    pub buff: Option<PinDef>,
    pub reset: Option<PinDef>,
    pub sck: Option<PinDef>,
    pub sdo: Option<PinDef>,
    pub sdi: Option<PinDef>,
    pub led_rdy: Option<PinDef>,
    pub led_err: Option<PinDef>,
    pub led_pgm: Option<PinDef>,
    pub led_vfy: Option<PinDef>,
}

/// Static description of a programmer.
#[derive(Debug, Clone)]
pub struct PgmDesc {
    /// Primary identifier, e.g. `"urclock"`.
    pub id: String,
    pub desc: String,
    pub prog_modes: PgmModes,
    pub conn_type: ConnType,
    pub baudrate: Option<u32>,
    /// SCK period for bit-banged SPI, microseconds.
    pub bitclock_us: Option<f64>,
    /// Extra settle delay per ISP clock transition, microseconds.
    pub isp_delay_us: u32,
    pub pins: PinMap,
}

impl PgmDesc {
    pub fn new(id: &str, desc: &str, conn_type: ConnType) -> Self {
        Self {
            id: id.to_string(),
            desc: desc.to_string(),
            prog_modes: PgmModes::empty(),
            conn_type,
            baudrate: None,
            bitclock_us: None,
            isp_delay_us: 0,
            pins: PinMap::default(),
        }
    }
}

/// The uniform capability-based programmer interface.
///
/// Mandatory: `open`, `initialize`, `program_enable` and the accessors.
/// Everything else defaults to a probe-able "not supported" or no-op;
/// [`Programmer::capabilities`] must agree with what is overridden.
pub trait Programmer {
    fn desc(&self) -> &PgmDesc;

    fn capabilities(&self) -> Capabilities;

    fn leds(&self) -> &Leds;

    fn leds_mut(&mut self) -> &mut Leds;

    /// Drive a physical LED pin. Only called for changed state, already
    /// rate-limited by the LED machine.
    fn set_led_phy(&mut self, led: Led, on: bool) {
        let _ = (led, on);
    }

    /// Claim the port and bring the hardware to a usable state.
    fn open(&mut self, s: &mut Session, port: &str) -> Result<()>;

    fn close(&mut self) {}

    /// Enable the programmer output drivers.
    fn enable(&mut self, s: &mut Session, p: &Part) -> Result<()> {
        let _ = (s, p);
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        Ok(())
    }

    /// Establish contact with the part (reset dance, sync, handshakes).
    fn initialize(&mut self, s: &mut Session, p: &Part) -> Result<()>;

    fn powerup(&mut self) -> Result<()> {
        Ok(())
    }

    fn powerdown(&mut self) -> Result<()> {
        Ok(())
    }

    /// Switch the VCC pin; only with [`Capabilities::VCC_CONTROL`].
    fn set_vcc(&mut self, on: bool) -> Result<()> {
        let _ = on;
        Err(Error::Unsupported)
    }

    /// Put the part into programming mode.
    fn program_enable(&mut self, s: &mut Session, p: &Part) -> Result<()>;

    fn chip_erase(&mut self, s: &mut Session, p: &Part) -> Result<()> {
        let _ = (s, p);
        Err(Error::Unsupported)
    }

    fn unlock(&mut self, s: &mut Session, p: &Part) -> Result<()> {
        let _ = (s, p);
        Err(Error::Unsupported)
    }

    /// Exchange one 4-byte ISP command.
    fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
        let _ = cmd;
        Err(Error::Unsupported)
    }

    /// Send a raw TPI command and read `res.len()` response bytes.
    fn cmd_tpi(&mut self, cmd: &[u8], res: &mut [u8]) -> Result<()> {
        let _ = (cmd, res);
        Err(Error::Unsupported)
    }

    /// Free-form SPI exchange.
    fn spi(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        let _ = (tx, rx);
        Err(Error::Unsupported)
    }

    /// Read `n_bytes` at `addr` into `m.buf`, whole pages of `page_size`.
    fn paged_load(
        &mut self,
        s: &mut Session,
        p: &Part,
        m: &mut Memory,
        page_size: usize,
        addr: usize,
        n_bytes: usize,
    ) -> Result<()> {
        let _ = (s, p, m, page_size, addr, n_bytes);
        Err(Error::Unsupported)
    }

    /// Write `n_bytes` at `addr` from `m.buf`, whole pages of `page_size`,
    /// pages arriving in ascending address order.
    fn paged_write(
        &mut self,
        s: &mut Session,
        p: &Part,
        m: &Memory,
        page_size: usize,
        addr: usize,
        n_bytes: usize,
    ) -> Result<()> {
        let _ = (s, p, m, page_size, addr, n_bytes);
        Err(Error::Unsupported)
    }

    fn page_erase(&mut self, s: &mut Session, p: &Part, m: &Memory, addr: usize) -> Result<()> {
        let _ = (s, p, m, addr);
        Err(Error::Unsupported)
    }

    /// Prepare the device for byte writes to `m`.
    fn write_setup(&mut self, s: &mut Session, p: &Part, m: &Memory) -> Result<()> {
        let _ = (s, p, m);
        Ok(())
    }

    fn write_byte(
        &mut self,
        s: &mut Session,
        p: &Part,
        m: &Memory,
        addr: usize,
        value: u8,
    ) -> Result<()> {
        engine::write_byte_default(self, s, p, m, addr, value)
    }

    fn read_byte(&mut self, s: &mut Session, p: &Part, m: &Memory, addr: usize) -> Result<u8> {
        engine::read_byte_default(self, s, p, m, addr)
    }

    /// Fill a signature memory wholesale; only with
    /// [`Capabilities::READ_SIG_BYTES`].
    fn read_sig_bytes(&mut self, s: &mut Session, p: &Part, m: &mut Memory) -> Result<()> {
        let _ = (s, p, m);
        Err(Error::Unsupported)
    }

    fn read_sib(&mut self, s: &mut Session, p: &Part) -> Result<String> {
        let _ = (s, p);
        Err(Error::Unsupported)
    }

    /// Per-address protection map; verify counts mismatches here as
    /// expected rather than as errors.
    fn readonly(&self, s: &Session, p: &Part, m: &Memory, addr: usize) -> bool {
        let _ = (s, p, m, addr);
        false
    }

    /// Called once before the engine writes a flash memory, with the
    /// buffer already loaded. Back-ends patch vectors, add metadata or
    /// flood tags for chip-erase emulation here.
    fn flash_write_hook(&mut self, s: &mut Session, p: &Part, m: &mut Memory) -> Result<()> {
        let _ = (s, p, m);
        Ok(())
    }

    /// Digest `-x` extended parameters.
    fn parse_ext_params(&mut self, s: &mut Session, params: &[String]) -> Result<()> {
        let _ = s;
        if params.is_empty() {
            Ok(())
        } else {
            Err(Error::Setup(format!(
                "programmer {} takes no extended parameters",
                self.desc().id
            )))
        }
    }
}
