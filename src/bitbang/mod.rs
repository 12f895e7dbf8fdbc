//! Bit-banged ISP programmer: SPI over four GPIO pins, plus the TPI
//! framing for reduced-core parts.
//!
//! Pins come in through the `embedded-hal` digital traits, so anything
//! from a linux-gpio character device to an FT232 bit-bang shim plugs in.
//! Logic level is the programmer's view: `set_low` on RESET asserts it;
//! inverters belong to the pin implementation.

use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use log::debug;

use crate::error::{Error, Result};
use crate::led::Leds;
use crate::opcode::Op;
use crate::part::{Part, PgmModes};
use crate::pgm::{Capabilities, ConnType, PgmDesc, Programmer};
use crate::progress::{self, Session};
use crate::tpi;

/// Placeholder for pins the hardware does not have.
pub struct NoPin;

impl ErrorType for NoPin {
    type Error = core::convert::Infallible;
}

impl OutputPin for NoPin {
    fn set_low(&mut self) -> core::result::Result<(), Self::Error> {
        Ok(())
    }
    fn set_high(&mut self) -> core::result::Result<(), Self::Error> {
        Ok(())
    }
}

/// Default SCK half period when no bit clock is configured, µs.
const DEFAULT_HALF_PERIOD_US: u32 = 4;

/// Clock cycles to hunt for a TPI start bit before giving up.
const TPI_START_HUNT: u32 = 192;

fn pin_err<E>(_: E) -> Error {
    Error::Transport("GPIO pin error".into())
}

/// Bit-bang programmer over RESET/SCK/SDO/SDI, with an optional VCC
/// switch.
pub struct BitBang<RST, SCK, SDO, SDI, VCC = NoPin> {
    desc: PgmDesc,
    leds: Leds,
    rst: RST,
    sck: SCK,
    sdo: SDO,
    sdi: SDI,
    vcc: Option<VCC>,
    half_period_us: u32,
}

impl<RST, SCK, SDO, SDI, VCC> BitBang<RST, SCK, SDO, SDI, VCC>
where
    RST: OutputPin,
    SCK: OutputPin,
    SDO: OutputPin,
    SDI: InputPin,
    VCC: OutputPin,
{
    pub fn new(rst: RST, sck: SCK, sdo: SDO, sdi: SDI) -> Self {
        let mut desc = PgmDesc::new("bitbang", "SPI bit-bang programmer", ConnType::LinuxGpio);
        desc.prog_modes = PgmModes::ISP | PgmModes::TPI;
        Self {
            desc,
            leds: Leds::new(),
            rst,
            sck,
            sdo,
            sdi,
            vcc: None,
            half_period_us: DEFAULT_HALF_PERIOD_US,
        }
    }

    pub fn with_vcc(mut self, vcc: VCC) -> Self {
        self.vcc = Some(vcc);
        self
    }

    /// Set the SCK period from a bit clock in microseconds.
    pub fn with_bitclock_us(mut self, period_us: f64) -> Self {
        self.desc.bitclock_us = Some(period_us);
        self.half_period_us = ((period_us / 2.0).ceil() as u32).max(1);
        self
    }

    fn half_wait(&self) {
        progress::usleep(self.half_period_us + self.desc.isp_delay_us);
    }

    /// One SPI bit, mode 0: SDO valid before the rising edge, SDI
    /// sampled while SCK is high.
    fn spi_bit(&mut self, out: bool) -> Result<bool> {
        if out {
            self.sdo.set_high().map_err(pin_err)?;
        } else {
            self.sdo.set_low().map_err(pin_err)?;
        }
        self.half_wait();
        self.sck.set_high().map_err(pin_err)?;
        let got = self.sdi.is_high().map_err(pin_err)?;
        self.half_wait();
        self.sck.set_low().map_err(pin_err)?;
        Ok(got)
    }

    fn spi_byte(&mut self, out: u8) -> Result<u8> {
        let mut got = 0u8;
        for bit in (0..8).rev() {
            if self.spi_bit(out & (1 << bit) != 0)? {
                got |= 1 << bit;
            }
        }
        Ok(got)
    }

    // TPI is LSB-first with the line idling high; the device shifts on
    // the falling edge and we sample on the rising one.

    fn tpi_write_bit(&mut self, bit: bool) -> Result<()> {
        if bit {
            self.sdo.set_high().map_err(pin_err)?;
        } else {
            self.sdo.set_low().map_err(pin_err)?;
        }
        self.half_wait();
        self.sck.set_high().map_err(pin_err)?;
        self.half_wait();
        self.sck.set_low().map_err(pin_err)?;
        Ok(())
    }

    fn tpi_read_bit(&mut self) -> Result<bool> {
        self.half_wait();
        self.sck.set_high().map_err(pin_err)?;
        let got = self.sdi.is_high().map_err(pin_err)?;
        self.half_wait();
        self.sck.set_low().map_err(pin_err)?;
        Ok(got)
    }

    fn tpi_write_byte(&mut self, b: u8) -> Result<()> {
        let f = tpi::frame(b);
        for i in 0..tpi::FRAME_BITS {
            self.tpi_write_bit(f & (1 << i) != 0)?;
        }
        // release the line high
        self.sdo.set_high().map_err(pin_err)?;
        Ok(())
    }

    fn tpi_read_byte(&mut self) -> Result<u8> {
        // hunt for the start bit; the line idles high
        let mut hunted = 0;
        loop {
            if !self.tpi_read_bit()? {
                break;
            }
            hunted += 1;
            if hunted >= TPI_START_HUNT {
                return Err(Error::Timeout("TPI start bit"));
            }
        }
        let mut f: u16 = 0; // start bit is the zero just seen
        for i in 1..tpi::FRAME_BITS {
            if self.tpi_read_bit()? {
                f |= 1 << i;
            }
        }
        tpi::unframe(f)
    }

    /// Idle clocks with the data line high, as the TPI entry sequence
    /// requires.
    fn tpi_idle_bits(&mut self, n: u32) -> Result<()> {
        for _ in 0..n {
            self.tpi_write_bit(true)?;
        }
        Ok(())
    }

    fn enter_isp(&mut self, s: &mut Session, p: &Part) -> Result<()> {
        // reset dance: RESET and SCK low, a positive reset pulse, then
        // wait before program enable
        self.sck.set_low().map_err(pin_err)?;
        self.rst.set_low().map_err(pin_err)?;
        progress::usleep(20_000);
        self.rst.set_high().map_err(pin_err)?;
        progress::usleep(100);
        self.rst.set_low().map_err(pin_err)?;
        progress::usleep(20_000);
        self.program_enable(s, p)
    }

    fn enter_tpi(&mut self, s: &mut Session, _p: &Part) -> Result<()> {
        self.sck.set_low().map_err(pin_err)?;
        self.sdo.set_high().map_err(pin_err)?;
        self.rst.set_low().map_err(pin_err)?;
        progress::usleep(20_000);
        // 16+ idle bits activate the TPI physical layer
        self.tpi_idle_bits(32)?;
        tpi::enable_nvm(self, s)
    }
}

impl<RST, SCK, SDO, SDI, VCC> Programmer for BitBang<RST, SCK, SDO, SDI, VCC>
where
    RST: OutputPin,
    SCK: OutputPin,
    SDO: OutputPin,
    SDI: InputPin,
    VCC: OutputPin,
{
    fn desc(&self) -> &PgmDesc {
        &self.desc
    }

    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::CMD | Capabilities::CMD_TPI | Capabilities::SPI;
        if self.vcc.is_some() {
            caps |= Capabilities::VCC_CONTROL | Capabilities::POWER_CONTROL;
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
        debug!("bit-bang programmer on {port}");
        Ok(())
    }

    fn powerup(&mut self) -> Result<()> {
        self.set_vcc(true).or_else(|e| match e {
            Error::Unsupported => Ok(()),
            e => Err(e),
        })
    }

    fn powerdown(&mut self) -> Result<()> {
        self.set_vcc(false).or_else(|e| match e {
            Error::Unsupported => Ok(()),
            e => Err(e),
        })
    }

    fn set_vcc(&mut self, on: bool) -> Result<()> {
        match self.vcc.as_mut() {
            Some(pin) => {
                if on {
                    pin.set_high().map_err(pin_err)?;
                    progress::usleep(100_000);
                } else {
                    pin.set_low().map_err(pin_err)?;
                }
                Ok(())
            }
            None => Err(Error::Unsupported),
        }
    }

    fn initialize(&mut self, s: &mut Session, p: &Part) -> Result<()> {
        self.powerup()?;
        progress::usleep(50_000);
        if p.has_mode(PgmModes::TPI) {
            self.enter_tpi(s, p)
        } else {
            self.enter_isp(s, p)
        }
    }

    fn close(&mut self) {
        let _ = self.rst.set_high();
        let _ = self.powerdown();
    }

    fn program_enable(&mut self, s: &mut Session, p: &Part) -> Result<()> {
        if p.has_mode(PgmModes::TPI) {
            // NVM access was enabled on entry
            return Ok(());
        }
        let op = p
            .any_op(Op::PgmEnable)
            .ok_or_else(|| Error::Setup(format!("part {} has no program-enable opcode", p.desc)))?;
        let mut cmd = [0u8; 4];
        op.set_bits(&mut cmd);

        // the part echoes the second command byte when it is listening;
        // a missed echo gets another SCK pulse and another try
        for attempt in 0..32 {
            let res = self.cmd(&cmd)?;
            if res[2] == cmd[1] {
                if attempt > 0 {
                    debug!("program enable succeeded on attempt {}", attempt + 1);
                }
                return Ok(());
            }
            self.sck.set_high().map_err(pin_err)?;
            self.half_wait();
            self.sck.set_low().map_err(pin_err)?;
            progress::usleep(20_000);
        }
        let _ = s;
        Err(Error::Device(format!(
            "part {} does not answer program enable",
            p.desc
        )))
    }

    fn chip_erase(&mut self, s: &mut Session, p: &Part) -> Result<()> {
        if p.has_mode(PgmModes::TPI) {
            let flash = p
                .locate_mem("flash")
                .ok_or_else(|| Error::Setup(format!("part {} has no flash", p.desc)))?;
            let offset = flash.offset as u16;
            tpi::chip_erase(self, s, offset)?;
            progress::usleep(p.chip_erase_delay);
            return Ok(());
        }
        let op = p
            .any_op(Op::ChipErase)
            .ok_or_else(|| Error::Setup(format!("part {} has no chip-erase opcode", p.desc)))?;
        let mut cmd = [0u8; 4];
        op.set_bits(&mut cmd);
        self.cmd(&cmd)?;
        progress::usleep(p.chip_erase_delay);
        // the erase drops programming mode on most parts
        self.program_enable(s, p)
    }

    fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
        let mut res = [0u8; 4];
        for i in 0..4 {
            res[i] = self.spi_byte(cmd[i])?;
        }
        Ok(res)
    }

    fn spi(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        for (i, &b) in tx.iter().enumerate() {
            let got = self.spi_byte(b)?;
            if let Some(slot) = rx.get_mut(i) {
                *slot = got;
            }
        }
        Ok(())
    }

    fn cmd_tpi(&mut self, cmd: &[u8], res: &mut [u8]) -> Result<()> {
        for &b in cmd {
            self.tpi_write_byte(b)?;
        }
        for slot in res.iter_mut() {
            *slot = self.tpi_read_byte()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    // A recorded wire: SCK rising edges sample the SDO level, which is
    // exactly what the device would see.
    #[derive(Default)]
    struct Wire {
        sck: bool,
        sdo: bool,
        sampled: Vec<bool>,
        sdi_script: Vec<bool>,
        sdi_at: usize,
    }

    #[derive(Clone)]
    struct WireRef(Rc<RefCell<Wire>>);

    struct SckPin(WireRef);
    struct SdoPin(WireRef);
    struct SdiPin(WireRef);
    struct DummyPin;

    impl ErrorType for SckPin {
        type Error = core::convert::Infallible;
    }
    impl OutputPin for SckPin {
        fn set_low(&mut self) -> core::result::Result<(), Self::Error> {
            self.0 .0.borrow_mut().sck = false;
            Ok(())
        }
        fn set_high(&mut self) -> core::result::Result<(), Self::Error> {
            let mut w = self.0 .0.borrow_mut();
            if !w.sck {
                let level = w.sdo;
                w.sampled.push(level);
                w.sdi_at += 1;
            }
            w.sck = true;
            Ok(())
        }
    }

    impl ErrorType for SdoPin {
        type Error = core::convert::Infallible;
    }
    impl OutputPin for SdoPin {
        fn set_low(&mut self) -> core::result::Result<(), Self::Error> {
            self.0 .0.borrow_mut().sdo = false;
            Ok(())
        }
        fn set_high(&mut self) -> core::result::Result<(), Self::Error> {
            self.0 .0.borrow_mut().sdo = true;
            Ok(())
        }
    }

    impl ErrorType for SdiPin {
        type Error = core::convert::Infallible;
    }
    impl InputPin for SdiPin {
        fn is_high(&mut self) -> core::result::Result<bool, Self::Error> {
            let w = self.0 .0.borrow();
            Ok(w
                .sdi_script
                .get(w.sdi_at.saturating_sub(1))
                .copied()
                .unwrap_or(true))
        }
        fn is_low(&mut self) -> core::result::Result<bool, Self::Error> {
            self.is_high().map(|b| !b)
        }
    }

    impl ErrorType for DummyPin {
        type Error = core::convert::Infallible;
    }
    impl OutputPin for DummyPin {
        fn set_low(&mut self) -> core::result::Result<(), Self::Error> {
            Ok(())
        }
        fn set_high(&mut self) -> core::result::Result<(), Self::Error> {
            Ok(())
        }
    }

    fn rig() -> (
        BitBang<DummyPin, SckPin, SdoPin, SdiPin>,
        WireRef,
    ) {
        let wire = WireRef(Rc::new(RefCell::new(Wire::default())));
        let bb = BitBang::new(
            DummyPin,
            SckPin(wire.clone()),
            SdoPin(wire.clone()),
            SdiPin(wire.clone()),
        )
        .with_bitclock_us(0.0);
        (bb, wire)
    }

    #[test]
    fn spi_byte_is_msb_first() {
        let (mut bb, wire) = rig();
        bb.spi_byte(0xa5).unwrap();
        let bits: Vec<bool> = wire.0.borrow().sampled.clone();
        let sent: u8 = bits
            .iter()
            .fold(0u8, |acc, &b| (acc << 1) | u8::from(b));
        assert_eq!(bits.len(), 8);
        assert_eq!(sent, 0xa5);
    }

    #[test]
    fn spi_byte_reads_scripted_response() {
        let (mut bb, wire) = rig();
        // device answers 0x53 (program-enable echo), MSB first
        wire.0.borrow_mut().sdi_script = (0..8).rev().map(|i| 0x53u8 & (1 << i) != 0).collect();
        let got = bb.spi_byte(0x00).unwrap();
        assert_eq!(got, 0x53);
    }

    #[test]
    fn tpi_frames_go_out_lsb_first_with_parity() {
        let (mut bb, wire) = rig();
        bb.tpi_write_byte(tpi::SSTPR_LO).unwrap();
        bb.tpi_write_byte(0x40).unwrap();
        let bits = wire.0.borrow().sampled.clone();
        assert_eq!(bits.len(), 2 * tpi::FRAME_BITS);
        for (chunk, byte) in bits.chunks(tpi::FRAME_BITS).zip([tpi::SSTPR_LO, 0x40]) {
            let mut f = 0u16;
            for (i, &b) in chunk.iter().enumerate() {
                if b {
                    f |= 1 << i;
                }
            }
            assert_eq!(tpi::unframe(f).unwrap(), byte);
        }
    }

    #[test]
    fn tpi_read_hunts_start_bit() {
        let (mut bb, wire) = rig();
        // idle high bits, then a framed 0x5a
        let f = tpi::frame(0x5a);
        let mut script = vec![true; 5];
        for i in 0..tpi::FRAME_BITS {
            script.push(f & (1 << i) != 0);
        }
        wire.0.borrow_mut().sdi_script = script;
        assert_eq!(bb.tpi_read_byte().unwrap(), 0x5a);
    }

    #[test]
    fn tpi_read_times_out_on_idle_line() {
        let (mut bb, _wire) = rig();
        // default script is all-high: no start bit ever
        assert!(matches!(bb.tpi_read_byte(), Err(Error::Timeout(_))));
    }
}
