//! Programmer LED state machine.
//!
//! Four logical LEDs track engine activity. Physical pins are slow
//! (humans watch them), so toggles are rate-limited; the exit state is
//! accumulated so the final pattern tells where a run failed.

use bitflags::bitflags;

use crate::pgm::Programmer;
use crate::progress::Session;

/// Minimum interval between physical toggles of one LED, ms.
/// 1000/(2*LED_FMAX) with LED_FMAX = 2.5 Hz.
pub const LED_MIN_PERIOD_MS: u64 = 200;

/// A logical LED.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Led {
    Rdy,
    Err,
    Pgm,
    Vfy,
}

impl Led {
    pub const ALL: [Led; 4] = [Led::Rdy, Led::Err, Led::Pgm, Led::Vfy];

    fn mask(self) -> LedMask {
        match self {
            Led::Rdy => LedMask::RDY,
            Led::Err => LedMask::ERR,
            Led::Pgm => LedMask::PGM,
            Led::Vfy => LedMask::VFY,
        }
    }

    fn index(self) -> usize {
        match self {
            Led::Rdy => 0,
            Led::Err => 1,
            Led::Pgm => 2,
            Led::Vfy => 3,
        }
    }
}

bitflags! {
    /// LED bit set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LedMask: u8 {
        const RDY = 1 << 0;
        const ERR = 1 << 1;
        const PGM = 1 << 2;
        const VFY = 1 << 3;
    }
}

/// Physical pin changes produced by one state-machine step.
pub type LedChanges = Vec<(Led, bool)>;

/// State of the four LEDs of one programmer.
#[derive(Debug, Clone, Default)]
pub struct Leds {
    /// Desired logical state.
    now: LedMask,
    /// Toggle needed to bring `phy` up to date.
    chg: LedMask,
    /// Current physical state.
    phy: LedMask,
    /// Bits to assert on program exit.
    end: LedMask,
    /// Ever-set bits; the first set of an LED bypasses rate limiting.
    set: LedMask,
    last_ms: [u64; 4],
}

impl Leds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical set. Setting ERR latches whichever of PGM/VFY is active
    /// into the exit state, so the final pattern shows where it failed.
    pub fn set(&mut self, led: Led, now_ms: u64, out: &mut LedChanges) {
        let m = led.mask();
        if led == Led::Err {
            self.end |= LedMask::ERR | (self.now & (LedMask::PGM | LedMask::VFY));
        }
        let first = !self.set.contains(m);
        self.now |= m;
        self.set |= m;
        self.settle(now_ms, if first { m } else { LedMask::empty() }, out);
    }

    /// Logical clear.
    pub fn clr(&mut self, led: Led, now_ms: u64, out: &mut LedChanges) {
        self.now &= !led.mask();
        self.settle(now_ms, LedMask::empty(), out);
    }

    /// Rate-limited catch-up of the physical state (the NOP tick).
    pub fn tick(&mut self, now_ms: u64, out: &mut LedChanges) {
        self.settle(now_ms, LedMask::empty(), out);
    }

    /// Session start: everything off, immediately.
    pub fn begin(&mut self, now_ms: u64, out: &mut LedChanges) {
        self.now = LedMask::empty();
        self.end = LedMask::empty();
        self.set = LedMask::empty();
        self.settle(now_ms, LedMask::all(), out);
    }

    /// Session end: RDY off, ERR/PGM/VFY forced to the accumulated exit
    /// state.
    pub fn finish(&mut self, now_ms: u64, out: &mut LedChanges) {
        self.now = self.end & (LedMask::ERR | LedMask::PGM | LedMask::VFY);
        self.settle(now_ms, LedMask::all(), out);
    }

    /// The exit pattern: empty means success, ERR alone a non-r/w error,
    /// ERR+PGM a read/write/erase error, ERR+VFY a verify error, all
    /// three both.
    pub fn end_state(&self) -> LedMask {
        self.end
    }

    /// Current logical state of one LED.
    pub fn is_on(&self, led: Led) -> bool {
        self.now.contains(led.mask())
    }

    fn settle(&mut self, now_ms: u64, forced: LedMask, out: &mut LedChanges) {
        self.chg = self.now ^ self.phy;
        for led in Led::ALL {
            let m = led.mask();
            if !self.chg.contains(m) {
                continue;
            }
            let i = led.index();
            let due = now_ms.saturating_sub(self.last_ms[i]) >= LED_MIN_PERIOD_MS;
            if forced.contains(m) || due {
                self.phy ^= m;
                self.last_ms[i] = now_ms;
                out.push((led, self.phy.contains(m)));
            }
        }
        self.chg = self.now ^ self.phy;
    }
}

// Driver-facing wrappers: update the logical state and push the physical
// changes out through the programmer's LED pins.

pub fn led_set<P: Programmer + ?Sized>(pgm: &mut P, s: &Session, led: Led) {
    let now = s.millis();
    let mut out = LedChanges::new();
    pgm.leds_mut().set(led, now, &mut out);
    apply(pgm, &out);
}

pub fn led_clr<P: Programmer + ?Sized>(pgm: &mut P, s: &Session, led: Led) {
    let now = s.millis();
    let mut out = LedChanges::new();
    pgm.leds_mut().clr(led, now, &mut out);
    apply(pgm, &out);
}

pub fn led_beg<P: Programmer + ?Sized>(pgm: &mut P, s: &Session) {
    let now = s.millis();
    let mut out = LedChanges::new();
    pgm.leds_mut().begin(now, &mut out);
    apply(pgm, &out);
}

pub fn led_end<P: Programmer + ?Sized>(pgm: &mut P, s: &Session) {
    let now = s.millis();
    let mut out = LedChanges::new();
    pgm.leds_mut().finish(now, &mut out);
    apply(pgm, &out);
}

fn apply<P: Programmer + ?Sized>(pgm: &mut P, changes: &LedChanges) {
    for &(led, on) in changes {
        pgm.set_led_phy(led, on);
    }
}
