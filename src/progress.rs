//! Session context: monotonic clock, progress reporting, engine knobs.
//!
//! All state that would otherwise be process-global lives here and is
//! passed explicitly through the engine and the back-ends.

use std::time::{Duration, Instant};

use crate::part::memtype::{self, MemType};

/// Receives percent-driven progress callbacks.
///
/// Callbacks run synchronously on the driver thread; implementations
/// should return quickly.
pub trait Reporter {
    /// A new operation begins; `op` is a short header such as `"Reading"`.
    fn begin(&mut self, op: &str);
    /// Progress update, strictly increasing percent in `0..=100`.
    fn update(&mut self, percent: u8);
    /// The operation finished; `ok` is false when it was aborted.
    fn end(&mut self, ok: bool);
}

/// Explicit session context threaded through every engine operation.
pub struct Session {
    epoch: Instant,
    reporter: Option<Box<dyn Reporter>>,
    active: bool,
    last_percent: u8,
    /// Disable trailing-0xff trimming of flash reads.
    pub read_full_flash: bool,
    // Memory names not in the canonical table, interned so repeated
    // lookups stay stable within the session.
    extra_mems: Vec<(String, MemType)>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            reporter: None,
            active: false,
            last_percent: 0,
            read_full_flash: false,
            extra_mems: Vec::new(),
        }
    }

    pub fn with_reporter(reporter: Box<dyn Reporter>) -> Self {
        let mut s = Self::new();
        s.reporter = Some(reporter);
        s
    }

    /// Microseconds since the session epoch.
    pub fn micros(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Milliseconds since the session epoch.
    pub fn millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn progress_begin(&mut self, op: &str) {
        self.active = true;
        self.last_percent = 0;
        if let Some(r) = self.reporter.as_mut() {
            r.begin(op);
            r.update(0);
        }
    }

    pub(crate) fn progress_step(&mut self, done: usize, total: usize) {
        if !self.active || total == 0 {
            return;
        }
        let percent = (done.min(total) * 100 / total) as u8;
        if percent > self.last_percent {
            self.last_percent = percent;
            if let Some(r) = self.reporter.as_mut() {
                r.update(percent);
            }
        }
    }

    /// Terminate the current progress report. `ok == false` is the
    /// "-1 termination" of a failed operation.
    pub(crate) fn progress_end(&mut self, ok: bool) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(r) = self.reporter.as_mut() {
            if ok {
                r.update(100);
            }
            r.end(ok);
        }
    }

    /// Type bits for a memory name, consulting the canonical table first
    /// and then the session's interned names. Unknown names are appended
    /// with [`MemType::USER_TYPE`] so later lookups agree.
    pub fn mem_type_for(&mut self, name: &str) -> MemType {
        if let Some(t) = memtype::lookup(name) {
            return t;
        }
        if let Some((_, t)) = self.extra_mems.iter().find(|(n, _)| n == name) {
            return *t;
        }
        let t = MemType::USER_TYPE;
        self.extra_mems.push((name.to_string(), t));
        t
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Busy delay in microseconds, used to honour write and erase times.
pub fn usleep(us: u32) {
    std::thread::sleep(Duration::from_micros(us as u64));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Log {
        events: std::rc::Rc<std::cell::RefCell<Vec<String>>>,
    }

    impl Reporter for Log {
        fn begin(&mut self, op: &str) {
            self.events.borrow_mut().push(format!("begin {op}"));
        }
        fn update(&mut self, percent: u8) {
            self.events.borrow_mut().push(format!("{percent}%"));
        }
        fn end(&mut self, ok: bool) {
            self.events.borrow_mut().push(format!("end {ok}"));
        }
    }

    #[test]
    fn percent_is_monotonic_and_deduplicated() {
        let events = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut s = Session::with_reporter(Box::new(Log {
            events: events.clone(),
        }));
        s.progress_begin("Reading");
        for i in 0..=100 {
            s.progress_step(i, 200);
        }
        s.progress_step(200, 200);
        s.progress_end(true);
        let ev = events.borrow();
        assert_eq!(ev.first().unwrap(), "begin Reading");
        assert_eq!(ev.last().unwrap(), "end true");
        // every percent appears at most once, in order
        let percents: Vec<&String> = ev.iter().filter(|e| e.ends_with('%')).collect();
        let mut sorted = percents.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(percents.len(), sorted.len());
    }

    #[test]
    fn failed_operation_ends_without_hundred() {
        let events = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut s = Session::with_reporter(Box::new(Log {
            events: events.clone(),
        }));
        s.progress_begin("Writing");
        s.progress_step(1, 10);
        s.progress_end(false);
        let ev = events.borrow();
        assert!(ev.contains(&"end false".to_string()));
        assert!(!ev.contains(&"100%".to_string()));
    }

    #[test]
    fn unknown_memory_names_intern_stably() {
        let mut s = Session::new();
        let t1 = s.mem_type_for("exotic");
        let t2 = s.mem_type_for("exotic");
        assert_eq!(t1, t2);
        assert!(t1.contains(MemType::USER_TYPE));
    }

    #[test]
    fn clock_is_monotonic() {
        let s = Session::new();
        let a = s.micros();
        let b = s.micros();
        assert!(b >= a);
    }
}
