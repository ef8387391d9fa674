// Shared test doubles: a deterministic clock, Cell-backed wires for
// the link phy, and a capturing interrupt pin.

#![allow(dead_code)]

use std::cell::Cell;
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::digital::{ErrorType, InputPin, OutputPin, StatefulOutputPin};

use weft::hal::{Clock, Edge, IrqPin, Isr, Pull};

/// Simulated microsecond counter. Every read advances it by `step`,
/// so an otherwise idle dispatch loop still makes time pass; tests
/// that model CPU-bound work call [`advance`](SimClock::advance).
pub struct SimClock {
    now: Cell<u32>,
    step: u32,
}

impl SimClock {
    pub fn new(step: u32) -> Rc<Self> {
        Rc::new(Self {
            now: Cell::new(0),
            step,
        })
    }

    /// Start near the counter wrap to exercise modular arithmetic.
    pub fn starting_at(start: u32, step: u32) -> Rc<Self> {
        Rc::new(Self {
            now: Cell::new(start),
            step,
        })
    }

    pub fn advance(&self, us: u32) {
        self.now.set(self.now.get().wrapping_add(us));
    }

    /// Read without advancing.
    pub fn peek(&self) -> u32 {
        self.now.get()
    }
}

impl Clock for SimClock {
    fn now_us(&self) -> u32 {
        let t = self.now.get();
        self.now.set(t.wrapping_add(self.step));
        t
    }
}

// ── Wires ──────────────────────────────────────────────────────────

/// One shared GPIO line. Reader and writer halves view the same level.
#[derive(Clone, Default)]
pub struct Wire(Rc<Cell<bool>>);

impl Wire {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reader(&self) -> WireIn {
        WireIn(self.clone())
    }

    pub fn writer(&self) -> WireOut {
        WireOut(self.clone())
    }

    pub fn level(&self) -> bool {
        self.0.get()
    }
}

pub struct WireIn(Wire);

impl ErrorType for WireIn {
    type Error = Infallible;
}

impl InputPin for WireIn {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(self.0 .0.get())
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(!self.0 .0.get())
    }
}

pub struct WireOut(Wire);

impl ErrorType for WireOut {
    type Error = Infallible;
}

impl OutputPin for WireOut {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.0 .0.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.0 .0.set(true);
        Ok(())
    }
}

impl StatefulOutputPin for WireOut {
    fn is_set_high(&mut self) -> Result<bool, Infallible> {
        Ok(self.0 .0.get())
    }

    fn is_set_low(&mut self) -> Result<bool, Infallible> {
        Ok(!self.0 .0.get())
    }
}

/// Interrupt pin that hands the installed vector back to the test, so
/// "ISR" firings can be injected at chosen points.
#[derive(Default)]
pub struct TestIrqPin {
    pub isr: Option<Isr>,
    pub edge: Option<Edge>,
    pub pull: Option<Pull>,
}

impl IrqPin for TestIrqPin {
    fn attach_isr(&mut self, edge: Edge, pull: Pull, isr: Isr) {
        self.edge = Some(edge);
        self.pull = Some(pull);
        self.isr = Some(isr);
    }
}
