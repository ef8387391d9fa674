// Hardware seams — everything the kernel and link need from the target,
// behind traits so the core stays board-independent.
//
// Only pin assignments, the timer peripheral and ISR wiring (in the
// firmware crate) are board-specific.

use core::sync::atomic::{AtomicU32, Ordering};

use embedded_hal::digital::StatefulOutputPin;

/// Monotonic microsecond counter.
///
/// Wraps at 2^32 µs (~71.6 minutes). All deadline arithmetic in the
/// kernel goes through [`crate::kernel::time`]; nothing else may read
/// hardware time directly.
pub trait Clock {
    fn now_us(&self) -> u32;
}

/// Interrupt edge selection for [`IrqPin::attach_isr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
    Any,
}

/// Input pull configuration for [`IrqPin::attach_isr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    None,
    Up,
    Down,
}

// ── ISR-side counter ───────────────────────────────────────────────

/// Event counter shared between an ISR and the scheduler.
///
/// The ISR side calls [`fire`](IrqCounter::fire); the scheduler
/// snapshots and clears with [`take`](IrqCounter::take) once per
/// dispatch cycle. The compound read-clear runs inside a critical
/// section so it stays correct on cores without atomic RMW.
///
/// `const fn new` so counters can live in statics next to the ISR
/// that feeds them.
#[derive(Debug)]
pub struct IrqCounter(AtomicU32);

impl IrqCounter {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Called from interrupt context. Must not allocate or block.
    #[inline]
    pub fn fire(&self) {
        critical_section::with(|_| {
            let n = self.0.load(Ordering::Relaxed);
            self.0.store(n.wrapping_add(1), Ordering::Relaxed);
        });
    }

    /// Snapshot the count and reset it to zero.
    pub fn take(&self) -> u32 {
        critical_section::with(|_| {
            let n = self.0.load(Ordering::Relaxed);
            if n != 0 {
                self.0.store(0, Ordering::Relaxed);
            }
            n
        })
    }

    /// Read without clearing.
    pub fn peek(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for IrqCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// What a pin interrupt handler must do: bump the counter, then run the
/// optional user callback. The callback executes in interrupt context —
/// bounded time, no allocation, only state it documents as ISR-safe.
#[derive(Clone, Copy)]
pub struct Isr {
    counter: &'static IrqCounter,
    user_cb: Option<fn(u8)>,
}

impl Isr {
    pub const fn new(counter: &'static IrqCounter, user_cb: Option<fn(u8)>) -> Self {
        Self { counter, user_cb }
    }

    /// Entry point for the hardware vector.
    #[inline]
    pub fn fire(&self, irq_id: u8) {
        self.counter.fire();
        if let Some(cb) = self.user_cb {
            cb(irq_id);
        }
    }
}

/// External-interrupt capable pin.
///
/// Implementations configure the pin for the given edge and pull and
/// arrange for `isr.fire(irq_id)` to run on each event. This is the only
/// preemptive path in the system.
pub trait IrqPin {
    fn attach_isr(&mut self, edge: Edge, pull: Pull, isr: Isr);
}

// ── Indicator LED ──────────────────────────────────────────────────

/// Heartbeat indicator. Errors are swallowed — a status LED that fails
/// to toggle must not take the scheduler down.
pub trait Led {
    fn toggle(&mut self);
}

/// Adapter from any stateful output pin.
pub struct PinLed<P>(P);

impl<P> PinLed<P>
where
    P: StatefulOutputPin,
{
    pub fn new(pin: P) -> Self {
        Self(pin)
    }
}

impl<P> Led for PinLed<P>
where
    P: StatefulOutputPin,
{
    fn toggle(&mut self) {
        let _ = self.0.toggle();
    }
}
