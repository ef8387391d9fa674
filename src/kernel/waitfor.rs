// Wait descriptors — the values a task surrenders at each suspension
// point. Each one tells the scheduler why the task is blocked and what
// to evaluate to wake it.

use alloc::rc::Rc;

use core::fmt;

use crate::hal::{Edge, IrqCounter, IrqPin, Isr, Pull};

use super::time::{secs_to_us, MAX_DELAY_US};
use super::SchedError;

/// Scheduling tuple: the priority key at dispatch time and the payload
/// delivered back at the suspension point that caused the wait.
///
/// Ordering is lexicographic — interrupt hits outrank poll strength,
/// which outranks lateness. An all-zero tuple is the round-robin tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Trigger {
    /// ISR increments consumed since the task last ran.
    pub pin_hits: u32,
    /// Non-zero poll callback return, if that is what woke the task.
    pub poll: i32,
    /// Microseconds past the deadline, for timed wakes.
    pub overdue_us: u32,
}

impl Trigger {
    pub(crate) const ROUNDROBIN: Trigger = Trigger {
        pin_hits: 0,
        poll: 0,
        overdue_us: 0,
    };
}

/// Resume payload. `None` exactly once: the first time a task runs.
pub type Resume = Option<Trigger>;

/// Poll callback. Must be cheap and side-effect-light — it runs on
/// every dispatch cycle while its task is pending, so its cost directly
/// bounds scheduler throughput. `None` means "no event"; any non-zero
/// value wakes the task with that strength.
pub type PollFn = Rc<dyn Fn() -> Option<i32>>;

/// Fixed delay. Armed (deadline = now + delay) when the scheduler
/// records it, so yielding the same value again restarts the full
/// interval from the later yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    delay_us: u32,
}

impl Timeout {
    /// Rejects non-finite, negative and over-cap delays with
    /// [`SchedError::TimeRange`].
    pub fn new(secs: f32) -> Result<Self, SchedError> {
        let delay_us = secs_to_us(secs).ok_or(SchedError::TimeRange)?;
        Ok(Self { delay_us })
    }

    pub fn from_us(delay_us: u32) -> Result<Self, SchedError> {
        if delay_us > MAX_DELAY_US {
            return Err(SchedError::TimeRange);
        }
        Ok(Self { delay_us })
    }

    pub(crate) fn delay_us(&self) -> u32 {
        self.delay_us
    }
}

/// Wake when a callback reports an event, or on timeout.
#[derive(Clone)]
pub struct Poller {
    func: PollFn,
    delay_us: Option<u32>,
}

impl Poller {
    pub fn new(func: impl Fn() -> Option<i32> + 'static) -> Self {
        Self {
            func: Rc::new(func),
            delay_us: None,
        }
    }

    pub fn with_timeout(
        func: impl Fn() -> Option<i32> + 'static,
        secs: f32,
    ) -> Result<Self, SchedError> {
        let delay_us = secs_to_us(secs).ok_or(SchedError::TimeRange)?;
        Ok(Self {
            func: Rc::new(func),
            delay_us: Some(delay_us),
        })
    }

    /// Share an existing callback. Cloning a `Poller` is a refcount
    /// bump, so a task can re-yield the same one every pass.
    pub fn shared(func: PollFn) -> Self {
        Self {
            func,
            delay_us: None,
        }
    }

    pub(crate) fn poll(&self) -> Option<i32> {
        (self.func)()
    }

    pub(crate) fn delay_us(&self) -> Option<u32> {
        self.delay_us
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("delay_us", &self.delay_us)
            .finish_non_exhaustive()
    }
}

/// Wake on a pin interrupt, or on timeout.
///
/// Construction installs the ISR through the [`IrqPin`] seam: on each
/// event the handler bumps `counter` and then runs `user_cb` in
/// interrupt context. The scheduler snapshots and clears the counter
/// each dispatch cycle; a non-zero snapshot wakes the owning task with
/// strength equal to the count.
#[derive(Debug, Clone, Copy)]
pub struct Pinblock {
    counter: &'static IrqCounter,
    delay_us: Option<u32>,
}

impl Pinblock {
    pub fn new(
        pin: &mut impl IrqPin,
        edge: Edge,
        pull: Pull,
        counter: &'static IrqCounter,
        user_cb: Option<fn(u8)>,
    ) -> Self {
        pin.attach_isr(edge, pull, Isr::new(counter, user_cb));
        Self {
            counter,
            delay_us: None,
        }
    }

    pub fn with_timeout(
        pin: &mut impl IrqPin,
        edge: Edge,
        pull: Pull,
        counter: &'static IrqCounter,
        user_cb: Option<fn(u8)>,
        secs: f32,
    ) -> Result<Self, SchedError> {
        let delay_us = secs_to_us(secs).ok_or(SchedError::TimeRange)?;
        let mut pb = Self::new(pin, edge, pull, counter, user_cb);
        pb.delay_us = Some(delay_us);
        Ok(pb)
    }

    pub(crate) fn counter(&self) -> &'static IrqCounter {
        self.counter
    }

    pub(crate) fn delay_us(&self) -> Option<u32> {
        self.delay_us
    }
}

/// What a task is waiting for.
#[derive(Debug, Clone)]
pub enum Waitfor {
    /// Run again once every other pending round-robin task has had a
    /// turn.
    Roundrobin,
    /// Shorthand for a timed wait, taken straight from a yield without
    /// going through [`Timeout::new`]. Validated when the scheduler
    /// records it; out-of-range values terminate the task with
    /// [`SchedError::BadYield`].
    Secs(f32),
    Timeout(Timeout),
    Poller(Poller),
    Pinblock(Pinblock),
}

impl From<Timeout> for Waitfor {
    fn from(t: Timeout) -> Self {
        Waitfor::Timeout(t)
    }
}

impl From<Poller> for Waitfor {
    fn from(p: Poller) -> Self {
        Waitfor::Poller(p)
    }
}

impl From<Pinblock> for Waitfor {
    fn from(p: Pinblock) -> Self {
        Waitfor::Pinblock(p)
    }
}

impl From<f32> for Waitfor {
    fn from(secs: f32) -> Self {
        Waitfor::Secs(secs)
    }
}

// ── Long sleeps ────────────────────────────────────────────────────

/// Composition of bounded sub-sleeps covering an interval of any
/// length — the escape hatch past [`MAXSECS`](super::time::MAXSECS).
///
/// Drive it from a task loop: yield every descriptor [`next`]
/// produces, feeding each resume payload back in. When `next` returns
/// `None` the full interval has elapsed (total wall time ≥ requested,
/// bounded above only by other tasks' cooperation) and
/// [`overshoot_us`] holds the accumulated lateness.
///
/// [`next`]: LongDelay::next
/// [`overshoot_us`]: LongDelay::overshoot_us
pub struct LongDelay {
    remaining_us: u64,
    last_chunk_us: u32,
    overshoot_us: u64,
}

impl LongDelay {
    pub fn new(secs: f64) -> Result<Self, SchedError> {
        if !secs.is_finite() || secs <= 0.0 {
            return Err(SchedError::TimeRange);
        }
        Ok(Self {
            remaining_us: (secs * 1_000_000.0) as u64,
            last_chunk_us: 0,
            overshoot_us: 0,
        })
    }

    /// The next sub-sleep, or `None` when the interval is covered.
    pub fn next(&mut self, resume: Resume) -> Option<Waitfor> {
        if let Some(trig) = resume {
            self.overshoot_us += u64::from(trig.overdue_us);
        }
        self.remaining_us = self.remaining_us.saturating_sub(u64::from(self.last_chunk_us));
        if self.remaining_us == 0 {
            return None;
        }
        let chunk = self.remaining_us.min(u64::from(MAX_DELAY_US)) as u32;
        self.last_chunk_us = chunk;
        Some(Waitfor::Timeout(Timeout { delay_us: chunk }))
    }

    /// Total microseconds the sub-sleeps overshot their deadlines.
    pub fn overshoot_us(&self) -> u64 {
        self.overshoot_us
    }
}

#[cfg(test)]
mod tests {
    use super::super::time::MAXSECS;
    use super::*;

    #[test]
    fn trigger_order_is_lexicographic() {
        let pin = Trigger {
            pin_hits: 1,
            poll: 0,
            overdue_us: 0,
        };
        let poll = Trigger {
            pin_hits: 0,
            poll: 1_000,
            overdue_us: 0,
        };
        let late = Trigger {
            pin_hits: 0,
            poll: 0,
            overdue_us: 1_000_000,
        };
        assert!(pin > poll && poll > late);
        assert!(late > Trigger::ROUNDROBIN);
        // A negative poll strength ranks below a timed wake.
        let neg = Trigger {
            pin_hits: 0,
            poll: -5,
            overdue_us: 0,
        };
        assert!(late > neg);
    }

    #[test]
    fn timeout_rejects_out_of_range() {
        assert!(Timeout::new(0.5).is_ok());
        assert!(Timeout::new(MAXSECS as f32).is_ok());
        assert_eq!(Timeout::new(537.0), Err(SchedError::TimeRange));
        assert_eq!(Timeout::new(-0.1), Err(SchedError::TimeRange));
        assert_eq!(Timeout::new(f32::INFINITY), Err(SchedError::TimeRange));
        assert!(Timeout::from_us(MAX_DELAY_US).is_ok());
        assert!(Timeout::from_us(MAX_DELAY_US + 1).is_err());
    }

    #[test]
    fn poller_with_timeout_validates_range() {
        let ok = Poller::with_timeout(|| None, 0.5);
        assert!(ok.is_ok());
        assert_eq!(ok.unwrap().delay_us(), Some(500_000));
        assert!(Poller::new(|| None).delay_us().is_none());
        assert!(matches!(
            Poller::with_timeout(|| None, 537.0),
            Err(SchedError::TimeRange)
        ));
        assert!(matches!(
            Poller::with_timeout(|| None, -0.5),
            Err(SchedError::TimeRange)
        ));
    }

    #[test]
    fn shared_poller_reuses_one_callback() {
        let func: PollFn = Rc::new(|| Some(7));
        let p = Poller::shared(func.clone());
        let q = p.clone();
        // One callback behind every clone; cloning never reallocates.
        assert_eq!(Rc::strong_count(&func), 3);
        assert_eq!(p.poll(), Some(7));
        assert_eq!(q.poll(), Some(7));
        assert!(q.delay_us().is_none());
    }

    struct NullIrqPin;

    impl IrqPin for NullIrqPin {
        fn attach_isr(&mut self, _edge: Edge, _pull: Pull, _isr: Isr) {}
    }

    #[test]
    fn pinblock_with_timeout_validates_range() {
        static QUIET: IrqCounter = IrqCounter::new();
        let pb = Pinblock::with_timeout(
            &mut NullIrqPin,
            Edge::Rising,
            Pull::Up,
            &QUIET,
            None,
            0.03,
        );
        assert!(pb.is_ok());
        assert_eq!(pb.unwrap().delay_us(), Some(30_000));
        assert!(matches!(
            Pinblock::with_timeout(&mut NullIrqPin, Edge::Any, Pull::None, &QUIET, None, 600.0),
            Err(SchedError::TimeRange)
        ));
    }

    #[test]
    fn long_delay_chunks_cover_interval() {
        // 1200 s splits into 2 × 536.9 s + remainder.
        let mut ld = LongDelay::new(1_200.0).unwrap();
        let mut total: u64 = 0;
        let mut resume: Resume = None;
        let mut chunks = 0;
        while let Some(w) = ld.next(resume) {
            let Waitfor::Timeout(t) = w else {
                panic!("LongDelay must emit timeouts")
            };
            assert!(t.delay_us() <= MAX_DELAY_US);
            total += u64::from(t.delay_us());
            resume = Some(Trigger {
                pin_hits: 0,
                poll: 0,
                overdue_us: 7,
            });
            chunks += 1;
        }
        assert_eq!(total, 1_200_000_000);
        assert_eq!(chunks, 3);
        assert_eq!(ld.overshoot_us(), 3 * 7);
    }

    #[test]
    fn long_delay_rejects_non_positive() {
        assert!(LongDelay::new(0.0).is_err());
        assert!(LongDelay::new(-3.0).is_err());
        assert!(LongDelay::new(f64::NAN).is_err());
    }
}
