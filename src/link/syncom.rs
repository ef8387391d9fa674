// Synchronous bit-banged channel between two devices, four GPIOs, no
// hardware assist. Full duplex: every clock edge carries one bit in
// each direction. The protocol is entirely clock-following — the
// initiator drives the first transition, the passive end mirrors, and
// neither side has any bit-time timing requirement.
//
// One background task per link runs the exchange; consumers talk to
// the shared handle. All parties are cooperative tasks on the same
// scheduler, so a RefCell is the whole synchronisation story.
//
// Wire format: characters of BITS_PER_CH bits, LSB first. The zero
// character is reserved — clocked during synchronisation, sent while
// idle, and terminating each message — which is why payload bytes
// must be non-zero (and ASCII on a 7-bit link).

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;

use core::cell::RefCell;
use core::convert::Infallible;

use embedded_hal::digital::{InputPin, OutputPin};
use log::{debug, warn};

use crate::hal::Clock;
use crate::kernel::time::micros_since;
use crate::kernel::{Pid, Poller, Resume, Sched, SchedError, Step, Thread, Waitfor};

use super::LinkError;

/// Reserved in-band character: the sync pattern, the idle filler and
/// the message terminator. Never valid in payload.
pub const SYNC_CH: u8 = 0x00;

/// Default data bits per character. 7 keeps payload ASCII-clean;
/// [`SynCom::with_eight_bit_chars`] widens the wire for binary-safe
/// payloads.
pub const BITS_PER_CH: u8 = 7;

/// Default characters exchanged per cooperative yield once running.
pub const DEFAULT_LATENCY: usize = 5;

/// Peer reset pulse width, seconds.
const RESET_PULSE_SECS: f32 = 0.1;

/// Edge polls before the background task gives the CPU away. A live
/// peer answers within a few polls; an in-process peer needs the
/// yield.
const SPIN_POLLS: u32 = 32;

/// Link synchronisation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// Clocking sync characters, waiting to see one from the peer.
    Unsynced,
    /// Payload may flow.
    Synced,
    /// The liveness timeout expired; restart the link to recover.
    TimedOut,
}

fn pin_high<P: InputPin<Error = Infallible>>(pin: &mut P) -> bool {
    pin.is_high().unwrap_or(false)
}

fn pin_set<P: OutputPin<Error = Infallible>>(pin: &mut P, high: bool) {
    let _ = if high { pin.set_high() } else { pin.set_low() };
}

struct Inner<CI, CO, DI, DO> {
    passive: bool,
    bits_per_ch: u8,
    latency: usize,
    ckin: CI,
    ckout: CO,
    din: DI,
    dout: DO,
    /// Our clock phase; the peer's next edge is due when the incoming
    /// clock matches it (adjusted for role).
    phase: bool,
    link: LinkPhase,
    in_shift: u16,
    bits_in: u8,
    odata: u16,
    bits_out: u8,
    tx: VecDeque<Vec<u8>>,
    tx_cur: Option<(Vec<u8>, usize)>,
    rx: VecDeque<Vec<u8>>,
    rx_cur: Vec<u8>,
    /// 0 disables the liveness timeout.
    timeout_us: u32,
    /// When the last complete character arrived.
    last_ch_us: u32,
    task: Option<Pid>,
}

impl<CI, CO, DI, DO> Inner<CI, CO, DI, DO>
where
    CI: InputPin<Error = Infallible>,
    CO: OutputPin<Error = Infallible>,
    DI: InputPin<Error = Infallible>,
    DO: OutputPin<Error = Infallible>,
{
    /// Line and shift-register state for a fresh synchronisation.
    /// Queued transmissions survive a restart; a half-sent message
    /// does not.
    fn init_lines(&mut self, now: u32) {
        self.link = LinkPhase::Unsynced;
        self.in_shift = 0;
        self.bits_in = 0;
        self.tx_cur = None;
        self.rx_cur.clear();
        self.last_ch_us = now;
        if self.passive {
            self.phase = false;
            self.odata = u16::from(SYNC_CH);
            self.bits_out = self.bits_per_ch;
            pin_set(&mut self.dout, false);
            pin_set(&mut self.ckout, false);
        } else {
            // The initiator commits its first data bit and raises its
            // clock; nothing moves until the passive end answers.
            self.phase = true;
            self.odata = u16::from(SYNC_CH);
            pin_set(&mut self.dout, self.odata & 1 != 0);
            self.odata >>= 1;
            self.bits_out = self.bits_per_ch - 1;
            pin_set(&mut self.ckout, true);
        }
    }

    /// One full-duplex bit, if the peer's edge has arrived. Samples
    /// the incoming data line, then drives our next bit and toggles
    /// our clock.
    fn try_bit(&mut self) -> bool {
        let expect = self.phase != self.passive;
        if pin_high(&mut self.ckin) != expect {
            return false;
        }
        let bit = pin_high(&mut self.din);
        self.in_shift = (self.in_shift | (u16::from(bit) << self.bits_per_ch)) >> 1;
        self.bits_in += 1;
        if self.bits_out == 0 {
            self.odata = u16::from(self.next_out_ch());
            self.bits_out = self.bits_per_ch;
        }
        pin_set(&mut self.dout, self.odata & 1 != 0);
        self.odata >>= 1;
        self.bits_out -= 1;
        self.phase = !self.phase;
        let phase = self.phase;
        pin_set(&mut self.ckout, phase);
        true
    }

    fn take_in_ch(&mut self) -> Option<u8> {
        if self.bits_in < self.bits_per_ch {
            return None;
        }
        let ch = (self.in_shift & ((1u16 << self.bits_per_ch) - 1)) as u8;
        self.in_shift = 0;
        self.bits_in = 0;
        Some(ch)
    }

    /// Next outgoing character. Sync characters until synchronised;
    /// then message bytes, a terminator after each message, and idle
    /// zeros when the queue is dry.
    fn next_out_ch(&mut self) -> u8 {
        if self.link != LinkPhase::Synced {
            return SYNC_CH;
        }
        if self.tx_cur.is_none() {
            if let Some(msg) = self.tx.pop_front() {
                self.tx_cur = Some((msg, 0));
            }
        }
        if let Some((msg, idx)) = self.tx_cur.as_mut() {
            if *idx < msg.len() {
                let ch = msg[*idx];
                *idx += 1;
                return ch;
            }
            // Message exhausted: this character is its terminator;
            // the next call may start the following message.
            self.tx_cur = None;
        }
        SYNC_CH
    }

    fn on_in_ch(&mut self, ch: u8, now: u32) {
        self.last_ch_us = now;
        match self.link {
            LinkPhase::Unsynced => {
                if ch == SYNC_CH {
                    // A complete all-zero character means the peer is
                    // clocking sync. Both ends count bits from the
                    // first exchanged edge, so boundaries agree.
                    self.link = LinkPhase::Synced;
                    self.rx.clear();
                    self.rx_cur.clear();
                }
            }
            LinkPhase::Synced => {
                if ch != SYNC_CH {
                    self.rx_cur.push(ch);
                } else if !self.rx_cur.is_empty() {
                    let msg = core::mem::take(&mut self.rx_cur);
                    self.rx.push_back(msg);
                }
            }
            LinkPhase::TimedOut => {}
        }
    }

    fn drop_lines(&mut self) {
        pin_set(&mut self.dout, false);
        pin_set(&mut self.ckout, false);
    }
}

enum LinkState {
    /// Driving the peer's reset line.
    Pulse,
    /// Release reset (if any), set up the lines, start exchanging.
    Begin,
    Exchange,
}

/// The background task: reset pulse, synchronisation, then the
/// steady-state character exchange with latency batching.
struct LinkTask<CI, CO, DI, DO, RP> {
    inner: Rc<RefCell<Inner<CI, CO, DI, DO>>>,
    clock: Rc<dyn Clock>,
    reset: Option<(RP, bool)>,
    state: LinkState,
    id: &'static str,
}

impl<CI, CO, DI, DO, RP> Thread for LinkTask<CI, CO, DI, DO, RP>
where
    CI: InputPin<Error = Infallible> + 'static,
    CO: OutputPin<Error = Infallible> + 'static,
    DI: InputPin<Error = Infallible> + 'static,
    DO: OutputPin<Error = Infallible> + 'static,
    RP: OutputPin<Error = Infallible> + 'static,
{
    fn step(&mut self, _sched: &mut Sched, _resume: Resume) -> Step {
        match self.state {
            LinkState::Pulse => {
                if let Some((pin, level)) = self.reset.as_mut() {
                    let level = *level;
                    pin_set(pin, level);
                }
                self.state = LinkState::Begin;
                return Step::Yield(Waitfor::Secs(RESET_PULSE_SECS));
            }
            LinkState::Begin => {
                if let Some((mut pin, level)) = self.reset.take() {
                    pin_set(&mut pin, !level);
                }
                let now = self.clock.now_us();
                self.inner.borrow_mut().init_lines(now);
                debug!("syncom {}: awaiting sync", self.id);
                self.state = LinkState::Exchange;
            }
            LinkState::Exchange => {}
        }

        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let mut chars = 0usize;
        let mut spins = 0u32;
        loop {
            if inner.try_bit() {
                spins = 0;
                if let Some(ch) = inner.take_in_ch() {
                    let now = self.clock.now_us();
                    let was_unsynced = inner.link == LinkPhase::Unsynced;
                    inner.on_in_ch(ch, now);
                    if was_unsynced && inner.link == LinkPhase::Synced {
                        debug!("syncom {}: synchronised", self.id);
                    }
                    chars += 1;
                    if chars >= inner.latency {
                        return Step::Yield(Waitfor::Roundrobin);
                    }
                }
            } else {
                spins += 1;
                if spins >= SPIN_POLLS {
                    let now = self.clock.now_us();
                    if inner.timeout_us > 0
                        && micros_since(inner.last_ch_us, now) > inner.timeout_us
                    {
                        warn!("syncom {}: link lost", self.id);
                        inner.drop_lines();
                        inner.link = LinkPhase::TimedOut;
                        inner.task = None;
                        return Step::Done;
                    }
                    return Step::Yield(Waitfor::Roundrobin);
                }
            }
        }
    }
}

/// Reset-pin placeholder for [`SynCom::start`]; never drives anything.
struct NoReset;

impl embedded_hal::digital::ErrorType for NoReset {
    type Error = Infallible;
}

impl OutputPin for NoReset {
    fn set_low(&mut self) -> Result<(), Infallible> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

/// Handle to a synchronous channel. Clone freely; all clones share
/// the queues and the link state.
pub struct SynCom<CI, CO, DI, DO> {
    inner: Rc<RefCell<Inner<CI, CO, DI, DO>>>,
    clock: Rc<dyn Clock>,
}

impl<CI, CO, DI, DO> Clone for SynCom<CI, CO, DI, DO> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<CI, CO, DI, DO> SynCom<CI, CO, DI, DO>
where
    CI: InputPin<Error = Infallible> + 'static,
    CO: OutputPin<Error = Infallible> + 'static,
    DI: InputPin<Error = Infallible> + 'static,
    DO: OutputPin<Error = Infallible> + 'static,
{
    /// A channel over four GPIOs. Exactly one end is `passive`; the
    /// other drives the first clock transition. Nothing moves until
    /// [`start`](SynCom::start).
    pub fn new(
        clock: Rc<dyn Clock>,
        passive: bool,
        ckin: CI,
        ckout: CO,
        din: DI,
        dout: DO,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                passive,
                bits_per_ch: BITS_PER_CH,
                latency: DEFAULT_LATENCY,
                ckin,
                ckout,
                din,
                dout,
                phase: false,
                link: LinkPhase::Unsynced,
                in_shift: 0,
                bits_in: 0,
                odata: 0,
                bits_out: 0,
                tx: VecDeque::new(),
                tx_cur: None,
                rx: VecDeque::new(),
                rx_cur: Vec::new(),
                timeout_us: 0,
                last_ch_us: 0,
                task: None,
            })),
            clock,
        }
    }

    /// Characters exchanged per cooperative yield (min 1). More
    /// throughput, longer holds on the CPU.
    pub fn with_latency(self, latency: usize) -> Self {
        self.inner.borrow_mut().latency = latency.max(1);
        self
    }

    /// Widen characters to 8 bits for binary-safe payloads.
    pub fn with_eight_bit_chars(self) -> Self {
        self.inner.borrow_mut().bits_per_ch = 8;
        self
    }

    /// (Re)start the link: kill a previous background task, reset the
    /// line state and spawn a fresh one. The new task synchronises
    /// from scratch; queued transmissions are preserved.
    pub fn start(&self, sched: &mut Sched) -> Result<Pid, SchedError> {
        self.spawn(sched, None::<(NoReset, bool)>)
    }

    /// As [`start`](SynCom::start), but first hold the peer's reset
    /// line at `reset_level` for 100 ms to reboot it.
    pub fn start_with_reset<RP>(
        &self,
        sched: &mut Sched,
        reset_pin: RP,
        reset_level: bool,
    ) -> Result<Pid, SchedError>
    where
        RP: OutputPin<Error = Infallible> + 'static,
    {
        self.spawn(sched, Some((reset_pin, reset_level)))
    }

    fn spawn<RP>(&self, sched: &mut Sched, reset: Option<(RP, bool)>) -> Result<Pid, SchedError>
    where
        RP: OutputPin<Error = Infallible> + 'static,
    {
        let (old, id, state) = {
            let mut inner = self.inner.borrow_mut();
            let id = if inner.passive { "passive" } else { "initiator" };
            let state = if reset.is_some() {
                LinkState::Pulse
            } else {
                LinkState::Begin
            };
            (inner.task.take(), id, state)
        };
        if let Some(pid) = old {
            let _ = sched.stop(Some(pid));
        }
        let pid = sched.add_thread(LinkTask {
            inner: self.inner.clone(),
            clock: self.clock.clone(),
            reset,
            state,
            id,
        })?;
        self.inner.borrow_mut().task = Some(pid);
        Ok(pid)
    }

    /// Queue a raw string. It must fit the wire alphabet: no NUL, and
    /// ASCII only on a 7-bit link.
    pub fn send_str(&self, s: &str) -> Result<(), LinkError> {
        self.queue_bytes(s.as_bytes())
    }

    /// Oldest fully-received message as a string, or `None`.
    pub fn get_str(&self) -> Option<String> {
        self.inner
            .borrow_mut()
            .rx
            .pop_front()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    /// Number of complete messages [`get_str`](SynCom::get_str) /
    /// [`get`](SynCom::get) will still return.
    pub fn any(&self) -> usize {
        self.inner.borrow().rx.len()
    }

    /// Arm (or with 0, disable) the liveness timeout; returns the
    /// previous value. When no character completes within the window
    /// the link drops to [`LinkPhase::TimedOut`].
    pub fn set_timeout(&self, us: u32) -> u32 {
        let mut inner = self.inner.borrow_mut();
        core::mem::replace(&mut inner.timeout_us, us)
    }

    /// False once the link has timed out (or was never started);
    /// recover with [`start_with_reset`](SynCom::start_with_reset).
    pub fn running(&self) -> bool {
        let inner = self.inner.borrow();
        inner.task.is_some() && inner.link != LinkPhase::TimedOut
    }

    pub fn phase(&self) -> LinkPhase {
        self.inner.borrow().link
    }

    /// Wait descriptor for consumers: wakes with 1 when a message is
    /// queued, 2 when the link has timed out.
    pub fn rx_poller(&self) -> Poller {
        let inner = self.inner.clone();
        Poller::new(move || {
            let inner = inner.borrow();
            if !inner.rx.is_empty() {
                Some(1)
            } else if inner.link == LinkPhase::TimedOut {
                Some(2)
            } else {
                None
            }
        })
    }

    /// Encode and queue a value. The snapshot is taken now, not at
    /// transmission time.
    #[cfg(feature = "serde")]
    pub fn send<T: serde::Serialize>(&self, value: &T) -> Result<(), LinkError> {
        let seven_bit = self.inner.borrow().bits_per_ch == 7;
        let bytes = super::pickle::encode(value, seven_bit)?;
        self.inner.borrow_mut().tx.push_back(bytes);
        Ok(())
    }

    /// Decode the oldest fully-received message. `Ok(None)` when the
    /// queue is empty.
    #[cfg(feature = "serde")]
    pub fn get<T: serde::de::DeserializeOwned>(&self) -> Result<Option<T>, LinkError> {
        let bytes = self.inner.borrow_mut().rx.pop_front();
        match bytes {
            None => Ok(None),
            Some(b) => super::pickle::decode(&b).map(Some),
        }
    }

    fn queue_bytes(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut inner = self.inner.borrow_mut();
        if bytes.contains(&SYNC_CH) {
            return Err(LinkError::Payload);
        }
        if inner.bits_per_ch == 7 && !bytes.is_ascii() {
            return Err(LinkError::Payload);
        }
        inner.tx.push_back(bytes.to_vec());
        Ok(())
    }
}
