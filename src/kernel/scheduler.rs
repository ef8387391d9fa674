// Cooperative microthread scheduler.
//
// One execution context, no preemption. Tasks run from suspension
// point to suspension point; the scheduler owns every task from
// `add_thread` until it terminates and decides execution order from
// the trigger tuples of the tasks' wait descriptors.
//
// Dispatch order per cycle: highest trigger tuple wins (interrupt hits,
// then poll strength, then lateness; ties to the lower pid). The
// round-robin tier runs only when no trigger is pending, in strict
// rotation. A saturated higher tier can starve the tiers below it —
// that is the contract, not an accident.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;

use log::{debug, error, trace};

use crate::hal::{Clock, Led};

use super::task::{Pid, Status, Step, Thread};
use super::time::{micros_since, overdue};
use super::waitfor::{Resume, Timeout, Trigger, Waitfor};
use super::SchedError;

/// Minimum interval between idle heap-compaction passes.
pub const GC_INTERVAL_US: u32 = 50_000;

/// Heartbeat LED toggle cadence.
pub const HEARTBEAT_US: u32 = 500_000;

struct Slot {
    pid: Pid,
    /// `None` while the task is being stepped (its slot is vacated) or
    /// after it has been stopped.
    body: Option<Box<dyn Thread>>,
    wait: Waitfor,
    /// Absolute expiry of the current descriptor's timeout, if any.
    deadline: Option<u32>,
    /// ISR increments accumulated while the task waited its turn.
    pin_hits: u32,
    paused: bool,
    /// Tombstone; swept at the top of each dispatch cycle.
    killed: bool,
    /// Rotation rank: when this task last took a round-robin turn.
    last_rr: u64,
}

/// The scheduler. One instance per process; everything it touches is
/// process-local and single-threaded.
pub struct Sched {
    clock: Rc<dyn Clock>,
    slots: Vec<Slot>,
    next_pid: u32,
    rr_seq: u64,
    in_run: bool,
    stop_all: bool,
    gc_hook: Option<Box<dyn FnMut()>>,
    last_gc: Option<u32>,
    heartbeat: Option<Box<dyn Led>>,
    last_beat: Option<u32>,
}

impl Sched {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            slots: Vec::new(),
            next_pid: 1,
            rr_seq: 1,
            in_run: false,
            stop_all: false,
            gc_hook: None,
            last_gc: None,
            heartbeat: None,
            last_beat: None,
        }
    }

    /// Idle-time heap compaction. The hook runs at most every
    /// [`GC_INTERVAL_US`], and only when no task outside the
    /// round-robin tier is ready, so it never delays real work.
    pub fn set_gc_hook(&mut self, hook: Box<dyn FnMut()>) {
        self.gc_hook = Some(hook);
    }

    /// Indicator LED toggled on a [`HEARTBEAT_US`] cadence while the
    /// scheduler runs.
    pub fn set_heartbeat(&mut self, led: Box<dyn Led>) {
        self.heartbeat = Some(led);
    }

    /// The scheduler's time source.
    pub fn clock(&self) -> Rc<dyn Clock> {
        self.clock.clone()
    }

    /// Current microsecond counter reading.
    pub fn now_us(&self) -> u32 {
        self.clock.now_us()
    }

    /// Install a task and immediately drive it to its first suspension
    /// point, so initialisation code runs in `add_thread` call order.
    ///
    /// May be called before `run` or from another task's step; the new
    /// task competes from the next dispatch cycle. A body that
    /// completes without yielding is reported as
    /// [`SchedError::BadThread`].
    pub fn add_thread(&mut self, body: impl Thread + 'static) -> Result<Pid, SchedError> {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        self.slots.push(Slot {
            pid,
            body: None,
            wait: Waitfor::Roundrobin,
            deadline: None,
            pin_hits: 0,
            paused: false,
            killed: false,
            last_rr: 0,
        });
        let mut body: Box<dyn Thread> = Box::new(body);
        match body.step(self, None) {
            Step::Done => {
                debug!("{pid} completed before its first yield");
                self.drop_slot(pid);
                Err(SchedError::BadThread)
            }
            Step::Yield(w) => {
                if self.live_index(pid).is_none() {
                    // Stopped itself during its own first step.
                    return Ok(pid);
                }
                match self.record_wait(pid, w) {
                    Ok(()) => {
                        if let Some(i) = self.live_index(pid) {
                            self.slots[i].body = Some(body);
                        }
                        trace!("{pid} added");
                        Ok(pid)
                    }
                    Err(e) => {
                        self.drop_slot(pid);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Run the dispatch loop until every task has terminated or
    /// [`stop`](Sched::stop) is called with no pid.
    pub fn run(&mut self) -> Result<(), SchedError> {
        if self.in_run {
            return Err(SchedError::Reentrant);
        }
        self.in_run = true;
        debug!("scheduler start, {} tasks", self.slots.len());
        self.maybe_gc();
        while !self.stop_all {
            self.slots.retain(|s| !s.killed);
            if self.slots.is_empty() {
                break;
            }
            let now = self.clock.now_us();
            self.heartbeat_tick(now);
            if let Some((i, trig)) = self.pick_priority(now) {
                self.dispatch(i, Some(trig));
            } else if let Some(i) = self.pick_roundrobin() {
                self.slots[i].last_rr = self.rr_seq;
                self.rr_seq += 1;
                self.dispatch(i, Some(Trigger::ROUNDROBIN));
                self.maybe_gc();
            } else {
                // Everything is blocked on time or events.
                self.maybe_gc();
            }
        }
        self.slots.retain(|s| !s.killed);
        self.in_run = false;
        self.stop_all = false;
        debug!("scheduler stop, {} tasks remain", self.slots.len());
        Ok(())
    }

    /// Make a task ineligible for selection until
    /// [`resume`](Sched::resume). A task may pause itself; the effect
    /// takes hold at its next suspension.
    pub fn pause(&mut self, pid: Pid) -> Result<(), SchedError> {
        let slot = self.live_slot_mut(pid).ok_or(SchedError::TaskGone)?;
        slot.paused = true;
        Ok(())
    }

    /// Restore a paused task; it keeps the wait descriptor it had.
    pub fn resume(&mut self, pid: Pid) -> Result<(), SchedError> {
        let slot = self.live_slot_mut(pid).ok_or(SchedError::TaskGone)?;
        slot.paused = false;
        Ok(())
    }

    /// With a pid: terminate that task, dropping its resumable state —
    /// it is never resumed again. With `None`: stop the scheduler
    /// itself; the current task finishes its step and `run` returns.
    pub fn stop(&mut self, pid: Option<Pid>) -> Result<(), SchedError> {
        match pid {
            None => {
                debug!("scheduler stop requested");
                self.stop_all = true;
                Ok(())
            }
            Some(pid) => {
                let slot = self.live_slot_mut(pid).ok_or(SchedError::TaskGone)?;
                slot.killed = true;
                slot.body = None;
                debug!("{pid} stopped");
                Ok(())
            }
        }
    }

    pub fn status(&self, pid: Pid) -> Status {
        match self.slots.iter().find(|s| s.pid == pid && !s.killed) {
            None => Status::Terminated,
            Some(s) if s.paused => Status::Paused,
            Some(_) => Status::Running,
        }
    }

    /// Live tasks (running or paused).
    pub fn task_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.killed).count()
    }

    // ── Dispatch internals ─────────────────────────────────────────

    /// Highest non-zero trigger, ties to the lower pid. Also rolls
    /// pending ISR counts into their tasks' caches, so hits survive
    /// losing a cycle.
    fn pick_priority(&mut self, now: u32) -> Option<(usize, Trigger)> {
        let mut best: Option<(usize, Trigger)> = None;
        for i in 0..self.slots.len() {
            if self.slots[i].paused || self.slots[i].killed {
                continue;
            }
            if let Some(t) = self.eval(i, now) {
                // Strict comparison keeps the earliest (lowest-pid)
                // slot on ties.
                if best.map_or(true, |(_, bt)| t > bt) {
                    best = Some((i, t));
                }
            }
        }
        best
    }

    fn eval(&mut self, i: usize, now: u32) -> Option<Trigger> {
        let slot = &mut self.slots[i];
        let deadline = slot.deadline;
        let timed = |dl: Option<u32>| -> Option<Trigger> {
            let od = overdue(dl?, now);
            (od > 0).then_some(Trigger {
                pin_hits: 0,
                poll: 0,
                overdue_us: od,
            })
        };
        match &slot.wait {
            Waitfor::Roundrobin | Waitfor::Secs(_) => None,
            Waitfor::Timeout(_) => timed(deadline),
            Waitfor::Poller(p) => match p.poll() {
                Some(r) if r != 0 => Some(Trigger {
                    pin_hits: 0,
                    poll: r,
                    overdue_us: 0,
                }),
                _ => timed(deadline),
            },
            Waitfor::Pinblock(pb) => {
                slot.pin_hits += pb.counter().take();
                if slot.pin_hits > 0 {
                    Some(Trigger {
                        pin_hits: slot.pin_hits,
                        poll: 0,
                        overdue_us: 0,
                    })
                } else {
                    timed(deadline)
                }
            }
        }
    }

    /// Strict rotation: the round-robin task serviced longest ago runs
    /// next; ties go to the lower pid.
    fn pick_roundrobin(&self) -> Option<usize> {
        let mut best: Option<(u64, u32, usize)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.paused || slot.killed || !matches!(slot.wait, Waitfor::Roundrobin) {
                continue;
            }
            let key = (slot.last_rr, slot.pid.0);
            if best.map_or(true, |(lr, p, _)| key < (lr, p)) {
                best = Some((key.0, key.1, i));
            }
        }
        best.map(|(_, _, i)| i)
    }

    fn dispatch(&mut self, i: usize, resume: Resume) {
        let pid = self.slots[i].pid;
        let Some(mut body) = self.slots[i].body.take() else {
            return;
        };
        // The delivered trigger consumes the cached hits.
        self.slots[i].pin_hits = 0;
        let step = body.step(self, resume);
        if self.live_index(pid).is_none() {
            trace!("{pid} stopped during its own step");
            return;
        }
        match step {
            Step::Done => {
                debug!("{pid} finished");
                self.drop_slot(pid);
            }
            Step::Yield(w) => match self.record_wait(pid, w) {
                Ok(()) => {
                    if let Some(j) = self.live_index(pid) {
                        self.slots[j].body = Some(body);
                    }
                }
                Err(_) => {
                    error!("{pid} yielded an invalid wait descriptor; task terminated");
                    self.drop_slot(pid);
                }
            },
        }
    }

    /// Store the descriptor a task surrendered and arm its timeout.
    /// Re-yielding the same `Timeout` restarts its full delay here.
    fn record_wait(&mut self, pid: Pid, w: Waitfor) -> Result<(), SchedError> {
        let now = self.clock.now_us();
        let Some(i) = self.live_index(pid) else {
            return Ok(());
        };
        let slot = &mut self.slots[i];
        match w {
            Waitfor::Roundrobin => {
                slot.deadline = None;
                slot.wait = Waitfor::Roundrobin;
            }
            Waitfor::Secs(s) => {
                // The unchecked shorthand: out-of-range values are a
                // programming error in the task, not the scheduler.
                let us = super::time::secs_to_us(s).ok_or(SchedError::BadYield)?;
                slot.deadline = Some(now.wrapping_add(us));
                slot.wait =
                    Waitfor::Timeout(Timeout::from_us(us).map_err(|_| SchedError::BadYield)?);
            }
            Waitfor::Timeout(t) => {
                slot.deadline = Some(now.wrapping_add(t.delay_us()));
                slot.wait = Waitfor::Timeout(t);
            }
            Waitfor::Poller(p) => {
                slot.deadline = p.delay_us().map(|d| now.wrapping_add(d));
                slot.wait = Waitfor::Poller(p);
            }
            Waitfor::Pinblock(pb) => {
                slot.deadline = pb.delay_us().map(|d| now.wrapping_add(d));
                slot.wait = Waitfor::Pinblock(pb);
            }
        }
        Ok(())
    }

    fn maybe_gc(&mut self) {
        if self.gc_hook.is_none() {
            return;
        }
        let now = self.clock.now_us();
        let due = self
            .last_gc
            .map_or(true, |t| micros_since(t, now) > GC_INTERVAL_US);
        if due {
            trace!("idle compaction pass");
            if let Some(hook) = self.gc_hook.as_mut() {
                hook();
            }
            self.last_gc = Some(self.clock.now_us());
        }
    }

    fn heartbeat_tick(&mut self, now: u32) {
        let due = self
            .last_beat
            .map_or(true, |t| micros_since(t, now) >= HEARTBEAT_US);
        if due {
            if let Some(led) = self.heartbeat.as_mut() {
                led.toggle();
                self.last_beat = Some(now);
            }
        }
    }

    fn live_index(&self, pid: Pid) -> Option<usize> {
        self.slots.iter().position(|s| s.pid == pid && !s.killed)
    }

    fn live_slot_mut(&mut self, pid: Pid) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.pid == pid && !s.killed)
    }

    fn drop_slot(&mut self, pid: Pid) {
        if let Some(i) = self.live_index(pid) {
            self.slots[i].killed = true;
            self.slots[i].body = None;
        }
    }
}
