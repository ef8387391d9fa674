// Kernel — the cooperative microthread runtime.
//
//   • `time`      — wrap-aware microsecond arithmetic and the delay cap
//   • `waitfor`   — descriptors a task suspends on, and the trigger
//                   tuple delivered back at resumption
//   • `task`      — task identity and the resumable-computation trait
//   • `scheduler` — the dispatch loop and task lifecycle

use core::fmt;

pub mod scheduler;
pub mod task;
pub mod time;
pub mod waitfor;

pub use scheduler::{Sched, GC_INTERVAL_US, HEARTBEAT_US};
pub use task::{Pid, Status, Step, Thread};
pub use time::{MAXSECS, MAX_DELAY_US};
pub use waitfor::{LongDelay, Pinblock, PollFn, Poller, Resume, Timeout, Trigger, Waitfor};

/// Scheduler-level failures. All data-shaped; none of them unwinds,
/// and none of them (except the caller seeing the error) affects the
/// remaining tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// A requested delay exceeds [`MAXSECS`].
    TimeRange,
    /// A task body ran to completion before its first suspension.
    BadThread,
    /// `pause`/`resume`/`stop` targeted a terminated task.
    TaskGone,
    /// `run` invoked while the scheduler is already running.
    Reentrant,
    /// A task surrendered something that is not a valid wait
    /// descriptor; the offending task is terminated.
    BadYield,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::TimeRange => write!(f, "delay exceeds {MAXSECS} s"),
            SchedError::BadThread => write!(f, "task completed before its first yield"),
            SchedError::TaskGone => write!(f, "task already terminated"),
            SchedError::Reentrant => write!(f, "scheduler is already running"),
            SchedError::BadYield => write!(f, "invalid wait descriptor yielded"),
        }
    }
}
