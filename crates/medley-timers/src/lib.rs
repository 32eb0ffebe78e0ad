//! Cooperative, single-threaded timer scheduling for the Medley event loop.
//!
//! The media server's main loop blocks in its I/O dispatcher, and every time
//! it comes back it pumps this scheduler to run whatever became due: display
//! animation frames, protocol timeouts, deferred work. Two priority levels
//! keep those from starving each other:
//!
//! 1. The **high queue** holds short, latency-critical callbacks (display
//!    animation) and is drained completely on every pump, even when the pump
//!    happens from inside another callback's nested I/O wait.
//! 2. The **normal queue** holds general deferred work and fires at most one
//!    record per pump, so a chain of normal callbacks cannot monopolize the
//!    loop.
//!
//! Timestamps are `u64` nanoseconds from a replaceable [`Clock`]; unit tests
//! drive the scheduler deterministically through a [`ManualClock`]. All
//! state lives on one thread; callbacks may schedule, cancel, and even pump
//! recursively against the scheduler that fired them.
#![forbid(unsafe_code)]

mod clock;
mod queue;
mod record;
mod scheduler;

pub use clock::{Clock, ManualClock, StdClock, NANOS_PER_SEC};
pub use record::{PendingTimer, QueueKind, TargetId, TimerCallback, TimerHandle};
pub use scheduler::{
    PumpCounts, Scheduler, SchedulerConfig, SchedulerError, DEFAULT_NORMAL_QUEUE_CAP,
};
