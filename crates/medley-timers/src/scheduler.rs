use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::queue::TimerQueue;
use crate::record::{PendingTimer, QueueKind, TargetId, TimerCallback, TimerHandle, TimerRecord};

/// Default bound on pending normal-queue records.
///
/// A normal queue this deep means some caller is leaking timers, so the host
/// treats the resulting [`SchedulerError::QueueOverflow`] as fatal.
pub const DEFAULT_NORMAL_QUEUE_CAP: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Pending-record bound for the normal queue.
    pub normal_queue_cap: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            normal_queue_cap: DEFAULT_NORMAL_QUEUE_CAP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("normal timer queue is full ({cap} pending records)")]
    QueueOverflow { cap: usize },
}

/// What one [`Scheduler::pump`] call executed.
///
/// `high_fired > 0` implies `normal_fired == 0`: the pump returns to the
/// event loop as soon as any high-priority records ran, so the host can
/// service I/O before normal work proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PumpCounts {
    pub high_fired: usize,
    pub normal_fired: usize,
}

/// Clears a queue's `running` flag when dropped, so a panicking callback
/// cannot leave the queue permanently unpumpable.
struct RunningGuard<'a> {
    flag: &'a Cell<bool>,
}

impl<'a> RunningGuard<'a> {
    /// Sets `flag`, or returns `None` if it was already set.
    fn acquire(flag: &'a Cell<bool>) -> Option<Self> {
        if flag.get() {
            return None;
        }
        flag.set(true);
        Some(Self { flag })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

/// Cooperative dual-priority timer scheduler.
///
/// Single-threaded by construction: every operation, including callback
/// invocation, happens on the event-loop thread, and interior mutability
/// (rather than locks) lets callbacks schedule and cancel against the
/// scheduler that is currently firing them.
///
/// `A` is the captured-argument payload handed to callbacks by value on
/// fire; `R` is the callback return type, surfaced by
/// [`Scheduler::fire_one_matching`].
pub struct Scheduler<A, R = ()> {
    clock: Rc<dyn Clock>,
    high: TimerQueue<A, R>,
    normal: TimerQueue<A, R>,
    normal_queue_cap: usize,
    next_handle: Cell<u64>,
    between_pass_hook: RefCell<Option<Box<dyn FnMut()>>>,
}

impl<A, R> Scheduler<A, R> {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self::with_config(clock, SchedulerConfig::default())
    }

    pub fn with_config(clock: Rc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self {
            clock,
            high: TimerQueue::new("high"),
            normal: TimerQueue::new("normal"),
            normal_queue_cap: config.normal_queue_cap,
            next_handle: Cell::new(0),
            between_pass_hook: RefCell::new(None),
        }
    }

    /// Schedules a deferred-work timer in the normal queue.
    ///
    /// Fails with [`SchedulerError::QueueOverflow`] when the queue already
    /// holds its configured cap of pending records.
    pub fn schedule_normal(
        &self,
        target: TargetId,
        fire_at_ns: u64,
        callback: TimerCallback<A, R>,
        args: A,
    ) -> Result<TimerHandle, SchedulerError> {
        if self.normal.len() >= self.normal_queue_cap {
            return Err(SchedulerError::QueueOverflow {
                cap: self.normal_queue_cap,
            });
        }
        let handle = TimerHandle::next(&self.next_handle);
        self.insert(&self.normal, handle, target, fire_at_ns, callback, args);
        Ok(handle)
    }

    /// Schedules a latency-critical timer in the high queue (animation
    /// frames and the like). The high queue is not capped.
    pub fn schedule_high(
        &self,
        target: TargetId,
        fire_at_ns: u64,
        callback: TimerCallback<A, R>,
        args: A,
    ) -> TimerHandle {
        let handle = TimerHandle::next(&self.next_handle);
        self.insert(&self.high, handle, target, fire_at_ns, callback, args);
        handle
    }

    fn insert(
        &self,
        queue: &TimerQueue<A, R>,
        handle: TimerHandle,
        target: TargetId,
        fire_at_ns: u64,
        callback: TimerCallback<A, R>,
        args: A,
    ) {
        let now_ns = self.clock.now_ns();
        if fire_at_ns < now_ns {
            debug!(
                queue = queue.name(),
                handle = handle.as_u64(),
                fire_at_ns,
                now_ns,
                "timer scheduled in the past"
            );
        }
        queue.insert(TimerRecord {
            handle,
            target,
            fire_at_ns,
            callback,
            args,
        });
    }

    /// Removes every pending timer whose target and callback both match.
    /// Returns the number removed; [`TargetId::NONE`] matches nothing.
    pub fn cancel_matching(&self, target: TargetId, callback: TimerCallback<A, R>) -> usize {
        if target.is_none() {
            return 0;
        }
        self.high
            .remove_where(|r| r.target == target && r.callback == callback)
            + self
                .normal
                .remove_where(|r| r.target == target && r.callback == callback)
    }

    /// Like [`Scheduler::cancel_matching`] but removes at most one record,
    /// searching the high queue first. For callers that know the timer is
    /// unique. Returns whether one was removed.
    pub fn cancel_one_matching(&self, target: TargetId, callback: TimerCallback<A, R>) -> bool {
        if target.is_none() {
            return false;
        }
        self.high
            .take_first_where(|r| r.target == target && r.callback == callback)
            .or_else(|| {
                self.normal
                    .take_first_where(|r| r.target == target && r.callback == callback)
            })
            .is_some()
    }

    /// Removes every pending timer for `target`, whatever its callback.
    /// Used when a client/session goes away. Returns the number removed.
    pub fn cancel_by_target(&self, target: TargetId) -> usize {
        if target.is_none() {
            return 0;
        }
        self.high.remove_where(|r| r.target == target)
            + self.normal.remove_where(|r| r.target == target)
    }

    /// Cancels exactly the record named by `handle`, searching both queues.
    /// Returns whether it was found; a miss is logged since it usually means
    /// a double cancel.
    pub fn cancel_specific(&self, handle: TimerHandle) -> bool {
        let found = self
            .high
            .take_first_where(|r| r.handle == handle)
            .or_else(|| self.normal.take_first_where(|r| r.handle == handle))
            .is_some();
        if !found {
            warn!(
                handle = handle.as_u64(),
                "cancel requested for unknown timer handle"
            );
        }
        found
    }

    /// Counts pending timers whose target and callback both match, without
    /// removing anything.
    pub fn count_matching(&self, target: TargetId, callback: TimerCallback<A, R>) -> usize {
        if target.is_none() {
            return 0;
        }
        self.high
            .count_where(|r| r.target == target && r.callback == callback)
            + self
                .normal
                .count_where(|r| r.target == target && r.callback == callback)
    }

    /// Removes the first matching record (high queue searched first) and
    /// invokes its callback immediately with its captured arguments,
    /// returning the callback's value.
    pub fn fire_one_matching(&self, target: TargetId, callback: TimerCallback<A, R>) -> Option<R> {
        if target.is_none() {
            return None;
        }
        let record = self
            .high
            .take_first_where(|r| r.target == target && r.callback == callback)
            .or_else(|| {
                self.normal
                    .take_first_where(|r| r.target == target && r.callback == callback)
            })?;
        Some((record.callback)(record.target, record.args))
    }

    /// Time until the earliest pending deadline, clamped to zero when it is
    /// already overdue, or `None` when nothing is eligible. The event loop
    /// uses this to bound its I/O wait.
    ///
    /// A queue that is currently being drained is skipped: its records are
    /// already being taken care of by the pump in progress.
    pub fn time_until_next(&self) -> Option<Duration> {
        let next = [&self.high, &self.normal]
            .into_iter()
            .filter(|q| !q.is_running())
            .filter_map(|q| q.head_fire_at_ns())
            .min()?;
        Some(Duration::from_nanos(
            next.saturating_sub(self.clock.now_ns()),
        ))
    }

    /// Runs due timers. The event loop calls this each time it returns from
    /// its I/O wait.
    ///
    /// The two queues are deliberately drained asymmetrically:
    ///
    /// 1. Every due high record fires, earliest deadline first. If any did,
    ///    `pump` returns immediately so the host can service I/O before
    ///    normal work runs.
    /// 2. Otherwise the between-passes hook (if installed) runs.
    /// 3. At most one due normal record fires. Normal callbacks may pump
    ///    I/O themselves and re-enter `pump`; the single-fire budget keeps
    ///    such chains from starving the I/O loop.
    ///
    /// Re-entering `pump` while a queue is already being drained returns
    /// without touching that queue. A panicking callback unwinds out of
    /// `pump` with the `running` flags released, leaving the scheduler
    /// pumpable.
    pub fn pump(&self, now_ns: u64) -> PumpCounts {
        let mut counts = PumpCounts::default();

        {
            let Some(_running) = RunningGuard::acquire(self.high.running_flag()) else {
                trace!("high queue is already being drained; skipping pump");
                return counts;
            };
            // Re-read the head every iteration: the callback may have
            // scheduled into or cancelled from this queue.
            while let Some(record) = self.high.pop_due(now_ns) {
                (record.callback)(record.target, record.args);
                counts.high_fired += 1;
            }
        }

        if counts.high_fired > 0 {
            return counts;
        }

        self.run_between_pass_hook();

        {
            let Some(_running) = RunningGuard::acquire(self.normal.running_flag()) else {
                trace!("normal queue is already being drained; skipping pump");
                return counts;
            };
            if let Some(record) = self.normal.pop_due(now_ns) {
                (record.callback)(record.target, record.args);
                counts.normal_fired += 1;
            }
        }

        counts
    }

    /// [`Scheduler::pump`] with `now` read from the scheduler's own clock.
    pub fn pump_now(&self) -> PumpCounts {
        self.pump(self.clock.now_ns())
    }

    /// Installs a hook run between the high and normal passes of each pump,
    /// typically a lightweight I/O drain. Replaces any previous hook.
    pub fn set_between_pass_hook(&self, hook: impl FnMut() + 'static) {
        *self.between_pass_hook.borrow_mut() = Some(Box::new(hook));
    }

    pub fn clear_between_pass_hook(&self) {
        *self.between_pass_hook.borrow_mut() = None;
    }

    fn run_between_pass_hook(&self) {
        // The hook is taken out of its slot for the duration of the call: a
        // hook that pumps I/O re-enters `pump`, and must not recurse into
        // itself.
        let hook = self.between_pass_hook.borrow_mut().take();
        if let Some(mut hook) = hook {
            hook();
            let mut slot = self.between_pass_hook.borrow_mut();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }

    /// Shifts every pending deadline by `delta_ns`, in response to a jump in
    /// the host wall clock (NTP correction, sleep/resume). Deadlines
    /// saturate at the ends of the `u64` range; a uniform shift leaves each
    /// queue's order intact.
    ///
    /// Must not be called from inside a timer callback.
    pub fn adjust_all(&self, delta_ns: i64) {
        self.high.shift_all(delta_ns);
        self.normal.shift_all(delta_ns);
    }

    /// Snapshot of every pending timer, high queue rows first. Debugging
    /// only.
    pub fn list_pending(&self) -> Vec<PendingTimer> {
        let mut out = Vec::with_capacity(self.pending_len());
        for (queue, kind) in [(&self.high, QueueKind::High), (&self.normal, QueueKind::Normal)] {
            queue.for_each(|r| {
                out.push(PendingTimer {
                    queue: kind,
                    handle: r.handle,
                    target: r.target,
                    fire_at_ns: r.fire_at_ns,
                    callback_addr: r.callback_addr(),
                });
            });
        }
        out
    }

    /// Total pending records across both queues.
    pub fn pending_len(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_len() == 0
    }
}

impl<A, R> fmt::Debug for Scheduler<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("high", &self.high)
            .field("normal", &self.normal)
            .field("normal_queue_cap", &self.normal_queue_cap)
            .finish_non_exhaustive()
    }
}
