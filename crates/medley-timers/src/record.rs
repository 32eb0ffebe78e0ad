use std::cell::Cell;

/// Stable identity of one scheduled timer, usable to cancel exactly that
/// record.
///
/// Handles are allocated from a per-scheduler 64-bit counter and are not
/// reused within a scheduler's lifetime. A handle whose record has already
/// fired or been cancelled names nothing; cancelling through it is a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub(crate) fn next(counter: &Cell<u64>) -> Self {
        let id = counter.get();
        counter.set(id.wrapping_add(1));
        TimerHandle(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Opaque identity a caller attaches to its timers, typically derived from a
/// client/session handle. Batched cancellation matches on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId(u64);

impl TargetId {
    /// The "no target" value. Scheduling with it is fine; match-based
    /// cancellation with it removes nothing.
    pub const NONE: TargetId = TargetId(0);

    /// Wraps a caller identity. Raw value 0 is reserved for [`TargetId::NONE`].
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        TargetId(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == Self::NONE.0
    }
}

/// Callback invoked when a timer fires: `(target, captured args) -> value`.
///
/// A plain function pointer. Match-based cancellation compares callbacks by
/// address, so two distinct functions with identical behavior are distinct
/// identities. Captured arguments travel in the record as an owned payload
/// and are handed back by value on fire.
pub type TimerCallback<A, R = ()> = fn(TargetId, A) -> R;

/// One pending timer. Owned exclusively by the scheduler; immutable after
/// creation except for `fire_at_ns` under skew adjustment.
pub(crate) struct TimerRecord<A, R = ()> {
    pub(crate) handle: TimerHandle,
    pub(crate) target: TargetId,
    pub(crate) fire_at_ns: u64,
    pub(crate) callback: TimerCallback<A, R>,
    pub(crate) args: A,
}

impl<A, R> TimerRecord<A, R> {
    pub(crate) fn callback_addr(&self) -> usize {
        self.callback as usize
    }
}

/// Which priority level a pending timer sits in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    High,
    Normal,
}

/// One row of the scheduler's pending-timer snapshot. Debugging only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingTimer {
    pub queue: QueueKind,
    pub handle: TimerHandle,
    pub target: TargetId,
    pub fire_at_ns: u64,
    /// Address of the callback function, for identifying it in logs.
    pub callback_addr: usize,
}
