//! Randomized invariant checks: whatever sequence of operations runs, the
//! queues stay sorted, the cached heads agree with the records, skew shifts
//! are linear, and no callback fires twice.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use proptest::prelude::*;

use medley_timers::{Clock, ManualClock, PendingTimer, QueueKind, Scheduler, TargetId};

type FireMap = Rc<RefCell<HashMap<u64, u32>>>;
type FireArgs = (FireMap, u64);

fn count_fire(_target: TargetId, args: FireArgs) {
    let (map, id) = args;
    *map.borrow_mut().entry(id).or_insert(0) += 1;
}

type FireOrder = Rc<RefCell<Vec<u64>>>;
type OrderArgs = (FireOrder, u64);

fn push_fire(_target: TargetId, args: OrderArgs) {
    let (order, id) = args;
    order.borrow_mut().push(id);
}

#[derive(Debug, Clone)]
enum Op {
    ScheduleHigh { target: u64, fire_at: u64 },
    ScheduleNormal { target: u64, fire_at: u64 },
    CancelByTarget { target: u64 },
    CancelNthHandle { nth: usize },
    Pump { now: u64 },
    Adjust { delta: i64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u64..5, 0u64..1_000).prop_map(|(target, fire_at)| Op::ScheduleHigh { target, fire_at }),
        4 => (1u64..5, 0u64..1_000).prop_map(|(target, fire_at)| Op::ScheduleNormal { target, fire_at }),
        1 => (1u64..5).prop_map(|target| Op::CancelByTarget { target }),
        1 => (0usize..40).prop_map(|nth| Op::CancelNthHandle { nth }),
        3 => (0u64..1_200).prop_map(|now| Op::Pump { now }),
        1 => (-300i64..300).prop_map(|delta| Op::Adjust { delta }),
    ]
}

fn rows(pending: &[PendingTimer], kind: QueueKind) -> Vec<&PendingTimer> {
    pending.iter().filter(|p| p.queue == kind).collect()
}

fn check_sorted(pending: &[PendingTimer]) {
    for kind in [QueueKind::High, QueueKind::Normal] {
        let rows = rows(pending, kind);
        for pair in rows.windows(2) {
            assert!(
                pair[0].fire_at_ns <= pair[1].fire_at_ns,
                "queue {kind:?} out of order: {pending:?}"
            );
        }
    }
}

proptest! {
    #[test]
    fn random_op_sequences_keep_the_invariants(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let clock = ManualClock::new();
        let sched: Scheduler<FireArgs> = Scheduler::new(Rc::new(clock.clone()));
        let fires: FireMap = Rc::new(RefCell::new(HashMap::new()));
        let mut next_id = 0u64;
        let mut handles = Vec::new();
        let mut now = 0u64;

        for op in ops {
            match op {
                Op::ScheduleHigh { target, fire_at } => {
                    let args = (fires.clone(), next_id);
                    next_id += 1;
                    handles.push(sched.schedule_high(
                        TargetId::from_raw(target),
                        fire_at,
                        count_fire,
                        args,
                    ));
                }
                Op::ScheduleNormal { target, fire_at } => {
                    let args = (fires.clone(), next_id);
                    next_id += 1;
                    if let Ok(handle) = sched.schedule_normal(
                        TargetId::from_raw(target),
                        fire_at,
                        count_fire,
                        args,
                    ) {
                        handles.push(handle);
                    }
                }
                Op::CancelByTarget { target } => {
                    sched.cancel_by_target(TargetId::from_raw(target));
                }
                Op::CancelNthHandle { nth } => {
                    // Cancelling an already-spent handle is an allowed no-op.
                    if let Some(handle) = handles.get(nth) {
                        sched.cancel_specific(*handle);
                    }
                }
                Op::Pump { now: pump_now } => {
                    now = now.max(pump_now);
                    clock.set_ns(now);
                    sched.pump(now);
                }
                Op::Adjust { delta } => {
                    sched.adjust_all(delta);
                }
            }

            let pending = sched.list_pending();
            check_sorted(&pending);

            // The cached heads drive `time_until_next`; it must agree with a
            // recomputation from the snapshot (nothing is running here).
            let expected = pending
                .iter()
                .map(|p| p.fire_at_ns)
                .min()
                .map(|t| Duration::from_nanos(t.saturating_sub(clock.now_ns())));
            prop_assert_eq!(sched.time_until_next(), expected);
        }

        for (&id, &count) in fires.borrow().iter() {
            prop_assert!(count <= 1, "record {} fired {} times", id, count);
        }
    }

    #[test]
    fn skew_adjustment_is_linear_and_order_preserving(
        deadlines in prop::collection::vec(0u64..1_000_000, 1..30),
        delta in -1_000_000i64..1_000_000,
    ) {
        let clock = ManualClock::new();
        let sched: Scheduler<FireArgs> = Scheduler::new(Rc::new(clock.clone()));
        let fires: FireMap = Rc::new(RefCell::new(HashMap::new()));

        for (i, &fire_at) in deadlines.iter().enumerate() {
            let args = (fires.clone(), i as u64);
            if i % 2 == 0 {
                sched.schedule_high(TargetId::from_raw(1), fire_at, count_fire, args);
            } else {
                sched.schedule_normal(TargetId::from_raw(1), fire_at, count_fire, args).unwrap();
            }
        }

        let before = sched.list_pending();
        sched.adjust_all(delta);
        let after = sched.list_pending();

        prop_assert_eq!(before.len(), after.len());
        for (old, new) in before.iter().zip(after.iter()) {
            prop_assert_eq!(new.handle, old.handle);
            prop_assert_eq!(new.fire_at_ns, old.fire_at_ns.saturating_add_signed(delta));
        }
        check_sorted(&after);
    }

    #[test]
    fn stability_holds_for_equal_deadlines(count in 2u64..20) {
        let clock = ManualClock::new();
        let sched: Scheduler<OrderArgs> = Scheduler::new(Rc::new(clock.clone()));
        let order: FireOrder = Rc::new(RefCell::new(Vec::new()));

        for i in 0..count {
            sched
                .schedule_normal(TargetId::from_raw(1), 100, push_fire, (order.clone(), i))
                .unwrap();
        }

        // One record per pump; equal deadlines must come out in scheduling
        // order.
        for _ in 0..count {
            prop_assert_eq!(sched.pump(200).normal_fired, 1);
        }
        prop_assert!(sched.is_empty());
        prop_assert_eq!(&*order.borrow(), &(0..count).collect::<Vec<u64>>());
    }
}
