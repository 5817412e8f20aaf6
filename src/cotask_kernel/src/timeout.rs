//! Manages timeouts (timed wakeups).
//!
//! # Ticks
//!
//! Time is measured in *ticks* ([`Time32`], provided by
//! [`PortTimer::tick_count`]). Tick counts wrap around freely; the kernel
//! never compares two ticks directly. Instead, both sides of a comparison are
//! first rebased against a *critical point* trailing the current time by
//! [`HEADROOM`], which turns the circular tick space into a linear window
//! (see the diagram on [`DURATION_MAX`]).
//!
//! Every outstanding deadline lives at most [`DURATION_MAX`] ticks after the
//! time it was registered and becomes overdue at most [`HEADROOM`] ticks
//! before it is processed, so all live deadlines fall inside the window and
//! rebased values order correctly. This is the invariant behind accepting
//! only durations of up to `DURATION_MAX` ticks.
//!
//! [`PortTimer::tick_count`]: crate::PortTimer::tick_count
use num_integer::div_ceil;
use num_traits::ToPrimitive;

use crate::{
    error::BadParamError,
    klock::SchedTokenRefMut,
    task::{timeout_queue_accessor, TaskRef},
    wait, KernelTraits, PortTimer, UTicks,
};

/// Represents a point of time or a time span in ticks, with a reduced range.
pub(crate) type Time32 = u32;

/// The longest time span (in ticks) a timeout may be registered for.
///
/// Limiting spans to half the tick range is what makes the wrapping
/// comparisons in this module sound:
///
#[doc = svgbobdoc::transform!(
/// ```svgbob
///                  now                      "now + DURATION_MAX"
/// ════╤═════════════╤═══════════════════════════╤══════════════╗
///     │  "overdue"  │        enqueueable        │              ║
/// "critical point"  '─ deadlines land in here ─'     "wraps back"
/// ```
)]
pub(crate) const DURATION_MAX: Time32 = (1 << 31) - 1;

/// How far behind the current time the comparison window reaches. Deadlines
/// may be processed up to this many ticks late without being misread as
/// far-future deadlines.
const HEADROOM: Time32 = 1 << 30;

/// Convert `duration` to a tick count, rounding up so that a task never
/// wakes before the requested time has fully elapsed.
pub(crate) fn time32_from_duration<Traits: PortTimer>(
    duration: core::time::Duration,
) -> Result<Time32, BadParamError> {
    let ticks = div_ceil(
        duration
            .as_nanos()
            .checked_mul(Traits::TICKS_PER_SECOND as u128)
            .ok_or(BadParamError::BadParam)?,
        1_000_000_000,
    );
    match ticks.to_u32() {
        Some(ticks) if ticks <= DURATION_MAX => Ok(ticks),
        _ => Err(BadParamError::BadParam),
    }
}

/// Find the critical point (the earlier end of the comparison window) for
/// the given current time.
#[inline]
fn critical_point(now: Time32) -> Time32 {
    now.wrapping_sub(HEADROOM)
}

/// Register the calling context's pending timeout: arm `task` to be woken
/// `duration_time32` ticks from now.
///
/// The task must not already be on the timer queue.
pub(crate) fn insert_timeout<Traits: KernelTraits>(
    mut lock: SchedTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
    duration_time32: Time32,
) {
    debug_assert!(duration_time32 <= DURATION_MAX);

    let now = Traits::tick_count();
    let critical_point = critical_point(now);
    let at = now.wrapping_add(duration_time32);
    task.cb().wake_tick.replace(&mut *lock, at);
    let key = at.wrapping_sub(critical_point);

    // Walk the queue from the back to find the insertion position. Entries
    // with an equal deadline stay in front (FIFO tie-break).
    let mut accessor = timeout_queue_accessor!(&Traits::state().timeout_queue, lock);
    let mut insert_at = None;
    let mut cursor = accessor.back();
    while let Some(entry) = cursor {
        let entry_key = entry
            .cb()
            .wake_tick
            .read(&**accessor.cell_key())
            .wrapping_sub(critical_point);
        if entry_key > key {
            insert_at = Some(entry);
            cursor = accessor.prev(entry);
        } else {
            break;
        }
    }
    accessor.insert(task, insert_at);
}

/// Unregister the task's pending timeout. Does nothing if it has none.
pub(crate) fn cancel_timeout<Traits: KernelTraits>(
    lock: SchedTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    let mut accessor = timeout_queue_accessor!(&Traits::state().timeout_queue, lock);
    if accessor.is_linked(task) {
        accessor.remove(task);
    }
}

/// Process expired timeouts: move every task whose deadline has passed to
/// the ready queue, detaching it from whatever wait queue also held it and
/// stamping its wait result with `Timeout`.
pub(crate) fn expire_timeouts<Traits: KernelTraits>(mut lock: SchedTokenRefMut<'_, Traits>) {
    let critical_point = critical_point(Traits::tick_count());

    loop {
        let first = {
            let accessor = timeout_queue_accessor!(&Traits::state().timeout_queue, lock.borrow_mut());
            accessor.front()
        };
        let Some(task) = first else { return };

        let remaining = task
            .cb()
            .wake_tick
            .read(&*lock)
            .wrapping_sub(critical_point)
            .saturating_sub(HEADROOM);
        if remaining > 0 {
            return;
        }

        {
            let mut accessor =
                timeout_queue_accessor!(&Traits::state().timeout_queue, lock.borrow_mut());
            accessor.remove(task);
        }
        wait::cancel_wait_by_timeout(lock.borrow_mut(), task);
    }
}

/// The time remaining (in ticks) until the earliest registered deadline, or
/// `None` if the timer queue is empty. Returns `Some(0)` for an overdue
/// deadline.
pub(crate) fn ticks_until_first<Traits: KernelTraits>(
    mut lock: SchedTokenRefMut<'_, Traits>,
) -> Option<UTicks> {
    let critical_point = critical_point(Traits::tick_count());
    let first = {
        let accessor = timeout_queue_accessor!(&Traits::state().timeout_queue, lock.borrow_mut());
        accessor.front()
    }?;
    Some(
        first
            .cb()
            .wake_tick
            .read(&*lock)
            .wrapping_sub(critical_point)
            .saturating_sub(HEADROOM),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskCb, TaskSt};
    use crate::test_support::define_test_traits;
    use crate::utils::Init;
    use quickcheck_macros::quickcheck;
    use std::vec::Vec;

    #[test]
    fn duration_conversion_rounds_up() {
        define_test_traits!(struct Traits);

        // 1 tick = 1 ms with `TICKS_PER_SECOND = 1_000`
        assert_eq!(
            time32_from_duration::<Traits>(core::time::Duration::from_millis(100)),
            Ok(100)
        );
        assert_eq!(
            time32_from_duration::<Traits>(core::time::Duration::from_micros(1)),
            Ok(1)
        );
        assert_eq!(
            time32_from_duration::<Traits>(core::time::Duration::ZERO),
            Ok(0)
        );
        assert_eq!(
            time32_from_duration::<Traits>(core::time::Duration::from_secs(u64::MAX)),
            Err(BadParamError::BadParam)
        );
    }

    /// Leak a waiting task record and return its handle.
    fn make_waiting_task<Traits: KernelTraits>(
        lock: &mut crate::klock::SchedGuard<Traits>,
    ) -> TaskRef<Traits> {
        let cb: &'static TaskCb<Traits> = Box::leak(Box::new(Init::INIT));
        let task = TaskRef::from_cb(cb);
        task.cb().st.replace(&mut *lock.borrow_mut(), TaskSt::Waiting);
        task
    }

    fn drain_ready<Traits: KernelTraits>(
        lock: &mut crate::klock::SchedGuard<Traits>,
    ) -> Vec<TaskRef<Traits>> {
        let mut out = Vec::new();
        let mut accessor = crate::task::task_link_accessor!(
            &Traits::state().ready_queue,
            lock.borrow_mut()
        );
        while let Some(task) = accessor.pop_front() {
            out.push(task);
        }
        out
    }

    #[test]
    fn expiry_order_is_sorted_and_fifo() {
        define_test_traits!(struct Traits);
        let mut lock = crate::klock::lock_sched::<Traits>().unwrap();

        let tasks: Vec<_> = (0..4).map(|_| make_waiting_task(&mut lock)).collect();
        for (task, delay) in tasks.iter().zip([30u32, 10, 20, 10]) {
            insert_timeout(lock.borrow_mut(), *task, delay);
        }

        Traits::advance(100);
        expire_timeouts(lock.borrow_mut());

        // 10ms ties break in insertion order
        let woken = drain_ready(&mut lock);
        assert_eq!(woken, [tasks[1], tasks[3], tasks[2], tasks[0]]);
        for task in &woken {
            assert_eq!(
                *task.cb().wait_result.read(&*lock.borrow_mut()),
                Err(crate::error::WaitTimeoutError::Timeout)
            );
        }
    }

    #[test]
    fn cancel_unlinks() {
        define_test_traits!(struct Traits);
        let mut lock = crate::klock::lock_sched::<Traits>().unwrap();

        let a = make_waiting_task(&mut lock);
        let b = make_waiting_task(&mut lock);
        insert_timeout(lock.borrow_mut(), a, 5);
        insert_timeout(lock.borrow_mut(), b, 10);
        assert_eq!(ticks_until_first(lock.borrow_mut()), Some(5));

        cancel_timeout(lock.borrow_mut(), a);
        assert_eq!(ticks_until_first(lock.borrow_mut()), Some(10));
        cancel_timeout(lock.borrow_mut(), a); // idempotent
        cancel_timeout(lock.borrow_mut(), b);
        assert_eq!(ticks_until_first(lock.borrow_mut()), None);
    }

    #[quickcheck]
    fn qc_expiry_is_stable_sort(delays: Vec<u16>) {
        define_test_traits!(struct Traits);
        let mut lock = crate::klock::lock_sched::<Traits>().unwrap();

        let delays: Vec<_> = delays.into_iter().take(16).collect();
        let tasks: Vec<_> = delays.iter().map(|_| make_waiting_task(&mut lock)).collect();
        for (task, &delay) in tasks.iter().zip(&delays) {
            insert_timeout(lock.borrow_mut(), *task, delay as u32);
        }

        Traits::advance(u16::MAX as u32 + 1);
        expire_timeouts(lock.borrow_mut());
        let woken = drain_ready(&mut lock);

        let mut expected: Vec<_> = tasks.iter().copied().zip(delays).collect();
        expected.sort_by_key(|&(_, delay)| delay);
        assert_eq!(
            woken,
            expected.iter().map(|&(task, _)| task).collect::<Vec<_>>()
        );
    }
}
