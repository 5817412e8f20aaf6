//! Wait queues
//!
//! A [`WaitQueue`] is a FIFO of tasks blocked on one waitable object (a
//! mutex, an event, or another task's exit). A waiting task is linked through
//! [`TaskCb::link`], the same node the ready queue uses, which is what
//! enforces "a task is on at most one of {ready queue, a wait queue}" by
//! construction, and records the queue it is on in [`TaskCb::waiting_on`]
//! so the timeout path can unlink it.
//!
//! Both wakeup paths maintain the joint-unlink invariant: whichever fires
//! first removes the task from the wait queue *and* the timer queue before
//! making it ready, so the loser finds nothing left to do.
//!
//! [`TaskCb::link`]: crate::task::TaskCb
//! [`TaskCb::waiting_on`]: crate::task::TaskCb
use core::ptr::NonNull;

use crate::{
    error::{expect_not_timeout, WaitTimeoutError},
    klock::{SchedCell, SchedTokenRefMut},
    state, task,
    task::{task_link_accessor, TaskRef, TaskSt},
    timeout,
    utils::{intrusive_list::ListHead, Init},
    KernelTraits,
};

/// A queue of tasks waiting on a particular waitable object.
pub(crate) struct WaitQueue<Traits: KernelTraits> {
    /// Tasks waiting on the waitable object associated with this instance of
    /// `WaitQueue`. The tasks must be in the Waiting state.
    ///
    /// All elements of this linked list must be valid.
    waits: SchedCell<Traits, ListHead<TaskRef<Traits>>>,
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            waits: SchedCell::new(ListHead::new()),
        }
    }
}

impl<Traits: KernelTraits> Init for WaitQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Insert the currently running task into `self`, transitioning it into
    /// the Waiting state. Returns when the task is woken up.
    ///
    /// The wait is unbounded, so it cannot time out.
    pub(crate) fn wait(&self, mut lock: SchedTokenRefMut<'_, Traits>) {
        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        self.wait_inner(lock.borrow_mut(), task);

        match task.cb().wait_result.get(&*lock) {
            Ok(()) => {}
            Err(e) => match expect_not_timeout(e) {},
        }
    }

    /// Insert the currently running task into `self`, transitioning it into
    /// the Waiting state, and additionally arm a timeout of
    /// `duration_time32` ticks. Returns when the task is woken up; the
    /// result tells whether the timeout fired first.
    pub(crate) fn wait_timeout(
        &self,
        mut lock: SchedTokenRefMut<'_, Traits>,
        duration_time32: timeout::Time32,
    ) -> Result<(), WaitTimeoutError> {
        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();

        timeout::insert_timeout(lock.borrow_mut(), task, duration_time32);
        self.wait_inner(lock.borrow_mut(), task);

        task.cb().wait_result.get(&*lock)
    }

    /// The core portion of `Self::wait`: park `task` on this queue and
    /// dispatch away until a wake-upper makes it Running again.
    fn wait_inner(&self, mut lock: SchedTokenRefMut<'_, Traits>, task: TaskRef<Traits>) {
        debug_assert_eq!(*task.cb().st.read(&*lock), TaskSt::Running);

        {
            let mut accessor = task_link_accessor!(&self.waits, lock.borrow_mut());
            accessor.push_back(task);
        }
        task.cb()
            .waiting_on
            .replace(&mut *lock, Some(NonNull::from(self)));
        task.cb().st.replace(&mut *lock, TaskSt::Waiting);

        // This statement will complete when the task is woken up.
        state::dispatch(lock.borrow_mut(), task);

        // The wake-upper should have detached us from every queue
        debug_assert!(task.cb().link.read(&*lock).is_none());
        debug_assert!(task.cb().timeout_link.read(&*lock).is_none());
        debug_assert!(task.cb().waiting_on.read(&*lock).is_none());
    }

    /// Get the next waiting task to be woken up.
    pub(crate) fn first_waiting_task(
        &self,
        lock: SchedTokenRefMut<'_, Traits>,
    ) -> Option<TaskRef<Traits>> {
        let accessor = task_link_accessor!(&self.waits, lock);
        accessor.front()
    }

    /// Wake up up to one waiting task. Returns `true` if it has successfully
    /// woken up a task.
    ///
    /// This method may make a task Ready, but does not yield the processor.
    pub(crate) fn wake_up_one(&self, mut lock: SchedTokenRefMut<'_, Traits>) -> bool {
        let task = {
            let mut accessor = task_link_accessor!(&self.waits, lock.borrow_mut());
            accessor.pop_front()
        };
        let Some(task) = task else { return false };

        debug_assert_eq!(
            task.cb().waiting_on.get(&*lock).map(NonNull::as_ptr),
            Some(self as *const _ as *mut _)
        );
        complete_wait(lock, task, Ok(()));
        true
    }

    /// Wake up all waiting tasks, in FIFO order.
    ///
    /// This method may make tasks Ready, but does not yield the processor.
    pub(crate) fn wake_up_all(&self, mut lock: SchedTokenRefMut<'_, Traits>) {
        while self.wake_up_one(lock.borrow_mut()) {}
    }
}

/// Deassociate `task` from its wait bookkeeping (timeout and `waiting_on`,
/// but *not* the wait queue's list, which the caller has already unlinked) and
/// wake it up with the given wait result.
fn complete_wait<Traits: KernelTraits>(
    mut lock: SchedTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
    wait_result: Result<(), WaitTimeoutError>,
) {
    timeout::cancel_timeout(lock.borrow_mut(), task);
    task.cb().waiting_on.replace(&mut *lock, None);
    task.cb().wait_result.replace(&mut *lock, wait_result);

    debug_assert_eq!(*task.cb().st.read(&*lock), TaskSt::Waiting);

    // Safety: The task is in the Waiting state, meaning its context is valid
    // and ready to resume from the point where it was suspended, and it is
    // not on any `link` queue anymore.
    unsafe { task::make_ready(lock, task) };
}

/// Wake up `task` because its timeout fired. Called by the timer-queue sweep
/// after removing the task from the timer queue; this removes it from the
/// wait queue it is parked on (if any; a sleeping task has none).
pub(crate) fn cancel_wait_by_timeout<Traits: KernelTraits>(
    mut lock: SchedTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    if let Some(wait_queue) = task.cb().waiting_on.get(&*lock) {
        // Safety: a queue outlives every wait parked on it; the task is
        // parked on this queue right now
        let wait_queue = unsafe { wait_queue.as_ref() };
        let mut accessor = task_link_accessor!(&wait_queue.waits, lock.borrow_mut());
        accessor.remove(task);
    }

    complete_wait(lock, task, Err(WaitTimeoutError::Timeout));
}

/// Put the currently running task to sleep for `duration_time32` ticks
/// without parking it on any wait queue. The only way the wait ends is the
/// timeout firing, so the result is always `Err(Timeout)`.
pub(crate) fn wait_no_queue_timeout<Traits: KernelTraits>(
    mut lock: SchedTokenRefMut<'_, Traits>,
    duration_time32: timeout::Time32,
) -> Result<(), WaitTimeoutError> {
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    timeout::insert_timeout(lock.borrow_mut(), task, duration_time32);
    debug_assert!(task.cb().waiting_on.read(&*lock).is_none());
    task.cb().st.replace(&mut *lock, TaskSt::Waiting);

    state::dispatch(lock.borrow_mut(), task);

    task.cb().wait_result.get(&*lock)
}
