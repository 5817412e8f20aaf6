//! Mutexes
use core::fmt;

use crate::{
    error::{LockMutexError, QueryMutexError, UnlockMutexError},
    klock::{self, SchedCell},
    state,
    task::TaskRef,
    utils::Init,
    wait::WaitQueue,
    KernelTraits,
};

/// A mutual-exclusion primitive with FIFO queueing and direct handoff.
///
/// The storage is caller-owned: construct it in place with [`Mutex::new`]
/// and keep it alive for as long as any task can reach it. No teardown is
/// needed beyond making sure no task is waiting on it when it is dropped.
///
/// Unlocking a contended mutex transfers ownership directly to the first
/// waiter: the waiter never observes an unlocked mutex and never races for
/// it. There is no `try_lock`; an adapter that wants one can poll
/// [`Mutex::is_locked`] from the single scheduler context, where the answer
/// cannot go stale.
pub struct Mutex<Traits: KernelTraits> {
    /// The task that currently owns the mutex lock.
    owning_task: SchedCell<Traits, Option<TaskRef<Traits>>>,

    wait_queue: WaitQueue<Traits>,
}

// Safety: All fields are only accessed while holding the scheduler lock.
unsafe impl<Traits: KernelTraits> Sync for Mutex<Traits> {}

impl<Traits: KernelTraits> Mutex<Traits> {
    pub const fn new() -> Self {
        Self {
            owning_task: SchedCell::new(None),
            wait_queue: WaitQueue::new(),
        }
    }
}

impl<Traits: KernelTraits> Default for Mutex<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> Init for Mutex<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("self", &(self as *const _))
            .field(
                "owning_task",
                // break infinite recursion (TaskCb → Mutex → TaskCb → ...)
                &self.owning_task,
            )
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> Mutex<Traits> {
    /// Acquire the mutex, blocking while another task owns it.
    ///
    /// When this returns, the calling task is the owner. Waiters are served
    /// in arrival order.
    pub fn lock(&self) -> Result<(), LockMutexError> {
        let mut lock = klock::lock_sched::<Traits>()?;
        state::expect_task_context::<Traits>(lock.borrow_mut())?;

        let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

        if let Some(owner) = self.owning_task.get(&*lock) {
            if owner == running_task {
                return Err(LockMutexError::WouldDeadlock);
            }
            // Start waiting. The unlocking task transfers the ownership to
            // us before waking us up, so there is nothing left to do upon
            // return; no retry loop.
            self.wait_queue.wait(lock.borrow_mut());
            debug_assert_eq!(self.owning_task.get(&*lock), Some(running_task));
        } else {
            self.owning_task
                .replace(&mut *lock, Some(running_task));
        }

        Ok(())
    }

    /// Release the mutex.
    ///
    /// If tasks are waiting, ownership moves to the first of them and it is
    /// made ready; the calling task keeps running either way.
    pub fn unlock(&self) -> Result<(), UnlockMutexError> {
        let mut lock = klock::lock_sched::<Traits>()?;
        state::expect_task_context::<Traits>(lock.borrow_mut())?;

        let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        if self.owning_task.get(&*lock) != Some(running_task) {
            // The current task does not currently own the mutex.
            return Err(UnlockMutexError::NotOwner);
        }

        if let Some(next_task) = self.wait_queue.first_waiting_task(lock.borrow_mut()) {
            // Give the ownership of the mutex to `next_task` and wake it up
            self.owning_task.replace(&mut *lock, Some(next_task));
            let woken = self.wait_queue.wake_up_one(lock.borrow_mut());
            debug_assert!(woken);
        } else {
            // There's no one waiting
            self.owning_task.replace(&mut *lock, None);
        }

        Ok(())
    }

    /// Get a flag indicating whether the mutex is currently owned.
    pub fn is_locked(&self) -> Result<bool, QueryMutexError> {
        let mut lock = klock::lock_sched::<Traits>()?;
        state::expect_task_context::<Traits>(lock.borrow_mut())?;
        Ok(self.owning_task.get(&*lock).is_some())
    }
}
