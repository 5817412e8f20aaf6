//! Events
use core::fmt;

use crate::{
    error::{UpdateEventError, WaitEventError, WaitEventTimeoutError},
    klock::{self, SchedCell},
    state, timeout,
    utils::Init,
    wait::WaitQueue,
    KernelTraits,
};

/// A level-triggered, broadcast event flag.
///
/// [`Event::set`] wakes *every* task parked in [`Event::wait`], in arrival
/// order. If no task is parked, the flag latches instead and the next wait
/// consumes it immediately, which is why a flagged event never has waiters.
///
/// The storage is caller-owned, like [`Mutex`](crate::Mutex)'s.
pub struct Event<Traits: KernelTraits> {
    flagged: SchedCell<Traits, bool>,

    wait_queue: WaitQueue<Traits>,
}

// Safety: All fields are only accessed while holding the scheduler lock.
unsafe impl<Traits: KernelTraits> Sync for Event<Traits> {}

impl<Traits: KernelTraits> Event<Traits> {
    pub const fn new() -> Self {
        Self {
            flagged: SchedCell::new(false),
            wait_queue: WaitQueue::new(),
        }
    }
}

impl<Traits: KernelTraits> Default for Event<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> Init for Event<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> fmt::Debug for Event<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Event")
            .field("self", &(self as *const _))
            .field("flagged", &self.flagged)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> Event<Traits> {
    /// Signal the event: wake all waiters, or latch the flag if there are
    /// none. Setting an already-flagged event is a no-op.
    ///
    /// Woken tasks become ready; the calling task keeps running.
    pub fn set(&self) -> Result<(), UpdateEventError> {
        let mut lock = klock::lock_sched::<Traits>()?;
        state::expect_task_context::<Traits>(lock.borrow_mut())?;

        if self
            .wait_queue
            .first_waiting_task(lock.borrow_mut())
            .is_some()
        {
            debug_assert!(!self.flagged.get(&*lock));
            self.wait_queue.wake_up_all(lock.borrow_mut());
        } else {
            self.flagged.replace(&mut *lock, true);
        }

        Ok(())
    }

    /// Drop a latched flag without waking anyone. A no-op if the flag is not
    /// set.
    pub fn clear(&self) -> Result<(), UpdateEventError> {
        let mut lock = klock::lock_sched::<Traits>()?;
        state::expect_task_context::<Traits>(lock.borrow_mut())?;
        self.flagged.replace(&mut *lock, false);
        Ok(())
    }

    /// Consume the flag if it is set; otherwise block until the event is
    /// signaled.
    pub fn wait(&self) -> Result<(), WaitEventError> {
        let mut lock = klock::lock_sched::<Traits>()?;
        state::expect_task_context::<Traits>(lock.borrow_mut())?;

        if self.flagged.get(&*lock) {
            self.flagged.replace(&mut *lock, false);
        } else {
            self.wait_queue.wait(lock.borrow_mut());
        }

        Ok(())
    }

    /// Like [`Event::wait`], but give up after the given duration.
    ///
    /// Whichever of the signal and the deadline comes first wins; the loser
    /// has no residual effect (in particular, a task woken by `set` is not
    /// re-woken later by its dead timeout).
    pub fn wait_timeout(&self, duration: core::time::Duration) -> Result<(), WaitEventTimeoutError> {
        let time32 = timeout::time32_from_duration::<Traits>(duration)?;
        let mut lock = klock::lock_sched::<Traits>()?;
        state::expect_task_context::<Traits>(lock.borrow_mut())?;

        if self.flagged.get(&*lock) {
            self.flagged.replace(&mut *lock, false);
            Ok(())
        } else {
            self.wait_queue
                .wait_timeout(lock.borrow_mut(), time32)
                .map_err(Into::into)
        }
    }
}
