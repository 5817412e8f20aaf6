//! Scheduler state and the dispatch loop.
use core::fmt;
use core::sync::atomic::AtomicBool;

use crate::{
    arch,
    error::{BadContextError, InitError, TimeError},
    klock::{self, SchedCell, SchedTokenRefMut},
    task::{task_link_accessor, TaskCb, TaskRef, TaskSt},
    timeout,
    utils::{intrusive_list::ListHead, Init},
    KernelTraits, System, UTicks,
};

/// The kernel-global state of a system.
///
/// Exactly one instance exists per system type (the [`KernelTraits::state`]
/// static, normally declared by a port's `use_port!` macro). The instance is
/// bound to whichever OS context calls [`System::init`]; the kernel is not
/// reentrant across OS threads.
pub struct State<Traits: KernelTraits> {
    /// The scheduler-lock flag. See [`crate::klock`].
    sched_lock: AtomicBool,

    /// Whether [`System::init`] has completed.
    initialized: SchedCell<Traits, bool>,

    /// The currently running task. `None` only before `init`.
    running_task: SchedCell<Traits, Option<TaskRef<Traits>>>,

    /// FIFO of Ready tasks, linked through [`TaskCb::link`].
    ///
    /// [`TaskCb::link`]: crate::task::TaskCb
    pub(crate) ready_queue: SchedCell<Traits, ListHead<TaskRef<Traits>>>,

    /// Tasks with a pending timeout, linked through [`TaskCb::timeout_link`]
    /// and sorted by wake tick.
    ///
    /// [`TaskCb::timeout_link`]: crate::task::TaskCb
    pub(crate) timeout_queue: SchedCell<Traits, ListHead<TaskRef<Traits>>>,

    /// The task record of the main task, i.e. the context that called `init`.
    /// It lives here because the main task runs on the environment's own
    /// stack rather than a caller-provided buffer.
    main_task: TaskCb<Traits>,
}

// Safety: The interior-mutable parts are only accessed while holding the
// scheduler lock (`SchedCell`) or through atomic operations (`sched_lock`);
// `main_task.saved_sp` is only touched by the dispatcher, which runs under
// the lock as well.
unsafe impl<Traits: KernelTraits> Sync for State<Traits> {}

impl<Traits: KernelTraits> State<Traits> {
    pub const fn new() -> Self {
        Self {
            sched_lock: AtomicBool::new(false),
            initialized: SchedCell::new(false),
            running_task: SchedCell::new(None),
            ready_queue: SchedCell::new(ListHead::new()),
            timeout_queue: SchedCell::new(ListHead::new()),
            main_task: Init::INIT,
        }
    }

    pub(crate) fn sched_lock(&self) -> &AtomicBool {
        &self.sched_lock
    }

    /// The currently running task.
    pub(crate) fn running_task(
        &self,
        lock: SchedTokenRefMut<'_, Traits>,
    ) -> Option<TaskRef<Traits>> {
        self.running_task.get(&*lock)
    }
}

impl<Traits: KernelTraits> Default for State<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> Init for State<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> fmt::Debug for State<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State")
            .field("initialized", &self.initialized)
            .field("running_task", &self.running_task)
            .field("main_task", &self.main_task)
            .finish_non_exhaustive()
    }
}

/// If the system is not initialized, return `Err(BadContext)`.
pub(crate) fn expect_task_context<Traits: KernelTraits>(
    lock: SchedTokenRefMut<'_, Traits>,
) -> Result<(), BadContextError> {
    if !Traits::state().initialized.get(&*lock) {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// One-time system initialization. Designates the calling context as the
    /// main task.
    ///
    /// Every other service returns `BadContext` until this has been called.
    /// All services, this one included, must be called from the same OS
    /// context from then on.
    pub fn init() -> Result<(), InitError> {
        let mut lock = klock::lock_sched::<Traits>()?;
        let state = Traits::state();

        if state.initialized.get(&*lock) {
            return Err(InitError::AlreadyInit);
        }

        let main = TaskRef::from_cb(&state.main_task);
        debug_assert_eq!(*state.main_task.st.read(&*lock), TaskSt::Dormant);
        state.main_task.st.replace(&mut *lock, TaskSt::Running);
        state.running_task.replace(&mut *lock, Some(main));
        state.initialized.replace(&mut *lock, true);

        Ok(())
    }

    /// The current tick count, as reported by the port's timer.
    pub fn time_ticks() -> Result<UTicks, TimeError> {
        let mut lock = klock::lock_sched::<Traits>()?;
        expect_task_context::<Traits>(lock.borrow_mut())?;
        Ok(Traits::tick_count())
    }
}

/// The dispatch loop, entered whenever the current task `cur` suspends (or
/// exits). Returns when `cur` is Running again; for a Zombie that never
/// happens and the loop runs on `cur`'s dying stack until it switches away
/// for good.
///
/// Steps, in order:
///
///  1. Move every task whose timeout has expired to the ready queue.
///  2. Pop the head of the ready queue and switch to it. Popping `cur`
///     itself means `cur` was made ready again (it yielded, or its timeout
///     fired during step 1); just return.
///  3. With nothing runnable, invoke the port's idle hook, bounded by the
///     earliest pending timeout, and start over.
pub(crate) fn dispatch<Traits: KernelTraits>(
    mut lock: SchedTokenRefMut<'_, Traits>,
    cur: TaskRef<Traits>,
) {
    loop {
        timeout::expire_timeouts(lock.borrow_mut());

        let next = {
            let mut accessor = task_link_accessor!(&Traits::state().ready_queue, lock.borrow_mut());
            accessor.pop_front()
        };

        if let Some(next) = next {
            next.cb().st.replace(&mut *lock, TaskSt::Running);
            if next == cur {
                return;
            }
            Traits::state().running_task.replace(&mut *lock, Some(next));

            // Safety: `next` is suspended (it was on the ready queue), so its
            // saved context is valid. Nothing else accesses `saved_sp` of a
            // task that is not running.
            let to = unsafe { (*next.cb().saved_sp.get()).take() }
                .expect("ready task has no saved context");

            // Safety: `cur.saved_sp` is writable and `to` is a valid
            // suspended context. The scheduler lock stays held across the
            // switch; whoever gains control owns it (see `crate::klock`).
            unsafe { arch::switch_context(cur.cb().saved_sp.get(), to) };

            // Somebody dispatched back to us: we are the running task again.
            debug_assert_eq!(*cur.cb().st.read(&*lock), TaskSt::Running);
            return;
        }

        // Nothing is runnable. Wait for the earliest timeout (or, with an
        // empty timer queue, for an adapter wakeup that will never come in a
        // pure-core system; that hang is the documented outcome of waiting
        // with no one left to signal).
        let limit = timeout::ticks_until_first(lock.borrow_mut());
        Traits::idle(limit);
    }
}
