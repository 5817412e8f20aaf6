//! Tasks
use core::{cell::UnsafeCell, fmt, mem, ops, ptr::NonNull, time::Duration};
use elain::Align;

use crate::{
    arch::{self, StackPointer, STACK_ALIGNMENT},
    error::{
        BadParamError, CreateError, GetCurrentTaskError, JoinError, SleepError, WaitTimeoutError,
        YieldError,
    },
    klock::{self, SchedCell, SchedTokenRefMut},
    state, timeout,
    utils::{intrusive_list::Link, Init},
    wait::{self, WaitQueue},
    KernelTraits, System,
};

/// The smallest stack buffer [`System::create`] accepts, over and above the
/// space reserved for the task record. This is a bare floor; entry functions
/// that call into `std` need far more.
pub const STACK_SIZE_MIN: usize = 1024;

/// *Task control block* - the state data of a task.
///
/// A task's control block lives at the aligned low end of the caller-provided
/// stack buffer; the rest of the buffer is the task's stack, growing downward
/// from the high end. The control block of the main task is the exception: it
/// is embedded in the kernel state, because the main task runs on the
/// environment's own stack.
#[repr(C)]
pub struct TaskCb<Traits: KernelTraits> {
    _align: Align<16>,

    /// The saved context of the task while it is not running, or `None` while
    /// it is. Written by the context-switch routine, which is why this is
    /// guaranteed to be placed at the beginning of the struct.
    pub(crate) saved_sp: UnsafeCell<Option<StackPointer>>,

    /// The entry point of the task.
    entry: fn(usize),

    /// The parameter supplied for `entry`.
    param: usize,

    pub(crate) st: SchedCell<Traits, TaskSt>,

    /// Allows the task to participate in one of the kernel's linked lists:
    /// the ready queue while Ready, or a single wait queue while Waiting.
    pub(crate) link: SchedCell<Traits, Option<Link<TaskRef<Traits>>>>,

    /// Participation in the timer queue, independent of `link`. `Some` iff
    /// the task has a pending timeout.
    pub(crate) timeout_link: SchedCell<Traits, Option<Link<TaskRef<Traits>>>>,

    /// The tick at which the pending timeout expires. Only meaningful while
    /// `timeout_link` is `Some`.
    pub(crate) wake_tick: SchedCell<Traits, timeout::Time32>,

    /// The wait queue the task is currently on, if any. Used by the timeout
    /// path to unlink the task when the timer fires first.
    pub(crate) waiting_on: SchedCell<Traits, Option<NonNull<WaitQueue<Traits>>>>,

    /// The result of the last wait operation. Set by a wake-upper.
    pub(crate) wait_result: SchedCell<Traits, Result<(), WaitTimeoutError>>,

    /// Tasks blocked in [`System::join`] against this task.
    pub(crate) joiners: WaitQueue<Traits>,
}

impl<Traits: KernelTraits> TaskCb<Traits> {
    fn new(entry: fn(usize), param: usize) -> Self {
        Self {
            entry,
            param,
            ..Init::INIT
        }
    }
}

fn noop_entry(_: usize) {}

impl<Traits: KernelTraits> Init for TaskCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        _align: Align::NEW,
        saved_sp: Init::INIT,
        entry: noop_entry,
        param: 0,
        st: SchedCell::new(TaskSt::Dormant),
        link: Init::INIT,
        timeout_link: Init::INIT,
        wake_tick: Init::INIT,
        waiting_on: Init::INIT,
        wait_result: SchedCell::new(Ok(())),
        joiners: WaitQueue::new(),
    };
}

impl<Traits: KernelTraits> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("st", &self.st)
            .finish_non_exhaustive()
    }
}

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskSt {
    /// The task record exists but is not scheduled. Only the main task is
    /// ever observed in this state, before `init`.
    Dormant,

    /// The task is on the ready queue.
    Ready,

    /// The task is the currently running task.
    Running,

    /// The task is on at most one wait queue and optionally on the timer
    /// queue.
    Waiting,

    /// The task has returned from its entry function. It remains joinable;
    /// its stack buffer is released by the caller, not by the kernel.
    Zombie,
}

impl Init for TaskSt {
    const INIT: Self = Self::Dormant;
}

/// A handle to a task.
///
/// The handle is the address of the task record, which is the aligned base of
/// the stack buffer passed to [`System::create`]; it remains valid until the
/// buffer's owner reclaims the buffer (which it may do once a `join` against
/// the task has returned).
pub struct TaskRef<Traits: KernelTraits>(NonNull<TaskCb<Traits>>);

// Safety: The pointee is only ever dereferenced while the scheduler lock is
// held, and the stack-ownership contract keeps it alive while the kernel can
// reach it.
unsafe impl<Traits: KernelTraits> Send for TaskRef<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for TaskRef<Traits> {}

impl<Traits: KernelTraits> Clone for TaskRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelTraits> Copy for TaskRef<Traits> {}

impl<Traits: KernelTraits> PartialEq for TaskRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: KernelTraits> Eq for TaskRef<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for TaskRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TaskRef").field(&self.0).finish()
    }
}

impl<Traits: KernelTraits> TaskRef<Traits> {
    pub(crate) fn from_cb(cb: &TaskCb<Traits>) -> Self {
        Self(NonNull::from(cb))
    }

    /// The raw task record address, i.e. the aligned base of the stack buffer
    /// the task was created on. Useful for smuggling a handle through a
    /// `usize` task parameter.
    pub fn as_raw(self) -> *mut u8 {
        self.0.as_ptr().cast()
    }

    /// Reconstitute a handle from [`TaskRef::as_raw`]'s value.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `as_raw` on a handle whose task record is
    /// still alive (its buffer not yet reclaimed by its owner).
    pub unsafe fn from_raw(ptr: *mut u8) -> Self {
        // Safety: `as_raw` never returns null
        Self(unsafe { NonNull::new_unchecked(ptr.cast()) })
    }

    /// Get the task control block.
    pub(crate) fn cb(self) -> &'static TaskCb<Traits> {
        // Safety: Every `TaskRef` reachable from kernel state points to a
        // live task record; the stack buffer holding it may not be reclaimed
        // until the task has been joined (see the `create` contract).
        unsafe { &*self.0.as_ptr() }
    }
}

pub(crate) use self::unsafe_static::UnsafeStatic;
mod unsafe_static {
    use super::*;

    /// A virtual container that resolves a [`TaskRef`] to its control block.
    pub(crate) struct UnsafeStatic {
        _nonexhaustive: (),
    }

    impl UnsafeStatic {
        /// Construct an `UnsafeStatic`.
        ///
        /// # Safety
        ///
        /// All pointees to be accessed through the constructed `UnsafeStatic`
        /// must be valid.
        #[inline]
        pub const unsafe fn new() -> &'static Self {
            &Self { _nonexhaustive: () }
        }
    }

    impl<Traits: KernelTraits> ops::Index<TaskRef<Traits>> for UnsafeStatic {
        type Output = TaskCb<Traits>;

        #[inline]
        fn index(&self, index: TaskRef<Traits>) -> &Self::Output {
            index.cb()
        }
    }
}

/// Get a `ListAccessorCell` used to access a task queue (the ready queue or a
/// wait queue) linked through [`TaskCb::link`].
macro_rules! task_link_accessor {
    ($head:expr, $key:expr) => {
        unsafe {
            $crate::utils::intrusive_list::ListAccessorCell::new(
                $head,
                // Safety: All elements are extant because a task record stays
                //     alive while it is linked into a kernel queue.
                $crate::task::UnsafeStatic::new(),
                |cb: &$crate::task::TaskCb<_>| &cb.link,
                $key,
            )
        }
    };
}
pub(crate) use task_link_accessor;

/// Get a `ListAccessorCell` used to access the timer queue, linked through
/// [`TaskCb::timeout_link`].
macro_rules! timeout_queue_accessor {
    ($head:expr, $key:expr) => {
        unsafe {
            $crate::utils::intrusive_list::ListAccessorCell::new(
                $head,
                // Safety: All elements are extant because a task record stays
                //     alive while it is linked into a kernel queue.
                $crate::task::UnsafeStatic::new(),
                |cb: &$crate::task::TaskCb<_>| &cb.timeout_link,
                $key,
            )
        }
    };
}
pub(crate) use timeout_queue_accessor;

/// These associated functions implement the task-related portion of the
/// public surface.
impl<Traits: KernelTraits> System<Traits> {
    /// Spawn a task on a caller-provided stack buffer.
    ///
    /// The task record is placed at the aligned low end of the buffer and the
    /// remainder becomes the task's stack, so `stack_len` must cover both
    /// (at least the record plus [`STACK_SIZE_MIN`]). The returned handle is
    /// the record's address.
    ///
    /// The new task is appended to the tail of the ready queue; the caller
    /// keeps running.
    ///
    /// # Safety
    ///
    /// `stack` must point to a writable buffer of `stack_len` bytes that is
    /// not used for anything else until [`System::join`] on the returned
    /// handle has returned. The buffer is *borrowed*, never freed, by the
    /// kernel.
    ///
    /// A panic that unwinds out of `entry` aborts the process: there is no
    /// unwinding across a context switch.
    pub unsafe fn create(
        stack: *mut u8,
        stack_len: usize,
        entry: fn(usize),
        param: usize,
    ) -> Result<TaskRef<Traits>, CreateError> {
        let mut lock = klock::lock_sched::<Traits>()?;
        state::expect_task_context::<Traits>(lock.borrow_mut())?;

        let base = stack as usize;
        let record_align = mem::align_of::<TaskCb<Traits>>();
        let cb_addr = base
            .checked_add(record_align - 1)
            .ok_or(BadParamError::BadParam)?
            & !(record_align - 1);
        let stack_lo = cb_addr + mem::size_of::<TaskCb<Traits>>();
        let top = base
            .checked_add(stack_len)
            .ok_or(BadParamError::BadParam)?
            & !(STACK_ALIGNMENT - 1);
        if top < stack_lo || top - stack_lo < STACK_SIZE_MIN {
            return Err(BadParamError::BadParam.into());
        }

        let cb_ptr = cb_addr as *mut TaskCb<Traits>;
        // Safety: `cb_ptr` is aligned and inside the caller's buffer
        unsafe { cb_ptr.write(TaskCb::new(entry, param)) };
        let task = TaskRef(
            // Safety: derived from a non-null buffer pointer
            unsafe { NonNull::new_unchecked(cb_ptr) },
        );

        // Safety: `top` is the aligned top of the usable stack region, which
        // we just checked is large enough
        let sp = unsafe {
            arch::init_stack(
                StackPointer::new_unchecked(top),
                task_entry_shim::<Traits>,
                cb_ptr.cast(),
            )
        };
        // Safety: the task is not running, so nothing else accesses `saved_sp`
        unsafe { *task.cb().saved_sp.get() = Some(sp) };

        // Safety: the task state was just initialized
        unsafe { make_ready(lock.borrow_mut(), task) };

        Ok(task)
    }

    /// Block until the given task has returned from its entry function.
    ///
    /// Returns immediately if it already has. Multiple tasks may join the
    /// same target; all of them are released when it exits, in the order
    /// they arrived.
    pub fn join(task: TaskRef<Traits>) -> Result<(), JoinError> {
        let mut lock = klock::lock_sched::<Traits>()?;
        state::expect_task_context::<Traits>(lock.borrow_mut())?;

        let cur = Traits::state().running_task(lock.borrow_mut()).unwrap();
        if cur == task {
            return Err(JoinError::WouldDeadlock);
        }

        if *task.cb().st.read(&*lock) == TaskSt::Zombie {
            return Ok(());
        }

        task.cb().joiners.wait(lock.borrow_mut());
        Ok(())
    }

    /// Relinquish the processor, placing the calling task behind every other
    /// currently ready task.
    pub fn yield_now() -> Result<(), YieldError> {
        let mut lock = klock::lock_sched::<Traits>()?;
        state::expect_task_context::<Traits>(lock.borrow_mut())?;

        let cur = Traits::state().running_task(lock.borrow_mut()).unwrap();
        // Safety: the task is Running, so its context is valid
        unsafe { make_ready(lock.borrow_mut(), cur) };
        state::dispatch(lock.borrow_mut(), cur);
        Ok(())
    }

    /// Block the calling task for at least the given duration.
    pub fn sleep(duration: Duration) -> Result<(), SleepError> {
        let time32 = timeout::time32_from_duration::<Traits>(duration)?;
        let mut lock = klock::lock_sched::<Traits>()?;
        state::expect_task_context::<Traits>(lock.borrow_mut())?;

        // Wait until woken up by the timeout
        match wait::wait_no_queue_timeout(lock.borrow_mut(), time32) {
            Ok(()) => unreachable!(),
            Err(WaitTimeoutError::Timeout) => Ok(()),
        }
    }

    /// Block the calling task for at least the given number of milliseconds.
    pub fn sleep_ms(ms: u32) -> Result<(), SleepError> {
        Self::sleep(Duration::from_millis(ms.into()))
    }

    /// Get the handle of the calling task.
    pub fn current_task() -> Result<TaskRef<Traits>, GetCurrentTaskError> {
        let mut lock = klock::lock_sched::<Traits>()?;
        state::expect_task_context::<Traits>(lock.borrow_mut())?;
        Ok(Traits::state().running_task(lock.borrow_mut()).unwrap())
    }
}

/// Transition the task into the Ready state and insert it at the tail of the
/// ready queue.
///
/// # Safety
///
/// The task must not currently be on any `link` queue, and its context must
/// be valid (initialized, and properly suspended or currently running).
pub(crate) unsafe fn make_ready<Traits: KernelTraits>(
    mut lock: SchedTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    task.cb().st.replace(&mut *lock, TaskSt::Ready);

    let mut accessor = task_link_accessor!(&Traits::state().ready_queue, lock);
    accessor.push_back(task);
}

/// The entry shim every task starts in, reached through the architecture's
/// entry trampoline.
unsafe extern "C" fn task_entry_shim<Traits: KernelTraits>(cb: *mut u8) -> ! {
    // The dispatcher that switched into this fresh context logically holds
    // the scheduler lock; release it before entering user code.
    // Safety: the lock flag is set, and the suspended dispatcher's guard is
    // frozen on another task's stack, not live on this one.
    drop(unsafe { klock::assume_sched_lock::<Traits>() });

    // Safety: `cb` is the pointer planted by `create`
    let cb = unsafe { &*cb.cast::<TaskCb<Traits>>() };
    (cb.entry)(cb.param);

    exit_current_task::<Traits>()
}

/// Transition the calling task to Zombie, release its joiners, and leave its
/// context forever.
fn exit_current_task<Traits: KernelTraits>() -> ! {
    // The task just returned from its entry function, so it cannot be inside
    // a kernel service and this cannot fail
    let mut lock = klock::lock_sched::<Traits>().unwrap();

    let cur = Traits::state().running_task(lock.borrow_mut()).unwrap();
    cur.cb().st.replace(&mut *lock, TaskSt::Zombie);
    cur.cb().joiners.wake_up_all(lock.borrow_mut());

    // Dispatch away for good. Nothing ever enqueues a Zombie, so control
    // cannot come back to this frame; the stack buffer stays untouched until
    // a joiner's `join` returns and its owner reclaims it.
    state::dispatch(lock.borrow_mut(), cur);
    unreachable!();
}
