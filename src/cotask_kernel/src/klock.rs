//! Kernel state locking mechanism
//!
//! Every piece of mutable kernel state is wrapped in a [`SchedCell`], which
//! can only be accessed while holding the scheduler lock. The lock is a plain
//! flag: the kernel is strictly cooperative and single-threaded, so the flag
//! never spins; it exists to brand cell accesses with a zero-sized token and
//! to catch reentry (e.g. a kernel service invoked from a foreign thread, or
//! from a context that is already inside the kernel).
//!
//! The lock is *held across context switches*: a task that suspends inside
//! the dispatcher leaves the flag set, and whichever task gains control next
//! either resumes inside its own dispatcher call (whose guard takes over the
//! flag) or, for a task entered for the first time, releases the flag in the
//! entry trampoline before running user code.
use core::{fmt, ops};
use core::sync::atomic::Ordering;
use tokenlock::UnsyncTokenLock;

use crate::{error::BadContextError, utils::intrusive_list::CellLike, utils::Init, KernelTraits};

pub(super) struct SchedTag<Traits>(Traits);

/// The key that "unlocks" [`SchedCell`].
pub(super) type SchedToken<Traits> = tokenlock::UnsyncSingletonToken<SchedTag<Traits>>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`SchedToken`].
pub(super) type SchedKeyhole<Traits> = tokenlock::SingletonTokenId<SchedTag<Traits>>;

/// Cell type that can be accessed by [`SchedToken`] (which can be obtained
/// by [`lock_sched`]).
pub(super) struct SchedCell<Traits, T: ?Sized>(UnsyncTokenLock<T, SchedKeyhole<Traits>>);

impl<Traits, T> SchedCell<Traits, T> {
    pub(super) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(SchedKeyhole::new(), x))
    }
}

impl<Traits: KernelTraits, T: fmt::Debug> fmt::Debug for SchedCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Ok(lock) = lock_sched::<Traits>() {
            f.write_str("SchedCell(")?;
            self.0.read(&*lock).fmt(f)?;
            f.write_str(")")
        } else {
            f.write_str("SchedCell(< locked >)")
        }
    }
}

impl<Traits, T: Init> Init for SchedCell<Traits, T> {
    const INIT: Self = Self(Init::INIT);
}

impl<Traits, T> ops::Deref for SchedCell<Traits, T> {
    type Target = UnsyncTokenLock<T, SchedKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits, T> ops::DerefMut for SchedCell<Traits, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<'a, Element: Clone, Traits: KernelTraits> CellLike<SchedTokenRefMut<'a, Traits>>
    for SchedCell<Traits, Element>
{
    type Target = Element;

    fn get(&self, key: &SchedTokenRefMut<'a, Traits>) -> Self::Target {
        self.0.read(&**key).clone()
    }
    fn set(&self, key: &mut SchedTokenRefMut<'a, Traits>, value: Self::Target) {
        *self.0.write(&mut **key) = value;
    }
}

/// Attempt to acquire the scheduler lock and get an RAII guard.
/// Return `BadContext` if the lock is already held.
pub(super) fn lock_sched<Traits: KernelTraits>() -> Result<SchedGuard<Traits>, BadContextError> {
    let state = Traits::state();
    if state
        .sched_lock()
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
    {
        // Safety: We just acquired the lock. This also means there are no
        //         instances of `SchedGuard` existing at this point.
        Ok(unsafe { assume_sched_lock() })
    } else {
        Err(BadContextError::BadContext)
    }
}

/// Assume the scheduler lock is held and get `SchedGuard`.
///
/// # Safety
///
/// The lock flag must really be set, and there must be no other live
/// instances of `SchedGuard` at the point of the call.
pub(super) unsafe fn assume_sched_lock<Traits: KernelTraits>() -> SchedGuard<Traits> {
    debug_assert!(Traits::state().sched_lock().load(Ordering::Relaxed));

    SchedGuard {
        // Safety: There are no other instances of `SchedToken`; this is
        //         upheld by the caller.
        token: unsafe { SchedToken::new_unchecked() },
    }
}

/// RAII guard for the scheduler lock.
///
/// [`SchedToken`] can be borrowed from this type.
pub(super) struct SchedGuard<Traits: KernelTraits> {
    token: SchedToken<Traits>,
}

impl<Traits: KernelTraits> SchedGuard<Traits> {
    /// Construct a [`SchedTokenRefMut`] by borrowing `self`.
    pub(super) fn borrow_mut(&mut self) -> SchedTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: KernelTraits> Drop for SchedGuard<Traits> {
    fn drop(&mut self) {
        Traits::state().sched_lock().store(false, Ordering::Release);
    }
}

impl<Traits: KernelTraits> ops::Deref for SchedGuard<Traits> {
    type Target = SchedToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: KernelTraits> ops::DerefMut for SchedGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Borrowed version of [`SchedGuard`]. This is equivalent to
/// `&'a mut SchedGuard` but does not consume memory.
///
///  - Always prefer this over `&mut SchedGuard` in function parameters.
///  - When you pass `&'a mut _` to a function, the compiler automatically
///    reborrows it as `&'b mut _` so that the original `&'a mut _` remains
///    accessible after the function call. This does not happen with
///    `SchedTokenRefMut`. You have to call [`borrow_mut`] manually.
///
/// [`borrow_mut`]: tokenlock::UnsyncSingletonTokenRefMut::borrow_mut
pub(super) type SchedTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, SchedTag<Traits>>;
