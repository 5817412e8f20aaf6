//! A stackful cooperative multitasking kernel.
//!
//! The kernel multiplexes many *tasks* (ordinary straight-line functions
//! that occasionally block) onto a single execution context. There is no
//! preemption: a task runs until it calls one of the suspending services
//! ([`System::yield_now`], [`System::sleep`], [`System::join`],
//! [`Mutex::lock`] under contention, [`Event::wait`],
//! [`Event::wait_timeout`]), at which point the dispatcher switches to the
//! next ready task, FIFO among peers.
//!
//! The kernel allocates nothing: every task runs on a caller-provided stack
//! buffer whose low end doubles as the task record, and all queues are
//! intrusive lists threaded through those records.
//!
//! # Ports
//!
//! The kernel is portable over [`PortTimer`], which supplies a monotonic,
//! wrapping tick counter and an idle hook, and over [`KernelTraits`], which
//! roots the per-system [`State`] singleton. A hosted port normally wraps
//! both behind a `use_port!`-style macro:
//!
//! ```ignore
//! cotask_port_std::use_port!(struct SystemTraits);
//! type System = cotask_kernel::System<SystemTraits>;
//!
//! System::init().unwrap();
//! ```
//!
//! One system is bound to one OS context; driving it from more than one OS
//! thread is rejected with `BadContext` at best and is never memory-unsafe.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

use core::marker::PhantomData;

mod arch;
mod error;
mod event;
mod klock;
mod mutex;
mod state;
mod task;
mod timeout;
mod utils;
mod wait;

pub use crate::{
    error::{
        CreateError, GetCurrentTaskError, InitError, JoinError, LockMutexError, QueryMutexError,
        SleepError, TimeError, UnlockMutexError, UpdateEventError, WaitEventError,
        WaitEventTimeoutError, YieldError,
    },
    event::Event,
    mutex::Mutex,
    state::State,
    task::{TaskCb, TaskRef, STACK_SIZE_MIN},
};

/// Unsigned integer type representing a tick count.
pub type UTicks = u32;

/// Provides the monotonic clock and the idle hook the kernel is built on.
///
/// # Safety
///
/// `tick_count` must be monotonic modulo wrap-around: between two calls from
/// the kernel, it must advance by the number of elapsed ticks, which the
/// kernel assumes stays well under half the tick range. Violating this
/// derails timeout ordering (but not memory safety).
pub unsafe trait PortTimer: Sized + 'static {
    /// The number of ticks per second, e.g. `1_000_000` for a microsecond
    /// tick.
    const TICKS_PER_SECOND: UTicks;

    /// The current tick count. Wraps around at `UTicks::MAX`.
    fn tick_count() -> UTicks;

    /// Called by the dispatcher when no task is ready. Should block for at
    /// most `limit` ticks (indefinitely for `None`), or until an
    /// asynchronous wakeup arranged by an adapter. Spurious returns are
    /// fine; the dispatcher re-checks and idles again.
    fn idle(limit: Option<UTicks>);
}

/// Binds a [`PortTimer`] to the per-system [`State`] singleton.
///
/// # Safety
///
/// `state` must return the same instance on every call, and that instance
/// must not be shared with any other system type.
pub unsafe trait KernelTraits: PortTimer {
    fn state() -> &'static State<Self>;
}

/// The facade through which all task-level services of a system are invoked.
///
/// This type is never instantiated; it only carries the system type:
///
/// ```ignore
/// type System = cotask_kernel::System<SystemTraits>;
/// System::init().unwrap();
/// ```
pub struct System<Traits: KernelTraits>(PhantomData<fn() -> Traits>);

#[cfg(test)]
mod test_support {
    /// Define a system type backed by a manually advanced clock, for kernel
    /// unit tests. Each test must define its own type so that tests stay
    /// isolated when the harness runs them on separate threads.
    macro_rules! define_test_traits {
        (struct $Traits:ident) => {
            struct $Traits;

            #[allow(dead_code)]
            impl $Traits {
                fn clock() -> &'static std::sync::atomic::AtomicU32 {
                    static CLOCK: std::sync::atomic::AtomicU32 =
                        std::sync::atomic::AtomicU32::new(0);
                    &CLOCK
                }

                /// Advance the mock clock by `ticks`.
                fn advance(ticks: u32) {
                    Self::clock().fetch_add(ticks, std::sync::atomic::Ordering::Relaxed);
                }
            }

            unsafe impl $crate::PortTimer for $Traits {
                const TICKS_PER_SECOND: $crate::UTicks = 1_000;

                fn tick_count() -> $crate::UTicks {
                    Self::clock().load(std::sync::atomic::Ordering::Relaxed)
                }

                fn idle(_limit: Option<$crate::UTicks>) {
                    unreachable!("the mock port never idles");
                }
            }

            unsafe impl $crate::KernelTraits for $Traits {
                fn state() -> &'static $crate::State<Self> {
                    static STATE: $crate::State<$Traits> = $crate::State::new();
                    &STATE
                }
            }
        };
    }
    pub(crate) use define_test_traits;
}
