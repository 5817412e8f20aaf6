//! Hosted environment port for the `cotask_kernel` crate.
//!
//! Supplies the two platform shims the kernel needs on a desktop OS:
//!
//!  - a monotonic tick counter derived from [`Instant`], one tick per
//!    microsecond;
//!  - an idle hook that parks the scheduler's thread on a [`Condvar`] until
//!    the next kernel deadline, or until [`wake`]d by another thread (the
//!    hook I/O adapters use to hand completions to the scheduler).
//!
//! [`use_port!`] ties both to a fresh system type:
//!
//! ```
//! cotask_port_std::use_port!(struct SystemTraits);
//! type System = cotask_kernel::System<SystemTraits>;
//!
//! System::init().unwrap();
//! ```
//!
//! [`wake`]: IdleGate::wake
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use cotask_kernel::UTicks;
use once_cell::sync::Lazy;

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate cotask_kernel;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate env_logger;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate log;

/// The tick frequency of this port: one tick per microsecond.
///
/// The kernel's timeout window is half the 32-bit tick range, so a single
/// bounded wait may span up to about 35 minutes. The counter itself may wrap
/// freely; the kernel only looks at differences.
pub const TICKS_PER_SECOND: UTicks = 1_000_000;

static ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

/// The current tick count, counting microseconds from an unspecified origin
/// and wrapping at `u32::MAX`.
pub fn tick_count() -> UTicks {
    ORIGIN.elapsed().as_micros() as UTicks
}

/// The blocking half of the port: a latching wakeup flag with a [`Condvar`]
/// behind it.
///
/// A [`wake`](Self::wake) that arrives while the scheduler is busy is not
/// lost: the next `idle` call consumes it and returns immediately.
pub struct IdleGate {
    woken: Mutex<bool>,
    condvar: Condvar,
}

impl IdleGate {
    pub const fn new() -> Self {
        Self {
            woken: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Block the calling thread for at most `limit` ticks (indefinitely for
    /// `None`), or until [`wake`](Self::wake) is called.
    pub fn idle(&self, limit: Option<UTicks>) {
        log::trace!("idle({limit:?})");
        let mut woken = self.woken.lock().unwrap();
        match limit {
            None => {
                while !*woken {
                    woken = self.condvar.wait(woken).unwrap();
                }
            }
            Some(ticks) => {
                let duration =
                    Duration::from_nanos(ticks as u64 * (1_000_000_000 / TICKS_PER_SECOND) as u64);
                let deadline = Instant::now() + duration;
                while !*woken {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = self.condvar.wait_timeout(woken, deadline - now).unwrap();
                    woken = guard;
                }
            }
        }
        *woken = false;
    }

    /// Interrupt an ongoing (or pre-arm the next) [`idle`](Self::idle) call.
    /// May be called from any thread.
    pub fn wake(&self) {
        log::trace!("wake");
        *self.woken.lock().unwrap() = true;
        self.condvar.notify_one();
    }
}

impl Default for IdleGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Define a system type driven by this port's clock and idle hook.
///
/// ```
/// cotask_port_std::use_port!(struct SystemTraits);
/// type System = cotask_kernel::System<SystemTraits>;
/// ```
///
/// The expansion also gives the type an inherent `wake()` function that
/// interrupts an ongoing idle period, for use by I/O adapter threads.
#[macro_export]
macro_rules! use_port {
    ($vis:vis struct $Traits:ident) => {
        $vis struct $Traits;

        impl $Traits {
            fn idle_gate() -> &'static $crate::IdleGate {
                static GATE: $crate::IdleGate = $crate::IdleGate::new();
                &GATE
            }

            /// Interrupt an ongoing idle period, e.g. from an I/O adapter
            /// thread that has marshalled a completion for the scheduler.
            #[allow(dead_code)]
            $vis fn wake() {
                Self::idle_gate().wake()
            }
        }

        // Safety: the tick counter counts microseconds from a fixed origin,
        // so it is monotonic modulo wrap-around.
        unsafe impl $crate::cotask_kernel::PortTimer for $Traits {
            const TICKS_PER_SECOND: $crate::cotask_kernel::UTicks = $crate::TICKS_PER_SECOND;

            fn tick_count() -> $crate::cotask_kernel::UTicks {
                $crate::tick_count()
            }

            fn idle(limit: Option<$crate::cotask_kernel::UTicks>) {
                Self::idle_gate().idle(limit)
            }
        }

        // Safety: the static below is this type's alone.
        unsafe impl $crate::cotask_kernel::KernelTraits for $Traits {
            fn state() -> &'static $crate::cotask_kernel::State<Self> {
                static STATE: $crate::cotask_kernel::State<$Traits> =
                    $crate::cotask_kernel::State::new();
                &STATE
            }
        }
    };
}
