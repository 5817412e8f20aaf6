//! Machine context primitives.
//!
//! A context is identified by a single stack pointer: suspending a context
//! pushes every callee-saved register onto its stack, so the stack pointer
//! value is all that needs to live in the task record. [`switch_context`] is
//! the classic save/swap pair collapsed into one routine: it saves the
//! calling context onto the current stack, publishes the resulting stack
//! pointer through `from`, and resumes `to`.
//!
//! [`init_stack`] forges a frame at the top of a fresh stack that looks
//! exactly like a context suspended inside [`switch_context`], except that
//! "returning" from it lands in a per-arch trampoline which calls the entry
//! shim with the argument planted in a callee-saved register.
use core::num::NonZeroUsize;

/// A pointer to the top of a suspended context's stack.
pub(crate) type StackPointer = NonZeroUsize;

/// The stack alignment required at a context boundary on all supported
/// targets.
pub(crate) const STACK_ALIGNMENT: usize = 16;

/// The function a fresh context starts executing. Must never return.
pub(crate) type EntryShim = unsafe extern "C" fn(*mut u8) -> !;

#[cfg(all(target_arch = "x86_64", not(windows)))]
#[path = "arch/x86_64.rs"]
mod imp;

#[cfg(target_arch = "aarch64")]
#[path = "arch/aarch64.rs"]
mod imp;

#[cfg(target_arch = "riscv64")]
#[path = "arch/riscv64.rs"]
mod imp;

#[cfg(not(any(
    all(target_arch = "x86_64", not(windows)),
    target_arch = "aarch64",
    target_arch = "riscv64",
)))]
compile_error!("context switching is not implemented for this target");

pub(crate) use self::imp::{init_stack, switch_context};
