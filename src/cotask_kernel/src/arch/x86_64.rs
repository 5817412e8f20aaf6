//! x86_64 System V context switching.
//!
//! A suspended context's stack looks like this (addresses grow upward):
//!
//! ```text
//! [sp + 48]  return address
//! [sp + 40]  rbp
//! [sp + 32]  rbx
//! [sp + 24]  r12
//! [sp + 16]  r13
//! [sp +  8]  r14
//! [sp +  0]  r15
//! ```
//!
//! The System V ABI aligns the stack to 16 bytes at every call site, so the
//! return address slot of a frame sits at `top - 8` with `top` 16-aligned;
//! after the seven slots above, the saved stack pointer is congruent to
//! 8 (mod 16), which is exactly what re-entering [`switch_context`] from the
//! other side expects.
use core::arch::naked_asm;

use super::{EntryShim, StackPointer, STACK_ALIGNMENT};

/// Push a value onto a downward-growing stack image.
///
/// # Safety
///
/// `sp` must point into a writable stack buffer with room below it.
unsafe fn push(sp: &mut usize, val: Option<usize>) {
    *sp -= core::mem::size_of::<usize>();
    // Safety: ensured by the caller
    unsafe {
        (*sp as *mut usize).write(val.unwrap_or(0));
    }
}

/// Save the current context, store its stack pointer through `from`, and
/// resume the context identified by `to`.
///
/// # Safety
///
/// `from` must be valid for writes. `to` must have been produced by
/// [`init_stack`] or by a previous save through `from`, on a stack buffer
/// that is still alive and not currently executing.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_context(from: *mut Option<StackPointer>, to: StackPointer) {
    naked_asm!(
        // RBX and RBP are LLVM-reserved registers, so they could not be
        // declared as clobbers even if this were ordinary inline assembly;
        // a naked routine has to save the full callee-saved set anyway.
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // Publish the suspended stack pointer.
        "mov [rdi], rsp",
        // Adopt the target context's stack.
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        // Return into the target context: either the instruction after its
        // own `switch_context` call, or `stack_entry_trampoline` for a
        // context that has never run.
        "ret",
    )
}

/// The first code a fresh context executes, entered by the final `ret` of
/// [`switch_context`]. At this point RSP is the 16-aligned stack top, R12
/// holds the entry shim's argument and R13 the entry shim itself.
#[unsafe(naked)]
unsafe extern "C" fn stack_entry_trampoline() {
    naked_asm!(
        "mov rdi, r12",
        // `call` (rather than `jmp`) keeps the ABI-mandated stack alignment:
        // the shim observes RSP ≡ 8 (mod 16) like any called function.
        "call r13",
        // The entry shim never returns.
        "ud2",
    )
}

/// Lay out an initial frame on a fresh stack so that switching to the
/// returned stack pointer enters `entry(arg)`.
///
/// # Safety
///
/// `top` must be the writable, [`STACK_ALIGNMENT`]-aligned top of a stack
/// buffer with room for the initial frame.
pub(crate) unsafe fn init_stack(top: StackPointer, entry: EntryShim, arg: *mut u8) -> StackPointer {
    let mut sp = top.get();
    debug_assert_eq!(sp % STACK_ALIGNMENT, 0);

    // Safety: ensured by the caller
    unsafe {
        push(&mut sp, Some(stack_entry_trampoline as usize)); // return address
        push(&mut sp, None); // rbp
        push(&mut sp, None); // rbx
        push(&mut sp, Some(arg as usize)); // r12
        push(&mut sp, Some(entry as usize)); // r13
        push(&mut sp, None); // r14
        push(&mut sp, None); // r15

        StackPointer::new_unchecked(sp)
    }
}
