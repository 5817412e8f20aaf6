//! AArch64 (AAPCS64) context switching.
//!
//! The callee-saved set is `x19`–`x28`, the frame pointer `x29`, the link
//! register `x30`, and the low halves of `v8`–`v15` (`d8`–`d15`): 20
//! doublewords, a 160-byte frame. SP must stay 16-aligned at all times, which
//! the frame size preserves.
//!
//! ```text
//! [sp + 152]  d15      [sp + 88]  x28
//! [sp + 144]  d14      [sp + 80]  x27
//! ...                  ...
//! [sp + 96]   d8       [sp + 16]  x19
//!                      [sp + 8]   x30
//!                      [sp + 0]   x29
//! ```
use core::arch::naked_asm;

use super::{EntryShim, StackPointer, STACK_ALIGNMENT};

const FRAME_SIZE: usize = 160;

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
        "stp x29, x30, [sp, #-160]!",
        "stp x19, x20, [sp, #16]",
        "stp x21, x22, [sp, #32]",
        "stp x23, x24, [sp, #48]",
        "stp x25, x26, [sp, #64]",
        "stp x27, x28, [sp, #80]",
        "stp d8, d9, [sp, #96]",
        "stp d10, d11, [sp, #112]",
        "stp d12, d13, [sp, #128]",
        "stp d14, d15, [sp, #144]",
        // Publish the suspended stack pointer.
        "mov x9, sp",
        "str x9, [x0]",
        // Adopt the target context's stack.
        "mov sp, x1",
        "ldp x19, x20, [sp, #16]",
        "ldp x21, x22, [sp, #32]",
        "ldp x23, x24, [sp, #48]",
        "ldp x25, x26, [sp, #64]",
        "ldp x27, x28, [sp, #80]",
        "ldp d8, d9, [sp, #96]",
        "ldp d10, d11, [sp, #112]",
        "ldp d12, d13, [sp, #128]",
        "ldp d14, d15, [sp, #144]",
        "ldp x29, x30, [sp], #160",
        // Return into the target context: either the instruction after its
        // own `switch_context` call, or `stack_entry_trampoline` for a
        // context that has never run.
        "ret",
    )
}

/// The first code a fresh context executes, entered by the final `ret` of
/// [`switch_context`]. At this point SP is the 16-aligned stack top, `x19`
/// holds the entry shim's argument and `x20` the entry shim itself.
#[unsafe(naked)]
unsafe extern "C" fn stack_entry_trampoline() {
    naked_asm!(
        "mov x0, x19",
        "blr x20",
        // The entry shim never returns.
        "brk #0x1",
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
    let sp = top.get() - FRAME_SIZE;
    debug_assert_eq!(sp % STACK_ALIGNMENT, 0);

    let frame = sp as *mut usize;
    // Safety: ensured by the caller
    unsafe {
        core::ptr::write_bytes(frame, 0, FRAME_SIZE / core::mem::size_of::<usize>());
        frame.add(1).write(stack_entry_trampoline as usize); // x30
        frame.add(2).write(arg as usize); // x19
        frame.add(3).write(entry as usize); // x20

        StackPointer::new_unchecked(sp)
    }
}
