//! RV64 context switching.
//!
//! The callee-saved set is `ra`, `s0`–`s11`, and (with the D extension)
//! `fs0`–`fs11`. The frame is padded to keep SP 16-aligned per the psABI.
//!
//! ```text
//! with D:                        without D:
//! [sp + 192]  fs11
//! ...
//! [sp + 104]  fs0
//! [sp + 96]   s11                [sp + 96]   s11
//! ...                            ...
//! [sp + 8]    s0                 [sp + 8]    s0
//! [sp + 0]    ra                 [sp + 0]    ra
//! ```
use core::arch::naked_asm;

use super::{EntryShim, StackPointer, STACK_ALIGNMENT};

#[cfg(target_feature = "d")]
const FRAME_SIZE: usize = 208;
#[cfg(not(target_feature = "d"))]
const FRAME_SIZE: usize = 112;

/// Save the current context, store its stack pointer through `from`, and
/// resume the context identified by `to`.
///
/// # Safety
///
/// `from` must be valid for writes. `to` must have been produced by
/// [`init_stack`] or by a previous save through `from`, on a stack buffer
/// that is still alive and not currently executing.
#[cfg(target_feature = "d")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_context(from: *mut Option<StackPointer>, to: StackPointer) {
    naked_asm!(
        "addi sp, sp, -208",
        "sd ra, 0(sp)",
        "sd s0, 8(sp)",
        "sd s1, 16(sp)",
        "sd s2, 24(sp)",
        "sd s3, 32(sp)",
        "sd s4, 40(sp)",
        "sd s5, 48(sp)",
        "sd s6, 56(sp)",
        "sd s7, 64(sp)",
        "sd s8, 72(sp)",
        "sd s9, 80(sp)",
        "sd s10, 88(sp)",
        "sd s11, 96(sp)",
        "fsd fs0, 104(sp)",
        "fsd fs1, 112(sp)",
        "fsd fs2, 120(sp)",
        "fsd fs3, 128(sp)",
        "fsd fs4, 136(sp)",
        "fsd fs5, 144(sp)",
        "fsd fs6, 152(sp)",
        "fsd fs7, 160(sp)",
        "fsd fs8, 168(sp)",
        "fsd fs9, 176(sp)",
        "fsd fs10, 184(sp)",
        "fsd fs11, 192(sp)",
        // Publish the suspended stack pointer.
        "sd sp, 0(a0)",
        // Adopt the target context's stack.
        "mv sp, a1",
        "ld ra, 0(sp)",
        "ld s0, 8(sp)",
        "ld s1, 16(sp)",
        "ld s2, 24(sp)",
        "ld s3, 32(sp)",
        "ld s4, 40(sp)",
        "ld s5, 48(sp)",
        "ld s6, 56(sp)",
        "ld s7, 64(sp)",
        "ld s8, 72(sp)",
        "ld s9, 80(sp)",
        "ld s10, 88(sp)",
        "ld s11, 96(sp)",
        "fld fs0, 104(sp)",
        "fld fs1, 112(sp)",
        "fld fs2, 120(sp)",
        "fld fs3, 128(sp)",
        "fld fs4, 136(sp)",
        "fld fs5, 144(sp)",
        "fld fs6, 152(sp)",
        "fld fs7, 160(sp)",
        "fld fs8, 168(sp)",
        "fld fs9, 176(sp)",
        "fld fs10, 184(sp)",
        "fld fs11, 192(sp)",
        "addi sp, sp, 208",
        "ret",
    )
}

/// See the documented variant above; identical minus the FP register file.
#[cfg(not(target_feature = "d"))]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_context(from: *mut Option<StackPointer>, to: StackPointer) {
    naked_asm!(
        "addi sp, sp, -112",
        "sd ra, 0(sp)",
        "sd s0, 8(sp)",
        "sd s1, 16(sp)",
        "sd s2, 24(sp)",
        "sd s3, 32(sp)",
        "sd s4, 40(sp)",
        "sd s5, 48(sp)",
        "sd s6, 56(sp)",
        "sd s7, 64(sp)",
        "sd s8, 72(sp)",
        "sd s9, 80(sp)",
        "sd s10, 88(sp)",
        "sd s11, 96(sp)",
        "sd sp, 0(a0)",
        "mv sp, a1",
        "ld ra, 0(sp)",
        "ld s0, 8(sp)",
        "ld s1, 16(sp)",
        "ld s2, 24(sp)",
        "ld s3, 32(sp)",
        "ld s4, 40(sp)",
        "ld s5, 48(sp)",
        "ld s6, 56(sp)",
        "ld s7, 64(sp)",
        "ld s8, 72(sp)",
        "ld s9, 80(sp)",
        "ld s10, 88(sp)",
        "ld s11, 96(sp)",
        "addi sp, sp, 112",
        "ret",
    )
}

/// The first code a fresh context executes, entered by the final `ret` of
/// [`switch_context`]. At this point SP is the 16-aligned stack top, `s1`
/// holds the entry shim's argument and `s2` the entry shim itself.
#[unsafe(naked)]
unsafe extern "C" fn stack_entry_trampoline() {
    naked_asm!(
        "mv a0, s1",
        "jalr s2",
        // The entry shim never returns.
        "unimp",
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
        frame.write(stack_entry_trampoline as usize); // ra
        frame.add(2).write(arg as usize); // s1
        frame.add(3).write(entry as usize); // s2

        StackPointer::new_unchecked(sp)
    }
}
