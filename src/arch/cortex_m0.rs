//! ARMv6-M (Cortex-M0/M0+) platform implementation.
//!
//! The context-switch primitives are plain Thumb-1 routines following the
//! AAPCS: arguments arrive in r0-r3 and only r0-r3 are clobbered before the
//! register set has been captured. Stack images are copied a word at a time
//! between the physical stack and the fiber's buffer.
//!
//! Interrupt masking, the low-power wait and the register reads go through
//! the `cortex-m` crate; only the routines that must own the stack pointer
//! are hand-written.
//!
//! The physical stack base is taken from the `_stack_start` linker symbol
//! (as defined by `cortex-m-rt`), i.e. the initial main stack pointer.

use super::{Platform, RegisterContext};
use core::arch::global_asm;
use cortex_m::asm;
use cortex_m::interrupt;
use cortex_m::peripheral::scb::VectActive;
use cortex_m::peripheral::SCB;
use cortex_m::register::{msp, primask};

/// Saved register state of a Cortex-M0 fiber.
///
/// The field offsets are hard-coded in the assembly below:
/// r0-r12 at 0..52, SP at 52, LR at 56.
#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct CortexM0Context {
    pub r: [u32; 13],
    pub sp: u32,
    pub lr: u32,
}

impl RegisterContext for CortexM0Context {
    fn stack_pointer(&self) -> usize {
        self.sp as usize
    }

    fn prepare(&mut self, launcher: usize, arg: usize, stack_pointer: usize) {
        self.r = [0; 13];
        self.r[0] = arg as u32;
        self.sp = stack_pointer as u32;
        // Thumb function pointers already carry bit 0.
        self.lr = launcher as u32;
    }
}

extern "C" {
    fn vfiber_save_register_context(ctx: *mut CortexM0Context);
    fn vfiber_restore_register_context(ctx: *const CortexM0Context);
    fn vfiber_save_context(ctx: *mut CortexM0Context, stack_top: usize);
    fn vfiber_swap_context(
        from: *mut CortexM0Context,
        to: *const CortexM0Context,
        from_stack: usize,
        to_stack: usize,
    );

    static _stack_start: u32;
}

global_asm!(
    ".syntax unified",
    ".thumb",
    ".section .text.vfiber_context,\"ax\",%progbits",
    // void vfiber_save_register_context(ctx)
    ".global vfiber_save_register_context",
    ".type vfiber_save_register_context,%function",
    ".thumb_func",
    "vfiber_save_register_context:",
    "    str r0, [r0, #0]",
    "    str r1, [r0, #4]",
    "    str r2, [r0, #8]",
    "    str r3, [r0, #12]",
    "    str r4, [r0, #16]",
    "    str r5, [r0, #20]",
    "    str r6, [r0, #24]",
    "    str r7, [r0, #28]",
    "    mov r1, r8",
    "    str r1, [r0, #32]",
    "    mov r1, r9",
    "    str r1, [r0, #36]",
    "    mov r1, r10",
    "    str r1, [r0, #40]",
    "    mov r1, r11",
    "    str r1, [r0, #44]",
    "    mov r1, r12",
    "    str r1, [r0, #48]",
    "    mov r1, sp",
    "    str r1, [r0, #52]",
    "    mov r1, lr",
    "    str r1, [r0, #56]",
    "    bx lr",
    // void vfiber_restore_register_context(ctx)
    ".global vfiber_restore_register_context",
    ".type vfiber_restore_register_context,%function",
    ".thumb_func",
    "vfiber_restore_register_context:",
    "    ldr r1, [r0, #32]",
    "    mov r8, r1",
    "    ldr r1, [r0, #36]",
    "    mov r9, r1",
    "    ldr r1, [r0, #40]",
    "    mov r10, r1",
    "    ldr r1, [r0, #44]",
    "    mov r11, r1",
    "    ldr r1, [r0, #48]",
    "    mov r12, r1",
    "    ldr r1, [r0, #52]",
    "    mov sp, r1",
    "    ldr r1, [r0, #56]",
    "    mov lr, r1",
    "    ldr r4, [r0, #16]",
    "    ldr r5, [r0, #20]",
    "    ldr r6, [r0, #24]",
    "    ldr r7, [r0, #28]",
    "    ldr r1, [r0, #4]",
    "    ldr r2, [r0, #8]",
    "    ldr r3, [r0, #12]",
    "    ldr r0, [r0, #0]",
    "    bx lr",
    // void vfiber_save_context(ctx, stack_top)
    ".global vfiber_save_context",
    ".type vfiber_save_context,%function",
    ".thumb_func",
    "vfiber_save_context:",
    "    str r0, [r0, #0]",
    "    str r1, [r0, #4]",
    "    str r2, [r0, #8]",
    "    str r3, [r0, #12]",
    "    str r4, [r0, #16]",
    "    str r5, [r0, #20]",
    "    str r6, [r0, #24]",
    "    str r7, [r0, #28]",
    "    mov r2, r8",
    "    str r2, [r0, #32]",
    "    mov r2, r9",
    "    str r2, [r0, #36]",
    "    mov r2, r10",
    "    str r2, [r0, #40]",
    "    mov r2, r11",
    "    str r2, [r0, #44]",
    "    mov r2, r12",
    "    str r2, [r0, #48]",
    "    mov r2, sp",
    "    str r2, [r0, #52]",
    "    mov r2, lr",
    "    str r2, [r0, #56]",
    "    ldr r2, =_stack_start",
    "    mov r3, sp",
    "1:",
    "    cmp r2, r3",
    "    beq 2f",
    "    subs r2, #4",
    "    subs r1, #4",
    "    ldr r0, [r2]",
    "    str r0, [r1]",
    "    b 1b",
    "2:",
    "    bx lr",
    // void vfiber_swap_context(from, to, from_stack, to_stack)
    ".global vfiber_swap_context",
    ".type vfiber_swap_context,%function",
    ".thumb_func",
    "vfiber_swap_context:",
    "    cmp r0, #0",
    "    beq 3f",
    "    str r4, [r0, #16]",
    "    str r5, [r0, #20]",
    "    str r6, [r0, #24]",
    "    str r7, [r0, #28]",
    "    mov r4, r8",
    "    str r4, [r0, #32]",
    "    mov r4, r9",
    "    str r4, [r0, #36]",
    "    mov r4, r10",
    "    str r4, [r0, #40]",
    "    mov r4, r11",
    "    str r4, [r0, #44]",
    "    mov r4, r12",
    "    str r4, [r0, #48]",
    "    mov r4, sp",
    "    str r4, [r0, #52]",
    "    mov r4, lr",
    "    str r4, [r0, #56]",
    // copy out [sp, base) to the buffer ending at from_stack
    "    ldr r5, =_stack_start",
    "    mov r6, sp",
    "1:",
    "    cmp r5, r6",
    "    beq 3f",
    "    subs r5, #4",
    "    subs r2, #4",
    "    ldr r7, [r5]",
    "    str r7, [r2]",
    "    b 1b",
    // copy in the image of `to` down to its saved sp
    "3:",
    "    ldr r5, =_stack_start",
    "    ldr r6, [r1, #52]",
    "4:",
    "    cmp r5, r6",
    "    beq 5f",
    "    subs r5, #4",
    "    subs r3, #4",
    "    ldr r7, [r3]",
    "    str r7, [r5]",
    "    b 4b",
    "5:",
    "    ldr r4, [r1, #32]",
    "    mov r8, r4",
    "    ldr r4, [r1, #36]",
    "    mov r9, r4",
    "    ldr r4, [r1, #40]",
    "    mov r10, r4",
    "    ldr r4, [r1, #44]",
    "    mov r11, r4",
    "    ldr r4, [r1, #48]",
    "    mov r12, r4",
    "    ldr r4, [r1, #52]",
    "    mov sp, r4",
    "    ldr r4, [r1, #56]",
    "    mov lr, r4",
    "    ldr r0, [r1, #0]",
    "    ldr r4, [r1, #16]",
    "    ldr r5, [r1, #20]",
    "    ldr r6, [r1, #24]",
    "    ldr r7, [r1, #28]",
    "    ldr r1, [r1, #4]",
    "    bx lr",
    ".ltorg",
);

/// Cortex-M0 platform.
pub struct CortexM0;

// The context wrappers must not build frames of their own: a snapshot has to
// capture the SP and LR of the caller, whose frame stays live until the
// matching restore.
impl Platform for CortexM0 {
    type Context = CortexM0Context;

    #[inline(always)]
    unsafe fn save_register_context(ctx: *mut Self::Context) {
        unsafe { vfiber_save_register_context(ctx) }
    }

    #[inline(always)]
    unsafe fn restore_register_context(ctx: *const Self::Context) {
        unsafe { vfiber_restore_register_context(ctx) }
    }

    #[inline(always)]
    unsafe fn save_context(ctx: *mut Self::Context, stack_top: usize) {
        unsafe { vfiber_save_context(ctx, stack_top) }
    }

    #[inline(always)]
    unsafe fn swap_context(
        from: *mut Self::Context,
        to: *const Self::Context,
        from_stack: usize,
        to_stack: usize,
    ) {
        unsafe { vfiber_swap_context(from, to, from_stack, to_stack) }
    }

    fn stack_base() -> usize {
        unsafe { core::ptr::addr_of!(_stack_start) as usize }
    }

    fn stack_pointer() -> usize {
        // Fibers only ever run on the main stack.
        msp::read() as usize
    }

    fn in_interrupt_context() -> bool {
        SCB::vect_active() != VectActive::ThreadMode
    }

    fn wait_for_interrupt() {
        asm::wfi();
    }

    fn enable_interrupts() {
        // SAFETY: callers only re-enable interrupts they masked themselves,
        // or start a fresh fiber, which always runs unmasked.
        unsafe { interrupt::enable() }
    }

    fn disable_interrupts() {
        interrupt::disable();
    }

    fn interrupts_enabled() -> bool {
        primask::read().is_active()
    }
}
