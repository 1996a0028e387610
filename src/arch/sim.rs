//! Host simulation of the platform primitives.
//!
//! The simulation keeps a per-thread model of the single physical stack
//! (a byte array addressed like target RAM just below [`SIM_STACK_BASE`])
//! together with a simulated stack pointer and interrupt state. Stack
//! images are really copied between that array and the fibers' heap
//! buffers, so the scheduler's stack virtualization can be checked byte
//! for byte on the host.
//!
//! Control transfer is not simulated: `swap_context` and
//! `restore_register_context` update the simulated stack and counters,
//! then return to their caller. A test therefore "becomes" the fiber the
//! scheduler switched to when the call returns. A swap that discards its
//! caller never returns; it unwinds instead, and
//! [`SimPlatform::until_switched_away`] catches it.
//!
//! The idle primitive runs a test-supplied interrupt source (for example a
//! closure delivering a tick), standing in for the hardware interrupt that
//! would end the low-power wait.

extern crate std;

use super::{Platform, RegisterContext};
use std::boxed::Box;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::vec;
use std::vec::Vec;

/// Address just above the simulated physical stack.
pub const SIM_STACK_BASE: usize = 0x2000_4000;

/// Size of the simulated physical stack in bytes.
pub const SIM_STACK_SIZE: usize = 4096;

const SIM_STACK_LIMIT: usize = SIM_STACK_BASE - SIM_STACK_SIZE;

/// Upper bound on idle waits before the simulation assumes a deadlock.
const MAX_IDLE_WAITS: usize = 100_000;

/// Unwind payload of a switch that discarded its caller.
struct SwitchedAway;

/// Register context of a simulated fiber.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimContext {
    /// Simulated stack pointer at the last suspension point
    pub sp: usize,
    /// Launcher address of a prepared context
    pub launcher: usize,
    /// Launcher argument of a prepared context
    pub arg: usize,
}

impl RegisterContext for SimContext {
    fn stack_pointer(&self) -> usize {
        self.sp
    }

    fn prepare(&mut self, launcher: usize, arg: usize, stack_pointer: usize) {
        self.sp = stack_pointer;
        self.launcher = launcher;
        self.arg = arg;
    }
}

struct SimState {
    memory: Vec<u8>,
    sp: usize,
    interrupts_enabled: bool,
    interrupt_depth: usize,
    idle_waits: usize,
    swaps: usize,
    snapshots: usize,
    restores: usize,
    interrupt_source: Option<Box<dyn FnMut()>>,
}

impl SimState {
    fn new() -> Self {
        Self {
            memory: vec![0; SIM_STACK_SIZE],
            sp: SIM_STACK_BASE,
            interrupts_enabled: true,
            interrupt_depth: 0,
            idle_waits: 0,
            swaps: 0,
            snapshots: 0,
            restores: 0,
            interrupt_source: None,
        }
    }

    fn offset(addr: usize) -> usize {
        assert!(
            (SIM_STACK_LIMIT..=SIM_STACK_BASE).contains(&addr),
            "simulated stack address {:#x} out of range",
            addr
        );
        addr - SIM_STACK_LIMIT
    }

    /// Copy the live stack into the buffer ending at `stack_top`.
    unsafe fn copy_out(&self, stack_top: usize) {
        let depth = SIM_STACK_BASE - self.sp;
        let src = &self.memory[Self::offset(self.sp)..];
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), (stack_top - depth) as *mut u8, depth);
        }
    }

    /// Copy an image ending at `stack_top` back onto the stack at `sp`.
    unsafe fn copy_in(&mut self, sp: usize, stack_top: usize) {
        let depth = SIM_STACK_BASE - sp;
        let start = Self::offset(sp);
        let dst = &mut self.memory[start..];
        unsafe {
            core::ptr::copy_nonoverlapping((stack_top - depth) as *const u8, dst.as_mut_ptr(), depth);
        }
        self.sp = sp;
    }
}

std::thread_local! {
    static SIM: RefCell<SimState> = RefCell::new(SimState::new());
}

/// Simulated platform for host testing.
pub struct SimPlatform;

impl SimPlatform {
    /// Reset the simulated machine of the calling thread.
    pub fn reset() {
        SIM.with(|sim| *sim.borrow_mut() = SimState::new());
    }

    /// Move the simulated stack pointer.
    pub fn set_stack_pointer(sp: usize) {
        SimState::offset(sp);
        SIM.with(|sim| sim.borrow_mut().sp = sp);
    }

    /// Push `bytes` onto the simulated stack (word aligned) and return the
    /// new stack pointer.
    pub fn push(bytes: &[u8]) -> usize {
        SIM.with(|sim| {
            let mut sim = sim.borrow_mut();
            let padded = (bytes.len() + 3) & !3;
            let sp = sim.sp - padded;
            let start = SimState::offset(sp);
            sim.memory[start..start + bytes.len()].copy_from_slice(bytes);
            sim.sp = sp;
            sp
        })
    }

    /// The live stack `[SP, SIM_STACK_BASE)`.
    pub fn live_stack() -> Vec<u8> {
        SIM.with(|sim| {
            let sim = sim.borrow();
            sim.memory[SimState::offset(sim.sp)..].to_vec()
        })
    }

    /// Install the interrupt source run by every idle wait.
    pub fn on_idle(source: impl FnMut() + 'static) {
        SIM.with(|sim| sim.borrow_mut().interrupt_source = Some(Box::new(source)));
    }

    /// Run `f` as if it were an interrupt service routine.
    pub fn interrupt<R>(f: impl FnOnce() -> R) -> R {
        SIM.with(|sim| sim.borrow_mut().interrupt_depth += 1);
        let result = f();
        SIM.with(|sim| sim.borrow_mut().interrupt_depth -= 1);
        result
    }

    /// Run `f` as a fiber that ends by switching away without saving
    /// itself, as `release_fiber` does. Returns once that switch happened;
    /// the caller then continues as the fiber switched to.
    pub fn until_switched_away(f: impl FnOnce()) {
        match std::panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => panic!("fiber returned instead of switching away"),
            Err(payload) if payload.is::<SwitchedAway>() => {}
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Number of idle waits performed so far.
    pub fn idle_waits() -> usize {
        SIM.with(|sim| sim.borrow().idle_waits)
    }

    /// Number of `swap_context` calls performed so far.
    pub fn swaps() -> usize {
        SIM.with(|sim| sim.borrow().swaps)
    }

    /// Number of `save_context` snapshots taken so far.
    pub fn snapshots() -> usize {
        SIM.with(|sim| sim.borrow().snapshots)
    }

    /// Number of `restore_register_context` calls performed so far.
    pub fn restores() -> usize {
        SIM.with(|sim| sim.borrow().restores)
    }
}

impl Platform for SimPlatform {
    type Context = SimContext;

    unsafe fn save_register_context(ctx: *mut Self::Context) {
        let sp = Self::stack_pointer();
        unsafe { (*ctx).sp = sp };
    }

    unsafe fn restore_register_context(_ctx: *const Self::Context) {
        SIM.with(|sim| sim.borrow_mut().restores += 1);
    }

    unsafe fn save_context(ctx: *mut Self::Context, stack_top: usize) {
        SIM.with(|sim| {
            let mut sim = sim.borrow_mut();
            sim.snapshots += 1;
            unsafe {
                (*ctx).sp = sim.sp;
                sim.copy_out(stack_top);
            }
        });
    }

    unsafe fn swap_context(
        from: *mut Self::Context,
        to: *const Self::Context,
        from_stack: usize,
        to_stack: usize,
    ) {
        SIM.with(|sim| {
            let mut sim = sim.borrow_mut();
            sim.swaps += 1;
            unsafe {
                if !from.is_null() {
                    (*from).sp = sim.sp;
                    sim.copy_out(from_stack);
                }
                let sp = (*to).sp;
                sim.copy_in(sp, to_stack);
            }
        });

        if from.is_null() {
            // The caller was discarded: unwind it out of existence.
            std::panic::resume_unwind(Box::new(SwitchedAway));
        }
    }

    fn stack_base() -> usize {
        SIM_STACK_BASE
    }

    fn stack_pointer() -> usize {
        SIM.with(|sim| sim.borrow().sp)
    }

    fn in_interrupt_context() -> bool {
        SIM.with(|sim| sim.borrow().interrupt_depth > 0)
    }

    fn wait_for_interrupt() {
        let source = SIM.with(|sim| {
            let mut sim = sim.borrow_mut();
            sim.idle_waits += 1;
            assert!(
                sim.idle_waits <= MAX_IDLE_WAITS,
                "simulated idle loop never found runnable work"
            );
            sim.interrupt_source.take()
        });
        let Some(mut source) = source else {
            panic!("simulated idle wait with no interrupt source installed");
        };
        Self::interrupt(&mut source);
        SIM.with(|sim| {
            let mut sim = sim.borrow_mut();
            if sim.interrupt_source.is_none() {
                sim.interrupt_source = Some(source);
            }
        });
    }

    fn enable_interrupts() {
        SIM.with(|sim| sim.borrow_mut().interrupts_enabled = true);
    }

    fn disable_interrupts() {
        SIM.with(|sim| sim.borrow_mut().interrupts_enabled = false);
    }

    fn interrupts_enabled() -> bool {
        SIM.with(|sim| sim.borrow().interrupts_enabled)
    }
}
