//! Platform abstraction layer for context switching and interrupt control.
//!
//! The scheduler itself is portable: everything that touches registers,
//! the physical stack or the interrupt controller goes through the
//! [`Platform`] trait. Each target provides one implementation; the host
//! simulation in [`sim`] backs the unit tests.

use core::marker::PhantomData;

/// Saved register state of one suspended execution point.
///
/// The layout is private to the platform. The scheduler only needs to read
/// the captured stack pointer (to know how deep the saved stack image is)
/// and to synthesize the initial context of a fiber that has never run.
pub trait RegisterContext: Default + Send {
    /// Stack pointer captured at the last suspension point.
    fn stack_pointer(&self) -> usize;

    /// Set up a context that, when swapped in, calls `launcher(arg)` on an
    /// empty stack whose top is `stack_pointer`.
    fn prepare(&mut self, launcher: usize, arg: usize, stack_pointer: usize);
}

/// Platform abstraction trait.
///
/// All stack-copying primitives share one convention: the live stack of a
/// fiber is the region `[SP, stack_base())` of the single physical stack,
/// and its image is stored top-aligned in a buffer, i.e. in the
/// `stack_base() - SP` bytes just below the buffer's `stack_top` address.
///
/// # Safety
///
/// Implementations manipulate registers and the physical stack directly.
/// The context-switch primitives may return more than once (like
/// `setjmp`) or not at all; callers must uphold the preconditions listed
/// on each method.
pub trait Platform {
    /// Register context type saved for every fiber.
    type Context: RegisterContext;

    /// Capture the callee-visible register set of the calling context.
    ///
    /// # Safety
    ///
    /// - `ctx` must point to a valid context
    /// - A later `restore_register_context(ctx)` resumes execution as a
    ///   second return from this call, so the calling frame must still be
    ///   live and unmodified on the physical stack at that point
    unsafe fn save_register_context(ctx: *mut Self::Context);

    /// Resume the execution point captured by `save_register_context`.
    ///
    /// # Safety
    ///
    /// - `ctx` must hold a context captured by `save_register_context`
    ///   whose frame is still live on the physical stack
    unsafe fn restore_register_context(ctx: *const Self::Context);

    /// Capture the full context of the caller: registers plus a copy of
    /// the live stack into the buffer ending at `stack_top`.
    ///
    /// # Safety
    ///
    /// - `ctx` must point to a valid context
    /// - The buffer below `stack_top` must hold at least
    ///   `stack_base() - stack_pointer()` bytes
    /// - When the context is later swapped in, this call returns again
    unsafe fn save_context(ctx: *mut Self::Context, stack_top: usize);

    /// Two-phase switch: save the caller into `from` (stack image into the
    /// buffer ending at `from_stack`), restore `to` (image from the buffer
    /// ending at `to_stack` back onto the physical stack) and resume it.
    ///
    /// # Safety
    ///
    /// - A null `from` discards the caller's state; the call then never
    ///   returns
    /// - The `from` buffer must be large enough for the live stack
    /// - `to` must hold a saved or prepared context whose image lives
    ///   below `to_stack`
    /// - Must be called with interrupts disabled
    unsafe fn swap_context(
        from: *mut Self::Context,
        to: *const Self::Context,
        from_stack: usize,
        to_stack: usize,
    );

    /// Address just above the physical stack (its initial stack pointer).
    fn stack_base() -> usize;

    /// Current physical stack pointer.
    fn stack_pointer() -> usize;

    /// Whether the processor is executing an interrupt service routine.
    fn in_interrupt_context() -> bool;

    /// Enter low-power wait until an interrupt is pending.
    ///
    /// Called only when there is nothing to run, with interrupts masked, so
    /// a wake-up raised after the caller's last check still ends the wait.
    /// The pending handler runs once the caller unmasks.
    fn wait_for_interrupt();

    /// Enable interrupts on the current CPU.
    fn enable_interrupts();

    /// Disable interrupts on the current CPU.
    fn disable_interrupts();

    /// Check if interrupts are currently enabled.
    fn interrupts_enabled() -> bool;
}

/// RAII critical section: masks interrupts on creation and restores the
/// previous state on drop.
///
/// Scheduler state is only ever touched while one of these is alive, which
/// is the whole locking discipline on a single core.
pub struct InterruptGuard<P: Platform> {
    was_enabled: bool,
    _platform: PhantomData<fn() -> P>,
}

impl<P: Platform> InterruptGuard<P> {
    /// Mask interrupts, remembering whether they were enabled.
    #[inline]
    pub fn new() -> Self {
        let was_enabled = P::interrupts_enabled();
        P::disable_interrupts();
        Self {
            was_enabled,
            _platform: PhantomData,
        }
    }
}

impl<P: Platform> Drop for InterruptGuard<P> {
    #[inline]
    fn drop(&mut self) {
        if self.was_enabled {
            P::enable_interrupts();
        }
    }
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m0;

#[cfg(any(test, feature = "std-shim"))]
pub mod sim;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use cortex_m0::CortexM0 as DefaultPlatform;

#[cfg(all(
    any(test, feature = "std-shim"),
    not(all(target_arch = "arm", target_os = "none"))
))]
pub use sim::SimPlatform as DefaultPlatform;
