#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![forbid(unreachable_pub)]

//! Cooperative fibers with virtualized stacks for single-core
//! microcontrollers.
//!
//! Every fiber runs on the one physical stack. On a context switch the
//! outgoing fiber's live stack is copied into a small heap buffer that
//! grows on demand, and the incoming fiber's copy is put back, trading
//! memcpy cycles for RAM. Interrupt handlers only splice scheduler queues,
//! so application logic never runs in interrupt context.
//!
//! # Target Platform
//!
//! - **Architecture**: ARMv6-M (Cortex-M0/M0+), single core
//! - **Environment**: Bare-metal with a global allocator
//! - **Host**: a simulated platform backs the unit tests
//!
//! # Features
//!
//! - `std-shim`: Export the host simulation platform outside of tests
//!
//! # Quick Start
//!
//! ```ignore
//! use vfiber::{DefaultPlatform, FiberScheduler, SchedulerConfig};
//!
//! static SCHEDULER: FiberScheduler<DefaultPlatform> =
//!     FiberScheduler::new(SchedulerConfig::DEFAULT);
//!
//! fn main() -> ! {
//!     SCHEDULER.register_global().ok();
//!     vfiber::scheduler_init().expect("scheduler init");
//!
//!     vfiber::create_fiber(blink).ok();
//!     loop {
//!         vfiber::schedule();
//!     }
//! }
//!
//! fn blink() {
//!     loop {
//!         toggle_led();
//!         vfiber::fiber_sleep(500);
//!     }
//! }
//!
//! // Timer interrupt, every `tick_period_ms`:
//! fn on_timer() {
//!     vfiber::scheduler_tick();
//! }
//! ```
//!
//! # Architecture
//!
//! - `arch`: register save/restore and stack copying per platform
//! - `fiber`: control blocks and pending-start records
//! - `sched`: the fiber arena and the run, sleep, wait and pool queues
//! - `kernel`: the scheduler core, sleep/wait and fork-on-block

// Core modules
pub mod arch;
pub mod config;
pub mod errors;
pub mod event;
pub mod fiber;
pub mod kernel;
pub mod mem;
pub mod sched;
pub mod time;

#[cfg(any(test, feature = "std-shim"))]
extern crate std;

extern crate alloc;

#[cfg(test)]
mod tests;

// Panic handler for bare-metal
#[cfg(all(target_os = "none", not(test), not(feature = "std-shim")))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    // On panic, disable interrupts and halt
    #[cfg(target_arch = "arm")]
    cortex_m::interrupt::disable();
    loop {
        #[cfg(target_arch = "arm")]
        cortex_m::asm::wfi();
    }
}

// ============================================================================
// Public API
// ============================================================================

// Platform abstraction
#[cfg(any(test, feature = "std-shim", all(target_arch = "arm", target_os = "none")))]
pub use arch::DefaultPlatform;
pub use arch::{InterruptGuard, Platform, RegisterContext};

// Scheduler
pub use kernel::{FiberRuntime, FiberScheduler, SchedulerFlags, SchedulerStats};

// Fibers
pub use fiber::{EntryFn, FiberFlags, FiberId, FiberInfo, Launch};

// Events
pub use event::{Event, EventBus, EVENT_ID_ANY, EVENT_VALUE_ANY};

// Configuration
pub use config::SchedulerConfig;

// Errors
pub use errors::{FiberError, FiberResult};

// ============================================================================
// Convenience Functions
// ============================================================================
//
// These operate on the scheduler registered with
// `FiberScheduler::register_global`.

/// Initialize the global scheduler, making the caller the main fiber.
pub fn scheduler_init() -> FiberResult<()> {
    kernel::global_runtime()
        .ok_or(FiberError::NotInitialized)?
        .init()
}

/// Create a fiber running `entry`.
pub fn create_fiber(entry: fn()) -> FiberResult<FiberId> {
    spawn(Launch::new(entry))
}

/// Create a fiber running `entry(param)`.
pub fn create_fiber_param(entry: fn(usize), param: usize) -> FiberResult<FiberId> {
    spawn(Launch::with_param(entry, param))
}

/// Create a fiber from a full launch record (entry, parameter, completion).
pub fn spawn(launch: Launch) -> FiberResult<FiberId> {
    kernel::global_runtime()
        .ok_or(FiberError::NotInitialized)?
        .spawn(launch)
}

/// Yield to the next runnable fiber.
#[inline]
pub fn schedule() {
    if let Some(runtime) = kernel::global_runtime() {
        runtime.schedule();
    }
}

/// Block the calling fiber for at least `ms` milliseconds.
pub fn fiber_sleep(ms: u32) {
    if let Some(runtime) = kernel::global_runtime() {
        runtime.fiber_sleep(ms);
    }
}

/// Block the calling fiber until an event matching `(id, value)` arrives.
pub fn fiber_wait_for_event(id: u16, value: u16) {
    if let Some(runtime) = kernel::global_runtime() {
        runtime.fiber_wait_for_event(id, value);
    }
}

/// Run `entry` inline, materializing a fiber only if it blocks.
pub fn fork_on_block(entry: fn()) {
    match kernel::global_runtime() {
        Some(runtime) => runtime.fork_on_block(Launch::new(entry)),
        None => entry(),
    }
}

/// Run `entry(param)` inline, materializing a fiber only if it blocks.
pub fn fork_on_block_param(entry: fn(usize), param: usize) {
    match kernel::global_runtime() {
        Some(runtime) => runtime.fork_on_block(Launch::with_param(entry, param)),
        None => entry(param),
    }
}

/// Terminate the calling fiber.
pub fn release_fiber() -> ! {
    match kernel::global_runtime() {
        Some(runtime) => runtime.release_fiber(),
        None => loop {
            core::hint::spin_loop();
        },
    }
}

/// Timer interrupt hook.
#[inline]
pub fn scheduler_tick() {
    if let Some(runtime) = kernel::global_runtime() {
        runtime.scheduler_tick();
    }
}

/// Event delivery hook.
pub fn scheduler_event(evt: Event) {
    if let Some(runtime) = kernel::global_runtime() {
        runtime.scheduler_event(evt);
    }
}

/// Milliseconds since the global scheduler was initialized.
pub fn ticks() -> u32 {
    kernel::global_runtime().map_or(0, |runtime| runtime.ticks())
}
