//! Scheduler configuration.

/// Default period of the scheduler tick, in milliseconds.
pub const DEFAULT_TICK_PERIOD_MS: u32 = 6;

/// Default size of the stack image given to a new fiber, in bytes.
///
/// At a cooperative switch point the live stack is normally tiny, so a
/// fiber starts with a buffer of a few words and grows it lazily.
pub const DEFAULT_INITIAL_STACK_BYTES: usize = 64;

/// Default rounding applied when a stack image has to grow, in bytes.
pub const DEFAULT_STACK_GRANULARITY: usize = 32;

/// Tunable parameters of a [`FiberScheduler`](crate::FiberScheduler).
///
/// All fields have `const` defaults so a scheduler can be declared in a
/// `static`:
///
/// ```ignore
/// static SCHEDULER: FiberScheduler<DefaultPlatform> =
///     FiberScheduler::new(SchedulerConfig::DEFAULT.with_tick_period(10));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Milliseconds added to the tick counter on every `scheduler_tick`.
    pub tick_period_ms: u32,
    /// Capacity of the stack image handed to newly created fibers.
    pub initial_stack_bytes: usize,
    /// Growth granularity of stack images. Must be a power of two.
    pub stack_granularity: usize,
}

impl SchedulerConfig {
    /// The default configuration: 6 ms ticks, 64 byte images, 32 byte growth.
    pub const DEFAULT: Self = Self {
        tick_period_ms: DEFAULT_TICK_PERIOD_MS,
        initial_stack_bytes: DEFAULT_INITIAL_STACK_BYTES,
        stack_granularity: DEFAULT_STACK_GRANULARITY,
    };

    /// Set the tick period in milliseconds.
    pub const fn with_tick_period(mut self, ms: u32) -> Self {
        self.tick_period_ms = ms;
        self
    }

    /// Set the initial stack image capacity in bytes.
    pub const fn with_initial_stack(mut self, bytes: usize) -> Self {
        self.initial_stack_bytes = bytes;
        self
    }

    /// Set the stack growth granularity. Non power-of-two values are
    /// rounded up to the next power of two.
    pub const fn with_stack_granularity(mut self, bytes: usize) -> Self {
        self.stack_granularity = bytes.next_power_of_two();
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
