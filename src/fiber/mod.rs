//! Fiber control blocks.
//!
//! A fiber is the schedulable unit: its saved register context, the heap
//! buffer holding its stack image, the scheduler tag (wake tick or encoded
//! event), role flags and intrusive queue linkage. Records live in the
//! scheduler's [`FiberTable`](crate::sched::FiberTable) and are addressed
//! by [`FiberId`].

use crate::arch::RegisterContext;
use crate::mem::StackImage;
use crate::sched::QueueId;
use core::num::NonZeroUsize;
use core::ops::{BitOr, BitOrAssign};

/// Stable handle of a fiber record.
///
/// Ids are never zero. Records are recycled through the pool, so an id
/// names a slot, not one particular run of an entry function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(NonZeroUsize);

impl FiberId {
    /// Id of the record stored at `index` in the table.
    pub(crate) fn from_index(index: usize) -> Self {
        match NonZeroUsize::new(index + 1) {
            Some(id) => Self(id),
            None => unreachable!("fiber table index overflow"),
        }
    }

    /// Table index of this record.
    pub(crate) fn index(self) -> usize {
        self.0.get() - 1
    }

    /// Get the raw ID value.
    pub fn get(self) -> usize {
        self.0.get()
    }
}

impl core::fmt::Display for FiberId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role flags of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FiberFlags(u8);

impl FiberFlags {
    pub const NONE: Self = Self(0);
    /// Executing a handler optimistically on behalf of `fork_on_block`.
    pub const FORK_ON_BLOCK: Self = Self(0x01);
    /// Continuation point of a fork-on-block whose handler blocked.
    pub const PARENT: Self = Self(0x02);
    /// The materialized handler body of a fork-on-block.
    pub const CHILD: Self = Self(0x04);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for FiberFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for FiberFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Entry point of a fiber, with or without its untyped parameter.
#[derive(Debug, Clone, Copy)]
pub enum EntryFn {
    Plain(fn()),
    Param(fn(usize)),
}

impl EntryFn {
    /// Invoke the function, passing `param` if it takes one.
    pub fn call(self, param: usize) {
        match self {
            EntryFn::Plain(f) => f(),
            EntryFn::Param(f) => f(param),
        }
    }
}

impl From<fn()> for EntryFn {
    fn from(f: fn()) -> Self {
        EntryFn::Plain(f)
    }
}

impl From<fn(usize)> for EntryFn {
    fn from(f: fn(usize)) -> Self {
        EntryFn::Param(f)
    }
}

/// Pending-start record of a fiber that has not run yet.
///
/// The trampoline runs `entry(param)`, then `completion(param)` if set,
/// then releases the fiber.
#[derive(Debug, Clone, Copy)]
pub struct Launch {
    pub entry: EntryFn,
    pub param: usize,
    pub completion: Option<EntryFn>,
}

impl Launch {
    /// Launch a parameterless entry function.
    pub fn new(entry: fn()) -> Self {
        Self {
            entry: EntryFn::Plain(entry),
            param: 0,
            completion: None,
        }
    }

    /// Launch an entry function taking `param`.
    pub fn with_param(entry: fn(usize), param: usize) -> Self {
        Self {
            entry: EntryFn::Param(entry),
            param,
            completion: None,
        }
    }

    /// Run `completion` after the entry function returns.
    pub fn completion(mut self, completion: impl Into<EntryFn>) -> Self {
        self.completion = Some(completion.into());
        self
    }

    /// Run the entry function and then the completion.
    pub fn run(self) {
        self.entry.call(self.param);
        if let Some(completion) = self.completion {
            completion.call(self.param);
        }
    }
}

/// Fiber control block.
pub struct Fiber<C> {
    /// Registers captured at the last suspension point
    pub(crate) regs: C,
    /// Heap copy of the fiber's stack while it is switched out
    pub(crate) stack: StackImage,
    /// Wake tick while sleeping, encoded event while waiting
    pub(crate) context: u32,
    pub(crate) flags: FiberFlags,
    /// Queue this fiber is linked on
    pub(crate) queue: Option<QueueId>,
    pub(crate) next: Option<FiberId>,
    pub(crate) prev: Option<FiberId>,
    /// Present until the fiber first runs
    pub(crate) launch: Option<Launch>,
}

impl<C: RegisterContext> Fiber<C> {
    /// A blank, unqueued record without a stack buffer.
    pub fn new() -> Self {
        Self {
            regs: C::default(),
            stack: StackImage::empty(),
            context: 0,
            flags: FiberFlags::NONE,
            queue: None,
            next: None,
            prev: None,
            launch: None,
        }
    }

    /// Clear everything but the stack buffer and queue linkage, ready for
    /// reuse from the pool.
    pub(crate) fn reset(&mut self) {
        self.regs = C::default();
        self.context = 0;
        self.flags = FiberFlags::NONE;
        self.launch = None;
    }

    /// Give the fiber a buffer of `bytes` if it has none.
    pub(crate) fn ensure_buffer(&mut self, bytes: usize) {
        if !self.stack.is_allocated() {
            self.stack = StackImage::new(bytes);
        }
    }

    /// Whether the fiber owns a heap-backed stack buffer.
    pub fn owns_buffer(&self) -> bool {
        self.stack.is_allocated()
    }

    pub fn stack(&self) -> &StackImage {
        &self.stack
    }

    pub fn regs(&self) -> &C {
        &self.regs
    }

    pub fn flags(&self) -> FiberFlags {
        self.flags
    }

    pub fn context(&self) -> u32 {
        self.context
    }

    pub fn queue(&self) -> Option<QueueId> {
        self.queue
    }

    /// Whether the fiber has been created but not started yet.
    pub fn is_pending(&self) -> bool {
        self.launch.is_some()
    }
}

impl<C: RegisterContext> Default for Fiber<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of one fiber's scheduler-visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiberInfo {
    pub queue: Option<QueueId>,
    pub flags: FiberFlags,
    pub context: u32,
    pub stack_capacity: usize,
    pub pending: bool,
}

impl<C: RegisterContext> From<&Fiber<C>> for FiberInfo {
    fn from(fiber: &Fiber<C>) -> Self {
        Self {
            queue: fiber.queue,
            flags: fiber.flags,
            context: fiber.context,
            stack_capacity: fiber.stack.capacity(),
            pending: fiber.launch.is_some(),
        }
    }
}
