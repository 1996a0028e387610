//! Scheduler core managing the fiber system.
//!
//! This module provides the main `FiberScheduler` struct that coordinates
//! fiber creation, cooperative switching with stack virtualization, the
//! sleep and wait queues and fork-on-block.
//!
//! All scheduler state sits behind one `spin::Mutex` that is only ever
//! locked inside an [`InterruptGuard`]. On a single core that makes every
//! state mutation atomic with respect to the tick and event handlers, and
//! the lock itself is never contended.

use crate::arch::{InterruptGuard, Platform, RegisterContext};
use crate::config::SchedulerConfig;
use crate::errors::{FiberError, FiberResult};
use crate::event::{Event, EventBus};
use crate::fiber::{FiberFlags, FiberId, FiberInfo, Launch};
use crate::sched::{FiberTable, QueueId};
use crate::time::{deadline_after, deadline_reached, TickCounter};
use core::marker::PhantomData;
use core::ptr;
use log::{debug, trace};
use portable_atomic::{AtomicBool, AtomicU8, Ordering};
use spin::{Mutex, MutexGuard, Once};

/// Scheduler-wide flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerFlags(u8);

impl SchedulerFlags {
    pub const NONE: Self = Self(0);
    /// Run the idle path before selecting the next fiber.
    pub const DATA_READY: Self = Self(0x01);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Queue occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    pub runnable: usize,
    pub sleeping: usize,
    pub waiting: usize,
    pub pooled: usize,
    /// Fiber records ever allocated
    pub records: usize,
}

struct SchedulerState<C> {
    fibers: FiberTable<C>,
    /// `None` after the running fiber released itself
    current: Option<FiberId>,
    /// Child parked by a sleep or wait inside a fork-on-block handler
    forked: Option<FiberId>,
    idle_task: Option<fn()>,
    event_bus: Option<&'static (dyn EventBus + Sync)>,
}

/// Cooperative fiber scheduler for platform `P`.
///
/// A scheduler must outlive every fiber it runs; in practice it lives in a
/// `static`. All fibers share the platform's single physical stack, so at
/// most one scheduler may be initialized per platform.
pub struct FiberScheduler<P: Platform> {
    state: Mutex<SchedulerState<P::Context>>,
    ticks: TickCounter,
    flags: AtomicU8,
    config: SchedulerConfig,
    initialized: AtomicBool,
    _platform: PhantomData<fn() -> P>,
}

impl<P: Platform> FiberScheduler<P> {
    /// Create an uninitialized scheduler.
    pub const fn new(config: SchedulerConfig) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                fibers: FiberTable::new(),
                current: None,
                forked: None,
                idle_task: None,
                event_bus: None,
            }),
            ticks: TickCounter::new(config.tick_period_ms),
            flags: AtomicU8::new(0),
            config,
            initialized: AtomicBool::new(false),
            _platform: PhantomData,
        }
    }

    /// Lock the scheduler state inside a critical section.
    fn lock(&self) -> (InterruptGuard<P>, MutexGuard<'_, SchedulerState<P::Context>>) {
        let guard = InterruptGuard::new();
        let state = self.state.lock();
        (guard, state)
    }

    /// Initialize the scheduler.
    ///
    /// Captures the calling context as the main fiber, queues it on the run
    /// queue and makes it current. Must be called once, from thread mode,
    /// before fibers are created.
    pub fn init(&self) -> FiberResult<()> {
        if P::in_interrupt_context() {
            return Err(FiberError::InInterruptContext);
        }

        let main = {
            let (_guard, mut state) = self.lock();
            if self.initialized.load(Ordering::Acquire) {
                return Err(FiberError::AlreadyInitialized);
            }

            self.ticks.reset();
            self.flags.store(0, Ordering::Release);

            let main = state.fibers.allocate();
            state
                .fibers
                .fiber_mut(main)
                .ensure_buffer(self.config.initial_stack_bytes);
            state.fibers.queue_fiber(main, QueueId::Run);
            state.current = Some(main);
            self.initialized.store(true, Ordering::Release);
            main
        };

        debug!(
            "fiber scheduler initialized: main fiber {}, tick {} ms",
            main,
            self.ticks.period_ms()
        );
        Ok(())
    }

    /// Check if the scheduler has been initialized.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Milliseconds since `init`, advanced by `scheduler_tick`.
    pub fn ticks(&self) -> u32 {
        self.ticks.now()
    }

    /// The fiber currently executing.
    pub fn current(&self) -> Option<FiberId> {
        let (_guard, state) = self.lock();
        state.current
    }

    /// Scheduler-visible state of one fiber.
    pub fn fiber_info(&self, id: FiberId) -> Option<FiberInfo> {
        let (_guard, state) = self.lock();
        state.fibers.get(id).map(FiberInfo::from)
    }

    pub fn stats(&self) -> SchedulerStats {
        let (_guard, state) = self.lock();
        SchedulerStats {
            runnable: state.fibers.len(QueueId::Run),
            sleeping: state.fibers.len(QueueId::Sleep),
            waiting: state.fibers.len(QueueId::Wait),
            pooled: state.fibers.len(QueueId::Pool),
            records: state.fibers.records(),
        }
    }

    pub fn scheduler_flags(&self) -> SchedulerFlags {
        SchedulerFlags(self.flags.load(Ordering::Acquire))
    }

    /// Set `flags` in the scheduler flags byte. Callable from interrupts.
    pub fn set_scheduler_flags(&self, flags: SchedulerFlags) {
        let _guard = InterruptGuard::<P>::new();
        let bits = self.flags.load(Ordering::Acquire) | flags.0;
        self.flags.store(bits, Ordering::Release);
    }

    pub fn clear_scheduler_flags(&self, flags: SchedulerFlags) {
        let _guard = InterruptGuard::<P>::new();
        let bits = self.flags.load(Ordering::Acquire) & !flags.0;
        self.flags.store(bits, Ordering::Release);
    }

    /// Install the system task run on every pass through the idle path.
    pub fn set_idle_task(&self, task: fn()) {
        let (_guard, mut state) = self.lock();
        state.idle_task = Some(task);
    }

    /// Attach the message bus used to subscribe waiting fibers.
    pub fn attach_event_bus(&self, bus: &'static (dyn EventBus + Sync)) {
        let (_guard, mut state) = self.lock();
        state.event_bus = Some(bus);
    }

    /// Create a fiber running `entry`.
    pub fn create_fiber(&self, entry: fn()) -> FiberResult<FiberId> {
        self.spawn(Launch::new(entry))
    }

    /// Create a fiber running `entry(param)`.
    pub fn create_fiber_param(&self, entry: fn(usize), param: usize) -> FiberResult<FiberId> {
        self.spawn(Launch::with_param(entry, param))
    }

    /// Create a fiber for `launch` and queue it on the run queue.
    ///
    /// The fiber starts the first time the scheduler selects it.
    pub fn spawn(&self, launch: Launch) -> FiberResult<FiberId> {
        if !self.is_initialized() {
            return Err(FiberError::NotInitialized);
        }

        let id = {
            let (_guard, mut state) = self.lock();
            self.spawn_locked(&mut state, launch)
        };
        trace!("created fiber {}", id);
        Ok(id)
    }

    fn spawn_locked(&self, state: &mut SchedulerState<P::Context>, launch: Launch) -> FiberId {
        let id = state.fibers.allocate();
        let fiber = state.fibers.fiber_mut(id);
        fiber.ensure_buffer(self.config.initial_stack_bytes);
        fiber.launch = Some(launch);
        state.fibers.queue_fiber(id, QueueId::Run);
        id
    }

    /// Make sure the buffer of `id` can hold the live physical stack.
    pub fn verify_stack_size(&self, id: FiberId) {
        let (_guard, mut state) = self.lock();
        self.grow_stack(&mut state, id);
    }

    fn grow_stack(&self, state: &mut SchedulerState<P::Context>, id: FiberId) {
        let depth = P::stack_base().saturating_sub(P::stack_pointer());
        let fiber = state.fibers.fiber_mut(id);
        if fiber.stack.ensure(depth, self.config.stack_granularity) {
            trace!(
                "fiber {} stack image grown to {} bytes",
                id,
                fiber.stack.capacity()
            );
        }
    }

    /// Yield to the next runnable fiber.
    ///
    /// Returns once the calling fiber is selected again. With nothing
    /// runnable, waits in the idle path until an interrupt makes something
    /// runnable. A no-op from interrupt context or before `init`.
    pub fn schedule(&self) {
        if P::in_interrupt_context() || !self.is_initialized() {
            return;
        }

        loop {
            let (guard, state) = self.lock();
            let current = state.current;

            if let Some(id) = current {
                if state.fibers.fiber(id).flags.contains(FiberFlags::FORK_ON_BLOCK) {
                    self.fork_child(guard, state, id);
                    return;
                }
            }

            if state.fibers.is_empty(QueueId::Run)
                || self.scheduler_flags().contains(SchedulerFlags::DATA_READY)
            {
                let idle_task = state.idle_task;
                drop(state);
                drop(guard);
                self.idle(idle_task);
                continue;
            }

            let next = match current {
                Some(id) if state.fibers.fiber(id).queue == Some(QueueId::Run) => {
                    state.fibers.successor(id)
                }
                _ => state.fibers.head(QueueId::Run),
            };
            let Some(next) = next else {
                continue;
            };

            if Some(next) == current {
                return;
            }

            self.switch_to(guard, state, current, next);
            return;
        }
    }

    /// One pass through the idle path.
    fn idle(&self, idle_task: Option<fn()>) {
        if let Some(task) = idle_task {
            task();
        }
        self.clear_scheduler_flags(SchedulerFlags::DATA_READY);

        // Check and wait under one mask: a wake-up raised in between stays
        // pending and ends the wait instead of being slept through.
        let (guard, state) = self.lock();
        let runnable = !state.fibers.is_empty(QueueId::Run);
        drop(state);
        if !runnable {
            P::wait_for_interrupt();
        }
        drop(guard);
    }

    /// Switch from `outgoing` (or from a released context) to `next`.
    fn switch_to(
        &self,
        guard: InterruptGuard<P>,
        mut state: MutexGuard<'_, SchedulerState<P::Context>>,
        outgoing: Option<FiberId>,
        next: FiberId,
    ) {
        let (from, from_stack) = match outgoing {
            Some(id) => {
                self.grow_stack(&mut state, id);
                let fiber = state.fibers.fiber_ptr(id);
                // SAFETY: records are boxed and never freed.
                unsafe { (ptr::addr_of_mut!((*fiber).regs), (*fiber).stack.top_mut()) }
            }
            None => (ptr::null_mut(), 0),
        };

        let incoming = state.fibers.fiber_mut(next);
        if incoming.launch.is_some() {
            incoming.regs.prepare(
                fiber_trampoline::<P> as *const () as usize,
                self as *const Self as usize,
                P::stack_base(),
            );
        }
        let (to, to_stack) = (
            ptr::addr_of!(incoming.regs),
            incoming.stack.top_mut(),
        );

        state.current = Some(next);
        drop(state);

        trace!("switch to fiber {}", next);
        // SAFETY: interrupts stay masked until `guard` drops on the resumed
        // side, the outgoing buffer was sized above and the incoming image
        // was sized when it was copied out.
        unsafe { P::swap_context(from, to, from_stack, to_stack) };
        drop(guard);
    }

    /// Materialize the handler of a fork-on-block that just blocked.
    ///
    /// The handler's current stack and registers become a new child fiber;
    /// the parent then resumes at its `fork_on_block` snapshot. The child
    /// returns from here when it is first switched in.
    fn fork_child(
        &self,
        guard: InterruptGuard<P>,
        mut state: MutexGuard<'_, SchedulerState<P::Context>>,
        parent: FiberId,
    ) {
        let child = match state.forked.take() {
            Some(child) => child,
            None => {
                let child = state.fibers.allocate();
                state.fibers.queue_fiber(child, QueueId::Run);
                child
            }
        };

        state.fibers.fiber_mut(parent).flags.insert(FiberFlags::PARENT);
        let fiber = state.fibers.fiber_mut(child);
        fiber.flags.insert(FiberFlags::CHILD);
        fiber.ensure_buffer(self.config.initial_stack_bytes);
        self.grow_stack(&mut state, child);

        let child_ptr = state.fibers.fiber_ptr(child);
        drop(state);

        trace!("fork: handler blocked, continuing as fiber {}", child);
        // SAFETY: the child's buffer was sized for the live stack above.
        unsafe {
            P::save_context(
                ptr::addr_of_mut!((*child_ptr).regs),
                (*child_ptr).stack.top_mut(),
            )
        };

        // Reached twice: now as the parent, later as the child.
        let mut state = self.state.lock();
        let Some(current) = state.current else {
            return;
        };
        if !state.fibers.fiber(current).flags.contains(FiberFlags::PARENT) {
            return;
        }

        let fiber = state.fibers.fiber_ptr(current);
        // SAFETY: records are boxed and never freed.
        let regs = unsafe { ptr::addr_of!((*fiber).regs) };
        drop(state);
        drop(guard);
        // SAFETY: the parent's frame in `fork_entry` is still live below
        // us on the physical stack; nothing was swapped out.
        unsafe { P::restore_register_context(regs) };
    }

    /// Park the running fiber, or the fork-on-block child standing in for
    /// it, on `queue` with scheduler tag `context`.
    fn park_current(&self, queue: QueueId, context: u32) {
        let (_guard, mut state) = self.lock();
        let Some(current) = state.current else {
            return;
        };

        let target = if state.fibers.fiber(current).flags.contains(FiberFlags::FORK_ON_BLOCK) {
            let child = state.fibers.allocate();
            state.forked = Some(child);
            child
        } else {
            current
        };

        state.fibers.fiber_mut(target).context = context;
        state.fibers.queue_fiber(target, queue);
    }

    /// Block the calling fiber for at least `ms` milliseconds.
    ///
    /// The wake-up happens on the first tick at or after the deadline. A
    /// no-op from interrupt context.
    pub fn fiber_sleep(&self, ms: u32) {
        if P::in_interrupt_context() {
            return;
        }

        let deadline = deadline_after(self.ticks.now(), ms);
        self.park_current(QueueId::Sleep, deadline);
        self.schedule();
    }

    /// Block the calling fiber until an event matching `(id, value)` is
    /// delivered. A no-op from interrupt context.
    pub fn fiber_wait_for_event(&self, id: u16, value: u16) {
        if P::in_interrupt_context() {
            return;
        }

        self.park_current(QueueId::Wait, Event::encode(id, value));
        let bus = {
            let (_guard, state) = self.lock();
            state.event_bus
        };
        if let Some(bus) = bus {
            bus.listen(id, value);
        }
        self.schedule();
    }

    /// Timer callback: advance time and wake every sleeper whose deadline
    /// has been reached. Interrupt safe.
    pub fn scheduler_tick(&self) {
        let (_guard, mut state) = self.lock();
        let now = self.ticks.advance();
        state
            .fibers
            .migrate(QueueId::Sleep, QueueId::Run, |fiber| {
                deadline_reached(now, fiber.context)
            });
    }

    /// Event callback: wake every fiber waiting for a matching event.
    /// Interrupt safe.
    pub fn scheduler_event(&self, evt: Event) {
        let bus = {
            let (_guard, mut state) = self.lock();
            state
                .fibers
                .migrate(QueueId::Wait, QueueId::Run, |fiber| evt.matches(fiber.context));
            state.event_bus
        };
        if let Some(bus) = bus {
            bus.ignore(evt.source, evt.value);
        }
    }

    /// Run `entry` on the current stack, turning it into a fiber only if
    /// it blocks.
    pub fn fork_on_block(&self, entry: fn()) {
        self.fork_entry(Launch::new(entry));
    }

    /// Run `entry(param)` on the current stack, turning it into a fiber
    /// only if it blocks.
    pub fn fork_on_block_param(&self, entry: fn(usize), param: usize) {
        self.fork_entry(Launch::with_param(entry, param));
    }

    #[inline(never)]
    fn fork_entry(&self, launch: Launch) {
        let parent = {
            let (_guard, mut state) = self.lock();
            match state.current {
                Some(id) if self.is_initialized() => {
                    if state.fibers.fiber(id).flags.contains(FiberFlags::FORK_ON_BLOCK) {
                        let child = self.spawn_locked(&mut state, launch);
                        drop(state);
                        trace!("nested fork: created fiber {}", child);
                        return;
                    }
                    let fiber = state.fibers.fiber_ptr(id);
                    // SAFETY: records are boxed and never freed.
                    Some((id, unsafe { ptr::addr_of_mut!((*fiber).regs) }))
                }
                _ => None,
            }
        };
        let Some((parent, regs)) = parent else {
            launch.run();
            return;
        };

        // SAFETY: this frame stays live until the parent resumes here; the
        // record outlives the call.
        unsafe { P::save_register_context(regs) };
        if self.finish_fork_parent() {
            return;
        }

        self.update_current_flags(|flags| flags.insert(FiberFlags::FORK_ON_BLOCK));
        launch.run();
        self.update_current_flags(|flags| flags.remove(FiberFlags::FORK_ON_BLOCK));

        if self.finish_fork_parent() {
            return;
        }
        if self.current() != Some(parent) {
            // The handler blocked and finished as the materialized child.
            self.release_fiber();
        }
    }

    /// Clear the fork state of a resumed parent. Returns `true` when the
    /// current fiber was the parent of a materialized fork.
    fn finish_fork_parent(&self) -> bool {
        let (_guard, mut state) = self.lock();
        let Some(current) = state.current else {
            return false;
        };
        let fiber = state.fibers.fiber_mut(current);
        if fiber.flags.contains(FiberFlags::PARENT) {
            fiber
                .flags
                .remove(FiberFlags::FORK_ON_BLOCK | FiberFlags::PARENT);
            true
        } else {
            false
        }
    }

    fn update_current_flags(&self, update: impl FnOnce(&mut FiberFlags)) {
        let (_guard, mut state) = self.lock();
        if let Some(current) = state.current {
            update(&mut state.fibers.fiber_mut(current).flags);
        }
    }

    /// Run the pending launch of the current fiber, as the trampoline does
    /// on first entry. Returns `false` if there was none.
    pub(crate) fn launch_current(&self) -> bool {
        let launch = {
            let (_guard, mut state) = self.lock();
            state
                .current
                .and_then(|id| state.fibers.fiber_mut(id).launch.take())
        };
        match launch {
            Some(launch) => {
                launch.run();
                true
            }
            None => false,
        }
    }

    /// Return the current fiber to the pool. Its stack is discarded at the
    /// next switch.
    fn recycle_current(&self) {
        let (_guard, mut state) = self.lock();
        if let Some(current) = state.current.take() {
            state.fibers.recycle(current);
            drop(state);
            trace!("fiber {} released", current);
        }
    }

    /// Terminate the calling fiber and switch away for good.
    pub fn release_fiber(&self) -> ! {
        if !self.is_initialized() {
            loop {
                P::wait_for_interrupt();
            }
        }

        self.recycle_current();
        loop {
            self.schedule();
        }
    }

    /// Register this scheduler as the target of the crate-level functions.
    pub fn register_global(&'static self) -> FiberResult<()>
    where
        P: 'static,
    {
        let mut registered = false;
        GLOBAL.call_once(|| {
            registered = true;
            self as &'static (dyn FiberRuntime + Sync)
        });
        if registered {
            Ok(())
        } else {
            Err(FiberError::GlobalAlreadyRegistered)
        }
    }

    #[cfg(test)]
    pub(crate) fn set_ticks(&self, millis: u32) {
        self.ticks.set(millis);
    }

    #[cfg(test)]
    pub(crate) fn with_table<R>(&self, f: impl FnOnce(&FiberTable<P::Context>) -> R) -> R {
        let (_guard, state) = self.lock();
        f(&state.fibers)
    }
}

/// First code run by a freshly started fiber.
pub(crate) extern "C" fn fiber_trampoline<P: Platform>(scheduler: usize) -> ! {
    enter_fiber::<P>(scheduler)
}

/// Body of the trampoline: run the pending launch, then release.
pub(crate) fn enter_fiber<P: Platform>(scheduler: usize) -> ! {
    // SAFETY: `switch_to` passes the address of the scheduler, which
    // outlives its fibers.
    let scheduler = unsafe { &*(scheduler as *const FiberScheduler<P>) };
    P::enable_interrupts();
    scheduler.launch_current();
    scheduler.release_fiber()
}

/// Object-safe view of a scheduler, used by the crate-level functions.
pub trait FiberRuntime {
    fn init(&self) -> FiberResult<()>;
    fn spawn(&self, launch: Launch) -> FiberResult<FiberId>;
    fn schedule(&self);
    fn fiber_sleep(&self, ms: u32);
    fn fiber_wait_for_event(&self, id: u16, value: u16);
    fn fork_on_block(&self, launch: Launch);
    fn release_fiber(&self) -> !;
    fn scheduler_tick(&self);
    fn scheduler_event(&self, evt: Event);
    fn ticks(&self) -> u32;
}

impl<P: Platform> FiberRuntime for FiberScheduler<P> {
    fn init(&self) -> FiberResult<()> {
        FiberScheduler::init(self)
    }

    fn spawn(&self, launch: Launch) -> FiberResult<FiberId> {
        FiberScheduler::spawn(self, launch)
    }

    fn schedule(&self) {
        FiberScheduler::schedule(self)
    }

    fn fiber_sleep(&self, ms: u32) {
        FiberScheduler::fiber_sleep(self, ms)
    }

    fn fiber_wait_for_event(&self, id: u16, value: u16) {
        FiberScheduler::fiber_wait_for_event(self, id, value)
    }

    fn fork_on_block(&self, launch: Launch) {
        self.fork_entry(launch)
    }

    fn release_fiber(&self) -> ! {
        FiberScheduler::release_fiber(self)
    }

    fn scheduler_tick(&self) {
        FiberScheduler::scheduler_tick(self)
    }

    fn scheduler_event(&self, evt: Event) {
        FiberScheduler::scheduler_event(self, evt)
    }

    fn ticks(&self) -> u32 {
        FiberScheduler::ticks(self)
    }
}

static GLOBAL: Once<&'static (dyn FiberRuntime + Sync)> = Once::new();

/// The scheduler registered with [`FiberScheduler::register_global`].
pub fn global_runtime() -> Option<&'static (dyn FiberRuntime + Sync)> {
    GLOBAL.get().copied()
}
