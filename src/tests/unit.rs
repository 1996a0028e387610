//! Unit tests for individual scheduler operations.

use super::helpers::*;
use crate::arch::sim::SimPlatform;
use crate::arch::Platform;
use crate::config::SchedulerConfig;
use crate::errors::FiberError;
use crate::event::Event;
use crate::fiber::{FiberFlags, Launch};
use crate::kernel::{enter_fiber, fiber_trampoline, SchedulerFlags};
use crate::sched::QueueId;
use alloc::vec;

fn record_a() {
    record("a", 0);
}

fn record_b() {
    record("b", 0);
}

fn record_param(param: usize) {
    record("entry", param);
}

fn record_completion(param: usize) {
    record("completion", param);
}

fn record_idle() {
    record("idle", 0);
}

#[test]
fn test_init_twice_fails() {
    let scheduler = scheduler();
    assert_eq!(scheduler.init(), Err(FiberError::AlreadyInitialized));
}

#[test]
fn test_init_from_interrupt_fails() {
    let scheduler = uninitialized(SchedulerConfig::DEFAULT);
    let result = SimPlatform::interrupt(|| scheduler.init());
    assert_eq!(result, Err(FiberError::InInterruptContext));
    assert!(!scheduler.is_initialized());
}

#[test]
fn test_operations_before_init() {
    let scheduler = uninitialized(SchedulerConfig::DEFAULT);
    assert_eq!(scheduler.create_fiber(noop), Err(FiberError::NotInitialized));

    scheduler.schedule();
    assert_eq!(SimPlatform::swaps(), 0);

    scheduler.fork_on_block(record_a);
    assert_eq!(take_trace(), vec![("a", 0)]);
}

#[test]
fn test_main_fiber_after_init() {
    let scheduler = scheduler();
    let main = scheduler.current().expect("main fiber");
    let main_info = info(scheduler, main);

    assert_eq!(main_info.queue, Some(QueueId::Run));
    assert_eq!(main_info.stack_capacity, 64);
    assert!(main_info.flags.is_empty());
    assert!(!main_info.pending);
    assert_eq!(scheduler.ticks(), 0);
    assert_eq!(scheduler.stats().runnable, 1);
}

#[test]
fn test_create_fiber_is_pending_and_runnable() {
    let scheduler = scheduler();
    let id = scheduler.create_fiber(noop).unwrap();
    let fiber = info(scheduler, id);

    assert_eq!(fiber.queue, Some(QueueId::Run));
    assert!(fiber.pending);
    assert_eq!(fiber.stack_capacity, 64);
    assert_eq!(scheduler.stats().runnable, 2);
    assert!(scheduler.with_table(|table| table.is_consistent()));
}

#[test]
fn test_schedule_single_fiber_is_fast_path() {
    let scheduler = scheduler();
    let main = scheduler.current();

    scheduler.schedule();

    assert_eq!(scheduler.current(), main);
    assert_eq!(SimPlatform::swaps(), 0);
}

#[test]
fn test_schedule_round_robin_order() {
    let scheduler = scheduler();
    let main = scheduler.current().unwrap();
    let a = scheduler.create_fiber(record_a).unwrap();
    let b = scheduler.create_fiber(record_b).unwrap();

    // Insert-at-head: the run queue reads b, a, main.
    scheduler.schedule();
    assert_eq!(scheduler.current(), Some(b));
    assert!(scheduler.launch_current());

    scheduler.schedule();
    assert_eq!(scheduler.current(), Some(a));
    assert!(scheduler.launch_current());

    scheduler.schedule();
    assert_eq!(scheduler.current(), Some(main));
    assert!(!scheduler.launch_current());

    assert_eq!(take_trace(), vec![("b", 0), ("a", 0)]);
    assert_eq!(SimPlatform::swaps(), 3);
}

#[test]
fn test_pending_fiber_gets_prepared_context() {
    let scheduler = scheduler();
    let a = scheduler.create_fiber(noop).unwrap();

    scheduler.schedule();

    let regs = scheduler.with_table(|table| table.fiber(a).regs().clone());
    assert_eq!(regs.sp, SimPlatform::stack_base());
    assert_eq!(regs.arg, as_param(scheduler));
    assert_ne!(regs.launcher, 0);
}

#[test]
fn test_schedule_from_interrupt_is_noop() {
    let scheduler = scheduler();
    let main = scheduler.current();
    scheduler.create_fiber(noop).unwrap();

    SimPlatform::interrupt(|| scheduler.schedule());

    assert_eq!(scheduler.current(), main);
    assert_eq!(SimPlatform::swaps(), 0);
}

#[test]
fn test_sleep_and_wait_from_interrupt_are_noops() {
    let scheduler = scheduler();
    let main = scheduler.current().unwrap();

    SimPlatform::interrupt(|| {
        scheduler.fiber_sleep(10);
        scheduler.fiber_wait_for_event(1, 1);
    });

    assert_eq!(info(scheduler, main).queue, Some(QueueId::Run));
    assert_eq!(SimPlatform::idle_waits(), 0);
}

#[test]
fn test_launch_runs_entry_then_completion() {
    let scheduler = scheduler();
    let launch = Launch::with_param(record_param, 5).completion(record_completion as fn(usize));
    let id = scheduler.spawn(launch).unwrap();

    scheduler.schedule();
    assert_eq!(scheduler.current(), Some(id));
    assert!(scheduler.launch_current());
    assert!(!info(scheduler, id).pending);

    assert_eq!(take_trace(), vec![("entry", 5), ("completion", 5)]);
}

#[test]
fn test_trampoline_launches_then_releases() {
    let scheduler = scheduler();
    let main = scheduler.current().unwrap();
    let main_frame = pattern(32, 0x70);
    SimPlatform::push(&main_frame);

    let launch = Launch::with_param(record_param, 3).completion(record_completion as fn(usize));
    let id = scheduler.spawn(launch).unwrap();
    scheduler.schedule();
    assert_eq!(scheduler.current(), Some(id));

    let regs = scheduler.with_table(|table| table.fiber(id).regs().clone());
    assert_eq!(
        regs.launcher,
        fiber_trampoline::<SimPlatform> as *const () as usize
    );

    // Fresh fibers are entered with interrupts still masked by the switch.
    SimPlatform::disable_interrupts();
    SimPlatform::until_switched_away(|| enter_fiber::<SimPlatform>(regs.arg));

    assert_eq!(take_trace(), vec![("entry", 3), ("completion", 3)]);
    assert_eq!(scheduler.current(), Some(main));
    assert_eq!(SimPlatform::live_stack(), main_frame);
    assert!(SimPlatform::interrupts_enabled());
    assert_eq!(info(scheduler, id).queue, Some(QueueId::Pool));
    assert_eq!(SimPlatform::swaps(), 2);
}

#[test]
fn test_idle_waits_with_interrupts_masked() {
    let scheduler = scheduler();
    SimPlatform::on_idle(move || {
        record("masked", !SimPlatform::interrupts_enabled() as usize);
        scheduler.scheduler_tick();
    });

    scheduler.fiber_sleep(6);

    assert_eq!(take_trace(), vec![("masked", 1)]);
    assert!(SimPlatform::interrupts_enabled());
}

#[test]
fn test_release_recycles_and_reuses_record() {
    let scheduler = scheduler();
    let main = scheduler.current().unwrap();
    let a = scheduler.create_fiber(noop).unwrap();

    scheduler.schedule();
    scheduler.launch_current();
    SimPlatform::until_switched_away(|| scheduler.release_fiber());

    assert_eq!(scheduler.current(), Some(main));
    let released = info(scheduler, a);
    assert_eq!(released.queue, Some(QueueId::Pool));
    assert_eq!(released.stack_capacity, 64);
    assert!(released.flags.is_empty());

    let reused = scheduler.create_fiber(noop).unwrap();
    assert_eq!(reused, a);
    assert_eq!(scheduler.stats().records, 2);
    assert_eq!(scheduler.stats().pooled, 0);
    assert!(scheduler.with_table(|table| table.is_consistent()));
}

#[test]
fn test_data_ready_forces_idle_path() {
    let scheduler = scheduler();
    scheduler.set_idle_task(record_idle);
    let a = scheduler.create_fiber(noop).unwrap();

    scheduler.set_scheduler_flags(SchedulerFlags::DATA_READY);
    assert!(scheduler.scheduler_flags().contains(SchedulerFlags::DATA_READY));

    scheduler.schedule();

    assert_eq!(take_trace(), vec![("idle", 0)]);
    assert!(!scheduler.scheduler_flags().contains(SchedulerFlags::DATA_READY));
    assert_eq!(scheduler.current(), Some(a));
    // Work was available, so the processor never had to wait.
    assert_eq!(SimPlatform::idle_waits(), 0);
}

#[test]
fn test_idle_task_runs_on_every_idle_pass() {
    let scheduler = scheduler();
    scheduler.set_idle_task(record_idle);
    tick_on_idle(scheduler);

    scheduler.fiber_sleep(12);

    assert_eq!(SimPlatform::idle_waits(), 2);
    assert_eq!(take_trace(), vec![("idle", 0), ("idle", 0)]);
}

#[test]
fn test_wait_subscribes_and_wakes_through_idle() {
    let scheduler = scheduler();
    let bus = RecordingBus::leak();
    scheduler.attach_event_bus(bus);
    SimPlatform::on_idle(move || scheduler.scheduler_event(Event::new(1, 2)));

    scheduler.fiber_wait_for_event(1, 2);

    assert_eq!(SimPlatform::idle_waits(), 1);
    assert_eq!(
        bus.calls(),
        vec![BusCall::Listen(1, 2), BusCall::Ignore(1, 2)]
    );
    assert_eq!(scheduler.stats().waiting, 0);
}

#[test]
fn test_verify_stack_size_grows_buffer() {
    let scheduler = scheduler();
    let main = scheduler.current().unwrap();

    SimPlatform::push(&pattern(200, 0));
    scheduler.verify_stack_size(main);
    assert_eq!(info(scheduler, main).stack_capacity, 224);

    // Grow-only: a shallower stack keeps the larger buffer.
    SimPlatform::set_stack_pointer(SimPlatform::stack_base() - 16);
    scheduler.verify_stack_size(main);
    assert_eq!(info(scheduler, main).stack_capacity, 224);
}

#[test]
fn test_custom_config() {
    let config = SchedulerConfig::DEFAULT
        .with_tick_period(10)
        .with_initial_stack(128);
    let scheduler = uninitialized(config);
    scheduler.init().unwrap();

    let main = scheduler.current().unwrap();
    assert_eq!(info(scheduler, main).stack_capacity, 128);

    scheduler.scheduler_tick();
    assert_eq!(scheduler.ticks(), 10);
}

#[test]
fn test_fork_handler_runs_in_fork_mode() {
    fn handler(param: usize) {
        let scheduler = from_param(param);
        let current = scheduler.current().unwrap();
        record("fob", info(scheduler, current).flags.bits() as usize);
    }

    let scheduler = scheduler();
    let main = scheduler.current().unwrap();
    scheduler.fork_on_block_param(handler, as_param(scheduler));

    assert_eq!(
        take_trace(),
        vec![("fob", FiberFlags::FORK_ON_BLOCK.bits() as usize)]
    );
    assert!(info(scheduler, main).flags.is_empty());
}
