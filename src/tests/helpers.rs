//! Test helper utilities and common functionality.

use crate::arch::sim::SimPlatform;
use crate::config::SchedulerConfig;
use crate::event::EventBus;
use crate::fiber::{FiberId, FiberInfo};
use crate::kernel::FiberScheduler;
use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;
use std::cell::RefCell;

pub(crate) type TestScheduler = FiberScheduler<SimPlatform>;

/// Reset the simulated machine and hand out a fresh, initialized scheduler.
///
/// Schedulers are leaked: fibers hold on to their scheduler's address.
pub(crate) fn scheduler() -> &'static TestScheduler {
    let scheduler = uninitialized(SchedulerConfig::DEFAULT);
    scheduler.init().expect("scheduler init");
    scheduler
}

pub(crate) fn uninitialized(config: SchedulerConfig) -> &'static TestScheduler {
    SimPlatform::reset();
    take_trace();
    Box::leak(Box::new(FiberScheduler::new(config)))
}

/// Pass a scheduler through a fiber's untyped parameter.
pub(crate) fn as_param(scheduler: &'static TestScheduler) -> usize {
    scheduler as *const TestScheduler as usize
}

pub(crate) fn from_param(param: usize) -> &'static TestScheduler {
    unsafe { &*(param as *const TestScheduler) }
}

/// Deliver one scheduler tick on every idle wait.
pub(crate) fn tick_on_idle(scheduler: &'static TestScheduler) {
    SimPlatform::on_idle(move || scheduler.scheduler_tick());
}

pub(crate) fn info(scheduler: &TestScheduler, id: FiberId) -> FiberInfo {
    scheduler.fiber_info(id).expect("live fiber id")
}

/// Deterministic byte pattern used as fake stack frames.
pub(crate) fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

pub(crate) fn noop() {}

std::thread_local! {
    static TRACE: RefCell<Vec<(&'static str, usize)>> = RefCell::new(Vec::new());
}

/// Append to the calling test's trace.
pub(crate) fn record(what: &'static str, value: usize) {
    TRACE.with(|trace| trace.borrow_mut().push((what, value)));
}

pub(crate) fn take_trace() -> Vec<(&'static str, usize)> {
    TRACE.with(|trace| core::mem::take(&mut *trace.borrow_mut()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BusCall {
    Listen(u16, u16),
    Ignore(u16, u16),
}

/// Event bus that only records what the scheduler asked of it.
pub(crate) struct RecordingBus {
    calls: Mutex<Vec<BusCall>>,
}

impl RecordingBus {
    pub(crate) fn leak() -> &'static Self {
        Box::leak(Box::new(Self {
            calls: Mutex::new(Vec::new()),
        }))
    }

    pub(crate) fn calls(&self) -> Vec<BusCall> {
        self.calls.lock().clone()
    }
}

impl EventBus for RecordingBus {
    fn listen(&self, id: u16, value: u16) {
        self.calls.lock().push(BusCall::Listen(id, value));
    }

    fn ignore(&self, id: u16, value: u16) {
        self.calls.lock().push(BusCall::Ignore(id, value));
    }
}
