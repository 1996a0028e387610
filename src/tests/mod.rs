//! Scheduler-level tests, run on the simulated platform.

mod helpers;
mod property;
mod unit;
