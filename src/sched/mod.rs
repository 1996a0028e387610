//! Queue management for the fiber scheduler.
//!
//! Provides the fiber arena and the run, sleep, wait and pool queues the
//! scheduler core selects from.

pub mod queue;

pub use queue::{FiberTable, QueueId, QueueIter};
