//! Error types for the fiber scheduler.
//!
//! Almost nothing in the scheduler can fail in a recoverable way: heap
//! exhaustion is left to the global allocator and logic errors are ruled
//! out by construction. The errors below cover the few checked boundaries
//! of the public API.

use core::fmt;

/// Result type for scheduler operations.
pub type FiberResult<T> = Result<T, FiberError>;

/// Errors reported at the checked boundaries of the scheduler API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberError {
    /// `init` was called on a scheduler that is already running
    AlreadyInitialized,
    /// The scheduler has not been initialized yet
    NotInitialized,
    /// A different scheduler is already registered as the global one
    GlobalAlreadyRegistered,
    /// The operation is not allowed from an interrupt service routine
    InInterruptContext,
}

impl fmt::Display for FiberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberError::AlreadyInitialized => write!(f, "Fiber scheduler already initialized"),
            FiberError::NotInitialized => write!(f, "Fiber scheduler not initialized"),
            FiberError::GlobalAlreadyRegistered => {
                write!(f, "A global fiber scheduler is already registered")
            }
            FiberError::InInterruptContext => {
                write!(f, "Operation not permitted in interrupt context")
            }
        }
    }
}
