//! Tick counting for the scheduler.

use portable_atomic::{AtomicU32, Ordering};

/// Millisecond counter advanced by the periodic scheduler tick.
///
/// The counter is only written from `scheduler_tick` (and reset by
/// `init`), both of which run with interrupts masked, so a plain
/// load/store pair is enough and no read-modify-write atomics are needed
/// on cores without them.
pub struct TickCounter {
    /// Milliseconds since the scheduler was initialized
    millis: AtomicU32,
    /// Milliseconds added per tick
    period_ms: u32,
}

impl TickCounter {
    /// Create a counter advancing by `period_ms` on every tick.
    pub const fn new(period_ms: u32) -> Self {
        Self {
            millis: AtomicU32::new(0),
            period_ms,
        }
    }

    /// Advance by one tick period and return the new time.
    ///
    /// Must only be called with interrupts masked.
    pub fn advance(&self) -> u32 {
        let now = self
            .millis
            .load(Ordering::Acquire)
            .wrapping_add(self.period_ms);
        self.millis.store(now, Ordering::Release);
        now
    }

    /// Current time in milliseconds.
    pub fn now(&self) -> u32 {
        self.millis.load(Ordering::Acquire)
    }

    /// The configured tick period in milliseconds.
    pub fn period_ms(&self) -> u32 {
        self.period_ms
    }

    /// Reset the counter to zero.
    pub fn reset(&self) {
        self.millis.store(0, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn set(&self, millis: u32) {
        self.millis.store(millis, Ordering::Release);
    }
}
