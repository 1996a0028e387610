//! Millisecond time keeping for sleep deadlines.
//!
//! Time is a `u32` count of milliseconds since `init`. It wraps after about
//! 49.7 days; deadline checks compare with wrapping arithmetic so a sleep
//! that straddles the wrap still wakes correctly, as long as no single
//! sleep exceeds half the counter range.

pub mod tick;

pub use tick::TickCounter;

/// Largest distance, in milliseconds, that `deadline_reached` can order.
pub const MAX_SLEEP_MS: u32 = i32::MAX as u32;

/// Absolute wake time for a sleep of `delay_ms` starting at `now`.
#[inline]
pub fn deadline_after(now: u32, delay_ms: u32) -> u32 {
    now.wrapping_add(delay_ms.min(MAX_SLEEP_MS))
}

/// Whether `now` is at or past `deadline`.
#[inline]
pub fn deadline_reached(now: u32, deadline: u32) -> bool {
    now.wrapping_sub(deadline) <= MAX_SLEEP_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_ordering() {
        let deadline = deadline_after(100, 12);
        assert_eq!(deadline, 112);
        assert!(!deadline_reached(106, deadline));
        assert!(deadline_reached(112, deadline));
        assert!(deadline_reached(118, deadline));
    }

    #[test]
    fn test_deadline_across_wrap() {
        let now = u32::MAX - 3;
        let deadline = deadline_after(now, 10);
        assert_eq!(deadline, 6);
        assert!(!deadline_reached(now, deadline));
        assert!(!deadline_reached(u32::MAX, deadline));
        assert!(!deadline_reached(2, deadline));
        assert!(deadline_reached(6, deadline));
        assert!(deadline_reached(20, deadline));
    }

    #[test]
    fn test_zero_delay_is_already_due() {
        assert!(deadline_reached(42, deadline_after(42, 0)));
    }

    #[test]
    fn test_oversized_delay_is_clamped() {
        let deadline = deadline_after(0, u32::MAX);
        assert_eq!(deadline, MAX_SLEEP_MS);
        assert!(!deadline_reached(0, deadline));
    }
}
