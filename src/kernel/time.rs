// Wrap-aware microsecond arithmetic.
//
// The counter is a free-running u32 that wraps at 2^32 µs. "Before" and
// "after" are only decidable modulo the wrap, so every single-shot delay
// is capped at a quarter of the range: an overdue reading then has 3×
// the cap of headroom before it could be mistaken for a pending one.

use super::SchedError;

/// Longest single-shot delay, in microseconds (2^29 µs ≈ 536.9 s).
pub const MAX_DELAY_US: u32 = 1 << 29;

/// [`MAX_DELAY_US`] in whole seconds. The documented cap for
/// [`Timeout`](crate::kernel::Timeout) and friends.
pub const MAXSECS: u32 = MAX_DELAY_US / 1_000_000;

/// Microseconds elapsed from `start` to `now`, modulo the wrap.
#[inline]
pub fn micros_since(start: u32, now: u32) -> u32 {
    now.wrapping_sub(start)
}

/// Microseconds by which `deadline` has been exceeded, or 0 while it is
/// still pending.
#[inline]
pub fn overdue(deadline: u32, now: u32) -> u32 {
    let d = now.wrapping_sub(deadline);
    // Differences in the top quarter of the range are deadlines still
    // in the future (a deadline is never more than MAX_DELAY_US ahead).
    if d < 3 * MAX_DELAY_US { d } else { 0 }
}

/// Seconds (fractional) to capped microseconds.
///
/// `None` for non-finite, negative, or over-cap values.
pub fn secs_to_us(secs: f32) -> Option<u32> {
    if !secs.is_finite() || secs < 0.0 || secs > MAXSECS as f32 {
        return None;
    }
    Some((secs * 1_000_000.0) as u32)
}

/// Milliseconds to capped microseconds.
pub fn millis(ms: u32) -> Result<u32, SchedError> {
    let us = ms.checked_mul(1_000).ok_or(SchedError::TimeRange)?;
    if us > MAX_DELAY_US {
        return Err(SchedError::TimeRange);
    }
    Ok(us)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maxsecs_is_documented_value() {
        assert_eq!(MAXSECS, 536);
    }

    #[test]
    fn elapsed_across_wrap() {
        let start = u32::MAX - 100;
        let now = start.wrapping_add(250);
        assert_eq!(micros_since(start, now), 250);
    }

    #[test]
    fn overdue_pending_and_late() {
        let now = 5_000_000;
        assert_eq!(overdue(6_000_000, now), 0); // 1 s in the future
        assert_eq!(overdue(4_500_000, now), 500_000); // half a second late
    }

    #[test]
    fn overdue_across_wrap() {
        let deadline = u32::MAX - 10;
        let now = deadline.wrapping_add(42);
        assert_eq!(overdue(deadline, now), 42);
        // Deadline a full cap ahead still reads as pending.
        let ahead = now.wrapping_add(MAX_DELAY_US);
        assert_eq!(overdue(ahead, now), 0);
    }

    #[test]
    fn conversions() {
        assert_eq!(secs_to_us(0.2), Some(200_000));
        assert_eq!(secs_to_us(536.0), Some(536_000_000));
        assert_eq!(secs_to_us(537.0), None);
        assert_eq!(secs_to_us(-1.0), None);
        assert_eq!(secs_to_us(f32::NAN), None);
        assert_eq!(millis(50), Ok(50_000));
        assert!(millis(600_000).is_err());
    }
}
