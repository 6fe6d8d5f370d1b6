//! Timestamp conversion utilities with clock skew protection.
//!
//! Timestamps are stored as `i64` (microseconds since Unix epoch), the
//! `sqlmodel` convention. Primary seniority during merges is decided by
//! `created_at`, so stored timestamps must never regress: [`now_micros`]
//! tracks the last observed wall-clock value and returns
//! `max(current, last_seen)` across backward jumps (NTP corrections, VM
//! migration, etc.).

use chrono::{NaiveDateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Microseconds per second
const MICROS_PER_SECOND: i64 = 1_000_000;

/// Backward jump threshold: 1 second in microseconds.
const BACKWARD_JUMP_THRESHOLD_US: i64 = 1_000_000;

/// Last observed wall-clock value (microseconds since epoch).
static LAST_SYSTEM_TIME_US: AtomicI64 = AtomicI64::new(0);

/// Convert chrono `NaiveDateTime` to microseconds since Unix epoch.
#[inline]
#[must_use]
pub fn naive_to_micros(dt: NaiveDateTime) -> i64 {
    dt.and_utc().timestamp_micros()
}

/// Convert microseconds since Unix epoch to chrono `NaiveDateTime`.
///
/// For extreme values outside chrono's representable range, clamps to the
/// nearest representable instant instead of panicking.
#[inline]
#[must_use]
pub fn micros_to_naive(micros: i64) -> NaiveDateTime {
    let secs = micros.div_euclid(MICROS_PER_SECOND);
    let sub_micros = micros.rem_euclid(MICROS_PER_SECOND);
    let nsecs = u32::try_from(sub_micros * 1000).unwrap_or(0);
    Utc.timestamp_opt(secs, nsecs)
        .single()
        .unwrap_or(if micros < 0 {
            chrono::DateTime::<Utc>::MIN_UTC
        } else {
            chrono::DateTime::<Utc>::MAX_UTC
        })
        .naive_utc()
}

/// Get current time as microseconds since Unix epoch, with clock skew
/// protection.
///
/// If the wall clock jumped backward by more than 1 second, returns the
/// last observed value so stored timestamps keep their high-water mark.
#[inline]
#[must_use]
pub fn now_micros() -> i64 {
    let current = Utc::now().timestamp_micros();
    let last = LAST_SYSTEM_TIME_US.load(Ordering::Relaxed);

    if last != 0 && current - last < -BACKWARD_JUMP_THRESHOLD_US {
        tracing::warn!(
            regression_us = last - current,
            "wall clock jumped backward; holding timestamp high-water mark"
        );
        return last;
    }

    LAST_SYSTEM_TIME_US.store(current, Ordering::Relaxed);
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micros_roundtrip() {
        let micros = 1_705_320_000_123_456_i64;
        assert_eq!(naive_to_micros(micros_to_naive(micros)), micros);
    }

    #[test]
    fn negative_micros_convert() {
        let micros = -1_000_000_i64;
        let dt = micros_to_naive(micros);
        assert_eq!(dt.and_utc().timestamp(), -1);
    }

    #[test]
    fn extreme_micros_do_not_panic() {
        let _ = micros_to_naive(i64::MAX);
        let _ = micros_to_naive(i64::MIN);
    }

    #[test]
    fn now_micros_is_recent_and_monotonic_enough() {
        let a = now_micros();
        let b = now_micros();
        assert!(b >= a - BACKWARD_JUMP_THRESHOLD_US);
        let wall = Utc::now().timestamp_micros();
        assert!((wall - b).abs() < 5 * MICROS_PER_SECOND);
    }
}
