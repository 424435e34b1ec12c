//! Time conversions between Unix seconds and the UV `TIME1` convention.
//!
//! UV files count time in days from midnight UTC of the observation date.

use chrono::{DateTime, NaiveTime, Utc};

pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// Convert Unix seconds to a chrono `DateTime<Utc>`.
pub fn to_datetime(timestamp: f64) -> DateTime<Utc> {
    let secs = timestamp.floor();
    let nanos = ((timestamp - secs) * 1e9) as u32;
    DateTime::from_timestamp(secs as i64, nanos).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Unix seconds of midnight UTC on the day containing `timestamp`.
pub fn midnight(timestamp: f64) -> f64 {
    let dt = to_datetime(timestamp);
    dt.date_naive().and_time(NaiveTime::MIN).and_utc().timestamp() as f64
}

/// `YYYY-MM-DD` of the day containing `timestamp`.
pub fn obs_date(timestamp: f64) -> String {
    to_datetime(timestamp).format("%Y-%m-%d").to_string()
}

/// Days elapsed since `epoch` (both in Unix seconds).
pub fn to_day_offset(timestamp: f64, epoch: f64) -> f64 {
    (timestamp - epoch) / SECONDS_PER_DAY
}

/// Inverse of [`to_day_offset`].
pub fn from_day_offset(days: f64, epoch: f64) -> f64 {
    epoch + days * SECONDS_PER_DAY
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2017-06-26T12:00:00Z
    const NOON: f64 = 1_498_478_400.0;

    #[test]
    fn test_midnight() {
        assert_eq!(midnight(NOON), NOON - 12.0 * 3600.0);
        assert_eq!(midnight(midnight(NOON)), midnight(NOON));
    }

    #[test]
    fn test_obs_date() {
        assert_eq!(obs_date(NOON), "2017-06-26");
    }

    #[test]
    fn test_day_offset_roundtrip() {
        let epoch = midnight(NOON);
        let days = to_day_offset(NOON, epoch);
        assert!((days - 0.5).abs() < 1e-12);
        assert!((from_day_offset(days, epoch) - NOON).abs() < 1e-6);
    }
}
