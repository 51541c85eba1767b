use crate::error::{Result, RustFlowError};
use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Width of an aggregation window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregationPeriod {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
}

impl AggregationPeriod {
    /// Window size in milliseconds. Calendar months have none.
    pub fn fixed_millis(&self) -> Option<i64> {
        match self {
            AggregationPeriod::Seconds => Some(1_000),
            AggregationPeriod::Minutes => Some(60_000),
            AggregationPeriod::Hours => Some(3_600_000),
            AggregationPeriod::Days => Some(86_400_000),
            AggregationPeriod::Weeks => Some(7 * 86_400_000),
            AggregationPeriod::Months => None,
        }
    }

    /// Bucket timestamp for `ts`: the middle of its fixed window, or the 15th
    /// of its UTC month at noon, shifted by `offset_ms`
    pub fn bucket_of(&self, ts: i64, offset_ms: i64) -> Result<i64> {
        let base = match self.fixed_millis() {
            Some(p) => ts
                .div_euclid(p)
                .checked_mul(p)
                .and_then(|start| start.checked_add(p / 2)),
            None => Some(month_bucket(ts)?),
        };
        base.and_then(|b| b.checked_add(offset_ms))
            .ok_or_else(|| out_of_range(ts))
    }

    /// Bucket immediately after `bucket`
    pub fn next_bucket(&self, bucket: i64, offset_ms: i64) -> Result<i64> {
        match self.fixed_millis() {
            Some(p) => bucket.checked_add(p).ok_or_else(|| out_of_range(bucket)),
            None => {
                let unshifted = bucket.checked_sub(offset_ms).ok_or_else(|| out_of_range(bucket))?;
                next_month_bucket(unshifted)?
                    .checked_add(offset_ms)
                    .ok_or_else(|| out_of_range(bucket))
            }
        }
    }
}

fn out_of_range(ts: i64) -> RustFlowError {
    RustFlowError::InvalidMessage(format!("timestamp {} out of bucketing range", ts))
}

fn to_datetime(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ts)
        .ok_or_else(|| RustFlowError::InvalidMessage(format!("timestamp {} out of range", ts)))
}

fn mid_month(year: i32, month: u32) -> Result<i64> {
    Utc.with_ymd_and_hms(year, month, 15, 12, 0, 0)
        .single()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| RustFlowError::InvalidMessage(format!("no mid-month instant for {}-{}", year, month)))
}

/// Noon on the 15th of the UTC month containing `ts`
pub fn month_bucket(ts: i64) -> Result<i64> {
    let dt = to_datetime(ts)?;
    mid_month(dt.year(), dt.month())
}

/// Mid-month bucket of the calendar month after the one containing `ts`
pub fn next_month_bucket(ts: i64) -> Result<i64> {
    let dt = to_datetime(ts)?;
    let next = dt
        .with_day(1)
        .and_then(|first| first.checked_add_months(Months::new(1)))
        .ok_or_else(|| RustFlowError::InvalidMessage(format!("no month after {}", dt)))?;
    mid_month(next.year(), next.month())
}

impl fmt::Display for AggregationPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregationPeriod::Seconds => "SECONDS",
            AggregationPeriod::Minutes => "MINUTES",
            AggregationPeriod::Hours => "HOURS",
            AggregationPeriod::Days => "DAYS",
            AggregationPeriod::Weeks => "WEEKS",
            AggregationPeriod::Months => "MONTHS",
        };
        f.write_str(name)
    }
}

impl FromStr for AggregationPeriod {
    type Err = RustFlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SECONDS" => Ok(AggregationPeriod::Seconds),
            "MINUTES" => Ok(AggregationPeriod::Minutes),
            "HOURS" => Ok(AggregationPeriod::Hours),
            "DAYS" => Ok(AggregationPeriod::Days),
            "WEEKS" => Ok(AggregationPeriod::Weeks),
            "MONTHS" => Ok(AggregationPeriod::Months),
            other => Err(RustFlowError::InvalidConfig(format!(
                "unknown aggregation period '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(y: i32, m: u32, d: u32, h: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap().timestamp_millis()
    }

    #[test]
    fn test_fixed_bucket_is_window_midpoint() {
        for period in [
            AggregationPeriod::Seconds,
            AggregationPeriod::Minutes,
            AggregationPeriod::Hours,
            AggregationPeriod::Days,
            AggregationPeriod::Weeks,
        ] {
            let p = period.fixed_millis().unwrap();
            for k in [0i64, 1, 7, 12345] {
                assert_eq!(period.bucket_of(k * p, 0).unwrap(), k * p + p / 2);
                assert_eq!(period.bucket_of(k * p + p - 1, 0).unwrap(), k * p + p / 2);
            }
        }
    }

    #[test]
    fn test_negative_timestamps_floor_downwards() {
        let minutes = AggregationPeriod::Minutes;
        assert_eq!(minutes.bucket_of(-1, 0).unwrap(), -60_000 + 30_000);
    }

    #[test]
    fn test_offset_shifts_bucket() {
        let hours = AggregationPeriod::Hours;
        assert_eq!(hours.bucket_of(0, 5_000).unwrap(), 1_800_000 + 5_000);
        assert_eq!(hours.next_bucket(1_805_000, 5_000).unwrap(), 5_405_000);
    }

    #[test]
    fn test_month_buckets_use_calendar() {
        let months = AggregationPeriod::Months;
        assert_eq!(months.fixed_millis(), None);

        let jan_bucket = millis(2024, 1, 15, 12);
        assert_eq!(months.bucket_of(millis(2024, 1, 1, 0), 0).unwrap(), jan_bucket);
        assert_eq!(months.bucket_of(millis(2024, 1, 31, 23), 0).unwrap(), jan_bucket);

        // February 2024 has 29 days; stepping is by calendar month
        let feb_bucket = months.next_bucket(jan_bucket, 0).unwrap();
        assert_eq!(feb_bucket, millis(2024, 2, 15, 12));
        assert_eq!(months.next_bucket(feb_bucket, 0).unwrap(), millis(2024, 3, 15, 12));
        assert_eq!(
            months.next_bucket(millis(2024, 12, 15, 12), 0).unwrap(),
            millis(2025, 1, 15, 12)
        );
    }

    #[test]
    fn test_extreme_timestamps_are_rejected() {
        for period in [AggregationPeriod::Days, AggregationPeriod::Weeks, AggregationPeriod::Months] {
            let err = period.bucket_of(i64::MAX, 0).err().unwrap();
            assert!(matches!(err, RustFlowError::InvalidMessage(_)));
        }
        assert!(AggregationPeriod::Seconds.bucket_of(0, i64::MAX).is_err());
        assert!(AggregationPeriod::Seconds.bucket_of(i64::MIN, 0).is_err());
        assert!(AggregationPeriod::Weeks.next_bucket(i64::MAX - 1, 0).is_err());
        assert!(AggregationPeriod::Months.next_bucket(i64::MIN, 1).is_err());
    }

    #[test]
    fn test_parse_period_names() {
        assert_eq!("months".parse::<AggregationPeriod>().unwrap(), AggregationPeriod::Months);
        assert!("FORTNIGHTS".parse::<AggregationPeriod>().is_err());
        let parsed: AggregationPeriod = serde_json::from_str("\"HOURS\"").unwrap();
        assert_eq!(parsed, AggregationPeriod::Hours);
    }
}
