/// Timeframe and timestamp utilities
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{FeedError, Result};
use crate::types::TimeValue;

/// Smallest start a forward storage query may use; `0` reads backwards.
pub const MS_MIN_STAMP: i64 = 1;

/// Timeframes the storage layer keeps natively, coarsest first
const DOWN_TFS: [(&str, i64); 5] = [
    ("1d", 86400),
    ("1h", 3600),
    ("15m", 900),
    ("5m", 300),
    ("1m", 60),
];

pub const SECS_MONTH: i64 = 2_592_000;
pub const SECS_WEEK: i64 = 604_800;
pub const SECS_DAY: i64 = 86_400;
pub const SECS_HOUR: i64 = 3_600;
pub const SECS_MIN: i64 = 60;

/// Parse a timeframe like "1m", "4h", "1d", "1w", "1M" into seconds
pub fn tf_to_secs(tf: &str) -> Result<i64> {
    let invalid = || FeedError::InvalidTimeframe(tf.to_string());
    let unit = tf.chars().last().ok_or_else(invalid)?;
    let num: i64 = tf[..tf.len() - unit.len_utf8()].parse().map_err(|_| invalid())?;
    if num <= 0 {
        return Err(invalid());
    }
    let scale = match unit {
        's' => 1,
        'm' => SECS_MIN,
        'h' => SECS_HOUR,
        'd' => SECS_DAY,
        'w' => SECS_WEEK,
        'M' => SECS_MONTH,
        _ => return Err(invalid()),
    };
    num.checked_mul(scale).ok_or_else(invalid)
}

/// Inverse of `tf_to_secs`, picking the largest unit that divides evenly
pub fn secs_to_tf(secs: i64) -> String {
    for (scale, unit) in [
        (SECS_MONTH, "M"),
        (SECS_WEEK, "w"),
        (SECS_DAY, "d"),
        (SECS_HOUR, "h"),
        (SECS_MIN, "m"),
    ] {
        if secs >= scale && secs % scale == 0 {
            return format!("{}{}", secs / scale, unit);
        }
    }
    format!("{}s", secs)
}

pub fn align_tf_msecs(time_ms: i64, tf_msecs: i64) -> i64 {
    time_ms.div_euclid(tf_msecs) * tf_msecs
}

/// Start of the interval containing `time_ms`, with boundaries shifted by `off_ms`
pub fn align_tf_msecs_offset(time_ms: i64, tf_msecs: i64, off_ms: i64) -> i64 {
    (time_ms - off_ms).div_euclid(tf_msecs) * tf_msecs + off_ms
}

fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 {
        a.abs()
    } else {
        gcd(b, a % b)
    }
}

pub fn gcd_ints(values: &[i64]) -> i64 {
    values.iter().fold(0, |acc, &v| gcd(acc, v))
}

/// Storage timeframe that `tf` should be downloaded as
pub fn get_down_tf(tf: &str) -> Result<&'static str> {
    let secs = tf_to_secs(tf)?;
    DOWN_TFS
        .iter()
        .find(|(_, down_secs)| secs % down_secs == 0)
        .map(|(name, _)| *name)
        .ok_or_else(|| FeedError::InvalidTimeframe(format!("{} has no download timeframe", tf)))
}

pub fn parse_time_zone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|e| FeedError::ConfigError(format!("Invalid time zone {}: {}", name, e)))
}

/// Resolve a configured time into milliseconds, interpreting dates in `tz`
pub fn parse_time_value(value: &TimeValue, tz: Tz) -> Result<i64> {
    let text = match value {
        TimeValue::Millis(ms) => return Ok(*ms),
        TimeValue::Text(text) => text.trim(),
    };
    if text.is_empty() {
        return Ok(0);
    }
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M"))
        .or_else(|_| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
        })
        .map_err(|e| FeedError::ConfigError(format!("Invalid time {}: {}", text, e)))?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| FeedError::ConfigError(format!("Time {} does not exist in {}", text, tz)))
}

/// Human readable timestamp for logs and CSV export
pub fn ms_to_string(time_ms: i64, tz: Tz) -> String {
    match Utc.timestamp_millis_opt(time_ms).single() {
        Some(dt) => dt.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => time_ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tf_to_secs() {
        assert_eq!(tf_to_secs("1m").unwrap(), 60);
        assert_eq!(tf_to_secs("15m").unwrap(), 900);
        assert_eq!(tf_to_secs("4h").unwrap(), 14400);
        assert_eq!(tf_to_secs("1d").unwrap(), 86400);
        assert_eq!(tf_to_secs("1w").unwrap(), 604800);
        assert_eq!(tf_to_secs("30s").unwrap(), 30);
        assert!(tf_to_secs("").is_err());
        assert!(tf_to_secs("m").is_err());
        assert!(tf_to_secs("0m").is_err());
        assert!(tf_to_secs("5x").is_err());
        let err = tf_to_secs("9999999999999999M").unwrap_err();
        assert!(matches!(err, FeedError::InvalidTimeframe(_)));
    }

    #[test]
    fn test_secs_to_tf() {
        assert_eq!(secs_to_tf(60), "1m");
        assert_eq!(secs_to_tf(300), "5m");
        assert_eq!(secs_to_tf(5400), "90m");
        assert_eq!(secs_to_tf(7200), "2h");
        assert_eq!(secs_to_tf(86400), "1d");
        assert_eq!(secs_to_tf(604800), "1w");
        assert_eq!(secs_to_tf(45), "45s");
    }

    #[test]
    fn test_align_offset() {
        assert_eq!(align_tf_msecs(299_999, 300_000), 0);
        assert_eq!(align_tf_msecs(300_000, 300_000), 300_000);
        // weekly bars starting on Monday: 4 days after the epoch Thursday
        let week = 604_800_000;
        let off = 4 * 86_400_000;
        assert_eq!(align_tf_msecs_offset(off + 10, week, off), off);
        assert_eq!(align_tf_msecs_offset(off - 10, week, off), off - week);
    }

    #[test]
    fn test_gcd_and_down_tf() {
        assert_eq!(gcd_ints(&[300, 900]), 300);
        assert_eq!(gcd_ints(&[900, 3600, 600]), 300);
        assert_eq!(gcd_ints(&[420]), 420);
        assert_eq!(get_down_tf("1m").unwrap(), "1m");
        assert_eq!(get_down_tf("30m").unwrap(), "15m");
        assert_eq!(get_down_tf("4h").unwrap(), "1h");
        assert_eq!(get_down_tf("1w").unwrap(), "1d");
        assert!(get_down_tf("30s").is_err());
    }

    #[test]
    fn test_parse_time_value() {
        let tz = parse_time_zone("UTC").unwrap();
        assert_eq!(
            parse_time_value(&TimeValue::Text("2024-01-01".to_string()), tz).unwrap(),
            1_704_067_200_000
        );
        assert_eq!(
            parse_time_value(&TimeValue::Text("2024-01-01 08:00".to_string()), tz).unwrap(),
            1_704_096_000_000
        );
        assert_eq!(parse_time_value(&TimeValue::Millis(42), tz).unwrap(), 42);

        let shanghai = parse_time_zone("Asia/Shanghai").unwrap();
        assert_eq!(
            parse_time_value(&TimeValue::Text("2024-01-01 08:00:00".to_string()), shanghai).unwrap(),
            1_704_067_200_000
        );
        assert!(parse_time_zone("Mars/Olympus").is_err());
        assert_eq!(ms_to_string(1_704_067_200_000, shanghai), "2024-01-01 08:00:00");
    }
}
