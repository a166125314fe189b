//! Capture filenames and their fixed-width UTC timestamps.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::TimestampError;

/// Rendering of a missing timestamp.
pub const ZERO_TIMESTAMP: &str = "00010101000000UTC";

const TIMESTAMP_DIGITS: usize = 14;
const TIMESTAMP_SUFFIX: &str = "UTC";

/// Render a timestamp as `YYYYMMDDHHMMSSUTC`.
pub fn render_timestamp(timestamp: Option<&DateTime<Utc>>) -> String {
    match timestamp {
        Some(t) => t.format("%Y%m%d%H%M%SUTC").to_string(),
        None => ZERO_TIMESTAMP.to_string(),
    }
}

/// Parse a `YYYYMMDDHHMMSSUTC` string.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, TimestampError> {
    let invalid = || TimestampError(value.to_string());

    let digits = value.strip_suffix(TIMESTAMP_SUFFIX).ok_or_else(invalid)?;
    if digits.len() != TIMESTAMP_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let field = |range: std::ops::Range<usize>| -> Result<u32, TimestampError> {
        digits[range].parse::<u32>().map_err(|_| invalid())
    };

    let year = i32::try_from(field(0..4)?).map_err(|_| invalid())?;
    NaiveDate::from_ymd_opt(year, field(4..6)?, field(6..8)?)
        .and_then(|date| date.and_hms_opt(field(8..10).ok()?, field(10..12).ok()?, field(12..14).ok()?))
        .map(|naive| naive.and_utc())
        .ok_or_else(invalid)
}

/// Deterministic name of one node's capture artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFilename {
    pub capture_name: String,
    pub node_hostname: String,
    pub start_timestamp: Option<DateTime<Utc>>,
}

impl CaptureFilename {
    pub fn new(
        capture_name: impl Into<String>,
        node_hostname: impl Into<String>,
        start_timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            capture_name: capture_name.into(),
            node_hostname: node_hostname.into(),
            start_timestamp,
        }
    }

    pub fn archive_name(&self) -> String {
        format!("{}.tar.gz", self)
    }
}

impl fmt::Display for CaptureFilename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.capture_name,
            self.node_hostname,
            render_timestamp(self.start_timestamp.as_ref())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    mod render_tests {
        use super::*;

        #[test]
        fn test_render_utc() {
            let t = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
            assert_eq!(render_timestamp(Some(&t)), "20240309070501UTC");
        }

        #[test]
        fn test_render_converts_other_zones() {
            let offset = FixedOffset::east_opt(8 * 3600).unwrap();
            let local = offset.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();
            let t = local.with_timezone(&Utc);
            assert_eq!(render_timestamp(Some(&t)), "20231231180000UTC");
        }

        #[test]
        fn test_render_missing_is_zero_sentinel() {
            assert_eq!(render_timestamp(None), "00010101000000UTC");
        }
    }

    mod parse_tests {
        use super::*;

        #[test]
        fn test_round_trip() {
            let t = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap();
            assert_eq!(parse_timestamp(&render_timestamp(Some(&t))).unwrap(), t);
        }

        #[test]
        fn test_round_trip_drops_subseconds() {
            let t = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
                + chrono::Duration::milliseconds(750);
            let parsed = parse_timestamp(&render_timestamp(Some(&t))).unwrap();
            assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        }

        #[test]
        fn test_zero_sentinel_parses() {
            let t = parse_timestamp(ZERO_TIMESTAMP).unwrap();
            assert_eq!(render_timestamp(Some(&t)), ZERO_TIMESTAMP);
        }

        #[test]
        fn test_invalid_strings() {
            for value in [
                "",
                "2025-01-01 12:00:00",
                "20251301120000UTC",
                "20250132120000UTC",
                "20250101250000UTC",
                "20250101120000",
                "2025010112000UTC",
                "2025010112000aUTC",
            ] {
                assert!(parse_timestamp(value).is_err(), "{} should be rejected", value);
            }
        }
    }

    mod filename_tests {
        use super::*;

        #[test]
        fn test_display() {
            let t = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
            let name = CaptureFilename::new("cap", "node-1", Some(t));
            assert_eq!(name.to_string(), "cap-node-1-20240309070501UTC");
            assert_eq!(name.archive_name(), "cap-node-1-20240309070501UTC.tar.gz");
        }

        #[test]
        fn test_display_without_timestamp() {
            let name = CaptureFilename::new("cap", "node-1", None);
            assert_eq!(name.to_string(), "cap-node-1-00010101000000UTC");
        }
    }
}
