//! Timestamp helpers shared by agent, server and store.
//!
//! The wire format for watermarks is `YYYY-MM-DD HH:MM:SS.ffff TZ` with
//! four fractional digits. All timestamps are handled in UTC.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Second-resolution format used in log output and the UI.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const ZONE: &str = "UTC";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TimeParseError {
    #[error("missing time zone in {0:?}")]
    MissingZone(String),
    #[error("unsupported time zone {0:?}")]
    UnsupportedZone(String),
    #[error("malformed timestamp {input:?}: {detail}")]
    Malformed { input: String, detail: String },
}

/// The zero watermark: a host with no records resumes from here.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Convert integer epoch seconds (the storage representation) to a timestamp.
pub fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(epoch)
}

/// Render with sub-second precision, e.g. `2024-08-25 13:01:02.5000 UTC`.
pub fn format_subsecond(t: &DateTime<Utc>) -> String {
    let frac = (t.timestamp_subsec_nanos() / 100_000).min(9_999);
    format!("{}.{frac:04} {ZONE}", t.format(TIMESTAMP_FORMAT))
}

/// Parse the output of [`format_subsecond`].
pub fn parse_subsecond(raw: &str) -> Result<DateTime<Utc>, TimeParseError> {
    let trimmed = raw.trim();
    let (stamp, zone) = trimmed
        .rsplit_once(' ')
        .ok_or_else(|| TimeParseError::MissingZone(raw.to_string()))?;
    if zone != ZONE {
        return Err(TimeParseError::UnsupportedZone(zone.to_string()));
    }
    let naive = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S%.f").map_err(|e| {
        TimeParseError::Malformed {
            input: raw.to_string(),
            detail: e.to_string(),
        }
    })?;
    Ok(Utc.from_utc_datetime(&naive))
}
