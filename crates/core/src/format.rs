//! Date and human-readable formatting helpers.

use std::time::Duration;
use time::format_description::BorrowedFormatItem;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const BACKUP_STAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]_[hour][minute][second]");

/// Format a date as `YYYY-MM-DD`.
pub fn format_date(date: Date) -> String {
    date.format(DATE_FORMAT)
        .unwrap_or_else(|_| format!("{:04}-{:02}-{:02}", date.year(), date.month() as u8, date.day()))
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> crate::Result<Date> {
    Date::parse(s, DATE_FORMAT).map_err(|e| crate::Error::InvalidDate(format!("{s}: {e}")))
}

/// Format a timestamp as RFC 3339 (ISO-8601).
pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339)
        .unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

/// Parse an RFC 3339 timestamp. A bare `YYYY-MM-DDTHH:MM:SS[.frac]` without
/// offset is read as UTC, which is what older ledger documents contain.
pub fn parse_timestamp(s: &str) -> crate::Result<OffsetDateTime> {
    if let Ok(ts) = OffsetDateTime::parse(s, &Rfc3339) {
        return Ok(ts);
    }
    let with_zone = format!("{s}Z");
    OffsetDateTime::parse(&with_zone, &Rfc3339)
        .map_err(|e| crate::Error::InvalidDate(format!("{s}: {e}")))
}

/// Timestamp suffix used for ledger backup keys (`YYYYmmdd_HHMMSS`).
pub fn backup_stamp(ts: OffsetDateTime) -> String {
    ts.format(BACKUP_STAMP_FORMAT)
        .unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

/// Human-readable byte count: `512 B`, `1.5 KB`, `3.2 MB`, `1.07 GB`.
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.1} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{bytes} B")
    }
}

/// Human-readable duration: `42s`, `3m 5s`, `2h 14m`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
