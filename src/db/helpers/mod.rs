use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::ErrorCode;
use serde::{de::DeserializeOwned, Serialize};

use crate::db::models::{Category, Priority, RecordStatus};

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_category(value: &str) -> Result<Category> {
    match value {
        "task" => Ok(Category::Task),
        "note" => Ok(Category::Note),
        "idea" => Ok(Category::Idea),
        "reminder" => Ok(Category::Reminder),
        other => Err(anyhow!("unknown record category {other}")),
    }
}

pub fn parse_status(value: &str) -> Result<RecordStatus> {
    match value {
        "open" => Ok(RecordStatus::Open),
        "done" => Ok(RecordStatus::Done),
        other => Err(anyhow!("unknown record status {other}")),
    }
}

pub fn parse_priority(value: &str) -> Result<Priority> {
    match value {
        "low" => Ok(Priority::Low),
        "medium" => Ok(Priority::Medium),
        "high" => Ok(Priority::High),
        other => Err(anyhow!("unknown record priority {other}")),
    }
}

/// JSON, then base64, so blobs survive any text column untouched.
pub fn encode_blob<T: Serialize>(value: &T, field: &str) -> Result<String> {
    let json = serde_json::to_vec(value).with_context(|| format!("failed to encode {field}"))?;
    Ok(STANDARD.encode(json))
}

pub fn decode_blob<T: DeserializeOwned>(value: &str, field: &str) -> Result<T> {
    let bytes = STANDARD
        .decode(value)
        .with_context(|| format!("{field} is not valid base64"))?;
    serde_json::from_slice(&bytes).with_context(|| format!("{field} is not valid JSON"))
}

fn sqlite_code(err: &anyhow::Error) -> Option<ErrorCode> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<rusqlite::Error>())
        .and_then(|sql_err| sql_err.sqlite_error_code())
}

/// Storage-engine-reported structural corruption.
pub fn is_corruption(err: &anyhow::Error) -> bool {
    matches!(
        sqlite_code(err),
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

/// Busy file or lock contention; worth a short retry.
pub fn is_transient(err: &anyhow::Error) -> bool {
    matches!(
        sqlite_code(err),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Control characters other than tab, LF and CR are a corruption signal in text columns.
pub fn has_suspicious_control_chars(value: &str) -> bool {
    value
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn datetime_format_is_sortable_and_lossless() {
        let earlier = parse_datetime("2024-01-02T03:04:05.000000007Z", "t").unwrap();
        let later = parse_datetime("2024-01-02T03:04:05.1Z", "t").unwrap();
        assert!(format_datetime(&earlier) < format_datetime(&later));
        assert_eq!(
            parse_datetime(&format_datetime(&earlier), "t").unwrap(),
            earlier
        );
    }

    #[test]
    fn blob_roundtrip_keeps_empty_sets() {
        let empty: BTreeSet<String> = BTreeSet::new();
        let encoded = encode_blob(&empty, "tags").unwrap();
        let decoded: BTreeSet<String> = decode_blob(&encoded, "tags").unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn garbage_blob_is_rejected() {
        assert!(decode_blob::<BTreeSet<String>>("%%%", "tags").is_err());
    }

    #[test]
    fn control_char_scan_allows_whitespace() {
        assert!(!has_suspicious_control_chars("line one\n\tline two\r\n"));
        assert!(has_suspicious_control_chars("bad\u{1}byte"));
        assert!(has_suspicious_control_chars("nul\u{0}"));
    }

    #[test]
    fn classifies_sqlite_error_codes() {
        let corrupt = anyhow::Error::new(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_NOTADB),
            None,
        ))
        .context("while loading");
        assert!(is_corruption(&corrupt));
        assert!(!is_transient(&corrupt));

        let busy = anyhow::Error::new(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(is_transient(&busy));
        assert!(!is_corruption(&anyhow!("plain failure")));
    }
}
