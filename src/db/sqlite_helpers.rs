//! Column conversions for the state store
//!
//! Timestamps are written as second-precision RFC 3339 UTC text, so plain
//! string comparison in SQL orders them chronologically. Reads are lenient:
//! databases written by older versions hold naive local wall-clock times.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::de::DeserializeOwned;

/// Naive layouts accepted besides RFC 3339, tried in order
const LEGACY_LAYOUTS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

pub fn now_iso8601() -> String {
    datetime_to_str(Utc::now())
}

pub fn datetime_to_str(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a stored timestamp. Naive values are read as local time.
pub fn str_to_datetime(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    let naive = LEGACY_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(s, layout).ok())
        .ok_or_else(|| anyhow!("unrecognised timestamp '{}'", s))?;

    // A wall-clock time skipped by a DST jump has no local reading
    Ok(Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc()))
}

/// Empty and missing values are `None`
pub fn str_to_datetime_opt(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    s.filter(|s| !s.is_empty()).map(str_to_datetime).transpose()
}

/// Like [`str_to_datetime_opt`], but an unreadable value is also `None`
pub fn str_to_datetime_lenient(s: Option<&str>) -> Option<DateTime<Utc>> {
    str_to_datetime_opt(s).ok().flatten()
}

/// Decode an optional JSON column; SQL NULL, `""` and `null` are all `None`
pub fn from_json_opt<T: DeserializeOwned>(s: Option<&str>) -> Result<Option<T>> {
    match s {
        None | Some("") | Some("null") => Ok(None),
        Some(raw) => serde_json::from_str(raw)
            .map(Some)
            .context("stored JSON is malformed"),
    }
}

/// SQLite stores booleans as integers
pub fn int_to_bool(i: i64) -> bool {
    i != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_written_timestamps_are_utc_seconds() {
        let now = Utc::now();
        let s = datetime_to_str(now);
        assert!(s.ends_with('Z'));
        assert!(!s.contains('.'));
        assert_eq!(str_to_datetime(&s).unwrap().timestamp(), now.timestamp());
    }

    #[test]
    fn test_written_timestamps_sort_as_strings() {
        let earlier = datetime_to_str(Utc::now() - chrono::Duration::hours(2));
        let later = now_iso8601();
        assert!(earlier < later);
    }

    #[test]
    fn test_parses_offset_timestamps() {
        let parsed = str_to_datetime("2025-12-28T06:00:00+02:00").unwrap();
        assert_eq!(parsed.hour(), 4);
        assert_eq!(parsed.day(), 28);
    }

    #[test]
    fn test_parses_legacy_naive_timestamps() {
        assert!(str_to_datetime("2025-12-28T04:00:00").is_ok());
        assert!(str_to_datetime("2025-12-28T04:00:00.123456").is_ok());
        assert!(str_to_datetime("2025-12-28 04:00:00").is_ok());
        assert!(str_to_datetime("yesterday").is_err());
    }

    #[test]
    fn test_lenient_parse_treats_garbage_as_missing() {
        assert_eq!(str_to_datetime_lenient(Some("garbage")), None);
        assert_eq!(str_to_datetime_lenient(Some("")), None);
        assert_eq!(str_to_datetime_lenient(None), None);
        assert!(str_to_datetime_opt(Some("garbage")).is_err());
    }

    #[test]
    fn test_json_column_decoding() {
        let v: Option<serde_json::Value> = from_json_opt(Some("null")).unwrap();
        assert!(v.is_none());
        let v: Option<Vec<u32>> = from_json_opt(Some("[1,2]")).unwrap();
        assert_eq!(v, Some(vec![1, 2]));
        assert!(from_json_opt::<Vec<u32>>(Some("[1,")).is_err());
    }

    #[test]
    fn test_int_to_bool() {
        assert!(int_to_bool(1));
        assert!(!int_to_bool(0));
    }
}
