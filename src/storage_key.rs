//! Deterministic mapping from export filenames to archive keys.
//!
//! The recorder names export files
//! `<camera>_<YYYYMMDD>_<HHMMSS>-<YYYYMMDD>_<HHMMSS>_<random>.<ext>`,
//! e.g. `roadside_20251011_160000-20251011_170000_6t96gi.mp4`.
//! [`storage_key`] derives the object key from the camera and the
//! minute-truncated start time; [`parse_time_range`] recovers the original
//! export window, which stuck recovery needs to re-submit a request.
//!
//! Both functions are pure over the filename string. A filename that does
//! not match the grammar is a per-item skip condition, never a batch
//! failure.

use chrono::{FixedOffset, NaiveDateTime};
use thiserror::Error;

use crate::time_window::TimeWindow;

/// Errors produced when an export filename does not match the expected
/// grammar.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("invalid export filename: {0}")]
    InvalidFormat(String),
}

fn invalid(filename: &str, why: &str) -> MappingError {
    MappingError::InvalidFormat(format!("{filename}: {why}"))
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Derive the archive key for an export file.
///
/// `roadside_20251011_160000-20251011_170000_6t96gi.mp4` maps to
/// `roadside/2025/10/11/16/00M.mp4`: one object per camera per minute
/// bucket. Seconds and the random suffix are discarded, so exports of the
/// same camera starting in the same minute land on the same key and later
/// uploads overwrite earlier ones.
pub fn storage_key(filename: &str) -> Result<String, MappingError> {
    let parts: Vec<&str> = filename.split('_').collect();
    if parts.len() < 3 {
        return Err(invalid(filename, "expected camera_date_time segments"));
    }

    let camera = parts[0];
    let date = parts[1];
    let start_time = parts[2].split('-').next().unwrap_or("");

    if camera.is_empty() {
        return Err(invalid(filename, "empty camera segment"));
    }
    if date.len() != 8 || !all_digits(date) {
        return Err(invalid(filename, "date segment is not 8 digits"));
    }
    if start_time.len() != 6 || !all_digits(start_time) {
        return Err(invalid(filename, "start time segment is not 6 digits"));
    }

    let (year, month_day) = date.split_at(4);
    let (month, day) = month_day.split_at(2);
    let hour = &start_time[..2];
    let minute = &start_time[2..4];

    Ok(format!("{camera}/{year}/{month}/{day}/{hour}/{minute}M.mp4"))
}

/// Recover the export's original time window from its filename.
///
/// Requires the full grammar (start and end timestamps). Filename
/// timestamps carry no zone marker; `zone` is the fixed offset the
/// recorder names files in.
pub fn parse_time_range(filename: &str, zone: &FixedOffset) -> Result<TimeWindow, MappingError> {
    let parts: Vec<&str> = filename.split('_').collect();
    if parts.len() < 4 {
        return Err(invalid(filename, "expected camera_date_time-date_time segments"));
    }

    let start_date = parts[1];
    let mut across_dash = parts[2].split('-');
    let start_time = across_dash.next().unwrap_or("");
    let end_date = across_dash.next().unwrap_or("");
    let end_time = parts[3];

    let start = local_epoch(start_date, start_time, zone)
        .ok_or_else(|| invalid(filename, "unparseable start timestamp"))?;
    let end = local_epoch(end_date, end_time, zone)
        .ok_or_else(|| invalid(filename, "unparseable end timestamp"))?;

    Ok(TimeWindow { start, end })
}

fn local_epoch(date: &str, time: &str, zone: &FixedOffset) -> Option<i64> {
    if date.len() != 8 || !all_digits(date) || time.len() != 6 || !all_digits(time) {
        return None;
    }

    let naive = NaiveDateTime::parse_from_str(&format!("{date}{time}"), "%Y%m%d%H%M%S").ok()?;
    Some(naive.and_local_timezone(*zone).single()?.timestamp())
}
