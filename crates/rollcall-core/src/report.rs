//! Date formatting, daily views and CSV export of attendance records.

use crate::session::MISSING_EXTERNAL_ID;
use crate::types::AttendanceRecord;
use chrono::{DateTime, TimeZone};
use serde::Serialize;
use std::fmt::Display;

/// Calendar-day key stored on every record, e.g. "Mon Jan 01 2024".
pub fn attendance_day<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    at.format("%a %b %d %Y").to_string()
}

/// Local clock time shown on records, e.g. "9:05:03 AM".
pub fn clock_time<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    at.format("%-I:%M:%S %p").to_string()
}

/// Enrollment date, e.g. "1/31/2024".
pub fn enrollment_date<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    at.format("%-m/%-d/%Y").to_string()
}

/// Records for `day`, newest first.
pub fn records_for_day(records: &[AttendanceRecord], day: &str) -> Vec<AttendanceRecord> {
    let mut out: Vec<AttendanceRecord> = records.iter().filter(|r| r.date == day).cloned().collect();
    out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    out
}

/// CSV with a header row and every field quoted.
pub fn to_csv(records: &[AttendanceRecord]) -> String {
    let mut out = String::from("Name,ExternalId,Date,Time\n");
    let rows: Vec<String> = records
        .iter()
        .map(|r| {
            let external_id = if r.external_id.is_empty() {
                MISSING_EXTERNAL_ID
            } else {
                r.external_id.as_str()
            };
            [r.display_name.as_str(), external_id, r.date.as_str(), r.time.as_str()]
                .iter()
                .map(|field| quote(field))
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect();
    out.push_str(&rows.join("\n"));
    out
}

fn quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

/// Headline numbers for one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub enrolled: usize,
    pub present: usize,
    /// Present / enrolled as a rounded percentage; 0 when nobody is enrolled.
    pub rate_percent: u32,
}

impl DailyStats {
    pub fn compute(enrolled: usize, records: &[AttendanceRecord], day: &str) -> Self {
        let present = records.iter().filter(|r| r.date == day).count();
        let rate_percent = if enrolled > 0 {
            (present as f64 / enrolled as f64 * 100.0).round() as u32
        } else {
            0
        };
        Self {
            enrolled,
            present,
            rate_percent,
        }
    }
}
