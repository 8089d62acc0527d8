//! Core calendar event model and the record normalization rules for churchcal.

use std::sync::OnceLock;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "churchcal-core";

/// Column format used by the remote API and by the event table.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const CONTACT_PATTERN: &str = r"(?i)Kontakt: ([^\r\n]+)";

/// Punctuation that survives link sanitizing, next to ASCII letters and digits.
const LINK_SAFE_PUNCTUATION: &str = "$-_.+!*'(),{}|\\^~[]`<>#%\";/?:@&=";

/// One calendar record as delivered by the ChurchTools `getCalendarEvents` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEventRecord {
    #[serde(default)]
    pub bezeichnung: Option<String>,
    #[serde(default)]
    pub startdate: Option<String>,
    #[serde(default)]
    pub enddate: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("record is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not a valid date-time: {value:?}")]
    InvalidDateTime { field: &'static str, value: String },
}

/// Normalized event, ready to be written to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDraft {
    pub title: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub contact: Option<String>,
    pub link: Option<String>,
}

impl EventDraft {
    pub fn from_record(record: &RemoteEventRecord) -> Result<Self, ParseError> {
        let title = record
            .bezeichnung
            .as_deref()
            .map(parse_title)
            .ok_or(ParseError::MissingField("bezeichnung"))?;
        let start = required_datetime("startdate", record.startdate.as_deref())?;
        let end = required_datetime("enddate", record.enddate.as_deref())?;

        Ok(Self {
            title,
            start,
            end,
            contact: record.notes.as_deref().and_then(parse_contact),
            link: record.link.as_deref().and_then(sanitize_link),
        })
    }
}

/// Persisted event row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    /// Tag of the import run that wrote this row.
    pub last_changed: i64,
    pub title: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub contact: Option<String>,
    pub link: Option<String>,
}

pub fn parse_title(raw: &str) -> String {
    raw.trim().to_string()
}

/// Pull the contact name out of a free-text notes field (`Kontakt: <name>`).
pub fn parse_contact(notes: &str) -> Option<String> {
    static CONTACT: OnceLock<Regex> = OnceLock::new();
    let re = CONTACT.get_or_init(|| Regex::new(CONTACT_PATTERN).expect("contact pattern is valid"));
    re.captures(notes)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Strip every character that cannot appear in a URL.
pub fn sanitize_link(raw: &str) -> Option<String> {
    let cleaned = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || LINK_SAFE_PUNCTUATION.contains(*c))
        .collect::<String>();
    (!cleaned.is_empty()).then_some(cleaned)
}

pub fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, DATETIME_FORMAT)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

fn required_datetime(field: &'static str, value: Option<&str>) -> Result<NaiveDateTime, ParseError> {
    let value = value.ok_or(ParseError::MissingField(field))?;
    parse_datetime(value).ok_or_else(|| ParseError::InvalidDateTime {
        field,
        value: value.to_string(),
    })
}

/// Half-open `[from, to)` range of start times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub from: NaiveDateTime,
    pub to: NaiveDateTime,
}

impl DateWindow {
    pub fn contains(&self, at: NaiveDateTime) -> bool {
        self.from <= at && at < self.to
    }
}

/// Monday of the ISO week containing `day`.
pub fn week_start(day: NaiveDate) -> NaiveDate {
    day - Duration::days(i64::from(day.weekday().num_days_from_monday()))
}

/// Windows for the upcoming-events view.
///
/// The first window starts today (nothing earlier is shown) and ends at the
/// next Monday. Every further window covers one full Monday-to-Sunday week.
pub fn week_windows(today: NaiveDate, weeks: usize) -> Vec<DateWindow> {
    let monday = week_start(today);
    (0..weeks)
        .map(|i| {
            let offset = Duration::weeks(i as i64);
            let from = if i == 0 { today } else { monday + offset };
            let to = monday + offset + Duration::weeks(1);
            DateWindow {
                from: from.and_time(NaiveTime::MIN),
                to: to.and_time(NaiveTime::MIN),
            }
        })
        .collect()
}

/// First quarter-hour boundary strictly after `unix_ts`.
pub fn next_quarter_hour(unix_ts: i64) -> i64 {
    unix_ts - unix_ts.rem_euclid(900) + 900
}

pub fn german_weekday(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Montag",
        Weekday::Tue => "Dienstag",
        Weekday::Wed => "Mittwoch",
        Weekday::Thu => "Donnerstag",
        Weekday::Fri => "Freitag",
        Weekday::Sat => "Samstag",
        Weekday::Sun => "Sonntag",
    }
}

pub fn german_month(month: u32) -> &'static str {
    const MONTHS: [&str; 12] = [
        "Januar", "Februar", "März", "April", "Mai", "Juni", "Juli", "August", "September",
        "Oktober", "November", "Dezember",
    ];
    MONTHS
        .get(month.saturating_sub(1) as usize)
        .copied()
        .unwrap_or_default()
}

/// `05. Mai` style day label.
pub fn format_day_date(day: NaiveDate) -> String {
    format!("{:02}. {}", day.day(), german_month(day.month()))
}
