use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::model::Instant;

/// The one reference frame every instant is normalized into.
pub const REFERENCE: Utc = Utc;

/// Fixed slot width in minutes.
pub const SLOT_MINUTES: i64 = 30;

pub fn slot_duration() -> chrono::Duration {
    chrono::Duration::minutes(SLOT_MINUTES)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DayOfWeek {
    Sunday,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        DayOfWeek::Sunday,
        DayOfWeek::Monday,
        DayOfWeek::Tuesday,
        DayOfWeek::Wednesday,
        DayOfWeek::Thursday,
        DayOfWeek::Friday,
        DayOfWeek::Saturday,
    ];

    /// Canonical capitalized name, the form windows are stored with.
    pub fn name(self) -> &'static str {
        match self {
            DayOfWeek::Sunday => "Sunday",
            DayOfWeek::Monday => "Monday",
            DayOfWeek::Tuesday => "Tuesday",
            DayOfWeek::Wednesday => "Wednesday",
            DayOfWeek::Thursday => "Thursday",
            DayOfWeek::Friday => "Friday",
            DayOfWeek::Saturday => "Saturday",
        }
    }

    pub fn of_date(date: NaiveDate) -> Self {
        match date.weekday() {
            Weekday::Sun => DayOfWeek::Sunday,
            Weekday::Mon => DayOfWeek::Monday,
            Weekday::Tue => DayOfWeek::Tuesday,
            Weekday::Wed => DayOfWeek::Wednesday,
            Weekday::Thu => DayOfWeek::Thursday,
            Weekday::Fri => DayOfWeek::Friday,
            Weekday::Sat => DayOfWeek::Saturday,
        }
    }
}

impl std::fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Wall-clock time of day, minute precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub fn minutes_since_midnight(self) -> i64 {
        i64::from(self.hour) * 60 + i64::from(self.minute)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    InvalidDay(String),
    InvalidTimeFormat(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::InvalidDay(s) => write!(f, "invalid day: {s}"),
            ParseError::InvalidTimeFormat(s) => write!(f, "invalid time of day (want HH:MM): {s}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Case-insensitive, whitespace-trimmed match against the seven English day names.
pub fn parse_day_name(text: &str) -> Result<DayOfWeek, ParseError> {
    let wanted = text.trim();
    DayOfWeek::ALL
        .into_iter()
        .find(|d| d.name().eq_ignore_ascii_case(wanted))
        .ok_or_else(|| ParseError::InvalidDay(text.to_string()))
}

/// Strict `HH:MM`, zero-padded, 24-hour.
pub fn parse_time_of_day(text: &str) -> Result<TimeOfDay, ParseError> {
    let invalid = || ParseError::InvalidTimeFormat(text.to_string());
    let bytes = text.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return Err(invalid());
    }
    let two_digits = |hi: u8, lo: u8| -> Option<u8> {
        if hi.is_ascii_digit() && lo.is_ascii_digit() {
            Some((hi - b'0') * 10 + (lo - b'0'))
        } else {
            None
        }
    };
    let hour = two_digits(bytes[0], bytes[1]).ok_or_else(invalid)?;
    let minute = two_digits(bytes[3], bytes[4]).ok_or_else(invalid)?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok(TimeOfDay { hour, minute })
}

/// Minute component is exactly :00 or :30. Seconds are not looked at.
pub fn is_grid_aligned<Tz: TimeZone>(instant: &DateTime<Tz>) -> bool {
    matches!(instant.minute(), 0 | 30)
}

/// Move into the reference frame and drop seconds and sub-seconds.
pub fn normalize<Tz: TimeZone>(instant: &DateTime<Tz>) -> Instant {
    let utc = instant.with_timezone(&REFERENCE);
    utc.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(utc)
}

/// The instant at `time` on `date`, in the reference frame.
pub fn combine(date: NaiveDate, time: TimeOfDay) -> Instant {
    let midnight = REFERENCE.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN));
    midnight + chrono::Duration::minutes(time.minutes_since_midnight())
}
