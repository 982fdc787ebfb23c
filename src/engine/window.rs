use chrono::NaiveDate;
use tracing::debug;
use ulid::Ulid;

use crate::model::*;

use super::calendar::{self, DayOfWeek, SLOT_MINUTES, TimeOfDay};
use super::EngineError;

/// Validate caller input and build a window ready to persist.
///
/// Checks run in order and the first failure wins: coach id, day name,
/// start time, end time, ordering, minimum width.
pub fn create_window(
    coach_id: CoachId,
    day_text: &str,
    start_text: &str,
    end_text: &str,
) -> Result<AvailabilityWindow, EngineError> {
    if coach_id == 0 {
        return Err(EngineError::BadRequest("coach_id required".into()));
    }
    let day = calendar::parse_day_name(day_text)
        .map_err(|_| EngineError::BadRequest("invalid day; use Monday..Sunday".into()))?;

    let start_text = start_text.trim();
    let end_text = end_text.trim();
    let start = calendar::parse_time_of_day(start_text)
        .map_err(|_| EngineError::BadRequest("start_time must be HH:MM".into()))?;
    let end = calendar::parse_time_of_day(end_text)
        .map_err(|_| EngineError::BadRequest("end_time must be HH:MM".into()))?;

    if start >= end {
        return Err(EngineError::BadRequest(
            "start_time must be before end_time".into(),
        ));
    }
    if end.minutes_since_midnight() - start.minutes_since_midnight() < SLOT_MINUTES {
        return Err(EngineError::BadRequest(
            "availability window must be >= 30 minutes".into(),
        ));
    }

    Ok(AvailabilityWindow {
        id: Ulid::new(),
        coach_id,
        day: day.name().to_string(),
        start_time: start_text.to_string(),
        end_time: end_text.to_string(),
    })
}

/// True iff the stored day parses and matches `date`'s weekday.
pub fn applies_to_date(window: &AvailabilityWindow, date: NaiveDate) -> bool {
    match calendar::parse_day_name(&window.day) {
        Ok(day) => day == DayOfWeek::of_date(date),
        Err(e) => {
            debug!("skipping window {}: {e}", window.id);
            false
        }
    }
}

/// Parsed `(start, end)` of a stored window, or `None` if either is damaged.
pub(crate) fn bounds(window: &AvailabilityWindow) -> Option<(TimeOfDay, TimeOfDay)> {
    let start = calendar::parse_time_of_day(&window.start_time);
    let end = calendar::parse_time_of_day(&window.end_time);
    match (start, end) {
        (Ok(s), Ok(e)) => Some((s, e)),
        (Err(e), _) | (_, Err(e)) => {
            debug!("skipping window {}: {e}", window.id);
            None
        }
    }
}
