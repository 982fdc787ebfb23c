use chrono::Utc;

use crate::model::*;

use super::calendar::{is_grid_aligned, normalize};
use super::slots::is_within_availability;
use super::{EngineError, StoreError};

pub(crate) fn now() -> Instant {
    Utc::now()
}

/// Preconditions of a booking, in order: both ids present, grid-aligned,
/// inside one of the coach's windows. Returns the normalized start time.
pub(crate) fn check_bookable(
    user_id: UserId,
    coach_id: CoachId,
    requested: Instant,
    windows: &[AvailabilityWindow],
) -> Result<Instant, EngineError> {
    if user_id == 0 || coach_id == 0 {
        return Err(EngineError::BadRequest(
            "user_id and coach_id required".into(),
        ));
    }
    let slot = normalize(&requested);
    if !is_grid_aligned(&slot) {
        return Err(EngineError::BadRequest(
            "datetime must be :00 or :30 minutes".into(),
        ));
    }
    if !is_within_availability(windows, slot) {
        return Err(EngineError::BadRequest(
            "slot not within coach availability".into(),
        ));
    }
    Ok(slot)
}

/// A duplicate key at insert time is the authoritative double-booking signal.
pub(crate) fn insert_error(e: StoreError) -> EngineError {
    match e {
        StoreError::DuplicateKey { .. } => EngineError::Conflict("slot already booked".into()),
        other => EngineError::Internal(format!("failed to create booking: {other}")),
    }
}
