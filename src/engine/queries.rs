use chrono::NaiveDate;

use crate::limits::MAX_BOOKINGS_LISTED;
use crate::model::*;

use super::conflict::now;
use super::slots::generate_slots;
use super::{Engine, EngineError};

impl Engine {
    /// Bookable slot starts for a coach on one calendar date.
    ///
    /// Already-booked slots are still listed; booking one of them is what
    /// reports the conflict.
    pub async fn available_slots(&self, coach_id: CoachId, date: NaiveDate) -> Vec<Instant> {
        let windows = self.windows_for_coach(coach_id).await;
        generate_slots(&windows, date).collect()
    }

    pub async fn list_windows(&self, coach_id: CoachId) -> Vec<AvailabilityWindow> {
        self.windows_for_coach(coach_id).await
    }

    /// A user's upcoming bookings (start at or after now), earliest first.
    pub fn user_bookings(&self, user_id: UserId) -> Result<Vec<Booking>, EngineError> {
        if user_id == 0 {
            return Err(EngineError::BadRequest("user_id required".into()));
        }
        within_listing_cap(self.bookings_for_user(user_id, now()))
    }
}

/// A listing past the cap is refused outright; returning a prefix would
/// hide upcoming bookings from their owner.
fn within_listing_cap(bookings: Vec<Booking>) -> Result<Vec<Booking>, EngineError> {
    if bookings.len() > MAX_BOOKINGS_LISTED {
        return Err(EngineError::Internal(format!(
            "too many upcoming bookings to list ({} > {MAX_BOOKINGS_LISTED})",
            bookings.len()
        )));
    }
    Ok(bookings)
}
