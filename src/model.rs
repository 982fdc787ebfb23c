use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Coach identity. `0` means "not supplied".
pub type CoachId = u64;

/// User identity. `0` means "not supplied".
pub type UserId = u64;

/// Instant in the single reference frame (see `engine::calendar::REFERENCE`).
pub type Instant = DateTime<Utc>;

/// A coach's recurring weekly open interval.
///
/// Day and times are stored as the validated text (`"Monday"`, `"09:00"`)
/// and re-parsed by readers, so a damaged record degrades to "never applies"
/// instead of failing the whole query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub coach_id: CoachId,
    pub day: String,
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: UserId,
    pub coach_id: CoachId,
    pub start_time: Instant,
    pub created_at: Instant,
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    WindowAdded(AvailabilityWindow),
    BookingCreated(Booking),
    BookingCancelled {
        id: Ulid,
        coach_id: CoachId,
        user_id: UserId,
    },
}

impl Event {
    pub fn coach_id(&self) -> CoachId {
        match self {
            Event::WindowAdded(w) => w.coach_id,
            Event::BookingCreated(b) => b.coach_id,
            Event::BookingCancelled { coach_id, .. } => *coach_id,
        }
    }
}
