use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::conflict::{check_bookable, insert_error, now};
use super::window::create_window;
use super::{Engine, EngineError, StoreError, WalCommand};

impl Engine {
    /// Validate and persist a coach's recurring window. Nothing is stored
    /// unless every check passes.
    pub async fn add_availability(
        &self,
        coach_id: CoachId,
        day: &str,
        start_time: &str,
        end_time: &str,
    ) -> Result<AvailabilityWindow, EngineError> {
        let window = create_window(coach_id, day, start_time, end_time)?;
        self.insert_window(window.clone()).await.map_err(|e| {
            EngineError::Internal(format!("failed to save availability: {e}"))
        })?;
        info!(
            "coach {coach_id} available {} {}-{}",
            window.day, window.start_time, window.end_time
        );
        Ok(window)
    }

    /// Book the 30-minute slot starting at `requested` with `coach_id`.
    pub async fn book_slot(
        &self,
        user_id: UserId,
        coach_id: CoachId,
        requested: Instant,
    ) -> Result<Booking, EngineError> {
        let windows = if coach_id == 0 {
            Vec::new()
        } else {
            self.windows_for_coach(coach_id).await
        };
        let start_time = check_bookable(user_id, coach_id, requested, &windows)?;

        let booking = Booking {
            id: Ulid::new(),
            user_id,
            coach_id,
            start_time,
            created_at: now(),
        };
        match self.insert_booking(booking.clone()).await {
            Ok(()) => {
                metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
                info!("booking {} user {user_id} coach {coach_id} at {}", booking.id, start_time.to_rfc3339());
                Ok(booking)
            }
            Err(e) => {
                if matches!(e, StoreError::DuplicateKey { .. }) {
                    metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                    debug!("coach {coach_id} already booked at {}", start_time.to_rfc3339());
                }
                Err(insert_error(e))
            }
        }
    }

    /// Cancel a booking on behalf of its owner.
    ///
    /// A missing booking is reported as `Internal`, and a non-owner as
    /// `BadRequest`.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        user_id: UserId,
    ) -> Result<(), EngineError> {
        let booking = self
            .booking_by_id(booking_id)
            .map_err(|e| EngineError::Internal(format!("failed to fetch booking: {e}")))?;
        if booking.user_id != user_id {
            return Err(EngineError::BadRequest(
                "not allowed to cancel this booking".into(),
            ));
        }
        self.delete_booking(booking_id)
            .await
            .map_err(|e| EngineError::Internal(format!("failed to delete booking: {e}")))?;
        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!("booking {booking_id} cancelled by user {user_id}");
        Ok(())
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    ///
    /// Holds the write gate for the whole snapshot + rewrite, so no append
    /// can land in the old file after the snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _gate = self.write_gate.write().await;
        let mut events = Vec::new();
        for cs in self.store.coach_handles() {
            let guard = cs.read().await;
            events.extend(guard.windows.iter().cloned().map(Event::WindowAdded));
            for id in guard.booked.values() {
                if let Some(booking) = self.store.booking(id) {
                    events.push(Event::BookingCreated(booking));
                }
            }
        }
        debug!("compacting WAL down to {} events", events.len());

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
