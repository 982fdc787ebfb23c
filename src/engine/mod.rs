pub mod calendar;
mod conflict;
mod error;
mod mutations;
mod queries;
pub mod slots;
pub mod store;
#[cfg(test)]
mod tests;
pub mod window;

pub use calendar::{DayOfWeek, ParseError, TimeOfDay};
pub use error::{EngineError, StoreError};
pub use slots::{generate_slots, is_within_availability};
pub use window::{applies_to_date, create_window};

use std::io;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use store::{SharedCoachState, Store};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then pays for a single fsync and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        flush_and_respond(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even after an append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Durable scheduling state: in-memory tables rebuilt from, and written
/// through to, the WAL.
pub struct Engine {
    pub store: Store,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Shared by every write path, taken exclusively by compaction.
    /// Always acquired before any coach lock.
    write_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: Store::new(),
            wal_tx,
            write_gate: RwLock::new(()),
        };

        // Sole owner of every lock during replay, so try_write never contends.
        // Never use blocking_write here: this runs inside the runtime.
        for event in &events {
            let coach = engine.store.coach(event.coach_id());
            let mut guard = coach
                .try_write()
                .map_err(|_| io::Error::other("replay: coach state unexpectedly locked"))?;
            engine.store.apply_event(&mut guard, event);
        }
        tracing::info!(
            "replayed {} events ({} coaches, {} live bookings)",
            events.len(),
            engine.store.coach_count(),
            engine.store.booking_count()
        );

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    /// WAL-append then apply, with the coach's write lock held by the caller.
    async fn persist_and_apply(
        &self,
        cs: &mut store::CoachState,
        event: &Event,
    ) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        self.store.apply_event(cs, event);
        Ok(())
    }

    fn coach_for_write(&self, coach_id: CoachId) -> Result<SharedCoachState, StoreError> {
        if let Some(cs) = self.store.get_coach(coach_id) {
            return Ok(cs);
        }
        if self.store.coach_count() >= MAX_COACHES {
            return Err(StoreError::LimitExceeded("too many coaches"));
        }
        Ok(self.store.coach(coach_id))
    }

    // ── Persistence collaborator ─────────────────────────────

    pub async fn insert_window(&self, window: AvailabilityWindow) -> Result<(), StoreError> {
        let _gate = self.write_gate.read().await;
        let cs = self.coach_for_write(window.coach_id)?;
        let mut guard = cs.write().await;
        if guard.windows.len() >= MAX_WINDOWS_PER_COACH {
            return Err(StoreError::LimitExceeded("too many windows for coach"));
        }
        self.persist_and_apply(&mut guard, &Event::WindowAdded(window))
            .await
    }

    pub async fn windows_for_coach(&self, coach_id: CoachId) -> Vec<AvailabilityWindow> {
        match self.store.get_coach(coach_id) {
            Some(cs) => cs.read().await.windows.clone(),
            None => Vec::new(),
        }
    }

    /// Insert a booking. The `(coach_id, start_time)` pair is checked and
    /// claimed under the coach's write lock, so of any number of concurrent
    /// inserts for one pair exactly one gets through.
    pub async fn insert_booking(&self, booking: Booking) -> Result<(), StoreError> {
        let _gate = self.write_gate.read().await;
        let cs = self.coach_for_write(booking.coach_id)?;
        let mut guard = cs.write().await;
        if guard.is_booked(&booking.start_time) {
            return Err(StoreError::DuplicateKey {
                coach_id: booking.coach_id,
                start_time: booking.start_time,
            });
        }
        self.persist_and_apply(&mut guard, &Event::BookingCreated(booking))
            .await
    }

    pub fn booking_by_id(&self, id: Ulid) -> Result<Booking, StoreError> {
        self.store.booking(&id).ok_or(StoreError::NotFound(id))
    }

    pub fn bookings_for_user(&self, user_id: UserId, from: Instant) -> Vec<Booking> {
        self.store.bookings_for_user(user_id, from)
    }

    pub async fn delete_booking(&self, id: Ulid) -> Result<(), StoreError> {
        let _gate = self.write_gate.read().await;
        let booking = self.booking_by_id(id)?;
        let cs = self
            .store
            .get_coach(booking.coach_id)
            .ok_or(StoreError::NotFound(id))?;
        let mut guard = cs.write().await;
        // Re-check under the lock: a concurrent cancel may have won.
        if self.store.booking(&id).is_none() {
            return Err(StoreError::NotFound(id));
        }
        let event = Event::BookingCancelled {
            id,
            coach_id: booking.coach_id,
            user_id: booking.user_id,
        };
        self.persist_and_apply(&mut guard, &event).await
    }
}
