use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

/// Everything stored for one coach. Guarded as a unit so the
/// `(coach_id, start_time)` uniqueness check and the insert happen under
/// one write lock.
#[derive(Debug, Clone)]
pub struct CoachState {
    pub coach_id: CoachId,
    /// Windows in creation order.
    pub windows: Vec<AvailabilityWindow>,
    /// Unique index over live bookings: start time → booking id.
    pub booked: BTreeMap<Instant, Ulid>,
}

impl CoachState {
    pub fn new(coach_id: CoachId) -> Self {
        Self {
            coach_id,
            windows: Vec::new(),
            booked: BTreeMap::new(),
        }
    }

    pub fn is_booked(&self, start_time: &Instant) -> bool {
        self.booked.contains_key(start_time)
    }
}

pub type SharedCoachState = Arc<RwLock<CoachState>>;

/// In-memory tables: coaches (windows + slot index), bookings by id,
/// and a per-user booking index.
pub struct Store {
    coaches: DashMap<CoachId, SharedCoachState>,
    bookings: DashMap<Ulid, Booking>,
    by_user: DashMap<UserId, Vec<Ulid>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            coaches: DashMap::new(),
            bookings: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    // ── Coaches ──────────────────────────────────────────────

    pub fn coach_count(&self) -> usize {
        self.coaches.len()
    }

    pub fn get_coach(&self, coach_id: CoachId) -> Option<SharedCoachState> {
        self.coaches.get(&coach_id).map(|e| e.value().clone())
    }

    /// Coach state, created empty on first use.
    pub fn coach(&self, coach_id: CoachId) -> SharedCoachState {
        self.coaches
            .entry(coach_id)
            .or_insert_with(|| Arc::new(RwLock::new(CoachState::new(coach_id))))
            .value()
            .clone()
    }

    pub fn coach_handles(&self) -> Vec<SharedCoachState> {
        self.coaches.iter().map(|e| e.value().clone()).collect()
    }

    // ── Bookings ─────────────────────────────────────────────

    pub fn booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    /// A user's bookings starting at or after `from`, earliest first.
    pub fn bookings_for_user(&self, user_id: UserId, from: Instant) -> Vec<Booking> {
        let ids = self
            .by_user
            .get(&user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out: Vec<Booking> = ids
            .iter()
            .filter_map(|id| self.booking(id))
            .filter(|b| b.start_time >= from)
            .collect();
        out.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        out
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event to the coach it belongs to (caller holds that coach's
    /// write lock) and to the global indexes.
    pub fn apply_event(&self, cs: &mut CoachState, event: &Event) {
        match event {
            Event::WindowAdded(window) => {
                cs.windows.push(window.clone());
            }
            Event::BookingCreated(booking) => {
                cs.booked.insert(booking.start_time, booking.id);
                self.bookings.insert(booking.id, booking.clone());
                self.by_user.entry(booking.user_id).or_default().push(booking.id);
            }
            Event::BookingCancelled { id, user_id, .. } => {
                if let Some((_, booking)) = self.bookings.remove(id) {
                    // Only drop the slot index entry if it still points at this booking.
                    if cs.booked.get(&booking.start_time) == Some(id) {
                        cs.booked.remove(&booking.start_time);
                    }
                }
                if let Some(mut ids) = self.by_user.get_mut(user_id) {
                    ids.retain(|b| b != id);
                }
            }
        }
    }
}
