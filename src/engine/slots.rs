use chrono::NaiveDate;

use crate::model::*;

use super::calendar::{combine, normalize, slot_duration};
use super::window::{applies_to_date, bounds};

/// Fixed-width grid over one concrete `[start, end)` range.
///
/// Yields `start, start + 30m, …` while the slot still ends at or before `end`.
#[derive(Debug, Clone)]
pub struct SlotGrid {
    next: Instant,
    end: Instant,
}

impl SlotGrid {
    pub fn new(start: Instant, end: Instant) -> Self {
        Self { next: start, end }
    }
}

impl Iterator for SlotGrid {
    type Item = Instant;

    fn next(&mut self) -> Option<Instant> {
        let slot = self.next;
        if slot + slot_duration() > self.end {
            return None;
        }
        self.next = slot + slot_duration();
        Some(slot)
    }
}

/// Bookable start instants for `date`, window by window.
///
/// Windows for another weekday, or with damaged stored values, contribute
/// nothing. Output is concatenated in window order without sorting or
/// deduplication, so overlapping windows repeat their shared slots.
pub fn generate_slots(
    windows: &[AvailabilityWindow],
    date: NaiveDate,
) -> impl Iterator<Item = Instant> + '_ {
    windows
        .iter()
        .filter(move |w| applies_to_date(w, date))
        .filter_map(bounds)
        .flat_map(move |(start, end)| SlotGrid::new(combine(date, start), combine(date, end)))
}

/// Does a 30-minute slot starting at `requested` fit inside some window?
///
/// Grid alignment is not checked here.
pub fn is_within_availability(windows: &[AvailabilityWindow], requested: Instant) -> bool {
    let requested = normalize(&requested);
    let date = requested.date_naive();
    windows
        .iter()
        .filter(|w| applies_to_date(w, date))
        .filter_map(bounds)
        .any(|(start, end)| {
            combine(date, start) <= requested && requested + slot_duration() <= combine(date, end)
        })
}
