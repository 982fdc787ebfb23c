use std::path::PathBuf;
use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate, TimeZone, Utc};
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use super::*;
use crate::limits::*;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// 2030-01-07 is a Monday.
fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
}

fn monday_at(hour: u32, minute: u32) -> Instant {
    Utc.with_ymd_and_hms(2030, 1, 7, hour, minute, 0).unwrap()
}

async fn engine_with_monday_morning(name: &str) -> Engine {
    let engine = Engine::new(test_wal_path(name)).unwrap();
    assert_ok!(engine.add_availability(1, "Monday", "09:00", "10:00").await);
    engine
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn add_availability_stores_canonical_window() {
    let engine = Engine::new(test_wal_path("add_window.wal")).unwrap();
    let window = engine
        .add_availability(1, " monday ", "09:00", "10:00")
        .await
        .unwrap();
    assert_eq!(window.day, "Monday");
    assert_eq!(window.coach_id, 1);

    let listed = engine.list_windows(1).await;
    assert_eq!(listed, vec![window]);
    assert!(engine.list_windows(2).await.is_empty());
}

#[tokio::test]
async fn rejected_window_is_not_persisted() {
    let engine = Engine::new(test_wal_path("rejected_window.wal")).unwrap();
    let err = engine
        .add_availability(1, "Funday", "09:00", "10:00")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::BadRequest("invalid day; use Monday..Sunday".into())
    );

    assert_err!(engine.add_availability(1, "Monday", "10:00", "10:00").await);
    assert_err!(engine.add_availability(1, "Monday", "09:00", "09:20").await);
    assert_err!(engine.add_availability(0, "Monday", "09:00", "10:00").await);
    assert!(engine.list_windows(1).await.is_empty());
}

#[tokio::test]
async fn slots_for_monday_window() {
    let engine = engine_with_monday_morning("slots_monday.wal").await;
    let slots = engine.available_slots(1, monday()).await;
    assert_eq!(slots, vec![monday_at(9, 0), monday_at(9, 30)]);

    let tuesday = monday().succ_opt().unwrap();
    assert!(engine.available_slots(1, tuesday).await.is_empty());
    assert!(engine.available_slots(99, monday()).await.is_empty());
}

#[tokio::test]
async fn booked_slots_are_still_listed() {
    let engine = engine_with_monday_morning("booked_still_listed.wal").await;
    assert_ok!(engine.book_slot(5, 1, monday_at(9, 0)).await);
    assert_eq!(engine.available_slots(1, monday()).await.len(), 2);
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn book_then_double_book_conflicts() {
    let engine = engine_with_monday_morning("double_book.wal").await;

    let booking = engine.book_slot(5, 1, monday_at(9, 0)).await.unwrap();
    assert_eq!(booking.user_id, 5);
    assert_eq!(booking.coach_id, 1);
    assert_eq!(booking.start_time, monday_at(9, 0));

    let err = engine.book_slot(6, 1, monday_at(9, 0)).await.unwrap_err();
    assert_eq!(err, EngineError::Conflict("slot already booked".into()));
    assert_eq!(engine.store.booking_count(), 1);
}

#[tokio::test]
async fn misaligned_booking_is_bad_request() {
    let engine = engine_with_monday_morning("misaligned.wal").await;
    let err = engine.book_slot(5, 1, monday_at(9, 15)).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::BadRequest("datetime must be :00 or :30 minutes".into())
    );
}

#[tokio::test]
async fn booking_outside_availability_is_bad_request() {
    let engine = engine_with_monday_morning("outside.wal").await;
    // 10:00 would end at 10:30, past the window end
    let err = engine.book_slot(5, 1, monday_at(10, 0)).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::BadRequest("slot not within coach availability".into())
    );
    assert_err!(engine.book_slot(5, 2, monday_at(9, 0)).await);
    assert_eq!(engine.store.booking_count(), 0);
}

#[tokio::test]
async fn missing_ids_are_bad_request() {
    let engine = engine_with_monday_morning("missing_ids.wal").await;
    for (user, coach) in [(0, 1), (5, 0), (0, 0)] {
        let err = engine.book_slot(user, coach, monday_at(9, 0)).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::BadRequest("user_id and coach_id required".into())
        );
    }
}

#[tokio::test]
async fn offset_input_books_the_same_slot() {
    let engine = engine_with_monday_morning("offset_input.wal").await;
    let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
    let local = plus_two.with_ymd_and_hms(2030, 1, 7, 11, 30, 0).unwrap();

    let booking = engine
        .book_slot(5, 1, local.with_timezone(&Utc))
        .await
        .unwrap();
    assert_eq!(booking.start_time, monday_at(9, 30));
    assert_err!(engine.book_slot(6, 1, monday_at(9, 30)).await);
}

#[tokio::test]
async fn seconds_collapse_onto_the_slot() {
    let engine = engine_with_monday_morning("seconds.wal").await;
    let with_seconds = Utc.with_ymd_and_hms(2030, 1, 7, 9, 0, 42).unwrap();
    let booking = engine.book_slot(5, 1, with_seconds).await.unwrap();
    assert_eq!(booking.start_time, monday_at(9, 0));

    let err = engine.book_slot(6, 1, monday_at(9, 0)).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn concurrent_bookings_for_one_slot_admit_exactly_one() {
    let engine = Arc::new(engine_with_monday_morning("race.wal").await);

    let mut handles = Vec::new();
    for user in 1..=32u64 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.book_slot(user, 1, monday_at(9, 30)).await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 31);
    assert_eq!(engine.store.booking_count(), 1);
}

#[tokio::test]
async fn different_coaches_share_a_start_time() {
    let engine = engine_with_monday_morning("two_coaches.wal").await;
    assert_ok!(engine.add_availability(2, "Monday", "09:00", "10:00").await);
    assert_ok!(engine.book_slot(5, 1, monday_at(9, 0)).await);
    assert_ok!(engine.book_slot(5, 2, monday_at(9, 0)).await);
}

// ── Listing and cancellation ─────────────────────────────

#[tokio::test]
async fn user_bookings_are_upcoming_and_ordered() {
    let engine = engine_with_monday_morning("user_bookings.wal").await;
    let later = engine.book_slot(5, 1, monday_at(9, 30)).await.unwrap();
    let earlier = engine.book_slot(5, 1, monday_at(9, 0)).await.unwrap();

    let listed = engine.user_bookings(5).unwrap();
    assert_eq!(listed, vec![earlier, later]);
    assert!(engine.user_bookings(6).unwrap().is_empty());
}

#[tokio::test]
async fn user_bookings_requires_user() {
    let engine = Engine::new(test_wal_path("user_required.wal")).unwrap();
    assert_eq!(
        engine.user_bookings(0).unwrap_err(),
        EngineError::BadRequest("user_id required".into())
    );
}

#[tokio::test]
async fn past_bookings_are_not_listed() {
    let engine = Engine::new(test_wal_path("past_bookings.wal")).unwrap();
    assert_ok!(engine.add_availability(1, "Monday", "09:00", "10:00").await);
    // 2001-01-01 was a Monday
    let past = Utc.with_ymd_and_hms(2001, 1, 1, 9, 0, 0).unwrap();
    assert_ok!(engine.book_slot(5, 1, past).await);
    assert!(engine.user_bookings(5).unwrap().is_empty());
}

#[tokio::test]
async fn owner_cancels_and_slot_frees_up() {
    let engine = engine_with_monday_morning("cancel_owner.wal").await;
    let booking = engine.book_slot(5, 1, monday_at(9, 0)).await.unwrap();

    assert_ok!(engine.cancel_booking(booking.id, 5).await);
    assert!(engine.user_bookings(5).unwrap().is_empty());
    assert_ok!(engine.book_slot(6, 1, monday_at(9, 0)).await);
}

#[tokio::test]
async fn non_owner_cannot_cancel() {
    let engine = engine_with_monday_morning("cancel_other.wal").await;
    let booking = engine.book_slot(5, 1, monday_at(9, 0)).await.unwrap();

    let err = engine.cancel_booking(booking.id, 6).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::BadRequest("not allowed to cancel this booking".into())
    );
    assert_eq!(engine.user_bookings(5).unwrap(), vec![booking]);
}

#[tokio::test]
async fn cancelling_unknown_booking_is_internal() {
    let engine = Engine::new(test_wal_path("cancel_unknown.wal")).unwrap();
    let err = engine.cancel_booking(Ulid::new(), 5).await.unwrap_err();
    assert!(matches!(err, EngineError::Internal(ref m) if m.starts_with("failed to fetch booking")));
}

#[tokio::test]
async fn cancelling_twice_fails_the_second_time() {
    let engine = engine_with_monday_morning("cancel_twice.wal").await;
    let booking = engine.book_slot(5, 1, monday_at(9, 0)).await.unwrap();
    assert_ok!(engine.cancel_booking(booking.id, 5).await);
    assert!(matches!(
        engine.cancel_booking(booking.id, 5).await,
        Err(EngineError::Internal(_))
    ));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let (kept, cancelled) = {
        let engine = Engine::new(path.clone()).unwrap();
        assert_ok!(engine.add_availability(1, "Monday", "09:00", "10:00").await);
        let kept = engine.book_slot(5, 1, monday_at(9, 0)).await.unwrap();
        let cancelled = engine.book_slot(5, 1, monday_at(9, 30)).await.unwrap();
        assert_ok!(engine.cancel_booking(cancelled.id, 5).await);
        (kept, cancelled)
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.list_windows(1).await.len(), 1);
    assert_eq!(engine.user_bookings(5).unwrap(), vec![kept]);
    assert!(engine.booking_by_id(cancelled.id).is_err());

    let err = engine.book_slot(6, 1, monday_at(9, 0)).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    assert_ok!(engine.book_slot(6, 1, monday_at(9, 30)).await);
}

#[tokio::test]
async fn bookings_after_torn_tail_survive_the_next_restart() {
    use std::io::Write;

    let path = test_wal_path("torn_tail.wal");
    let first = {
        let engine = Engine::new(path.clone()).unwrap();
        assert_ok!(engine.add_availability(1, "Monday", "09:00", "10:00").await);
        engine.book_slot(5, 1, monday_at(9, 0)).await.unwrap()
    };
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[7u8, 0, 0, 0, 1, 2]).unwrap();
    }

    let second = {
        let engine = Engine::new(path.clone()).unwrap();
        let second = engine.book_slot(6, 1, monday_at(9, 30)).await.unwrap();
        assert_eq!(engine.store.booking_count(), 2);
        second
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.store.booking_count(), 2);
    assert_eq!(engine.user_bookings(5).unwrap(), vec![first]);
    assert_eq!(engine.user_bookings(6).unwrap(), vec![second]);
    let err = engine.book_slot(7, 1, monday_at(9, 30)).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let kept = {
        let engine = Engine::new(path.clone()).unwrap();
        assert_ok!(engine.add_availability(1, "Monday", "09:00", "10:00").await);
        for user in 10..20 {
            let b = engine.book_slot(user, 1, monday_at(9, 0)).await.unwrap();
            assert_ok!(engine.cancel_booking(b.id, user).await);
        }
        let kept = engine.book_slot(5, 1, monday_at(9, 30)).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 22);

        let before = std::fs::metadata(&path).unwrap().len();
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(std::fs::metadata(&path).unwrap().len() < before);

        // Appends after compaction land in the new file.
        assert_ok!(engine.add_availability(1, "Tuesday", "13:00", "14:00").await);
        kept
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.list_windows(1).await.len(), 2);
    assert_eq!(engine.user_bookings(5).unwrap(), vec![kept]);
    assert_eq!(engine.store.booking_count(), 1);
}

#[tokio::test]
async fn compaction_races_with_bookings() {
    let path = test_wal_path("compaction_race.wal");
    let engine = Arc::new(Engine::new(path.clone()).unwrap());
    assert_ok!(engine.add_availability(1, "Monday", "00:00", "23:30").await);

    let mut handles = Vec::new();
    for i in 0..40u32 {
        let booker = engine.clone();
        handles.push(tokio::spawn(async move {
            booker
                .book_slot(5, 1, monday_at(i / 2, (i % 2) * 30))
                .await
                .map(|_| ())
        }));
        if i % 10 == 0 {
            let compactor = engine.clone();
            handles.push(tokio::spawn(async move {
                compactor.compact_wal().await.map_err(|e| EngineError::Internal(e.to_string()))
            }));
        }
    }
    for h in handles {
        assert_ok!(h.await.unwrap());
    }
    drop(engine);

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.store.booking_count(), 40);
}

// ── Limits ───────────────────────────────────────────────

#[tokio::test]
async fn window_limit_per_coach() {
    let engine = Engine::new(test_wal_path("window_limit.wal")).unwrap();
    for _ in 0..MAX_WINDOWS_PER_COACH {
        assert_ok!(engine.add_availability(1, "Monday", "09:00", "10:00").await);
    }
    let err = engine
        .add_availability(1, "Monday", "09:00", "10:00")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Internal(ref m) if m.contains("too many windows")));
    // Other coaches are unaffected.
    assert_ok!(engine.add_availability(2, "Monday", "09:00", "10:00").await);
}
