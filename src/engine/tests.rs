use std::path::PathBuf;
use std::sync::Arc;

use chrono::TimeDelta;

use super::*;
use crate::model::fixtures::{at, hm, span};
use crate::store::{NewField, NewPayment, NewReservation, NewSchedule, PaymentOutcome, StoreError};

// 2026-03-01 is a Sunday.
const DAY: &str = "2026-03-01";

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("fieldbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_field(owner_id: Id) -> NewField {
    NewField {
        owner_id,
        name: "Futsal Arena".into(),
        address: "Jl. Sudirman 5".into(),
        description: "indoor".into(),
        image_url: String::new(),
        price_per_hour: 150_000,
        created_at: at(DAY, "00:00"),
    }
}

fn pending(user_id: Id, field_id: Id, window: Span) -> NewReservation {
    NewReservation {
        user_id,
        field_id,
        span: window,
        total_price: 150_000 * window.whole_hours(),
        status: ReservationStatus::Pending,
        created_at: at(DAY, "06:00"),
    }
}

async fn engine_with_field(name: &str) -> (Engine, Id) {
    let engine = Engine::new(test_wal_path(name)).unwrap();
    let field = engine.create_field(new_field(1)).await.unwrap();
    (engine, field.id)
}

// ── Fields ───────────────────────────────────────────────

#[tokio::test]
async fn create_and_get_field() {
    let (engine, fid) = engine_with_field("create_field.wal").await;
    let field = engine.get_field(fid).await.unwrap();
    assert_eq!(field.id, fid);
    assert_eq!(field.owner_id, 1);
    assert_eq!(field.name, "Futsal Arena");
    assert!(matches!(
        engine.get_field(fid + 100).await,
        Err(StoreError::NotFound { entity: "field", .. })
    ));
}

#[tokio::test]
async fn field_ids_are_sequential() {
    let engine = Engine::new(test_wal_path("field_ids.wal")).unwrap();
    let a = engine.create_field(new_field(1)).await.unwrap();
    let b = engine.create_field(new_field(2)).await.unwrap();
    assert_eq!(a.id, 1);
    assert_eq!(b.id, 2);
}

#[tokio::test]
async fn list_fields_by_owner_filters() {
    let engine = Engine::new(test_wal_path("list_by_owner.wal")).unwrap();
    engine.create_field(new_field(1)).await.unwrap();
    engine.create_field(new_field(2)).await.unwrap();
    engine.create_field(new_field(1)).await.unwrap();

    assert_eq!(engine.list_fields().await.len(), 3);
    let mine: Vec<Id> = engine
        .list_fields_by_owner(1)
        .await
        .iter()
        .map(|f| f.id)
        .collect();
    assert_eq!(mine, vec![1, 3]);
}

#[tokio::test]
async fn update_field_keeps_identity() {
    let (engine, fid) = engine_with_field("update_field.wal").await;
    let mut field = engine.get_field(fid).await.unwrap();
    field.name = "Renamed".into();
    field.price_per_hour = 200_000;
    field.owner_id = 99; // ignored
    let updated = engine.update_field(field).await.unwrap();
    assert_eq!(updated.owner_id, 1);
    assert_eq!(updated.name, "Renamed");
    assert_eq!(engine.get_field(fid).await.unwrap().price_per_hour, 200_000);
}

#[tokio::test]
async fn delete_field_refused_while_booked() {
    let (engine, fid) = engine_with_field("delete_refused.wal").await;
    let (r, _) = engine
        .book(pending(7, fid, span(DAY, "10:00", "11:00")), "MIDTRANS")
        .await
        .unwrap();

    assert!(matches!(
        engine.delete_field(fid).await,
        Err(StoreError::Referenced(id)) if id == fid
    ));

    engine
        .transition_reservation(r.id, ReservationStatus::Pending, ReservationStatus::Cancelled)
        .await
        .unwrap();
    engine.delete_field(fid).await.unwrap();

    assert!(engine.get_field(fid).await.is_err());
    assert!(engine.get_reservation(r.id).await.is_err());
    assert!(engine.payment_for_reservation(r.id).is_err());
}

// ── Schedules ────────────────────────────────────────────

#[tokio::test]
async fn replace_schedules_sorts_by_day() {
    let (engine, fid) = engine_with_field("schedules_sorted.wal").await;
    let entries = vec![
        NewSchedule { day: DayOfWeek::Saturday, open: hm("08:00"), close: hm("22:00") },
        NewSchedule { day: DayOfWeek::Monday, open: hm("09:00"), close: hm("21:00") },
    ];
    engine.replace_schedules(fid, entries).await.unwrap();
    let days: Vec<DayOfWeek> = engine
        .list_schedules(fid)
        .await
        .unwrap()
        .iter()
        .map(|s| s.day)
        .collect();
    assert_eq!(days, vec![DayOfWeek::Monday, DayOfWeek::Saturday]);
}

#[tokio::test]
async fn replace_schedules_swaps_whole_set() {
    let (engine, fid) = engine_with_field("schedules_swap.wal").await;
    let monday = NewSchedule { day: DayOfWeek::Monday, open: hm("09:00"), close: hm("21:00") };
    let friday = NewSchedule { day: DayOfWeek::Friday, open: hm("10:00"), close: hm("12:00") };
    engine.replace_schedules(fid, vec![monday]).await.unwrap();
    engine.replace_schedules(fid, vec![friday]).await.unwrap();
    let all = engine.list_schedules(fid).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].day, DayOfWeek::Friday);
}

#[tokio::test]
async fn replace_schedules_rejects_duplicate_day() {
    let (engine, fid) = engine_with_field("schedules_dup.wal").await;
    let monday = NewSchedule { day: DayOfWeek::Monday, open: hm("09:00"), close: hm("21:00") };
    let result = engine.replace_schedules(fid, vec![monday, monday]).await;
    assert!(matches!(result, Err(StoreError::Duplicate(_))));
    assert!(engine.list_schedules(fid).await.unwrap().is_empty());
}

// ── Booking and conflicts ────────────────────────────────

#[tokio::test]
async fn book_links_reservation_and_payment() {
    let (engine, fid) = engine_with_field("book_links.wal").await;
    let (r, p) = engine
        .book(pending(7, fid, span(DAY, "10:00", "12:00")), "MIDTRANS")
        .await
        .unwrap();

    assert_eq!(r.payment_id, Some(p.id));
    assert_eq!(p.reservation_id, r.id);
    assert_eq!(p.amount, 300_000);
    assert_eq!(p.status, PaymentStatus::Pending);
    assert!(p.transaction_id.starts_with(&format!("MIDTRANS-{}-", r.id)));

    assert_eq!(engine.payment_for_reservation(r.id).unwrap(), p);
    assert_eq!(engine.payment_for_transaction(&p.transaction_id).unwrap(), p);
}

#[tokio::test]
async fn book_rejects_overlap() {
    let (engine, fid) = engine_with_field("book_overlap.wal").await;
    let (first, _) = engine
        .book(pending(7, fid, span(DAY, "10:00", "12:00")), "MIDTRANS")
        .await
        .unwrap();

    let result = engine
        .book(pending(8, fid, span(DAY, "11:00", "13:00")), "MIDTRANS")
        .await;
    assert!(matches!(result, Err(StoreError::Conflict(id)) if id == first.id));
    assert_eq!(engine.list_reservations_for_field(fid).await.len(), 1);
}

#[tokio::test]
async fn book_adjacent_windows_allowed() {
    let (engine, fid) = engine_with_field("book_adjacent.wal").await;
    engine
        .book(pending(7, fid, span(DAY, "10:00", "11:00")), "MIDTRANS")
        .await
        .unwrap();
    engine
        .book(pending(8, fid, span(DAY, "11:00", "12:00")), "MIDTRANS")
        .await
        .unwrap();
    engine
        .book(pending(9, fid, span(DAY, "09:00", "10:00")), "MIDTRANS")
        .await
        .unwrap();
    assert_eq!(engine.list_reservations_for_field(fid).await.len(), 3);
}

#[tokio::test]
async fn book_unknown_field_not_found() {
    let engine = Engine::new(test_wal_path("book_unknown.wal")).unwrap();
    let result = engine
        .book(pending(7, 42, span(DAY, "10:00", "11:00")), "MIDTRANS")
        .await;
    assert!(matches!(result, Err(StoreError::NotFound { entity: "field", .. })));
}

#[tokio::test]
async fn cancelled_reservation_frees_window() {
    let (engine, fid) = engine_with_field("cancel_frees.wal").await;
    let window = span(DAY, "10:00", "12:00");
    let (r, _) = engine.book(pending(7, fid, window), "MIDTRANS").await.unwrap();
    assert!(!engine.is_available(fid, &window).await);

    engine
        .transition_reservation(r.id, ReservationStatus::Pending, ReservationStatus::Cancelled)
        .await
        .unwrap();
    assert!(engine.is_available(fid, &window).await);
    assert!(engine.find_conflicts(fid, &window).await.is_empty());

    engine.book(pending(8, fid, window), "MIDTRANS").await.unwrap();
}

#[tokio::test]
async fn completed_reservation_does_not_block() {
    let (engine, fid) = engine_with_field("completed_frees.wal").await;
    let window = span(DAY, "10:00", "11:00");
    let (r, _) = engine.book(pending(7, fid, window), "MIDTRANS").await.unwrap();
    engine
        .transition_reservation(r.id, ReservationStatus::Pending, ReservationStatus::Confirmed)
        .await
        .unwrap();
    engine
        .transition_reservation(r.id, ReservationStatus::Confirmed, ReservationStatus::Completed)
        .await
        .unwrap();
    assert!(engine.is_available(fid, &window).await);
}

#[tokio::test]
async fn find_conflicts_in_start_order() {
    let (engine, fid) = engine_with_field("conflicts_order.wal").await;
    let (late, _) = engine
        .book(pending(7, fid, span(DAY, "14:00", "15:00")), "MIDTRANS")
        .await
        .unwrap();
    let (early, _) = engine
        .book(pending(8, fid, span(DAY, "09:00", "10:00")), "MIDTRANS")
        .await
        .unwrap();
    engine
        .book(pending(9, fid, span(DAY, "18:00", "19:00")), "MIDTRANS")
        .await
        .unwrap();

    let found: Vec<Id> = engine
        .find_conflicts(fid, &span(DAY, "08:00", "16:00"))
        .await
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(found, vec![early.id, late.id]);
}

#[tokio::test]
async fn available_iff_no_conflicts() {
    let (engine, fid) = engine_with_field("available_iff.wal").await;
    engine
        .book(pending(7, fid, span(DAY, "09:00", "10:00")), "MIDTRANS")
        .await
        .unwrap();
    let (cancelled, _) = engine
        .book(pending(8, fid, span(DAY, "11:00", "12:00")), "MIDTRANS")
        .await
        .unwrap();
    engine
        .transition_reservation(
            cancelled.id,
            ReservationStatus::Pending,
            ReservationStatus::Cancelled,
        )
        .await
        .unwrap();
    engine
        .book(pending(9, fid, span(DAY, "13:00", "15:00")), "MIDTRANS")
        .await
        .unwrap();

    for start_quarter in 28..64i64 {
        for len_quarters in 1..6i64 {
            let start = at(DAY, "00:00") + TimeDelta::minutes(start_quarter * 15);
            let window = Span::new(start, start + TimeDelta::minutes(len_quarters * 15));
            let available = engine.is_available(fid, &window).await;
            let found = engine.find_conflicts(fid, &window).await;
            assert_eq!(available, found.is_empty(), "window {window:?}");
            assert!(found.iter().all(|r| r.blocks() && r.span.overlaps(&window)));
        }
    }
}

#[tokio::test]
async fn missing_field_is_available() {
    let engine = Engine::new(test_wal_path("missing_available.wal")).unwrap();
    let window = span(DAY, "10:00", "11:00");
    assert!(engine.is_available(99, &window).await);
    assert!(engine.find_conflicts(99, &window).await.is_empty());
    assert!(engine.list_reservations_for_field(99).await.is_empty());
}

#[tokio::test]
async fn raw_insert_enforces_exclusion() {
    let (engine, fid) = engine_with_field("raw_insert.wal").await;
    engine
        .insert_reservation(pending(7, fid, span(DAY, "10:00", "12:00")))
        .await
        .unwrap();

    let overlapping = pending(8, fid, span(DAY, "11:00", "12:00"));
    assert!(matches!(
        engine.insert_reservation(overlapping.clone()).await,
        Err(StoreError::Conflict(_))
    ));

    // Terminal records may overlap anything.
    let cancelled = NewReservation {
        status: ReservationStatus::Cancelled,
        ..overlapping
    };
    let r = engine.insert_reservation(cancelled).await.unwrap();
    assert_eq!(r.payment_id, None);
}

// ── Updates and transitions ──────────────────────────────

#[tokio::test]
async fn transition_is_compare_and_set() {
    let (engine, fid) = engine_with_field("transition_cas.wal").await;
    let (r, _) = engine
        .book(pending(7, fid, span(DAY, "10:00", "11:00")), "MIDTRANS")
        .await
        .unwrap();
    engine
        .transition_reservation(r.id, ReservationStatus::Pending, ReservationStatus::Confirmed)
        .await
        .unwrap();

    let stale = engine
        .transition_reservation(r.id, ReservationStatus::Pending, ReservationStatus::Cancelled)
        .await;
    assert!(matches!(
        stale,
        Err(StoreError::StatusChanged { current: ReservationStatus::Confirmed })
    ));
}

#[tokio::test]
async fn reviving_cancelled_reservation_checks_overlap() {
    let (engine, fid) = engine_with_field("revive_overlap.wal").await;
    let window = span(DAY, "10:00", "11:00");
    let (first, _) = engine.book(pending(7, fid, window), "MIDTRANS").await.unwrap();
    engine
        .transition_reservation(first.id, ReservationStatus::Pending, ReservationStatus::Cancelled)
        .await
        .unwrap();
    let (second, _) = engine.book(pending(8, fid, window), "MIDTRANS").await.unwrap();

    let revived = engine
        .transition_reservation(first.id, ReservationStatus::Cancelled, ReservationStatus::Pending)
        .await;
    assert!(matches!(revived, Err(StoreError::Conflict(id)) if id == second.id));
}

#[tokio::test]
async fn update_reservation_rejects_immutable_changes() {
    let (engine, fid) = engine_with_field("update_immutable.wal").await;
    let (r, _) = engine
        .book(pending(7, fid, span(DAY, "10:00", "11:00")), "MIDTRANS")
        .await
        .unwrap();

    let moved = Reservation {
        span: span(DAY, "12:00", "13:00"),
        ..r.clone()
    };
    assert!(matches!(
        engine.update_reservation(moved).await,
        Err(StoreError::Immutable(_))
    ));

    let repriced = Reservation {
        total_price: 1,
        ..r.clone()
    };
    assert!(matches!(
        engine.update_reservation(repriced).await,
        Err(StoreError::Immutable(_))
    ));

    let confirmed = Reservation {
        status: ReservationStatus::Confirmed,
        ..r
    };
    let updated = engine.update_reservation(confirmed).await.unwrap();
    assert_eq!(updated.status, ReservationStatus::Confirmed);
}

#[tokio::test]
async fn delete_reservation_drops_payment() {
    let (engine, fid) = engine_with_field("delete_reservation.wal").await;
    let (r, p) = engine
        .book(pending(7, fid, span(DAY, "10:00", "11:00")), "MIDTRANS")
        .await
        .unwrap();
    engine.delete_reservation(r.id).await.unwrap();
    assert!(engine.get_reservation(r.id).await.is_err());
    assert!(engine.get_payment(p.id).is_err());
    assert!(engine.payment_for_transaction(&p.transaction_id).is_err());
    assert!(matches!(
        engine.delete_reservation(r.id).await,
        Err(StoreError::NotFound { entity: "reservation", .. })
    ));
}

#[tokio::test]
async fn list_for_user_newest_first() {
    let (engine, fid) = engine_with_field("user_newest.wal").await;
    let mut older = pending(7, fid, span(DAY, "15:00", "16:00"));
    older.created_at = at(DAY, "06:00");
    let mut newer = pending(7, fid, span(DAY, "08:00", "09:00"));
    newer.created_at = at(DAY, "07:00");
    let other = pending(8, fid, span(DAY, "12:00", "13:00"));

    let (a, _) = engine.book(older, "MIDTRANS").await.unwrap();
    let (b, _) = engine.book(newer, "MIDTRANS").await.unwrap();
    engine.book(other, "MIDTRANS").await.unwrap();

    let ids: Vec<Id> = engine
        .list_reservations_for_user(7)
        .await
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![b.id, a.id]);
}

// ── Payments ─────────────────────────────────────────────

#[tokio::test]
async fn payment_update_and_transaction_index() {
    let (engine, fid) = engine_with_field("payment_update.wal").await;
    let (_, p) = engine
        .book(pending(7, fid, span(DAY, "10:00", "11:00")), "MIDTRANS")
        .await
        .unwrap();

    let mut paid = p.clone();
    paid.mark_success(at(DAY, "06:30"));
    paid.transaction_id = "MIDTRANS-settled".into();
    engine.update_payment(paid).await.unwrap();

    assert!(engine.payment_for_transaction(&p.transaction_id).is_err());
    let found = engine.payment_for_transaction("MIDTRANS-settled").unwrap();
    assert_eq!(found.status, PaymentStatus::Success);
    assert_eq!(found.updated_at, at(DAY, "06:30"));

    let mut tampered = found.clone();
    tampered.amount = 1;
    assert!(matches!(
        engine.update_payment(tampered).await,
        Err(StoreError::Immutable(_))
    ));
}

#[tokio::test]
async fn insert_payment_one_per_reservation() {
    let (engine, fid) = engine_with_field("payment_insert.wal").await;
    let r = engine
        .insert_reservation(pending(7, fid, span(DAY, "10:00", "11:00")))
        .await
        .unwrap();
    let new_payment = NewPayment {
        reservation_id: r.id,
        amount: r.total_price,
        gateway: "MIDTRANS".into(),
        transaction_id: "MIDTRANS-manual".into(),
        status: PaymentStatus::Pending,
        created_at: at(DAY, "06:00"),
    };
    let p = engine.insert_payment(new_payment.clone()).await.unwrap();
    assert_eq!(engine.payment_for_reservation(r.id).unwrap().id, p.id);

    assert!(matches!(
        engine.insert_payment(new_payment).await,
        Err(StoreError::Duplicate(_))
    ));

    engine.delete_payment(p.id).await.unwrap();
    assert!(engine.payment_for_reservation(r.id).is_err());
}

#[tokio::test]
async fn insert_payment_requires_reservation() {
    let engine = Engine::new(test_wal_path("payment_orphan.wal")).unwrap();
    let result = engine
        .insert_payment(NewPayment {
            reservation_id: 5,
            amount: 1,
            gateway: "MIDTRANS".into(),
            transaction_id: "x".into(),
            status: PaymentStatus::Pending,
            created_at: at(DAY, "06:00"),
        })
        .await;
    assert!(matches!(result, Err(StoreError::NotFound { entity: "reservation", .. })));
}

#[tokio::test]
async fn settle_payment_moves_payment_and_reservation_together() {
    let (engine, fid) = engine_with_field("settle_success.wal").await;
    let (r, p) = engine
        .book(pending(7, fid, span(DAY, "10:00", "11:00")), "MIDTRANS")
        .await
        .unwrap();

    let settled = engine
        .settle_payment(&p.transaction_id, PaymentOutcome::Success, at(DAY, "06:30"))
        .await
        .unwrap();
    assert_eq!(settled.moved_to, Some(ReservationStatus::Confirmed));
    assert_eq!(settled.payment.status, PaymentStatus::Success);
    assert_eq!(settled.payment.updated_at, at(DAY, "06:30"));
    assert_eq!(engine.get_reservation(r.id).await.unwrap(), settled.reservation);
    assert_eq!(engine.payment_for_reservation(r.id).unwrap(), settled.payment);

    assert!(matches!(
        engine
            .settle_payment(&p.transaction_id, PaymentOutcome::Failed, at(DAY, "06:40"))
            .await,
        Err(StoreError::PaymentStatusChanged { current: PaymentStatus::Success })
    ));
    assert_eq!(
        engine.get_reservation(r.id).await.unwrap().status,
        ReservationStatus::Confirmed
    );
}

#[tokio::test]
async fn settle_success_refused_unless_pending() {
    let (engine, fid) = engine_with_field("settle_cancelled.wal").await;
    let (r, p) = engine
        .book(pending(7, fid, span(DAY, "10:00", "11:00")), "MIDTRANS")
        .await
        .unwrap();
    engine
        .transition_reservation(r.id, ReservationStatus::Pending, ReservationStatus::Cancelled)
        .await
        .unwrap();

    assert!(matches!(
        engine
            .settle_payment(&p.transaction_id, PaymentOutcome::Success, at(DAY, "06:30"))
            .await,
        Err(StoreError::StatusChanged { current: ReservationStatus::Cancelled })
    ));
    assert!(engine.payment_for_reservation(r.id).unwrap().is_pending());

    // Failure is still recorded; the booking is already released.
    let settled = engine
        .settle_payment(&p.transaction_id, PaymentOutcome::Failed, at(DAY, "06:30"))
        .await
        .unwrap();
    assert_eq!(settled.moved_to, None);
    assert_eq!(settled.reservation.status, ReservationStatus::Cancelled);
    assert_eq!(settled.payment.status, PaymentStatus::Failed);
}

#[tokio::test]
async fn settle_unknown_transaction_not_found() {
    let (engine, _) = engine_with_field("settle_unknown.wal").await;
    assert!(matches!(
        engine
            .settle_payment("MIDTRANS-0-0", PaymentOutcome::Success, at(DAY, "06:30"))
            .await,
        Err(StoreError::NotFound { .. })
    ));
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_settlements_apply_exactly_one() {
    let (engine, fid) = engine_with_field("concurrent_settle.wal").await;
    let engine = Arc::new(engine);

    for hour in 0..8i64 {
        let start = at(DAY, "08:00") + TimeDelta::hours(hour);
        let (r, p) = engine
            .book(pending(7, fid, Span::new(start, start + TimeDelta::hours(1))), "MIDTRANS")
            .await
            .unwrap();

        let (succeeded, failed) = tokio::join!(
            tokio::spawn({
                let engine = engine.clone();
                let tx = p.transaction_id.clone();
                async move {
                    engine
                        .settle_payment(&tx, PaymentOutcome::Success, at(DAY, "06:30"))
                        .await
                }
            }),
            tokio::spawn({
                let engine = engine.clone();
                let tx = p.transaction_id.clone();
                async move {
                    engine
                        .settle_payment(&tx, PaymentOutcome::Failed, at(DAY, "06:30"))
                        .await
                }
            }),
        );
        let (succeeded, failed) = (succeeded.unwrap(), failed.unwrap());
        assert_ne!(succeeded.is_ok(), failed.is_ok(), "exactly one settlement applies");
        let loser = if succeeded.is_ok() { failed } else { succeeded };
        assert!(matches!(loser, Err(StoreError::PaymentStatusChanged { .. })));

        let reservation = engine.get_reservation(r.id).await.unwrap();
        let payment = engine.payment_for_reservation(r.id).unwrap();
        match payment.status {
            PaymentStatus::Success => assert_eq!(reservation.status, ReservationStatus::Confirmed),
            PaymentStatus::Failed => assert_eq!(reservation.status, ReservationStatus::Cancelled),
            PaymentStatus::Pending => panic!("payment left pending"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_bookings_admit_exactly_one() {
    let (engine, fid) = engine_with_field("concurrent_book.wal").await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..32i64 {
        let engine = engine.clone();
        // Every window overlaps 10:30-11:00.
        let start = at(DAY, "10:00") + TimeDelta::minutes(i % 3 * 10);
        let window = Span::new(start, start + TimeDelta::hours(1));
        handles.push(tokio::spawn(async move {
            engine.book(pending(100 + i, fid, window), "MIDTRANS").await
        }));
    }

    let mut admitted = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(StoreError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(conflicts, 31);
    assert_eq!(engine.list_reservations_for_field(fid).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_disjoint_bookings_all_admitted() {
    let (engine, fid) = engine_with_field("concurrent_disjoint.wal").await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..12i64 {
        let engine = engine.clone();
        let start = at(DAY, "00:00") + TimeDelta::hours(i);
        let window = Span::new(start, start + TimeDelta::hours(1));
        handles.push(tokio::spawn(async move {
            engine.book(pending(i, fid, window), "MIDTRANS").await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    let all = engine.list_reservations_for_field(fid).await;
    assert_eq!(all.len(), 12);
    assert!(all.windows(2).all(|w| w[0].span.start <= w[1].span.start));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn settlement_survives_replay() {
    let path = test_wal_path("settle_replay.wal");
    let settled = {
        let engine = Engine::new(path.clone()).unwrap();
        let field = engine.create_field(new_field(1)).await.unwrap();
        let (_, p) = engine
            .book(pending(7, field.id, span(DAY, "10:00", "11:00")), "MIDTRANS")
            .await
            .unwrap();
        engine
            .settle_payment(&p.transaction_id, PaymentOutcome::Failed, at(DAY, "06:30"))
            .await
            .unwrap()
    };

    let engine = Engine::new(path).unwrap();
    let r = engine.get_reservation(settled.reservation.id).await.unwrap();
    assert_eq!(r, settled.reservation);
    assert_eq!(r.status, ReservationStatus::Cancelled);
    assert_eq!(
        engine.payment_for_transaction(&settled.payment.transaction_id).unwrap(),
        settled.payment
    );
}

#[tokio::test]
async fn writes_after_damaged_tail_survive_restart() {
    let path = test_wal_path("damaged_tail_restart.wal");
    let first = {
        let engine = Engine::new(path.clone()).unwrap();
        engine.create_field(new_field(1)).await.unwrap()
    };
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[200u8, 0, 0, 0, 7, 7, 7]).unwrap();
    }

    let second = {
        let engine = Engine::new(path.clone()).unwrap();
        assert_eq!(engine.get_field(first.id).await.unwrap(), first);
        engine.create_field(new_field(2)).await.unwrap()
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.get_field(first.id).await.unwrap(), first);
    assert_eq!(engine.get_field(second.id).await.unwrap(), second);
    assert_eq!(engine.list_fields().await.len(), 2);
}

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay_restore.wal");
    let (fid, rid, pid) = {
        let engine = Engine::new(path.clone()).unwrap();
        let field = engine.create_field(new_field(1)).await.unwrap();
        engine
            .replace_schedules(
                field.id,
                vec![NewSchedule { day: DayOfWeek::Sunday, open: hm("08:00"), close: hm("22:00") }],
            )
            .await
            .unwrap();
        let (r, p) = engine
            .book(pending(7, field.id, span(DAY, "10:00", "11:00")), "MIDTRANS")
            .await
            .unwrap();
        engine
            .transition_reservation(r.id, ReservationStatus::Pending, ReservationStatus::Confirmed)
            .await
            .unwrap();
        (field.id, r.id, p.id)
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.get_field(fid).await.unwrap().name, "Futsal Arena");
    assert_eq!(engine.list_schedules(fid).await.unwrap().len(), 1);
    let r = engine.get_reservation(rid).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Confirmed);
    assert_eq!(engine.payment_for_reservation(rid).unwrap().id, pid);

    // Sequences resume after the replayed ids.
    let next = engine.create_field(new_field(1)).await.unwrap();
    assert_eq!(next.id, fid + 1);
}

#[tokio::test]
async fn compaction_preserves_state_and_sequences() {
    let path = test_wal_path("compact_state.wal");
    let (kept, dropped_field) = {
        let engine = Engine::new(path.clone()).unwrap();
        let a = engine.create_field(new_field(1)).await.unwrap();
        let b = engine.create_field(new_field(1)).await.unwrap();
        let (r, _) = engine
            .book(pending(7, a.id, span(DAY, "10:00", "11:00")), "MIDTRANS")
            .await
            .unwrap();
        for _ in 0..5 {
            let (tmp, _) = engine
                .book(pending(7, a.id, span(DAY, "12:00", "13:00")), "MIDTRANS")
                .await
                .unwrap();
            engine.delete_reservation(tmp.id).await.unwrap();
        }
        engine.delete_field(b.id).await.unwrap();

        let before = std::fs::metadata(&path).unwrap().len();
        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        (r, b.id)
    };

    let engine = Engine::new(path).unwrap();
    let r = engine.get_reservation(kept.id).await.unwrap();
    assert_eq!(r, kept);
    assert!(engine.payment_for_reservation(kept.id).is_ok());
    assert!(engine.get_field(dropped_field).await.is_err());

    // The deleted field's id is not handed out again.
    let next = engine.create_field(new_field(1)).await.unwrap();
    assert!(next.id > dropped_field);
}
