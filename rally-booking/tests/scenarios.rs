mod common;

use chrono::Duration;
use common::{confirm_request, court_c1, hold_request, hours, World};
use rally_booking::ShareLocator;
use rally_core::{BookingStatus, ConflictKind, CoreError, SplitEntry};

#[tokio::test]
async fn scenario_a_full_payment_confirms() {
    let world = World::new();
    let hold = world.engine.locks.acquire(hold_request("member-1", hours(18, 19))).await.unwrap();

    let confirmation = world
        .engine
        .confirmer
        .confirm(confirm_request(hold.id, hours(18, 19), 10_000, vec![]))
        .await
        .unwrap();

    assert_eq!(confirmation.booking.status, BookingStatus::Confirmed);
    assert_eq!(confirmation.booking.paid_cents, 10_000);
    assert!(!confirmation.idempotent_replay);
    assert_eq!(world.events.topics(), vec!["holds.acquired", "holds.released", "bookings.confirmed"]);
}

#[tokio::test]
async fn scenario_b_second_acquire_sees_the_lock() {
    let world = World::new();
    world.engine.locks.acquire(hold_request("member-1", hours(18, 19))).await.unwrap();

    match world.engine.locks.acquire(hold_request("member-2", hours(18, 19))).await {
        Err(CoreError::SlotTaken(conflict)) => assert_eq!(conflict.kind, ConflictKind::Lock),
        other => panic!("expected SlotTaken, got {:?}", other),
    }
}

#[tokio::test]
async fn scenario_c_split_payment_walks_to_confirmed() {
    let world = World::new();
    let hold = world.engine.locks.acquire(hold_request("member-1", hours(18, 19))).await.unwrap();
    let plan = vec![
        SplitEntry { payer: None, amount_cents: 4_000 },
        SplitEntry { payer: None, amount_cents: 6_000 },
    ];

    let confirmation = world
        .engine
        .confirmer
        .confirm(confirm_request(hold.id, hours(18, 19), 10_000, plan))
        .await
        .unwrap();
    assert_eq!(confirmation.booking.status, BookingStatus::PendingPayments);
    assert_eq!(confirmation.booking.paid_cents, 0);
    assert_eq!(confirmation.shares.len(), 2);

    let forty = confirmation.shares.iter().find(|s| s.share.amount_cents == 4_000).unwrap();
    let sixty = confirmation.shares.iter().find(|s| s.share.amount_cents == 6_000).unwrap();

    let outcome = world
        .engine
        .payments
        .record_payment(ShareLocator::ShareId(forty.share.id), None)
        .await
        .unwrap();
    assert_eq!(outcome.status, BookingStatus::PartiallyPaid);
    assert_eq!(outcome.paid_cents, 4_000);

    let outcome = world
        .engine
        .payments
        .record_payment(ShareLocator::ShareId(sixty.share.id), Some("psp-42".into()))
        .await
        .unwrap();
    assert_eq!(outcome.status, BookingStatus::Confirmed);
    assert_eq!(outcome.paid_cents, 10_000);
}

#[tokio::test]
async fn scenario_d_expired_hold_is_reclaimed_by_the_sweep() {
    let world = World::new();
    let mut request = hold_request("member-1", hours(18, 19));
    request.hold_minutes = Some(1);
    world.engine.locks.acquire(request).await.unwrap();

    world.clock.advance(Duration::minutes(2));
    // Not before the sweep: the expired row still blocks the insert.
    assert!(matches!(
        world.engine.locks.acquire(hold_request("member-2", hours(18, 19))).await,
        Err(CoreError::SlotTaken(_))
    ));

    let report = world.engine.sweeper.run_once().await;
    assert_eq!(report.holds_expired, Some(1));

    let hold = world.engine.locks.acquire(hold_request("member-2", hours(18, 19))).await.unwrap();
    assert_eq!(hold.holder_id, "member-2");
}

#[tokio::test]
async fn scenario_e_repeated_confirm_replays() {
    let world = World::new();
    let hold = world.engine.locks.acquire(hold_request("member-1", hours(18, 19))).await.unwrap();
    let plan = vec![SplitEntry { payer: None, amount_cents: 10_000 }];
    let mut request = confirm_request(hold.id, hours(18, 19), 10_000, plan);
    request.idempotency_key = Some("checkout-7f3a".into());

    let first = world.engine.confirmer.confirm(request.clone()).await.unwrap();
    let second = world.engine.confirmer.confirm(request).await.unwrap();

    assert_eq!(first.booking.id, second.booking.id);
    assert!(second.idempotent_replay);
    assert_eq!(first.shares, second.shares);
    assert_eq!(world.store.bookings().await.len(), 1);
    assert_eq!(world.store.shares().await.len(), 1);
    assert_eq!(world.store.idempotency_records().await.len(), 1);
}

#[tokio::test]
async fn lapsed_split_booking_frees_its_slot_after_the_sweep() {
    let world = World::new();
    let hold = world.engine.locks.acquire(hold_request("member-1", hours(18, 19))).await.unwrap();
    let plan = vec![SplitEntry { payer: None, amount_cents: 10_000 }];
    let booking = world
        .engine
        .confirmer
        .confirm(confirm_request(hold.id, hours(18, 19), 10_000, plan))
        .await
        .unwrap()
        .booking;

    world.clock.advance(Duration::minutes(1441));
    assert!(world.engine.locks.acquire(hold_request("member-2", hours(18, 19))).await.is_err());

    let report = world.engine.sweeper.run_once().await;
    assert_eq!(report.bookings_expired, Some(1));
    assert!(world.engine.locks.acquire(hold_request("member-2", hours(18, 19))).await.is_ok());

    let (expired, _) = world.engine.lifecycle.get(booking.id).await.unwrap();
    assert_eq!(expired.status, BookingStatus::Expired);
    assert_eq!(expired.key, court_c1());
}
