use super::*;
use crate::clock::ManualClock;
use crate::limits::*;

use chrono::{NaiveDate, Weekday};
use chrono_tz::Tz;

const H: Ms = HOUR_MS;
const M: Ms = MINUTE_MS;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("chargeslot_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// Tuesday.
fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 20).unwrap()
}

/// Instant on `day()` in UTC.
fn at(h: i64, m: i64) -> Ms {
    day().and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis() + h * H + m * M
}

fn new_engine(name: &str, now: Ms) -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(now));
    let engine = Engine::new(test_wal_path(name), clock.clone(), Policy::default()).unwrap();
    (engine, clock)
}

fn station(owner: Ulid, accept_mode: AcceptMode) -> Station {
    Station {
        id: Ulid::new(),
        owner_id: owner,
        price: 600,
        accept_mode,
        always_open: true,
        timezone: Tz::UTC,
        windows: Vec::new(),
    }
}

fn request(station_id: Ulid, user_id: Ulid, start: Ms, end: Ms) -> NewBooking {
    NewBooking {
        id: Ulid::new(),
        station_id,
        user_id,
        start,
        end,
        amount: None,
        payment_ref: None,
        immediate: false,
    }
}

async fn setup(name: &str, mode: AcceptMode, now: Ms) -> (Engine, Arc<ManualClock>, Station) {
    let (engine, clock) = new_engine(name, now);
    let st = station(Ulid::new(), mode);
    engine.register_station(st.clone()).await.unwrap();
    (engine, clock, st)
}

// ── Gap finder ───────────────────────────────────────────

#[tokio::test]
async fn empty_day_today_starts_after_lead_time() {
    let (engine, _clock, st) = setup("scenario_a_today.wal", AcceptMode::Auto, at(10, 7)).await;
    let slots = engine.free_slots(st.id, day()).await.unwrap();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].start, at(10, 37));
    assert_eq!(slots[0].end, at(24, 0));
    assert_eq!(slots[0].duration_minutes, 13 * 60 + 23);
}

#[tokio::test]
async fn empty_future_day_is_whole_day() {
    let (engine, _clock, st) = setup("scenario_a_future.wal", AcceptMode::Auto, at(10, 7)).await;
    let tomorrow = day().succ_opt().unwrap();
    let slots = engine.free_slots(st.id, tomorrow).await.unwrap();
    assert_eq!(slots, vec![FreeSlot::new(at(24, 0), at(48, 0))]);
}

#[tokio::test]
async fn past_day_has_no_free_slots() {
    let (engine, _clock, st) = setup("free_past.wal", AcceptMode::Auto, at(10, 0)).await;
    let yesterday = day().pred_opt().unwrap();
    assert!(engine.free_slots(st.id, yesterday).await.unwrap().is_empty());
}

#[tokio::test]
async fn free_slots_skip_active_bookings_only() {
    let (engine, _clock, st) = setup("free_bookings.wal", AcceptMode::Auto, at(6, 0)).await;
    let user = Ulid::new();
    engine
        .create_booking(request(st.id, user, at(10, 0), at(11, 0)))
        .await
        .unwrap();
    let dropped = engine
        .create_booking(request(st.id, user, at(14, 0), at(15, 0)))
        .await
        .unwrap();
    engine.cancel(dropped.id, &Caller::user(user)).await.unwrap();

    let slots = engine.free_slots(st.id, day()).await.unwrap();
    let spans: Vec<_> = slots.iter().map(|s| (s.start, s.end)).collect();
    assert_eq!(spans, vec![(at(6, 30), at(10, 0)), (at(11, 0), at(24, 0))]);
}

#[tokio::test]
async fn free_slots_follow_weekly_windows() {
    let (engine, _clock) = new_engine("free_windows.wal", at(6, 0));
    let mut st = station(Ulid::new(), AcceptMode::Auto);
    st.always_open = false;
    engine.register_station(st.clone()).await.unwrap();

    let morning = WeeklyWindow {
        id: Ulid::new(),
        day: Weekday::Tue,
        start: "08:00".parse().unwrap(),
        end: "12:00".parse().unwrap(),
    };
    let evening = WeeklyWindow {
        id: Ulid::new(),
        day: Weekday::Tue,
        start: "17:00".parse().unwrap(),
        end: "20:00".parse().unwrap(),
    };
    engine.add_window(st.id, morning.clone()).await.unwrap();
    engine.add_window(st.id, evening).await.unwrap();
    engine
        .create_booking(request(st.id, Ulid::new(), at(9, 0), at(11, 40)))
        .await
        .unwrap();

    let spans: Vec<_> = engine
        .free_slots(st.id, day())
        .await
        .unwrap()
        .iter()
        .map(|s| (s.start, s.end))
        .collect();
    // 11:40-12:00 is too short to offer.
    assert_eq!(spans, vec![(at(8, 0), at(9, 0)), (at(17, 0), at(20, 0))]);

    assert_eq!(engine.remove_window(morning.id).await.unwrap(), st.id);
    assert_eq!(engine.free_slots(st.id, day()).await.unwrap().len(), 1);
    assert!(matches!(
        engine.remove_window(morning.id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn free_slots_unknown_station() {
    let (engine, _clock) = new_engine("free_unknown.wal", at(6, 0));
    assert!(matches!(
        engine.free_slots(Ulid::new(), day()).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Creation & overlap ───────────────────────────────────

#[tokio::test]
async fn overlapping_request_conflicts() {
    let (engine, _clock, st) = setup("scenario_b.wal", AcceptMode::Auto, at(8, 0)).await;
    let x = engine
        .create_booking(request(st.id, Ulid::new(), at(10, 0), at(11, 0)))
        .await
        .unwrap();

    let result = engine
        .create_booking(request(st.id, Ulid::new(), at(10, 30), at(11, 30)))
        .await;
    match result {
        Err(EngineError::Conflict(id)) => assert_eq!(id, x.id),
        other => panic!("expected conflict, got {other:?}"),
    }

    // Touching is fine.
    engine
        .create_booking(request(st.id, Ulid::new(), at(11, 0), at(12, 0)))
        .await
        .unwrap();
}

#[tokio::test]
async fn cancelled_booking_frees_its_slot() {
    let (engine, _clock, st) = setup("cancel_frees.wal", AcceptMode::Request, at(8, 0)).await;
    let user = Ulid::new();
    let x = engine
        .create_booking(request(st.id, user, at(10, 0), at(11, 0)))
        .await
        .unwrap();
    assert_eq!(x.status, BookingStatus::Pending);
    engine.cancel(x.id, &Caller::user(user)).await.unwrap();
    engine
        .create_booking(request(st.id, Ulid::new(), at(10, 30), at(11, 30)))
        .await
        .unwrap();
}

#[tokio::test]
async fn creation_status_follows_accept_mode() {
    let (engine, _clock, auto) = setup("accept_mode.wal", AcceptMode::Auto, at(8, 0)).await;
    let manual = station(Ulid::new(), AcceptMode::Request);
    engine.register_station(manual.clone()).await.unwrap();

    let a = engine
        .create_booking(request(auto.id, Ulid::new(), at(10, 0), at(11, 0)))
        .await
        .unwrap();
    let p = engine
        .create_booking(request(manual.id, Ulid::new(), at(10, 0), at(11, 0)))
        .await
        .unwrap();
    assert_eq!(a.status, BookingStatus::Confirmed);
    assert_eq!(p.status, BookingStatus::Pending);
    assert_eq!(a.created_at, at(8, 0));
}

#[tokio::test]
async fn amount_defaults_to_quote() {
    let (engine, _clock, st) = setup("amount_quote.wal", AcceptMode::Auto, at(8, 0)).await;
    let quoted = engine
        .create_booking(request(st.id, Ulid::new(), at(10, 0), at(11, 30)))
        .await
        .unwrap();
    assert_eq!(quoted.amount, 900);

    let mut req = request(st.id, Ulid::new(), at(12, 0), at(13, 0));
    req.amount = Some(250);
    req.payment_ref = Some("pay_1".into());
    let explicit = engine.create_booking(req).await.unwrap();
    assert_eq!(explicit.amount, 250);
    assert_eq!(explicit.payment_ref.as_deref(), Some("pay_1"));
}

#[tokio::test]
async fn invalid_slots_rejected() {
    let (engine, _clock, st) = setup("invalid_slots.wal", AcceptMode::Auto, at(8, 0)).await;
    for (start, end) in [(at(10, 0), at(10, 0)), (at(11, 0), at(10, 0)), (at(7, 59), at(9, 0))] {
        assert!(matches!(
            engine
                .create_booking(request(st.id, Ulid::new(), start, end))
                .await,
            Err(EngineError::Validation(_))
        ));
    }
    let mut negative = request(st.id, Ulid::new(), at(9, 0), at(10, 0));
    negative.amount = Some(-1);
    assert!(matches!(
        engine.create_booking(negative).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn duplicate_booking_id_rejected() {
    let (engine, _clock, st) = setup("dup_booking.wal", AcceptMode::Auto, at(8, 0)).await;
    let req = request(st.id, Ulid::new(), at(10, 0), at(11, 0));
    engine.create_booking(req.clone()).await.unwrap();
    let mut again = req;
    again.start = at(12, 0);
    again.end = at(13, 0);
    assert!(matches!(
        engine.create_booking(again).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn immediate_booking_starts_at_once() {
    let (engine, _clock, st) = setup("immediate.wal", AcceptMode::Auto, at(9, 5)).await;
    let mut req = request(st.id, Ulid::new(), at(9, 0), at(10, 0));
    req.immediate = true;
    let b = engine.create_booking(req).await.unwrap();
    assert_eq!(b.status, BookingStatus::Ongoing);
    assert_eq!(b.actual_start, Some(at(9, 5)));

    // Beyond the ten-minute grace.
    let mut late = request(st.id, Ulid::new(), at(8, 54), at(8, 59));
    late.immediate = true;
    assert!(matches!(
        engine.create_booking(late).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn immediate_booking_on_request_station_waits() {
    let (engine, _clock, st) = setup("immediate_request.wal", AcceptMode::Request, at(9, 5)).await;
    let mut req = request(st.id, Ulid::new(), at(9, 0), at(10, 0));
    req.immediate = true;
    let b = engine.create_booking(req).await.unwrap();
    assert_eq!(b.status, BookingStatus::Pending);
    assert_eq!(b.actual_start, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_creates_admit_one() {
    let (engine, _clock, st) = setup("race.wal", AcceptMode::Auto, at(8, 0)).await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        let station_id = st.id;
        handles.push(tokio::spawn(async move {
            engine
                .create_booking(request(station_id, Ulid::new(), at(10, i), at(11, i)))
                .await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.list_bookings(st.id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_with_one_id_admit_one() {
    let (engine, _clock, st) = setup("race_same_id.wal", AcceptMode::Auto, at(8, 0)).await;
    let engine = Arc::new(engine);
    let id = Ulid::new();

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        let station_id = st.id;
        handles.push(tokio::spawn(async move {
            let mut req = request(station_id, Ulid::new(), at(10 + i, 0), at(10 + i, 30));
            req.id = id;
            engine.create_booking(req).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::AlreadyExists(dup)) => assert_eq!(dup, id),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    let bookings = engine.list_bookings(st.id).await.unwrap();
    assert_eq!(bookings.iter().filter(|b| b.id == id).count(), 1);
}

#[tokio::test]
async fn booking_ids_are_unique_across_stations() {
    let (engine, _clock, first) = setup("id_across_stations.wal", AcceptMode::Auto, at(8, 0)).await;
    let second = station(Ulid::new(), AcceptMode::Auto);
    engine.register_station(second.clone()).await.unwrap();

    let req = request(first.id, Ulid::new(), at(10, 0), at(11, 0));
    engine.create_booking(req.clone()).await.unwrap();
    let mut elsewhere = req.clone();
    elsewhere.station_id = second.id;
    assert!(matches!(
        engine.create_booking(elsewhere).await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert_eq!(engine.station_for_booking(&req.id), Some(first.id));
    assert!(engine.list_bookings(second.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn rejected_request_does_not_reserve_its_id() {
    let (engine, _clock, st) = setup("id_release.wal", AcceptMode::Auto, at(8, 0)).await;
    engine
        .create_booking(request(st.id, Ulid::new(), at(10, 0), at(11, 0)))
        .await
        .unwrap();
    let clash = request(st.id, Ulid::new(), at(10, 30), at(11, 30));
    assert!(matches!(
        engine.create_booking(clash.clone()).await,
        Err(EngineError::Conflict(_))
    ));
    assert_eq!(engine.station_for_booking(&clash.id), None);

    let mut retry = clash;
    retry.start = at(12, 0);
    retry.end = at(13, 0);
    engine.create_booking(retry).await.unwrap();
}

#[tokio::test]
async fn finished_bookings_do_not_count_against_the_cap() {
    let (engine, _clock, st) = setup("cap_terminal.wal", AcceptMode::Auto, at(8, 0)).await;
    {
        let ss = engine.get_station_state(&st.id).unwrap();
        let mut ss = ss.write().await;
        let template = request(st.id, Ulid::new(), at(10, 0), at(11, 0));
        for i in 0..MAX_ACTIVE_BOOKINGS_PER_STATION as i64 {
            let start = at(0, 0) - (MAX_ACTIVE_BOOKINGS_PER_STATION as i64 - i) * H;
            ss.bookings.push(Booking {
                id: Ulid::new(),
                station_id: st.id,
                user_id: template.user_id,
                slot: Span::new(start, start + 30 * M),
                status: BookingStatus::Cancelled,
                immediate: false,
                actual_start: None,
                actual_end: None,
                session_minutes: None,
                amount: 0,
                payment_ref: None,
                refund_due: false,
                created_at: start - H,
                issues: Vec::new(),
                feedback: None,
            });
        }
    }
    let b = engine
        .create_booking(request(st.id, Ulid::new(), at(10, 0), at(11, 0)))
        .await
        .unwrap();
    assert_eq!(b.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn active_booking_cap_is_enforced() {
    let (engine, _clock, st) = setup("cap_active.wal", AcceptMode::Request, at(8, 0)).await;
    {
        let ss = engine.get_station_state(&st.id).unwrap();
        let mut ss = ss.write().await;
        for i in 0..MAX_ACTIVE_BOOKINGS_PER_STATION as i64 {
            let start = at(24, 0) + i * H;
            ss.bookings.push(Booking {
                id: Ulid::new(),
                station_id: st.id,
                user_id: Ulid::new(),
                slot: Span::new(start, start + 30 * M),
                status: BookingStatus::Pending,
                immediate: false,
                actual_start: None,
                actual_end: None,
                session_minutes: None,
                amount: 0,
                payment_ref: None,
                refund_due: false,
                created_at: at(7, 0),
                issues: Vec::new(),
                feedback: None,
            });
        }
    }
    assert!(matches!(
        engine
            .create_booking(request(st.id, Ulid::new(), at(10, 0), at(11, 0)))
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn read_auto_starts_confirmed_booking() {
    let (engine, clock, st) = setup("scenario_c.wal", AcceptMode::Auto, at(8, 0)).await;
    let b = engine
        .create_booking(request(st.id, Ulid::new(), at(9, 0), at(10, 0)))
        .await
        .unwrap();

    clock.set(at(9, 30));
    let now = engine.get_booking(b.id).await.unwrap();
    assert_eq!(now.status, BookingStatus::Ongoing);
    assert_eq!(now.actual_start, Some(at(9, 30)));
}

#[tokio::test]
async fn read_expires_booking_that_never_started() {
    let (engine, clock, st) = setup("scenario_d.wal", AcceptMode::Auto, at(8, 0)).await;
    let b = engine
        .create_booking(request(st.id, Ulid::new(), at(9, 0), at(10, 0)))
        .await
        .unwrap();

    clock.set(at(10, 15));
    let now = engine.get_booking(b.id).await.unwrap();
    assert_eq!(now.status, BookingStatus::Completed);
    assert_eq!(now.actual_start, None);
    assert_eq!(now.actual_end, Some(at(10, 0)));
    assert_eq!(now.session_minutes, None);
}

#[tokio::test]
async fn reconciliation_is_idempotent() {
    let (engine, clock, st) = setup("reconcile_twice.wal", AcceptMode::Auto, at(8, 0)).await;
    engine
        .create_booking(request(st.id, Ulid::new(), at(9, 0), at(10, 0)))
        .await
        .unwrap();
    engine
        .create_booking(request(st.id, Ulid::new(), at(10, 0), at(11, 0)))
        .await
        .unwrap();

    clock.set(at(10, 15));
    assert_eq!(engine.reconcile_station(st.id).await.unwrap(), 2);
    let first = engine.list_bookings(st.id).await.unwrap();
    assert_eq!(engine.reconcile_station(st.id).await.unwrap(), 0);
    assert_eq!(engine.list_bookings(st.id).await.unwrap(), first);
    assert_eq!(engine.reconcile_all().await, 0);
}

#[tokio::test]
async fn owner_approves_pending() {
    let (engine, _clock, st) = setup("approve.wal", AcceptMode::Request, at(8, 0)).await;
    let b = engine
        .create_booking(request(st.id, Ulid::new(), at(10, 0), at(11, 0)))
        .await
        .unwrap();

    let admin = Caller::admin(Ulid::new());
    assert!(matches!(
        engine.approve(b.id, &admin).await,
        Err(EngineError::Unauthorized { .. })
    ));
    assert!(matches!(
        engine.approve(b.id, &Caller::user(b.user_id)).await,
        Err(EngineError::Unauthorized { .. })
    ));

    let owner = Caller::owner(st.owner_id);
    let approved = engine.approve(b.id, &owner).await.unwrap();
    assert_eq!(approved.status, BookingStatus::Confirmed);

    match engine.approve(b.id, &owner).await {
        Err(EngineError::InvalidState { status, .. }) => {
            assert_eq!(status, BookingStatus::Confirmed)
        }
        other => panic!("expected invalid state, got {other:?}"),
    }
}

#[tokio::test]
async fn reject_flags_refund_for_paid_booking() {
    let (engine, _clock, st) = setup("reject.wal", AcceptMode::Request, at(8, 0)).await;
    let mut req = request(st.id, Ulid::new(), at(10, 0), at(11, 0));
    req.payment_ref = Some("pi_42".into());
    let b = engine.create_booking(req).await.unwrap();

    let rejected = engine.reject(b.id, &Caller::owner(st.owner_id)).await.unwrap();
    assert_eq!(rejected.status, BookingStatus::Rejected);
    assert!(rejected.refund_due);

    // Terminal: a cancel now is refused.
    assert!(matches!(
        engine.cancel(b.id, &Caller::user(b.user_id)).await,
        Err(EngineError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn reject_only_from_pending() {
    let (engine, _clock, st) = setup("reject_confirmed.wal", AcceptMode::Auto, at(8, 0)).await;
    let b = engine
        .create_booking(request(st.id, Ulid::new(), at(10, 0), at(11, 0)))
        .await
        .unwrap();
    assert!(matches!(
        engine.reject(b.id, &Caller::owner(st.owner_id)).await,
        Err(EngineError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn start_requires_confirmed() {
    let (engine, clock, st) = setup("start_pending.wal", AcceptMode::Request, at(8, 0)).await;
    let b = engine
        .create_booking(request(st.id, Ulid::new(), at(9, 0), at(10, 0)))
        .await
        .unwrap();
    clock.set(at(9, 10));
    match engine.start(b.id, &Caller::user(b.user_id)).await {
        Err(EngineError::InvalidState { status, action, .. }) => {
            assert_eq!(status, BookingStatus::Pending);
            assert_eq!(action, "start");
        }
        other => panic!("expected invalid state, got {other:?}"),
    }
}

#[tokio::test]
async fn start_then_end_records_session() {
    let (engine, clock, st) = setup("start_end.wal", AcceptMode::Auto, at(8, 0)).await;
    let user = Caller::user(Ulid::new());
    let b = engine
        .create_booking(request(st.id, user.id, at(9, 0), at(10, 0)))
        .await
        .unwrap();

    clock.set(at(8, 55));
    let started = engine.start(b.id, &user).await.unwrap();
    assert_eq!(started.status, BookingStatus::Ongoing);
    assert_eq!(started.actual_start, Some(at(8, 55)));

    clock.set(at(9, 40) + 20_000);
    let ended = engine.end(b.id, &Caller::owner(st.owner_id)).await.unwrap();
    assert_eq!(ended.status, BookingStatus::Completed);
    assert_eq!(ended.actual_end, Some(at(9, 40) + 20_000));
    assert_eq!(ended.session_minutes, Some(45));
}

#[tokio::test]
async fn start_after_auto_start_succeeds() {
    let (engine, clock, st) = setup("start_after_auto.wal", AcceptMode::Auto, at(8, 0)).await;
    let user = Caller::user(Ulid::new());
    let b = engine
        .create_booking(request(st.id, user.id, at(9, 0), at(10, 0)))
        .await
        .unwrap();

    clock.set(at(9, 30));
    let started = engine.start(b.id, &user).await.unwrap();
    assert_eq!(started.status, BookingStatus::Ongoing);
    assert_eq!(started.actual_start, Some(at(9, 30)));

    // Pressing start again is an error: the booking was already ongoing.
    assert!(matches!(
        engine.start(b.id, &user).await,
        Err(EngineError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn end_after_slot_passed_uses_nominal_end() {
    let (engine, clock, st) = setup("end_late.wal", AcceptMode::Auto, at(8, 0)).await;
    let user = Caller::user(Ulid::new());
    let b = engine
        .create_booking(request(st.id, user.id, at(9, 0), at(10, 0)))
        .await
        .unwrap();
    clock.set(at(9, 5));
    engine.start(b.id, &user).await.unwrap();

    clock.set(at(10, 20));
    let ended = engine.end(b.id, &user).await.unwrap();
    assert_eq!(ended.status, BookingStatus::Completed);
    assert_eq!(ended.actual_end, Some(at(10, 0)));
    assert_eq!(ended.session_minutes, Some(55));

    assert!(matches!(
        engine.end(b.id, &user).await,
        Err(EngineError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn cancel_rules() {
    let (engine, clock, st) = setup("cancel_rules.wal", AcceptMode::Auto, at(8, 0)).await;
    let user = Caller::user(Ulid::new());
    let mut req = request(st.id, user.id, at(9, 0), at(10, 0));
    req.payment_ref = Some("pi_7".into());
    let b = engine.create_booking(req).await.unwrap();

    let stranger = Caller::user(Ulid::new());
    assert!(matches!(
        engine.cancel(b.id, &stranger).await,
        Err(EngineError::Unauthorized { .. })
    ));

    // Ongoing sessions can be cancelled too.
    clock.set(at(9, 10));
    let cancelled = engine.cancel(b.id, &Caller::admin(Ulid::new())).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.actual_start, Some(at(9, 10)));
    assert!(cancelled.refund_due);
}

#[tokio::test]
async fn unknown_booking_not_found() {
    let (engine, _clock, _st) = setup("unknown_booking.wal", AcceptMode::Auto, at(8, 0)).await;
    let ghost = Ulid::new();
    assert!(matches!(
        engine.cancel(ghost, &Caller::admin(Ulid::new())).await,
        Err(EngineError::NotFound(id)) if id == ghost
    ));
    assert!(matches!(engine.get_booking(ghost).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn issues_are_append_only() {
    let (engine, _clock, st) = setup("issues.wal", AcceptMode::Auto, at(8, 0)).await;
    let user = Caller::user(Ulid::new());
    let b = engine
        .create_booking(request(st.id, user.id, at(9, 0), at(10, 0)))
        .await
        .unwrap();

    let after = engine
        .report_issue(b.id, &user, "connector".into(), "cable damaged".into())
        .await
        .unwrap();
    assert_eq!(after.status, BookingStatus::Confirmed);
    assert_eq!(after.issues.len(), 1);
    assert_eq!(after.issues[0].reported_by, user.id);
    assert_eq!(after.issues[0].reported_at, at(8, 0));

    let after = engine
        .report_issue(b.id, &Caller::owner(st.owner_id), "payment".into(), String::new())
        .await
        .unwrap();
    assert_eq!(after.issues.len(), 2);

    assert!(matches!(
        engine
            .report_issue(b.id, &Caller::user(Ulid::new()), "x".into(), "y".into())
            .await,
        Err(EngineError::Unauthorized { .. })
    ));
    assert!(matches!(
        engine.report_issue(b.id, &user, " ".into(), "y".into()).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine
            .report_issue(b.id, &user, "k".repeat(MAX_ISSUE_KIND_LEN + 1), "y".into())
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn feedback_after_completion_once() {
    let (engine, clock, st) = setup("feedback.wal", AcceptMode::Auto, at(8, 0)).await;
    let user = Caller::user(Ulid::new());
    let b = engine
        .create_booking(request(st.id, user.id, at(9, 0), at(10, 0)))
        .await
        .unwrap();

    assert!(matches!(
        engine.leave_feedback(b.id, &user, 5, None).await,
        Err(EngineError::InvalidState { .. })
    ));

    clock.set(at(10, 30));
    assert!(matches!(
        engine.leave_feedback(b.id, &user, 0, None).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine
            .leave_feedback(b.id, &Caller::owner(st.owner_id), 4, None)
            .await,
        Err(EngineError::Unauthorized { .. })
    ));

    let rated = engine
        .leave_feedback(b.id, &user, 4, Some("quick and easy".into()))
        .await
        .unwrap();
    let feedback = rated.feedback.unwrap();
    assert_eq!(feedback.rating, 4);
    assert_eq!(feedback.left_at, at(10, 30));

    assert!(matches!(
        engine.leave_feedback(b.id, &user, 5, None).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

// ── Live status ──────────────────────────────────────────

#[tokio::test]
async fn pending_queue_estimates() {
    let (engine, clock, st) = setup("scenario_e.wal", AcceptMode::Request, at(8, 0)).await;
    let mut ids = Vec::new();
    for h in [12, 14, 16] {
        let b = engine
            .create_booking(request(st.id, Ulid::new(), at(h, 0), at(h + 1, 0)))
            .await
            .unwrap();
        ids.push(b.id);
        clock.advance(M);
    }

    let status = engine.live_status(st.id).await.unwrap();
    assert!(!status.available_now);
    assert!(status.ongoing.is_none());
    assert_eq!(status.queue.len(), 3);
    assert_eq!(status.estimated_wait_minutes, 180);
    assert_eq!(status.next_available_at, Some(at(8, 3) + 180 * M));
    let annotated: Vec<_> = status
        .queue
        .iter()
        .map(|q| (q.booking_id, q.position, q.estimated_wait_minutes))
        .collect();
    assert_eq!(
        annotated,
        vec![(ids[0], 1, 180), (ids[1], 2, 240), (ids[2], 3, 300)]
    );
}

#[tokio::test]
async fn live_status_reports_ongoing_session() {
    let (engine, clock, st) = setup("live_ongoing.wal", AcceptMode::Auto, at(8, 0)).await;
    let b = engine
        .create_booking(request(st.id, Ulid::new(), at(9, 0), at(10, 0)))
        .await
        .unwrap();

    clock.set(at(9, 20));
    let status = engine.live_status(st.id).await.unwrap();
    assert_eq!(status.ongoing.as_ref().map(|o| o.id), Some(b.id));
    assert_eq!(status.estimated_wait_minutes, 40);
    assert_eq!(status.next_available_at, Some(at(10, 0)));

    clock.set(at(10, 0));
    let status = engine.live_status(st.id).await.unwrap();
    assert!(status.available_now);
    assert_eq!(status.estimated_wait_minutes, 0);
}

#[tokio::test]
async fn live_status_sees_imminent_booking() {
    let (engine, _clock, st) = setup("live_imminent.wal", AcceptMode::Auto, at(8, 40)).await;
    let b = engine
        .create_booking(request(st.id, Ulid::new(), at(9, 0), at(10, 0)))
        .await
        .unwrap();
    let status = engine.live_status(st.id).await.unwrap();
    assert_eq!(status.imminent.len(), 1);
    assert_eq!(status.imminent[0].id, b.id);
    assert_eq!(status.estimated_wait_minutes, 20);
    assert_eq!(status.next_available_at, Some(at(10, 0)));
}

// ── Catalog ──────────────────────────────────────────────

#[tokio::test]
async fn register_validation() {
    let (engine, _clock) = new_engine("register_validation.wal", at(8, 0));
    let st = station(Ulid::new(), AcceptMode::Auto);
    engine.register_station(st.clone()).await.unwrap();
    assert!(matches!(
        engine.register_station(st.clone()).await,
        Err(EngineError::AlreadyExists(_))
    ));

    let mut bad = station(Ulid::new(), AcceptMode::Auto);
    bad.windows.push(WeeklyWindow {
        id: Ulid::new(),
        day: Weekday::Mon,
        start: "18:00".parse().unwrap(),
        end: "09:00".parse().unwrap(),
    });
    assert!(matches!(
        engine.register_station(bad).await,
        Err(EngineError::Validation(_))
    ));

    let mut negative = station(Ulid::new(), AcceptMode::Auto);
    negative.price = -5;
    assert!(matches!(
        engine.register_station(negative).await,
        Err(EngineError::Validation(_))
    ));
    assert_eq!(engine.list_stations().await, vec![st]);
}

#[tokio::test]
async fn update_station_patches_fields() {
    let (engine, _clock, st) = setup("update_station.wal", AcceptMode::Auto, at(8, 0)).await;
    let updated = engine
        .update_station(
            st.id,
            StationPatch {
                accept_mode: Some(AcceptMode::Request),
                timezone: Some(chrono_tz::Europe::Berlin),
                ..StationPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.accept_mode, AcceptMode::Request);
    assert_eq!(updated.timezone, chrono_tz::Europe::Berlin);
    assert_eq!(updated.price, st.price);

    let b = engine
        .create_booking(request(st.id, Ulid::new(), at(10, 0), at(11, 0)))
        .await
        .unwrap();
    assert_eq!(b.status, BookingStatus::Pending);
}

#[tokio::test]
async fn remove_station_requires_no_active_bookings() {
    let (engine, _clock, st) = setup("remove_station.wal", AcceptMode::Auto, at(8, 0)).await;
    let user = Caller::user(Ulid::new());
    let b = engine
        .create_booking(request(st.id, user.id, at(9, 0), at(10, 0)))
        .await
        .unwrap();

    assert!(matches!(
        engine.remove_station(st.id).await,
        Err(EngineError::HasActiveBookings(_))
    ));
    engine.cancel(b.id, &user).await.unwrap();
    engine.remove_station(st.id).await.unwrap();

    assert!(matches!(engine.get_station(st.id).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.get_booking(b.id).await, Err(EngineError::NotFound(_))));
    assert!(engine.list_stations().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_window_adds_with_one_id_admit_one() {
    let (engine, _clock) = new_engine("race_window_id.wal", at(8, 0));
    let engine = Arc::new(engine);
    let mut station_ids = Vec::new();
    for _ in 0..4 {
        let st = station(Ulid::new(), AcceptMode::Auto);
        station_ids.push(st.id);
        engine.register_station(st).await.unwrap();
    }
    let window = WeeklyWindow {
        id: Ulid::new(),
        day: Weekday::Mon,
        start: "08:00".parse().unwrap(),
        end: "12:00".parse().unwrap(),
    };

    let mut handles = Vec::new();
    for &station_id in &station_ids {
        let engine = engine.clone();
        let window = window.clone();
        handles.push(tokio::spawn(async move { engine.add_window(station_id, window).await }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(()) => ok += 1,
            Err(EngineError::AlreadyExists(id)) => assert_eq!(id, window.id),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    let mut holders = 0;
    for id in &station_ids {
        holders += engine
            .get_station(*id)
            .await
            .unwrap()
            .windows
            .iter()
            .filter(|w| w.id == window.id)
            .count();
    }
    assert_eq!(holders, 1);
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let clock = Arc::new(ManualClock::new(at(8, 0)));
    let user = Caller::user(Ulid::new());
    let st = station(Ulid::new(), AcceptMode::Request);
    let (pending_id, started_id, before) = {
        let engine = Engine::new(path.clone(), clock.clone(), Policy::default()).unwrap();
        engine.register_station(st.clone()).await.unwrap();
        let window = WeeklyWindow {
            id: Ulid::new(),
            day: Weekday::Wed,
            start: "06:00".parse().unwrap(),
            end: "22:00".parse().unwrap(),
        };
        engine.add_window(st.id, window).await.unwrap();

        let a = engine
            .create_booking(request(st.id, user.id, at(9, 0), at(10, 0)))
            .await
            .unwrap();
        let b = engine
            .create_booking(request(st.id, user.id, at(12, 0), at(13, 0)))
            .await
            .unwrap();
        engine.approve(a.id, &Caller::owner(st.owner_id)).await.unwrap();
        clock.set(at(9, 2));
        engine.start(a.id, &user).await.unwrap();
        engine
            .report_issue(a.id, &user, "slow".into(), "11 kW only".into())
            .await
            .unwrap();
        (b.id, a.id, engine.list_bookings(st.id).await.unwrap())
    };

    let engine = Engine::new(path, clock.clone(), Policy::default()).unwrap();
    assert_eq!(engine.list_bookings(st.id).await.unwrap(), before);
    assert_eq!(engine.get_station(st.id).await.unwrap().windows.len(), 1);
    assert_eq!(
        engine.get_booking(pending_id).await.unwrap().status,
        BookingStatus::Pending
    );
    let started = engine.get_booking(started_id).await.unwrap();
    assert_eq!(started.status, BookingStatus::Ongoing);
    assert_eq!(started.actual_start, Some(at(9, 2)));
}

#[tokio::test]
async fn writes_after_torn_tail_survive_restart() {
    let path = test_wal_path("torn_restart.wal");
    let clock = Arc::new(ManualClock::new(at(8, 0)));
    let st = station(Ulid::new(), AcceptMode::Auto);
    {
        let engine = Engine::new(path.clone(), clock.clone(), Policy::default()).unwrap();
        engine.register_station(st.clone()).await.unwrap();
    }
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
    }

    let booking = {
        let engine = Engine::new(path.clone(), clock.clone(), Policy::default()).unwrap();
        engine
            .create_booking(request(st.id, Ulid::new(), at(10, 0), at(11, 0)))
            .await
            .unwrap()
    };

    let engine = Engine::new(path, clock, Policy::default()).unwrap();
    assert_eq!(engine.get_booking(booking.id).await.unwrap(), booking);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact.wal");
    let clock = Arc::new(ManualClock::new(at(6, 0)));
    let st = station(Ulid::new(), AcceptMode::Auto);
    let user = Caller::user(Ulid::new());
    let before = {
        let engine = Engine::new(path.clone(), clock.clone(), Policy::default()).unwrap();
        engine.register_station(st.clone()).await.unwrap();
        for h in 7..12 {
            let b = engine
                .create_booking(request(st.id, user.id, at(h, 0), at(h, 45)))
                .await
                .unwrap();
            if h % 2 == 0 {
                engine.cancel(b.id, &user).await.unwrap();
            }
        }
        clock.set(at(9, 10));
        engine.reconcile_station(st.id).await.unwrap();
        assert!(engine.wal_appends_since_compact().await > 0);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        engine.list_bookings(st.id).await.unwrap()
    };

    let events = crate::wal::Wal::replay(&path).unwrap();
    assert_eq!(events.len(), 1 + before.len());

    let engine = Engine::new(path, clock, Policy::default()).unwrap();
    assert_eq!(engine.list_bookings(st.id).await.unwrap(), before);
    // Lookups survive compaction too.
    for b in &before {
        assert_eq!(engine.station_for_booking(&b.id), Some(st.id));
    }
}

#[tokio::test]
async fn appends_after_compaction_replay() {
    let path = test_wal_path("compact_then_append.wal");
    let clock = Arc::new(ManualClock::new(at(6, 0)));
    let st = station(Ulid::new(), AcceptMode::Auto);
    {
        let engine = Engine::new(path.clone(), clock.clone(), Policy::default()).unwrap();
        engine.register_station(st.clone()).await.unwrap();
        engine.compact_wal().await.unwrap();
        engine
            .create_booking(request(st.id, Ulid::new(), at(7, 0), at(8, 0)))
            .await
            .unwrap();
    }
    let engine = Engine::new(path, clock, Policy::default()).unwrap();
    assert_eq!(engine.list_bookings(st.id).await.unwrap().len(), 1);
}
