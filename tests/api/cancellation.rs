//! Refund policy end-to-end, the host->guest cascade, and waitlist release
//! on cancel. Policy times are passed explicitly so the local-day boundaries
//! are exact regardless of when the tests run.

use chrono::DateTime;
use chrono::Duration;
use chrono::TimeZone;
use chrono::Utc;
use chrono_tz::Tz;
use claims::assert_err;
use courtbook::allocator::process_registration;
use courtbook::cancellation::cancel_registration;
use courtbook::errors::AppError;
use courtbook::queue::RequestState;
use sqlx::Row;
use uuid::Uuid;

use crate::helpers::spawn_app;
use crate::helpers::starts_in_days;

const VANCOUVER: &str = "America/Vancouver";

fn local(
    y: i32,
    mo: u32,
    d: u32,
    h: u32,
) -> DateTime<Utc> {
    let tz: Tz = VANCOUVER.parse().unwrap();
    tz.with_ymd_and_hms(y, mo, d, h, 0, 0)
        .unwrap()
        .with_timezone(&Utc)
}

#[tokio::test]
async fn before_midnight_cancel_refunds_in_full() {
    let app = spawn_app().await;
    let fee = 900;
    // a fixed far-future start keeps the allocator's starts_at check happy
    // while the policy times stay exact
    let starts_at = local(2030, 2, 10, 20);
    let session_id = app.create_session_row(starts_at, VANCOUVER, 4, fee).await;

    let user_id = app.create_user("full@x.test", "Full", false).await;
    app.deposit(user_id, 10_000).await;
    let outcome = process_registration(&app.pool, session_id, user_id, &[])
        .await
        .unwrap();
    let reg_id = outcome.registration_id.unwrap();

    let mut redis = app.redis.clone();
    let cancel = cancel_registration(
        &app.pool,
        &mut redis,
        reg_id,
        user_id,
        false,
        local(2030, 2, 9, 12), // day before, local noon
    )
    .await
    .unwrap();

    assert_eq!(cancel.state, "canceled");
    assert_eq!(cancel.refund_cents, 900);
    assert_eq!(cancel.penalty_cents, 0);
    // capture -900 then refund +900: back to the full deposit
    let (posted, holds) = app.wallet(user_id).await;
    assert_eq!((posted, holds), (10_000, 0));
}

#[tokio::test]
async fn same_day_cancel_splits_refund_and_penalty() {
    let app = spawn_app().await;
    let fee = 900;
    let starts_at = local(2030, 2, 10, 20);
    let session_id = app.create_session_row(starts_at, VANCOUVER, 4, fee).await;

    let user_id = app.create_user("half@x.test", "Half", false).await;
    app.deposit(user_id, 10_000).await;
    let outcome = process_registration(&app.pool, session_id, user_id, &[])
        .await
        .unwrap();
    let reg_id = outcome.registration_id.unwrap();

    let mut redis = app.redis.clone();
    let cancel = cancel_registration(
        &app.pool,
        &mut redis,
        reg_id,
        user_id,
        false,
        local(2030, 2, 10, 9), // start day, 09:00 local
    )
    .await
    .unwrap();

    assert_eq!(cancel.refund_cents, 450);
    assert_eq!(cancel.penalty_cents, -450);
    // -900 capture, +450 refund, -450 penalty
    let (posted, holds) = app.wallet(user_id).await;
    assert_eq!((posted, holds), (10_000 - 900, 0));

    // the original capture stays on the ledger untouched
    let kinds: Vec<String> = sqlx::query(
        "SELECT kind FROM ledger_entries WHERE registration_id = $1 ORDER BY id ASC",
    )
    .bind(reg_id)
    .fetch_all(&app.pool)
    .await
    .unwrap()
    .into_iter()
    .map(|r| r.get("kind"))
    .collect();
    assert_eq!(kinds, vec!["fee_capture", "refund", "penalty"]);
}

#[tokio::test]
async fn cancel_after_start_is_too_late_and_moves_no_money() {
    let app = spawn_app().await;
    let fee = 800;
    let starts_at = local(2030, 3, 5, 20);
    let session_id = app.create_session_row(starts_at, VANCOUVER, 4, fee).await;

    let user_id = app.create_user("late@x.test", "Late", false).await;
    app.deposit(user_id, 10_000).await;
    let outcome = process_registration(&app.pool, session_id, user_id, &[])
        .await
        .unwrap();
    let reg_id = outcome.registration_id.unwrap();
    let wallet_before = app.wallet(user_id).await;

    let mut redis = app.redis.clone();
    let result = cancel_registration(
        &app.pool,
        &mut redis,
        reg_id,
        user_id,
        false,
        starts_at + Duration::hours(1),
    )
    .await;

    assert_err!(&result);
    assert!(matches!(result.unwrap_err(), AppError::TooLate));
    let (state, _) = app.registration_state(reg_id).await;
    assert_eq!(state, "confirmed");
    assert_eq!(app.wallet(user_id).await, wallet_before);
}

#[tokio::test]
async fn canceling_the_host_seat_cascades_to_guests() {
    let app = spawn_app().await;
    let fee = 800;
    let starts_at = local(2030, 4, 1, 20);
    let session_id = app.create_session_row(starts_at, VANCOUVER, 10, fee).await;

    let host = app.create_user("casc@x.test", "Casc", false).await;
    app.deposit(host, 8000).await;
    let outcome = process_registration(
        &app.pool,
        session_id,
        host,
        &["g1".to_string(), "g2".to_string()],
    )
    .await
    .unwrap();
    assert_eq!(outcome.created.len(), 3);
    let host_reg = outcome.registration_id.unwrap();

    let mut redis = app.redis.clone();
    let cancel = cancel_registration(
        &app.pool,
        &mut redis,
        host_reg,
        host,
        false,
        local(2030, 3, 30, 12), // well before the start day
    )
    .await
    .unwrap();

    // all three seats refunded in full
    assert_eq!(cancel.refund_cents, 3 * fee);
    assert_eq!(cancel.penalty_cents, 0);
    for reg_id in &outcome.created {
        let (state, pos) = app.registration_state(*reg_id).await;
        assert_eq!(state, "canceled");
        assert_eq!(pos, None);
    }
    assert_eq!(app.confirmed_seats(session_id).await, 0);
    let (posted, holds) = app.wallet(host).await;
    assert_eq!((posted, holds), (8000, 0));
}

#[tokio::test]
async fn canceling_a_waitlisted_row_releases_the_hold_and_collapses() {
    let app = spawn_app().await;
    let fee = 800;
    let session_id = app
        .create_session_row(starts_in_days(3), VANCOUVER, 1, fee)
        .await;

    let holder = app.create_user("seat@x.test", "Seat", false).await;
    app.deposit(holder, 8000).await;
    process_registration(&app.pool, session_id, holder, &[])
        .await
        .unwrap();

    // three waitlisted singles at positions 1..3
    let mut waiting = Vec::new();
    for i in 0..3 {
        let user_id = app
            .create_user(&format!("wl{i}@x.test"), &format!("WL{i}"), false)
            .await;
        app.deposit(user_id, 8000).await;
        let outcome = process_registration(&app.pool, session_id, user_id, &[])
            .await
            .unwrap();
        assert_eq!(outcome.state, RequestState::Waitlisted);
        waiting.push((user_id, outcome.registration_id.unwrap()));
    }
    assert_eq!(app.waitlist_positions(session_id).await, vec![1, 2, 3]);

    // cancel the middle one
    let (mid_user, mid_reg) = waiting[1];
    let mut redis = app.redis.clone();
    let cancel = cancel_registration(
        &app.pool,
        &mut redis,
        mid_reg,
        mid_user,
        false,
        Utc::now(),
    )
    .await
    .unwrap();

    // a waitlisted seat was never captured: the hold is released, nothing
    // is refunded or penalized
    assert_eq!(cancel.refund_cents, 0);
    assert_eq!(cancel.penalty_cents, 0);
    let (posted, holds) = app.wallet(mid_user).await;
    assert_eq!((posted, holds), (8000, 0));
    // positions collapse back to {1, 2}
    assert_eq!(app.waitlist_positions(session_id).await, vec![1, 2]);
}

#[tokio::test]
async fn cancel_is_idempotent_and_guarded() {
    let app = spawn_app().await;
    let fee = 800;
    let session_id = app
        .create_session_row(starts_in_days(3), VANCOUVER, 4, fee)
        .await;

    let owner = app.create_user("own@x.test", "Own", false).await;
    app.deposit(owner, 8000).await;
    let outcome = process_registration(&app.pool, session_id, owner, &[])
        .await
        .unwrap();
    let reg_id = outcome.registration_id.unwrap();

    // a stranger cannot cancel someone else's registration
    let stranger = app.create_user("str@x.test", "Str", false).await;
    let mut redis = app.redis.clone();
    let result = cancel_registration(
        &app.pool,
        &mut redis,
        reg_id,
        stranger,
        false,
        Utc::now(),
    )
    .await;
    assert!(matches!(result.unwrap_err(), AppError::Forbidden));

    // double-cancel is a stable no-op
    cancel_registration(&app.pool, &mut redis, reg_id, owner, false, Utc::now())
        .await
        .unwrap();
    let again = cancel_registration(&app.pool, &mut redis, reg_id, owner, false, Utc::now())
        .await
        .unwrap();
    assert_eq!(again.refund_cents, 0);
    assert_eq!(again.penalty_cents, 0);
    assert_eq!(again.state, "canceled");

    // unknown registration
    let missing = cancel_registration(
        &app.pool,
        &mut redis,
        Uuid::new_v4(),
        owner,
        false,
        Utc::now(),
    )
    .await;
    assert!(matches!(missing.unwrap_err(), AppError::NotFound(_)));
}
