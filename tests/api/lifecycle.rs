//! Session lifecycle: admin creation with preregistrations, transitions and
//! their money side effects, and the auto-closer.

use chrono::Duration;
use chrono::Utc;
use courtbook::allocator::process_registration;
use courtbook::closer::close_due_sessions;
use courtbook::errors::AppError;
use courtbook::lifecycle::admin_update_session;
use courtbook::lifecycle::create_session;
use courtbook::lifecycle::NewSession;
use courtbook::lifecycle::PreregItem;
use courtbook::promotion::promote_waitlist;
use courtbook::queue::RequestState;
use sqlx::Row;
use uuid::Uuid;

use crate::helpers::spawn_app;
use crate::helpers::starts_in_days;

#[tokio::test]
async fn admin_create_session_endpoint_requires_admin() {
    let app = spawn_app().await;
    app.create_user("pleb@x.test", "Pleb", false).await;
    app.login("pleb@x.test").await;

    let resp = app
        .api_client
        .post(format!("{}/admin/sessions", app.addr))
        .json(&serde_json::json!({
            "starts_at": starts_in_days(3),
            "timezone": "America/Vancouver",
            "capacity": 10,
            "fee_cents": 800,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);
}

#[tokio::test]
async fn create_session_with_preregistrations_allocates_in_order() {
    let app = spawn_app().await;
    let fee = 800;

    let funded = app.create_user("pre-a@x.test", "PreA", false).await;
    app.deposit(funded, 8000).await;
    let broke = app.create_user("pre-b@x.test", "PreB", false).await;
    let overflow = app.create_user("pre-c@x.test", "PreC", false).await;
    app.deposit(overflow, 8000).await;

    let (session, results) = create_session(
        &app.pool,
        NewSession {
            title: Some("league night".into()),
            starts_at: starts_in_days(3),
            timezone: "America/Vancouver".into(),
            capacity: 3,
            fee_cents: fee,
        },
        vec![
            // whole party of 3 fits exactly
            PreregItem {
                user_id: funded,
                seats: 3,
                guest_names: vec!["g1".into(), "g2".into()],
                idempotency_key: format!("prereg:a:{}", Uuid::new_v4()),
            },
            // no funds
            PreregItem {
                user_id: broke,
                seats: 1,
                guest_names: vec![],
                idempotency_key: format!("prereg:b:{}", Uuid::new_v4()),
            },
            // session is now full: waitlisted whole
            PreregItem {
                user_id: overflow,
                seats: 1,
                guest_names: vec![],
                idempotency_key: format!("prereg:c:{}", Uuid::new_v4()),
            },
        ],
    )
    .await
    .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].state, "confirmed");
    assert_eq!(results[1].state, "rejected");
    assert_eq!(results[1].error.as_deref(), Some("insufficient_funds"));
    assert_eq!(results[2].state, "waitlisted");
    assert_eq!(results[2].waitlist_pos, Some(1));

    assert_eq!(app.confirmed_seats(session.id).await, 3);
    // the confirmed party captured 3 seats; the waitlisted single holds 1
    assert_eq!(app.wallet(funded).await, (8000 - 3 * fee, 0));
    assert_eq!(app.wallet(overflow).await, (8000, fee));
}

#[tokio::test]
async fn capacity_cannot_drop_below_confirmed_seats() {
    let app = spawn_app().await;
    let session_id = app
        .create_session_row(starts_in_days(3), "America/Vancouver", 5, 800)
        .await;
    for i in 0..3 {
        let user_id = app
            .create_user(&format!("cap{i}@x.test"), &format!("Cap{i}"), false)
            .await;
        app.deposit(user_id, 8000).await;
        process_registration(&app.pool, session_id, user_id, &[])
            .await
            .unwrap();
    }

    let mut redis = app.redis.clone();
    let result = admin_update_session(
        &app.pool,
        &mut redis,
        session_id,
        Some(2),
        None,
        Utc::now(),
    )
    .await;
    assert!(matches!(result.unwrap_err(), AppError::Conflict(_)));
}

#[tokio::test]
async fn canceled_is_terminal_and_transitions_are_enforced() {
    let app = spawn_app().await;
    let session_id = app
        .create_session_row(starts_in_days(3), "America/Vancouver", 5, 800)
        .await;
    let mut redis = app.redis.clone();

    admin_update_session(
        &app.pool,
        &mut redis,
        session_id,
        None,
        Some("canceled"),
        Utc::now(),
    )
    .await
    .unwrap();

    let result = admin_update_session(
        &app.pool,
        &mut redis,
        session_id,
        None,
        Some("scheduled"),
        Utc::now(),
    )
    .await;
    assert!(matches!(result.unwrap_err(), AppError::Conflict(_)));

    let bad = admin_update_session(
        &app.pool,
        &mut redis,
        session_id,
        None,
        Some("sideways"),
        Utc::now(),
    )
    .await;
    assert!(matches!(bad.unwrap_err(), AppError::Validation(_)));
}

#[tokio::test]
async fn session_cancel_refunds_confirmed_and_releases_waitlisted() {
    let app = spawn_app().await;
    let fee = 800;
    let session_id = app
        .create_session_row(starts_in_days(3), "America/Vancouver", 1, fee)
        .await;

    let confirmed = app.create_user("sc-c@x.test", "ScC", false).await;
    app.deposit(confirmed, 8000).await;
    process_registration(&app.pool, session_id, confirmed, &[])
        .await
        .unwrap();

    let waitlisted = app.create_user("sc-w@x.test", "ScW", false).await;
    app.deposit(waitlisted, 8000).await;
    let wl = process_registration(&app.pool, session_id, waitlisted, &[])
        .await
        .unwrap();
    assert_eq!(wl.state, RequestState::Waitlisted);

    let mut redis = app.redis.clone();
    admin_update_session(
        &app.pool,
        &mut redis,
        session_id,
        None,
        Some("canceled"),
        Utc::now(),
    )
    .await
    .unwrap();

    // both wallets made whole, every registration canceled
    assert_eq!(app.wallet(confirmed).await, (8000, 0));
    assert_eq!(app.wallet(waitlisted).await, (8000, 0));
    let remaining: i64 = sqlx::query(
        "SELECT COUNT(*) AS n FROM registrations WHERE session_id = $1 AND state <> 'canceled'",
    )
    .bind(session_id)
    .fetch_one(&app.pool)
    .await
    .unwrap()
    .get("n");
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn session_close_releases_waitlist_but_keeps_confirmed_captures() {
    let app = spawn_app().await;
    let fee = 800;
    let session_id = app
        .create_session_row(starts_in_days(3), "America/Vancouver", 1, fee)
        .await;

    let confirmed = app.create_user("cl-c@x.test", "ClC", false).await;
    app.deposit(confirmed, 8000).await;
    let confirmed_outcome = process_registration(&app.pool, session_id, confirmed, &[])
        .await
        .unwrap();

    let waitlisted = app.create_user("cl-w@x.test", "ClW", false).await;
    app.deposit(waitlisted, 8000).await;
    process_registration(&app.pool, session_id, waitlisted, &[])
        .await
        .unwrap();

    let mut redis = app.redis.clone();
    admin_update_session(
        &app.pool,
        &mut redis,
        session_id,
        None,
        Some("closed"),
        Utc::now(),
    )
    .await
    .unwrap();

    // the attendee's capture stands; the waitlisted hold is released
    assert_eq!(app.wallet(confirmed).await, (8000 - fee, 0));
    assert_eq!(app.wallet(waitlisted).await, (8000, 0));
    let (state, _) = app
        .registration_state(confirmed_outcome.registration_id.unwrap())
        .await;
    assert_eq!(state, "confirmed");
    assert_eq!(app.waitlist_positions(session_id).await, Vec::<i32>::new());
}

#[tokio::test]
async fn capacity_increase_frees_seats_for_promotion() {
    let app = spawn_app().await;
    let fee = 800;
    let session_id = app
        .create_session_row(starts_in_days(3), "America/Vancouver", 1, fee)
        .await;

    let first = app.create_user("gr-a@x.test", "GrA", false).await;
    app.deposit(first, 8000).await;
    process_registration(&app.pool, session_id, first, &[])
        .await
        .unwrap();
    let second = app.create_user("gr-b@x.test", "GrB", false).await;
    app.deposit(second, 8000).await;
    let wl = process_registration(&app.pool, session_id, second, &[])
        .await
        .unwrap();
    assert_eq!(wl.state, RequestState::Waitlisted);

    let mut redis = app.redis.clone();
    admin_update_session(
        &app.pool,
        &mut redis,
        session_id,
        Some(2),
        None,
        Utc::now(),
    )
    .await
    .unwrap();

    // the patch enqueued a promotion ping for the worker
    let len: i64 = redis::AsyncCommands::xlen(
        &mut redis,
        format!("promote:{session_id}:stream"),
    )
    .await
    .unwrap();
    assert!(len >= 1);

    // and the pass itself promotes the head
    let promoted = promote_waitlist(&app.pool, session_id).await.unwrap();
    assert_eq!(promoted.len(), 1);
    assert_eq!(app.confirmed_seats(session_id).await, 2);
}

#[tokio::test]
async fn auto_closer_closes_overdue_sessions_with_close_semantics() {
    let app = spawn_app().await;
    let fee = 800;
    // started 4 hours ago: past the default 3-hour grace
    let overdue = app
        .create_session_row(
            Utc::now() - Duration::hours(4),
            "America/Vancouver",
            1,
            fee,
        )
        .await;
    // started recently: inside the grace window
    let recent = app
        .create_session_row(
            Utc::now() - Duration::hours(1),
            "America/Vancouver",
            1,
            fee,
        )
        .await;

    // an outstanding waitlist hold on the overdue session
    let waiting = app.create_user("ac@x.test", "Ac", false).await;
    app.deposit(waiting, 8000).await;
    let reg_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO registrations (id, session_id, host_user_id, is_host, seats, state, waitlist_pos) \
         VALUES ($1, $2, $3, true, 1, 'waitlisted', 1)",
    )
    .bind(reg_id)
    .bind(overdue)
    .bind(waiting)
    .execute(&app.pool)
    .await
    .unwrap();
    let mut transaction = app.pool.begin().await.unwrap();
    courtbook::ledger::apply_ledger_entry(
        &mut transaction,
        waiting,
        courtbook::domain::LedgerKind::Hold,
        fee,
        Some(overdue),
        Some(reg_id),
        &format!("hold:{reg_id}"),
    )
    .await
    .unwrap();
    transaction.commit().await.unwrap();

    let closed = close_due_sessions(&app.pool, app.cfg.closer.grace_hours, 200)
        .await
        .unwrap();
    assert_eq!(closed, vec![overdue]);

    let status: String = sqlx::query("SELECT status FROM sessions WHERE id = $1")
        .bind(overdue)
        .fetch_one(&app.pool)
        .await
        .unwrap()
        .get("status");
    assert_eq!(status, "closed");
    let recent_status: String = sqlx::query("SELECT status FROM sessions WHERE id = $1")
        .bind(recent)
        .fetch_one(&app.pool)
        .await
        .unwrap()
        .get("status");
    assert_eq!(recent_status, "scheduled");

    // close semantics applied: hold released, row canceled
    assert_eq!(app.wallet(waiting).await, (8000, 0));
    let (state, pos) = app.registration_state(reg_id).await;
    assert_eq!(state, "canceled");
    assert_eq!(pos, None);
}
