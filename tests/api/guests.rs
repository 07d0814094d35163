//! Guest-list edits: names-only, shrink with refund/penalty, and the
//! fairness rule on guest add.

use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use chrono_tz::Tz;
use courtbook::allocator::process_registration;
use courtbook::errors::AppError;
use courtbook::guests::add_guest;
use courtbook::guests::update_guest_list;
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

/// A whole-party row (prereg style) carrying its guests on the row itself,
/// which is what the shrink path edits.
async fn insert_party_row(
    app: &crate::helpers::TestApp,
    session_id: Uuid,
    host: Uuid,
    seats: i32,
    guests: &[&str],
    state: &str,
    pos: Option<i32>,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO registrations \
         (id, session_id, host_user_id, is_host, seats, guest_names, state, waitlist_pos) \
         VALUES ($1, $2, $3, true, $4, $5, $6, $7)",
    )
    .bind(id)
    .bind(session_id)
    .bind(host)
    .bind(seats)
    .bind(guests.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    .bind(state)
    .bind(pos)
    .execute(&app.pool)
    .await
    .unwrap();
    id
}

#[tokio::test]
async fn names_only_edit_is_free() {
    let app = spawn_app().await;
    let fee = 800;
    let session_id = app
        .create_session_row(starts_in_days(3), VANCOUVER, 5, fee)
        .await;
    let host = app.create_user("no@x.test", "No", false).await;
    app.deposit(host, 8000).await;
    let reg_id = insert_party_row(&app, session_id, host, 2, &["old name"], "confirmed", None).await;

    let mut redis = app.redis.clone();
    let outcome = update_guest_list(
        &app.pool,
        &mut redis,
        reg_id,
        host,
        false,
        &["new name".to_string()],
        Utc::now(),
    )
    .await
    .unwrap();

    assert_eq!((outcome.old_seats, outcome.new_seats), (2, 2));
    assert_eq!((outcome.refund_cents, outcome.penalty_cents), (0, 0));
    let names: Vec<String> = sqlx::query("SELECT guest_names FROM registrations WHERE id = $1")
        .bind(reg_id)
        .fetch_one(&app.pool)
        .await
        .unwrap()
        .get("guest_names");
    assert_eq!(names, vec!["new name".to_string()]);
}

#[tokio::test]
async fn confirmed_shrink_refunds_removed_seats_by_policy() {
    let app = spawn_app().await;
    let fee = 900;
    let starts_at = local(2030, 2, 10, 20);
    let session_id = app.create_session_row(starts_at, VANCOUVER, 5, fee).await;
    let host = app.create_user("sh@x.test", "Sh", false).await;
    app.deposit(host, 10_000).await;
    let reg_id =
        insert_party_row(&app, session_id, host, 3, &["g1", "g2"], "confirmed", None).await;
    // the capture the allocator would have made for 3 seats
    let mut transaction = app.pool.begin().await.unwrap();
    courtbook::ledger::apply_ledger_entry(
        &mut transaction,
        host,
        courtbook::domain::LedgerKind::FeeCapture,
        -3 * fee,
        Some(session_id),
        Some(reg_id),
        &format!("cap:{reg_id}"),
    )
    .await
    .unwrap();
    transaction.commit().await.unwrap();

    // drop one guest on the session's start day: the removed seat is
    // refunded at 50%
    let mut redis = app.redis.clone();
    let outcome = update_guest_list(
        &app.pool,
        &mut redis,
        reg_id,
        host,
        false,
        &["g1".to_string()],
        local(2030, 2, 10, 9),
    )
    .await
    .unwrap();

    assert_eq!((outcome.old_seats, outcome.new_seats), (3, 2));
    assert_eq!(outcome.refund_cents, 450);
    assert_eq!(outcome.penalty_cents, -450);
    // -2700 captured, +450 refunded, -450 penalty
    assert_eq!(app.wallet(host).await, (10_000 - 2700, 0));
}

#[tokio::test]
async fn guest_edit_cannot_grow_the_party() {
    let app = spawn_app().await;
    let session_id = app
        .create_session_row(starts_in_days(3), VANCOUVER, 5, 800)
        .await;
    let host = app.create_user("gr@x.test", "Gr", false).await;
    app.deposit(host, 8000).await;
    let reg_id = insert_party_row(&app, session_id, host, 1, &[], "confirmed", None).await;

    let mut redis = app.redis.clone();
    let result = update_guest_list(
        &app.pool,
        &mut redis,
        reg_id,
        host,
        false,
        &["g1".to_string()],
        Utc::now(),
    )
    .await;
    assert!(matches!(result.unwrap_err(), AppError::Conflict(_)));
}

#[tokio::test]
async fn guest_add_confirms_when_capacity_allows_and_no_waitlist() {
    let app = spawn_app().await;
    let fee = 800;
    let session_id = app
        .create_session_row(starts_in_days(3), VANCOUVER, 5, fee)
        .await;
    let host = app.create_user("ga@x.test", "Ga", false).await;
    app.deposit(host, 8000).await;
    let outcome = process_registration(&app.pool, session_id, host, &[])
        .await
        .unwrap();
    let host_reg = outcome.registration_id.unwrap();

    let mut redis = app.redis.clone();
    let added = add_guest(
        &app.pool,
        &mut redis,
        host_reg,
        "plus one".to_string(),
        host,
        false,
        Utc::now(),
    )
    .await
    .unwrap();

    assert_eq!(added.state, "confirmed");
    assert_eq!(app.confirmed_seats(session_id).await, 2);
    // the host's solo row had no group key; adding a guest assigned one
    let keys: Vec<Option<Uuid>> = sqlx::query(
        "SELECT group_key FROM registrations WHERE session_id = $1",
    )
    .bind(session_id)
    .fetch_all(&app.pool)
    .await
    .unwrap()
    .into_iter()
    .map(|r| r.get("group_key"))
    .collect();
    assert!(keys.iter().all(|k| k.is_some()));
    assert_eq!(app.wallet(host).await, (8000 - 2 * fee, 0));
}

#[tokio::test]
async fn guest_add_queues_at_tail_whenever_a_waitlist_exists() {
    let app = spawn_app().await;
    let fee = 800;
    let session_id = app
        .create_session_row(starts_in_days(3), VANCOUVER, 1, fee)
        .await;

    let host = app.create_user("gt@x.test", "Gt", false).await;
    app.deposit(host, 8000).await;
    let host_outcome = process_registration(&app.pool, session_id, host, &[])
        .await
        .unwrap();
    assert_eq!(host_outcome.state, RequestState::Confirmed);

    let other = app.create_user("gt2@x.test", "Gt2", false).await;
    app.deposit(other, 8000).await;
    let other_outcome = process_registration(&app.pool, session_id, other, &[])
        .await
        .unwrap();
    assert_eq!(other_outcome.state, RequestState::Waitlisted);

    // capacity frees up, but the promotion has not run: the new guest must
    // still queue behind the waitlisted user
    sqlx::query("UPDATE sessions SET capacity = 3 WHERE id = $1")
        .bind(session_id)
        .execute(&app.pool)
        .await
        .unwrap();

    let mut redis = app.redis.clone();
    let added = add_guest(
        &app.pool,
        &mut redis,
        host_outcome.registration_id.unwrap(),
        "tagalong".to_string(),
        host,
        false,
        Utc::now(),
    )
    .await
    .unwrap();

    assert_eq!(added.state, "waitlisted");
    assert_eq!(added.waitlist_pos, Some(2));
    assert_eq!(app.wallet(host).await, (8000 - fee, fee));
}

#[tokio::test]
async fn at_most_two_active_guests_per_host() {
    let app = spawn_app().await;
    let fee = 800;
    let session_id = app
        .create_session_row(starts_in_days(3), VANCOUVER, 10, fee)
        .await;
    let host = app.create_user("max@x.test", "Max", false).await;
    app.deposit(host, 8000).await;
    let outcome = process_registration(&app.pool, session_id, host, &["g1".to_string()])
        .await
        .unwrap();
    let host_reg = outcome.registration_id.unwrap();

    let mut redis = app.redis.clone();
    add_guest(
        &app.pool,
        &mut redis,
        host_reg,
        "g2".to_string(),
        host,
        false,
        Utc::now(),
    )
    .await
    .unwrap();

    let third = add_guest(
        &app.pool,
        &mut redis,
        host_reg,
        "g3".to_string(),
        host,
        false,
        Utc::now(),
    )
    .await;
    assert!(matches!(third.unwrap_err(), AppError::Conflict(_)));
}
