//! Allocator semantics, driven the way the worker drives it: sequential
//! calls in stream order against the real database.

use courtbook::allocator::process_registration;
use courtbook::queue::RequestState;

use crate::helpers::spawn_app;
use crate::helpers::starts_in_days;

#[tokio::test]
async fn capacity_respected_under_contention() {
    let app = spawn_app().await;
    let fee = 800;
    let session_id = app
        .create_session_row(starts_in_days(2), "America/Vancouver", 10, fee)
        .await;

    // 18 users, each with 8000 on deposit, each requesting one seat; the
    // per-session stream imposes a total order, so the worker's view is a
    // sequence of allocator calls
    let mut users = Vec::new();
    for i in 0..18 {
        let user_id = app
            .create_user(&format!("u{i}@x.test"), &format!("U{i}"), false)
            .await;
        app.deposit(user_id, 8000).await;
        users.push(user_id);
    }

    let mut confirmed = 0;
    let mut waitlisted = 0;
    for user_id in &users {
        let outcome = process_registration(&app.pool, session_id, *user_id, &[])
            .await
            .unwrap();
        match outcome.state {
            RequestState::Confirmed => confirmed += 1,
            RequestState::Waitlisted => waitlisted += 1,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    assert_eq!(confirmed, 10);
    assert_eq!(waitlisted, 8);
    assert_eq!(app.confirmed_seats(session_id).await, 10);
    assert_eq!(
        app.waitlist_positions(session_id).await,
        (1..=8).collect::<Vec<i32>>()
    );

    // no wallet ever goes negative: confirmed users captured 800, waitlisted
    // users hold 800
    for user_id in &users {
        let (posted, holds) = app.wallet(*user_id).await;
        assert!(posted >= 0 && holds >= 0 && posted - holds >= 0);
    }
}

#[tokio::test]
async fn group_partial_fit_confirms_whole_party_when_it_fits() {
    let app = spawn_app().await;
    let fee = 800;
    let session_id = app
        .create_session_row(starts_in_days(2), "America/Vancouver", 5, fee)
        .await;

    // two existing 1-seat confirmations
    for i in 0..2 {
        let user_id = app
            .create_user(&format!("pre{i}@x.test"), &format!("P{i}"), false)
            .await;
        app.deposit(user_id, 8000).await;
        let outcome = process_registration(&app.pool, session_id, user_id, &[])
            .await
            .unwrap();
        assert_eq!(outcome.state, RequestState::Confirmed);
    }

    // a party of 3 exactly fits the remaining seats
    let host = app.create_user("host@x.test", "Host", false).await;
    app.deposit(host, 8000).await;
    let outcome = process_registration(
        &app.pool,
        session_id,
        host,
        &["g1".to_string(), "g2".to_string()],
    )
    .await
    .unwrap();

    assert_eq!(outcome.state, RequestState::Confirmed);
    assert_eq!(outcome.created.len(), 3);
    for reg_id in &outcome.created {
        let (state, pos) = app.registration_state(*reg_id).await;
        assert_eq!(state, "confirmed");
        assert_eq!(pos, None);
    }
    assert_eq!(app.confirmed_seats(session_id).await, 5);

    // the host paid for all three seats: 8000 - 2400 posted, nothing held
    let (posted, holds) = app.wallet(host).await;
    assert_eq!(posted, 8000 - 3 * fee);
    assert_eq!(holds, 0);
}

#[tokio::test]
async fn partial_fit_waitlists_overflow_guests_in_order() {
    let app = spawn_app().await;
    let fee = 800;
    let session_id = app
        .create_session_row(starts_in_days(2), "America/Vancouver", 2, fee)
        .await;

    let host = app.create_user("pf@x.test", "PF", false).await;
    app.deposit(host, 8000).await;
    let outcome = process_registration(
        &app.pool,
        session_id,
        host,
        &["g1".to_string(), "g2".to_string()],
    )
    .await
    .unwrap();

    // host + g1 confirmed, g2 waitlisted at position 1
    assert_eq!(outcome.state, RequestState::Confirmed);
    assert_eq!(app.confirmed_seats(session_id).await, 2);
    assert_eq!(app.waitlist_positions(session_id).await, vec![1]);

    // one seat captured per confirmed row, one hold for the waitlisted guest
    let (posted, holds) = app.wallet(host).await;
    assert_eq!(posted, 8000 - 2 * fee);
    assert_eq!(holds, fee);
}

#[tokio::test]
async fn existing_waitlist_queues_newcomers_even_with_free_seats() {
    let app = spawn_app().await;
    let fee = 800;
    let session_id = app
        .create_session_row(starts_in_days(2), "America/Vancouver", 2, fee)
        .await;

    // fill the session, then one user lands on the waitlist
    for i in 0..2 {
        let user_id = app
            .create_user(&format!("w{i}@x.test"), &format!("W{i}"), false)
            .await;
        app.deposit(user_id, 8000).await;
        process_registration(&app.pool, session_id, user_id, &[])
            .await
            .unwrap();
    }
    let waiting = app.create_user("waiting@x.test", "Waiting", false).await;
    app.deposit(waiting, 8000).await;
    let waiting_outcome = process_registration(&app.pool, session_id, waiting, &[])
        .await
        .unwrap();
    assert_eq!(waiting_outcome.state, RequestState::Waitlisted);
    assert_eq!(waiting_outcome.waitlist_pos, Some(1));

    // capacity grows but the promotion pass has not run yet: a seat is free
    // while the waitlist is non-empty
    sqlx::query("UPDATE sessions SET capacity = 3 WHERE id = $1")
        .bind(session_id)
        .execute(&app.pool)
        .await
        .unwrap();

    // fairness-first: the newcomer must queue behind the existing head, not
    // grab the free seat
    let newcomer = app.create_user("newcomer@x.test", "Newcomer", false).await;
    app.deposit(newcomer, 8000).await;
    let newcomer_outcome = process_registration(&app.pool, session_id, newcomer, &[])
        .await
        .unwrap();
    assert_eq!(newcomer_outcome.state, RequestState::Waitlisted);
    assert_eq!(newcomer_outcome.waitlist_pos, Some(2));
    assert_eq!(app.confirmed_seats(session_id).await, 2);
}

#[tokio::test]
async fn insufficient_funds_rejects_the_whole_party() {
    let app = spawn_app().await;
    let session_id = app
        .create_session_row(starts_in_days(2), "America/Vancouver", 10, 800)
        .await;

    // 1600 covers two seats, not three
    let host = app.create_user("poor@x.test", "Poor", false).await;
    app.deposit(host, 1600).await;
    let outcome = process_registration(
        &app.pool,
        session_id,
        host,
        &["g1".to_string(), "g2".to_string()],
    )
    .await
    .unwrap();

    assert_eq!(outcome.state, RequestState::Rejected);
    assert_eq!(app.confirmed_seats(session_id).await, 0);
    let (posted, holds) = app.wallet(host).await;
    assert_eq!((posted, holds), (1600, 0));
}

#[tokio::test]
async fn duplicate_host_is_rejected_by_the_allocator_too() {
    let app = spawn_app().await;
    let session_id = app
        .create_session_row(starts_in_days(2), "America/Vancouver", 10, 800)
        .await;

    let user_id = app.create_user("dup@x.test", "Dup", false).await;
    app.deposit(user_id, 8000).await;
    let first = process_registration(&app.pool, session_id, user_id, &[])
        .await
        .unwrap();
    assert_eq!(first.state, RequestState::Confirmed);

    let second = process_registration(&app.pool, session_id, user_id, &[])
        .await
        .unwrap();
    assert_eq!(second.state, RequestState::Rejected);
}
