//! The transactional outbox: events commit with the state change that
//! produced them and are marked sent by the dispatcher.

use courtbook::allocator::process_registration;
use courtbook::outbox::publish_pending;
use sqlx::Row;

use crate::helpers::spawn_app;
use crate::helpers::starts_in_days;

#[tokio::test]
async fn allocator_events_commit_with_the_registration() {
    let app = spawn_app().await;
    let session_id = app
        .create_session_row(starts_in_days(3), "America/Vancouver", 5, 800)
        .await;
    let user_id = app.create_user("ob@x.test", "Ob", false).await;
    app.deposit(user_id, 8000).await;

    process_registration(&app.pool, session_id, user_id, &["g1".to_string()])
        .await
        .unwrap();

    // one confirmed event per created row, on the session channel
    let rows = sqlx::query(
        "SELECT channel, payload FROM events_outbox ORDER BY id ASC",
    )
    .fetch_all(&app.pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(
            row.get::<String, _>("channel"),
            format!("session:{session_id}")
        );
        let payload: serde_json::Value = row.get("payload");
        assert_eq!(payload["type"], "registration_confirmed");
    }
}

#[tokio::test]
async fn dispatcher_marks_published_rows_sent() {
    let app = spawn_app().await;
    let session_id = app
        .create_session_row(starts_in_days(3), "America/Vancouver", 5, 800)
        .await;
    let user_id = app.create_user("ob2@x.test", "Ob2", false).await;
    app.deposit(user_id, 8000).await;
    process_registration(&app.pool, session_id, user_id, &[])
        .await
        .unwrap();

    let mut redis = app.redis.clone();
    let sent = publish_pending(&app.pool, &mut redis).await.unwrap();
    assert_eq!(sent, 1);

    let row = sqlx::query(
        "SELECT sent_at IS NOT NULL AS sent, attempts, error FROM events_outbox",
    )
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert!(row.get::<bool, _>("sent"));
    assert_eq!(row.get::<i32, _>("attempts"), 1);
    assert!(row.get::<Option<String>, _>("error").is_none());

    // a second pass finds nothing to do
    let sent = publish_pending(&app.pool, &mut redis).await.unwrap();
    assert_eq!(sent, 0);
}
