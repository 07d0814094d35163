use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::PgPool;
use uuid::Uuid;

use crate::configuration::Settings;
use crate::errors::AppError;
use crate::startup::get_connection_pool;
use crate::startup::get_redis;
use crate::tx::PgTransaction;

const BATCH: i64 = 100;
const SLEEP_DRAINED: Duration = Duration::from_millis(50);
const SLEEP_EMPTY: Duration = Duration::from_secs(1);
const SLEEP_ERROR: Duration = Duration::from_secs(2);

/// Channel carrying all registration/lifecycle events for one session.
pub fn session_channel(session_id: Uuid) -> String {
    format!("session:{session_id}")
}

/// Insert a domain event into the outbox, inside the caller's transaction.
/// The event becomes visible to the dispatcher only when that transaction
/// commits, so consumers never observe events for state that was rolled back.
pub async fn append_event(
    transaction: &mut PgTransaction,
    channel: &str,
    payload: &serde_json::Value,
) -> Result<(), AppError> {
    sqlx::query("INSERT INTO events_outbox (channel, payload) VALUES ($1, $2)")
        .bind(channel)
        .bind(payload)
        .execute(&mut **transaction)
        .await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    channel: String,
    payload: serde_json::Value,
}

/// Publish one locked batch of unsent events to the realtime bus. Delivery is
/// at-least-once: a crash after publish but before commit re-publishes the
/// batch, so consumers must tolerate duplicates.
#[tracing::instrument(skip_all)]
pub async fn publish_pending(
    pool: &PgPool,
    redis: &mut ConnectionManager,
) -> Result<usize, AppError> {
    let mut transaction = pool.begin().await?;
    let rows = sqlx::query_as::<_, OutboxRow>(
        r#"
        SELECT id, channel, payload
        FROM events_outbox
        WHERE sent_at IS NULL AND available_at <= now()
        ORDER BY id ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(BATCH)
    .fetch_all(&mut *transaction)
    .await?;
    if rows.is_empty() {
        return Ok(0);
    }

    let mut sent = 0;
    for row in rows {
        match redis
            .publish::<_, _, i64>(&row.channel, row.payload.to_string())
            .await
        {
            Ok(_) => {
                sqlx::query(
                    "UPDATE events_outbox SET sent_at = now(), attempts = attempts + 1, error = NULL WHERE id = $1",
                )
                .bind(row.id)
                .execute(&mut *transaction)
                .await?;
                sent += 1;
            }
            Err(e) => {
                // leave sent_at NULL; the row is retried on a later pass
                tracing::warn!(
                    error.cause_chain = ?e,
                    outbox_id = row.id,
                    "failed to publish outbox event"
                );
                sqlx::query(
                    "UPDATE events_outbox SET attempts = attempts + 1, error = $2 WHERE id = $1",
                )
                .bind(row.id)
                .bind(e.to_string())
                .execute(&mut *transaction)
                .await?;
            }
        }
    }
    transaction.commit().await?;
    Ok(sent)
}

/// To be run as a background worker, alongside or outside the main API.
pub async fn init_outbox_worker(cfg: Settings) -> Result<(), anyhow::Error> {
    let pool = get_connection_pool(&cfg.database);
    let mut redis = get_redis(&cfg).await?;
    loop {
        match publish_pending(&pool, &mut redis).await {
            Ok(0) => tokio::time::sleep(SLEEP_EMPTY).await,
            Ok(_) => tokio::time::sleep(SLEEP_DRAINED).await,
            Err(e) => {
                tracing::error!(error.cause_chain = ?e, "outbox dispatch pass failed");
                tokio::time::sleep(SLEEP_ERROR).await;
            }
        }
    }
}
