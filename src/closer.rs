//! Auto-closer: periodically closes scheduled sessions whose start time
//! passed by the grace period, applying the same close semantics as an admin
//! close (waitlisted holds released, waitlisted rows canceled).

use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use sqlx::PgPool;
use uuid::Uuid;

use crate::configuration::Settings;
use crate::domain::LedgerKind;
use crate::domain::RegistrationState;
use crate::errors::AppError;
use crate::ledger::apply_ledger_entry;
use crate::outbox::append_event;
use crate::outbox::session_channel;
use crate::queue::keys;
use crate::registrations::mark_canceled;
use crate::registrations::RegistrationRow;
use crate::registrations::SessionRow;
use crate::startup::get_connection_pool;
use crate::startup::get_redis;
use crate::tx::begin_serializable;
use crate::tx::PgTransaction;

async fn release_waitlist(
    transaction: &mut PgTransaction,
    session: &SessionRow,
) -> Result<(), AppError> {
    let waitlisted = sqlx::query_as::<_, RegistrationRow>(
        r#"
        SELECT id, session_id, host_user_id, group_key, is_host, seats,
               guest_names, state, waitlist_pos, created_at
        FROM registrations
        WHERE session_id = $1 AND state = 'waitlisted'
        ORDER BY waitlist_pos ASC
        FOR UPDATE
        "#,
    )
    .bind(session.id)
    .fetch_all(&mut **transaction)
    .await?;

    let now = Utc::now();
    for reg in &waitlisted {
        let total_fee = i64::from(reg.seats) * session.fee_cents;
        if total_fee > 0 {
            apply_ledger_entry(
                transaction,
                reg.host_user_id,
                LedgerKind::HoldRelease,
                -total_fee,
                Some(session.id),
                Some(reg.id),
                &format!("release_close:{}", reg.id),
            )
            .await?;
        }
        mark_canceled(transaction, reg.id, RegistrationState::Waitlisted, now).await?;
    }
    Ok(())
}

/// Close at most `batch` overdue sessions in one SERIALIZABLE transaction.
/// Rows are locked with skip-locked so a concurrent admin edit simply makes
/// this tick skip that session.
#[tracing::instrument(skip(pool))]
pub async fn close_due_sessions(
    pool: &PgPool,
    grace_hours: i64,
    batch: i64,
) -> Result<Vec<Uuid>, AppError> {
    let cutoff = Utc::now() - chrono::Duration::hours(grace_hours);
    let mut transaction = begin_serializable(pool).await?;

    let due = sqlx::query_as::<_, SessionRow>(
        r#"
        SELECT id, title, starts_at, timezone, capacity, fee_cents, status, created_at
        FROM sessions
        WHERE status = 'scheduled' AND starts_at <= $1
        ORDER BY starts_at ASC
        LIMIT $2
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(cutoff)
    .bind(batch)
    .fetch_all(&mut *transaction)
    .await?;
    if due.is_empty() {
        transaction.rollback().await?;
        return Ok(Vec::new());
    }

    let mut closed = Vec::with_capacity(due.len());
    for session in &due {
        release_waitlist(&mut transaction, session).await?;
        sqlx::query("UPDATE sessions SET status = 'closed' WHERE id = $1")
            .bind(session.id)
            .execute(&mut *transaction)
            .await?;
        append_event(
            &mut transaction,
            &session_channel(session.id),
            &serde_json::json!({
                "type": "session_status_changed",
                "session_id": session.id,
                "old_status": "scheduled",
                "new_status": "closed",
            }),
        )
        .await?;
        closed.push(session.id);
    }

    transaction.commit().await?;
    Ok(closed)
}

/// Cooperative lock so only one replica scans per tick; the short TTL means
/// a crashed holder frees the lock by itself.
async fn acquire_lock(
    redis: &mut ConnectionManager,
    ttl_secs: u64,
) -> Result<bool, AppError> {
    let reply: Option<String> = redis::cmd("SET")
        .arg(keys::closer_lock())
        .arg("1")
        .arg("NX")
        .arg("EX")
        .arg(ttl_secs)
        .query_async(redis)
        .await?;
    Ok(reply.is_some())
}

/// To be run as a background worker, alongside or outside the main API.
pub async fn init_closer_worker(cfg: Settings) -> Result<(), anyhow::Error> {
    let pool = get_connection_pool(&cfg.database);
    let mut redis = get_redis(&cfg).await?;
    loop {
        match acquire_lock(&mut redis, cfg.closer.lock_ttl_secs).await {
            Ok(true) => {
                match close_due_sessions(&pool, cfg.closer.grace_hours, cfg.closer.batch).await {
                    Ok(closed) if !closed.is_empty() => {
                        tracing::info!(count = closed.len(), "auto-closed sessions")
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error.cause_chain = ?e, "auto-close pass failed")
                    }
                }
            }
            // another replica holds the lock; idle this tick
            Ok(false) => {}
            Err(e) => tracing::warn!(error.cause_chain = ?e, "closer lock unavailable"),
        }
        tokio::time::sleep(Duration::from_secs(cfg.closer.interval_secs)).await;
    }
}
