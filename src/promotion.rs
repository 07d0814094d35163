//! Waitlist promotion: when capacity frees, confirm strict-FIFO heads that
//! fit. The head is never skipped; a too-large head blocks everyone behind
//! it until more seats free up.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::configuration::Settings;
use crate::domain::LedgerKind;
use crate::domain::SessionStatus;
use crate::errors::is_serialization_failure;
use crate::errors::AppError;
use crate::ledger::apply_ledger_entry;
use crate::outbox::append_event;
use crate::outbox::session_channel;
use crate::queue;
use crate::queue::RequestState;
use crate::registrations::collapse_positions_above;
use crate::registrations::confirmed_seats;
use crate::registrations::lock_session;
use crate::registrations::RegistrationRow;
use crate::startup::get_connection_pool;
use crate::startup::get_redis;
use crate::tx::begin_serializable;
use crate::tx::PgTransaction;

pub const PROMOTION_GROUP: &str = "cb-promoters";

#[derive(Debug)]
pub struct Promoted {
    pub registration_id: Uuid,
    pub host_user_id: Uuid,
    pub seats: i32,
}

/// Ask the promotion worker to run a pass for this session. Cheap and safe
/// to over-call: a pass with nothing to do is a no-op.
pub async fn enqueue_promotion(
    redis: &mut ConnectionManager,
    session_id: Uuid,
) -> Result<(), AppError> {
    redis
        .xadd::<_, _, _, _, String>(
            queue::keys::promote_stream(session_id),
            "*",
            &[("ts", Utc::now().to_rfc3339().as_str())],
        )
        .await?;
    Ok(())
}

async fn lock_waitlist_head(
    transaction: &mut PgTransaction,
    session_id: Uuid,
) -> Result<Option<RegistrationRow>, AppError> {
    let row = sqlx::query_as::<_, RegistrationRow>(
        r#"
        SELECT id, session_id, host_user_id, group_key, is_host, seats,
               guest_names, state, waitlist_pos, created_at
        FROM registrations
        WHERE session_id = $1 AND state = 'waitlisted'
        ORDER BY waitlist_pos ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(session_id)
    .fetch_optional(&mut **transaction)
    .await?;
    Ok(row)
}

/// The promotion unit at the head of the waitlist: the head row plus its
/// group siblings sitting at consecutive positions directly behind it. A
/// split party enqueues contiguously, and promoting it piecemeal would strand
/// guests a host has already paid to bring; rows of the same group that were
/// appended later (guest-add while others queued) sit further back and form
/// their own unit, so nobody in between is leapfrogged.
async fn head_unit(
    transaction: &mut PgTransaction,
    session_id: Uuid,
    head: RegistrationRow,
) -> Result<Vec<RegistrationRow>, AppError> {
    let Some(group_key) = head.group_key else {
        return Ok(vec![head]);
    };
    let Some(head_pos) = head.waitlist_pos else {
        return Ok(vec![head]);
    };
    let siblings = sqlx::query_as::<_, RegistrationRow>(
        r#"
        SELECT id, session_id, host_user_id, group_key, is_host, seats,
               guest_names, state, waitlist_pos, created_at
        FROM registrations
        WHERE session_id = $1 AND group_key = $2 AND state = 'waitlisted'
          AND waitlist_pos > $3
        ORDER BY waitlist_pos ASC
        FOR UPDATE
        "#,
    )
    .bind(session_id)
    .bind(group_key)
    .bind(head_pos)
    .fetch_all(&mut **transaction)
    .await?;

    let mut unit = vec![head];
    let mut expected = head_pos + 1;
    for sibling in siblings {
        if sibling.waitlist_pos != Some(expected) {
            break;
        }
        expected += 1;
        unit.push(sibling);
    }
    Ok(unit)
}

/// One promotion pass for one session, in a single SERIALIZABLE transaction.
///
/// Confirms head units while they fit whole, converting each row's hold into
/// a capture plus a release (both idempotency-keyed, so a replayed pass
/// cannot double-charge), clearing positions and collapsing the rest. A head
/// unit that does not fit stops the pass: strict FIFO, nobody is skipped.
#[tracing::instrument(skip(pool), fields(%session_id))]
pub async fn promote_waitlist(
    pool: &PgPool,
    session_id: Uuid,
) -> Result<Vec<Promoted>, AppError> {
    let mut transaction = begin_serializable(pool).await?;

    let session = match lock_session(&mut transaction, session_id).await? {
        Some(s) => s,
        None => return Ok(Vec::new()),
    };
    if session.status()? != SessionStatus::Scheduled {
        transaction.rollback().await?;
        return Ok(Vec::new());
    }

    let taken = confirmed_seats(&mut transaction, session_id).await?;
    let mut remaining = i64::from(session.capacity).saturating_sub(taken).max(0);
    if remaining <= 0 {
        transaction.rollback().await?;
        return Ok(Vec::new());
    }

    let mut promoted = Vec::new();
    while remaining > 0 {
        let head = match lock_waitlist_head(&mut transaction, session_id).await? {
            Some(head) => head,
            None => break,
        };
        let unit = head_unit(&mut transaction, session_id, head).await?;
        let unit_seats: i64 = unit.iter().map(|r| i64::from(r.seats)).sum();
        if unit_seats > remaining {
            // strict FIFO: do NOT skip the head to fit someone smaller
            break;
        }

        for row in &unit {
            let total_fee = i64::from(row.seats) * session.fee_cents;
            // same key family as the initial confirm path, so a row that was
            // somehow captured already is not charged again; free sessions
            // have no hold to convert
            if total_fee > 0 {
                apply_ledger_entry(
                    &mut transaction,
                    row.host_user_id,
                    LedgerKind::FeeCapture,
                    -total_fee,
                    Some(session.id),
                    Some(row.id),
                    &format!("cap:{}", row.id),
                )
                .await?;
                apply_ledger_entry(
                    &mut transaction,
                    row.host_user_id,
                    LedgerKind::HoldRelease,
                    -total_fee,
                    Some(session.id),
                    Some(row.id),
                    &format!("rel:{}", row.id),
                )
                .await?;
            }

            // earlier promotions in this unit already shifted positions, so
            // read the current one rather than trusting the locked snapshot
            let current_pos = sqlx::query("SELECT waitlist_pos FROM registrations WHERE id = $1")
                .bind(row.id)
                .fetch_one(&mut *transaction)
                .await?
                .try_get::<Option<i32>, _>("waitlist_pos")?;
            sqlx::query(
                "UPDATE registrations SET state = 'confirmed', waitlist_pos = NULL WHERE id = $1",
            )
            .bind(row.id)
            .execute(&mut *transaction)
            .await?;
            if let Some(old_pos) = current_pos {
                collapse_positions_above(&mut transaction, session_id, old_pos).await?;
            }

            append_event(
                &mut transaction,
                &session_channel(session_id),
                &serde_json::json!({
                    "type": "registration_promoted",
                    "session_id": session_id,
                    "registration_id": row.id,
                    "host_user_id": row.host_user_id,
                    "seats": row.seats,
                    "ts": Utc::now().to_rfc3339(),
                }),
            )
            .await?;

            promoted.push(Promoted {
                registration_id: row.id,
                host_user_id: row.host_user_id,
                seats: row.seats,
            });
        }
        remaining -= unit_seats;
    }

    match promoted.is_empty() {
        true => transaction.rollback().await?,
        false => transaction.commit().await?,
    }
    Ok(promoted)
}

async fn promote_with_retry(
    pool: &PgPool,
    session_id: Uuid,
    max_retries: u32,
) -> Result<Vec<Promoted>, AppError> {
    let mut attempt = 0;
    loop {
        match promote_waitlist(pool, session_id).await {
            Err(e) if is_serialization_failure(&e) && attempt < max_retries => {
                attempt += 1;
                tracing::warn!(%session_id, attempt, "serialization conflict; retrying promotion");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            other => return other,
        }
    }
}

/// Flip the originating requests of promoted rows to `confirmed` on the
/// request-status channel.
async fn publish_promotions(
    redis: &mut ConnectionManager,
    cfg: &Settings,
    promoted: &[Promoted],
) -> Result<(), AppError> {
    for p in promoted {
        if let Some(request_id) =
            queue::get_registration_request(redis, p.registration_id).await?
        {
            queue::record_outcome(
                redis,
                &request_id,
                RequestState::Confirmed,
                Some(p.registration_id),
                None,
                cfg.queue.request_ttl_secs,
            )
            .await?;
        }
    }
    Ok(())
}

async fn discover_sessions(pool: &PgPool) -> Result<Vec<Uuid>, AppError> {
    let rows = sqlx::query("SELECT id FROM sessions WHERE status = 'scheduled'")
        .fetch_all(pool)
        .await?;
    rows.into_iter()
        .map(|r| r.try_get::<Uuid, _>("id").map_err(AppError::from))
        .collect()
}

/// Stream-consumer loop over the per-session promotion streams. Multiple
/// queued pings coalesce naturally: each handled message runs a full pass.
pub async fn run_promotion_worker(
    cfg: Settings,
    scope: crate::allocator::WorkerScope,
    consumer: String,
) -> Result<(), anyhow::Error> {
    let pool = get_connection_pool(&cfg.database);
    let mut redis = get_redis(&cfg).await?;
    let mut known: HashMap<String, Uuid> = HashMap::new();
    let mut last_discovery: Option<tokio::time::Instant> = None;

    loop {
        let discovery_due = last_discovery
            .map(|t| t.elapsed() >= Duration::from_secs(cfg.queue.discover_interval_secs))
            .unwrap_or(true);
        if discovery_due {
            let ids = match scope {
                crate::allocator::WorkerScope::Session(id) => Ok(vec![id]),
                crate::allocator::WorkerScope::All => discover_sessions(&pool).await,
            };
            match ids {
                Ok(ids) => {
                    for session_id in ids {
                        let stream = queue::keys::promote_stream(session_id);
                        if !known.contains_key(&stream) {
                            queue::ensure_group(&mut redis, &stream, PROMOTION_GROUP).await?;
                            known.insert(stream, session_id);
                        }
                    }
                    last_discovery = Some(tokio::time::Instant::now());
                }
                Err(e) => {
                    tracing::warn!(error.cause_chain = ?e, "session discovery failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        if known.is_empty() {
            tokio::time::sleep(Duration::from_secs(cfg.queue.discover_interval_secs)).await;
            continue;
        }

        let streams: Vec<String> = known.keys().cloned().collect();
        let batches = match queue::read_group(
            &mut redis,
            &streams,
            PROMOTION_GROUP,
            &consumer,
            10,
            cfg.queue.block_ms as usize,
        )
        .await
        {
            Ok(batches) => batches,
            Err(e) => {
                tracing::warn!(error.cause_chain = ?e, "stream read failed; backing off");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        for (stream, messages) in batches {
            let Some(&session_id) = known.get(&stream) else {
                continue;
            };
            for message in messages {
                match promote_with_retry(&pool, session_id, cfg.queue.max_txn_retries).await {
                    Ok(promoted) => {
                        publish_promotions(&mut redis, &cfg, &promoted).await?;
                        queue::ack(&mut redis, &stream, PROMOTION_GROUP, &message.id).await?;
                    }
                    Err(e) => {
                        tracing::error!(error.cause_chain = ?e, %session_id, "promotion pass failed; will redeliver");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        }
    }
}

/// To be run as a background worker, alongside or outside the main API.
pub async fn init_promotion_worker(cfg: Settings) -> Result<(), anyhow::Error> {
    let consumer = format!("c-{}", std::process::id());
    run_promotion_worker(cfg, crate::allocator::WorkerScope::All, consumer).await
}
