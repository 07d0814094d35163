//! The registration allocation core: one serializable transaction per
//! intent, consumed in stream order so no two allocations for the same
//! session ever run in parallel.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::configuration::Settings;
use crate::domain::normalize_guests;
use crate::domain::plan_allocation;
use crate::domain::LedgerKind;
use crate::domain::RegistrationState;
use crate::domain::SeatOutcome;
use crate::domain::SessionStatus;
use crate::errors::is_serialization_failure;
use crate::errors::AppError;
use crate::ledger::apply_ledger_entry;
use crate::ledger::wallet_summary;
use crate::outbox::append_event;
use crate::outbox::session_channel;
use crate::queue;
use crate::queue::RequestState;
use crate::registrations::active_host_exists;
use crate::registrations::confirmed_seats;
use crate::registrations::insert_registration;
use crate::registrations::lock_session;
use crate::registrations::next_waitlist_pos;
use crate::registrations::waitlist_exists;
use crate::registrations::NewSeatRow;
use crate::startup::get_connection_pool;
use crate::startup::get_redis;
use crate::tx::begin_serializable;

/// The consumer group for ingress streams. A single group with one consumer
/// per stream keeps per-session processing single-threaded.
pub const INGRESS_GROUP: &str = "cb-allocators";

#[derive(Debug)]
pub struct AllocationOutcome {
    pub state: RequestState,
    /// The host row, when one was created
    pub registration_id: Option<Uuid>,
    /// The host row's position, when it was waitlisted
    pub waitlist_pos: Option<i32>,
    pub created: Vec<Uuid>,
}

impl AllocationOutcome {
    fn rejected() -> Self {
        Self {
            state: RequestState::Rejected,
            registration_id: None,
            waitlist_pos: None,
            created: Vec::new(),
        }
    }
}

/// Decide confirm-vs-waitlist for one intent and write every row, ledger
/// entry and outbox event in a single SERIALIZABLE transaction.
///
/// The party is split into 1-seat rows (host first, then guests in
/// submission order) tied together by a group key; per-seat rows keep the
/// waitlist per-seat FIFO and let guest seats cancel independently.
/// Rejections (unknown/closed/started session, duplicate host, insufficient
/// funds) roll the transaction back and report `rejected` — they are
/// outcomes, not errors.
#[tracing::instrument(skip(pool), fields(%session_id, %user_id))]
pub async fn process_registration(
    pool: &PgPool,
    session_id: Uuid,
    user_id: Uuid,
    guest_names: &[String],
) -> Result<AllocationOutcome, AppError> {
    let mut transaction = begin_serializable(pool).await?;

    let session = match lock_session(&mut transaction, session_id).await? {
        Some(s) => s,
        None => return Ok(AllocationOutcome::rejected()),
    };
    if session.status()? != SessionStatus::Scheduled || session.starts_at <= Utc::now() {
        transaction.rollback().await?;
        return Ok(AllocationOutcome::rejected());
    }

    if active_host_exists(&mut transaction, session_id, user_id).await? {
        transaction.rollback().await?;
        return Ok(AllocationOutcome::rejected());
    }

    // server-authoritative party size; the client's seat count was only a
    // sanity check at ingress
    let guests = normalize_guests(guest_names);
    let total_seats = 1 + guests.len() as i64;
    let fee = session.fee_cents;

    // the whole party must be affordable up front, held or captured
    let wallet = wallet_summary(&mut *transaction, user_id).await?;
    if wallet.available_cents() < fee * total_seats {
        transaction.rollback().await?;
        return Ok(AllocationOutcome::rejected());
    }

    let taken = confirmed_seats(&mut transaction, session_id).await?;
    let remaining = i64::from(session.capacity).saturating_sub(taken).max(0);
    let queue_behind = waitlist_exists(&mut transaction, session_id).await?;

    let plan = plan_allocation(remaining, queue_behind, guests.len());
    let group_key = plan.needs_group_key.then(Uuid::new_v4);

    let mut next_pos = match plan.waitlisted_seats() > 0 {
        true => next_waitlist_pos(&mut transaction, session_id).await?,
        false => 0,
    };
    let mut created = Vec::with_capacity(1 + guests.len());

    let mut place_seat = |outcome: SeatOutcome| {
        let pos = match outcome {
            SeatOutcome::Confirmed => None,
            SeatOutcome::Waitlisted => {
                let p = next_pos;
                next_pos += 1;
                Some(p)
            }
        };
        pos
    };

    // host seat
    let host_pos = place_seat(plan.host);
    let host_state = match plan.host {
        SeatOutcome::Confirmed => RegistrationState::Confirmed,
        SeatOutcome::Waitlisted => RegistrationState::Waitlisted,
    };
    let host_id = insert_registration(
        &mut transaction,
        NewSeatRow {
            session_id,
            host_user_id: user_id,
            group_key,
            is_host: true,
            seats: 1,
            guest_names: &[],
            state: host_state,
            waitlist_pos: host_pos,
        },
    )
    .await?;
    created.push(host_id);
    settle_seat(&mut transaction, &session, user_id, host_id, host_state, host_pos, fee).await?;

    // guest seats, in submission order
    for (guest, outcome) in guests.iter().zip(plan.guests.iter()) {
        let pos = place_seat(*outcome);
        let state = match outcome {
            SeatOutcome::Confirmed => RegistrationState::Confirmed,
            SeatOutcome::Waitlisted => RegistrationState::Waitlisted,
        };
        let guest_id = insert_registration(
            &mut transaction,
            NewSeatRow {
                session_id,
                host_user_id: user_id,
                group_key,
                is_host: false,
                seats: 1,
                guest_names: std::slice::from_ref(guest),
                state,
                waitlist_pos: pos,
            },
        )
        .await?;
        created.push(guest_id);
        settle_seat(&mut transaction, &session, user_id, guest_id, state, pos, fee).await?;
    }

    transaction.commit().await?;

    Ok(AllocationOutcome {
        state: match host_state {
            RegistrationState::Confirmed => RequestState::Confirmed,
            _ => RequestState::Waitlisted,
        },
        registration_id: Some(host_id),
        waitlist_pos: host_pos,
        created,
    })
}

/// Money + event for one placed seat: confirmed seats capture the fee,
/// waitlisted seats hold it.
async fn settle_seat(
    transaction: &mut crate::tx::PgTransaction,
    session: &crate::registrations::SessionRow,
    user_id: Uuid,
    registration_id: Uuid,
    state: RegistrationState,
    waitlist_pos: Option<i32>,
    fee: i64,
) -> Result<(), AppError> {
    match state {
        RegistrationState::Confirmed => {
            // free sessions move no money
            if fee > 0 {
                apply_ledger_entry(
                    transaction,
                    user_id,
                    LedgerKind::FeeCapture,
                    -fee,
                    Some(session.id),
                    Some(registration_id),
                    &format!("cap:{registration_id}"),
                )
                .await?;
            }
            append_event(
                transaction,
                &session_channel(session.id),
                &serde_json::json!({
                    "type": "registration_confirmed",
                    "session_id": session.id,
                    "registration_id": registration_id,
                    "host_user_id": user_id,
                    "seats": 1,
                }),
            )
            .await?;
        }
        RegistrationState::Waitlisted => {
            if fee > 0 {
                apply_ledger_entry(
                    transaction,
                    user_id,
                    LedgerKind::Hold,
                    fee,
                    Some(session.id),
                    Some(registration_id),
                    &format!("hold:{registration_id}"),
                )
                .await?;
            }
            append_event(
                transaction,
                &session_channel(session.id),
                &serde_json::json!({
                    "type": "registration_waitlisted",
                    "session_id": session.id,
                    "registration_id": registration_id,
                    "host_user_id": user_id,
                    "seats": 1,
                    "waitlist_pos": waitlist_pos,
                }),
            )
            .await?;
        }
        RegistrationState::Canceled => unreachable!("allocator never places canceled seats"),
    }
    Ok(())
}

/// Which sessions a worker consumes.
#[derive(Debug, Clone, Copy)]
pub enum WorkerScope {
    All,
    Session(Uuid),
}

async fn discover_sessions(
    pool: &PgPool,
    scope: WorkerScope,
) -> Result<Vec<Uuid>, AppError> {
    match scope {
        WorkerScope::Session(id) => Ok(vec![id]),
        WorkerScope::All => {
            let rows = sqlx::query("SELECT id FROM sessions WHERE status = 'scheduled'")
                .fetch_all(pool)
                .await?;
            rows.into_iter()
                .map(|r| r.try_get::<Uuid, _>("id").map_err(AppError::from))
                .collect()
        }
    }
}

/// Run the allocator for one stream message, with a bounded retry on
/// serialization failures; after the budget is spent the request surfaces as
/// rejected rather than poisoning the stream.
async fn allocate_with_retry(
    pool: &PgPool,
    session_id: Uuid,
    user_id: Uuid,
    guest_names: &[String],
    max_retries: u32,
) -> Result<AllocationOutcome, AppError> {
    let mut attempt = 0;
    loop {
        match process_registration(pool, session_id, user_id, guest_names).await {
            Err(e) if is_serialization_failure(&e) && attempt < max_retries => {
                attempt += 1;
                tracing::warn!(%session_id, attempt, "serialization conflict; retrying allocation");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            other => return other,
        }
    }
}

#[tracing::instrument(skip_all, fields(%session_id, msg_id = %message.id))]
async fn handle_intent(
    pool: &PgPool,
    redis: &mut ConnectionManager,
    cfg: &Settings,
    session_id: Uuid,
    message: &queue::StreamMessage,
) -> Result<(), AppError> {
    let request_id = message
        .field("request_id")
        .ok_or(AppError::CorruptState)?
        .to_string();
    let user_id: Uuid = message
        .field("user_id")
        .ok_or(AppError::CorruptState)?
        .parse()
        .map_err(|_| AppError::CorruptState)?;
    let guest_names: Vec<String> = message
        .field("guest_names")
        .map(serde_json::from_str)
        .transpose()
        .map_err(|_| AppError::CorruptState)?
        .unwrap_or_default();

    let outcome = match allocate_with_retry(
        pool,
        session_id,
        user_id,
        &guest_names,
        cfg.queue.max_txn_retries,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            // retry budget exhausted (or a hard failure): surface as rejected
            tracing::error!(error.cause_chain = ?e, %request_id, "allocation failed");
            AllocationOutcome::rejected()
        }
    };

    if let Some(registration_id) = outcome.registration_id {
        queue::set_registration_request(
            redis,
            registration_id,
            &request_id,
            cfg.queue.request_ttl_secs,
        )
        .await?;
    }
    queue::record_outcome(
        redis,
        &request_id,
        outcome.state,
        outcome.registration_id,
        outcome.waitlist_pos,
        cfg.queue.request_ttl_secs,
    )
    .await?;
    Ok(())
}

/// Stream-consumer loop: discover scheduled sessions, read each session's
/// stream through the consumer group, allocate in order, then ack and
/// decrement the backlog. Failures before the ack leave the message pending
/// for redelivery (at-least-once).
///
/// A stream must have one active consumer at a time; extra replicas should
/// shard with `--session-id` rather than sharing `--all`.
pub async fn run_registration_worker(
    cfg: Settings,
    scope: WorkerScope,
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
            match discover_sessions(&pool, scope).await {
                Ok(ids) => {
                    for session_id in ids {
                        let stream = queue::keys::session_stream(session_id);
                        if !known.contains_key(&stream) {
                            queue::ensure_group(&mut redis, &stream, INGRESS_GROUP).await?;
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
            INGRESS_GROUP,
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
                match handle_intent(&pool, &mut redis, &cfg, session_id, &message).await {
                    Ok(()) => {
                        queue::ack(&mut redis, &stream, INGRESS_GROUP, &message.id).await?;
                        queue::decr_backlog(&mut redis, session_id).await?;
                    }
                    // a message we can never parse would poison the stream;
                    // drop it
                    Err(AppError::CorruptState) => {
                        tracing::error!(msg_id = %message.id, "dropping undecodable intent");
                        queue::ack(&mut redis, &stream, INGRESS_GROUP, &message.id).await?;
                        queue::decr_backlog(&mut redis, session_id).await?;
                    }
                    Err(e) => {
                        // no ack: the message is redelivered after a pause
                        tracing::error!(error.cause_chain = ?e, "intent handling failed; will redeliver");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        }
    }
}

/// To be run as a background worker, alongside or outside the main API.
pub async fn init_registration_worker(cfg: Settings) -> Result<(), anyhow::Error> {
    let consumer = format!("c-{}", std::process::id());
    run_registration_worker(cfg, WorkerScope::All, consumer).await
}
