use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use super::keys;
use super::status;
use crate::configuration::QueueSettings;
use crate::domain::SessionStatus;
use crate::domain::SubmissionKey;
use crate::domain::MAX_GUESTS;
use crate::errors::AppError;

#[derive(Debug)]
pub struct EnqueueOutcome {
    pub request_id: String,
    /// The submission key mapped to an existing pending request; nothing new
    /// was enqueued.
    pub reused: bool,
}

/// Admit a registration intent into the per-session stream.
///
/// Order matters: the backlog cap is checked before anything is written, the
/// idempotency claim decides whether this submission owns the request, and
/// only the owner appends to the stream and bumps the backlog, so one key can
/// never enqueue twice.
#[tracing::instrument(skip_all, fields(%session_id, %user_id))]
pub async fn enqueue_registration(
    pool: &PgPool,
    redis: &mut ConnectionManager,
    cfg: &QueueSettings,
    session_id: Uuid,
    user_id: Uuid,
    seats: i32,
    guest_names: &[String],
    submission_key: &SubmissionKey,
) -> Result<EnqueueOutcome, AppError> {
    // (a) fast-reject when the queue is saturated
    if super::backlog(redis, session_id).await? >= cfg.backlog_cap {
        return Err(AppError::Backpressure);
    }

    // input sanity; the allocator derives the authoritative seat count from
    // the guest list, this only rejects malformed submissions early
    if !(1..=1 + MAX_GUESTS as i32).contains(&seats) {
        return Err(AppError::Validation("seats must be between 1 and 3".into()));
    }
    if guest_names.len() > MAX_GUESTS {
        return Err(AppError::Validation("at most 2 guest names".into()));
    }
    if seats != 1 + guest_names.len() as i32 {
        return Err(AppError::Validation(
            "seats must equal 1 + number of guest names".into(),
        ));
    }

    // (b) the session must exist and accept signups
    let row = sqlx::query("SELECT status FROM sessions WHERE id = $1")
        .bind(session_id)
        .fetch_optional(pool)
        .await?;
    let status: String = match row {
        None => return Err(AppError::NotFound("session")),
        Some(row) => row.try_get("status")?,
    };
    if SessionStatus::parse(&status).map_err(|e| AppError::Unexpected(anyhow::anyhow!(e)))?
        != SessionStatus::Scheduled
    {
        return Err(AppError::Conflict(format!(
            "session not open for registration: {status}"
        )));
    }

    // (c) one active host registration per (session, user)
    let dup = sqlx::query(
        "SELECT EXISTS (SELECT 1 FROM registrations \
         WHERE session_id = $1 AND host_user_id = $2 AND is_host AND state <> 'canceled') AS present",
    )
    .bind(session_id)
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    if dup.try_get::<bool, _>("present")? {
        return Err(AppError::Conflict("already registered or waitlisted".into()));
    }

    // (d) claim the idempotency slot; the winner allocates the request id
    let idemp_key = keys::idempotency(session_id, user_id, submission_key.as_ref());
    let candidate = Uuid::new_v4().to_string();
    let claimed: Option<String> = redis::cmd("SET")
        .arg(&idemp_key)
        .arg(&candidate)
        .arg("NX")
        .arg("EX")
        .arg(cfg.idempotency_ttl_secs)
        .query_async(redis)
        .await?;

    if claimed.is_none() {
        // someone (possibly an earlier retry of this very client) owns the
        // key; map to their request
        let existing: Option<String> = redis.get(&idemp_key).await?;
        return match existing {
            Some(request_id) => Ok(EnqueueOutcome {
                request_id,
                reused: true,
            }),
            // claim lost AND key expired in between; ask the client to retry
            None => Err(AppError::Transient(anyhow::anyhow!(
                "idempotency key expired mid-claim"
            ))),
        };
    }

    // (e) make the status record visible before the intent can be processed
    status::store_queued(
        redis,
        &candidate,
        session_id,
        user_id,
        seats,
        guest_names,
        cfg.request_ttl_secs,
    )
    .await?;

    // (f) append to the ordered per-session stream
    let guests = serde_json::to_string(guest_names)
        .map_err(|e| AppError::Unexpected(e.into()))?;
    let user = user_id.to_string();
    let seats_field = seats.to_string();
    let ts = chrono::Utc::now().to_rfc3339();
    redis
        .xadd::<_, _, _, _, String>(
            keys::session_stream(session_id),
            "*",
            &[
                ("request_id", candidate.as_str()),
                ("user_id", user.as_str()),
                ("seats", seats_field.as_str()),
                ("guest_names", guests.as_str()),
                ("idempotency_key", submission_key.as_ref()),
                ("ts", ts.as_str()),
            ],
        )
        .await?;

    // (g) count it against the backlog cap
    super::incr_backlog(redis, session_id).await?;

    Ok(EnqueueOutcome {
        request_id: candidate,
        reused: false,
    })
}
