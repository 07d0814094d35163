//! Session lifecycle: creation (with optional admin pre-registrations),
//! capacity/status changes and their side effects. Transitions follow
//! scheduled <-> closed, scheduled/closed -> canceled; canceled is terminal.

use chrono::DateTime;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::Serialize;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::domain::normalize_guests;
use crate::domain::LedgerKind;
use crate::domain::RegistrationState;
use crate::domain::SessionStatus;
use crate::errors::AppError;
use crate::ledger::apply_ledger_entry;
use crate::ledger::ensure_and_lock_wallet;
use crate::outbox::append_event;
use crate::outbox::session_channel;
use crate::promotion::enqueue_promotion;
use crate::registrations::confirmed_seats;
use crate::registrations::insert_registration;
use crate::registrations::lock_session;
use crate::registrations::mark_canceled;
use crate::registrations::next_waitlist_pos;
use crate::registrations::NewSeatRow;
use crate::registrations::RegistrationRow;
use crate::registrations::SessionRow;
use crate::tx::begin_serializable;
use crate::tx::PgTransaction;

pub struct NewSession {
    pub title: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub timezone: String,
    pub capacity: i32,
    pub fee_cents: i64,
}

pub struct PreregItem {
    pub user_id: Uuid,
    pub seats: i32,
    pub guest_names: Vec<String>,
    pub idempotency_key: String,
}

#[derive(Debug, Serialize)]
pub struct PreregResult {
    pub user_id: Uuid,
    pub registration_id: Option<Uuid>,
    pub state: String,
    pub waitlist_pos: Option<i32>,
    pub error: Option<String>,
}

impl PreregResult {
    fn rejected(
        user_id: Uuid,
        error: &str,
    ) -> Self {
        Self {
            user_id,
            registration_id: None,
            state: "rejected".into(),
            waitlist_pos: None,
            error: Some(error.into()),
        }
    }
}

/// Create a session and apply its pre-registrations in submission order, all
/// in one SERIALIZABLE transaction. Pre-registered parties stay whole (one
/// row per party): they either fit entirely or join the waitlist tail.
/// Individual item failures reject the item, never the session.
#[tracing::instrument(skip_all, fields(capacity = new.capacity))]
pub async fn create_session(
    pool: &PgPool,
    new: NewSession,
    preregistrations: Vec<PreregItem>,
) -> Result<(SessionRow, Vec<PreregResult>), AppError> {
    if new.timezone.parse::<chrono_tz::Tz>().is_err() {
        return Err(AppError::Validation(format!(
            "invalid IANA timezone: {:?}",
            new.timezone
        )));
    }
    if new.capacity < 0 {
        return Err(AppError::Validation("capacity must be >= 0".into()));
    }
    if new.fee_cents < 0 {
        return Err(AppError::Validation("fee_cents must be >= 0".into()));
    }

    let mut transaction = begin_serializable(pool).await?;

    let session_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO sessions (id, title, starts_at, timezone, capacity, fee_cents, status)
        VALUES ($1, $2, $3, $4, $5, $6, 'scheduled')
        "#,
    )
    .bind(session_id)
    .bind(&new.title)
    .bind(new.starts_at)
    .bind(&new.timezone)
    .bind(new.capacity)
    .bind(new.fee_cents)
    .execute(&mut *transaction)
    .await?;

    let session = lock_session(&mut transaction, session_id)
        .await?
        .ok_or_else(|| AppError::Unexpected(anyhow::anyhow!("freshly inserted session missing")))?;

    let mut results = Vec::with_capacity(preregistrations.len());
    for item in preregistrations {
        results.push(preregister_one(&mut transaction, &session, item).await?);
    }

    transaction.commit().await?;
    Ok((session, results))
}

async fn preregister_one(
    transaction: &mut PgTransaction,
    session: &SessionRow,
    item: PreregItem,
) -> Result<PreregResult, AppError> {
    // the user must exist, be active and not soft-deleted
    let user = sqlx::query(
        "SELECT status, deleted_at IS NOT NULL AS deleted FROM users WHERE id = $1",
    )
    .bind(item.user_id)
    .fetch_optional(&mut **transaction)
    .await?;
    let usable = match user {
        None => false,
        Some(row) => {
            row.try_get::<String, _>("status")? == "active" && !row.try_get::<bool, _>("deleted")?
        }
    };
    if !usable {
        return Ok(PreregResult::rejected(
            item.user_id,
            "user_disabled_or_missing",
        ));
    }

    // one active host row per (session, user)
    let dup = crate::registrations::active_host_exists(transaction, session.id, item.user_id)
        .await?;
    if dup {
        return Ok(PreregResult::rejected(
            item.user_id,
            "already_registered_or_waitlisted",
        ));
    }

    let guest_names = normalize_guests(&item.guest_names);
    let seats = 1 + guest_names.len() as i32;
    let total_fee = session.fee_cents * i64::from(seats);

    let wallet = ensure_and_lock_wallet(transaction, item.user_id).await?;
    if wallet.available_cents() < total_fee {
        return Ok(PreregResult::rejected(item.user_id, "insufficient_funds"));
    }

    let taken = confirmed_seats(transaction, session.id).await?;
    let remaining = i64::from(session.capacity).saturating_sub(taken).max(0);
    let will_confirm = i64::from(seats) <= remaining;

    let waitlist_pos = match will_confirm {
        true => None,
        false => Some(next_waitlist_pos(transaction, session.id).await?),
    };
    let state = match will_confirm {
        true => RegistrationState::Confirmed,
        false => RegistrationState::Waitlisted,
    };
    let registration_id = insert_registration(
        transaction,
        NewSeatRow {
            session_id: session.id,
            host_user_id: item.user_id,
            group_key: None,
            is_host: true,
            seats,
            guest_names: &guest_names,
            state,
            waitlist_pos,
        },
    )
    .await?;

    if total_fee > 0 {
        match will_confirm {
            true => {
                apply_ledger_entry(
                    transaction,
                    item.user_id,
                    LedgerKind::FeeCapture,
                    -total_fee,
                    Some(session.id),
                    Some(registration_id),
                    &item.idempotency_key,
                )
                .await?;
            }
            false => {
                apply_ledger_entry(
                    transaction,
                    item.user_id,
                    LedgerKind::Hold,
                    total_fee,
                    Some(session.id),
                    Some(registration_id),
                    &item.idempotency_key,
                )
                .await?;
            }
        }
    }

    append_event(
        transaction,
        &session_channel(session.id),
        &serde_json::json!({
            "type": match state {
                RegistrationState::Confirmed => "registration_confirmed",
                _ => "registration_waitlisted",
            },
            "session_id": session.id,
            "registration_id": registration_id,
            "host_user_id": item.user_id,
            "seats": seats,
            "waitlist_pos": waitlist_pos,
        }),
    )
    .await?;

    Ok(PreregResult {
        user_id: item.user_id,
        registration_id: Some(registration_id),
        state: state.as_str().into(),
        waitlist_pos,
        error: None,
    })
}

async fn active_registrations(
    transaction: &mut PgTransaction,
    session_id: Uuid,
    state_filter: Option<RegistrationState>,
) -> Result<Vec<RegistrationRow>, AppError> {
    let rows = sqlx::query_as::<_, RegistrationRow>(
        r#"
        SELECT id, session_id, host_user_id, group_key, is_host, seats,
               guest_names, state, waitlist_pos, created_at
        FROM registrations
        WHERE session_id = $1
          AND state <> 'canceled'
          AND ($2::text IS NULL OR state = $2)
        ORDER BY created_at ASC
        FOR UPDATE
        "#,
    )
    .bind(session_id)
    .bind(state_filter.map(|s| s.as_str()))
    .fetch_all(&mut **transaction)
    .await?;
    Ok(rows)
}

/// Apply admin capacity/status updates with their side effects:
///
/// - capacity cannot drop below currently confirmed seats;
/// - `-> canceled`: full refund on confirmed rows, hold release on
///   waitlisted ones, everything marked canceled;
/// - `-> closed`: waitlisted holds released and those rows canceled;
///   confirmed rows keep their captures;
/// - capacity increase while scheduled: a promotion pass is enqueued after
///   commit.
#[tracing::instrument(skip(pool, redis), fields(%session_id))]
pub async fn admin_update_session(
    pool: &PgPool,
    redis: &mut ConnectionManager,
    session_id: Uuid,
    new_capacity: Option<i32>,
    new_status: Option<&str>,
    now: DateTime<Utc>,
) -> Result<SessionRow, AppError> {
    let new_status = new_status
        .map(SessionStatus::parse)
        .transpose()
        .map_err(AppError::Validation)?;

    let mut transaction = begin_serializable(pool).await?;

    let session = lock_session(&mut transaction, session_id)
        .await?
        .ok_or(AppError::NotFound("session"))?;
    let old_status = session.status()?;

    let confirmed = confirmed_seats(&mut transaction, session_id).await?;
    if let Some(capacity) = new_capacity {
        if capacity < 0 {
            return Err(AppError::Validation("capacity must be >= 0".into()));
        }
        if i64::from(capacity) < confirmed {
            return Err(AppError::Conflict(
                "capacity cannot be set below currently confirmed seats".into(),
            ));
        }
    }
    if let Some(status) = new_status {
        if status != old_status && !old_status.can_transition_to(status) {
            return Err(AppError::Conflict(format!(
                "{} -> {} not allowed",
                old_status.as_str(),
                status.as_str()
            )));
        }
    }

    sqlx::query(
        "UPDATE sessions SET capacity = COALESCE($2, capacity), status = COALESCE($3, status) \
         WHERE id = $1",
    )
    .bind(session_id)
    .bind(new_capacity)
    .bind(new_status.map(|s| s.as_str()))
    .execute(&mut *transaction)
    .await?;

    let status_changed = new_status.filter(|s| *s != old_status);
    if let Some(status) = status_changed {
        append_event(
            &mut transaction,
            &session_channel(session_id),
            &serde_json::json!({
                "type": "session_status_changed",
                "session_id": session_id,
                "old_status": old_status.as_str(),
                "new_status": status.as_str(),
            }),
        )
        .await?;
    }

    match status_changed {
        // cancel: refund confirmed seats in full, release waitlisted holds,
        // mark every row canceled
        Some(SessionStatus::Canceled) => {
            let regs = active_registrations(&mut transaction, session_id, None).await?;
            for reg in &regs {
                let total_fee = i64::from(reg.seats) * session.fee_cents;
                match reg.state()? {
                    RegistrationState::Confirmed => {
                        if total_fee > 0 {
                            apply_ledger_entry(
                                &mut transaction,
                                reg.host_user_id,
                                LedgerKind::Refund,
                                total_fee,
                                Some(session_id),
                                Some(reg.id),
                                &format!("refund_sess_cancel:{}", reg.id),
                            )
                            .await?;
                        }
                        mark_canceled(&mut transaction, reg.id, RegistrationState::Confirmed, now)
                            .await?;
                    }
                    RegistrationState::Waitlisted => {
                        if total_fee > 0 {
                            apply_ledger_entry(
                                &mut transaction,
                                reg.host_user_id,
                                LedgerKind::HoldRelease,
                                -total_fee,
                                Some(session_id),
                                Some(reg.id),
                                &format!("release_sess_cancel:{}", reg.id),
                            )
                            .await?;
                        }
                        mark_canceled(&mut transaction, reg.id, RegistrationState::Waitlisted, now)
                            .await?;
                    }
                    RegistrationState::Canceled => {}
                }
            }
            append_event(
                &mut transaction,
                &session_channel(session_id),
                &serde_json::json!({
                    "type": "session_canceled",
                    "session_id": session_id,
                }),
            )
            .await?;
        }
        // close: release waitlisted holds; confirmed rows were captured and
        // remain
        Some(SessionStatus::Closed) => {
            let waitlisted = active_registrations(
                &mut transaction,
                session_id,
                Some(RegistrationState::Waitlisted),
            )
            .await?;
            for reg in &waitlisted {
                let total_fee = i64::from(reg.seats) * session.fee_cents;
                if total_fee > 0 {
                    apply_ledger_entry(
                        &mut transaction,
                        reg.host_user_id,
                        LedgerKind::HoldRelease,
                        -total_fee,
                        Some(session_id),
                        Some(reg.id),
                        &format!("release_close:{}", reg.id),
                    )
                    .await?;
                }
                mark_canceled(&mut transaction, reg.id, RegistrationState::Waitlisted, now)
                    .await?;
            }
        }
        _ => {}
    }

    let capacity_grew = new_capacity
        .map(|c| i64::from(c) > i64::from(session.capacity))
        .unwrap_or(false);
    if new_capacity.is_some() && new_capacity != Some(session.capacity) {
        append_event(
            &mut transaction,
            &session_channel(session_id),
            &serde_json::json!({
                "type": "session_capacity_changed",
                "session_id": session_id,
                "capacity": new_capacity,
            }),
        )
        .await?;
    }

    let updated = lock_session(&mut transaction, session_id)
        .await?
        .ok_or(AppError::NotFound("session"))?;
    transaction.commit().await?;

    // freed-up capacity is only usable while the session still takes signups
    if capacity_grew && updated.status()? == SessionStatus::Scheduled {
        enqueue_promotion(redis, session_id).await?;
    }

    Ok(updated)
}

/// Session view with seat counts, for the public listing endpoints.
#[derive(Debug, sqlx::FromRow)]
pub struct SessionWithStats {
    pub id: Uuid,
    pub title: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub timezone: String,
    pub capacity: i32,
    pub fee_cents: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub confirmed_seats: i64,
}

impl SessionWithStats {
    pub fn remaining_seats(&self) -> i64 {
        i64::from(self.capacity).saturating_sub(self.confirmed_seats).max(0)
    }
}

const STATS_QUERY: &str = r#"
    SELECT s.id, s.title, s.starts_at, s.timezone, s.capacity, s.fee_cents,
           s.status, s.created_at,
           COALESCE(SUM(r.seats) FILTER (WHERE r.state = 'confirmed'), 0) AS confirmed_seats
    FROM sessions s
    LEFT JOIN registrations r ON r.session_id = s.id
"#;

pub async fn list_upcoming(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<SessionWithStats>, AppError> {
    let rows = sqlx::query_as::<_, SessionWithStats>(&format!(
        "{STATS_QUERY} WHERE s.starts_at >= $1 AND s.status <> 'canceled' \
         GROUP BY s.id ORDER BY s.starts_at ASC LIMIT $2"
    ))
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_with_stats(
    pool: &PgPool,
    session_id: Uuid,
) -> Result<Option<SessionWithStats>, AppError> {
    let row = sqlx::query_as::<_, SessionWithStats>(&format!(
        "{STATS_QUERY} WHERE s.id = $1 GROUP BY s.id"
    ))
    .bind(session_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}
