//! Cancellation with the local-day refund policy, host->guest cascade and
//! waitlist collapse. Frees capacity, so every successful cancel enqueues a
//! promotion pass.

use chrono::DateTime;
use chrono::Utc;
use redis::aio::ConnectionManager;
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::cancel_window;
use crate::domain::refund_split;
use crate::domain::LedgerKind;
use crate::domain::RegistrationState;
use crate::errors::AppError;
use crate::ledger::apply_ledger_entry;
use crate::outbox::append_event;
use crate::outbox::session_channel;
use crate::promotion::enqueue_promotion;
use crate::registrations::collapse_positions_above;
use crate::registrations::lock_registration;
use crate::registrations::lock_session;
use crate::registrations::mark_canceled;
use crate::registrations::RegistrationRow;
use crate::registrations::SessionRow;
use crate::tx::begin_serializable;
use crate::tx::PgTransaction;

#[derive(Debug)]
pub struct CancelOutcome {
    /// Totals across the cascade, when one applied
    pub refund_cents: i64,
    pub penalty_cents: i64,
    pub state: &'static str,
}

/// Cancel one row: release the hold for a waitlisted seat, or apply the
/// refund/penalty policy for a confirmed one. Returns the (refund, penalty)
/// applied.
async fn cancel_one(
    transaction: &mut PgTransaction,
    session: &SessionRow,
    target: &RegistrationRow,
    now: DateTime<Utc>,
) -> Result<(i64, i64), AppError> {
    let fee = i64::from(target.seats) * session.fee_cents;
    let mut refund_cents = 0;
    let mut penalty_cents = 0;

    match target.state()? {
        RegistrationState::Canceled => return Ok((0, 0)),
        RegistrationState::Waitlisted => {
            if fee > 0 {
                apply_ledger_entry(
                    transaction,
                    target.host_user_id,
                    LedgerKind::HoldRelease,
                    -fee,
                    Some(session.id),
                    Some(target.id),
                    &format!("rel_cancel:{}", target.id),
                )
                .await?;
            }
            mark_canceled(transaction, target.id, RegistrationState::Waitlisted, now).await?;
            if let Some(old_pos) = target.waitlist_pos {
                collapse_positions_above(transaction, session.id, old_pos).await?;
            }
        }
        RegistrationState::Confirmed => {
            let window = cancel_window(now, session.starts_at, session.tz()?);
            let split = refund_split(window, fee).ok_or(AppError::TooLate)?;
            refund_cents = split.refund_cents;
            penalty_cents = split.penalty_cents;

            if split.refund_cents > 0 {
                apply_ledger_entry(
                    transaction,
                    target.host_user_id,
                    LedgerKind::Refund,
                    split.refund_cents,
                    Some(session.id),
                    Some(target.id),
                    &format!("refund_cancel:{}", target.id),
                )
                .await?;
            }
            if split.penalty_cents != 0 {
                apply_ledger_entry(
                    transaction,
                    target.host_user_id,
                    LedgerKind::Penalty,
                    split.penalty_cents,
                    Some(session.id),
                    Some(target.id),
                    &format!("penalty_cancel:{}", target.id),
                )
                .await?;
            }
            mark_canceled(transaction, target.id, RegistrationState::Confirmed, now).await?;
        }
    }

    append_event(
        transaction,
        &session_channel(session.id),
        &serde_json::json!({
            "type": "registration_canceled",
            "session_id": session.id,
            "registration_id": target.id,
            "host_user_id": target.host_user_id,
            "seats": target.seats,
            "ts": now.to_rfc3339(),
        }),
    )
    .await?;

    Ok((refund_cents, penalty_cents))
}

async fn lock_group_siblings(
    transaction: &mut PgTransaction,
    session_id: Uuid,
    group_key: Uuid,
    except: Uuid,
) -> Result<Vec<RegistrationRow>, AppError> {
    let rows = sqlx::query_as::<_, RegistrationRow>(
        r#"
        SELECT id, session_id, host_user_id, group_key, is_host, seats,
               guest_names, state, waitlist_pos, created_at
        FROM registrations
        WHERE session_id = $1 AND group_key = $2 AND id <> $3 AND state <> 'canceled'
        ORDER BY created_at ASC
        FOR UPDATE
        "#,
    )
    .bind(session_id)
    .bind(group_key)
    .bind(except)
    .fetch_all(&mut **transaction)
    .await?;
    Ok(rows)
}

/// Cancel a registration on behalf of its host (or an admin).
///
/// - already-canceled rows are a stable no-op;
/// - at or after `starts_at` the cancel is refused (`TooLate`);
/// - canceling the host seat of a split group cascades to every sibling row
///   under the same policy and per-row idempotency keys;
/// - returns refund/penalty totals across the cascade.
#[tracing::instrument(skip(pool, redis), fields(%registration_id))]
pub async fn cancel_registration(
    pool: &PgPool,
    redis: &mut ConnectionManager,
    registration_id: Uuid,
    caller_user_id: Uuid,
    caller_is_admin: bool,
    now: DateTime<Utc>,
) -> Result<CancelOutcome, AppError> {
    let mut transaction = begin_serializable(pool).await?;

    let reg = lock_registration(&mut transaction, registration_id)
        .await?
        .ok_or(AppError::NotFound("registration"))?;
    let session = lock_session(&mut transaction, reg.session_id)
        .await?
        .ok_or(AppError::NotFound("session"))?;

    if !caller_is_admin && reg.host_user_id != caller_user_id {
        return Err(AppError::Forbidden);
    }
    if reg.state()? == RegistrationState::Canceled {
        transaction.rollback().await?;
        return Ok(CancelOutcome {
            refund_cents: 0,
            penalty_cents: 0,
            state: "canceled",
        });
    }
    if now >= session.starts_at {
        return Err(AppError::TooLate);
    }

    let cascade_key = reg.is_host_seat_in_group().then_some(reg.group_key).flatten();
    let (mut refund_total, mut penalty_total) =
        cancel_one(&mut transaction, &session, &reg, now).await?;

    if let Some(group_key) = cascade_key {
        let siblings =
            lock_group_siblings(&mut transaction, reg.session_id, group_key, reg.id).await?;
        for sibling in &siblings {
            let (r, p) = cancel_one(&mut transaction, &session, sibling, now).await?;
            refund_total += r;
            penalty_total += p;
        }
    }

    transaction.commit().await?;

    // capacity may have freed
    enqueue_promotion(redis, session.id).await?;

    Ok(CancelOutcome {
        refund_cents: refund_total,
        penalty_cents: penalty_total,
        state: "canceled",
    })
}
