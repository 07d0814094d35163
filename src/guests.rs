//! Guest-list edits on an existing registration: replace/shrink the guest
//! list, or add a single guest seat to the host's group.

use chrono::DateTime;
use chrono::Utc;
use redis::aio::ConnectionManager;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::domain::cancel_window;
use crate::domain::normalize_guests;
use crate::domain::refund_split;
use crate::domain::GuestName;
use crate::domain::LedgerKind;
use crate::domain::RegistrationState;
use crate::domain::SessionStatus;
use crate::domain::MAX_GUESTS;
use crate::errors::AppError;
use crate::ledger::apply_ledger_entry;
use crate::ledger::ensure_and_lock_wallet;
use crate::outbox::append_event;
use crate::outbox::session_channel;
use crate::promotion::enqueue_promotion;
use crate::registrations::confirmed_seats;
use crate::registrations::insert_registration;
use crate::registrations::lock_registration;
use crate::registrations::lock_session;
use crate::registrations::next_waitlist_pos;
use crate::registrations::waitlist_exists;
use crate::registrations::NewSeatRow;
use crate::tx::begin_serializable;

#[derive(Debug)]
pub struct GuestUpdateOutcome {
    pub old_seats: i32,
    pub new_seats: i32,
    pub refund_cents: i64,
    pub penalty_cents: i64,
    pub state: String,
}

/// Replace a registration's guest list. Names-only edits are free; dropping
/// guests shrinks the row's seats and releases/refunds the difference per
/// the cancellation policy. Seats can never grow through this path.
#[tracing::instrument(skip(pool, redis), fields(%registration_id))]
pub async fn update_guest_list(
    pool: &PgPool,
    redis: &mut ConnectionManager,
    registration_id: Uuid,
    caller_user_id: Uuid,
    caller_is_admin: bool,
    new_guest_names: &[String],
    now: DateTime<Utc>,
) -> Result<GuestUpdateOutcome, AppError> {
    let new_guest_names = normalize_guests(new_guest_names);
    let target_seats = 1 + new_guest_names.len() as i32;

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
    if now >= session.starts_at {
        return Err(AppError::TooLate);
    }
    let state = reg.state()?;
    if state == RegistrationState::Canceled {
        return Err(AppError::Conflict(
            "cannot modify a canceled registration".into(),
        ));
    }
    if target_seats > reg.seats {
        return Err(AppError::Conflict(
            "cannot increase seats in a guest edit; submit a new registration".into(),
        ));
    }

    // names-only edit
    if target_seats == reg.seats {
        sqlx::query("UPDATE registrations SET guest_names = $2 WHERE id = $1")
            .bind(reg.id)
            .bind(&new_guest_names)
            .execute(&mut *transaction)
            .await?;
        transaction.commit().await?;
        return Ok(GuestUpdateOutcome {
            old_seats: reg.seats,
            new_seats: target_seats,
            refund_cents: 0,
            penalty_cents: 0,
            state: reg.state.clone(),
        });
    }

    // seat shrink: money moves for the removed seats only
    let removed = i64::from(reg.seats - target_seats);
    let delta_fee = removed * session.fee_cents;
    let mut refund_cents = 0;
    let mut penalty_cents = 0;

    match state {
        RegistrationState::Waitlisted => {
            if delta_fee > 0 {
                apply_ledger_entry(
                    &mut transaction,
                    reg.host_user_id,
                    LedgerKind::HoldRelease,
                    -delta_fee,
                    Some(session.id),
                    Some(reg.id),
                    &format!("gu_release:{}:{}", reg.id, target_seats),
                )
                .await?;
            }
        }
        RegistrationState::Confirmed => {
            let window = cancel_window(now, session.starts_at, session.tz()?);
            let split = refund_split(window, delta_fee).ok_or(AppError::TooLate)?;
            refund_cents = split.refund_cents;
            penalty_cents = split.penalty_cents;
            if split.refund_cents > 0 {
                apply_ledger_entry(
                    &mut transaction,
                    reg.host_user_id,
                    LedgerKind::Refund,
                    split.refund_cents,
                    Some(session.id),
                    Some(reg.id),
                    &format!("gu_refund:{}:{}", reg.id, target_seats),
                )
                .await?;
            }
            if split.penalty_cents != 0 {
                apply_ledger_entry(
                    &mut transaction,
                    reg.host_user_id,
                    LedgerKind::Penalty,
                    split.penalty_cents,
                    Some(session.id),
                    Some(reg.id),
                    &format!("gu_penalty:{}:{}", reg.id, target_seats),
                )
                .await?;
            }
        }
        RegistrationState::Canceled => unreachable!("checked above"),
    }

    sqlx::query("UPDATE registrations SET seats = $2, guest_names = $3 WHERE id = $1")
        .bind(reg.id)
        .bind(target_seats)
        .bind(&new_guest_names)
        .execute(&mut *transaction)
        .await?;
    transaction.commit().await?;

    // a confirmed shrink frees seats
    if state == RegistrationState::Confirmed {
        enqueue_promotion(redis, session.id).await?;
    }

    Ok(GuestUpdateOutcome {
        old_seats: reg.seats,
        new_seats: target_seats,
        refund_cents,
        penalty_cents,
        state: reg.state.clone(),
    })
}

#[derive(Debug)]
pub struct GuestAddOutcome {
    pub registration_id: Uuid,
    pub state: String,
    pub waitlist_pos: Option<i32>,
}

async fn active_guest_count(
    transaction: &mut crate::tx::PgTransaction,
    session_id: Uuid,
    group_key: Uuid,
    host_reg_id: Uuid,
) -> Result<i64, AppError> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS guests FROM registrations \
         WHERE session_id = $1 AND group_key = $2 AND id <> $3 \
           AND NOT is_host AND state <> 'canceled'",
    )
    .bind(session_id)
    .bind(group_key)
    .bind(host_reg_id)
    .fetch_one(&mut **transaction)
    .await?;
    Ok(row.try_get::<i64, _>("guests")?)
}

/// Add one guest seat to a host's registration, linked by the host's group
/// key (assigning one if absent).
///
/// Fairness: if the session currently has any waitlist, the guest always
/// queues at the tail; otherwise they are confirmed when capacity allows.
#[tracing::instrument(skip(pool, redis, guest_name), fields(%host_registration_id))]
pub async fn add_guest(
    pool: &PgPool,
    redis: &mut ConnectionManager,
    host_registration_id: Uuid,
    guest_name: String,
    caller_user_id: Uuid,
    caller_is_admin: bool,
    now: DateTime<Utc>,
) -> Result<GuestAddOutcome, AppError> {
    let guest_name = GuestName::parse(guest_name).map_err(AppError::Validation)?;

    let mut transaction = begin_serializable(pool).await?;

    let host_reg = lock_registration(&mut transaction, host_registration_id)
        .await?
        .ok_or(AppError::NotFound("registration"))?;
    let session = lock_session(&mut transaction, host_reg.session_id)
        .await?
        .ok_or(AppError::NotFound("session"))?;

    if !caller_is_admin && host_reg.host_user_id != caller_user_id {
        return Err(AppError::Forbidden);
    }
    if session.status()? != SessionStatus::Scheduled {
        return Err(AppError::Conflict("session not accepting signups".into()));
    }
    if now >= session.starts_at {
        return Err(AppError::TooLate);
    }

    // the group key ties the guest row to the host's party
    let group_key = match host_reg.group_key {
        Some(key) => key,
        None => {
            let key = Uuid::new_v4();
            sqlx::query("UPDATE registrations SET group_key = $2 WHERE id = $1")
                .bind(host_reg.id)
                .bind(key)
                .execute(&mut *transaction)
                .await?;
            key
        }
    };

    let guests = active_guest_count(&mut transaction, session.id, group_key, host_reg.id).await?;
    if guests >= MAX_GUESTS as i64 {
        return Err(AppError::Conflict("maximum 2 guests per host".into()));
    }

    let fee = session.fee_cents;
    let wallet = ensure_and_lock_wallet(&mut transaction, host_reg.host_user_id).await?;
    if wallet.available_cents() < fee {
        return Err(AppError::Conflict("insufficient funds".into()));
    }

    let queue_behind = waitlist_exists(&mut transaction, session.id).await?;
    let taken = confirmed_seats(&mut transaction, session.id).await?;
    let remaining = i64::from(session.capacity).saturating_sub(taken).max(0);

    let guest_names = vec![guest_name.as_ref().to_string()];
    if queue_behind || remaining <= 0 {
        let pos = next_waitlist_pos(&mut transaction, session.id).await?;
        let guest_id = insert_registration(
            &mut transaction,
            NewSeatRow {
                session_id: session.id,
                host_user_id: host_reg.host_user_id,
                group_key: Some(group_key),
                is_host: false,
                seats: 1,
                guest_names: &guest_names,
                state: RegistrationState::Waitlisted,
                waitlist_pos: Some(pos),
            },
        )
        .await?;
        if fee > 0 {
            apply_ledger_entry(
                &mut transaction,
                host_reg.host_user_id,
                LedgerKind::Hold,
                fee,
                Some(session.id),
                Some(guest_id),
                &format!("hold:addguest:{guest_id}"),
            )
            .await?;
        }
        append_event(
            &mut transaction,
            &session_channel(session.id),
            &serde_json::json!({
                "type": "registration_waitlisted",
                "session_id": session.id,
                "registration_id": guest_id,
                "host_user_id": host_reg.host_user_id,
                "seats": 1,
                "waitlist_pos": pos,
            }),
        )
        .await?;
        transaction.commit().await?;
        return Ok(GuestAddOutcome {
            registration_id: guest_id,
            state: "waitlisted".into(),
            waitlist_pos: Some(pos),
        });
    }

    let guest_id = insert_registration(
        &mut transaction,
        NewSeatRow {
            session_id: session.id,
            host_user_id: host_reg.host_user_id,
            group_key: Some(group_key),
            is_host: false,
            seats: 1,
            guest_names: &guest_names,
            state: RegistrationState::Confirmed,
            waitlist_pos: None,
        },
    )
    .await?;
    if fee > 0 {
        apply_ledger_entry(
            &mut transaction,
            host_reg.host_user_id,
            LedgerKind::FeeCapture,
            -fee,
            Some(session.id),
            Some(guest_id),
            &format!("cap:addguest:{guest_id}"),
        )
        .await?;
    }
    append_event(
        &mut transaction,
        &session_channel(session.id),
        &serde_json::json!({
            "type": "registration_confirmed",
            "session_id": session.id,
            "registration_id": guest_id,
            "host_user_id": host_reg.host_user_id,
            "seats": 1,
        }),
    )
    .await?;
    transaction.commit().await?;

    Ok(GuestAddOutcome {
        registration_id: guest_id,
        state: "confirmed".into(),
        waitlist_pos: None,
    })
}
