//! Row types and persistence helpers shared by the allocator, promotion,
//! cancellation, guest-edit and lifecycle services. All helpers expect to run
//! inside the caller's (serializable) transaction.

use chrono::DateTime;
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use crate::domain::RegistrationState;
use crate::domain::SessionStatus;
use crate::errors::AppError;
use crate::tx::PgTransaction;

#[derive(Debug, sqlx::FromRow)]
pub struct SessionRow {
    pub id: Uuid,
    pub title: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub timezone: String,
    pub capacity: i32,
    pub fee_cents: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl SessionRow {
    pub fn status(&self) -> Result<SessionStatus, AppError> {
        SessionStatus::parse(&self.status)
            .map_err(|e| AppError::Unexpected(anyhow::anyhow!(e)))
    }

    pub fn tz(&self) -> Result<chrono_tz::Tz, AppError> {
        self.timezone
            .parse()
            .map_err(|_| AppError::Unexpected(anyhow::anyhow!(
                "session {} carries invalid timezone {:?}",
                self.id,
                self.timezone
            )))
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct RegistrationRow {
    pub id: Uuid,
    pub session_id: Uuid,
    pub host_user_id: Uuid,
    pub group_key: Option<Uuid>,
    pub is_host: bool,
    pub seats: i32,
    pub guest_names: Vec<String>,
    pub state: String,
    pub waitlist_pos: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl RegistrationRow {
    pub fn state(&self) -> Result<RegistrationState, AppError> {
        RegistrationState::parse(&self.state)
            .map_err(|e| AppError::Unexpected(anyhow::anyhow!(e)))
    }

    /// The host seat of a split party: cancelling it cascades to the group.
    pub fn is_host_seat_in_group(&self) -> bool {
        self.group_key.is_some() && self.seats == 1 && self.guest_names.is_empty()
    }
}

const SESSION_COLUMNS: &str =
    "id, title, starts_at, timezone, capacity, fee_cents, status, created_at";
const REGISTRATION_COLUMNS: &str = "id, session_id, host_user_id, group_key, is_host, seats, \
                                    guest_names, state, waitlist_pos, created_at";

/// Lock the session row for the remainder of the transaction. This is what
/// serializes promotion/cancellation/lifecycle work per session.
pub async fn lock_session(
    transaction: &mut PgTransaction,
    session_id: Uuid,
) -> Result<Option<SessionRow>, AppError> {
    let row = sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1 FOR UPDATE"
    ))
    .bind(session_id)
    .fetch_optional(&mut **transaction)
    .await?;
    Ok(row)
}

pub async fn lock_registration(
    transaction: &mut PgTransaction,
    registration_id: Uuid,
) -> Result<Option<RegistrationRow>, AppError> {
    let row = sqlx::query_as::<_, RegistrationRow>(&format!(
        "SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE id = $1 FOR UPDATE"
    ))
    .bind(registration_id)
    .fetch_optional(&mut **transaction)
    .await?;
    Ok(row)
}

/// Sum of confirmed seats; `capacity - confirmed_seats` is the remaining
/// room.
pub async fn confirmed_seats(
    transaction: &mut PgTransaction,
    session_id: Uuid,
) -> Result<i64, AppError> {
    let row = sqlx::query(
        "SELECT COALESCE(SUM(seats), 0) AS taken FROM registrations \
         WHERE session_id = $1 AND state = 'confirmed'",
    )
    .bind(session_id)
    .fetch_one(&mut **transaction)
    .await?;
    Ok(row.try_get::<i64, _>("taken")?)
}

pub async fn waitlist_exists(
    transaction: &mut PgTransaction,
    session_id: Uuid,
) -> Result<bool, AppError> {
    let row = sqlx::query(
        "SELECT EXISTS (SELECT 1 FROM registrations WHERE session_id = $1 AND state = 'waitlisted') AS present",
    )
    .bind(session_id)
    .fetch_one(&mut **transaction)
    .await?;
    Ok(row.try_get::<bool, _>("present")?)
}

/// Next tail position (`max + 1`); positions are 1-based.
pub async fn next_waitlist_pos(
    transaction: &mut PgTransaction,
    session_id: Uuid,
) -> Result<i32, AppError> {
    let row = sqlx::query(
        "SELECT COALESCE(MAX(waitlist_pos), 0) AS max_pos FROM registrations \
         WHERE session_id = $1 AND state = 'waitlisted'",
    )
    .bind(session_id)
    .fetch_one(&mut **transaction)
    .await?;
    Ok(row.try_get::<i32, _>("max_pos")? + 1)
}

/// Shift waitlist positions above a vacated slot down by one so they stay a
/// contiguous `{1..N}`.
pub async fn collapse_positions_above(
    transaction: &mut PgTransaction,
    session_id: Uuid,
    vacated_pos: i32,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE registrations SET waitlist_pos = waitlist_pos - 1 \
         WHERE session_id = $1 AND state = 'waitlisted' AND waitlist_pos > $2",
    )
    .bind(session_id)
    .bind(vacated_pos)
    .execute(&mut **transaction)
    .await?;
    Ok(())
}

/// Does this user already hold an active (non-canceled) host row for the
/// session?
pub async fn active_host_exists(
    transaction: &mut PgTransaction,
    session_id: Uuid,
    user_id: Uuid,
) -> Result<bool, AppError> {
    let row = sqlx::query(
        "SELECT EXISTS (SELECT 1 FROM registrations \
         WHERE session_id = $1 AND host_user_id = $2 AND is_host AND state <> 'canceled') AS present",
    )
    .bind(session_id)
    .bind(user_id)
    .fetch_one(&mut **transaction)
    .await?;
    Ok(row.try_get::<bool, _>("present")?)
}

pub struct NewSeatRow<'a> {
    pub session_id: Uuid,
    pub host_user_id: Uuid,
    pub group_key: Option<Uuid>,
    pub is_host: bool,
    pub seats: i32,
    pub guest_names: &'a [String],
    pub state: RegistrationState,
    pub waitlist_pos: Option<i32>,
}

pub async fn insert_registration(
    transaction: &mut PgTransaction,
    row: NewSeatRow<'_>,
) -> Result<Uuid, AppError> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO registrations
            (id, session_id, host_user_id, group_key, is_host, seats, guest_names, state, waitlist_pos)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(id)
    .bind(row.session_id)
    .bind(row.host_user_id)
    .bind(row.group_key)
    .bind(row.is_host)
    .bind(row.seats)
    .bind(row.guest_names)
    .bind(row.state.as_str())
    .bind(row.waitlist_pos)
    .execute(&mut **transaction)
    .await?;
    Ok(id)
}

/// Mark a row canceled, remembering the state it was canceled from. Always
/// clears the waitlist position (a canceled row must not occupy one).
pub async fn mark_canceled(
    transaction: &mut PgTransaction,
    registration_id: Uuid,
    from_state: RegistrationState,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE registrations \
         SET state = 'canceled', canceled_at = $2, canceled_from_state = $3, waitlist_pos = NULL \
         WHERE id = $1",
    )
    .bind(registration_id)
    .bind(now)
    .bind(from_state.as_str())
    .execute(&mut **transaction)
    .await?;
    Ok(())
}
