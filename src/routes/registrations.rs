use actix_web::web;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use chrono::DateTime;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::Deserialize;
use serde::Serialize;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::authentication::UserId;
use crate::cancellation::cancel_registration;
use crate::configuration::Settings;
use crate::domain::SubmissionKey;
use crate::errors::AppError;
use crate::guests::add_guest;
use crate::guests::update_guest_list;
use crate::queue;
use crate::queue::enqueue_registration;

#[derive(Deserialize)]
pub struct RegisterBody {
    seats: i32,
    #[serde(default)]
    guest_names: Vec<String>,
}

#[derive(Serialize)]
struct RegisterAccepted {
    request_id: String,
    state: &'static str,
}

fn submission_key(req: &HttpRequest) -> Result<SubmissionKey, AppError> {
    let raw = req
        .headers()
        .get("Idempotency-Key")
        .ok_or_else(|| AppError::Validation("Idempotency-Key header is required".into()))?
        .to_str()
        .map_err(|_| AppError::Validation("Idempotency-Key must be ASCII".into()))?;
    SubmissionKey::try_from(raw.to_string()).map_err(AppError::Validation)
}

/// `POST /sessions/{session_id}/register`
///
/// Returns 202 with a request id; the allocation itself happens on the
/// session's ordered stream. Clients follow up via `GET
/// /requests/{request_id}/status` or the `req:{request_id}` channel.
#[tracing::instrument(skip_all, fields(user_id = %**user_id))]
pub async fn submit_registration(
    path: web::Path<Uuid>,
    body: web::Json<RegisterBody>,
    req: HttpRequest,
    pool: web::Data<PgPool>,
    redis: web::Data<ConnectionManager>,
    cfg: web::Data<Settings>,
    user_id: web::ReqData<UserId>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let key = submission_key(&req)?;

    let mut redis = redis.get_ref().clone();
    let outcome = enqueue_registration(
        pool.get_ref(),
        &mut redis,
        &cfg.queue,
        session_id,
        *user_id.into_inner(),
        body.seats,
        &body.guest_names,
        &key,
    )
    .await?;

    Ok(HttpResponse::Accepted().json(RegisterAccepted {
        request_id: outcome.request_id,
        state: "queued",
    }))
}

/// `GET /requests/{request_id}/status`
///
/// The record is a capability keyed by the (unguessable) request id; it is
/// GC'd after 24 hours, after which this returns 404.
pub async fn request_status(
    path: web::Path<String>,
    redis: web::Data<ConnectionManager>,
) -> Result<HttpResponse, AppError> {
    let mut redis = redis.get_ref().clone();
    match queue::load_request_status(&mut redis, &path).await? {
        None => Err(AppError::NotFound("request")),
        Some(status) => Ok(HttpResponse::Ok().json(status)),
    }
}

#[derive(Serialize)]
struct RegRow {
    registration_id: Uuid,
    host_user_id: Uuid,
    host_name: String,
    seats: i32,
    guest_names: Vec<String>,
    state: String,
    waitlist_pos: Option<i32>,
}

/// `GET /sessions/{session_id}/registrations` — participants and waitlist,
/// confirmed first, then waitlist by position.
pub async fn list_session_registrations(
    path: web::Path<Uuid>,
    pool: web::Data<PgPool>,
) -> Result<HttpResponse, AppError> {
    let rows = sqlx::query(
        r#"
        SELECT r.id, r.host_user_id, u.name AS host_name, r.seats, r.guest_names,
               r.state, r.waitlist_pos
        FROM registrations r
        JOIN users u ON u.id = r.host_user_id
        WHERE r.session_id = $1 AND r.state <> 'canceled'
        ORDER BY CASE r.state WHEN 'confirmed' THEN 0 ELSE 1 END,
                 r.waitlist_pos NULLS FIRST,
                 r.created_at ASC
        "#,
    )
    .bind(path.into_inner())
    .fetch_all(pool.get_ref())
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(RegRow {
            registration_id: row.try_get("id")?,
            host_user_id: row.try_get("host_user_id")?,
            host_name: row.try_get("host_name")?,
            seats: row.try_get("seats")?,
            guest_names: row.try_get("guest_names")?,
            state: row.try_get("state")?,
            waitlist_pos: row.try_get("waitlist_pos")?,
        });
    }
    Ok(HttpResponse::Ok().json(out))
}

#[derive(Deserialize)]
pub struct MyRegistrationsQuery {
    #[serde(default)]
    show_past: bool,
}

#[derive(Serialize)]
struct MyRegistration {
    registration_id: Uuid,
    session_id: Uuid,
    session_title: Option<String>,
    starts_at: DateTime<Utc>,
    timezone: String,
    session_status: String,
    seats: i32,
    guest_names: Vec<String>,
    state: String,
    waitlist_pos: Option<i32>,
}

/// `GET /me/registrations` — upcoming by default; `?show_past=true` lists
/// closed sessions instead.
pub async fn my_registrations(
    query: web::Query<MyRegistrationsQuery>,
    pool: web::Data<PgPool>,
    user_id: web::ReqData<UserId>,
) -> Result<HttpResponse, AppError> {
    let rows = sqlx::query(
        r#"
        SELECT r.id, r.seats, r.guest_names, r.state, r.waitlist_pos,
               s.id AS session_id, s.title, s.starts_at, s.timezone, s.status AS session_status
        FROM registrations r
        JOIN sessions s ON s.id = r.session_id
        WHERE r.host_user_id = $1
          AND r.state <> 'canceled'
          AND (($2 AND s.status = 'closed') OR (NOT $2 AND s.status <> 'closed'))
        ORDER BY CASE WHEN $2 THEN NULL ELSE s.starts_at END ASC,
                 s.starts_at DESC
        "#,
    )
    .bind(*user_id.into_inner())
    .bind(query.show_past)
    .fetch_all(pool.get_ref())
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(MyRegistration {
            registration_id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            session_title: row.try_get("title")?,
            starts_at: row.try_get("starts_at")?,
            timezone: row.try_get("timezone")?,
            session_status: row.try_get("session_status")?,
            seats: row.try_get("seats")?,
            guest_names: row.try_get("guest_names")?,
            state: row.try_get("state")?,
            waitlist_pos: row.try_get("waitlist_pos")?,
        });
    }
    Ok(HttpResponse::Ok().json(out))
}

#[derive(Serialize)]
struct CancelOut {
    refund_cents: i64,
    penalty_cents: i64,
    state: &'static str,
}

/// `POST /registrations/{registration_id}/cancel`
#[tracing::instrument(skip_all, fields(user_id = %**user_id))]
pub async fn cancel(
    path: web::Path<Uuid>,
    pool: web::Data<PgPool>,
    redis: web::Data<ConnectionManager>,
    user_id: web::ReqData<UserId>,
) -> Result<HttpResponse, AppError> {
    let caller = *user_id.into_inner();
    let is_admin = caller_is_admin(pool.get_ref(), caller).await?;
    let mut redis = redis.get_ref().clone();
    let outcome = cancel_registration(
        pool.get_ref(),
        &mut redis,
        path.into_inner(),
        caller,
        is_admin,
        Utc::now(),
    )
    .await?;
    Ok(HttpResponse::Ok().json(CancelOut {
        refund_cents: outcome.refund_cents,
        penalty_cents: outcome.penalty_cents,
        state: outcome.state,
    }))
}

#[derive(Deserialize)]
pub struct GuestsPatchBody {
    guest_names: Vec<String>,
}

#[derive(Serialize)]
struct GuestsPatchOut {
    registration_id: Uuid,
    old_seats: i32,
    new_seats: i32,
    refund_cents: i64,
    penalty_cents: i64,
    state: String,
}

/// `PATCH /registrations/{registration_id}/guests` — replace the guest list;
/// seats may only shrink.
#[tracing::instrument(skip_all, fields(user_id = %**user_id))]
pub async fn patch_guests(
    path: web::Path<Uuid>,
    body: web::Json<GuestsPatchBody>,
    pool: web::Data<PgPool>,
    redis: web::Data<ConnectionManager>,
    user_id: web::ReqData<UserId>,
) -> Result<HttpResponse, AppError> {
    let registration_id = path.into_inner();
    let caller = *user_id.into_inner();
    let is_admin = caller_is_admin(pool.get_ref(), caller).await?;
    let mut redis = redis.get_ref().clone();
    let outcome = update_guest_list(
        pool.get_ref(),
        &mut redis,
        registration_id,
        caller,
        is_admin,
        &body.guest_names,
        Utc::now(),
    )
    .await?;
    Ok(HttpResponse::Ok().json(GuestsPatchOut {
        registration_id,
        old_seats: outcome.old_seats,
        new_seats: outcome.new_seats,
        refund_cents: outcome.refund_cents,
        penalty_cents: outcome.penalty_cents,
        state: outcome.state,
    }))
}

#[derive(Deserialize)]
pub struct GuestAddBody {
    name: String,
}

#[derive(Serialize)]
struct GuestAddOut {
    registration_id: Uuid,
    state: String,
    waitlist_pos: Option<i32>,
}

/// `POST /registrations/{host_registration_id}/guests` — add one guest seat
/// to the host's group.
#[tracing::instrument(skip_all, fields(user_id = %**user_id))]
pub async fn add_guest_seat(
    path: web::Path<Uuid>,
    body: web::Json<GuestAddBody>,
    pool: web::Data<PgPool>,
    redis: web::Data<ConnectionManager>,
    user_id: web::ReqData<UserId>,
) -> Result<HttpResponse, AppError> {
    let caller = *user_id.into_inner();
    let is_admin = caller_is_admin(pool.get_ref(), caller).await?;
    let mut redis = redis.get_ref().clone();
    let outcome = add_guest(
        pool.get_ref(),
        &mut redis,
        path.into_inner(),
        body.name.clone(),
        caller,
        is_admin,
        Utc::now(),
    )
    .await?;
    Ok(HttpResponse::Created().json(GuestAddOut {
        registration_id: outcome.registration_id,
        state: outcome.state,
        waitlist_pos: outcome.waitlist_pos,
    }))
}

async fn caller_is_admin(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<bool, AppError> {
    let row = sqlx::query("SELECT is_admin FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    match row {
        None => Ok(false),
        Some(row) => Ok(row.try_get("is_admin")?),
    }
}
