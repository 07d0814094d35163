use actix_web::web;
use actix_web::HttpResponse;
use chrono::DateTime;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::Deserialize;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::authentication::require_admin;
use crate::authentication::UserId;
use crate::errors::AppError;
use crate::lifecycle;
use crate::lifecycle::NewSession;
use crate::lifecycle::PreregItem;
use crate::lifecycle::SessionWithStats;

#[derive(Serialize)]
struct SessionOut {
    id: Uuid,
    title: Option<String>,
    starts_at: DateTime<Utc>,
    timezone: String,
    capacity: i32,
    fee_cents: i64,
    status: String,
    created_at: DateTime<Utc>,
    confirmed_seats: i64,
    remaining_seats: i64,
}

impl From<SessionWithStats> for SessionOut {
    fn from(s: SessionWithStats) -> Self {
        let remaining_seats = s.remaining_seats();
        Self {
            id: s.id,
            title: s.title,
            starts_at: s.starts_at,
            timezone: s.timezone,
            capacity: s.capacity,
            fee_cents: s.fee_cents,
            status: s.status,
            created_at: s.created_at,
            confirmed_seats: s.confirmed_seats,
            remaining_seats,
        }
    }
}

#[derive(Deserialize)]
pub struct ListQuery {
    limit: Option<i64>,
}

/// `GET /sessions` — upcoming sessions with seat counts.
pub async fn list_sessions(
    query: web::Query<ListQuery>,
    pool: web::Data<PgPool>,
) -> Result<HttpResponse, AppError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let sessions = lifecycle::list_upcoming(pool.get_ref(), Utc::now(), limit).await?;
    let out: Vec<SessionOut> = sessions.into_iter().map(Into::into).collect();
    Ok(HttpResponse::Ok().json(out))
}

/// `GET /sessions/{session_id}`
pub async fn get_session(
    path: web::Path<Uuid>,
    pool: web::Data<PgPool>,
) -> Result<HttpResponse, AppError> {
    let session = lifecycle::get_with_stats(pool.get_ref(), path.into_inner())
        .await?
        .ok_or(AppError::NotFound("session"))?;
    Ok(HttpResponse::Ok().json(SessionOut::from(session)))
}

#[derive(Deserialize)]
pub struct PreregItemIn {
    user_id: Uuid,
    seats: i32,
    #[serde(default)]
    guest_names: Vec<String>,
    idempotency_key: String,
}

#[derive(Deserialize)]
pub struct SessionCreateBody {
    title: Option<String>,
    /// Absolute instant (UTC); the local-day refund policy uses `timezone`
    starts_at: DateTime<Utc>,
    timezone: String,
    capacity: i32,
    fee_cents: i64,
    #[serde(default)]
    preregistrations: Vec<PreregItemIn>,
}

/// `POST /admin/sessions`
#[tracing::instrument(skip_all, fields(user_id = %**user_id))]
pub async fn create_session(
    body: web::Json<SessionCreateBody>,
    pool: web::Data<PgPool>,
    user_id: web::ReqData<UserId>,
) -> Result<HttpResponse, AppError> {
    require_admin(pool.get_ref(), *user_id.into_inner()).await?;

    let body = body.into_inner();
    let preregs = body
        .preregistrations
        .into_iter()
        .map(|p| PreregItem {
            user_id: p.user_id,
            seats: p.seats,
            guest_names: p.guest_names,
            idempotency_key: p.idempotency_key,
        })
        .collect();

    let (session, prereg_results) = lifecycle::create_session(
        pool.get_ref(),
        NewSession {
            title: body.title,
            starts_at: body.starts_at,
            timezone: body.timezone,
            capacity: body.capacity,
            fee_cents: body.fee_cents,
        },
        preregs,
    )
    .await?;

    Ok(HttpResponse::Created().json(serde_json::json!({
        "session": {
            "id": session.id,
            "title": session.title,
            "starts_at": session.starts_at,
            "timezone": session.timezone,
            "capacity": session.capacity,
            "fee_cents": session.fee_cents,
            "status": session.status,
            "created_at": session.created_at,
        },
        "prereg_results": prereg_results,
    })))
}

#[derive(Deserialize)]
pub struct SessionPatchBody {
    capacity: Option<i32>,
    status: Option<String>,
}

/// `PATCH /admin/sessions/{session_id}` — capacity and/or status, with the
/// lifecycle side effects.
#[tracing::instrument(skip_all, fields(user_id = %**user_id))]
pub async fn patch_session(
    path: web::Path<Uuid>,
    body: web::Json<SessionPatchBody>,
    pool: web::Data<PgPool>,
    redis: web::Data<ConnectionManager>,
    user_id: web::ReqData<UserId>,
) -> Result<HttpResponse, AppError> {
    require_admin(pool.get_ref(), *user_id.into_inner()).await?;

    let mut redis = redis.get_ref().clone();
    let session = lifecycle::admin_update_session(
        pool.get_ref(),
        &mut redis,
        path.into_inner(),
        body.capacity,
        body.status.as_deref(),
        Utc::now(),
    )
    .await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "id": session.id,
        "title": session.title,
        "starts_at": session.starts_at,
        "timezone": session.timezone,
        "capacity": session.capacity,
        "fee_cents": session.fee_cents,
        "status": session.status,
        "created_at": session.created_at,
    })))
}
