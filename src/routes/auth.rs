//! Login verification. One-time code issuance (SMS/email delivery) is an
//! external collaborator that writes `otp:{email}` keys into Redis; we only
//! verify the code and open the cookie session.

use actix_web::web;
use actix_web::HttpResponse;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Deserialize;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::domain::UserEmail;
use crate::errors::AppError;
use crate::queue::keys;
use crate::session_state::TypedSession;
use crate::utils::error_500;

#[derive(Deserialize)]
pub struct VerifyBody {
    email: String,
    code: String,
}

#[tracing::instrument(skip_all)]
pub async fn verify_login(
    body: web::Json<VerifyBody>,
    pool: web::Data<PgPool>,
    redis: web::Data<ConnectionManager>,
    session: TypedSession,
) -> Result<HttpResponse, AppError> {
    let email = UserEmail::parse(body.email.clone()).map_err(AppError::Validation)?;

    let mut redis = redis.get_ref().clone();
    let key = keys::otp(email.as_ref());
    let stored: Option<String> = redis.get(&key).await?;
    let valid = stored.as_deref() == Some(body.code.trim()) && !body.code.trim().is_empty();
    if !valid {
        return Err(AppError::NotAuthenticated);
    }
    // single use
    redis.del::<_, i64>(&key).await?;

    let row = sqlx::query(
        "SELECT id FROM users WHERE email = $1 AND status = 'active' AND deleted_at IS NULL",
    )
    .bind(email.as_ref())
    .fetch_optional(pool.get_ref())
    .await?;
    let user_id: Uuid = match row {
        None => return Err(AppError::NotAuthenticated),
        Some(row) => row.try_get("id")?,
    };

    session.renew();
    session
        .insert_user_id(user_id)
        .map_err(|e| AppError::Unexpected(e.into()))?;

    Ok(HttpResponse::Ok().json(serde_json::json!({ "user_id": user_id })))
}

pub async fn log_out(session: TypedSession) -> Result<HttpResponse, actix_web::Error> {
    if session.get_user_id().map_err(error_500)?.is_some() {
        session.log_out();
    }
    Ok(HttpResponse::NoContent().finish())
}
