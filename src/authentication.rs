//! The caller-identity boundary. Credential issuance (one-time login codes)
//! is an external collaborator; this module only turns an established cookie
//! session into a typed `UserId` and gates admin-only work.

use std::ops::Deref;

use actix_web::body::MessageBody;
use actix_web::dev::ServiceRequest;
use actix_web::dev::ServiceResponse;
use actix_web::FromRequest;
use actix_web::HttpMessage;
use actix_web_lab::middleware::Next;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::errors::AppError;
use crate::session_state::TypedSession;
use crate::utils::error_500;

/// The authenticated caller, embedded into the request by
/// `reject_anonymous_users`.
#[derive(Clone, Copy, Debug)]
pub struct UserId(Uuid);

impl Deref for UserId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Middleware for authenticated scopes: resolves the session cookie to a
/// `UserId` or fails the request with 401.
pub async fn reject_anonymous_users(
    mut req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, actix_web::Error> {
    let (raw_req, payload) = req.parts_mut();
    let session = TypedSession::from_request(raw_req, payload).await?;

    match session.get_user_id().map_err(error_500)? {
        Some(user_id) => {
            req.extensions_mut().insert(UserId(user_id));
            next.call(req).await
        }
        None => Err(AppError::NotAuthenticated.into()),
    }
}

/// Admin gate for the session/deposit admin endpoints. The admin flag lives
/// on the users row, so a demoted admin loses access on their next request.
pub async fn require_admin(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<(), AppError> {
    let row = sqlx::query("SELECT is_admin FROM users WHERE id = $1 AND deleted_at IS NULL")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    match row {
        None => Err(AppError::NotAuthenticated),
        Some(row) if row.try_get::<bool, _>("is_admin")? => Ok(()),
        Some(_) => Err(AppError::Forbidden),
    }
}
