use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use actix_web::ResponseError;

/// Walk the source chain so `Debug` output shows the full cause of a failure,
/// not just the top-level message.
pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{e}\n")?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{cause}")?;
        current = cause.source();
    }
    Ok(())
}

/// Domain-level error kinds, independent of transport. Every service returns
/// these; the HTTP layer maps each kind to a stable status code and error
/// code. Internal details (`Unexpected`, `Transient`, `CorruptState`) never
/// leak to clients.
#[derive(thiserror::Error)]
pub enum AppError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("forbidden")]
    Forbidden,
    /// Duplicate host registration, capacity below confirmed, invalid
    /// lifecycle transition, max guests exceeded, insufficient funds, ...
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Validation(String),
    /// Action attempted at or after session start
    #[error("not allowed after session start")]
    TooLate,
    /// Per-session ingress backlog cap hit
    #[error("registration queue is busy; try again shortly")]
    Backpressure,
    /// A request-status record is missing required fields
    #[error("request status record is corrupt")]
    CorruptState,
    /// Serialization failure, realtime bus unavailable; safe to retry
    #[error("transient failure")]
    Transient(#[source] anyhow::Error),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl std::fmt::Debug for AppError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl AppError {
    /// Stable, client-facing error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::NotAuthenticated => "not_authenticated",
            Self::Forbidden => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation",
            Self::TooLate => "too_late",
            Self::Backpressure => "backpressure",
            Self::CorruptState => "corrupt_state",
            Self::Transient(_) => "transient",
            Self::Unexpected(_) => "internal",
        }
    }

    fn client_message(&self) -> String {
        match self {
            // never expose internals
            Self::Unexpected(_) => "internal error".into(),
            Self::Transient(_) => "temporarily unavailable; retry shortly".into(),
            other => other.to_string(),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NotAuthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::TooLate => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Backpressure => StatusCode::TOO_MANY_REQUESTS,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::CorruptState | Self::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.code(),
            "message": self.client_message(),
        }))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        Self::Unexpected(anyhow::Error::from(e))
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        Self::Transient(anyhow::Error::from(e))
    }
}

/// Postgres signals a serializable-isolation conflict with SQLSTATE 40001;
/// such transactions are safe to retry from the top.
pub fn is_serialization_failure(e: &AppError) -> bool {
    fn sqlstate(e: &anyhow::Error) -> Option<String> {
        e.downcast_ref::<sqlx::Error>()
            .and_then(|e| e.as_database_error())
            .and_then(|db| db.code())
            .map(|c| c.into_owned())
    }
    match e {
        AppError::Unexpected(inner) | AppError::Transient(inner) => {
            matches!(sqlstate(inner).as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}
