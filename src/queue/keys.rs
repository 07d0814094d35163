//! Redis key namespace. Everything is scoped per session or per request so
//! TTLs and stream trimming bound memory growth.

use uuid::Uuid;

/// Ordered ingress log of pending registration intents for one session.
pub fn session_stream(session_id: Uuid) -> String {
    format!("sess:{session_id}:stream")
}

/// Promotion pings for one session; any message triggers a promotion pass.
pub fn promote_stream(session_id: Uuid) -> String {
    format!("promote:{session_id}:stream")
}

/// Maps a submission key to its request id so retries within the TTL reuse
/// the same pending request.
pub fn idempotency(
    session_id: Uuid,
    user_id: Uuid,
    submission_key: &str,
) -> String {
    format!("idemp:{session_id}:{user_id}:{submission_key}")
}

/// Hash holding the request-status record (clients poll this).
pub fn request_status(request_id: &str) -> String {
    format!("req:{request_id}:status")
}

/// Pub/sub channel carrying state deltas for one request.
pub fn request_channel(request_id: &str) -> String {
    format!("req:{request_id}")
}

/// Reverse mapping registration -> request, so the promotion worker can flip
/// the original request to `confirmed`.
pub fn registration_request(registration_id: Uuid) -> String {
    format!("regreq:{registration_id}")
}

/// Unprocessed-intent counter per session, used for the backlog cap.
pub fn backlog(session_id: Uuid) -> String {
    format!("sess:{session_id}:backlog")
}

/// One-time login codes written by the external issuer.
pub fn otp(email: &str) -> String {
    format!("otp:{}", email.to_lowercase())
}

/// Cooperative lock ensuring a single active auto-closer across replicas.
pub fn closer_lock() -> String {
    "lock:session_closer".to_string()
}
