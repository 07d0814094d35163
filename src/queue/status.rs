use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use super::keys;
use crate::errors::AppError;

/// Lifecycle of a registration request as observed by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Queued,
    Confirmed,
    Waitlisted,
    Rejected,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Confirmed => "confirmed",
            Self::Waitlisted => "waitlisted",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "queued" => Ok(Self::Queued),
            "confirmed" => Ok(Self::Confirmed),
            "waitlisted" => Ok(Self::Waitlisted),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("invalid request state: {other:?}")),
        }
    }
}

/// The record behind `GET /requests/{id}/status`. Stored as a Redis hash so
/// workers can update individual fields without read-modify-write races;
/// GC'd by TTL.
#[derive(Debug, Serialize)]
pub struct RequestStatus {
    pub state: RequestState,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub seats: i32,
    pub guest_names: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub registration_id: Option<Uuid>,
    pub waitlist_pos: Option<i32>,
}

pub async fn store_queued(
    redis: &mut ConnectionManager,
    request_id: &str,
    session_id: Uuid,
    user_id: Uuid,
    seats: i32,
    guest_names: &[String],
    ttl_secs: u64,
) -> Result<(), AppError> {
    let key = keys::request_status(request_id);
    let guests = serde_json::to_string(guest_names)
        .map_err(|e| AppError::Unexpected(e.into()))?;
    redis
        .hset_multiple::<_, _, _, ()>(
            &key,
            &[
                ("state", RequestState::Queued.as_str().to_string()),
                ("session_id", session_id.to_string()),
                ("user_id", user_id.to_string()),
                ("seats", seats.to_string()),
                ("guest_names", guests),
                ("created_at", Utc::now().to_rfc3339()),
            ],
        )
        .await?;
    expire(redis, &key, ttl_secs).await?;
    Ok(())
}

async fn expire(
    redis: &mut ConnectionManager,
    key: &str,
    ttl_secs: u64,
) -> Result<(), AppError> {
    redis::cmd("EXPIRE")
        .arg(key)
        .arg(ttl_secs)
        .query_async::<_, i64>(redis)
        .await?;
    Ok(())
}

fn required<'a>(
    map: &'a HashMap<String, String>,
    field: &str,
) -> Result<&'a str, AppError> {
    map.get(field)
        .map(String::as_str)
        .ok_or(AppError::CorruptState)
}

/// Load and validate a request-status record. A missing key returns
/// `Ok(None)` (the record may have been GC'd); a half-written record
/// surfaces as `CorruptState`.
pub async fn load(
    redis: &mut ConnectionManager,
    request_id: &str,
) -> Result<Option<RequestStatus>, AppError> {
    let map: HashMap<String, String> = redis.hgetall(keys::request_status(request_id)).await?;
    if map.is_empty() {
        return Ok(None);
    }

    let state = RequestState::parse(required(&map, "state")?)
        .map_err(|_| AppError::CorruptState)?;
    let session_id = required(&map, "session_id")?
        .parse()
        .map_err(|_| AppError::CorruptState)?;
    let user_id = required(&map, "user_id")?
        .parse()
        .map_err(|_| AppError::CorruptState)?;
    let seats = required(&map, "seats")?
        .parse()
        .map_err(|_| AppError::CorruptState)?;
    let guest_names = serde_json::from_str(required(&map, "guest_names")?)
        .map_err(|_| AppError::CorruptState)?;
    let created_at = DateTime::parse_from_rfc3339(required(&map, "created_at")?)
        .map_err(|_| AppError::CorruptState)?
        .with_timezone(&Utc);

    // optional fields; an empty string means "cleared"
    let registration_id = match map.get("registration_id").map(String::as_str) {
        None | Some("") => None,
        Some(s) => Some(s.parse().map_err(|_| AppError::CorruptState)?),
    };
    let waitlist_pos = match map.get("waitlist_pos").map(String::as_str) {
        None | Some("") => None,
        Some(s) => Some(s.parse().map_err(|_| AppError::CorruptState)?),
    };

    Ok(Some(RequestStatus {
        state,
        session_id,
        user_id,
        seats,
        guest_names,
        created_at,
        registration_id,
        waitlist_pos,
    }))
}

/// Record a request's outcome and push the delta on its realtime channel.
/// Consumers must tolerate duplicates: at-least-once processing means this
/// can run more than once per request.
pub async fn record_outcome(
    redis: &mut ConnectionManager,
    request_id: &str,
    state: RequestState,
    registration_id: Option<Uuid>,
    waitlist_pos: Option<i32>,
    ttl_secs: u64,
) -> Result<(), AppError> {
    let key = keys::request_status(request_id);
    let mut fields: Vec<(&str, String)> = vec![("state", state.as_str().to_string())];
    if let Some(id) = registration_id {
        fields.push(("registration_id", id.to_string()));
    }
    fields.push((
        "waitlist_pos",
        waitlist_pos.map(|p| p.to_string()).unwrap_or_default(),
    ));
    redis.hset_multiple::<_, _, _, ()>(&key, &fields).await?;
    expire(redis, &key, ttl_secs).await?;

    let delta = serde_json::json!({
        "state": state.as_str(),
        "registration_id": registration_id,
        "waitlist_pos": waitlist_pos,
    });
    redis
        .publish::<_, _, i64>(keys::request_channel(request_id), delta.to_string())
        .await?;
    Ok(())
}
