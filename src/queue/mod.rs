//! The per-session ingress queue: Redis streams for ordered intents, plain
//! keys for the idempotency map, request status and backlog counters.

pub mod keys;

mod ingress;
mod status;

pub use ingress::enqueue_registration;
pub use ingress::EnqueueOutcome;
pub use status::load as load_request_status;
pub use status::record_outcome;
pub use status::store_queued;
pub use status::RequestState;
pub use status::RequestStatus;

use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::streams::StreamReadOptions;
use redis::streams::StreamReadReply;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::errors::AppError;

/// One entry read from a stream via a consumer group.
#[derive(Debug)]
pub struct StreamMessage {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamMessage {
    pub fn field(
        &self,
        name: &str,
    ) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Create the consumer group at the beginning of the stream, creating the
/// stream if needed. Creating a group that already exists is fine.
pub async fn ensure_group(
    redis: &mut ConnectionManager,
    stream: &str,
    group: &str,
) -> Result<(), AppError> {
    match redis
        .xgroup_create_mkstream::<_, _, _, String>(stream, group, "0")
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn value_to_string(v: &redis::Value) -> Option<String> {
    match v {
        redis::Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        redis::Value::Status(s) => Some(s.clone()),
        redis::Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Read undelivered entries from several streams at once via XREADGROUP.
/// Returns `(stream key, messages)` pairs; messages within one stream come
/// back in append order.
pub async fn read_group(
    redis: &mut ConnectionManager,
    streams: &[String],
    group: &str,
    consumer: &str,
    count: usize,
    block_ms: usize,
) -> Result<Vec<(String, Vec<StreamMessage>)>, AppError> {
    if streams.is_empty() {
        return Ok(Vec::new());
    }
    let opts = StreamReadOptions::default()
        .group(group, consumer)
        .count(count)
        .block(block_ms);
    let ids: Vec<&str> = streams.iter().map(|_| ">").collect();
    let reply: StreamReadReply = redis.xread_options(streams, &ids, &opts).await?;

    let mut out = Vec::new();
    for key in reply.keys {
        let messages = key
            .ids
            .into_iter()
            .map(|entry| {
                let fields = entry
                    .map
                    .iter()
                    .filter_map(|(k, v)| value_to_string(v).map(|v| (k.clone(), v)))
                    .collect();
                StreamMessage {
                    id: entry.id,
                    fields,
                }
            })
            .collect();
        out.push((key.key, messages));
    }
    Ok(out)
}

pub async fn ack(
    redis: &mut ConnectionManager,
    stream: &str,
    group: &str,
    message_id: &str,
) -> Result<(), AppError> {
    redis
        .xack::<_, _, _, i64>(stream, group, &[message_id])
        .await?;
    Ok(())
}

pub async fn backlog(
    redis: &mut ConnectionManager,
    session_id: Uuid,
) -> Result<i64, AppError> {
    let v: Option<String> = redis.get(keys::backlog(session_id)).await?;
    Ok(v.and_then(|s| s.parse().ok()).unwrap_or(0))
}

pub async fn incr_backlog(
    redis: &mut ConnectionManager,
    session_id: Uuid,
) -> Result<(), AppError> {
    redis
        .incr::<_, _, i64>(keys::backlog(session_id), 1)
        .await?;
    Ok(())
}

/// Decrement, clamped at zero (a crashed worker may decrement twice).
pub async fn decr_backlog(
    redis: &mut ConnectionManager,
    session_id: Uuid,
) -> Result<(), AppError> {
    let key = keys::backlog(session_id);
    let v: i64 = redis.decr(&key, 1).await?;
    if v < 0 {
        redis.set::<_, _, ()>(&key, 0).await?;
    }
    Ok(())
}

pub async fn set_registration_request(
    redis: &mut ConnectionManager,
    registration_id: Uuid,
    request_id: &str,
    ttl_secs: u64,
) -> Result<(), AppError> {
    redis::cmd("SET")
        .arg(keys::registration_request(registration_id))
        .arg(request_id)
        .arg("EX")
        .arg(ttl_secs)
        .query_async::<_, ()>(redis)
        .await?;
    Ok(())
}

pub async fn get_registration_request(
    redis: &mut ConnectionManager,
    registration_id: Uuid,
) -> Result<Option<String>, AppError> {
    let v: Option<String> = redis.get(keys::registration_request(registration_id)).await?;
    Ok(v)
}
