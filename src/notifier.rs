//! Realtime-bus tail: subscribes to the session and request channels and
//! records every delivery. Actual end-user notification transports (SMS,
//! email) live outside this service and consume the same channels.

use futures::StreamExt;
use secrecy::ExposeSecret;

use crate::configuration::Settings;

/// To be run as a background worker. Reconnects with a backoff if the bus
/// connection drops; events published while disconnected are not replayed
/// here (the outbox keeps the durable record).
pub async fn init_notifier_worker(cfg: Settings) -> Result<(), anyhow::Error> {
    let client = redis::Client::open(cfg.redis_uri.expose_secret().as_str())?;
    loop {
        match run(&client).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(error.cause_chain = ?e, "notifier subscription lost; reconnecting");
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            }
        }
    }
}

async fn run(client: &redis::Client) -> Result<(), anyhow::Error> {
    let mut pubsub = client.get_async_connection().await?.into_pubsub();
    pubsub.psubscribe("session:*").await?;
    pubsub.psubscribe("req:*").await?;

    let mut stream = pubsub.on_message();
    while let Some(message) = stream.next().await {
        let channel = message.get_channel_name().to_string();
        match message.get_payload::<String>() {
            Ok(payload) => tracing::info!(%channel, %payload, "event delivered"),
            Err(e) => tracing::warn!(%channel, error.cause_chain = ?e, "undecodable event payload"),
        }
    }
    Err(anyhow::anyhow!("pub/sub stream ended"))
}
