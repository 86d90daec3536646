use anyhow::{Context, Result};
use redis::{AsyncCommands, Client};
use serde::Serialize;
use tracing::debug;

pub const NOTIFICATIONS_CHANNEL: &str = "escrow.notifications";
pub const DEALS_INDEXED_CHANNEL: &str = "escrow.deals.indexed";

/// Redis pub/sub for events leaving the escrow services.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
}

impl RedisBus {
    pub fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("invalid REDIS_URL")?;
        Ok(Self { client })
    }

    /// Returns the number of subscribers that received the message.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        channel: &str,
        payload: &T,
    ) -> Result<i64> {
        let mut connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("redis connection failed")?;
        let serialized = serde_json::to_string(payload)?;
        let receivers: i64 = connection.publish(channel, serialized).await?;
        debug!(channel, receivers, "published to redis");
        Ok(receivers)
    }
}
