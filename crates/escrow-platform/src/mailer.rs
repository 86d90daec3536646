use anyhow::Result;
use async_trait::async_trait;
use escrow_engine::{Mailer, Notification};
use tracing::info;

use crate::redis_bus::{NOTIFICATIONS_CHANNEL, RedisBus};

/// Hands notifications to whatever mail relay subscribes to the bus.
#[derive(Clone)]
pub struct RedisMailer {
    bus: RedisBus,
}

impl RedisMailer {
    pub fn new(bus: RedisBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Mailer for RedisMailer {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        self.bus
            .publish_json(NOTIFICATIONS_CHANNEL, notification)
            .await?;
        Ok(())
    }
}

/// Used when no bus is configured: notifications only reach the logs.
#[derive(Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        info!(
            deal_id = %notification.deal_id,
            event = notification.event.name(),
            recipient = %notification.recipient,
            email = %notification.email,
            subject = %notification.subject,
            "notification"
        );
        Ok(())
    }
}
