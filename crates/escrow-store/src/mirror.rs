use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use escrow_core::{LogEnvelope, LogReader};
use serde::Deserialize;
use tracing::warn;

/// The mirror node never returns more than this many messages per page.
pub const MIRROR_PAGE_LIMIT: usize = 100;

/// Reads a consensus topic through a mirror node's REST API.
#[derive(Clone)]
pub struct MirrorLogReader {
    client: reqwest::Client,
    base_url: String,
    topic_id: String,
}

#[derive(Debug, Deserialize)]
struct TopicMessagesPage {
    #[serde(default)]
    messages: Vec<TopicMessage>,
}

#[derive(Debug, Deserialize)]
struct TopicMessage {
    consensus_timestamp: String,
    message: String,
    sequence_number: u64,
}

impl MirrorLogReader {
    pub fn new(base_url: &str, topic_id: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build mirror node client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            topic_id: topic_id.trim().to_string(),
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/api/v1/topics/{}/messages", self.base_url, self.topic_id)
    }
}

#[async_trait]
impl LogReader for MirrorLogReader {
    async fn read_after(&self, after_sequence: u64, limit: usize) -> Result<Vec<LogEnvelope>> {
        let limit = limit.clamp(1, MIRROR_PAGE_LIMIT);
        let page: TopicMessagesPage = self
            .client
            .get(self.messages_url())
            .query(&[
                ("sequencenumber", format!("gt:{after_sequence}")),
                ("limit", limit.to_string()),
                ("order", "asc".to_string()),
            ])
            .send()
            .await
            .context("mirror node request failed")?
            .error_for_status()
            .context("mirror node returned an error status")?
            .json()
            .await
            .context("mirror node returned malformed JSON")?;

        Ok(page.messages.iter().map(envelope_for).collect())
    }
}

/// Undecodable messages keep their sequence number with an empty payload, so
/// the fold skips them and pagination still moves past them.
fn envelope_for(message: &TopicMessage) -> LogEnvelope {
    match decode_message(message) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(
                sequence = message.sequence_number,
                "undecodable topic message: {err:#}"
            );
            LogEnvelope {
                sequence: message.sequence_number,
                consensus_timestamp: parse_consensus_timestamp(&message.consensus_timestamp)
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                payload: String::new(),
            }
        }
    }
}

fn decode_message(message: &TopicMessage) -> Result<LogEnvelope> {
    let bytes = STANDARD
        .decode(message.message.as_bytes())
        .context("message is not base64")?;
    let payload = String::from_utf8(bytes).context("message is not UTF-8")?;

    Ok(LogEnvelope {
        sequence: message.sequence_number,
        consensus_timestamp: parse_consensus_timestamp(&message.consensus_timestamp)?,
        payload,
    })
}

/// Parses `seconds.nanoseconds` as used by the mirror node.
pub fn parse_consensus_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let (seconds, nanos) = raw.split_once('.').unwrap_or((raw, "0"));
    let seconds: i64 = seconds
        .parse()
        .with_context(|| format!("invalid consensus timestamp '{raw}'"))?;
    let nanos: u32 = format!("{nanos:0<9}")
        .get(..9)
        .unwrap_or("0")
        .parse()
        .with_context(|| format!("invalid consensus timestamp '{raw}'"))?;

    DateTime::from_timestamp(seconds, nanos)
        .with_context(|| format!("consensus timestamp '{raw}' is out of range"))
}
