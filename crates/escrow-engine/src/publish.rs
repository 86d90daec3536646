use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use escrow_core::{Deal, DealMessage, DealRecord, EscrowError, LogAppender, LogEnvelope};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::DealEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusUpdateMode {
    /// One message type per event, carrying the fields it changed.
    #[default]
    Primary,
    /// Creation records plus bare `UPDATE_STATUS` messages, for older consumers.
    Legacy,
}

impl FromStr for StatusUpdateMode {
    type Err = EscrowError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "primary" | "typed" => Ok(Self::Primary),
            "legacy" => Ok(Self::Legacy),
            other => Err(EscrowError::validation(format!(
                "STATUS_UPDATE_MODE must be primary or legacy (got '{other}')"
            ))),
        }
    }
}

impl fmt::Display for StatusUpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Legacy => f.write_str("legacy"),
        }
    }
}

/// Turns a recorded event into the consensus-log message announcing it.
pub trait StatusUpdateStrategy: Send + Sync {
    fn mode(&self) -> StatusUpdateMode;
    fn encode(&self, deal: &Deal, event: &DealEvent) -> DealMessage;
}

pub struct TypedStatusUpdates;

impl StatusUpdateStrategy for TypedStatusUpdates {
    fn mode(&self) -> StatusUpdateMode {
        StatusUpdateMode::Primary
    }

    fn encode(&self, deal: &Deal, event: &DealEvent) -> DealMessage {
        let deal_id = deal.deal_id.clone();
        let status = deal.status;
        match event {
            DealEvent::Created => DealMessage::CreateDeal(DealRecord::from(deal.clone())),
            DealEvent::SellerAccepted => DealMessage::SellerAccepted { deal_id, status },
            DealEvent::ArbiterAccepted => DealMessage::ArbiterAccepted { deal_id, status },
            DealEvent::Funded { amount } => DealMessage::DealFunded {
                deal_id,
                status,
                amount: *amount,
            },
            DealEvent::EvidenceSubmitted { evidence_hash } => DealMessage::EvidenceSubmitted {
                deal_id,
                status,
                evidence_hash: evidence_hash.clone(),
            },
            DealEvent::VoteCast {
                arbiter,
                release_to_seller,
            } => DealMessage::VoteCast {
                deal_id,
                status,
                arbiter: arbiter.clone(),
                release_to_seller: *release_to_seller,
            },
            DealEvent::Released | DealEvent::DisputeRaised | DealEvent::Resolved { .. } => {
                DealMessage::UpdateStatus { deal_id, status }
            }
        }
    }
}

pub struct LegacyStatusUpdates;

impl StatusUpdateStrategy for LegacyStatusUpdates {
    fn mode(&self) -> StatusUpdateMode {
        StatusUpdateMode::Legacy
    }

    fn encode(&self, deal: &Deal, event: &DealEvent) -> DealMessage {
        match event {
            DealEvent::Created => DealMessage::CreateDeal(DealRecord::from(deal.clone())),
            _ => DealMessage::UpdateStatus {
                deal_id: deal.deal_id.clone(),
                status: deal.status,
            },
        }
    }
}

pub fn strategy_for(mode: StatusUpdateMode) -> Arc<dyn StatusUpdateStrategy> {
    match mode {
        StatusUpdateMode::Primary => Arc::new(TypedStatusUpdates),
        StatusUpdateMode::Legacy => Arc::new(LegacyStatusUpdates),
    }
}

/// Appends deal announcements to the consensus log.
#[derive(Clone)]
pub struct LogPublisher {
    appender: Arc<dyn LogAppender>,
    strategy: Arc<dyn StatusUpdateStrategy>,
}

impl LogPublisher {
    pub fn new(appender: Arc<dyn LogAppender>, mode: StatusUpdateMode) -> Self {
        Self {
            appender,
            strategy: strategy_for(mode),
        }
    }

    pub fn mode(&self) -> StatusUpdateMode {
        self.strategy.mode()
    }

    pub async fn publish(&self, deal: &Deal, event: &DealEvent) -> Result<LogEnvelope> {
        let message = self.strategy.encode(deal, event);
        let envelope = self.appender.append(&message).await?;
        debug!(
            deal_id = %deal.deal_id,
            kind = message.kind(),
            sequence = envelope.sequence,
            "published deal message"
        );
        Ok(envelope)
    }
}
