use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AccountId, DealId, DealRecord, DealStatus};

/// A message on the consensus log, encoded as `{"type": ..., "dealId": ..., ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum DealMessage {
    CreateDeal(DealRecord),
    UpdateStatus {
        deal_id: DealId,
        status: DealStatus,
    },
    SellerAccepted {
        deal_id: DealId,
        status: DealStatus,
    },
    ArbiterAccepted {
        deal_id: DealId,
        status: DealStatus,
    },
    DealFunded {
        deal_id: DealId,
        status: DealStatus,
        amount: u64,
    },
    EvidenceSubmitted {
        deal_id: DealId,
        status: DealStatus,
        evidence_hash: String,
    },
    VoteCast {
        deal_id: DealId,
        status: DealStatus,
        arbiter: AccountId,
        release_to_seller: bool,
    },
}

impl DealMessage {
    pub fn deal_id(&self) -> &DealId {
        match self {
            Self::CreateDeal(record) => &record.deal_id,
            Self::UpdateStatus { deal_id, .. }
            | Self::SellerAccepted { deal_id, .. }
            | Self::ArbiterAccepted { deal_id, .. }
            | Self::DealFunded { deal_id, .. }
            | Self::EvidenceSubmitted { deal_id, .. }
            | Self::VoteCast { deal_id, .. } => deal_id,
        }
    }

    pub fn status(&self) -> DealStatus {
        match self {
            Self::CreateDeal(record) => record.status,
            Self::UpdateStatus { status, .. }
            | Self::SellerAccepted { status, .. }
            | Self::ArbiterAccepted { status, .. }
            | Self::DealFunded { status, .. }
            | Self::EvidenceSubmitted { status, .. }
            | Self::VoteCast { status, .. } => *status,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateDeal(_) => "CREATE_DEAL",
            Self::UpdateStatus { .. } => "UPDATE_STATUS",
            Self::SellerAccepted { .. } => "SELLER_ACCEPTED",
            Self::ArbiterAccepted { .. } => "ARBITER_ACCEPTED",
            Self::DealFunded { .. } => "DEAL_FUNDED",
            Self::EvidenceSubmitted { .. } => "EVIDENCE_SUBMITTED",
            Self::VoteCast { .. } => "VOTE_CAST",
        }
    }
}

/// A raw entry read back from the consensus log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEnvelope {
    pub sequence: u64,
    pub consensus_timestamp: DateTime<Utc>,
    pub payload: String,
}

impl LogEnvelope {
    pub fn decode(&self) -> Result<DealMessage, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_update_uses_type_tag_and_camel_case() {
        let message = DealMessage::UpdateStatus {
            deal_id: DealId::parse("deal-9").unwrap(),
            status: DealStatus::Disputed,
        };
        let encoded = serde_json::to_value(&message).unwrap();

        assert_eq!(
            encoded,
            serde_json::json!({ "type": "UPDATE_STATUS", "dealId": "deal-9", "status": "DISPUTED" })
        );
    }

    #[test]
    fn create_deal_carries_the_full_record() {
        let raw = r#"{
            "type": "CREATE_DEAL",
            "dealId": "deal-3",
            "buyer": "0.0.1",
            "seller": "0.0.2",
            "arbiter": "0.0.3",
            "amount": 100,
            "assetType": "HBAR",
            "arbiterFeeType": "flat",
            "arbiterFeeAmount": "10",
            "status": "PROPOSED",
            "createdAt": "2024-02-01T00:00:00Z"
        }"#;

        let message: DealMessage = serde_json::from_str(raw).expect("message should decode");
        assert_eq!(message.kind(), "CREATE_DEAL");
        assert_eq!(message.deal_id().as_str(), "deal-3");
        assert_eq!(message.status(), DealStatus::Proposed);
    }

    #[test]
    fn unknown_type_is_an_error() {
        let envelope = LogEnvelope {
            sequence: 1,
            consensus_timestamp: Utc::now(),
            payload: r#"{"type":"TRANSFER","dealId":"x"}"#.to_string(),
        };
        assert!(envelope.decode().is_err());
    }
}
