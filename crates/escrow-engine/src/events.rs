use escrow_core::{AccountId, Deal, DealStatus, Role};
use serde::{Deserialize, Serialize};

/// Something that happened to a deal after a successful ledger write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DealEvent {
    Created,
    SellerAccepted,
    ArbiterAccepted,
    Funded {
        amount: u64,
    },
    Released,
    DisputeRaised,
    EvidenceSubmitted {
        evidence_hash: String,
    },
    VoteCast {
        arbiter: AccountId,
        release_to_seller: bool,
    },
    Resolved {
        outcome: DealStatus,
    },
}

impl DealEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::SellerAccepted => "seller_accepted",
            Self::ArbiterAccepted => "arbiter_accepted",
            Self::Funded { .. } => "funded",
            Self::Released => "released",
            Self::DisputeRaised => "dispute_raised",
            Self::EvidenceSubmitted { .. } => "evidence_submitted",
            Self::VoteCast { .. } => "vote_cast",
            Self::Resolved { .. } => "resolved",
        }
    }

    /// Roles told about this event.
    pub fn audience(&self) -> &'static [Role] {
        match self {
            Self::Created | Self::Funded { .. } | Self::Released | Self::DisputeRaised => {
                &[Role::Seller, Role::Arbiter]
            }
            Self::SellerAccepted => &[Role::Buyer, Role::Arbiter],
            Self::ArbiterAccepted | Self::VoteCast { .. } => &[Role::Buyer, Role::Seller],
            Self::EvidenceSubmitted { .. } | Self::Resolved { .. } => {
                &[Role::Buyer, Role::Seller, Role::Arbiter]
            }
        }
    }

    pub fn recipients(&self, deal: &Deal) -> Vec<(AccountId, Role)> {
        let mut recipients = Vec::new();
        for role in self.audience() {
            match role {
                Role::Buyer => recipients.push((deal.buyer.clone(), Role::Buyer)),
                Role::Seller => recipients.push((deal.seller.clone(), Role::Seller)),
                Role::Arbiter => recipients.extend(
                    deal.panel
                        .members()
                        .into_iter()
                        .map(|arbiter| (arbiter, Role::Arbiter)),
                ),
            }
        }
        recipients
    }
}
