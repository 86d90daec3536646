use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EscrowError;
use crate::models::{
    AccountId, ArbiterFee, ArbiterFeeType, ArbiterPanel, Asset, AssetType, Deal, DealId,
    DealStatus,
};

/// A create-deal request as submitted by a caller.
///
/// The buyer is deliberately absent: it is always the signing account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DealProposal {
    pub deal_id: Option<String>,
    pub seller: Option<String>,
    pub arbiter: Option<String>,
    pub arbiters: Option<Vec<String>>,
    pub required_votes: Option<u32>,
    pub amount: Option<i64>,
    pub asset_type: Option<AssetType>,
    pub asset_id: Option<String>,
    pub asset_serial_number: Option<i64>,
    pub arbiter_fee_type: Option<ArbiterFeeType>,
    pub arbiter_fee_amount: Option<Decimal>,
}

/// Creation terms that passed validation. Only [`DealProposal::validate`]
/// produces this type, so the ledger never sees malformed terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealTerms {
    deal_id: DealId,
    buyer: AccountId,
    seller: AccountId,
    panel: ArbiterPanel,
    amount: u64,
    asset: Asset,
    fee: ArbiterFee,
}

impl DealProposal {
    pub fn validate(self, buyer: &AccountId) -> Result<DealTerms, EscrowError> {
        let deal_id = match self.deal_id.as_deref() {
            Some(raw) => DealId::parse(raw)?,
            None => DealId::generate(),
        };

        let seller = self
            .seller
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| EscrowError::validation("seller is required"))
            .and_then(AccountId::parse)?;

        let amount = match self.amount {
            Some(amount) if amount > 0 => amount as u64,
            Some(_) => return Err(EscrowError::validation("amount must be positive")),
            None => return Err(EscrowError::validation("amount is required")),
        };

        let panel = match (self.arbiter.as_deref(), self.arbiters) {
            (Some(_), Some(_)) => {
                return Err(EscrowError::validation(
                    "configure either arbiter or arbiters, not both",
                ));
            }
            (Some(arbiter), None) => {
                if self.required_votes.is_some() {
                    return Err(EscrowError::validation(
                        "requiredVotes only applies to multi-arbiter deals",
                    ));
                }
                ArbiterPanel::Single(AccountId::parse(arbiter)?)
            }
            (None, Some(arbiters)) => {
                let arbiters = arbiters
                    .iter()
                    .map(|raw| AccountId::parse(raw))
                    .collect::<Result<Vec<_>, _>>()?;
                let required_votes = self.required_votes.ok_or_else(|| {
                    EscrowError::validation("requiredVotes is required with arbiters")
                })?;
                ArbiterPanel::multi(arbiters, required_votes)?
            }
            (None, None) => {
                return Err(EscrowError::validation("an arbiter or arbiters is required"));
            }
        };

        if &seller == buyer {
            return Err(EscrowError::validation("seller must differ from buyer"));
        }
        for arbiter in panel.members() {
            if &arbiter == buyer || arbiter == seller {
                return Err(EscrowError::validation(format!(
                    "arbiter {arbiter} must not be the buyer or seller"
                )));
            }
        }

        let asset = Asset::from_parts(
            self.asset_type.unwrap_or(AssetType::Hbar),
            self.asset_id.as_deref(),
            self.asset_serial_number,
        )?;

        let fee = ArbiterFee::from_parts(
            self.arbiter_fee_type.unwrap_or(ArbiterFeeType::None),
            self.arbiter_fee_amount.unwrap_or(Decimal::ZERO),
        )?;

        Ok(DealTerms {
            deal_id,
            buyer: buyer.clone(),
            seller,
            panel,
            amount,
            asset,
            fee,
        })
    }
}

impl DealTerms {
    pub fn deal_id(&self) -> &DealId {
        &self.deal_id
    }

    pub fn buyer(&self) -> &AccountId {
        &self.buyer
    }

    pub fn seller(&self) -> &AccountId {
        &self.seller
    }

    pub fn panel(&self) -> &ArbiterPanel {
        &self.panel
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    pub fn fee(&self) -> &ArbiterFee {
        &self.fee
    }

    /// The freshly created deal record, before any party has accepted.
    pub fn into_deal(self, created_at: DateTime<Utc>) -> Deal {
        Deal {
            deal_id: self.deal_id,
            buyer: self.buyer,
            seller: self.seller,
            panel: self.panel,
            amount: self.amount,
            asset: self.asset,
            fee: self.fee,
            status: DealStatus::Proposed,
            seller_accepted: false,
            arbiter_accepted: false,
            funds_deposited: false,
            evidence_hash: None,
            votes: Vec::new(),
            created_at,
            updated_at: created_at,
        }
    }
}
