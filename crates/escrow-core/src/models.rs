use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EscrowError;
use crate::fees::arbiter_fee;

const MAX_DEAL_ID_LEN: usize = 128;

/// Ledger account identifier: `shard.realm.num` or a 0x-prefixed EVM address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    pub fn parse(value: &str) -> Result<Self, EscrowError> {
        let trimmed = value.trim();
        if is_entity_id(trimmed) || is_evm_address(trimmed) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(EscrowError::validation(format!(
                "'{value}' is not a valid account id"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_entity_id(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

fn is_evm_address(value: &str) -> bool {
    value
        .strip_prefix("0x")
        .is_some_and(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

impl TryFrom<String> for AccountId {
    type Error = EscrowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AccountId> for String {
    fn from(value: AccountId) -> Self {
        value.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DealId(String);

impl DealId {
    pub fn parse(value: &str) -> Result<Self, EscrowError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(EscrowError::validation("dealId must not be empty"));
        }
        if trimmed.len() > MAX_DEAL_ID_LEN {
            return Err(EscrowError::validation(format!(
                "dealId must be at most {MAX_DEAL_ID_LEN} characters"
            )));
        }
        if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(EscrowError::validation("dealId must not contain whitespace"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DealId {
    type Error = EscrowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DealId> for String {
    fn from(value: DealId) -> Self {
        value.0
    }
}

impl fmt::Display for DealId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DealStatus {
    Proposed,
    PendingFunds,
    Pending,
    Disputed,
    SellerPaid,
    BuyerRefunded,
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "PROPOSED",
            Self::PendingFunds => "PENDING_FUNDS",
            Self::Pending => "PENDING",
            Self::Disputed => "DISPUTED",
            Self::SellerPaid => "SELLER_PAID",
            Self::BuyerRefunded => "BUYER_REFUNDED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SellerPaid | Self::BuyerRefunded)
    }
}

impl FromStr for DealStatus {
    type Err = EscrowError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PROPOSED" => Ok(Self::Proposed),
            "PENDING_FUNDS" => Ok(Self::PendingFunds),
            "PENDING" => Ok(Self::Pending),
            "DISPUTED" => Ok(Self::Disputed),
            "SELLER_PAID" => Ok(Self::SellerPaid),
            "BUYER_REFUNDED" => Ok(Self::BuyerRefunded),
            other => Err(EscrowError::validation(format!(
                "unsupported deal status: {other}"
            ))),
        }
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Buyer,
    Seller,
    Arbiter,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buyer => "buyer",
            Self::Seller => "seller",
            Self::Arbiter => "arbiter",
        }
    }
}

impl FromStr for Role {
    type Err = EscrowError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "buyer" => Ok(Self::Buyer),
            "seller" => Ok(Self::Seller),
            "arbiter" => Ok(Self::Arbiter),
            other => Err(EscrowError::validation(format!(
                "role must be buyer, seller, or arbiter (got '{other}')"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetType {
    Hbar,
    FungibleToken,
    Nft,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hbar => "HBAR",
            Self::FungibleToken => "FUNGIBLE_TOKEN",
            Self::Nft => "NFT",
        }
    }
}

impl FromStr for AssetType {
    type Err = EscrowError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "HBAR" => Ok(Self::Hbar),
            "FUNGIBLE_TOKEN" => Ok(Self::FungibleToken),
            "NFT" => Ok(Self::Nft),
            other => Err(EscrowError::validation(format!(
                "assetType must be HBAR, FUNGIBLE_TOKEN, or NFT (got '{other}')"
            ))),
        }
    }
}

/// What is held in escrow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Asset {
    Hbar,
    FungibleToken { token_id: String },
    Nft { token_id: String, serial_number: i64 },
}

impl Asset {
    pub fn asset_type(&self) -> AssetType {
        match self {
            Self::Hbar => AssetType::Hbar,
            Self::FungibleToken { .. } => AssetType::FungibleToken,
            Self::Nft { .. } => AssetType::Nft,
        }
    }

    pub fn token_id(&self) -> Option<&str> {
        match self {
            Self::Hbar => None,
            Self::FungibleToken { token_id } | Self::Nft { token_id, .. } => Some(token_id),
        }
    }

    pub fn serial_number(&self) -> Option<i64> {
        match self {
            Self::Nft { serial_number, .. } => Some(*serial_number),
            _ => None,
        }
    }

    pub fn from_parts(
        asset_type: AssetType,
        asset_id: Option<&str>,
        serial_number: Option<i64>,
    ) -> Result<Self, EscrowError> {
        let token_id = || {
            asset_id
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    EscrowError::validation(format!(
                        "assetId is required for {} deals",
                        asset_type.as_str()
                    ))
                })
        };

        match asset_type {
            AssetType::Hbar => Ok(Self::Hbar),
            AssetType::FungibleToken => Ok(Self::FungibleToken {
                token_id: token_id()?,
            }),
            AssetType::Nft => {
                let serial_number = serial_number
                    .filter(|serial| *serial > 0)
                    .ok_or_else(|| {
                        EscrowError::validation("a positive assetSerialNumber is required for NFT deals")
                    })?;
                Ok(Self::Nft {
                    token_id: token_id()?,
                    serial_number,
                })
            }
        }
    }
}

/// Who resolves disputes. Exactly one configuration exists per deal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArbiterPanel {
    Single(AccountId),
    Multi {
        arbiters: Vec<AccountId>,
        required_votes: u32,
    },
}

impl ArbiterPanel {
    pub fn multi(arbiters: Vec<AccountId>, required_votes: u32) -> Result<Self, EscrowError> {
        if arbiters.is_empty() {
            return Err(EscrowError::validation("arbiters must not be empty"));
        }
        for (index, arbiter) in arbiters.iter().enumerate() {
            if arbiters[..index].contains(arbiter) {
                return Err(EscrowError::validation(format!(
                    "arbiter {arbiter} is listed more than once"
                )));
            }
        }
        if required_votes == 0 || required_votes as usize > arbiters.len() {
            return Err(EscrowError::validation(format!(
                "requiredVotes must be between 1 and {}",
                arbiters.len()
            )));
        }

        Ok(Self::Multi {
            arbiters,
            required_votes,
        })
    }

    pub fn contains(&self, account: &AccountId) -> bool {
        match self {
            Self::Single(arbiter) => arbiter == account,
            Self::Multi { arbiters, .. } => arbiters.contains(account),
        }
    }

    pub fn members(&self) -> Vec<AccountId> {
        match self {
            Self::Single(arbiter) => vec![arbiter.clone()],
            Self::Multi { arbiters, .. } => arbiters.clone(),
        }
    }

    pub fn required_votes(&self) -> u32 {
        match self {
            Self::Single(_) => 1,
            Self::Multi { required_votes, .. } => *required_votes,
        }
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, Self::Multi { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArbiterFeeType {
    None,
    Percentage,
    Flat,
}

impl ArbiterFeeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Percentage => "percentage",
            Self::Flat => "flat",
        }
    }
}

impl FromStr for ArbiterFeeType {
    type Err = EscrowError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "percentage" => Ok(Self::Percentage),
            "flat" => Ok(Self::Flat),
            other => Err(EscrowError::validation(format!(
                "arbiterFeeType must be none, percentage, or flat (got '{other}')"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterFee {
    None,
    /// Percent of the deal amount, within [0, 100].
    Percentage(Decimal),
    /// Fixed amount in the smallest unit of the deal asset.
    Flat(u64),
}

impl ArbiterFee {
    pub fn from_parts(fee_type: ArbiterFeeType, amount: Decimal) -> Result<Self, EscrowError> {
        match fee_type {
            ArbiterFeeType::None if amount.is_zero() => Ok(Self::None),
            ArbiterFeeType::None => Err(EscrowError::validation(
                "arbiterFeeAmount requires arbiterFeeType percentage or flat",
            )),
            ArbiterFeeType::Percentage => {
                if amount < Decimal::ZERO || amount > Decimal::ONE_HUNDRED {
                    return Err(EscrowError::validation(
                        "percentage arbiterFeeAmount must be between 0 and 100",
                    ));
                }
                Ok(Self::Percentage(amount))
            }
            ArbiterFeeType::Flat => {
                if amount < Decimal::ZERO || !amount.fract().is_zero() {
                    return Err(EscrowError::validation(
                        "flat arbiterFeeAmount must be a non-negative whole amount",
                    ));
                }
                let flat = u64::try_from(amount).map_err(|_| {
                    EscrowError::validation("flat arbiterFeeAmount is out of range")
                })?;
                Ok(Self::Flat(flat))
            }
        }
    }

    pub fn fee_type(&self) -> ArbiterFeeType {
        match self {
            Self::None => ArbiterFeeType::None,
            Self::Percentage(_) => ArbiterFeeType::Percentage,
            Self::Flat(_) => ArbiterFeeType::Flat,
        }
    }

    pub fn amount(&self) -> Decimal {
        match self {
            Self::None => Decimal::ZERO,
            Self::Percentage(pct) => *pct,
            Self::Flat(flat) => Decimal::from(*flat),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub arbiter: AccountId,
    pub release_to_seller: bool,
}

/// The shared record of an escrow deal, as last known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "DealRecord", try_from = "DealRecord")]
pub struct Deal {
    pub deal_id: DealId,
    pub buyer: AccountId,
    pub seller: AccountId,
    pub panel: ArbiterPanel,
    pub amount: u64,
    pub asset: Asset,
    pub fee: ArbiterFee,
    pub status: DealStatus,
    pub seller_accepted: bool,
    pub arbiter_accepted: bool,
    pub funds_deposited: bool,
    pub evidence_hash: Option<String>,
    pub votes: Vec<Vote>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    pub fn seller_vote_count(&self) -> u32 {
        self.votes.iter().filter(|vote| vote.release_to_seller).count() as u32
    }

    pub fn buyer_vote_count(&self) -> u32 {
        self.votes.iter().filter(|vote| !vote.release_to_seller).count() as u32
    }

    pub fn has_voted(&self, arbiter: &AccountId) -> bool {
        self.votes.iter().any(|vote| &vote.arbiter == arbiter)
    }

    pub fn is_party(&self, account: &AccountId) -> bool {
        &self.buyer == account || &self.seller == account || self.panel.contains(account)
    }

    pub fn holds_role(&self, account: &AccountId, role: Role) -> bool {
        match role {
            Role::Buyer => &self.buyer == account,
            Role::Seller => &self.seller == account,
            Role::Arbiter => self.panel.contains(account),
        }
    }

    /// Fee the arbiter receives when the buyer is refunded.
    pub fn arbiter_fee(&self) -> u64 {
        arbiter_fee(self.amount, &self.fee)
    }
}

/// Flat wire form of a [`Deal`], shared by the ledger RPC, the consensus log
/// and the HTTP API. Deserialization is strict: unknown fields and tallies
/// that disagree with the vote records are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DealRecord {
    pub deal_id: DealId,
    pub buyer: AccountId,
    pub seller: AccountId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arbiter: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arbiters: Vec<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_votes: Option<u32>,
    pub amount: u64,
    pub asset_type: AssetType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_serial_number: Option<i64>,
    pub arbiter_fee_type: ArbiterFeeType,
    #[serde(default)]
    pub arbiter_fee_amount: Decimal,
    pub status: DealStatus,
    #[serde(default)]
    pub seller_accepted: bool,
    #[serde(default)]
    pub arbiter_accepted: bool,
    #[serde(default)]
    pub funds_deposited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_hash: Option<String>,
    #[serde(default)]
    pub votes: Vec<Vote>,
    #[serde(default)]
    pub seller_vote_count: u32,
    #[serde(default)]
    pub buyer_vote_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<Deal> for DealRecord {
    fn from(deal: Deal) -> Self {
        let seller_vote_count = deal.seller_vote_count();
        let buyer_vote_count = deal.buyer_vote_count();
        let (arbiter, arbiters, required_votes) = match deal.panel {
            ArbiterPanel::Single(arbiter) => (Some(arbiter), Vec::new(), None),
            ArbiterPanel::Multi {
                arbiters,
                required_votes,
            } => (None, arbiters, Some(required_votes)),
        };

        Self {
            deal_id: deal.deal_id,
            buyer: deal.buyer,
            seller: deal.seller,
            arbiter,
            arbiters,
            required_votes,
            amount: deal.amount,
            asset_type: deal.asset.asset_type(),
            asset_id: deal.asset.token_id().map(str::to_string),
            asset_serial_number: deal.asset.serial_number(),
            arbiter_fee_type: deal.fee.fee_type(),
            arbiter_fee_amount: deal.fee.amount(),
            status: deal.status,
            seller_accepted: deal.seller_accepted,
            arbiter_accepted: deal.arbiter_accepted,
            funds_deposited: deal.funds_deposited,
            evidence_hash: deal.evidence_hash,
            votes: deal.votes,
            seller_vote_count,
            buyer_vote_count,
            created_at: deal.created_at,
            updated_at: Some(deal.updated_at),
        }
    }
}

impl TryFrom<DealRecord> for Deal {
    type Error = EscrowError;

    fn try_from(record: DealRecord) -> Result<Self, Self::Error> {
        let panel = match (record.arbiter, record.arbiters.is_empty()) {
            (Some(_), false) => {
                return Err(EscrowError::validation(
                    "deal configures both arbiter and arbiters",
                ));
            }
            (Some(arbiter), true) => {
                if record.required_votes.is_some() {
                    return Err(EscrowError::validation(
                        "requiredVotes only applies to multi-arbiter deals",
                    ));
                }
                ArbiterPanel::Single(arbiter)
            }
            (None, false) => {
                let required_votes = record.required_votes.ok_or_else(|| {
                    EscrowError::validation("requiredVotes is required with arbiters")
                })?;
                ArbiterPanel::multi(record.arbiters, required_votes)?
            }
            (None, true) => {
                return Err(EscrowError::validation("deal has no arbiter configured"));
            }
        };

        let deal = Deal {
            deal_id: record.deal_id,
            buyer: record.buyer,
            seller: record.seller,
            panel,
            amount: record.amount,
            asset: Asset::from_parts(
                record.asset_type,
                record.asset_id.as_deref(),
                record.asset_serial_number,
            )?,
            fee: ArbiterFee::from_parts(record.arbiter_fee_type, record.arbiter_fee_amount)?,
            status: record.status,
            seller_accepted: record.seller_accepted,
            arbiter_accepted: record.arbiter_accepted,
            funds_deposited: record.funds_deposited,
            evidence_hash: record.evidence_hash,
            votes: record.votes,
            created_at: record.created_at,
            updated_at: record.updated_at.unwrap_or(record.created_at),
        };

        for vote in &deal.votes {
            if !deal.panel.contains(&vote.arbiter) {
                return Err(EscrowError::validation(format!(
                    "vote recorded for non-arbiter {}",
                    vote.arbiter
                )));
            }
        }
        let reported_tallies = record.seller_vote_count != 0 || record.buyer_vote_count != 0;
        if reported_tallies
            && (record.seller_vote_count != deal.seller_vote_count()
                || record.buyer_vote_count != deal.buyer_vote_count())
        {
            return Err(EscrowError::validation(
                "vote tallies disagree with recorded votes",
            ));
        }

        Ok(deal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotingStatus {
    pub deal_id: DealId,
    pub arbiters: Vec<AccountId>,
    pub required_votes: u32,
    pub seller_vote_count: u32,
    pub buyer_vote_count: u32,
    pub votes: Vec<Vote>,
    pub resolved: bool,
    pub outcome: Option<DealStatus>,
}

impl VotingStatus {
    pub fn from_deal(deal: &Deal) -> Self {
        Self {
            deal_id: deal.deal_id.clone(),
            arbiters: deal.panel.members(),
            required_votes: deal.panel.required_votes(),
            seller_vote_count: deal.seller_vote_count(),
            buyer_vote_count: deal.buyer_vote_count(),
            votes: deal.votes.clone(),
            resolved: deal.status.is_terminal(),
            outcome: deal.status.is_terminal().then_some(deal.status),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reputation {
    pub account_id: AccountId,
    pub role: Role,
    pub total_deals: u64,
    pub completed_deals: u64,
    pub disputed_deals: u64,
    pub refunded_deals: u64,
}

impl Reputation {
    pub fn empty(account_id: AccountId, role: Role) -> Self {
        Self {
            account_id,
            role,
            total_deals: 0,
            completed_deals: 0,
            disputed_deals: 0,
            refunded_deals: 0,
        }
    }
}

/// Confirmation of a successful ledger write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub transaction_id: String,
    pub status: String,
    pub consensus_at: DateTime<Utc>,
}

/// Asset-specific funding operation for a deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "route", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FundingRoute {
    Native { amount: u64 },
    FungibleToken { token_id: String, amount: u64 },
    Nft { token_id: String, serial_number: i64 },
}

impl FundingRoute {
    pub fn for_deal(deal: &Deal, amount: u64) -> Self {
        match &deal.asset {
            Asset::Hbar => Self::Native { amount },
            Asset::FungibleToken { token_id } => Self::FungibleToken {
                token_id: token_id.clone(),
                amount,
            },
            Asset::Nft {
                token_id,
                serial_number,
            } => Self::Nft {
                token_id: token_id.clone(),
                serial_number: *serial_number,
            },
        }
    }

    /// Transferred quantity; an NFT route moves exactly the deal's unit.
    pub fn amount(&self) -> Option<u64> {
        match self {
            Self::Native { amount } | Self::FungibleToken { amount, .. } => Some(*amount),
            Self::Nft { .. } => None,
        }
    }
}

/// How escrowed funds were distributed when a deal reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub outcome: DealStatus,
    pub seller_payout: u64,
    pub buyer_refund: u64,
    pub arbiter_fee: u64,
    pub fee_recipient: Option<AccountId>,
}
