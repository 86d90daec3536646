use async_trait::async_trait;

use crate::error::LedgerError;
use crate::events::{DealMessage, LogEnvelope};
use crate::models::{
    AccountId, Deal, DealId, FundingRoute, Reputation, Role, TxReceipt, VotingStatus,
};
use crate::terms::DealTerms;

/// The authoritative escrow contract. Every successful write is the state
/// transition itself.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn create_deal(&self, terms: &DealTerms, signer: &AccountId)
    -> Result<TxReceipt, LedgerError>;
    async fn accept_as_seller(
        &self,
        deal_id: &DealId,
        seller: &AccountId,
    ) -> Result<TxReceipt, LedgerError>;
    async fn accept_as_arbiter(
        &self,
        deal_id: &DealId,
        arbiter: &AccountId,
    ) -> Result<TxReceipt, LedgerError>;
    async fn fund_deal(
        &self,
        deal_id: &DealId,
        route: &FundingRoute,
        buyer: &AccountId,
    ) -> Result<TxReceipt, LedgerError>;
    async fn release_funds(
        &self,
        deal_id: &DealId,
        buyer: &AccountId,
    ) -> Result<TxReceipt, LedgerError>;
    async fn dispute(&self, deal_id: &DealId, buyer: &AccountId)
    -> Result<TxReceipt, LedgerError>;
    async fn submit_evidence(
        &self,
        deal_id: &DealId,
        evidence_hash: &str,
        submitter: &AccountId,
    ) -> Result<TxReceipt, LedgerError>;
    async fn vote_on_dispute(
        &self,
        deal_id: &DealId,
        release_to_seller: bool,
        arbiter: &AccountId,
    ) -> Result<TxReceipt, LedgerError>;
    async fn refund_buyer(
        &self,
        deal_id: &DealId,
        arbiter: &AccountId,
    ) -> Result<TxReceipt, LedgerError>;

    async fn get_deal(&self, deal_id: &DealId) -> Result<Option<Deal>, LedgerError>;
    /// Native enumeration; `LedgerError::Unsupported` when the contract has none.
    async fn list_deal_ids(&self) -> Result<Vec<DealId>, LedgerError>;
    async fn get_voting_status(&self, deal_id: &DealId)
    -> Result<Option<VotingStatus>, LedgerError>;
    async fn get_reputation(
        &self,
        account: &AccountId,
        role: Role,
    ) -> Result<Reputation, LedgerError>;
}

#[async_trait]
pub trait LogReader: Send + Sync {
    /// Entries with a sequence number greater than `after_sequence`, oldest first.
    async fn read_after(&self, after_sequence: u64, limit: usize)
    -> anyhow::Result<Vec<LogEnvelope>>;
}

#[async_trait]
pub trait LogAppender: Send + Sync {
    async fn append(&self, message: &DealMessage) -> anyhow::Result<LogEnvelope>;
}

/// Denormalized, non-authoritative deal mirror keyed by deal id.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn upsert(&self, deal: &Deal) -> anyhow::Result<()>;
    async fn get(&self, deal_id: &DealId) -> anyhow::Result<Option<Deal>>;
    /// All cached deals, newest first.
    async fn list(&self) -> anyhow::Result<Vec<Deal>>;
    async fn deal_ids(&self) -> anyhow::Result<Vec<DealId>>;
}
