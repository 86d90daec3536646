use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use escrow_core::machine::{self, Command};
use escrow_core::{
    AccountId, Deal, DealId, DealStatus, DealTerms, EscrowError, FundingRoute, LedgerClient,
    LedgerError, Reputation, Role, TxReceipt, VotingStatus,
};
use tokio::sync::RwLock;
use tracing::debug;

/// Local stand-in for the escrow contract.
///
/// Applies the same state machine the engine pre-checks with, but as the
/// final authority: it holds deal records, enforces every guard and keeps
/// per-role reputation counters.
pub struct InMemoryLedger {
    deals: RwLock<HashMap<DealId, Deal>>,
    reputation: RwLock<HashMap<(AccountId, Role), Reputation>>,
    transaction_counter: AtomicU64,
    enumeration: bool,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            deals: RwLock::new(HashMap::new()),
            reputation: RwLock::new(HashMap::new()),
            transaction_counter: AtomicU64::new(0),
            enumeration: true,
        }
    }

    /// A contract without native enumeration, like most deployed ones.
    pub fn without_enumeration() -> Self {
        Self {
            enumeration: false,
            ..Self::new()
        }
    }

    fn receipt(&self, signer: &AccountId, at: DateTime<Utc>) -> TxReceipt {
        let nonce = self.transaction_counter.fetch_add(1, Ordering::Relaxed);
        TxReceipt {
            transaction_id: format!(
                "{signer}@{}.{:09}-{nonce}",
                at.timestamp(),
                at.timestamp_subsec_nanos()
            ),
            status: "SUCCESS".to_string(),
            consensus_at: at,
        }
    }

    async fn execute(
        &self,
        deal_id: &DealId,
        actor: &AccountId,
        command: Command,
    ) -> Result<TxReceipt, LedgerError> {
        let at = Utc::now();
        let mut deals = self.deals.write().await;
        let current = deals
            .get(deal_id)
            .ok_or_else(|| LedgerError::rejected("DEAL_NOT_FOUND"))?;

        let transition = machine::apply(current, actor, &command, at).map_err(revert)?;
        if transition.changed {
            let previous_status = current.status;
            self.record_reputation(previous_status, &transition.deal)
                .await;
            deals.insert(deal_id.clone(), transition.deal);
        } else {
            debug!(%deal_id, command = command.name(), "repeat call left deal unchanged");
        }

        Ok(self.receipt(actor, at))
    }

    async fn record_reputation(&self, previous: DealStatus, deal: &Deal) {
        if previous == deal.status {
            return;
        }
        let mut reputation = self.reputation.write().await;
        let mut bump = |account: &AccountId, role: Role, update: fn(&mut Reputation)| {
            let entry = reputation
                .entry((account.clone(), role))
                .or_insert_with(|| Reputation::empty(account.clone(), role));
            update(entry);
        };

        match deal.status {
            DealStatus::Disputed => {
                bump(&deal.buyer, Role::Buyer, |r| r.disputed_deals += 1);
                bump(&deal.seller, Role::Seller, |r| r.disputed_deals += 1);
                for arbiter in deal.panel.members() {
                    bump(&arbiter, Role::Arbiter, |r| r.disputed_deals += 1);
                }
            }
            DealStatus::SellerPaid | DealStatus::BuyerRefunded => {
                let refunded = deal.status == DealStatus::BuyerRefunded;
                for (account, role) in [(&deal.buyer, Role::Buyer), (&deal.seller, Role::Seller)] {
                    bump(account, role, |r| r.completed_deals += 1);
                    if refunded {
                        bump(account, role, |r| r.refunded_deals += 1);
                    }
                }
                if previous == DealStatus::Disputed {
                    for arbiter in deal.panel.members() {
                        bump(&arbiter, Role::Arbiter, |r| r.completed_deals += 1);
                    }
                }
            }
            _ => {}
        }
    }
}

fn revert(err: EscrowError) -> LedgerError {
    let code = match &err {
        EscrowError::Validation(_) => "INVALID_ARGUMENT",
        EscrowError::Authorization(_) => "UNAUTHORIZED_CALLER",
        EscrowError::StateConflict(_) => "INVALID_DEAL_STATE",
        EscrowError::NotFound(_) => "DEAL_NOT_FOUND",
        EscrowError::LedgerFailure(_) | EscrowError::TransientIo(_) => "CONTRACT_REVERT_EXECUTED",
    };
    LedgerError::rejected(format!("{code}: {err}"))
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn create_deal(
        &self,
        terms: &DealTerms,
        signer: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        if terms.buyer() != signer {
            return Err(LedgerError::rejected(
                "UNAUTHORIZED_CALLER: buyer must sign the creation",
            ));
        }

        let at = Utc::now();
        let mut deals = self.deals.write().await;
        if deals.contains_key(terms.deal_id()) {
            return Err(LedgerError::rejected("DEAL_ALREADY_EXISTS"));
        }
        let deal = terms.clone().into_deal(at);

        {
            let mut reputation = self.reputation.write().await;
            let mut parties = vec![(deal.buyer.clone(), Role::Buyer), (deal.seller.clone(), Role::Seller)];
            parties.extend(deal.panel.members().into_iter().map(|a| (a, Role::Arbiter)));
            for (account, role) in parties {
                reputation
                    .entry((account.clone(), role))
                    .or_insert_with(|| Reputation::empty(account, role))
                    .total_deals += 1;
            }
        }

        deals.insert(deal.deal_id.clone(), deal);
        Ok(self.receipt(signer, at))
    }

    async fn accept_as_seller(
        &self,
        deal_id: &DealId,
        seller: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.execute(deal_id, seller, Command::AcceptAsSeller).await
    }

    async fn accept_as_arbiter(
        &self,
        deal_id: &DealId,
        arbiter: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.execute(deal_id, arbiter, Command::AcceptAsArbiter).await
    }

    async fn fund_deal(
        &self,
        deal_id: &DealId,
        route: &FundingRoute,
        buyer: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        let amount = {
            let deals = self.deals.read().await;
            let deal = deals
                .get(deal_id)
                .ok_or_else(|| LedgerError::rejected("DEAL_NOT_FOUND"))?;
            let amount = route.amount().unwrap_or(deal.amount);
            if &FundingRoute::for_deal(deal, amount) != route {
                return Err(LedgerError::rejected(
                    "INVALID_FUNDING_ROUTE: asset does not match the deal",
                ));
            }
            amount
        };

        self.execute(deal_id, buyer, Command::Fund { amount }).await
    }

    async fn release_funds(
        &self,
        deal_id: &DealId,
        buyer: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.execute(deal_id, buyer, Command::Release).await
    }

    async fn dispute(
        &self,
        deal_id: &DealId,
        buyer: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.execute(deal_id, buyer, Command::Dispute).await
    }

    async fn submit_evidence(
        &self,
        deal_id: &DealId,
        evidence_hash: &str,
        submitter: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.execute(
            deal_id,
            submitter,
            Command::SubmitEvidence {
                evidence_hash: evidence_hash.to_string(),
            },
        )
        .await
    }

    async fn vote_on_dispute(
        &self,
        deal_id: &DealId,
        release_to_seller: bool,
        arbiter: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.execute(deal_id, arbiter, Command::Vote { release_to_seller })
            .await
    }

    async fn refund_buyer(
        &self,
        deal_id: &DealId,
        arbiter: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.execute(deal_id, arbiter, Command::RefundBuyer).await
    }

    async fn get_deal(&self, deal_id: &DealId) -> Result<Option<Deal>, LedgerError> {
        let deals = self.deals.read().await;
        Ok(deals.get(deal_id).cloned())
    }

    async fn list_deal_ids(&self) -> Result<Vec<DealId>, LedgerError> {
        if !self.enumeration {
            return Err(LedgerError::Unsupported("deal enumeration"));
        }
        let deals = self.deals.read().await;
        Ok(deals.keys().cloned().collect())
    }

    async fn get_voting_status(
        &self,
        deal_id: &DealId,
    ) -> Result<Option<VotingStatus>, LedgerError> {
        let deals = self.deals.read().await;
        Ok(deals.get(deal_id).map(VotingStatus::from_deal))
    }

    async fn get_reputation(
        &self,
        account: &AccountId,
        role: Role,
    ) -> Result<Reputation, LedgerError> {
        let reputation = self.reputation.read().await;
        Ok(reputation
            .get(&(account.clone(), role))
            .cloned()
            .unwrap_or_else(|| Reputation::empty(account.clone(), role)))
    }
}
