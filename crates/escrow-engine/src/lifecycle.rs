use std::sync::Arc;

use chrono::Utc;
use escrow_core::machine::{self, Command};
use escrow_core::{
    AccountId, Deal, DealId, DealProposal, DealStatus, EscrowError, FundingRoute, LedgerError,
    Reputation, Resolution, Role, TxReceipt, VotingStatus,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::events::DealEvent;
use crate::reconciler::{DealListing, LedgerView, ReconciledDeal, Reconciler};

/// How a pre-check treats a ledger read that failed transiently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precheck {
    /// Surface the failure to the caller.
    Strict,
    /// Issue the write anyway; the ledger enforces its own guards.
    Advisory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionOutcome {
    pub deal_id: DealId,
    /// Absent when the request was a repeat that needed no ledger write.
    pub transaction_id: Option<String>,
    pub status: Option<DealStatus>,
    pub resolution: Option<Resolution>,
    pub deal: Option<Deal>,
}

impl TransitionOutcome {
    fn unchanged(deal: Deal) -> Self {
        Self {
            deal_id: deal.deal_id.clone(),
            transaction_id: None,
            status: Some(deal.status),
            resolution: None,
            deal: Some(deal),
        }
    }

    fn written(
        deal_id: DealId,
        receipt: TxReceipt,
        deal: Option<Deal>,
        resolution: Option<Resolution>,
    ) -> Self {
        Self {
            deal_id,
            transaction_id: Some(receipt.transaction_id),
            status: deal.as_ref().map(|deal| deal.status),
            resolution,
            deal,
        }
    }
}

/// Validates lifecycle requests against the reconciled view of a deal,
/// issues the ledger write and hands follow-up work to the reconciler and
/// the dispatcher.
#[derive(Clone)]
pub struct DealEngine {
    reconciler: Arc<Reconciler>,
    dispatcher: Option<Dispatcher>,
}

impl DealEngine {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            dispatcher: None,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub async fn create_deal(
        &self,
        buyer: &AccountId,
        proposal: DealProposal,
    ) -> Result<TransitionOutcome, EscrowError> {
        let terms = proposal.validate(buyer)?;
        let deal_id = terms.deal_id().clone();

        let receipt = self
            .reconciler
            .ledger_call(self.reconciler.ledger().create_deal(&terms, buyer))
            .await?;
        info!(%deal_id, %buyer, transaction_id = %receipt.transaction_id, "deal created");

        let expected = terms.into_deal(receipt.consensus_at);
        let event = DealEvent::Created;
        let deal = self
            .reconciler
            .record_transition(&deal_id, Some(expected), &event)
            .await;
        if let Some(deal) = &deal {
            self.notify(event, deal);
        }

        Ok(TransitionOutcome::written(deal_id, receipt, deal, None))
    }

    pub async fn accept_as_seller(
        &self,
        deal_id: &DealId,
        actor: &AccountId,
    ) -> Result<TransitionOutcome, EscrowError> {
        self.transition(deal_id, actor, Command::AcceptAsSeller, Precheck::Strict)
            .await
    }

    pub async fn accept_as_arbiter(
        &self,
        deal_id: &DealId,
        actor: &AccountId,
    ) -> Result<TransitionOutcome, EscrowError> {
        self.transition(deal_id, actor, Command::AcceptAsArbiter, Precheck::Strict)
            .await
    }

    pub async fn fund_deal(
        &self,
        deal_id: &DealId,
        actor: &AccountId,
        amount: u64,
    ) -> Result<TransitionOutcome, EscrowError> {
        if amount == 0 {
            return Err(EscrowError::validation("funding amount must be positive"));
        }
        self.transition(deal_id, actor, Command::Fund { amount }, Precheck::Strict)
            .await
    }

    pub async fn release_funds(
        &self,
        deal_id: &DealId,
        actor: &AccountId,
    ) -> Result<TransitionOutcome, EscrowError> {
        self.transition(deal_id, actor, Command::Release, Precheck::Strict)
            .await
    }

    pub async fn raise_dispute(
        &self,
        deal_id: &DealId,
        actor: &AccountId,
    ) -> Result<TransitionOutcome, EscrowError> {
        self.transition(deal_id, actor, Command::Dispute, Precheck::Advisory)
            .await
    }

    pub async fn submit_evidence(
        &self,
        deal_id: &DealId,
        actor: &AccountId,
        evidence_hash: &str,
    ) -> Result<TransitionOutcome, EscrowError> {
        let evidence_hash = machine::validate_evidence_hash(evidence_hash)?;
        self.transition(
            deal_id,
            actor,
            Command::SubmitEvidence { evidence_hash },
            Precheck::Advisory,
        )
        .await
    }

    pub async fn vote_on_dispute(
        &self,
        deal_id: &DealId,
        actor: &AccountId,
        release_to_seller: bool,
    ) -> Result<TransitionOutcome, EscrowError> {
        self.transition(
            deal_id,
            actor,
            Command::Vote { release_to_seller },
            Precheck::Advisory,
        )
        .await
    }

    pub async fn refund_buyer(
        &self,
        deal_id: &DealId,
        actor: &AccountId,
    ) -> Result<TransitionOutcome, EscrowError> {
        self.transition(deal_id, actor, Command::RefundBuyer, Precheck::Advisory)
            .await
    }

    pub async fn get_deal(&self, deal_id: &DealId) -> Result<ReconciledDeal, EscrowError> {
        self.reconciler.get_deal(deal_id).await
    }

    pub async fn list_deals(&self) -> DealListing {
        self.reconciler.list_deals().await
    }

    pub async fn get_voting_status(&self, deal_id: &DealId) -> Result<VotingStatus, EscrowError> {
        let ledger = self.reconciler.ledger();
        match self
            .reconciler
            .ledger_call(ledger.get_voting_status(deal_id))
            .await
        {
            Ok(Some(status)) => Ok(status),
            Ok(None) => Err(EscrowError::NotFound(deal_id.to_string())),
            Err(err) if err.is_transient() => {
                warn!(%deal_id, "voting status unavailable from ledger: {err}");
                let reconciled = self.reconciler.get_deal(deal_id).await?;
                Ok(VotingStatus::from_deal(&reconciled.deal))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_reputation(
        &self,
        account: &AccountId,
        role: Role,
    ) -> Result<Reputation, EscrowError> {
        let ledger = self.reconciler.ledger();
        Ok(self
            .reconciler
            .ledger_call(ledger.get_reputation(account, role))
            .await?)
    }

    async fn transition(
        &self,
        deal_id: &DealId,
        actor: &AccountId,
        command: Command,
        precheck: Precheck,
    ) -> Result<TransitionOutcome, EscrowError> {
        let (current, expected) = match self.reconciler.read_ledger(deal_id).await? {
            LedgerView::Found(deal) => {
                let transition = machine::apply(&deal, actor, &command, Utc::now())?;
                if !transition.changed {
                    info!(%deal_id, %actor, command = command.name(), "repeat request, nothing to do");
                    return Ok(TransitionOutcome::unchanged(transition.deal));
                }
                (Some(deal), Some(transition))
            }
            LedgerView::Missing => return Err(EscrowError::NotFound(deal_id.to_string())),
            LedgerView::Unavailable(err) if precheck == Precheck::Strict => {
                return Err(err.into());
            }
            LedgerView::Unavailable(err) => {
                warn!(%deal_id, command = command.name(), "pre-check skipped, ledger unavailable: {err}");
                let expected = self.reconciler.snapshot(deal_id).await.and_then(|snapshot| {
                    machine::apply(&snapshot.deal, actor, &command, Utc::now()).ok()
                });
                (None, expected)
            }
        };

        let receipt = self.submit(deal_id, actor, &command, current.as_ref()).await?;
        info!(
            %deal_id,
            %actor,
            command = command.name(),
            transaction_id = %receipt.transaction_id,
            "ledger write accepted"
        );

        let (expected_deal, resolution) = match expected {
            Some(transition) => (Some(transition.deal), transition.resolution),
            None => (None, None),
        };
        let event = event_for(&command, actor);
        let deal = self
            .reconciler
            .record_transition(deal_id, expected_deal, &event)
            .await;

        if let Some(deal) = &deal {
            let resolved_by_vote =
                matches!(command, Command::Vote { .. }) && deal.status.is_terminal();
            self.notify(event, deal);
            if resolved_by_vote {
                self.notify(
                    DealEvent::Resolved {
                        outcome: deal.status,
                    },
                    deal,
                );
            }
        }

        Ok(TransitionOutcome::written(
            deal_id.clone(),
            receipt,
            deal,
            resolution,
        ))
    }

    async fn submit(
        &self,
        deal_id: &DealId,
        actor: &AccountId,
        command: &Command,
        current: Option<&Deal>,
    ) -> Result<TxReceipt, EscrowError> {
        let ledger = self.reconciler.ledger();
        let call = async {
            match command {
                Command::AcceptAsSeller => ledger.accept_as_seller(deal_id, actor).await,
                Command::AcceptAsArbiter => ledger.accept_as_arbiter(deal_id, actor).await,
                Command::Fund { amount } => {
                    let Some(deal) = current else {
                        return Err(LedgerError::Unsupported(
                            "funding without a ledger read",
                        ));
                    };
                    let route = FundingRoute::for_deal(deal, *amount);
                    ledger.fund_deal(deal_id, &route, actor).await
                }
                Command::Release => ledger.release_funds(deal_id, actor).await,
                Command::Dispute => ledger.dispute(deal_id, actor).await,
                Command::SubmitEvidence { evidence_hash } => {
                    ledger.submit_evidence(deal_id, evidence_hash, actor).await
                }
                Command::Vote { release_to_seller } => {
                    ledger.vote_on_dispute(deal_id, *release_to_seller, actor).await
                }
                Command::RefundBuyer => ledger.refund_buyer(deal_id, actor).await,
            }
        };

        Ok(self.reconciler.ledger_call(call).await?)
    }

    fn notify(&self, event: DealEvent, deal: &Deal) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.notify(event, deal);
        }
    }
}

fn event_for(command: &Command, actor: &AccountId) -> DealEvent {
    match command {
        Command::AcceptAsSeller => DealEvent::SellerAccepted,
        Command::AcceptAsArbiter => DealEvent::ArbiterAccepted,
        Command::Fund { amount } => DealEvent::Funded { amount: *amount },
        Command::Release => DealEvent::Released,
        Command::Dispute => DealEvent::DisputeRaised,
        Command::SubmitEvidence { evidence_hash } => DealEvent::EvidenceSubmitted {
            evidence_hash: evidence_hash.clone(),
        },
        Command::Vote { release_to_seller } => DealEvent::VoteCast {
            arbiter: actor.clone(),
            release_to_seller: *release_to_seller,
        },
        Command::RefundBuyer => DealEvent::Resolved {
            outcome: DealStatus::BuyerRefunded,
        },
    }
}
