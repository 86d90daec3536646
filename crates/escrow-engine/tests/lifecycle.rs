mod support;

use escrow_core::{
    ArbiterFeeType, CacheStore, DealMessage, DealProposal, DealStatus, EscrowError, LogReader,
    Role,
};
use escrow_engine::{DealEvent, DealSource};
use rust_decimal::Decimal;
use support::*;

#[tokio::test]
async fn single_arbiter_happy_path_pays_the_seller() {
    let h = harness();
    let buyer = account(BUYER);

    let created = h
        .engine
        .create_deal(&buyer, single_arbiter_proposal("deal-happy", 1_000))
        .await
        .expect("deal should be created");
    assert_eq!(created.status, Some(DealStatus::Proposed));
    assert!(created.transaction_id.is_some());
    let id = created.deal_id;

    let seller = h
        .engine
        .accept_as_seller(&id, &account(SELLER))
        .await
        .expect("seller should accept");
    assert_eq!(seller.status, Some(DealStatus::Proposed));

    let arbiter = h
        .engine
        .accept_as_arbiter(&id, &account(ARBITER))
        .await
        .expect("arbiter should accept");
    assert_eq!(arbiter.status, Some(DealStatus::PendingFunds));

    let funded = h
        .engine
        .fund_deal(&id, &buyer, 1_000)
        .await
        .expect("buyer should fund");
    assert_eq!(funded.status, Some(DealStatus::Pending));

    let released = h
        .engine
        .release_funds(&id, &buyer)
        .await
        .expect("buyer should release");
    assert_eq!(released.status, Some(DealStatus::SellerPaid));
    let resolution = released.resolution.expect("release should resolve the deal");
    assert_eq!(resolution.seller_payout, 1_000);
    assert_eq!(resolution.arbiter_fee, 0);

    let reconciled = h.engine.get_deal(&id).await.expect("deal should be readable");
    assert_eq!(reconciled.source, DealSource::Ledger);
    assert_eq!(reconciled.deal.status, DealStatus::SellerPaid);

    let cached = h
        .cache
        .get(&id)
        .await
        .expect("cache should answer")
        .expect("deal should be cached");
    assert_eq!(cached.status, DealStatus::SellerPaid);
    assert!(cached.funds_deposited);

    assert_eq!(h.log.len().await, 5);

    let reputation = h
        .engine
        .get_reputation(&buyer, Role::Buyer)
        .await
        .expect("reputation should load");
    assert_eq!(reputation.total_deals, 1);
    assert_eq!(reputation.completed_deals, 1);
}

#[tokio::test]
async fn repeat_seller_accept_is_a_no_op() {
    let mut h = harness();
    let created = h
        .engine
        .create_deal(&account(BUYER), single_arbiter_proposal("deal-idem", 10))
        .await
        .expect("deal should be created");
    let id = created.deal_id;

    h.engine
        .accept_as_seller(&id, &account(SELLER))
        .await
        .expect("first accept should succeed");
    let entries_after_first = h.log.len().await;
    h.drain_deliveries().await;

    let repeat = h
        .engine
        .accept_as_seller(&id, &account(SELLER))
        .await
        .expect("repeat accept should succeed");

    assert!(repeat.transaction_id.is_none());
    assert_eq!(repeat.status, Some(DealStatus::Proposed));
    assert_eq!(h.log.len().await, entries_after_first);
    assert!(h.drain_deliveries().await.is_empty());
}

#[tokio::test]
async fn dispute_is_impossible_before_funding() {
    let h = harness();
    let buyer = account(BUYER);
    let created = h
        .engine
        .create_deal(&buyer, single_arbiter_proposal("deal-early", 10))
        .await
        .expect("deal should be created");
    let id = created.deal_id;

    let err = h.engine.raise_dispute(&id, &buyer).await.unwrap_err();
    assert!(matches!(err, EscrowError::StateConflict(_)));

    h.engine
        .accept_as_seller(&id, &account(SELLER))
        .await
        .expect("seller should accept");
    h.engine
        .accept_as_arbiter(&id, &account(ARBITER))
        .await
        .expect("arbiter should accept");

    let err = h.engine.raise_dispute(&id, &buyer).await.unwrap_err();
    assert!(matches!(err, EscrowError::StateConflict(_)));
    let deal = h.engine.get_deal(&id).await.expect("deal should load").deal;
    assert_eq!(deal.status, DealStatus::PendingFunds);
}

#[tokio::test]
async fn role_checks_precede_ledger_writes() {
    let h = harness();
    let id = h.funded(single_arbiter_proposal("deal-roles", 50)).await;
    let entries = h.log.len().await;

    let err = h
        .engine
        .release_funds(&id, &account(SELLER))
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::Authorization(_)));

    h.engine
        .raise_dispute(&id, &account(BUYER))
        .await
        .expect("buyer should dispute");
    let err = h
        .engine
        .submit_evidence(&id, &account(STRANGER), "QmStrangerEvidence")
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::Authorization(_)));

    assert_eq!(h.log.len().await, entries + 1);
}

#[tokio::test]
async fn funding_amount_must_match_exactly() {
    let h = harness();
    let id = h
        .engine
        .create_deal(&account(BUYER), single_arbiter_proposal("deal-amount", 500))
        .await
        .expect("deal should be created")
        .deal_id;
    h.engine
        .accept_as_seller(&id, &account(SELLER))
        .await
        .expect("seller should accept");
    h.engine
        .accept_as_arbiter(&id, &account(ARBITER))
        .await
        .expect("arbiter should accept");

    let err = h
        .engine
        .fund_deal(&id, &account(BUYER), 499)
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::Validation(_)));
}

#[tokio::test]
async fn refund_branch_deducts_the_arbiter_fee() {
    let h = harness();
    let proposal = DealProposal {
        arbiter_fee_type: Some(ArbiterFeeType::Percentage),
        arbiter_fee_amount: Some(Decimal::new(5, 0)),
        ..single_arbiter_proposal("deal-fee", 1_000)
    };
    let id = h.funded(proposal).await;

    h.engine
        .raise_dispute(&id, &account(BUYER))
        .await
        .expect("buyer should dispute");
    h.engine
        .submit_evidence(&id, &account(SELLER), "QmSellerEvidence")
        .await
        .expect("seller should submit evidence");

    let refunded = h
        .engine
        .refund_buyer(&id, &account(ARBITER))
        .await
        .expect("arbiter should refund");
    assert_eq!(refunded.status, Some(DealStatus::BuyerRefunded));
    let resolution = refunded.resolution.expect("refund should resolve the deal");
    assert_eq!(resolution.arbiter_fee, 50);
    assert_eq!(resolution.buyer_refund, 950);
    assert_eq!(resolution.fee_recipient, Some(account(ARBITER)));

    let deal = refunded.deal.expect("outcome should carry the deal");
    assert_eq!(deal.evidence_hash.as_deref(), Some("QmSellerEvidence"));
}

#[tokio::test]
async fn multi_arbiter_dispute_resolves_at_quorum() {
    let mut h = harness();
    let id = h.funded(panel_proposal("deal-panel", 900, 2)).await;
    h.engine
        .raise_dispute(&id, &account(BUYER))
        .await
        .expect("buyer should dispute");

    let first = h
        .engine
        .vote_on_dispute(&id, &account(PANEL[0]), true)
        .await
        .expect("first vote should count");
    assert_eq!(first.status, Some(DealStatus::Disputed));

    let err = h
        .engine
        .vote_on_dispute(&id, &account(PANEL[0]), false)
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::StateConflict(_)));

    let second = h
        .engine
        .vote_on_dispute(&id, &account(PANEL[1]), false)
        .await
        .expect("second vote should count");
    assert_eq!(second.status, Some(DealStatus::Disputed));

    let voting = h
        .engine
        .get_voting_status(&id)
        .await
        .expect("voting status should load");
    assert_eq!(voting.seller_vote_count, 1);
    assert_eq!(voting.buyer_vote_count, 1);
    assert!(!voting.resolved);

    h.drain_deliveries().await;
    let decisive = h
        .engine
        .vote_on_dispute(&id, &account(PANEL[2]), true)
        .await
        .expect("deciding vote should count");
    assert_eq!(decisive.status, Some(DealStatus::SellerPaid));
    assert_eq!(
        decisive.resolution.map(|r| r.seller_payout),
        Some(900)
    );

    let delivered = h.drain_deliveries().await;
    assert!(delivered.iter().any(|n| matches!(n.event, DealEvent::VoteCast { .. })));
    let resolved: Vec<_> = delivered
        .iter()
        .filter(|n| matches!(n.event, DealEvent::Resolved { .. }))
        .collect();
    assert_eq!(resolved.len(), 5);
}

#[tokio::test]
async fn multi_arbiter_deals_cannot_be_refunded_directly() {
    let h = harness();
    let id = h.funded(panel_proposal("deal-norefund", 100, 1)).await;
    h.engine
        .raise_dispute(&id, &account(BUYER))
        .await
        .expect("buyer should dispute");

    let err = h
        .engine
        .refund_buyer(&id, &account(PANEL[1]))
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::StateConflict(_)));
}

#[tokio::test]
async fn invalid_proposals_never_reach_the_ledger() {
    let h = harness();
    let both = DealProposal {
        arbiters: Some(vec![PANEL[1].to_string()]),
        required_votes: Some(1),
        ..single_arbiter_proposal("deal-both", 10)
    };
    let err = h
        .engine
        .create_deal(&account(BUYER), both)
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::Validation(_)));

    let too_many_votes = panel_proposal("deal-votes", 10, 4);
    let err = h
        .engine
        .create_deal(&account(BUYER), too_many_votes)
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::Validation(_)));

    assert!(h.log.is_empty().await);
    let listing = h.engine.list_deals().await;
    assert!(listing.deals.is_empty());
    assert_eq!(listing.source, None);
}

#[tokio::test]
async fn typed_messages_fold_back_into_the_same_deal() {
    let h = harness();
    let id = h.funded(panel_proposal("deal-fold", 300, 1)).await;
    h.engine
        .raise_dispute(&id, &account(BUYER))
        .await
        .expect("buyer should dispute");
    h.engine
        .vote_on_dispute(&id, &account(PANEL[2]), false)
        .await
        .expect("vote should resolve");

    let entries = h.log.read_after(0, 100).await.expect("log should read");
    let kinds: Vec<&'static str> = entries
        .iter()
        .map(|entry| entry.decode().expect("published message should decode").kind())
        .collect();
    assert_eq!(
        kinds,
        vec![
            "CREATE_DEAL",
            "SELLER_ACCEPTED",
            "ARBITER_ACCEPTED",
            "DEAL_FUNDED",
            "UPDATE_STATUS",
            "VOTE_CAST"
        ]
    );

    let fold = escrow_store::replay_from_genesis(h.log.as_ref(), 2)
        .await
        .expect("log should replay");
    let folded = fold.get(&id).expect("deal should fold");
    let ledger = h.engine.get_deal(&id).await.expect("deal should load").deal;
    assert_eq!(folded.status, ledger.status);
    assert_eq!(folded.votes, ledger.votes);
    assert!(folded.funds_deposited);
}

#[tokio::test]
async fn legacy_mode_publishes_status_only_updates() {
    let h = harness_with(HarnessOptions {
        mode: escrow_engine::StatusUpdateMode::Legacy,
        ..HarnessOptions::default()
    });
    h.funded(single_arbiter_proposal("deal-legacy", 20)).await;

    let entries = h.log.read_after(0, 100).await.expect("log should read");
    let messages: Vec<DealMessage> = entries
        .iter()
        .map(|entry| entry.decode().expect("published message should decode"))
        .collect();
    assert!(matches!(messages[0], DealMessage::CreateDeal(_)));
    assert!(
        messages[1..]
            .iter()
            .all(|message| matches!(message, DealMessage::UpdateStatus { .. }))
    );
    assert_eq!(messages.last().map(DealMessage::status), Some(DealStatus::Pending));
}
