//! Deal state machine.
//!
//! [`apply`] is the single place where lifecycle rules live. The lifecycle
//! engine uses it to pre-check requests against its read of the ledger, and
//! the local contract simulator uses it as the authoritative rule set.

use chrono::{DateTime, Utc};

use crate::error::EscrowError;
use crate::models::{AccountId, ArbiterPanel, Deal, DealStatus, Resolution, Vote};

const MAX_EVIDENCE_HASH_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AcceptAsSeller,
    AcceptAsArbiter,
    Fund { amount: u64 },
    Release,
    Dispute,
    SubmitEvidence { evidence_hash: String },
    Vote { release_to_seller: bool },
    RefundBuyer,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AcceptAsSeller => "accept_as_seller",
            Self::AcceptAsArbiter => "accept_as_arbiter",
            Self::Fund { .. } => "fund_deal",
            Self::Release => "release_funds",
            Self::Dispute => "raise_dispute",
            Self::SubmitEvidence { .. } => "submit_evidence",
            Self::Vote { .. } => "vote_on_dispute",
            Self::RefundBuyer => "refund_buyer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub deal: Deal,
    /// False when the command was a repeat that leaves the deal untouched.
    pub changed: bool,
    pub resolution: Option<Resolution>,
}

impl Transition {
    fn applied(deal: Deal) -> Self {
        Self {
            deal,
            changed: true,
            resolution: None,
        }
    }

    fn resolved(deal: Deal, resolution: Resolution) -> Self {
        Self {
            deal,
            changed: true,
            resolution: Some(resolution),
        }
    }

    fn unchanged(deal: Deal) -> Self {
        Self {
            deal,
            changed: false,
            resolution: None,
        }
    }
}

pub fn validate_evidence_hash(hash: &str) -> Result<String, EscrowError> {
    let trimmed = hash.trim();
    if trimmed.is_empty() {
        return Err(EscrowError::validation("evidence hash must not be empty"));
    }
    if trimmed.len() > MAX_EVIDENCE_HASH_LEN {
        return Err(EscrowError::validation(format!(
            "evidence hash must be at most {MAX_EVIDENCE_HASH_LEN} characters"
        )));
    }
    if !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(EscrowError::validation(
            "evidence hash must be an alphanumeric content address",
        ));
    }
    Ok(trimmed.to_string())
}

/// Applies `command` by `actor` to `deal`, returning the next state.
///
/// Role checks run before status checks, so a stranger always gets an
/// authorization error regardless of where the deal is in its lifecycle.
pub fn apply(
    deal: &Deal,
    actor: &AccountId,
    command: &Command,
    at: DateTime<Utc>,
) -> Result<Transition, EscrowError> {
    let mut next = deal.clone();

    match command {
        Command::AcceptAsSeller => {
            require(&deal.seller == actor, "only the seller may accept as seller")?;
            if deal.seller_accepted {
                return Ok(Transition::unchanged(next));
            }
            require_status(deal, DealStatus::Proposed, command)?;
            next.seller_accepted = true;
            promote_if_accepted(&mut next);
        }
        Command::AcceptAsArbiter => {
            require(
                deal.panel.contains(actor),
                "only a configured arbiter may accept as arbiter",
            )?;
            if deal.arbiter_accepted {
                return Ok(Transition::unchanged(next));
            }
            require_status(deal, DealStatus::Proposed, command)?;
            next.arbiter_accepted = true;
            promote_if_accepted(&mut next);
        }
        Command::Fund { amount } => {
            require(&deal.buyer == actor, "only the buyer may fund the deal")?;
            if deal.funds_deposited {
                return Err(EscrowError::conflict(format!(
                    "deal {} is already funded",
                    deal.deal_id
                )));
            }
            require_status(deal, DealStatus::PendingFunds, command)?;
            if *amount == 0 {
                return Err(EscrowError::validation("funding amount must be positive"));
            }
            if *amount != deal.amount {
                return Err(EscrowError::validation(format!(
                    "funding amount {amount} does not match deal amount {}",
                    deal.amount
                )));
            }
            next.funds_deposited = true;
            next.status = DealStatus::Pending;
        }
        Command::Release => {
            require(&deal.buyer == actor, "only the buyer may release funds")?;
            require_status(deal, DealStatus::Pending, command)?;
            next.status = DealStatus::SellerPaid;
            next.updated_at = at;
            let resolution = pay_seller(&next);
            return Ok(Transition::resolved(next, resolution));
        }
        Command::Dispute => {
            require(&deal.buyer == actor, "only the buyer may raise a dispute")?;
            require_status(deal, DealStatus::Pending, command)?;
            next.status = DealStatus::Disputed;
        }
        Command::SubmitEvidence { evidence_hash } => {
            require(
                deal.is_party(actor),
                "only a party to the deal may submit evidence",
            )?;
            require_status(deal, DealStatus::Disputed, command)?;
            next.evidence_hash = Some(validate_evidence_hash(evidence_hash)?);
        }
        Command::Vote { release_to_seller } => {
            require(
                deal.panel.contains(actor),
                "only a configured arbiter may vote on the dispute",
            )?;
            require_status(deal, DealStatus::Disputed, command)?;
            next.updated_at = at;

            return match &deal.panel {
                ArbiterPanel::Single(_) if *release_to_seller => {
                    next.status = DealStatus::SellerPaid;
                    let resolution = pay_seller(&next);
                    Ok(Transition::resolved(next, resolution))
                }
                ArbiterPanel::Single(arbiter) => {
                    next.status = DealStatus::BuyerRefunded;
                    let resolution = refund_with_fee(&next, arbiter);
                    Ok(Transition::resolved(next, resolution))
                }
                ArbiterPanel::Multi { required_votes, .. } => {
                    if deal.has_voted(actor) {
                        return Err(EscrowError::conflict(format!(
                            "arbiter {actor} has already voted on deal {}",
                            deal.deal_id
                        )));
                    }
                    next.votes.push(Vote {
                        arbiter: actor.clone(),
                        release_to_seller: *release_to_seller,
                    });
                    tally(next, *required_votes)
                }
            };
        }
        Command::RefundBuyer => {
            require(
                deal.panel.contains(actor),
                "only the arbiter may refund the buyer",
            )?;
            let ArbiterPanel::Single(arbiter) = &deal.panel else {
                return Err(EscrowError::conflict(
                    "multi-arbiter deals are resolved by vote",
                ));
            };
            require_status(deal, DealStatus::Disputed, command)?;
            next.status = DealStatus::BuyerRefunded;
            next.updated_at = at;
            let resolution = refund_with_fee(&next, arbiter);
            return Ok(Transition::resolved(next, resolution));
        }
    }

    next.updated_at = at;
    Ok(Transition::applied(next))
}

fn require(condition: bool, message: &str) -> Result<(), EscrowError> {
    if condition {
        Ok(())
    } else {
        Err(EscrowError::authorization(message))
    }
}

fn require_status(deal: &Deal, expected: DealStatus, command: &Command) -> Result<(), EscrowError> {
    if deal.status == expected {
        return Ok(());
    }
    Err(EscrowError::conflict(format!(
        "cannot {} deal {} in status {} (requires {})",
        command.name(),
        deal.deal_id,
        deal.status,
        expected
    )))
}

fn promote_if_accepted(deal: &mut Deal) {
    if deal.seller_accepted && deal.arbiter_accepted {
        deal.status = DealStatus::PendingFunds;
    }
}

fn tally(mut deal: Deal, required_votes: u32) -> Result<Transition, EscrowError> {
    let seller_votes = deal.seller_vote_count();
    let buyer_votes = deal.buyer_vote_count();
    debug_assert!(
        !(seller_votes >= required_votes && buyer_votes >= required_votes),
        "both tallies reached quorum"
    );

    if seller_votes >= required_votes {
        deal.status = DealStatus::SellerPaid;
        let resolution = pay_seller(&deal);
        Ok(Transition::resolved(deal, resolution))
    } else if buyer_votes >= required_votes {
        deal.status = DealStatus::BuyerRefunded;
        let resolution = Resolution {
            outcome: DealStatus::BuyerRefunded,
            seller_payout: 0,
            buyer_refund: deal.amount,
            arbiter_fee: 0,
            fee_recipient: None,
        };
        Ok(Transition::resolved(deal, resolution))
    } else {
        Ok(Transition::applied(deal))
    }
}

fn pay_seller(deal: &Deal) -> Resolution {
    Resolution {
        outcome: DealStatus::SellerPaid,
        seller_payout: deal.amount,
        buyer_refund: 0,
        arbiter_fee: 0,
        fee_recipient: None,
    }
}

fn refund_with_fee(deal: &Deal, arbiter: &AccountId) -> Resolution {
    let fee = deal.arbiter_fee();
    Resolution {
        outcome: DealStatus::BuyerRefunded,
        seller_payout: 0,
        buyer_refund: deal.amount - fee,
        arbiter_fee: fee,
        fee_recipient: (fee > 0).then(|| arbiter.clone()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    use super::*;
    use crate::models::{ArbiterFee, Asset, DealId};

    fn account(raw: &str) -> AccountId {
        AccountId::parse(raw).unwrap()
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn deal(panel: ArbiterPanel) -> Deal {
        Deal {
            deal_id: DealId::parse("deal-1").unwrap(),
            buyer: account("0.0.1"),
            seller: account("0.0.2"),
            panel,
            amount: 1000,
            asset: Asset::Hbar,
            fee: ArbiterFee::Percentage(Decimal::new(5, 0)),
            status: DealStatus::Proposed,
            seller_accepted: false,
            arbiter_accepted: false,
            funds_deposited: false,
            evidence_hash: None,
            votes: Vec::new(),
            created_at: at(),
            updated_at: at(),
        }
    }

    fn run(deal: &Deal, actor: &str, command: Command) -> Result<Transition, EscrowError> {
        apply(deal, &account(actor), &command, at())
    }

    fn disputed(panel: ArbiterPanel) -> Deal {
        let mut deal = deal(panel);
        deal.status = DealStatus::Disputed;
        deal.seller_accepted = true;
        deal.arbiter_accepted = true;
        deal.funds_deposited = true;
        deal
    }

    fn panel_of_three() -> ArbiterPanel {
        ArbiterPanel::multi(
            vec![account("0.0.31"), account("0.0.32"), account("0.0.33")],
            2,
        )
        .unwrap()
    }

    #[test]
    fn both_acceptances_move_to_pending_funds() {
        let proposed = deal(ArbiterPanel::Single(account("0.0.3")));

        let after_seller = run(&proposed, "0.0.2", Command::AcceptAsSeller).unwrap();
        assert_eq!(after_seller.deal.status, DealStatus::Proposed);

        let after_arbiter = run(&after_seller.deal, "0.0.3", Command::AcceptAsArbiter).unwrap();
        assert_eq!(after_arbiter.deal.status, DealStatus::PendingFunds);
    }

    #[test]
    fn repeat_accept_is_a_no_op() {
        let proposed = deal(ArbiterPanel::Single(account("0.0.3")));
        let first = run(&proposed, "0.0.2", Command::AcceptAsSeller).unwrap();
        let second = run(&first.deal, "0.0.2", Command::AcceptAsSeller).unwrap();

        assert!(first.changed);
        assert!(!second.changed);
        assert!(second.deal.seller_accepted);
        assert_eq!(second.deal, first.deal);
    }

    #[test]
    fn accept_by_wrong_role_is_unauthorized() {
        let proposed = deal(ArbiterPanel::Single(account("0.0.3")));
        assert!(matches!(
            run(&proposed, "0.0.3", Command::AcceptAsSeller),
            Err(EscrowError::Authorization(_))
        ));
        assert!(matches!(
            run(&proposed, "0.0.2", Command::AcceptAsArbiter),
            Err(EscrowError::Authorization(_))
        ));
    }

    #[test]
    fn dispute_requires_a_funded_deal() {
        let mut proposed = deal(ArbiterPanel::Single(account("0.0.3")));
        assert!(matches!(
            run(&proposed, "0.0.1", Command::Dispute),
            Err(EscrowError::StateConflict(_))
        ));

        proposed.status = DealStatus::PendingFunds;
        assert!(matches!(
            run(&proposed, "0.0.1", Command::Dispute),
            Err(EscrowError::StateConflict(_))
        ));
    }

    #[test]
    fn funding_amount_must_match() {
        let mut ready = deal(ArbiterPanel::Single(account("0.0.3")));
        ready.status = DealStatus::PendingFunds;

        assert!(matches!(
            run(&ready, "0.0.1", Command::Fund { amount: 999 }),
            Err(EscrowError::Validation(_))
        ));
        assert!(matches!(
            run(&ready, "0.0.2", Command::Fund { amount: 1000 }),
            Err(EscrowError::Authorization(_))
        ));

        let funded = run(&ready, "0.0.1", Command::Fund { amount: 1000 }).unwrap();
        assert_eq!(funded.deal.status, DealStatus::Pending);
        assert!(funded.deal.funds_deposited);

        assert!(matches!(
            run(&funded.deal, "0.0.1", Command::Fund { amount: 1000 }),
            Err(EscrowError::StateConflict(_))
        ));
    }

    #[test]
    fn refund_pays_percentage_fee_to_arbiter() {
        let deal = disputed(ArbiterPanel::Single(account("0.0.3")));
        let refunded = run(&deal, "0.0.3", Command::RefundBuyer).unwrap();

        assert_eq!(refunded.deal.status, DealStatus::BuyerRefunded);
        let resolution = refunded.resolution.unwrap();
        assert_eq!(resolution.arbiter_fee, 50);
        assert_eq!(resolution.buyer_refund, 950);
        assert_eq!(resolution.fee_recipient, Some(account("0.0.3")));
    }

    #[test]
    fn release_never_pays_a_fee() {
        let mut pending = deal(ArbiterPanel::Single(account("0.0.3")));
        pending.status = DealStatus::Pending;
        let released = run(&pending, "0.0.1", Command::Release).unwrap();

        let resolution = released.resolution.unwrap();
        assert_eq!(resolution.seller_payout, 1000);
        assert_eq!(resolution.arbiter_fee, 0);
    }

    #[test]
    fn single_arbiter_vote_resolves_immediately() {
        let deal = disputed(ArbiterPanel::Single(account("0.0.3")));

        let paid = run(&deal, "0.0.3", Command::Vote { release_to_seller: true }).unwrap();
        assert_eq!(paid.deal.status, DealStatus::SellerPaid);

        let refunded = run(&deal, "0.0.3", Command::Vote { release_to_seller: false }).unwrap();
        assert_eq!(refunded.deal.status, DealStatus::BuyerRefunded);
        assert_eq!(refunded.resolution.unwrap().arbiter_fee, 50);
    }

    #[test]
    fn multi_arbiter_quorum_resolves_and_locks_out_later_votes() {
        let deal = disputed(panel_of_three());

        let first = run(&deal, "0.0.31", Command::Vote { release_to_seller: true }).unwrap();
        assert_eq!(first.deal.status, DealStatus::Disputed);
        assert_eq!(first.deal.seller_vote_count(), 1);

        let second = run(&first.deal, "0.0.32", Command::Vote { release_to_seller: true }).unwrap();
        assert_eq!(second.deal.status, DealStatus::SellerPaid);
        assert_eq!(second.deal.seller_vote_count(), 2);

        assert!(matches!(
            run(&second.deal, "0.0.33", Command::Vote { release_to_seller: false }),
            Err(EscrowError::StateConflict(_))
        ));
    }

    #[test]
    fn arbiter_cannot_vote_twice() {
        let deal = disputed(panel_of_three());
        let first = run(&deal, "0.0.31", Command::Vote { release_to_seller: false }).unwrap();

        assert!(matches!(
            run(&first.deal, "0.0.31", Command::Vote { release_to_seller: true }),
            Err(EscrowError::StateConflict(_))
        ));
    }

    #[test]
    fn quorum_tallies_never_both_reach_required_votes() {
        let orders: [[bool; 3]; 4] = [
            [true, false, true],
            [false, true, false],
            [true, true, false],
            [false, false, true],
        ];

        for order in orders {
            let mut current = disputed(panel_of_three());
            for (arbiter, release) in ["0.0.31", "0.0.32", "0.0.33"].iter().zip(order) {
                match run(&current, arbiter, Command::Vote { release_to_seller: release }) {
                    Ok(transition) => current = transition.deal,
                    Err(EscrowError::StateConflict(_)) => break,
                    Err(other) => panic!("unexpected error: {other}"),
                }
                assert!(!(current.seller_vote_count() >= 2 && current.buyer_vote_count() >= 2));
            }
            assert!(current.status.is_terminal());
        }
    }

    #[test]
    fn multi_arbiter_refund_by_vote_has_no_fee() {
        let deal = disputed(panel_of_three());
        let first = run(&deal, "0.0.31", Command::Vote { release_to_seller: false }).unwrap();
        let second = run(&first.deal, "0.0.33", Command::Vote { release_to_seller: false }).unwrap();

        assert_eq!(second.deal.status, DealStatus::BuyerRefunded);
        assert_eq!(second.resolution.unwrap().buyer_refund, 1000);
    }

    #[test]
    fn direct_refund_is_single_arbiter_only() {
        let deal = disputed(panel_of_three());
        assert!(matches!(
            run(&deal, "0.0.31", Command::RefundBuyer),
            Err(EscrowError::StateConflict(_))
        ));
    }

    #[test]
    fn evidence_only_while_disputed() {
        let mut deal = disputed(ArbiterPanel::Single(account("0.0.3")));
        let with_evidence = run(
            &deal,
            "0.0.2",
            Command::SubmitEvidence {
                evidence_hash: "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi".into(),
            },
        )
        .unwrap();
        assert_eq!(with_evidence.deal.status, DealStatus::Disputed);
        assert!(with_evidence.deal.evidence_hash.is_some());

        deal.status = DealStatus::Pending;
        assert!(matches!(
            run(
                &deal,
                "0.0.2",
                Command::SubmitEvidence {
                    evidence_hash: "Qm123".into()
                }
            ),
            Err(EscrowError::StateConflict(_))
        ));
    }

    #[test]
    fn terminal_states_absorb() {
        let mut paid = deal(ArbiterPanel::Single(account("0.0.3")));
        paid.status = DealStatus::SellerPaid;
        paid.funds_deposited = true;

        assert!(matches!(
            run(&paid, "0.0.1", Command::Fund { amount: 1000 }),
            Err(EscrowError::StateConflict(_))
        ));
        assert!(matches!(
            run(&paid, "0.0.1", Command::Dispute),
            Err(EscrowError::StateConflict(_))
        ));
        assert!(matches!(
            run(&paid, "0.0.1", Command::Release),
            Err(EscrowError::StateConflict(_))
        ));
    }
}
