use std::collections::BTreeMap;

use anyhow::Result;
use escrow_core::{Deal, DealId, DealMessage, LogEnvelope, LogReader, Vote};
use tracing::{debug, warn};

/// Per-deal state folded from the consensus log.
///
/// `CREATE_DEAL` establishes a record; every later message for the same deal
/// overwrites `status` plus whatever fields its type carries. Entries at or
/// below the last applied sequence are ignored, so a fold can be fed
/// overlapping pages.
#[derive(Debug, Default, Clone)]
pub struct DealFold {
    deals: BTreeMap<DealId, Deal>,
    last_sequence: u64,
    skipped: u64,
}

impl DealFold {
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Entries that could not be decoded or referenced an unknown deal.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn get(&self, deal_id: &DealId) -> Option<&Deal> {
        self.deals.get(deal_id)
    }

    pub fn len(&self) -> usize {
        self.deals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deals.is_empty()
    }

    /// Folded deals, newest first.
    pub fn into_deals(self) -> Vec<Deal> {
        let mut deals: Vec<Deal> = self.deals.into_values().collect();
        deals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        deals
    }

    /// Applies a batch in consensus order and returns the ids it touched.
    pub fn apply(&mut self, envelopes: &[LogEnvelope]) -> Vec<DealId> {
        let mut ordered: Vec<&LogEnvelope> = envelopes
            .iter()
            .filter(|envelope| envelope.sequence > self.last_sequence)
            .collect();
        ordered.sort_by(|a, b| {
            a.consensus_timestamp
                .cmp(&b.consensus_timestamp)
                .then(a.sequence.cmp(&b.sequence))
        });

        let mut touched = Vec::new();
        for envelope in ordered {
            self.last_sequence = self.last_sequence.max(envelope.sequence);
            match self.apply_one(envelope) {
                Some(deal_id) => {
                    if !touched.contains(&deal_id) {
                        touched.push(deal_id);
                    }
                }
                None => self.skipped += 1,
            }
        }
        touched
    }

    fn apply_one(&mut self, envelope: &LogEnvelope) -> Option<DealId> {
        let message = match envelope.decode() {
            Ok(message) => message,
            Err(err) => {
                debug!(sequence = envelope.sequence, "skipping unparseable log message: {err}");
                return None;
            }
        };

        if let DealMessage::CreateDeal(record) = message {
            let deal_id = record.deal_id.clone();
            if self.deals.contains_key(&deal_id) {
                warn!(sequence = envelope.sequence, %deal_id, "ignoring duplicate CREATE_DEAL");
                return None;
            }
            return match Deal::try_from(record) {
                Ok(deal) => {
                    self.deals.insert(deal_id.clone(), deal);
                    Some(deal_id)
                }
                Err(err) => {
                    warn!(sequence = envelope.sequence, %deal_id, "skipping invalid CREATE_DEAL: {err}");
                    None
                }
            };
        }

        let deal_id = message.deal_id().clone();
        let Some(deal) = self.deals.get_mut(&deal_id) else {
            debug!(sequence = envelope.sequence, %deal_id, "skipping update for unknown deal");
            return None;
        };

        deal.status = message.status();
        deal.updated_at = envelope.consensus_timestamp;
        match message {
            DealMessage::SellerAccepted { .. } => deal.seller_accepted = true,
            DealMessage::ArbiterAccepted { .. } => deal.arbiter_accepted = true,
            DealMessage::DealFunded { .. } => deal.funds_deposited = true,
            DealMessage::EvidenceSubmitted { evidence_hash, .. } => {
                deal.evidence_hash = Some(evidence_hash);
            }
            DealMessage::VoteCast {
                arbiter,
                release_to_seller,
                ..
            } => {
                // the contract only tallies votes on a panel
                if deal.panel.is_multi() && !deal.has_voted(&arbiter) {
                    deal.votes.push(Vote {
                        arbiter,
                        release_to_seller,
                    });
                }
            }
            DealMessage::UpdateStatus { .. } | DealMessage::CreateDeal(_) => {}
        }

        Some(deal_id)
    }
}

/// Pulls every entry after the fold's cursor into it.
///
/// Readers may return pages shorter than `page_size` before the end of the
/// log, so only an empty page (or one with nothing past the cursor) ends the
/// read.
pub async fn catch_up(
    fold: &mut DealFold,
    reader: &dyn LogReader,
    page_size: usize,
) -> Result<Vec<DealId>> {
    let page_size = page_size.max(1);
    let mut touched = Vec::new();

    loop {
        let cursor = fold.last_sequence();
        let page = reader.read_after(cursor, page_size).await?;
        if page.is_empty() {
            break;
        }
        for deal_id in fold.apply(&page) {
            if !touched.contains(&deal_id) {
                touched.push(deal_id);
            }
        }
        if fold.last_sequence() == cursor {
            break;
        }
    }

    Ok(touched)
}

/// Folds the whole log from genesis.
pub async fn replay_from_genesis(reader: &dyn LogReader, page_size: usize) -> Result<DealFold> {
    let mut fold = DealFold::default();
    catch_up(&mut fold, reader, page_size).await?;
    Ok(fold)
}
