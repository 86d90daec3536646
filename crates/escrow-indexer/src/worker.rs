use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use escrow_core::{CacheStore, Deal, DealId, LogReader};
use escrow_platform::{DEALS_INDEXED_CHANNEL, DealsIndexedEvent, RedisBus};
use escrow_store::{DealFold, catch_up};
use tracing::{debug, info, warn};

/// Tails the consensus log into the deal cache.
///
/// The fold starts empty, so the first pass replays the whole log and merges
/// every deal it finds into the cache. Deals whose cache write failed stay
/// pending and are retried on the next pass.
pub struct Indexer {
    reader: Arc<dyn LogReader>,
    cache: Arc<dyn CacheStore>,
    bus: Option<RedisBus>,
    page_size: usize,
    fold: DealFold,
    pending: BTreeSet<DealId>,
}

impl Indexer {
    pub fn new(reader: Arc<dyn LogReader>, cache: Arc<dyn CacheStore>, page_size: usize) -> Self {
        Self {
            reader,
            cache,
            bus: None,
            page_size,
            fold: DealFold::default(),
            pending: BTreeSet::new(),
        }
    }

    pub fn with_bus(mut self, bus: RedisBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn last_sequence(&self) -> u64 {
        self.fold.last_sequence()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Returns the announcement for this pass, if it indexed anything.
    pub async fn run_pass(&mut self) -> Result<Option<DealsIndexedEvent>> {
        let touched = catch_up(&mut self.fold, self.reader.as_ref(), self.page_size).await?;
        self.pending.extend(touched);
        if self.pending.is_empty() {
            debug!(last_sequence = self.fold.last_sequence(), "log unchanged");
            return Ok(None);
        }

        let mut indexed = Vec::new();
        for deal_id in std::mem::take(&mut self.pending) {
            let Some(folded) = self.fold.get(&deal_id) else {
                continue;
            };
            let cached = match self.cache.get(&deal_id).await {
                Ok(cached) => cached,
                Err(err) => {
                    warn!(%deal_id, "cache read failed, will retry: {err:#}");
                    self.pending.insert(deal_id);
                    continue;
                }
            };
            let deal = overlay_cached(folded, cached);
            match self.cache.upsert(&deal).await {
                Ok(()) => indexed.push(deal_id),
                Err(err) => {
                    warn!(%deal_id, "cache upsert failed, will retry: {err:#}");
                    self.pending.insert(deal_id);
                }
            }
        }
        if indexed.is_empty() {
            return Ok(None);
        }

        info!(
            deals = indexed.len(),
            last_sequence = self.fold.last_sequence(),
            skipped = self.fold.skipped(),
            "indexed deals"
        );
        let event = DealsIndexedEvent {
            deal_ids: indexed,
            last_sequence: self.fold.last_sequence(),
            indexed_at: Utc::now(),
        };
        if let Some(bus) = &self.bus {
            if let Err(err) = bus.publish_json(DEALS_INDEXED_CHANNEL, &event).await {
                warn!("failed to announce indexed deals: {err:#}");
            }
        }
        Ok(Some(event))
    }
}

/// Status-only log messages say nothing about acceptance, funding, evidence
/// or votes, so whatever the cache already holds for those is kept. A cached
/// row newer than the folded one keeps its status too.
fn overlay_cached(folded: &Deal, cached: Option<Deal>) -> Deal {
    let mut deal = folded.clone();
    let Some(cached) = cached else {
        return deal;
    };

    deal.seller_accepted |= cached.seller_accepted;
    deal.arbiter_accepted |= cached.arbiter_accepted;
    deal.funds_deposited |= cached.funds_deposited;
    if deal.evidence_hash.is_none() {
        deal.evidence_hash = cached.evidence_hash;
    }
    for vote in cached.votes {
        if !deal.has_voted(&vote.arbiter) {
            deal.votes.push(vote);
        }
    }
    if cached.updated_at > deal.updated_at {
        deal.status = cached.status;
        deal.updated_at = cached.updated_at;
    }
    deal
}
