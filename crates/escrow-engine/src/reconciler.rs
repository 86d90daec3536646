use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use escrow_core::{
    CacheStore, Deal, DealId, EscrowError, LedgerClient, LedgerError, LogReader,
};
use escrow_store::replay_from_genesis;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::events::DealEvent;
use crate::publish::LogPublisher;

pub const DEFAULT_LEDGER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DealSource {
    Ledger,
    Cache,
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledDeal {
    pub deal: Deal,
    pub source: DealSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DealListing {
    pub deals: Vec<Deal>,
    /// Tier that produced the listing; `None` when every tier came up empty.
    pub source: Option<DealSource>,
}

/// What the ledger said about a deal.
#[derive(Debug)]
pub enum LedgerView {
    Found(Deal),
    Missing,
    Unavailable(LedgerError),
}

/// Single read path over the ledger, the cache and the consensus log.
///
/// The ledger is authoritative whenever it answers. The cache and the log
/// are consulted only when it cannot be reached, in that order.
pub struct Reconciler {
    ledger: Arc<dyn LedgerClient>,
    cache: Option<Arc<dyn CacheStore>>,
    log: Option<Arc<dyn LogReader>>,
    publisher: Option<LogPublisher>,
    known_ids: RwLock<BTreeSet<DealId>>,
    timeout: Duration,
    page_size: usize,
}

impl Reconciler {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            ledger,
            cache: None,
            log: None,
            publisher: None,
            known_ids: RwLock::new(BTreeSet::new()),
            timeout: DEFAULT_LEDGER_TIMEOUT,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_log_reader(mut self, log: Arc<dyn LogReader>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_publisher(mut self, publisher: LogPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn ledger(&self) -> &dyn LedgerClient {
        self.ledger.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Bounds a ledger round-trip. Expiry is a transient failure: the call
    /// may still have executed.
    pub async fn ledger_call<T>(
        &self,
        call: impl Future<Output = Result<T, LedgerError>>,
    ) -> Result<T, LedgerError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout(self.timeout)),
        }
    }

    /// Non-transient ledger errors are returned as failures; transient ones
    /// become [`LedgerView::Unavailable`].
    pub async fn read_ledger(&self, deal_id: &DealId) -> Result<LedgerView, EscrowError> {
        match self.ledger_call(self.ledger.get_deal(deal_id)).await {
            Ok(Some(deal)) => Ok(LedgerView::Found(deal)),
            Ok(None) => Ok(LedgerView::Missing),
            Err(err) if err.is_transient() => Ok(LedgerView::Unavailable(err)),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_deal(&self, deal_id: &DealId) -> Result<ReconciledDeal, EscrowError> {
        match self.read_ledger(deal_id).await? {
            LedgerView::Found(deal) => {
                self.remember(deal_id).await;
                self.sync_cache(&deal).await;
                Ok(ReconciledDeal {
                    deal,
                    source: DealSource::Ledger,
                })
            }
            LedgerView::Missing => Err(EscrowError::NotFound(deal_id.to_string())),
            LedgerView::Unavailable(err) => {
                warn!(%deal_id, "ledger unavailable, falling back: {err}");
                self.snapshot(deal_id)
                    .await
                    .ok_or_else(|| EscrowError::NotFound(deal_id.to_string()))
            }
        }
    }

    /// Last known state from the cache, then from a log replay.
    pub async fn snapshot(&self, deal_id: &DealId) -> Option<ReconciledDeal> {
        if let Some(cache) = &self.cache {
            match cache.get(deal_id).await {
                Ok(Some(deal)) => {
                    return Some(ReconciledDeal {
                        deal,
                        source: DealSource::Cache,
                    });
                }
                Ok(None) => debug!(%deal_id, "deal not cached"),
                Err(err) => warn!(%deal_id, "cache read failed: {err:#}"),
            }
        }

        let fold = self.replay_log().await?;
        fold.get(deal_id).cloned().map(|deal| ReconciledDeal {
            deal,
            source: DealSource::Log,
        })
    }

    /// First non-empty tier wins: ledger enumeration, cache, log replay.
    pub async fn list_deals(&self) -> DealListing {
        if let Some(deals) = self.list_from_ledger().await {
            if !deals.is_empty() {
                return DealListing {
                    deals,
                    source: Some(DealSource::Ledger),
                };
            }
        }

        if let Some(cache) = &self.cache {
            match cache.list().await {
                Ok(deals) if !deals.is_empty() => {
                    return DealListing {
                        deals,
                        source: Some(DealSource::Cache),
                    };
                }
                Ok(_) => debug!("cache holds no deals"),
                Err(err) => warn!("cache listing failed: {err:#}"),
            }
        }

        if let Some(fold) = self.replay_log().await {
            let deals = fold.into_deals();
            if !deals.is_empty() {
                return DealListing {
                    deals,
                    source: Some(DealSource::Log),
                };
            }
        }

        DealListing {
            deals: Vec::new(),
            source: None,
        }
    }

    async fn list_from_ledger(&self) -> Option<Vec<Deal>> {
        let ids = match self.ledger_call(self.ledger.list_deal_ids()).await {
            Ok(ids) => ids,
            Err(LedgerError::Unsupported(_)) => self.known_ids().await,
            Err(err) => {
                warn!("ledger enumeration failed: {err}");
                return None;
            }
        };

        let reads = ids
            .iter()
            .map(|deal_id| self.ledger_call(self.ledger.get_deal(deal_id)));
        let mut deals = Vec::with_capacity(ids.len());
        for (deal_id, result) in ids.iter().zip(join_all(reads).await) {
            match result {
                Ok(Some(deal)) => deals.push(deal),
                Ok(None) => debug!(%deal_id, "indexed deal unknown to ledger"),
                Err(err) => {
                    warn!(%deal_id, "ledger read failed during listing: {err}");
                    return None;
                }
            }
        }

        deals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Some(deals)
    }

    /// Deal ids this service knows of: the in-process set plus the cache.
    pub async fn known_ids(&self) -> Vec<DealId> {
        let mut ids = self.known_ids.read().await.clone();
        if let Some(cache) = &self.cache {
            match cache.deal_ids().await {
                Ok(cached) => ids.extend(cached),
                Err(err) => warn!("cache id scan failed: {err:#}"),
            }
        }
        ids.into_iter().collect()
    }

    pub async fn remember(&self, deal_id: &DealId) {
        let known = self.known_ids.read().await.contains(deal_id);
        if !known {
            self.known_ids.write().await.insert(deal_id.clone());
        }
    }

    /// Post-write bookkeeping. Re-reads the ledger for the new state and
    /// falls back to `expected` when that read fails, then syncs the cache
    /// and publishes to the log. Failures here never undo the write.
    pub async fn record_transition(
        &self,
        deal_id: &DealId,
        expected: Option<Deal>,
        event: &DealEvent,
    ) -> Option<Deal> {
        self.remember(deal_id).await;

        let deal = match self.read_ledger(deal_id).await {
            Ok(LedgerView::Found(deal)) => Some(deal),
            Ok(LedgerView::Missing) => {
                warn!(%deal_id, "ledger lost track of deal after write");
                expected
            }
            Ok(LedgerView::Unavailable(err)) => {
                warn!(%deal_id, "post-write ledger read failed: {err}");
                expected
            }
            Err(err) => {
                warn!(%deal_id, "post-write ledger read rejected: {err}");
                expected
            }
        };

        let Some(deal) = deal else {
            warn!(%deal_id, event = event.name(), "post-write state unknown, skipping sync");
            return None;
        };

        self.sync_cache(&deal).await;
        if let Some(publisher) = &self.publisher {
            if let Err(err) = publisher.publish(&deal, event).await {
                warn!(%deal_id, event = event.name(), "log publish failed: {err:#}");
            }
        }
        Some(deal)
    }

    async fn sync_cache(&self, deal: &Deal) {
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.upsert(deal).await {
                warn!(deal_id = %deal.deal_id, "cache upsert failed: {err:#}");
            }
        }
    }

    async fn replay_log(&self) -> Option<escrow_store::DealFold> {
        let log = self.log.as_ref()?;
        match tokio::time::timeout(self.timeout, replay_from_genesis(log.as_ref(), self.page_size))
            .await
        {
            Ok(Ok(fold)) => {
                info!(
                    deals = fold.len(),
                    skipped = fold.skipped(),
                    "replayed consensus log"
                );
                Some(fold)
            }
            Ok(Err(err)) => {
                warn!("log replay failed: {err:#}");
                None
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "log replay timed out");
                None
            }
        }
    }
}
