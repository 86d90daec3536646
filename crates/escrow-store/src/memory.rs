use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use escrow_core::{CacheStore, Deal, DealId, DealMessage, LogAppender, LogEnvelope, LogReader};
use tokio::sync::RwLock;

/// Append-only consensus log held in process memory.
#[derive(Default)]
pub struct InMemoryLog {
    entries: RwLock<Vec<LogEnvelope>>,
}

impl InMemoryLog {
    /// Appends an arbitrary payload, well-formed or not.
    pub async fn append_raw(&self, payload: impl Into<String>) -> LogEnvelope {
        let mut entries = self.entries.write().await;
        let now = Utc::now();
        // consensus timestamps are strictly increasing
        let consensus_timestamp = match entries.last() {
            Some(last) if last.consensus_timestamp >= now => {
                last.consensus_timestamp + Duration::nanoseconds(1)
            }
            _ => now,
        };

        let envelope = LogEnvelope {
            sequence: entries.len() as u64 + 1,
            consensus_timestamp,
            payload: payload.into(),
        };
        entries.push(envelope.clone());
        envelope
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl LogAppender for InMemoryLog {
    async fn append(&self, message: &DealMessage) -> anyhow::Result<LogEnvelope> {
        let payload = serde_json::to_string(message)?;
        Ok(self.append_raw(payload).await)
    }
}

#[async_trait]
impl LogReader for InMemoryLog {
    async fn read_after(
        &self,
        after_sequence: u64,
        limit: usize,
    ) -> anyhow::Result<Vec<LogEnvelope>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|entry| entry.sequence > after_sequence)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryCache {
    deals: RwLock<HashMap<DealId, Deal>>,
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn upsert(&self, deal: &Deal) -> anyhow::Result<()> {
        let mut deals = self.deals.write().await;
        match deals.get_mut(&deal.deal_id) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = deal.clone();
                existing.created_at = created_at;
            }
            None => {
                deals.insert(deal.deal_id.clone(), deal.clone());
            }
        }
        Ok(())
    }

    async fn get(&self, deal_id: &DealId) -> anyhow::Result<Option<Deal>> {
        let deals = self.deals.read().await;
        Ok(deals.get(deal_id).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<Deal>> {
        let deals = self.deals.read().await;
        let mut listed: Vec<Deal> = deals.values().cloned().collect();
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(listed)
    }

    async fn deal_ids(&self) -> anyhow::Result<Vec<DealId>> {
        let deals = self.deals.read().await;
        Ok(deals.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use escrow_core::DealStatus;

    use super::*;

    #[tokio::test]
    async fn log_reads_are_paged_by_sequence() {
        let log = InMemoryLog::default();
        for index in 0..5 {
            log.append_raw(format!("{{\"n\":{index}}}")).await;
        }

        let first = log.read_after(0, 2).await.unwrap();
        assert_eq!(first.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);

        let rest = log.read_after(2, 10).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert!(rest.windows(2).all(|w| w[0].consensus_timestamp < w[1].consensus_timestamp));
    }

    #[tokio::test]
    async fn cache_upsert_is_keyed_and_keeps_created_at() {
        let cache = InMemoryCache::default();
        let deal = crate::fold::tests::sample_deal("deal-1", "2024-03-01T00:00:00Z");
        cache.upsert(&deal).await.unwrap();

        let mut newer = deal.clone();
        newer.status = DealStatus::PendingFunds;
        newer.created_at = Utc::now();
        cache.upsert(&newer).await.unwrap();
        cache.upsert(&newer).await.unwrap();

        let stored = cache.get(&deal.deal_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DealStatus::PendingFunds);
        assert_eq!(stored.created_at, deal.created_at);
        assert_eq!(cache.deal_ids().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cache_lists_newest_first() {
        let cache = InMemoryCache::default();
        cache
            .upsert(&crate::fold::tests::sample_deal("old", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        cache
            .upsert(&crate::fold::tests::sample_deal("new", "2024-06-01T00:00:00Z"))
            .await
            .unwrap();

        let listed = cache.list().await.unwrap();
        assert_eq!(listed[0].deal_id.as_str(), "new");
        assert_eq!(listed[1].deal_id.as_str(), "old");
    }
}
