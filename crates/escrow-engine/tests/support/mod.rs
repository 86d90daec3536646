#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use escrow_core::{
    AccountId, CacheStore, Deal, DealId, DealProposal, DealTerms, FundingRoute, LedgerClient,
    LedgerError, Reputation, Role, TxReceipt, VotingStatus,
};
use escrow_engine::{
    ContactDirectory, DealEngine, Dispatcher, LogPublisher, Mailer, Notification, Reconciler,
    StatusUpdateMode,
};
use escrow_ledger::InMemoryLedger;
use escrow_store::{InMemoryCache, InMemoryLog};
use tokio::sync::mpsc;

pub const BUYER: &str = "0.0.1001";
pub const SELLER: &str = "0.0.2002";
pub const ARBITER: &str = "0.0.3003";
pub const PANEL: [&str; 3] = ["0.0.3003", "0.0.3004", "0.0.3005"];
pub const STRANGER: &str = "0.0.9999";

pub const LEDGER_TIMEOUT: Duration = Duration::from_millis(100);

pub fn account(raw: &str) -> AccountId {
    AccountId::parse(raw).expect("test account should parse")
}

pub fn deal_id(raw: &str) -> DealId {
    DealId::parse(raw).expect("test deal id should parse")
}

pub fn single_arbiter_proposal(deal_id: &str, amount: i64) -> DealProposal {
    DealProposal {
        deal_id: Some(deal_id.to_string()),
        seller: Some(SELLER.to_string()),
        arbiter: Some(ARBITER.to_string()),
        amount: Some(amount),
        ..DealProposal::default()
    }
}

pub fn panel_proposal(deal_id: &str, amount: i64, required_votes: u32) -> DealProposal {
    DealProposal {
        deal_id: Some(deal_id.to_string()),
        seller: Some(SELLER.to_string()),
        arbiters: Some(PANEL.iter().map(|raw| raw.to_string()).collect()),
        required_votes: Some(required_votes),
        amount: Some(amount),
        ..DealProposal::default()
    }
}

/// Wraps the contract simulator with switches for outages and stalls.
pub struct FlakyLedger {
    inner: InMemoryLedger,
    down: AtomicBool,
    stalled: AtomicBool,
}

impl FlakyLedger {
    pub fn new(inner: InMemoryLedger) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    async fn reachable(&self) -> Result<(), LedgerError> {
        if self.stalled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(LedgerError::Transport("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for FlakyLedger {
    async fn create_deal(
        &self,
        terms: &DealTerms,
        signer: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.reachable().await?;
        self.inner.create_deal(terms, signer).await
    }

    async fn accept_as_seller(
        &self,
        deal_id: &DealId,
        seller: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.reachable().await?;
        self.inner.accept_as_seller(deal_id, seller).await
    }

    async fn accept_as_arbiter(
        &self,
        deal_id: &DealId,
        arbiter: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.reachable().await?;
        self.inner.accept_as_arbiter(deal_id, arbiter).await
    }

    async fn fund_deal(
        &self,
        deal_id: &DealId,
        route: &FundingRoute,
        buyer: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.reachable().await?;
        self.inner.fund_deal(deal_id, route, buyer).await
    }

    async fn release_funds(
        &self,
        deal_id: &DealId,
        buyer: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.reachable().await?;
        self.inner.release_funds(deal_id, buyer).await
    }

    async fn dispute(&self, deal_id: &DealId, buyer: &AccountId) -> Result<TxReceipt, LedgerError> {
        self.reachable().await?;
        self.inner.dispute(deal_id, buyer).await
    }

    async fn submit_evidence(
        &self,
        deal_id: &DealId,
        evidence_hash: &str,
        submitter: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.reachable().await?;
        self.inner
            .submit_evidence(deal_id, evidence_hash, submitter)
            .await
    }

    async fn vote_on_dispute(
        &self,
        deal_id: &DealId,
        release_to_seller: bool,
        arbiter: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.reachable().await?;
        self.inner
            .vote_on_dispute(deal_id, release_to_seller, arbiter)
            .await
    }

    async fn refund_buyer(
        &self,
        deal_id: &DealId,
        arbiter: &AccountId,
    ) -> Result<TxReceipt, LedgerError> {
        self.reachable().await?;
        self.inner.refund_buyer(deal_id, arbiter).await
    }

    async fn get_deal(&self, deal_id: &DealId) -> Result<Option<Deal>, LedgerError> {
        self.reachable().await?;
        self.inner.get_deal(deal_id).await
    }

    async fn list_deal_ids(&self) -> Result<Vec<DealId>, LedgerError> {
        self.reachable().await?;
        self.inner.list_deal_ids().await
    }

    async fn get_voting_status(
        &self,
        deal_id: &DealId,
    ) -> Result<Option<VotingStatus>, LedgerError> {
        self.reachable().await?;
        self.inner.get_voting_status(deal_id).await
    }

    async fn get_reputation(
        &self,
        account: &AccountId,
        role: Role,
    ) -> Result<Reputation, LedgerError> {
        self.reachable().await?;
        self.inner.get_reputation(account, role).await
    }
}

/// Cache that can be made to fail every call.
#[derive(Default)]
pub struct FlakyCache {
    inner: InMemoryCache,
    broken: AtomicBool,
}

impl FlakyCache {
    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            anyhow::bail!("cache database unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for FlakyCache {
    async fn upsert(&self, deal: &Deal) -> anyhow::Result<()> {
        self.check()?;
        self.inner.upsert(deal).await
    }

    async fn get(&self, deal_id: &DealId) -> anyhow::Result<Option<Deal>> {
        self.check()?;
        self.inner.get(deal_id).await
    }

    async fn list(&self) -> anyhow::Result<Vec<Deal>> {
        self.check()?;
        self.inner.list().await
    }

    async fn deal_ids(&self) -> anyhow::Result<Vec<DealId>> {
        self.check()?;
        self.inner.deal_ids().await
    }
}

pub struct ChannelMailer {
    sender: mpsc::UnboundedSender<Notification>,
}

#[async_trait]
impl Mailer for ChannelMailer {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        self.sender.send(notification.clone())?;
        Ok(())
    }
}

/// Every account has `<account>@example.test` unless listed as unreachable.
#[derive(Default)]
pub struct TestDirectory {
    unreachable: HashSet<String>,
}

#[async_trait]
impl ContactDirectory for TestDirectory {
    async fn email_for(&self, account: &AccountId) -> anyhow::Result<Option<String>> {
        if self.unreachable.contains(account.as_str()) {
            return Ok(None);
        }
        Ok(Some(format!("{account}@example.test")))
    }
}

pub struct Harness {
    pub engine: DealEngine,
    pub ledger: Arc<FlakyLedger>,
    pub cache: Arc<FlakyCache>,
    pub log: Arc<InMemoryLog>,
    pub deliveries: mpsc::UnboundedReceiver<Notification>,
}

pub struct HarnessOptions {
    pub enumeration: bool,
    pub mode: StatusUpdateMode,
    pub unreachable_contacts: Vec<&'static str>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            enumeration: true,
            mode: StatusUpdateMode::Primary,
            unreachable_contacts: Vec::new(),
        }
    }
}

pub fn harness() -> Harness {
    harness_with(HarnessOptions::default())
}

pub fn harness_with(options: HarnessOptions) -> Harness {
    let inner = if options.enumeration {
        InMemoryLedger::new()
    } else {
        InMemoryLedger::without_enumeration()
    };
    let ledger = Arc::new(FlakyLedger::new(inner));
    let cache = Arc::new(FlakyCache::default());
    let log = Arc::new(InMemoryLog::default());

    let reconciler = Reconciler::new(ledger.clone())
        .with_cache(cache.clone())
        .with_log_reader(log.clone())
        .with_publisher(LogPublisher::new(log.clone(), options.mode))
        .with_timeout(LEDGER_TIMEOUT)
        .with_page_size(2);

    let (sender, deliveries) = mpsc::unbounded_channel();
    let directory = TestDirectory {
        unreachable: options
            .unreachable_contacts
            .iter()
            .map(|raw| raw.to_string())
            .collect(),
    };
    let dispatcher = Dispatcher::spawn(
        Arc::new(ChannelMailer { sender }),
        Arc::new(directory),
        64,
    );

    Harness {
        engine: DealEngine::new(Arc::new(reconciler)).with_dispatcher(dispatcher),
        ledger,
        cache,
        log,
        deliveries,
    }
}

impl Harness {
    /// Creates a deal and drives it to PENDING (accepted and funded).
    pub async fn funded(&self, proposal: DealProposal) -> DealId {
        let amount = proposal.amount.expect("proposal should carry an amount") as u64;
        let multi = proposal.arbiters.is_some();
        let outcome = self
            .engine
            .create_deal(&account(BUYER), proposal)
            .await
            .expect("deal should be created");
        let id = outcome.deal_id;

        self.engine
            .accept_as_seller(&id, &account(SELLER))
            .await
            .expect("seller should accept");
        let arbiter = if multi { PANEL[0] } else { ARBITER };
        self.engine
            .accept_as_arbiter(&id, &account(arbiter))
            .await
            .expect("arbiter should accept");
        self.engine
            .fund_deal(&id, &account(BUYER), amount)
            .await
            .expect("buyer should fund");
        id
    }

    /// Notifications delivered so far, waiting briefly for the worker.
    pub async fn drain_deliveries(&mut self) -> Vec<Notification> {
        let mut delivered = Vec::new();
        while let Ok(Some(notification)) =
            tokio::time::timeout(Duration::from_millis(100), self.deliveries.recv()).await
        {
            delivered.push(notification);
        }
        delivered
    }
}
