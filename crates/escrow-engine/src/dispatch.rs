use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use escrow_core::{AccountId, AssetType, Deal, DealId, DealStatus, Role};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::DealEvent;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Delivers one notification to one recipient.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Resolves ledger accounts to contact addresses.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn email_for(&self, account: &AccountId) -> anyhow::Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub event: DealEvent,
    pub deal_id: DealId,
    pub status: DealStatus,
    pub recipient: AccountId,
    pub recipient_role: Role,
    pub email: String,
    pub subject: String,
    pub amount: u64,
    pub asset_type: AssetType,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Notice {
    event: DealEvent,
    deal: Deal,
}

fn subject_for(event: &DealEvent, deal_id: &DealId) -> String {
    match event {
        DealEvent::Created => format!("New escrow deal {deal_id}"),
        DealEvent::SellerAccepted => format!("Seller accepted deal {deal_id}"),
        DealEvent::ArbiterAccepted => format!("Arbiter accepted deal {deal_id}"),
        DealEvent::Funded { .. } => format!("Deal {deal_id} is funded"),
        DealEvent::Released => format!("Funds released for deal {deal_id}"),
        DealEvent::DisputeRaised => format!("Dispute raised on deal {deal_id}"),
        DealEvent::EvidenceSubmitted { .. } => format!("Evidence submitted for deal {deal_id}"),
        DealEvent::VoteCast { .. } => format!("Arbiter vote recorded on deal {deal_id}"),
        DealEvent::Resolved { outcome } => format!("Deal {deal_id} resolved: {outcome}"),
    }
}

/// Queued, fire-and-forget notification handoff.
///
/// [`Dispatcher::notify`] never waits on delivery. A single worker drains the
/// queue; each delivery is attempted once and failures are only logged.
#[derive(Clone)]
pub struct Dispatcher {
    sender: mpsc::Sender<Notice>,
}

impl Dispatcher {
    pub fn spawn(
        mailer: Arc<dyn Mailer>,
        directory: Arc<dyn ContactDirectory>,
        capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_worker(receiver, mailer, directory));
        Self { sender }
    }

    pub fn notify(&self, event: DealEvent, deal: &Deal) {
        let notice = Notice {
            event,
            deal: deal.clone(),
        };
        if let Err(err) = self.sender.try_send(notice) {
            let (reason, notice) = match err {
                mpsc::error::TrySendError::Full(notice) => ("queue full", notice),
                mpsc::error::TrySendError::Closed(notice) => ("worker stopped", notice),
            };
            warn!(
                deal_id = %notice.deal.deal_id,
                event = notice.event.name(),
                "dropping notification: {reason}"
            );
        }
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<Notice>,
    mailer: Arc<dyn Mailer>,
    directory: Arc<dyn ContactDirectory>,
) {
    while let Some(notice) = receiver.recv().await {
        deliver_notice(&notice, mailer.as_ref(), directory.as_ref()).await;
    }
    debug!("notification worker stopped");
}

async fn deliver_notice(notice: &Notice, mailer: &dyn Mailer, directory: &dyn ContactDirectory) {
    let deal = &notice.deal;
    let subject = subject_for(&notice.event, &deal.deal_id);

    for (recipient, role) in notice.event.recipients(deal) {
        let email = match directory.email_for(&recipient).await {
            Ok(Some(email)) => email,
            Ok(None) => {
                debug!(deal_id = %deal.deal_id, %recipient, "no contact address, skipping");
                continue;
            }
            Err(err) => {
                warn!(deal_id = %deal.deal_id, %recipient, "contact lookup failed: {err:#}");
                continue;
            }
        };

        let notification = Notification {
            event: notice.event.clone(),
            deal_id: deal.deal_id.clone(),
            status: deal.status,
            recipient: recipient.clone(),
            recipient_role: role,
            email,
            subject: subject.clone(),
            amount: deal.amount,
            asset_type: deal.asset.asset_type(),
            occurred_at: deal.updated_at,
        };

        match mailer.deliver(&notification).await {
            Ok(()) => info!(
                deal_id = %deal.deal_id,
                event = notice.event.name(),
                %recipient,
                "notification delivered"
            ),
            Err(err) => warn!(
                deal_id = %deal.deal_id,
                event = notice.event.name(),
                %recipient,
                "notification failed: {err:#}"
            ),
        }
    }
}
