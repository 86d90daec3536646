pub mod dispatch;
pub mod events;
pub mod lifecycle;
pub mod publish;
pub mod reconciler;

pub use dispatch::{ContactDirectory, DEFAULT_QUEUE_CAPACITY, Dispatcher, Mailer, Notification};
pub use events::DealEvent;
pub use lifecycle::{DealEngine, TransitionOutcome};
pub use publish::{LogPublisher, StatusUpdateMode, StatusUpdateStrategy, strategy_for};
pub use reconciler::{
    DEFAULT_LEDGER_TIMEOUT, DEFAULT_PAGE_SIZE, DealListing, DealSource, LedgerView,
    ReconciledDeal, Reconciler,
};
