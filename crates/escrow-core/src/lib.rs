pub mod error;
pub mod events;
pub mod fees;
pub mod machine;
pub mod models;
pub mod storage;
pub mod terms;

pub use error::{EscrowError, LedgerError};
pub use events::{DealMessage, LogEnvelope};
pub use fees::arbiter_fee;
pub use machine::{Command, Transition};
pub use models::{
    AccountId, ArbiterFee, ArbiterFeeType, ArbiterPanel, Asset, AssetType, Deal, DealId,
    DealRecord, DealStatus, FundingRoute, Reputation, Resolution, Role, TxReceipt, Vote,
    VotingStatus,
};
pub use storage::{CacheStore, LedgerClient, LogAppender, LogReader};
pub use terms::{DealProposal, DealTerms};
