use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by lifecycle and read operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EscrowError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("deal {0} not found")]
    NotFound(String),
    #[error("state conflict: {0}")]
    StateConflict(String),
    #[error("ledger rejected operation: {0}")]
    LedgerFailure(String),
    #[error("transient failure: {0}")]
    TransientIo(String),
}

impl EscrowError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::StateConflict(message.into())
    }
}

/// Outcome of a call against the ledger boundary that did not succeed.
///
/// `Rejected` is a named failure code reported by the contract; `Transport`
/// and `Timeout` say nothing about whether the operation executed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("{status}")]
    Rejected { status: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("ledger call timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed ledger response: {0}")]
    Decode(String),
    #[error("ledger does not support {0}")]
    Unsupported(&'static str),
}

impl LedgerError {
    pub fn rejected(status: impl Into<String>) -> Self {
        Self::Rejected {
            status: status.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

impl From<LedgerError> for EscrowError {
    fn from(err: LedgerError) -> Self {
        if err.is_transient() {
            EscrowError::TransientIo(err.to_string())
        } else {
            EscrowError::LedgerFailure(err.to_string())
        }
    }
}
