use thiserror::Error;
use tokio::sync::mpsc;

/// How a failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or timeout problem; retrying later may succeed.
    Transient,
    /// Bad or revoked credentials; fatal for the affected session.
    Credential,
    /// The venue understood the request and refused it.
    Rejected,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Invalid order parameters: {0}")]
    InvalidOrder(String),

    #[error("Unexpected response: {0}")]
    MalformedResponse(String),
}

impl ExchangeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::Network(_)
            | ExchangeError::Timeout(_)
            | ExchangeError::MalformedResponse(_) => ErrorKind::Transient,
            ExchangeError::Authentication(_) => ErrorKind::Credential,
            ExchangeError::Rejected(_) | ExchangeError::InvalidOrder(_) => ErrorKind::Rejected,
        }
    }

    pub fn is_credential(&self) -> bool {
        self.kind() == ErrorKind::Credential
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Ledger network error: {0}")]
    Network(String),

    #[error("Ledger API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    #[error("Invalid ledger response: {0}")]
    MalformedResponse(String),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Network(_) => true,
            LedgerError::Api { status, .. } => *status == 429 || *status >= 500,
            LedgerError::TransferFailed(_)
            | LedgerError::InvalidAddress(_)
            | LedgerError::InvalidKey(_)
            | LedgerError::MalformedResponse(_) => false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FeedError {
    #[error("Market data connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Market data stream error: {0}")]
    Stream(String),

    #[error("Invalid subscription for {symbol}@{timeframe}: {reason}")]
    InvalidSubscription {
        symbol: String,
        timeframe: String,
        reason: String,
    },
}

impl FeedError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, FeedError::InvalidSubscription { .. })
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Failed to (de)serialize record at {path}: {reason}")]
    Serialization { path: String, reason: String },

    #[error("Invalid store path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PaymentError {
    #[error("A payment request is already pending for tenant {0}")]
    AlreadyPending(String),

    #[error("A confirmed payment for tenant {0} is still being credited")]
    AwaitingCredit(String),

    #[error("No payment found for tenant {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised while talking to an actor through its handle.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActorError {
    #[error("Actor is no longer running")]
    Closed,

    #[error("No response received from actor")]
    NoResponse,
}

impl<T> From<mpsc::error::SendError<T>> for ActorError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        ActorError::Closed
    }
}
