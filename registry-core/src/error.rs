//! Error types for the registry

use crate::types::{Address, TokenAmount};
use thiserror::Error;

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Registry errors
///
/// Variants fall into the categories callers care about: validation and
/// timing errors are rejected before anything is submitted, economic errors
/// come back from the token ledger unchanged, and synchronization errors are
/// transient.
#[derive(Error, Debug)]
pub enum Error {
    /// Message limit is zero or above the configured maximum
    #[error("Invalid quota: message limit {limit} not in 1..={max}")]
    InvalidQuota {
        /// Requested message limit
        limit: u64,
        /// Configured maximum
        max: u64,
    },

    /// Identity commitment is zero or not a canonical field element
    #[error("Invalid commitment: {0}")]
    InvalidCommitment(String),

    /// Commitment already registered in a non-terminal state
    #[error("Duplicate commitment: {0}")]
    DuplicateCommitment(String),

    /// No record for this commitment
    #[error("Member not found: {0}")]
    NotFound(String),

    /// Caller does not own the commitment and no proof attested eligibility
    #[error("Caller {caller} does not own commitment {commitment}")]
    NotOwner {
        /// Caller address
        caller: Address,
        /// Commitment being withdrawn
        commitment: String,
    },

    /// A withdrawal is already pending for this commitment
    #[error("Withdrawal already requested for {0}")]
    AlreadyWithdrawing(String),

    /// Operation not allowed in the member's current state
    #[error("Wrong state for {commitment}: {state}")]
    WrongState {
        /// Commitment
        commitment: String,
        /// Current state name
        state: &'static str,
    },

    /// Freeze period has not elapsed yet
    #[error("cannot release yet")]
    ReleaseTooEarly {
        /// Timestamp at which release becomes possible
        freeze_until: u64,
        /// Timestamp of the attempt
        now: u64,
    },

    /// Every leaf of the membership tree has been assigned
    #[error("Registry full: capacity {0} reached")]
    RegistryFull(u64),

    /// Slash receiver is the zero address or the registry itself
    #[error("Invalid receiver address: {0}")]
    InvalidReceiver(Address),

    /// Proof rejected by the verifier
    #[error("Invalid proof: {0}")]
    InvalidProof(String),

    /// Proof bundle does not have the expected structure
    #[error("Invalid proof shape: {0}")]
    InvalidProofShape(String),

    /// Token balance too low for a transfer
    #[error("Insufficient balance: {account} has {available}, needs {required}")]
    InsufficientBalance {
        /// Account being debited
        account: Address,
        /// Current balance
        available: TokenAmount,
        /// Amount required
        required: TokenAmount,
    },

    /// Token allowance too low for a transfer
    #[error("Insufficient allowance: {owner} approved {available} to {spender}, needs {required}")]
    InsufficientAllowance {
        /// Account being debited
        owner: Address,
        /// Spender executing the transfer
        spender: Address,
        /// Current allowance
        available: TokenAmount,
        /// Amount required
        required: TokenAmount,
    },

    /// Integer overflow in deposit or payout arithmetic
    #[error("Arithmetic overflow: {0}")]
    ArithmeticOverflow(String),

    /// Ledger collaborator unreachable (retryable)
    #[error("Sync unavailable: {0}")]
    SyncUnavailable(String),

    /// Collaborator call exceeded its deadline (retryable)
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Log entry inconsistent with the derived membership state
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Invariant violation (conservation, projection divergence)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SyncUnavailable(_) | Error::Timeout(_))
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidQuota { .. } => "invalid_quota",
            Error::InvalidCommitment(_) => "invalid_commitment",
            Error::DuplicateCommitment(_) => "duplicate_commitment",
            Error::NotFound(_) => "not_found",
            Error::NotOwner { .. } => "not_owner",
            Error::AlreadyWithdrawing(_) => "already_withdrawing",
            Error::WrongState { .. } => "wrong_state",
            Error::ReleaseTooEarly { .. } => "release_too_early",
            Error::RegistryFull(_) => "registry_full",
            Error::InvalidReceiver(_) => "invalid_receiver",
            Error::InvalidProof(_) => "invalid_proof",
            Error::InvalidProofShape(_) => "invalid_proof_shape",
            Error::InsufficientBalance { .. } => "insufficient_balance",
            Error::InsufficientAllowance { .. } => "insufficient_allowance",
            Error::ArithmeticOverflow(_) => "arithmetic_overflow",
            Error::SyncUnavailable(_) => "sync_unavailable",
            Error::Timeout(_) => "timeout",
            Error::InvalidEvent(_) => "invalid_event",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::InvariantViolation(_) => "invariant_violation",
            Error::Concurrency(_) => "concurrency",
            Error::Config(_) => "config",
            Error::Metrics(_) => "metrics",
            Error::Io(_) => "io",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
