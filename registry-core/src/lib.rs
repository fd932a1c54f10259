//! Bonded Membership Registry
//!
//! Rate-limited anti-spam membership: members bond tokens against an
//! identity commitment, withdraw through a freeze period, and lose their
//! bond to anyone who proves they exceeded their message quota.
//!
//! # Architecture
//!
//! - **Event Sourcing**: Membership is a fold over the registry event log
//! - **Single Writer**: One actor plans and commits every transition
//! - **Effects as Data**: The state machine returns transitions, the actor executes them
//! - **Confirmed View**: The synchronizer only trusts blocks past the confirmation depth
//!
//! # Invariants
//!
//! - Conservation: bonded pool + payouts == deposits, and the registry's balance equals the pool
//! - Deterministic replay: the confirmed log reproduces the live ledger
//! - Index monotonicity: the n-th registration gets index n-1, never reused
//! - Freeze: no release before `freeze_until`

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod chain;
pub mod codec;
pub mod config;
pub mod economics;
pub mod error;
pub mod machine;
pub mod membership;
pub mod metrics;
pub mod registry;
pub mod storage;
pub mod sync;
pub mod types;
pub mod verifier;

// Re-exports
pub use chain::{LedgerClient, LocalChain};
pub use codec::{FieldValue, Proof};
pub use config::Config;
pub use error::{Error, Result};
pub use membership::MembershipLedger;
pub use registry::Registry;
pub use storage::Storage;
pub use types::{
    Address, IdentityCommitment, LogEntry, MemberRecord, MemberState, Receipt, RegistryEvent,
    TokenAmount, WithdrawPhase,
};
pub use verifier::{ProofVerifier, StaticVerifier};
