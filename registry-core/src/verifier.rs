//! Proof verifier collaborator
//!
//! The registry never looks inside a proof. It checks the bundle's shape,
//! then hands it to a [`ProofVerifier`] together with the context the proof
//! is supposed to attest.

use crate::codec::Proof;
use crate::types::{Address, IdentityCommitment};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Operation a proof is presented for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofAction {
    /// Withdrawal requested by someone other than the owner
    Withdraw,
    /// Slash of a member that exceeded its rate limit
    Slash,
}

/// What a proof is claimed to attest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofContext {
    /// Operation
    pub action: ProofAction,
    /// Member the proof is about
    pub commitment: IdentityCommitment,
    /// Slash receiver, if any
    pub receiver: Option<Address>,
}

/// Zero-knowledge proof verification
#[async_trait]
pub trait ProofVerifier: Send + Sync {
    /// Whether `proof` is valid for `context`
    async fn verify(&self, proof: &Proof, context: &ProofContext) -> Result<bool>;
}

/// Check the bundle's shape, then ask the verifier within `timeout`
pub async fn verify_checked(
    verifier: &dyn ProofVerifier,
    proof: &Proof,
    context: &ProofContext,
    timeout: Duration,
) -> Result<bool> {
    proof.check_shape()?;

    match tokio::time::timeout(timeout, verifier.verify(proof, context)).await {
        Ok(verdict) => verdict,
        Err(_) => Err(Error::Timeout(format!(
            "proof verification for {} after {:?}",
            context.commitment, timeout
        ))),
    }
}

/// Verifier with a fixed verdict that counts its calls
#[derive(Debug)]
pub struct StaticVerifier {
    accept: AtomicBool,
    calls: AtomicUsize,
}

impl StaticVerifier {
    /// Verifier accepting every well-formed proof
    pub fn accepting() -> Self {
        Self {
            accept: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    /// Verifier rejecting every proof
    pub fn rejecting() -> Self {
        Self {
            accept: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Change the verdict
    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    /// Number of proofs seen so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProofVerifier for StaticVerifier {
    async fn verify(&self, _proof: &Proof, context: &ProofContext) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let accept = self.accept.load(Ordering::SeqCst);
        tracing::debug!(
            action = ?context.action,
            commitment = %context.commitment,
            accept,
            "Proof verified"
        );
        Ok(accept)
    }
}
