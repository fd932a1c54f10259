//! Actor-based concurrency for the registry
//!
//! Every state-changing operation goes through one task, so transitions are
//! planned and committed strictly one after another:
//! - Planning and applying see the same ledger (no interleaved writers)
//! - Reads bypass the actor and take a snapshot under the `RwLock`
//! - The bounded mailbox provides backpressure
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │              RegistryHandle (Clone)                   │
//! │         Sends messages to actor mailbox              │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │             RegistryActor (Single Task)               │
//! │   plan (state machine) → verify proof → submit tx    │
//! │                       │                               │
//! │                       ▼                               │
//! │        MembershipLedger::apply(receipt event)        │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! A caller that stops waiting only drops its reply channel; the actor
//! finishes the transition it started.
//!
//! Before planning, the actor folds any head-log entries past the live
//! cursor. Transactions that landed after a submit timeout, or that were
//! committed by another writer, are therefore seen before the next plan.

use crate::chain::LedgerClient;
use crate::codec::Proof;
use crate::config::{RegistryConfig, SyncConfig};
use crate::machine::{RegistryStateMachine, Transition};
use crate::membership::MembershipLedger;
use crate::metrics::Metrics;
use crate::sync::{self, EventSynchronizer, SyncReport};
use crate::types::{
    Address, IdentityCommitment, LogEntry, Receipt, RegistryEvent, Transaction, WithdrawPhase,
};
use crate::verifier::{verify_checked, ProofAction, ProofContext, ProofVerifier};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Message sent to the registry actor
#[derive(Debug)]
pub enum RegistryMessage {
    /// Register a commitment
    Register {
        caller: Address,
        commitment: IdentityCommitment,
        message_limit: u64,
        response: oneshot::Sender<Result<Receipt>>,
    },

    /// Request withdrawal
    Withdraw {
        caller: Address,
        commitment: IdentityCommitment,
        proof: Option<Proof>,
        response: oneshot::Sender<Result<Receipt>>,
    },

    /// Release a frozen bond
    Release {
        commitment: IdentityCommitment,
        response: oneshot::Sender<Result<Receipt>>,
    },

    /// Slash a member
    Slash {
        commitment: IdentityCommitment,
        receiver: Address,
        proof: Proof,
        response: oneshot::Sender<Result<Receipt>>,
    },

    /// Fold unseen head-log entries into the live ledger
    Reconcile {
        response: oneshot::Sender<Result<SyncReport>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that executes registry transitions
pub struct RegistryActor {
    machine: RegistryStateMachine,
    client: Arc<dyn LedgerClient>,
    verifier: Arc<dyn ProofVerifier>,
    head: EventSynchronizer,
    ledger: Arc<RwLock<MembershipLedger>>,
    metrics: Metrics,
    mailbox: mpsc::Receiver<RegistryMessage>,
    timeout: Duration,
}

impl RegistryActor {
    /// Create new actor
    pub fn new(
        config: RegistryConfig,
        sync: SyncConfig,
        client: Arc<dyn LedgerClient>,
        verifier: Arc<dyn ProofVerifier>,
        ledger: Arc<RwLock<MembershipLedger>>,
        metrics: Metrics,
        mailbox: mpsc::Receiver<RegistryMessage>,
    ) -> Self {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        // The live ledger follows the head, not the confirmed view
        let head = EventSynchronizer::new(
            client.clone(),
            SyncConfig {
                num_blocks_delayed: 0,
                ..sync
            },
        );
        Self {
            machine: RegistryStateMachine::new(config),
            client,
            verifier,
            head,
            ledger,
            metrics,
            mailbox,
            timeout,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            let (operation, result, response) = match msg {
                RegistryMessage::Shutdown => break,

                RegistryMessage::Reconcile { response } => {
                    let result = self.reconcile().await;
                    if let Err(e) = &result {
                        tracing::warn!(error = %e, "Live ledger reconcile failed");
                    }
                    let _ = response.send(result);
                    continue;
                }

                RegistryMessage::Register {
                    caller,
                    commitment,
                    message_limit,
                    response,
                } => (
                    "register",
                    self.register(caller, commitment, message_limit).await,
                    response,
                ),

                RegistryMessage::Withdraw {
                    caller,
                    commitment,
                    proof,
                    response,
                } => (
                    "withdraw",
                    self.withdraw(caller, commitment, proof).await,
                    response,
                ),

                RegistryMessage::Release {
                    commitment,
                    response,
                } => ("release", self.release(commitment).await, response),

                RegistryMessage::Slash {
                    commitment,
                    receiver,
                    proof,
                    response,
                } => (
                    "slash",
                    self.slash(commitment, receiver, proof).await,
                    response,
                ),
            };

            if let Err(e) = &result {
                self.metrics.record_rejected(e.kind());
                match e {
                    Error::InvariantViolation(_) => {
                        tracing::error!(operation, error = %e, "Registry operation failed")
                    }
                    _ => tracing::warn!(operation, error = %e, "Registry operation rejected"),
                }
            }

            // Caller may have stopped waiting
            let _ = response.send(result);
        }

        tracing::info!("Registry actor stopped");
    }

    async fn register(
        &self,
        caller: Address,
        commitment: IdentityCommitment,
        message_limit: u64,
    ) -> Result<Receipt> {
        self.reconcile().await?;
        let transition =
            self.plan(|machine, ledger| machine.plan_register(ledger, caller, commitment, message_limit))?;
        self.commit(transition).await
    }

    async fn withdraw(
        &self,
        caller: Address,
        commitment: IdentityCommitment,
        proof: Option<Proof>,
    ) -> Result<Receipt> {
        self.reconcile().await?;
        let now = self.now().await?;

        let planned =
            self.plan(|machine, ledger| machine.plan_withdraw(ledger, caller, commitment, now, false));

        let transition = match (planned, proof) {
            // Not the owner: the proof has to attest eligibility
            (Err(Error::NotOwner { .. }), Some(proof)) => {
                let context = ProofContext {
                    action: ProofAction::Withdraw,
                    commitment,
                    receiver: None,
                };
                let accepted =
                    verify_checked(self.verifier.as_ref(), &proof, &context, self.timeout).await?;
                self.plan(|machine, ledger| {
                    machine.plan_withdraw(ledger, caller, commitment, now, accepted)
                })?
            }
            (planned, _) => planned?,
        };

        self.commit(transition).await
    }

    async fn release(&self, commitment: IdentityCommitment) -> Result<Receipt> {
        self.reconcile().await?;
        let now = self.now().await?;
        let transition = self.plan(|machine, ledger| machine.plan_release(ledger, commitment, now))?;
        self.commit(transition).await
    }

    async fn slash(
        &self,
        commitment: IdentityCommitment,
        receiver: Address,
        proof: Proof,
    ) -> Result<Receipt> {
        self.reconcile().await?;
        self.plan(|machine, ledger| machine.check_slashable(ledger, commitment, receiver))?;

        let context = ProofContext {
            action: ProofAction::Slash,
            commitment,
            receiver: Some(receiver),
        };
        let valid = verify_checked(self.verifier.as_ref(), &proof, &context, self.timeout).await?;

        let transition =
            self.plan(|machine, ledger| machine.plan_slash(ledger, commitment, receiver, valid))?;
        self.commit(transition).await
    }

    /// Fold head-log entries past the live cursor into the live ledger.
    ///
    /// Only this actor writes the live ledger, so the cursor read here is
    /// still current when the entries are folded.
    async fn reconcile(&self) -> Result<SyncReport> {
        let from_block = self.ledger.read().cursor().map(|c| c.block_number);
        let entries = self.head.get_logs_with_retry(from_block, None).await?;

        let report = {
            let mut ledger = self.ledger.write();
            let report = sync::apply_entries(&mut ledger, &entries);
            if report.applied > 0 {
                self.metrics.update_ledger(&ledger);
            }
            report
        };

        if report.applied > 0 {
            tracing::info!(
                applied = report.applied,
                cursor = ?report.cursor,
                "Live ledger caught up with the chain"
            );
        }

        Ok(report)
    }

    /// Run a planner against the live ledger; the read lock never spans an await
    fn plan<T>(
        &self,
        planner: impl FnOnce(&RegistryStateMachine, &MembershipLedger) -> Result<T>,
    ) -> Result<T> {
        let ledger = self.ledger.read();
        planner(&self.machine, &ledger)
    }

    /// Timestamp of the head block
    async fn now(&self) -> Result<u64> {
        Ok(self
            .call("current block", self.client.current_block())
            .await?
            .timestamp)
    }

    async fn call<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::Timeout(format!("{} after {:?}", what, self.timeout)))?
    }

    /// Submit a transition and fold its event into the live ledger
    async fn commit(&self, transition: Transition) -> Result<Receipt> {
        let config = self.machine.config();
        let tx = Transaction {
            tx_id: Uuid::now_v7(),
            token: config.token,
            spender: config.registry_address,
            transfers: transition.transfers,
            event: Some(transition.event.clone()),
        };
        let tx_id = tx.tx_id;

        let receipt = match self.call("submit", self.client.submit(tx)).await {
            Ok(receipt) => receipt,
            Err(Error::Timeout(reason)) => {
                // The submission may still have landed; never resubmit blindly
                match self.call("receipt lookup", self.client.receipt(tx_id)).await? {
                    Some(receipt) => {
                        tracing::warn!(%tx_id, "Submission timed out but committed");
                        receipt
                    }
                    None => return Err(Error::Timeout(reason)),
                }
            }
            Err(e) => return Err(e),
        };

        let event = transition.event;
        let released = matches!(
            event,
            RegistryEvent::MemberWithdrawn {
                phase: WithdrawPhase::Released { .. },
                ..
            }
        );
        let entry = LogEntry::from_receipt(&receipt, event)?;

        {
            let mut ledger = self.ledger.write();
            ledger.apply(&entry).map_err(|e| {
                Error::InvariantViolation(format!(
                    "committed entry {} does not fold: {}",
                    entry.position(),
                    e
                ))
            })?;
            self.metrics.update_ledger(&ledger);
        }
        self.metrics.record_committed(entry.name(), released);

        tracing::info!(
            event = %entry.name(),
            commitment = %entry.event.commitment(),
            block_number = receipt.block_number,
            %tx_id,
            "Transition committed"
        );

        Ok(receipt)
    }
}

impl std::fmt::Debug for RegistryActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryActor")
            .field("machine", &self.machine)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Handle for sending messages to the actor
#[derive(Clone, Debug)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
}

impl RegistryHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<RegistryMessage>) -> Self {
        Self { sender }
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<Receipt>>) -> RegistryMessage,
    ) -> Result<Receipt> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Register a commitment
    pub async fn register(
        &self,
        caller: Address,
        commitment: IdentityCommitment,
        message_limit: u64,
    ) -> Result<Receipt> {
        self.request(|response| RegistryMessage::Register {
            caller,
            commitment,
            message_limit,
            response,
        })
        .await
    }

    /// Request withdrawal
    pub async fn withdraw(
        &self,
        caller: Address,
        commitment: IdentityCommitment,
        proof: Option<Proof>,
    ) -> Result<Receipt> {
        self.request(|response| RegistryMessage::Withdraw {
            caller,
            commitment,
            proof,
            response,
        })
        .await
    }

    /// Release a frozen bond
    pub async fn release(&self, commitment: IdentityCommitment) -> Result<Receipt> {
        self.request(|response| RegistryMessage::Release {
            commitment,
            response,
        })
        .await
    }

    /// Slash a member
    pub async fn slash(
        &self,
        commitment: IdentityCommitment,
        receiver: Address,
        proof: Proof,
    ) -> Result<Receipt> {
        self.request(|response| RegistryMessage::Slash {
            commitment,
            receiver,
            proof,
            response,
        })
        .await
    }

    /// Fold unseen head-log entries into the live ledger
    pub async fn reconcile(&self) -> Result<SyncReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Reconcile { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(RegistryMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the registry actor
pub fn spawn_registry_actor(
    config: RegistryConfig,
    sync: SyncConfig,
    client: Arc<dyn LedgerClient>,
    verifier: Arc<dyn ProofVerifier>,
    ledger: Arc<RwLock<MembershipLedger>>,
    metrics: Metrics,
    mailbox_capacity: usize,
) -> RegistryHandle {
    let (tx, rx) = mpsc::channel(mailbox_capacity);
    let actor = RegistryActor::new(config, sync, client, verifier, ledger, metrics, rx);

    tokio::spawn(async move {
        actor.run().await;
    });

    RegistryHandle::new(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::LocalChain;
    use crate::codec::{FieldValue, PROOF_POINTS};
    use crate::verifier::StaticVerifier;

    struct Fixture {
        chain: Arc<LocalChain>,
        verifier: Arc<StaticVerifier>,
        ledger: Arc<RwLock<MembershipLedger>>,
        handle: RegistryHandle,
        config: RegistryConfig,
    }

    fn fixture() -> Fixture {
        let config = RegistryConfig {
            minimal_deposit: 10,
            fee_percentage: 10,
            freeze_period_secs: 100,
            request_timeout_ms: 1_000,
            ..RegistryConfig::default()
        };
        let chain = Arc::new(LocalChain::new(1_000));
        let verifier = Arc::new(StaticVerifier::accepting());
        let ledger = Arc::new(RwLock::new(MembershipLedger::new(10)));
        let handle = spawn_registry_actor(
            config.clone(),
            SyncConfig {
                retry_initial_interval_ms: 5,
                retry_max_interval_ms: 20,
                retry_max_elapsed_ms: 100,
                ..SyncConfig::default()
            },
            chain.clone(),
            verifier.clone(),
            ledger.clone(),
            Metrics::new().unwrap(),
            16,
        );
        Fixture {
            chain,
            verifier,
            ledger,
            handle,
            config,
        }
    }

    fn fund(f: &Fixture, owner: Address, amount: u128) {
        f.chain.mint(f.config.token, owner, amount).unwrap();
        f.chain
            .approve(f.config.token, owner, f.config.registry_address, amount);
    }

    fn proof() -> Proof {
        Proof::groth16([FieldValue::from_u64(9); PROOF_POINTS])
    }

    #[tokio::test]
    async fn test_actor_spawn_and_shutdown() {
        let f = fixture();
        f.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_applies_committed_event() {
        let f = fixture();
        let owner = Address::from_low_u64(1);
        fund(&f, owner, 100);

        let receipt = f
            .handle
            .register(owner, FieldValue::from_u64(42), 2)
            .await
            .unwrap();
        assert_eq!(receipt.log_index, Some(0));

        let record = f.ledger.read().get_user(&FieldValue::from_u64(42)).unwrap();
        assert_eq!(record.index, 0);
        assert_eq!(record.deposit, 20);
        assert_eq!(
            f.chain
                .balance_of(f.config.token, f.config.registry_address)
                .await
                .unwrap(),
            20
        );
    }

    #[tokio::test]
    async fn test_failed_transfer_leaves_ledger_untouched() {
        let f = fixture();
        let owner = Address::from_low_u64(1);
        f.chain.mint(f.config.token, owner, 100).unwrap(); // no allowance

        let err = f
            .handle
            .register(owner, FieldValue::from_u64(42), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientAllowance { .. }));
        assert!(f.ledger.read().get(&FieldValue::from_u64(42)).is_none());
        assert_eq!(f.ledger.read().next_index(), 0);
    }

    #[tokio::test]
    async fn test_withdraw_by_stranger_needs_accepted_proof() {
        let f = fixture();
        let owner = Address::from_low_u64(1);
        let stranger = Address::from_low_u64(2);
        let c = FieldValue::from_u64(42);
        fund(&f, owner, 100);
        f.handle.register(owner, c, 1).await.unwrap();

        let err = f.handle.withdraw(stranger, c, None).await.unwrap_err();
        assert!(matches!(err, Error::NotOwner { .. }));
        assert_eq!(f.verifier.calls(), 0);

        f.verifier.set_accept(false);
        let err = f.handle.withdraw(stranger, c, Some(proof())).await.unwrap_err();
        assert!(matches!(err, Error::NotOwner { .. }));

        f.verifier.set_accept(true);
        f.handle.withdraw(stranger, c, Some(proof())).await.unwrap();
        assert_eq!(f.verifier.calls(), 2);
    }

    #[tokio::test]
    async fn test_slash_preconditions_before_verifier() {
        let f = fixture();
        let err = f
            .handle
            .slash(FieldValue::from_u64(5), Address::from_low_u64(3), proof())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(f.verifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_submit_timeout_checks_receipt() {
        let f = fixture();
        let owner = Address::from_low_u64(1);
        fund(&f, owner, 100);

        // The chain commits, then answers after the deadline
        f.chain.set_response_delay(Some(Duration::from_millis(1_500)));
        let receipt = f
            .handle
            .register(owner, FieldValue::from_u64(42), 1)
            .await
            .unwrap();
        f.chain.set_response_delay(None);

        assert_eq!(receipt.block_number, 1);
        assert_eq!(f.chain.head_number(), 1);
        assert!(f.ledger.read().get(&FieldValue::from_u64(42)).is_some());
    }

    #[tokio::test]
    async fn test_late_commit_is_seen_before_next_plan() {
        let f = fixture();
        let owner = Address::from_low_u64(1);
        fund(&f, owner, 100);

        // The chain never answers, and has no receipt when asked
        f.chain.set_hold_submissions(true);
        let err = f
            .handle
            .register(owner, FieldValue::from_u64(42), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(f.ledger.read().get(&FieldValue::from_u64(42)).is_none());

        // ...but the transaction lands afterwards
        f.chain.set_hold_submissions(false);
        f.chain.flush_mempool().unwrap();

        f.handle
            .register(owner, FieldValue::from_u64(43), 1)
            .await
            .unwrap();
        let ledger = f.ledger.read();
        assert_eq!(ledger.get_user(&FieldValue::from_u64(42)).unwrap().index, 0);
        assert_eq!(ledger.get_user(&FieldValue::from_u64(43)).unwrap().index, 1);
        ledger.check_conservation().unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_picks_up_foreign_entries() {
        let f = fixture();
        f.chain.mine_blocks(1);
        f.chain.inject_log(LogEntry {
            block_number: 1,
            log_index: 0,
            block_timestamp: 1_000,
            tx_id: Uuid::now_v7(),
            event: RegistryEvent::MemberRegistered {
                index: 0,
                commitment: FieldValue::from_u64(5),
                message_limit: 1,
                owner: Address::from_low_u64(7),
            },
        });

        let report = f.handle.reconcile().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(f.ledger.read().next_index(), 1);

        // Nothing new the second time
        assert_eq!(f.handle.reconcile().await.unwrap().applied, 0);
    }
}
