//! Registry service
//!
//! Ties the writer actor, the live ledger, the synchronizer and optional
//! RocksDB persistence into one API.
//!
//! Two views of membership are kept:
//! - the live ledger, updated by the actor as soon as a transaction commits
//! - the confirmed view, built by the synchronizer from confirmed logs only
//!
//! Both are folds over the same log through [`MembershipLedger::apply`].
//! The live ledger also folds head entries it did not commit itself before
//! every write and on [`Registry::sync_now`].
//!
//! # Example
//!
//! ```no_run
//! use registry_core::{Config, LocalChain, Registry, StaticVerifier};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> registry_core::Result<()> {
//!     let config = Config::default();
//!     let chain = Arc::new(LocalChain::new(0));
//!     let verifier = Arc::new(StaticVerifier::rejecting());
//!     let registry = Registry::open(config, chain, verifier).await?;
//!
//!     // let receipt = registry.register(caller, commitment, 1).await?;
//!
//!     registry.shutdown().await
//! }
//! ```

use crate::{
    actor::{spawn_registry_actor, RegistryHandle},
    chain::LedgerClient,
    codec::Proof,
    config::SyncConfig,
    membership::MembershipLedger,
    metrics::Metrics,
    storage::Storage,
    sync::{self, EventSynchronizer, SyncReport},
    types::{Address, IdentityCommitment, LogEntry, MemberRecord, Receipt, TokenAmount},
    verifier::ProofVerifier,
    Config, Error, Result,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Main registry interface
pub struct Registry {
    /// Actor handle for state-changing operations
    handle: RegistryHandle,

    /// Ledger updated on every commit
    live: Arc<RwLock<MembershipLedger>>,

    /// Ledger built from confirmed logs
    confirmed: Arc<RwLock<MembershipLedger>>,

    /// Confirmed-log reader
    synchronizer: Arc<EventSynchronizer>,

    /// Ledger collaborator
    client: Arc<dyn LedgerClient>,

    /// Metrics
    metrics: Metrics,

    /// Background sync loop
    sync_task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,

    /// Configuration
    config: Config,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("service_name", &self.config.service_name)
            .field("synchronizer", &self.synchronizer)
            .finish()
    }
}

impl Registry {
    /// Open the registry against a ledger and a proof verifier
    ///
    /// The confirmed view resumes from the RocksDB checkpoint when storage is
    /// enabled. The live ledger starts from the confirmed view and then folds
    /// every entry up to the current head.
    pub async fn open(
        config: Config,
        client: Arc<dyn LedgerClient>,
        verifier: Arc<dyn ProofVerifier>,
    ) -> Result<Self> {
        config.validate()?;
        let minimal_deposit = config.registry.minimal_deposit();
        let metrics = Metrics::new()?;

        let mut synchronizer = EventSynchronizer::new(client.clone(), config.sync.clone())
            .with_metrics(metrics.clone());

        let mut confirmed = MembershipLedger::new(minimal_deposit);
        if config.storage.enabled {
            let storage = Arc::new(Storage::open(&config.storage)?);
            if let Some(restored) = storage.load_ledger()? {
                if restored.minimal_deposit() != minimal_deposit {
                    return Err(Error::Config(format!(
                        "checkpoint built with minimal deposit {}, configured {}",
                        restored.minimal_deposit(),
                        minimal_deposit
                    )));
                }
                confirmed = restored;
            }
            synchronizer = synchronizer.with_storage(storage);
        }

        synchronizer.catch_up(&mut confirmed).await?;

        // Unconfirmed entries only feed the live ledger
        let mut live = confirmed.clone();
        let head_reader = EventSynchronizer::new(
            client.clone(),
            SyncConfig {
                num_blocks_delayed: 0,
                ..config.sync.clone()
            },
        );
        head_reader.catch_up(&mut live).await?;
        live.check_conservation()?;
        metrics.update_ledger(&live);

        let live = Arc::new(RwLock::new(live));
        let handle = spawn_registry_actor(
            config.registry.clone(),
            config.sync.clone(),
            client.clone(),
            verifier,
            live.clone(),
            metrics.clone(),
            config.actor.mailbox_capacity,
        );

        tracing::info!(
            service = %config.service_name,
            members = live.read().members().count(),
            confirmed_cursor = ?confirmed.cursor(),
            "Registry opened"
        );

        Ok(Self {
            handle,
            live,
            confirmed: Arc::new(RwLock::new(confirmed)),
            synchronizer: Arc::new(synchronizer),
            client,
            metrics,
            sync_task: Mutex::new(None),
            config,
        })
    }

    /// Register `commitment` for `caller` with a message quota
    pub async fn register(
        &self,
        caller: Address,
        commitment: IdentityCommitment,
        message_limit: u64,
    ) -> Result<Receipt> {
        self.handle.register(caller, commitment, message_limit).await
    }

    /// Start the freeze period; non-owners must supply an eligibility proof
    pub async fn withdraw(
        &self,
        caller: Address,
        commitment: IdentityCommitment,
        proof: Option<Proof>,
    ) -> Result<Receipt> {
        self.handle.withdraw(caller, commitment, proof).await
    }

    /// Return the bond once the freeze period is over
    pub async fn release(&self, commitment: IdentityCommitment) -> Result<Receipt> {
        self.handle.release(commitment).await
    }

    /// Slash a member on a proof of rate-limit violation
    pub async fn slash(
        &self,
        commitment: IdentityCommitment,
        receiver: Address,
        proof: Proof,
    ) -> Result<Receipt> {
        self.handle.slash(commitment, receiver, proof).await
    }

    /// Member record from the live ledger
    pub fn get_user(&self, commitment: &IdentityCommitment) -> Result<MemberRecord> {
        self.live.read().get_user(commitment)
    }

    /// Member record from the confirmed view
    pub fn get_confirmed_user(&self, commitment: &IdentityCommitment) -> Result<MemberRecord> {
        self.confirmed.read().get_user(commitment)
    }

    /// Consistent copy of the live ledger
    pub fn snapshot(&self) -> MembershipLedger {
        self.live.read().clone()
    }

    /// Consistent copy of the confirmed view
    pub fn confirmed_snapshot(&self) -> MembershipLedger {
        self.confirmed.read().clone()
    }

    /// Bonds currently held
    pub fn bonded_pool(&self) -> TokenAmount {
        self.live.read().bonded_pool()
    }

    /// Confirmed log entries, oldest first
    pub async fn get_logs(
        &self,
        from_block: Option<u64>,
        to_block: Option<u64>,
    ) -> Result<Vec<LogEntry>> {
        self.synchronizer
            .get_logs_with_retry(from_block, to_block)
            .await
    }

    /// Run one sync pass over the confirmed view, then bring the live
    /// ledger up to the head
    pub async fn sync_now(&self) -> Result<SyncReport> {
        let report = self.synchronizer.sync_view(&self.confirmed).await?;
        self.handle.reconcile().await?;
        Ok(report)
    }

    /// Start the background sync loop (no-op if running)
    pub fn spawn_sync(&self) {
        let mut task = self.sync_task.lock();
        if task.is_some() {
            return;
        }

        let (tx, rx) = watch::channel(false);
        let join = tokio::spawn(
            self.synchronizer
                .clone()
                .run(self.confirmed.clone(), rx),
        );
        *task = Some((tx, join));
    }

    /// Fresh ledger replayed from the whole confirmed log
    pub async fn rebuild_from_logs(&self) -> Result<MembershipLedger> {
        let entries = self.get_logs(None, None).await?;
        let (ledger, report) = sync::replay(self.config.registry.minimal_deposit(), &entries);
        if report.rejected > 0 {
            tracing::warn!(rejected = report.rejected, "Replay rejected entries");
        }
        Ok(ledger)
    }

    /// Check both conservation equations and that the registry's token
    /// balance equals the bonded pool
    pub async fn check_conservation(&self) -> Result<()> {
        let bonded_pool = {
            let ledger = self.live.read();
            ledger.check_conservation()?;
            ledger.bonded_pool()
        };

        let registry = &self.config.registry;
        let balance = self
            .client
            .balance_of(registry.token, registry.registry_address)
            .await?;
        if balance != bonded_pool {
            return Err(Error::InvariantViolation(format!(
                "registry balance {} != bonded pool {}",
                balance, bonded_pool
            )));
        }

        Ok(())
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration in force
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the sync loop and the actor
    pub async fn shutdown(self) -> Result<()> {
        let task = self.sync_task.lock().take();
        if let Some((tx, join)) = task {
            let _ = tx.send(true);
            join.await
                .map_err(|e| Error::Concurrency(format!("sync task: {}", e)))?;
        }
        self.handle.shutdown().await
    }
}
