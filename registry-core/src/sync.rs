//! Event synchronizer
//!
//! Reads registry events back from the ledger collaborator and folds them
//! into a [`MembershipLedger`]. Only confirmed blocks are visible: a block
//! counts as confirmed once it is `num_blocks_delayed` behind the head.
//!
//! ```text
//!   head ─────────────────────────────────────────────┐
//!   confirmed = head - num_blocks_delayed ──┐         │
//!   blocks:  0 1 2 3 ... confirmed │ hidden ... head  │
//!            └── visible to get_logs ──┘
//! ```
//!
//! The collaborator may return entries in any order and more than once.
//! [`EventSynchronizer::get_logs`] sorts and deduplicates them; replay skips
//! anything at or before the ledger cursor.

use crate::chain::LedgerClient;
use crate::config::SyncConfig;
use crate::membership::MembershipLedger;
use crate::metrics::Metrics;
use crate::storage::Storage;
use crate::types::{BlockRange, LogEntry, LogPosition, TokenAmount};
use crate::{Error, Result};
use backoff::ExponentialBackoffBuilder;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Outcome of folding a batch of entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Entries folded into the ledger
    pub applied: usize,
    /// Entries at or before the cursor
    pub skipped: usize,
    /// Entries inconsistent with the derived state
    pub rejected: usize,
    /// Ledger cursor after the batch
    pub cursor: Option<LogPosition>,
    /// Confirmed head the batch was read against
    pub confirmed_head: Option<u64>,
}

/// Fold `entries` into `ledger` in the order given.
///
/// Entries at or before the cursor are skipped. Inconsistent entries are
/// rejected one by one and leave the ledger untouched.
pub fn apply_entries(ledger: &mut MembershipLedger, entries: &[LogEntry]) -> SyncReport {
    fold(ledger, entries).0
}

/// Build a fresh ledger from an ordered log
pub fn replay(minimal_deposit: TokenAmount, entries: &[LogEntry]) -> (MembershipLedger, SyncReport) {
    let mut ledger = MembershipLedger::new(minimal_deposit);
    let report = apply_entries(&mut ledger, entries);
    (ledger, report)
}

fn fold<'a>(ledger: &mut MembershipLedger, entries: &'a [LogEntry]) -> (SyncReport, Vec<&'a LogEntry>) {
    let mut report = SyncReport::default();
    let mut applied = Vec::with_capacity(entries.len());

    for entry in entries {
        if let Some(cursor) = ledger.cursor() {
            if entry.position() <= cursor {
                report.skipped += 1;
                continue;
            }
        }

        match ledger.apply(entry) {
            Ok(()) => {
                report.applied += 1;
                applied.push(entry);
            }
            Err(e) => {
                report.rejected += 1;
                tracing::warn!(
                    position = %entry.position(),
                    event = %entry.name(),
                    commitment = %entry.event.commitment(),
                    error = %e,
                    "Rejected log entry"
                );
            }
        }
    }

    report.cursor = ledger.cursor();
    (report, applied)
}

/// Confirmed-log reader and catch-up driver
pub struct EventSynchronizer {
    client: Arc<dyn LedgerClient>,
    config: SyncConfig,
    storage: Option<Arc<Storage>>,
    metrics: Option<Metrics>,
    pass_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for EventSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSynchronizer")
            .field("config", &self.config)
            .field("storage", &self.storage)
            .finish()
    }
}

impl EventSynchronizer {
    /// Create a synchronizer over a ledger client
    pub fn new(client: Arc<dyn LedgerClient>, config: SyncConfig) -> Self {
        Self {
            client,
            config,
            storage: None,
            metrics: None,
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Persist every catch-up batch
    pub fn with_storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Record sync metrics
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Configuration in force
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    /// Newest confirmed block, or `None` while the chain is shorter than the delay
    pub async fn confirmed_head(&self) -> Result<Option<u64>> {
        let head = tokio::time::timeout(self.request_timeout(), self.client.current_block())
            .await
            .map_err(|_| Error::SyncUnavailable("head request timed out".to_string()))??;
        Ok(head.number.checked_sub(self.config.num_blocks_delayed))
    }

    /// Confirmed entries in `[from_block, to_block]`, oldest first, without duplicates
    pub async fn get_logs(
        &self,
        from_block: Option<u64>,
        to_block: Option<u64>,
    ) -> Result<Vec<LogEntry>> {
        let confirmed = match self.confirmed_head().await? {
            Some(confirmed) => confirmed,
            None => return Ok(Vec::new()),
        };

        let from_block = from_block.unwrap_or(0);
        let to_block = to_block.map_or(confirmed, |to| to.min(confirmed));
        if from_block > to_block {
            return Ok(Vec::new());
        }

        let range = BlockRange {
            from_block,
            to_block,
        };
        let mut entries = tokio::time::timeout(self.request_timeout(), self.client.get_logs(range))
            .await
            .map_err(|_| Error::SyncUnavailable("log request timed out".to_string()))??;

        entries.retain(|entry| range.contains(entry.block_number));
        entries.sort_by_key(LogEntry::position);
        let fetched = entries.len();
        entries.dedup_by(|later, earlier| {
            let duplicate = later.position() == earlier.position();
            if duplicate && later != earlier {
                tracing::warn!(
                    position = %later.position(),
                    "Conflicting entries at one log position, keeping the first"
                );
            }
            duplicate
        });

        tracing::debug!(
            from_block,
            to_block,
            fetched,
            unique = entries.len(),
            "Fetched confirmed logs"
        );

        Ok(entries)
    }

    /// [`Self::get_logs`] with exponential backoff on retryable errors
    pub async fn get_logs_with_retry(
        &self,
        from_block: Option<u64>,
        to_block: Option<u64>,
    ) -> Result<Vec<LogEntry>> {
        self.retry("log fetch", move || self.get_logs(from_block, to_block))
            .await
    }

    /// Run `op` under the configured backoff, retrying only retryable errors
    async fn retry<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.retry_initial_interval_ms))
            .with_max_interval(Duration::from_millis(self.config.retry_max_interval_ms))
            .with_max_elapsed_time(Some(Duration::from_millis(self.config.retry_max_elapsed_ms)))
            .build();

        backoff::future::retry_notify(
            policy,
            || {
                let attempt = op();
                async move {
                    attempt.await.map_err(|e| {
                        if e.is_retryable() {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |e: Error, wait: Duration| {
                tracing::warn!(what, error = %e, retry_in = ?wait, "Chain request failed, retrying");
            },
        )
        .await
    }

    /// Fold confirmed entries after the ledger's cursor into `ledger`
    pub async fn catch_up(&self, ledger: &mut MembershipLedger) -> Result<SyncReport> {
        let started = Instant::now();
        let from_block = ledger.cursor().map(|c| c.block_number);

        // Head and logs are read in one attempt so an outage retries both
        let (confirmed_head, entries) = self
            .retry("catch-up", || async move {
                let confirmed_head = self.confirmed_head().await?;
                let entries = self.get_logs(from_block, confirmed_head).await?;
                Ok::<_, Error>((confirmed_head, entries))
            })
            .await?;

        let (mut report, applied) = fold(ledger, &entries);
        report.confirmed_head = confirmed_head;

        if let Some(storage) = &self.storage {
            if !applied.is_empty() {
                let applied: Vec<LogEntry> = applied.into_iter().cloned().collect();
                storage.persist_batch(&applied, ledger)?;
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_sync(
                report.applied,
                report.rejected,
                confirmed_head.unwrap_or(0),
                started.elapsed().as_secs_f64(),
            );
        }

        if report.applied > 0 || report.rejected > 0 {
            tracing::info!(
                applied = report.applied,
                skipped = report.skipped,
                rejected = report.rejected,
                cursor = ?report.cursor,
                "Sync pass complete"
            );
        }

        Ok(report)
    }

    /// Catch up a shared view; passes over the same synchronizer never overlap
    pub async fn sync_view(&self, view: &RwLock<MembershipLedger>) -> Result<SyncReport> {
        let _pass = self.pass_lock.lock().await;

        // Work on a copy so no lock is held across the await
        let mut working = view.read().clone();
        let report = self.catch_up(&mut working).await?;
        *view.write() = working;
        Ok(report)
    }

    /// Poll until `shutdown` flips to `true`, keeping `view` caught up
    pub async fn run(
        self: Arc<Self>,
        view: Arc<RwLock<MembershipLedger>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            num_blocks_delayed = self.config.num_blocks_delayed,
            poll_interval_ms = self.config.poll_interval_ms,
            "Synchronizer started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_view(&view).await {
                        tracing::warn!(error = %e, "Sync pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Synchronizer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::LocalChain;
    use crate::codec::FieldValue;
    use crate::types::{Address, RegistryEvent, WithdrawPhase};
    use uuid::Uuid;

    fn registered(block_number: u64, index: u64, commitment: u64) -> LogEntry {
        LogEntry {
            block_number,
            log_index: 0,
            block_timestamp: 0,
            tx_id: Uuid::now_v7(),
            event: RegistryEvent::MemberRegistered {
                index,
                commitment: FieldValue::from_u64(commitment),
                message_limit: 1,
                owner: Address::from_low_u64(1),
            },
        }
    }

    fn sync_config(delay: u64) -> SyncConfig {
        SyncConfig {
            num_blocks_delayed: delay,
            retry_initial_interval_ms: 5,
            retry_max_interval_ms: 20,
            retry_max_elapsed_ms: 100,
            ..SyncConfig::default()
        }
    }

    #[tokio::test]
    async fn test_confirmation_delay_hides_recent_blocks() {
        let chain = Arc::new(LocalChain::new(0));
        chain.mine_blocks(1);
        chain.inject_log(registered(1, 0, 1));
        chain.mine_blocks(1);
        chain.inject_log(registered(2, 1, 2));
        chain.mine_blocks(2); // head = 4

        let sync = EventSynchronizer::new(chain.clone(), sync_config(2));
        assert_eq!(sync.confirmed_head().await.unwrap(), Some(2));
        assert_eq!(sync.get_logs(None, None).await.unwrap().len(), 2);

        let strict = EventSynchronizer::new(chain.clone(), sync_config(3));
        let logs = strict.get_logs(None, None).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, 1);

        // Delay longer than the chain
        let blind = EventSynchronizer::new(chain, sync_config(10));
        assert_eq!(blind.confirmed_head().await.unwrap(), None);
        assert!(blind.get_logs(None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_logs_sorts_and_dedupes() {
        let chain = Arc::new(LocalChain::new(0));
        chain.mine_blocks(5);
        let a = registered(2, 0, 1);
        let b = registered(4, 1, 2);
        chain.inject_log(b.clone());
        chain.inject_log(a.clone());
        chain.inject_log(b.clone());

        let sync = EventSynchronizer::new(chain, sync_config(0));
        let logs = sync.get_logs(None, None).await.unwrap();
        assert_eq!(logs, vec![a.clone(), b]);

        // Idempotent
        assert_eq!(sync.get_logs(None, None).await.unwrap().len(), 2);
        // Range bounds and an empty range
        assert_eq!(sync.get_logs(Some(3), None).await.unwrap().len(), 1);
        assert_eq!(sync.get_logs(None, Some(2)).await.unwrap(), vec![a]);
        assert!(sync.get_logs(Some(9), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_collaborator() {
        let chain = Arc::new(LocalChain::new(0));
        chain.set_available(false);
        let sync = EventSynchronizer::new(chain.clone(), sync_config(0));

        let err = sync.get_logs(None, None).await.unwrap_err();
        assert!(matches!(err, Error::SyncUnavailable(_)));
        assert!(err.is_retryable());

        // Retries give up after the elapsed budget
        let err = sync.get_logs_with_retry(None, None).await.unwrap_err();
        assert!(matches!(err, Error::SyncUnavailable(_)));
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let chain = Arc::new(LocalChain::new(0));
        chain.mine_blocks(2);
        chain.inject_log(registered(1, 0, 1));
        chain.set_available(false);

        let sync = EventSynchronizer::new(
            chain.clone(),
            SyncConfig {
                retry_max_elapsed_ms: 5_000,
                ..sync_config(0)
            },
        );

        let flip = chain.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            flip.set_available(true);
        });

        let logs = sync.get_logs_with_retry(None, None).await.unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn test_catch_up_retries_outage() {
        let chain = Arc::new(LocalChain::new(0));
        chain.mine_blocks(1);
        chain.inject_log(registered(1, 0, 1));
        chain.set_available(false);

        let sync = EventSynchronizer::new(
            chain.clone(),
            SyncConfig {
                retry_max_elapsed_ms: 5_000,
                ..sync_config(0)
            },
        );

        let flip = chain.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            flip.set_available(true);
        });

        let mut ledger = MembershipLedger::new(10);
        let report = sync.catch_up(&mut ledger).await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.confirmed_head, Some(1));
        assert_eq!(ledger.next_index(), 1);
    }

    #[test]
    fn test_replay_rejects_inconsistent_entries() {
        let unknown_withdraw = LogEntry {
            block_number: 2,
            log_index: 0,
            block_timestamp: 0,
            tx_id: Uuid::now_v7(),
            event: RegistryEvent::MemberWithdrawn {
                commitment: FieldValue::from_u64(77),
                phase: WithdrawPhase::Requested { freeze_until: 10 },
            },
        };
        let entries = vec![
            registered(1, 0, 1),
            unknown_withdraw,
            registered(3, 5, 2), // index gap
            registered(4, 1, 2),
        ];

        let (ledger, report) = replay(10, &entries);
        assert_eq!(report.applied, 2);
        assert_eq!(report.rejected, 2);
        assert_eq!(ledger.next_index(), 2);
        ledger.check_conservation().unwrap();
    }

    #[tokio::test]
    async fn test_catch_up_resumes_from_cursor() {
        let chain = Arc::new(LocalChain::new(0));
        chain.mine_blocks(2);
        chain.inject_log(registered(1, 0, 1));
        chain.inject_log(registered(2, 1, 2));

        let metrics = Metrics::new().unwrap();
        let sync = EventSynchronizer::new(chain.clone(), sync_config(0)).with_metrics(metrics.clone());
        let mut ledger = MembershipLedger::new(10);

        let report = sync.catch_up(&mut ledger).await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.confirmed_head, Some(2));

        chain.mine_blocks(1);
        chain.inject_log(registered(3, 2, 3));
        let report = sync.catch_up(&mut ledger).await.unwrap();
        // Block 2 is fetched again but sits at the cursor
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(ledger.next_index(), 3);
        assert_eq!(metrics.sync_applied_total.get(), 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let chain = Arc::new(LocalChain::new(0));
        chain.mine_blocks(1);
        chain.inject_log(registered(1, 0, 1));

        let sync = Arc::new(EventSynchronizer::new(
            chain,
            SyncConfig {
                poll_interval_ms: 5,
                ..sync_config(0)
            },
        ));
        let view = Arc::new(RwLock::new(MembershipLedger::new(10)));
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(sync.run(view.clone(), rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(view.read().next_index(), 1);
    }
}
