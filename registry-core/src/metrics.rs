//! Metrics collection for observability
//!
//! Prometheus metrics for the registry service and the synchronizer.
//!
//! # Metrics
//!
//! - `registry_registrations_total` - Committed registrations
//! - `registry_withdrawals_total` - Committed withdrawal requests
//! - `registry_releases_total` - Committed releases
//! - `registry_slashes_total` - Committed slashes
//! - `registry_rejected_total{kind}` - Operations rejected, by error kind
//! - `registry_sync_applied_total` - Log entries folded by the synchronizer
//! - `registry_sync_rejected_total` - Log entries the synchronizer refused
//! - `registry_bonded_pool` - Bonded pool of the live ledger
//! - `registry_active_members` - Members in `Active`
//! - `registry_synced_block` - Confirmed head of the last sync pass
//! - `registry_sync_duration_seconds` - Histogram of sync pass latencies

use crate::membership::MembershipLedger;
use crate::types::EventName;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
///
/// Every collector is registered with the struct's own registry, so any
/// number of `Metrics` can coexist in one process.
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Committed registrations
    pub registrations_total: IntCounter,

    /// Committed withdrawal requests
    pub withdrawals_total: IntCounter,

    /// Committed releases
    pub releases_total: IntCounter,

    /// Committed slashes
    pub slashes_total: IntCounter,

    /// Rejected operations by error kind
    pub rejected_total: IntCounterVec,

    /// Entries applied during sync
    pub sync_applied_total: IntCounter,

    /// Entries rejected during sync
    pub sync_rejected_total: IntCounter,

    /// Bonded pool (saturates at `i64::MAX`)
    pub bonded_pool: IntGauge,

    /// Active members
    pub active_members: IntGauge,

    /// Last confirmed head synchronized
    pub synced_block: IntGauge,

    /// Sync pass duration histogram
    pub sync_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let registrations_total =
            IntCounter::new("registry_registrations_total", "Committed registrations")?;
        registry.register(Box::new(registrations_total.clone()))?;

        let withdrawals_total =
            IntCounter::new("registry_withdrawals_total", "Committed withdrawal requests")?;
        registry.register(Box::new(withdrawals_total.clone()))?;

        let releases_total = IntCounter::new("registry_releases_total", "Committed releases")?;
        registry.register(Box::new(releases_total.clone()))?;

        let slashes_total = IntCounter::new("registry_slashes_total", "Committed slashes")?;
        registry.register(Box::new(slashes_total.clone()))?;

        let rejected_total = IntCounterVec::new(
            Opts::new("registry_rejected_total", "Operations rejected, by error kind"),
            &["kind"],
        )?;
        registry.register(Box::new(rejected_total.clone()))?;

        let sync_applied_total = IntCounter::new(
            "registry_sync_applied_total",
            "Log entries folded by the synchronizer",
        )?;
        registry.register(Box::new(sync_applied_total.clone()))?;

        let sync_rejected_total = IntCounter::new(
            "registry_sync_rejected_total",
            "Log entries the synchronizer refused",
        )?;
        registry.register(Box::new(sync_rejected_total.clone()))?;

        let bonded_pool = IntGauge::new("registry_bonded_pool", "Bonded pool of the live ledger")?;
        registry.register(Box::new(bonded_pool.clone()))?;

        let active_members = IntGauge::new("registry_active_members", "Members in Active")?;
        registry.register(Box::new(active_members.clone()))?;

        let synced_block = IntGauge::new(
            "registry_synced_block",
            "Confirmed head of the last sync pass",
        )?;
        registry.register(Box::new(synced_block.clone()))?;

        let sync_duration = Histogram::with_opts(
            HistogramOpts::new(
                "registry_sync_duration_seconds",
                "Histogram of sync pass latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(sync_duration.clone()))?;

        Ok(Self {
            registrations_total,
            withdrawals_total,
            releases_total,
            slashes_total,
            rejected_total,
            sync_applied_total,
            sync_rejected_total,
            bonded_pool,
            active_members,
            synced_block,
            sync_duration,
            registry,
        })
    }

    /// Record a committed transition
    pub fn record_committed(&self, name: EventName, released: bool) {
        match name {
            EventName::MemberRegistered => self.registrations_total.inc(),
            EventName::MemberWithdrawn if released => self.releases_total.inc(),
            EventName::MemberWithdrawn => self.withdrawals_total.inc(),
            EventName::MemberSlashed => self.slashes_total.inc(),
        }
    }

    /// Record a rejected operation
    pub fn record_rejected(&self, kind: &str) {
        self.rejected_total.with_label_values(&[kind]).inc();
    }

    /// Record the outcome of a sync pass
    pub fn record_sync(&self, applied: usize, rejected: usize, confirmed_head: u64, seconds: f64) {
        self.sync_applied_total.inc_by(applied as u64);
        self.sync_rejected_total.inc_by(rejected as u64);
        self.synced_block.set(saturating_i64(confirmed_head as u128));
        self.sync_duration.observe(seconds);
    }

    /// Refresh the gauges from a ledger
    pub fn update_ledger(&self, ledger: &MembershipLedger) {
        self.bonded_pool.set(saturating_i64(ledger.bonded_pool()));
        self.active_members.set(ledger.active_count() as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn saturating_i64(value: u128) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
