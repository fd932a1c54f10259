//! Storage layer using RocksDB
//!
//! Checkpoint of the synchronized view, so a restarted node resumes
//! synchronization from its cursor instead of block zero.
//!
//! # Column Families
//!
//! - `logs` - Confirmed log entries (key: block_number || log_index)
//! - `members` - Member records (key: commitment)
//! - `meta` - Leaf set, pool totals and sync cursor (single key)

use crate::{
    config::StorageConfig,
    error::{Error, Result},
    membership::{LedgerMeta, MembershipLedger},
    sync,
    types::{LogEntry, LogPosition, MemberRecord},
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use std::collections::BTreeSet;

/// Column family names
const CF_LOGS: &str = "logs";
const CF_MEMBERS: &str = "members";
const CF_META: &str = "meta";

const META_KEY: &[u8] = b"ledger";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.max_background_jobs);
        if config.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_LOGS, Self::cf_options_logs()),
            ColumnFamilyDescriptor::new(CF_MEMBERS, Self::cf_options_members()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        tracing::info!(path = ?path, "Opened RocksDB");

        Ok(Self { db })
    }

    fn cf_options_logs() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_members() -> Options {
        let mut opts = Options::default();
        // Point lookups by commitment
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Write a sync batch and the ledger it produced (atomic)
    ///
    /// Only members touched by `entries` are rewritten.
    pub fn persist_batch(&self, entries: &[LogEntry], ledger: &MembershipLedger) -> Result<()> {
        let cf_logs = self.cf_handle(CF_LOGS)?;
        let cf_members = self.cf_handle(CF_MEMBERS)?;
        let cf_meta = self.cf_handle(CF_META)?;

        let mut batch = WriteBatch::default();

        for entry in entries {
            batch.put_cf(cf_logs, entry.position().to_key(), bincode::serialize(entry)?);
        }

        let touched: BTreeSet<_> = entries.iter().map(|e| e.event.commitment()).collect();
        for commitment in &touched {
            if let Some(record) = ledger.get(commitment) {
                batch.put_cf(cf_members, commitment.as_bytes(), bincode::serialize(record)?);
            }
        }

        batch.put_cf(cf_meta, META_KEY, bincode::serialize(&ledger.meta())?);

        self.db.write(batch)?;

        tracing::debug!(
            entries = entries.len(),
            members = touched.len(),
            cursor = ?ledger.cursor(),
            "Sync batch persisted"
        );

        Ok(())
    }

    /// Restore the persisted ledger, if a checkpoint exists
    pub fn load_ledger(&self) -> Result<Option<MembershipLedger>> {
        let cf_meta = self.cf_handle(CF_META)?;
        let meta: LedgerMeta = match self.db.get_cf(cf_meta, META_KEY)? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => return Ok(None),
        };

        let cf_members = self.cf_handle(CF_MEMBERS)?;
        let mut members = Vec::new();
        for item in self.db.iterator_cf(cf_members, IteratorMode::Start) {
            let (_, value) = item?;
            let record: MemberRecord = bincode::deserialize(&value)?;
            members.push(record);
        }

        let ledger = MembershipLedger::from_parts(meta, members);
        ledger.check_conservation()?;

        // The checkpoint must be exactly what the stored log folds to
        let logs = self.get_logs(None)?;
        let (replayed, report) = sync::replay(ledger.minimal_deposit(), &logs);
        if report.rejected > 0 || replayed != ledger {
            return Err(Error::InvariantViolation(format!(
                "checkpoint at {:?} does not match its {} stored log entries",
                ledger.cursor(),
                logs.len()
            )));
        }

        tracing::info!(
            members = ledger.members().count(),
            cursor = ?ledger.cursor(),
            entries = logs.len(),
            "Ledger checkpoint loaded"
        );

        Ok(Some(ledger))
    }

    /// Persisted log entries after `after` (all entries when `None`), in log order
    pub fn get_logs(&self, after: Option<LogPosition>) -> Result<Vec<LogEntry>> {
        let cf_logs = self.cf_handle(CF_LOGS)?;
        let start = after.map(|p| p.to_key()).unwrap_or([0u8; 12]);

        let mut entries = Vec::new();
        for item in self
            .db
            .iterator_cf(cf_logs, IteratorMode::From(&start, Direction::Forward))
        {
            let (_, value) = item?;
            let entry: LogEntry = bincode::deserialize(&value)?;
            if Some(entry.position()) == after {
                continue;
            }
            entries.push(entry);
        }

        Ok(entries)
    }
}
