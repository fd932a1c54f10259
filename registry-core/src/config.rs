//! Configuration for the registry

use crate::types::{Address, TokenAmount};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Economic and lifecycle parameters
    pub registry: RegistryConfig,

    /// Event synchronization
    pub sync: SyncConfig,

    /// RocksDB checkpoint of the synchronized view
    pub storage: StorageConfig,

    /// Writer actor
    pub actor: ActorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "membership-registry".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            registry: RegistryConfig::default(),
            sync: SyncConfig::default(),
            storage: StorageConfig::default(),
            actor: ActorConfig::default(),
        }
    }
}

/// Economic and lifecycle parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Token the bonds are paid in
    pub token: Address,

    /// Address holding the bonded pool
    pub registry_address: Address,

    /// Deposit per unit of message limit
    pub minimal_deposit: u64,

    /// Largest message limit a member may register with
    pub max_message_limit: u64,

    /// Depth of the membership tree (capacity `2^tree_depth`)
    pub tree_depth: u8,

    /// Share of a slashed bond paid to `fee_receiver` (0-100)
    pub fee_percentage: u8,

    /// Account receiving slash fees
    pub fee_receiver: Address,

    /// Seconds between a withdrawal request and the earliest release
    pub freeze_period_secs: u64,

    /// Whether members with a pending withdrawal can still be slashed
    pub slash_during_withdraw_allowed: bool,

    /// Deadline for ledger and verifier calls (milliseconds)
    pub request_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            token: Address::from_low_u64(0x7041),
            registry_address: Address::from_low_u64(0x4e61),
            minimal_deposit: 100,
            max_message_limit: 20,
            tree_depth: 20,
            fee_percentage: 5,
            fee_receiver: Address::from_low_u64(0xfee),
            freeze_period_secs: 86_400, // 1 day
            slash_during_withdraw_allowed: false,
            request_timeout_ms: 5_000,
        }
    }
}

impl RegistryConfig {
    /// Minimal deposit as a token amount
    pub fn minimal_deposit(&self) -> TokenAmount {
        TokenAmount::from(self.minimal_deposit)
    }

    /// Number of leaves in the membership tree
    pub fn capacity(&self) -> u64 {
        1u64.checked_shl(self.tree_depth as u32).unwrap_or(u64::MAX)
    }
}

/// Event synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Blocks behind the head withheld from the synchronized view
    pub num_blocks_delayed: u64,

    /// Poll interval of the background loop (milliseconds)
    pub poll_interval_ms: u64,

    /// Deadline for a single log fetch (milliseconds)
    pub request_timeout_ms: u64,

    /// First retry delay (milliseconds)
    pub retry_initial_interval_ms: u64,

    /// Largest retry delay (milliseconds)
    pub retry_max_interval_ms: u64,

    /// Give up retrying after this long (milliseconds)
    pub retry_max_elapsed_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            num_blocks_delayed: 6,
            poll_interval_ms: 2_000,
            request_timeout_ms: 5_000,
            retry_initial_interval_ms: 100,
            retry_max_interval_ms: 5_000,
            retry_max_elapsed_ms: 60_000,
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Persist the synchronized view
    pub enabled: bool,

    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            data_dir: PathBuf::from("./data/registry"),
            write_buffer_size_mb: 64,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Writer actor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
    /// Bounded mailbox size (backpressure)
    pub mailbox_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("REGISTRY_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(data_dir);
            config.storage.enabled = true;
        }

        if let Ok(value) = std::env::var("REGISTRY_NUM_BLOCKS_DELAYED") {
            config.sync.num_blocks_delayed = parse_env("REGISTRY_NUM_BLOCKS_DELAYED", &value)?;
        }

        if let Ok(value) = std::env::var("REGISTRY_FREEZE_PERIOD_SECS") {
            config.registry.freeze_period_secs = parse_env("REGISTRY_FREEZE_PERIOD_SECS", &value)?;
        }

        if let Ok(value) = std::env::var("REGISTRY_FEE_PERCENTAGE") {
            config.registry.fee_percentage = parse_env("REGISTRY_FEE_PERCENTAGE", &value)?;
        }

        if let Ok(value) = std::env::var("REGISTRY_FEE_RECEIVER") {
            config.registry.fee_receiver = value.parse()?;
        }

        if let Ok(value) = std::env::var("REGISTRY_SLASH_DURING_WITHDRAW") {
            config.registry.slash_during_withdraw_allowed =
                parse_env("REGISTRY_SLASH_DURING_WITHDRAW", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the registry cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        let registry = &self.registry;

        if registry.minimal_deposit == 0 {
            return Err(crate::Error::Config("minimal_deposit must be positive".to_string()));
        }
        if registry.max_message_limit == 0 {
            return Err(crate::Error::Config("max_message_limit must be positive".to_string()));
        }
        if registry.tree_depth == 0 || registry.tree_depth > 32 {
            return Err(crate::Error::Config(format!(
                "tree_depth {} not in 1..=32",
                registry.tree_depth
            )));
        }
        if registry.fee_percentage > 100 {
            return Err(crate::Error::Config(format!(
                "fee_percentage {} exceeds 100",
                registry.fee_percentage
            )));
        }
        if registry.fee_receiver.is_zero() || registry.registry_address.is_zero() {
            return Err(crate::Error::Config(
                "fee_receiver and registry_address must be non-zero".to_string(),
            ));
        }
        if self.sync.poll_interval_ms == 0 {
            return Err(crate::Error::Config("poll_interval_ms must be positive".to_string()));
        }
        if self.actor.mailbox_capacity == 0 {
            return Err(crate::Error::Config("mailbox_capacity must be positive".to_string()));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| crate::Error::Config(format!("{}={} is not valid", name, value)))
}
