//! Configuration for the trunk subsystem
//!
//! Parses `trunk.toml` configuration files. Every field has a default, so an
//! empty file yields a usable single-node configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TrunkError};
use crate::sync::peer::PeerStatus;

/// Directory under `<base_path>/data` holding the binlog and mark files
pub const TRUNK_DIR_NAME: &str = "trunk";

/// Top-level trunk configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrunkConfig {
    /// Storage node base path (default: ./storage)
    pub base_path: PathBuf,

    /// Id of this storage node
    pub storage_id: String,

    /// Name mark files by storage id instead of `<ip>_<port>`
    pub use_storage_id: bool,

    /// Port peers listen on; also part of legacy mark file names
    pub server_port: u16,

    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Send/receive timeout in milliseconds
    pub network_timeout_ms: u64,

    /// Seconds between keepalives while a peer is idle
    pub heart_beat_interval_secs: u64,

    /// Idle sleep when the binlog has nothing new, in microseconds
    pub sync_wait_usec: u64,

    /// Pause after each successful batch, in microseconds (0 = none)
    pub sync_interval_usec: u64,

    /// Period of the binlog flush task
    pub binlog_flush_interval_secs: u64,

    /// Bounded wait for peer tasks on shutdown
    pub shutdown_timeout_secs: u64,

    /// File-id table tuning
    pub file_id: FileIdConfig,

    /// Peers this node replicates its trunk binlog to
    pub peers: Vec<PeerConfig>,
}

impl Default for TrunkConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./storage"),
            storage_id: String::from("0.0.0.0"),
            use_storage_id: false,
            server_port: 23000,
            connect_timeout_ms: 10_000,
            network_timeout_ms: 60_000,
            heart_beat_interval_secs: 30,
            sync_wait_usec: 100_000,
            sync_interval_usec: 0,
            binlog_flush_interval_secs: 1,
            shutdown_timeout_secs: 30,
            file_id: FileIdConfig::default(),
            peers: Vec::new(),
        }
    }
}

/// File-id table configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileIdConfig {
    /// Number of hash buckets
    pub bucket_count: usize,

    /// Number of shard locks; bucket `i` is guarded by lock `i % lock_count`
    pub lock_count: usize,

    /// Seconds a file id stays registered
    pub grace_period_secs: i64,
}

impl Default for FileIdConfig {
    fn default() -> Self {
        Self {
            bucket_count: 1_403_641,
            lock_count: 163,
            grace_period_secs: 3,
        }
    }
}

/// A replication peer as listed in the configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub ip_addr: String,
    #[serde(default = "default_peer_status")]
    pub status: PeerStatus,
}

fn default_peer_status() -> PeerStatus {
    PeerStatus::Active
}

impl TrunkConfig {
    /// Create a configuration rooted at `base_path`
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| TrunkError::io_at(path, e))?;
        Self::from_str(&content)
    }

    /// Reject values the subsystem cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.file_id.bucket_count == 0 {
            return Err(TrunkError::Config("file_id.bucket_count must be > 0".into()));
        }
        if self.file_id.lock_count == 0 {
            return Err(TrunkError::Config("file_id.lock_count must be > 0".into()));
        }
        if self.file_id.grace_period_secs <= 0 {
            return Err(TrunkError::Config(
                "file_id.grace_period_secs must be > 0".into(),
            ));
        }
        if self.binlog_flush_interval_secs == 0 {
            return Err(TrunkError::Config(
                "binlog_flush_interval_secs must be > 0".into(),
            ));
        }
        if self.heart_beat_interval_secs == 0 {
            return Err(TrunkError::Config(
                "heart_beat_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn with_storage_id(mut self, storage_id: impl Into<String>) -> Self {
        self.storage_id = storage_id.into();
        self
    }

    pub fn with_use_storage_id(mut self, use_storage_id: bool) -> Self {
        self.use_storage_id = use_storage_id;
        self
    }

    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    pub fn with_network_timeout_ms(mut self, ms: u64) -> Self {
        self.network_timeout_ms = ms;
        self
    }

    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn with_heart_beat_interval_secs(mut self, secs: u64) -> Self {
        self.heart_beat_interval_secs = secs;
        self
    }

    pub fn with_sync_wait_usec(mut self, usec: u64) -> Self {
        self.sync_wait_usec = usec;
        self
    }

    pub fn with_peers(mut self, peers: Vec<PeerConfig>) -> Self {
        self.peers = peers;
        self
    }

    /// `<base_path>/data/trunk`
    pub fn trunk_dir(&self) -> PathBuf {
        self.base_path.join("data").join(TRUNK_DIR_NAME)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn sync_wait(&self) -> Duration {
        Duration::from_micros(self.sync_wait_usec)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_micros(self.sync_interval_usec)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl FromStr for TrunkConfig {
    type Err = TrunkError;

    /// Parse and validate a TOML document
    fn from_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| TrunkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
