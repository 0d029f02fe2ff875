//! Trunk core of the ouroboros storage node
//!
//! # Features
//! - Single-thread scheduler for periodic maintenance tasks, hot-updatable
//!   from other threads
//! - Sharded file-id table with FIFO expiry for short-lived dedup windows
//! - Buffered, fsynced trunk binlog with crash-safe compression
//! - Per-peer binlog replication with resumable mark files

pub mod binlog;
pub mod clock;
pub mod config;
pub mod error;
pub mod file_id;
pub mod scheduler;
pub mod sync;

pub use binlog::{TrunkBinlogRecord, TrunkBinlogWriter, TrunkFullInfo, TrunkOpType};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FileIdConfig, PeerConfig, TrunkConfig};
pub use error::{Result, TrunkError};
pub use file_id::FileIdTable;
pub use scheduler::{ScheduleEntry, Scheduler};
pub use sync::{LocalHost, PeerStatus, StoragePeer, SyncSupervisor, TrunkBinlogReader};
