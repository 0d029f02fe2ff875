//! Trunk binlog: line format, buffered writer and replication mark files

pub mod mark;
pub mod record;
pub mod writer;

pub use mark::MarkFile;
pub use record::{RecordParseError, TrunkBinlogRecord, TrunkFullInfo, TrunkOpType, TRUNK_BINLOG_LINE_SIZE};
pub use writer::{TrunkBinlogWriter, TRUNK_BINLOG_BUFFER_SIZE, TRUNK_SYNC_BINLOG_FILENAME};
