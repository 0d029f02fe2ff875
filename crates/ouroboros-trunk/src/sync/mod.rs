//! Trunk binlog replication to peer storage nodes

pub mod peer;
pub mod protocol;
pub mod reader;
mod replicator;
pub mod supervisor;

pub use peer::{LocalHost, PeerStatus, StoragePeer};
pub use protocol::{Command, PacketHeader, PeerConnection, ProtocolError, PACKET_HEADER_SIZE};
pub use reader::TrunkBinlogReader;
pub use supervisor::SyncSupervisor;
