//! Error types for the trunk subsystem

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::sync::protocol::ProtocolError;

/// Trunk subsystem errors
#[derive(Error, Debug)]
pub enum TrunkError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("IO error on {}: {source}", path.display())]
    IoAt {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Previous request is still pending, retry later")]
    Busy,

    #[error("Already exists")]
    AlreadyExists,

    #[error("Not found")]
    NotFound,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Peer responded with status {status}")]
    Peer { status: u8 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Binlog writer is closed")]
    WriterClosed,

    #[error("Scheduler is not running")]
    SchedulerStopped,

    #[error("Operation cancelled")]
    Cancelled,
}

impl TrunkError {
    /// Wrap an OS error with the file it concerns
    pub fn io_at(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TrunkError::IoAt {
            path: path.into(),
            source,
        }
    }

    /// The underlying OS error kind, if this is an I/O failure
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            TrunkError::Io(e) => Some(e.kind()),
            TrunkError::IoAt { source, .. } => Some(source.kind()),
            TrunkError::Protocol(ProtocolError::Io(e)) => Some(e.kind()),
            TrunkError::Protocol(ProtocolError::UnexpectedEof) => {
                Some(io::ErrorKind::UnexpectedEof)
            }
            _ => None,
        }
    }

    /// Whether the failure means the peer connection dropped underneath us.
    ///
    /// These are expected while a peer restarts, so the replicator
    /// reconnects without the extra back-off.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self.io_kind(),
            Some(
                io::ErrorKind::NotConnected
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            )
        )
    }
}

pub type Result<T> = std::result::Result<T, TrunkError>;
