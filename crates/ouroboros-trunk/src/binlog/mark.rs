//! Replication mark files
//!
//! One mark file per peer under `<base>/data/trunk/` records how far into
//! the binlog that peer has acknowledged:
//!
//! ```text
//! binlog_offset=<n>
//! ```
//!
//! Files are named `<peer_id>.mark` when storage ids are in use, otherwise
//! `<peer_id>_<port>.mark`.

use chrono::{DateTime, Local};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use crate::config::{PeerConfig, TrunkConfig};
use crate::error::{Result, TrunkError};

pub const TRUNK_SYNC_MARK_FILE_EXT: &str = ".mark";
pub const MARK_ITEM_BINLOG_FILE_OFFSET: &str = "binlog_offset";

/// Mark file for `peer_id` on the configured port
pub fn mark_file_path(config: &TrunkConfig, peer_id: &str) -> PathBuf {
    mark_file_path_with_port(config, peer_id, config.server_port)
}

fn mark_file_path_with_port(config: &TrunkConfig, peer_id: &str, port: u16) -> PathBuf {
    let name = if config.use_storage_id {
        format!("{}{}", peer_id, TRUNK_SYNC_MARK_FILE_EXT)
    } else {
        format!("{}_{}{}", peer_id, port, TRUNK_SYNC_MARK_FILE_EXT)
    };
    config.trunk_dir().join(name)
}

/// Pre-storage-id mark file, named by ip and port
pub fn legacy_mark_file_path(config: &TrunkConfig, ip_addr: &str) -> PathBuf {
    config.trunk_dir().join(format!(
        "{}_{}{}",
        ip_addr, config.server_port, TRUNK_SYNC_MARK_FILE_EXT
    ))
}

/// Parse mark file content into the stored binlog offset
pub fn parse_mark(content: &str) -> Result<i64> {
    let mut items = 0;
    let mut offset = 0;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        items += 1;

        if key.trim() == MARK_ITEM_BINLOG_FILE_OFFSET {
            offset = value.trim().parse::<i64>().map_err(|_| {
                TrunkError::InvalidArgument(format!(
                    "{}: invalid value {:?}",
                    MARK_ITEM_BINLOG_FILE_OFFSET,
                    value.trim()
                ))
            })?;
        }
    }

    if items == 0 {
        return Err(TrunkError::NotFound);
    }
    if offset < 0 {
        return Err(TrunkError::InvalidArgument(format!(
            "{}: {} < 0",
            MARK_ITEM_BINLOG_FILE_OFFSET, offset
        )));
    }
    Ok(offset)
}

pub fn render_mark(offset: i64) -> String {
    format!("{}={}\n", MARK_ITEM_BINLOG_FILE_OFFSET, offset)
}

/// A peer's persisted replication offset
#[derive(Debug, Clone)]
pub struct MarkFile {
    path: PathBuf,
}

impl MarkFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_peer(config: &TrunkConfig, peer_id: &str) -> Self {
        Self::new(mark_file_path(config, peer_id))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored offset, or `None` if the file does not exist yet
    pub async fn load(&self) -> Result<Option<i64>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                error!("Read mark file {} failed: {}", self.path.display(), e);
                return Err(TrunkError::io_at(&self.path, e));
            }
        };

        parse_mark(&content).map(Some).map_err(|e| {
            error!("Load from mark file {} failed: {}", self.path.display(), e);
            e
        })
    }

    /// Durably replace the stored offset
    pub async fn store(&self, offset: i64) -> Result<()> {
        let tmp_path = self.path.with_extension("mark.tmp");
        let write = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(render_mark(offset).as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &self.path).await
        };

        write.await.map_err(|e| {
            error!("Write to mark file {} failed: {}", self.path.display(), e);
            TrunkError::io_at(&self.path, e)
        })?;

        debug!("Mark file {} stored, binlog offset {}", self.path.display(), offset);
        Ok(())
    }
}

/// Move a peer's mark file aside as `<mark>.<YYYYmmddHHMMSS>`.
///
/// Returns `NotFound` if the peer has no mark file.
pub fn unlink_mark_file(config: &TrunkConfig, peer_id: &str) -> Result<PathBuf> {
    unlink_mark_file_at(config, peer_id, &Local::now())
}

fn unlink_mark_file_at(
    config: &TrunkConfig,
    peer_id: &str,
    now: &DateTime<Local>,
) -> Result<PathBuf> {
    let old_path = mark_file_path(config, peer_id);
    if !old_path.exists() {
        return Err(TrunkError::NotFound);
    }

    let mut name = old_path.clone().into_os_string();
    name.push(format!(".{}", now.format("%Y%m%d%H%M%S")));
    let new_path = PathBuf::from(name);

    fs::rename(&old_path, &new_path).map_err(|e| {
        error!(
            "Rename file {} to {} failed: {}",
            old_path.display(),
            new_path.display(),
            e
        );
        TrunkError::io_at(&old_path, e)
    })?;
    Ok(new_path)
}

/// Carry a peer's progress over to its new id/port.
///
/// `NotFound` if there is nothing to move, `AlreadyExists` if the target
/// already has a mark file (which is left untouched).
pub fn rename_mark_file(
    config: &TrunkConfig,
    old_id: &str,
    old_port: u16,
    new_id: &str,
    new_port: u16,
) -> Result<()> {
    let old_path = mark_file_path_with_port(config, old_id, old_port);
    if !old_path.exists() {
        return Err(TrunkError::NotFound);
    }

    let new_path = mark_file_path_with_port(config, new_id, new_port);
    if new_path.exists() {
        warn!(
            "Mark file {} already exists, ignore rename file {} to {}",
            new_path.display(),
            old_path.display(),
            new_path.display()
        );
        return Err(TrunkError::AlreadyExists);
    }

    fs::rename(&old_path, &new_path).map_err(|e| {
        error!(
            "Rename file {} to {} failed: {}",
            old_path.display(),
            new_path.display(),
            e
        );
        TrunkError::io_at(&old_path, e)
    })
}

/// Move aside the mark file of every peer except this node
pub fn unlink_all_mark_files(config: &TrunkConfig, peers: &[PeerConfig]) -> Result<()> {
    for peer in peers {
        if peer.id == config.storage_id {
            continue;
        }
        match unlink_mark_file(config, &peer.id) {
            Ok(_) | Err(TrunkError::NotFound) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
