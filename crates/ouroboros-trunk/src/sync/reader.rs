//! Per-peer binlog reader
//!
//! Tails the trunk binlog from the offset persisted in the peer's mark file.
//! Bytes are pulled into a 64 KiB buffer by `preread`; the replicator sends
//! the complete-lines prefix of that buffer and calls `consume` once the peer
//! acknowledged it. `checkpoint` persists the offset when it has moved.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{error, info, warn};

use super::peer::StoragePeer;
use crate::binlog::mark::{legacy_mark_file_path, MarkFile};
use crate::binlog::{TrunkBinlogRecord, TrunkBinlogWriter, TRUNK_BINLOG_BUFFER_SIZE, TRUNK_BINLOG_LINE_SIZE};
use crate::config::TrunkConfig;
use crate::error::{Result, TrunkError};

pub struct TrunkBinlogReader {
    peer_id: String,
    writer: Arc<TrunkBinlogWriter>,
    file: File,
    mark: MarkFile,
    /// Offset acknowledged by the peer
    binlog_offset: i64,
    /// Offset last written to the mark file
    last_binlog_offset: i64,
    buffer: Vec<u8>,
    /// Start of unconsumed data in `buffer`
    current: usize,
    /// Writer version seen at the last read that hit end of file; `None`
    /// until the file has been read to its end once
    version: Option<u64>,
}

impl TrunkBinlogReader {
    /// Load (or create) the peer's mark file and position on the binlog
    pub async fn init(
        config: &TrunkConfig,
        peer: &StoragePeer,
        writer: Arc<TrunkBinlogWriter>,
    ) -> Result<Self> {
        let mark = MarkFile::for_peer(config, peer.id());

        if config.use_storage_id && !tokio::fs::try_exists(mark.path()).await? {
            let legacy = legacy_mark_file_path(config, &peer.ip_addr());
            if tokio::fs::try_exists(&legacy).await? {
                tokio::fs::rename(&legacy, mark.path()).await.map_err(|e| {
                    error!(
                        "Rename file {} to {} failed: {}",
                        legacy.display(),
                        mark.path().display(),
                        e
                    );
                    TrunkError::io_at(&legacy, e)
                })?;
                info!(
                    "Migrated mark file {} to {}",
                    legacy.display(),
                    mark.path().display()
                );
            }
        }

        let (binlog_offset, exists) = match mark.load().await? {
            Some(offset) => (offset, true),
            None => (0, false),
        };
        if !exists {
            mark.store(binlog_offset).await?;
        }

        let mut file = open_binlog(writer.binlog_path()).await?;
        if binlog_offset > 0 {
            file.seek(SeekFrom::Start(binlog_offset as u64))
                .await
                .map_err(|e| {
                    error!(
                        "Seek binlog file {} to {} failed: {}",
                        writer.binlog_path().display(),
                        binlog_offset,
                        e
                    );
                    TrunkError::io_at(writer.binlog_path(), e)
                })?;
        }

        let mut reader = Self {
            peer_id: peer.id().to_string(),
            writer,
            file,
            mark,
            binlog_offset,
            last_binlog_offset: binlog_offset,
            buffer: Vec::with_capacity(TRUNK_BINLOG_BUFFER_SIZE),
            current: 0,
            version: None,
        };

        match reader.preread().await {
            Ok(()) | Err(TrunkError::NotFound) => Ok(reader),
            Err(e) => Err(e),
        }
    }

    /// Restart replication from the beginning of the binlog
    pub async fn reset_offset(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0)).await.map_err(|e| {
            TrunkError::io_at(self.writer.binlog_path(), e)
        })?;
        self.buffer.clear();
        self.current = 0;
        self.version = None;
        self.binlog_offset = 0;

        self.mark.store(0).await?;
        self.last_binlog_offset = 0;
        info!("Peer {}: binlog offset reset to 0", self.peer_id);
        Ok(())
    }

    /// Pull newly appended binlog bytes into the buffer.
    ///
    /// `NotFound` means there is nothing to send: the buffer is empty and
    /// either the writer has not flushed since we last hit end of file, or
    /// the file has no more bytes. Until the first end of file every call
    /// reads, so bytes written by an earlier process are picked up.
    pub async fn preread(&mut self) -> Result<()> {
        let saved_version = self.writer.write_version();
        if self.version == Some(saved_version) && self.pending_len() == 0 {
            return Err(TrunkError::NotFound);
        }
        if self.pending_len() == TRUNK_BINLOG_BUFFER_SIZE {
            return Ok(());
        }

        if self.current > 0 {
            self.buffer.drain(..self.current);
            self.current = 0;
        }

        let filled = self.buffer.len();
        self.buffer.resize(TRUNK_BINLOG_BUFFER_SIZE, 0);
        let read = self.file.read(&mut self.buffer[filled..]).await;
        let read_bytes = match read {
            Ok(n) => n,
            Err(e) => {
                self.buffer.truncate(filled);
                error!(
                    "Read from binlog file {} failed: {}",
                    self.writer.binlog_path().display(),
                    e
                );
                return Err(TrunkError::io_at(self.writer.binlog_path(), e));
            }
        };
        self.buffer.truncate(filled + read_bytes);

        if read_bytes == 0 {
            self.version = Some(saved_version);
            if self.buffer.is_empty() {
                return Err(TrunkError::NotFound);
            }
        }
        Ok(())
    }

    /// The longest prefix of unsent data that ends in a newline
    pub fn sync_payload(&self) -> Option<&[u8]> {
        let data = &self.buffer[self.current..];
        data.iter()
            .rposition(|&b| b == b'\n')
            .map(|last| &data[..=last])
    }

    /// Drop `len` bytes the peer has acknowledged
    pub fn consume(&mut self, len: usize) {
        let len = len.min(self.pending_len());
        self.current += len;
        self.binlog_offset += len as i64;
    }

    /// Parse and consume the next record.
    ///
    /// Malformed lines are logged and skipped. `NotFound` at end of data.
    pub async fn read_record(&mut self) -> Result<TrunkBinlogRecord> {
        loop {
            let line_len = match self.next_line_len() {
                Some(len) => len,
                None => {
                    if self.pending_len() >= TRUNK_BINLOG_LINE_SIZE {
                        error!(
                            "Peer {}: binlog line at offset {} exceeds {} bytes",
                            self.peer_id, self.binlog_offset, TRUNK_BINLOG_LINE_SIZE
                        );
                        return Err(TrunkError::InvalidArgument(format!(
                            "binlog line at offset {} too long",
                            self.binlog_offset
                        )));
                    }
                    self.preread().await?;
                    self.next_line_len().ok_or(TrunkError::NotFound)?
                }
            };

            let line = &self.buffer[self.current..self.current + line_len];
            let parsed = std::str::from_utf8(line)
                .map_err(|e| e.to_string())
                .and_then(|s| s.parse::<TrunkBinlogRecord>().map_err(|e| e.to_string()));
            let offset = self.binlog_offset;
            self.consume(line_len);

            match parsed {
                Ok(record) => return Ok(record),
                Err(e) => warn!(
                    "Peer {}: skip invalid binlog line at offset {}: {}",
                    self.peer_id, offset, e
                ),
            }
        }
    }

    /// Persist the offset if it moved since the last checkpoint
    pub async fn checkpoint(&mut self) -> Result<bool> {
        if self.binlog_offset == self.last_binlog_offset {
            return Ok(false);
        }
        self.mark.store(self.binlog_offset).await?;
        self.last_binlog_offset = self.binlog_offset;
        Ok(true)
    }

    pub fn binlog_offset(&self) -> i64 {
        self.binlog_offset
    }

    pub fn last_binlog_offset(&self) -> i64 {
        self.last_binlog_offset
    }

    pub fn mark_path(&self) -> &Path {
        self.mark.path()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Bytes read from the binlog but not yet consumed
    pub fn pending_len(&self) -> usize {
        self.buffer.len() - self.current
    }

    fn next_line_len(&self) -> Option<usize> {
        self.buffer[self.current..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| pos + 1)
    }
}

async fn open_binlog(path: &Path) -> Result<File> {
    File::open(path).await.map_err(|e| {
        error!("Open binlog file {} failed: {}", path.display(), e);
        TrunkError::io_at(path, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::mark::render_mark;
    use crate::binlog::{TrunkFullInfo, TrunkOpType};
    use crate::sync::peer::PeerStatus;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (TrunkConfig, Arc<TrunkBinlogWriter>, StoragePeer) {
        let config = TrunkConfig::new(dir.path());
        let writer = Arc::new(TrunkBinlogWriter::open(&config).unwrap());
        let peer = StoragePeer::new("10.0.0.2", "10.0.0.2", PeerStatus::Active);
        (config, writer, peer)
    }

    fn write_records(writer: &TrunkBinlogWriter, range: std::ops::Range<u32>) {
        for i in range {
            let trunk = TrunkFullInfo {
                file_id: i,
                size: 64,
                ..Default::default()
            };
            writer.write(i as i64, TrunkOpType::AddSpace, &trunk).unwrap();
        }
        writer.sync().unwrap();
    }

    #[tokio::test]
    async fn test_init_creates_mark_file() {
        let dir = TempDir::new().unwrap();
        let (config, writer, peer) = setup(&dir);

        let reader = TrunkBinlogReader::init(&config, &peer, writer).await.unwrap();
        assert_eq!(reader.binlog_offset(), 0);
        assert_eq!(
            std::fs::read_to_string(reader.mark_path()).unwrap(),
            "binlog_offset=0\n"
        );
    }

    #[tokio::test]
    async fn test_payload_holds_back_partial_line() {
        let dir = TempDir::new().unwrap();
        let (config, writer, peer) = setup(&dir);

        writer.write_buffer(b"1 A 0 0 0 1 0 64\n2 A 0 0 0 2 0 64\n3 A 0 0").unwrap();
        writer.sync().unwrap();

        let mut reader = TrunkBinlogReader::init(&config, &peer, writer.clone()).await.unwrap();
        let payload = reader.sync_payload().unwrap().to_vec();
        assert_eq!(payload, b"1 A 0 0 0 1 0 64\n2 A 0 0 0 2 0 64\n");

        reader.consume(payload.len());
        assert_eq!(reader.binlog_offset(), payload.len() as i64);
        assert!(reader.sync_payload().is_none());

        // Completing the line makes it sendable
        writer.write_buffer(b" 0 3 0 64\n").unwrap();
        writer.sync().unwrap();
        reader.preread().await.unwrap();
        assert_eq!(reader.sync_payload().unwrap(), b"3 A 0 0 0 3 0 64\n");
    }

    #[tokio::test]
    async fn test_init_reads_binlog_left_by_previous_writer() {
        let dir = TempDir::new().unwrap();
        let (config, writer, peer) = setup(&dir);
        write_records(&writer, 0..3);
        drop(writer);

        // Restart: the new writer's version has not moved yet
        let writer = Arc::new(TrunkBinlogWriter::open(&config).unwrap());
        assert_eq!(writer.write_version(), 0);

        let mut reader = TrunkBinlogReader::init(&config, &peer, writer).await.unwrap();
        let payload = reader.sync_payload().unwrap().to_vec();
        assert_eq!(payload.len(), 3 * b"0 A 0 0 0 0 0 64\n".len());

        reader.consume(payload.len());
        assert!(matches!(reader.preread().await, Err(TrunkError::NotFound)));
    }

    #[tokio::test]
    async fn test_reset_offset_rereads_after_end_of_file() {
        let dir = TempDir::new().unwrap();
        let (config, writer, peer) = setup(&dir);
        write_records(&writer, 0..2);

        let mut reader = TrunkBinlogReader::init(&config, &peer, writer).await.unwrap();
        let len = reader.sync_payload().unwrap().len();
        reader.consume(len);
        assert!(matches!(reader.preread().await, Err(TrunkError::NotFound)));

        reader.reset_offset().await.unwrap();
        reader.preread().await.unwrap();
        assert_eq!(reader.sync_payload().unwrap().len(), len);
    }

    #[tokio::test]
    async fn test_preread_not_found_until_new_version() {
        let dir = TempDir::new().unwrap();
        let (config, writer, peer) = setup(&dir);
        write_records(&writer, 0..3);

        let mut reader = TrunkBinlogReader::init(&config, &peer, writer.clone()).await.unwrap();
        let len = reader.sync_payload().unwrap().len();
        reader.consume(len);

        assert!(matches!(reader.preread().await, Err(TrunkError::NotFound)));
        assert!(matches!(reader.preread().await, Err(TrunkError::NotFound)));

        write_records(&writer, 3..4);
        reader.preread().await.unwrap();
        assert_eq!(reader.sync_payload().unwrap(), b"3 A 0 0 0 3 0 64\n");
    }

    #[tokio::test]
    async fn test_resume_from_mark() {
        let dir = TempDir::new().unwrap();
        let (config, writer, peer) = setup(&dir);
        write_records(&writer, 0..4);

        let mut reader = TrunkBinlogReader::init(&config, &peer, writer.clone()).await.unwrap();
        let first = reader.read_record().await.unwrap();
        assert_eq!(first.trunk.file_id, 0);
        assert!(reader.checkpoint().await.unwrap());
        assert!(!reader.checkpoint().await.unwrap());
        let offset = reader.binlog_offset();
        drop(reader);

        let mut reader = TrunkBinlogReader::init(&config, &peer, writer).await.unwrap();
        assert_eq!(reader.binlog_offset(), offset);
        assert_eq!(reader.read_record().await.unwrap().trunk.file_id, 1);
    }

    #[tokio::test]
    async fn test_read_record_skips_bad_lines() {
        let dir = TempDir::new().unwrap();
        let (config, writer, peer) = setup(&dir);
        writer.write_buffer(b"garbage\n5 A 0 0 0 5 0 64\n").unwrap();
        writer.sync().unwrap();

        let mut reader = TrunkBinlogReader::init(&config, &peer, writer).await.unwrap();
        assert_eq!(reader.read_record().await.unwrap().timestamp, 5);
        assert!(matches!(reader.read_record().await, Err(TrunkError::NotFound)));
    }

    #[tokio::test]
    async fn test_reset_offset() {
        let dir = TempDir::new().unwrap();
        let (config, writer, peer) = setup(&dir);
        write_records(&writer, 0..2);
        std::fs::write(
            crate::binlog::mark::mark_file_path(&config, peer.id()),
            render_mark(17),
        )
        .unwrap();

        let mut reader = TrunkBinlogReader::init(&config, &peer, writer).await.unwrap();
        assert_eq!(reader.binlog_offset(), 17);

        reader.reset_offset().await.unwrap();
        assert_eq!(reader.binlog_offset(), 0);
        assert_eq!(
            std::fs::read_to_string(reader.mark_path()).unwrap(),
            "binlog_offset=0\n"
        );
        assert_eq!(reader.read_record().await.unwrap().trunk.file_id, 0);
    }

    #[tokio::test]
    async fn test_legacy_mark_file_migrated() {
        let dir = TempDir::new().unwrap();
        let config = TrunkConfig::new(dir.path()).with_use_storage_id(true);
        let writer = Arc::new(TrunkBinlogWriter::open(&config).unwrap());
        let peer = StoragePeer::new("100002", "10.0.0.2", PeerStatus::Active);

        let legacy = legacy_mark_file_path(&config, "10.0.0.2");
        std::fs::write(&legacy, render_mark(0)).unwrap();

        let reader = TrunkBinlogReader::init(&config, &peer, writer).await.unwrap();
        assert!(!legacy.exists());
        assert!(reader.mark_path().ends_with("100002.mark"));
        assert!(reader.mark_path().exists());
    }
}
