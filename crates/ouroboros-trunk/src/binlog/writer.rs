///! Trunk binlog writer
///!
///! Appends trunk space events to `<base>/data/trunk/binlog`. Writes collect
///! in a 64 KiB cache under one mutex and are written + fsynced together when
///! the cache runs low on headroom, on an explicit `sync`, or from the
///! periodic flush task.
///!
///! A failed flush keeps every byte that did not reach the file in the cache,
///! so the next flush retries it. `write_version` only moves after a flush
///! fully succeeds; readers compare it to detect new data.
///!
///! ## Compression
///!
///! ```text
///! compress_apply:    binlog -> binlog.rollback, reopen empty binlog
///! compress_commit:   data file (minus header line) + binlog -> binlog.tmp -> binlog
///!                    remove data file and binlog.rollback
///! compress_rollback: binlog.rollback + binlog -> binlog.tmp -> binlog
///!                    remove binlog.rollback
///! ```
///!
///! A rollback file left behind by a crash between apply and commit means the
///! owner must call `compress_rollback` at startup.

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::record::{TrunkBinlogRecord, TrunkFullInfo, TrunkOpType, TRUNK_BINLOG_LINE_SIZE};
use crate::config::TrunkConfig;
use crate::error::{Result, TrunkError};
use crate::scheduler::{ScheduleEntry, BINLOG_FLUSH_TASK_ID};

/// Size of the write cache and of reader buffers
pub const TRUNK_BINLOG_BUFFER_SIZE: usize = 64 * 1024;

pub const TRUNK_SYNC_BINLOG_FILENAME: &str = "binlog";

const ROLLBACK_EXT: &str = "rollback";
const TMP_EXT: &str = "tmp";

struct WriterState {
    file: Option<File>,
    cache: Vec<u8>,
    /// Bytes reached the file but the fsync after them failed
    unsynced: bool,
}

/// Buffered, fsynced writer for the trunk binlog
pub struct TrunkBinlogWriter {
    state: Mutex<WriterState>,
    write_version: AtomicU64,
    binlog_path: PathBuf,
    rollback_path: PathBuf,
    tmp_path: PathBuf,
}

impl TrunkBinlogWriter {
    /// Create the trunk directory if needed and open the binlog for appends
    pub fn open(config: &TrunkConfig) -> Result<Self> {
        let trunk_dir = config.trunk_dir();
        fs::create_dir_all(&trunk_dir).map_err(|e| {
            error!("Failed to create trunk directory {}: {}", trunk_dir.display(), e);
            TrunkError::io_at(&trunk_dir, e)
        })?;

        let binlog_path = binlog_path(config);
        let file = open_for_append(&binlog_path)?;

        info!("Trunk binlog opened: {}", binlog_path.display());

        Ok(Self {
            state: Mutex::new(WriterState {
                file: Some(file),
                cache: Vec::with_capacity(TRUNK_BINLOG_BUFFER_SIZE),
                unsynced: false,
            }),
            write_version: AtomicU64::new(0),
            rollback_path: binlog_path.with_extension(ROLLBACK_EXT),
            tmp_path: binlog_path.with_extension(TMP_EXT),
            binlog_path,
        })
    }

    /// Record a trunk space event
    pub fn write(&self, timestamp: i64, op_type: TrunkOpType, trunk: &TrunkFullInfo) -> Result<()> {
        self.write_record(&TrunkBinlogRecord::new(timestamp, op_type, *trunk))
    }

    pub fn write_record(&self, record: &TrunkBinlogRecord) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.cache.extend_from_slice(record.to_line().as_bytes());
        if TRUNK_BINLOG_BUFFER_SIZE.saturating_sub(state.cache.len()) < TRUNK_BINLOG_LINE_SIZE {
            self.flush_locked(state)?;
        }
        Ok(())
    }

    /// Append pre-formatted binlog lines.
    ///
    /// Buffers at least as large as the cache bypass it: the cache is
    /// flushed first and the buffer is written and fsynced directly.
    pub fn write_buffer(&self, buf: &[u8]) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.cache.len() + buf.len() + TRUNK_BINLOG_LINE_SIZE > TRUNK_BINLOG_BUFFER_SIZE {
            self.flush_locked(state)?;
        }

        if buf.len() >= TRUNK_BINLOG_BUFFER_SIZE {
            self.flush_locked(state)?;
            self.write_direct(state, buf)
        } else {
            state.cache.extend_from_slice(buf);
            Ok(())
        }
    }

    /// Force the cache to disk
    pub fn sync(&self) -> Result<()> {
        let mut guard = self.state.lock();
        self.flush_locked(&mut guard)
    }

    /// Flush, then cut the binlog to zero length
    pub fn truncate(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        self.flush_locked(state)?;
        let file = state.file.as_mut().ok_or(TrunkError::WriterClosed)?;
        file.set_len(0).map_err(|e| {
            error!("Failed to truncate {}: {}", self.binlog_path.display(), e);
            TrunkError::io_at(&self.binlog_path, e)
        })?;

        info!("Trunk binlog truncated");
        Ok(())
    }

    /// Move the live binlog aside as the rollback file and start a fresh one
    pub fn compress_apply(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.file.is_none() {
            return match fs::rename(&self.binlog_path, &self.rollback_path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(self.rename_error(&self.binlog_path, &self.rollback_path, e)),
            };
        }

        self.close_locked(state)?;

        if let Err(e) = fs::rename(&self.binlog_path, &self.rollback_path) {
            let err = self.rename_error(&self.binlog_path, &self.rollback_path, e);
            state.file = Some(open_for_append(&self.binlog_path)?);
            return Err(err);
        }

        match open_for_append(&self.binlog_path) {
            Ok(file) => {
                state.file = Some(file);
                info!("Trunk binlog compression applied");
                Ok(())
            }
            Err(e) => {
                if let Err(re) = fs::rename(&self.rollback_path, &self.binlog_path) {
                    error!(
                        "Failed to restore {} from {}: {}",
                        self.binlog_path.display(),
                        self.rollback_path.display(),
                        re
                    );
                }
                Err(e)
            }
        }
    }

    /// Fold the compacted trunk data file in front of the binlog.
    ///
    /// The first line of `data_file` is a header and is skipped.
    pub fn compress_commit(&self, data_file: &Path) -> Result<()> {
        let data = File::open(data_file).map_err(|e| {
            error!("Failed to open {}: {}", data_file.display(), e);
            TrunkError::io_at(data_file, e)
        })?;
        let mut data = BufReader::new(data);
        let mut header = Vec::new();
        data.read_until(b'\n', &mut header)
            .map_err(|e| TrunkError::io_at(data_file, e))?;

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let need_open = state.file.is_some();
        if need_open {
            self.close_locked(state)?;
        }

        let result = self.merge_file(&mut data).and_then(|()| {
            fs::remove_file(data_file).map_err(|e| {
                error!("Failed to unlink {}: {}", data_file.display(), e);
                TrunkError::io_at(data_file, e)
            })
        });

        if result.is_ok() && self.rollback_path.exists() {
            if let Err(e) = fs::remove_file(&self.rollback_path) {
                warn!("Failed to unlink {}: {}", self.rollback_path.display(), e);
            }
        }

        if need_open {
            state.file = Some(open_for_append(&self.binlog_path)?);
        }

        if result.is_ok() {
            info!("Trunk binlog compression committed");
        }
        result
    }

    /// Undo an interrupted compression by putting the rollback file's
    /// content back in front of the binlog. No rollback file means nothing
    /// to undo.
    pub fn compress_rollback(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.file.is_none() {
            if self.rollback_path.exists() {
                fs::rename(&self.rollback_path, &self.binlog_path)
                    .map_err(|e| self.rename_error(&self.rollback_path, &self.binlog_path, e))?;
            }
            return Ok(());
        }

        let meta = match fs::metadata(&self.rollback_path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                error!("Failed to stat {}: {}", self.rollback_path.display(), e);
                return Err(TrunkError::io_at(&self.rollback_path, e));
            }
        };

        if meta.len() == 0 {
            if let Err(e) = fs::remove_file(&self.rollback_path) {
                warn!("Failed to unlink {}: {}", self.rollback_path.display(), e);
            }
            return Ok(());
        }

        self.close_locked(state)?;

        let result = File::open(&self.rollback_path)
            .map_err(|e| TrunkError::io_at(&self.rollback_path, e))
            .and_then(|mut rollback| self.merge_file(&mut rollback));

        if result.is_ok() {
            if let Err(e) = fs::remove_file(&self.rollback_path) {
                warn!("Failed to unlink {}: {}", self.rollback_path.display(), e);
            }
            info!("Trunk binlog compression rolled back");
        }

        state.file = Some(open_for_append(&self.binlog_path)?);
        result
    }

    /// Flush and close the binlog; later writes only fill the cache
    pub fn close(&self) -> Result<()> {
        let mut guard = self.state.lock();
        self.close_locked(&mut guard)
    }

    /// Reopen a closed binlog for appends
    pub fn reopen(&self) -> Result<()> {
        let mut guard = self.state.lock();
        if guard.file.is_none() {
            guard.file = Some(open_for_append(&self.binlog_path)?);
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().file.is_some()
    }

    /// Bytes waiting in the cache
    pub fn buffered_len(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Number of successful flushes so far
    pub fn write_version(&self) -> u64 {
        self.write_version.load(Ordering::Acquire)
    }

    pub fn binlog_path(&self) -> &Path {
        &self.binlog_path
    }

    pub fn rollback_path(&self) -> &Path {
        &self.rollback_path
    }

    /// Schedule entry flushing `writer` every `interval` seconds
    pub fn flush_entry(writer: Arc<TrunkBinlogWriter>, interval: u64) -> ScheduleEntry {
        ScheduleEntry::new(BINLOG_FLUSH_TASK_ID, interval, move || writer.sync())
    }

    fn flush_locked(&self, state: &mut WriterState) -> Result<()> {
        if state.cache.is_empty() && !state.unsynced {
            return Ok(());
        }
        let file = state.file.as_mut().ok_or(TrunkError::WriterClosed)?;

        // Drop bytes from the cache only once they are in the file
        while !state.cache.is_empty() {
            match file.write(&state.cache) {
                Ok(0) => {
                    let e = io::Error::from(io::ErrorKind::WriteZero);
                    error!("Write to binlog file {} failed: {}", self.binlog_path.display(), e);
                    return Err(TrunkError::io_at(&self.binlog_path, e));
                }
                Ok(n) => {
                    state.cache.drain(..n);
                    state.unsynced = true;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Write to binlog file {} failed: {}", self.binlog_path.display(), e);
                    return Err(TrunkError::io_at(&self.binlog_path, e));
                }
            }
        }

        file.sync_data().map_err(|e| {
            error!("Sync to binlog file {} failed: {}", self.binlog_path.display(), e);
            TrunkError::io_at(&self.binlog_path, e)
        })?;

        state.unsynced = false;
        let version = self.write_version.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Trunk binlog flushed, write version {}", version);
        Ok(())
    }

    fn write_direct(&self, state: &mut WriterState, buf: &[u8]) -> Result<()> {
        let file = state.file.as_mut().ok_or(TrunkError::WriterClosed)?;
        file.write_all(buf)
            .and_then(|()| file.sync_data())
            .map_err(|e| {
                error!("Write to binlog file {} failed: {}", self.binlog_path.display(), e);
                TrunkError::io_at(&self.binlog_path, e)
            })?;
        self.write_version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn close_locked(&self, state: &mut WriterState) -> Result<()> {
        if state.file.is_some() {
            self.flush_locked(state)?;
        }
        state.file = None;
        Ok(())
    }

    /// Write `src` followed by the current binlog into the temp file, then
    /// swap it in as the binlog
    fn merge_file(&self, src: &mut impl Read) -> Result<()> {
        let tmp_err = |e: io::Error| {
            error!("Write to file {} failed: {}", self.tmp_path.display(), e);
            TrunkError::io_at(&self.tmp_path, e)
        };

        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.tmp_path)
            .map_err(tmp_err)?;

        io::copy(src, &mut tmp).map_err(tmp_err)?;

        match File::open(&self.binlog_path) {
            Ok(mut binlog) => {
                io::copy(&mut binlog, &mut tmp).map_err(tmp_err)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(TrunkError::io_at(&self.binlog_path, e)),
        }

        tmp.sync_all().map_err(tmp_err)?;
        drop(tmp);

        fs::rename(&self.tmp_path, &self.binlog_path)
            .map_err(|e| self.rename_error(&self.tmp_path, &self.binlog_path, e))
    }

    fn rename_error(&self, from: &Path, to: &Path, e: io::Error) -> TrunkError {
        error!("Rename {} to {} failed: {}", from.display(), to.display(), e);
        TrunkError::io_at(from, e)
    }
}

impl Drop for TrunkBinlogWriter {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.file.is_some() && !state.cache.is_empty() {
            if let Err(e) = self.close() {
                warn!("Failed to flush trunk binlog on drop: {}", e);
            }
        }
    }
}

/// `<base_path>/data/trunk/binlog`
pub fn binlog_path(config: &TrunkConfig) -> PathBuf {
    config.trunk_dir().join(TRUNK_SYNC_BINLOG_FILENAME)
}

fn open_for_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            error!("Open file {} failed: {}", path.display(), e);
            TrunkError::io_at(path, e)
        })
}
