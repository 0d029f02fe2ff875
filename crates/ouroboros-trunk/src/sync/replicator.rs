//! Per-peer replication task
//!
//! ```text
//! connect (retry every 1s) -> init reader -> [reset offset] -> truncate (offset 0 only)
//!     -> stream: preread / send complete lines / ack -> advance offset
//!     -> on error: checkpoint, close, back off, reconnect
//! ```
//!
//! The task ends when it is cancelled, when the peer turns out to be this
//! node, or when the peer's status becomes terminal.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::peer::{LocalHost, StoragePeer};
use super::protocol::PeerConnection;
use super::reader::TrunkBinlogReader;
use crate::binlog::TrunkBinlogWriter;
use crate::config::TrunkConfig;
use crate::error::{Result, TrunkError};

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const TRUNCATE_RETRY_DELAY: Duration = Duration::from_secs(5);
const READ_RETRY_DELAY: Duration = Duration::from_secs(5);

/// State shared by every peer task
pub(crate) struct SyncContext {
    pub config: Arc<TrunkConfig>,
    pub writer: Arc<TrunkBinlogWriter>,
    pub local_host: Arc<LocalHost>,
    /// Only the trunk server replicates its binlog
    pub trunker_self: AtomicBool,
    /// Process-wide shutdown; cancelled on unrecoverable local failures
    pub shutdown: CancellationToken,
}

enum StreamExit {
    Stopped,
    Disconnected(TrunkError),
    Fatal,
}

pub(crate) struct PeerReplicator {
    ctx: Arc<SyncContext>,
    peer: Arc<StoragePeer>,
    reset: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl PeerReplicator {
    pub fn new(
        ctx: Arc<SyncContext>,
        peer: Arc<StoragePeer>,
        reset: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            peer,
            reset,
            cancel,
        }
    }

    pub async fn run(self) {
        info!(
            peer_id = %self.peer.id(),
            "Trunk sync task to storage server {}:{} started",
            self.peer.ip_addr(),
            self.ctx.config.server_port
        );

        while self.keep_running() {
            let Some(mut conn) = self.connect().await else {
                break;
            };

            let mut reader =
                match TrunkBinlogReader::init(&self.ctx.config, &self.peer, self.ctx.writer.clone())
                    .await
                {
                    Ok(reader) => reader,
                    Err(e) => {
                        error!(
                            peer_id = %self.peer.id(),
                            "Trunk reader init failed: {}, program exit", e
                        );
                        self.ctx.shutdown.cancel();
                        break;
                    }
                };

            if self.reset.swap(false, Ordering::AcqRel) {
                if let Err(e) = reader.reset_offset().await {
                    error!(
                        peer_id = %self.peer.id(),
                        "Reset binlog offset failed: {}, program exit", e
                    );
                    self.ctx.shutdown.cancel();
                    break;
                }
            }

            match conn.local_ip() {
                Ok(ip) => {
                    self.ctx.local_host.insert(ip);
                }
                Err(e) => debug!(peer_id = %self.peer.id(), "Get local address failed: {}", e),
            }

            let ip_addr = self.peer.ip_addr();
            if self.ctx.local_host.is_local_host_ip(&ip_addr) {
                error!(
                    peer_id = %self.peer.id(),
                    "ip_addr {} belongs to the local host, trunk sync task exit", ip_addr
                );
                if let Err(e) = conn.quit().await {
                    debug!(peer_id = %self.peer.id(), "Send quit failed: {}", e);
                }
                break;
            }

            if reader.binlog_offset() == 0 {
                if let Err(e) = self.guarded(conn.truncate_binlog()).await {
                    warn!(
                        peer_id = %self.peer.id(),
                        "Truncate binlog request to {} failed: {}", ip_addr, e
                    );
                    drop(conn);
                    drop(reader);
                    if !self.pause(TRUNCATE_RETRY_DELAY).await {
                        break;
                    }
                    continue;
                }
            }

            let exit = self.stream(&mut conn, &mut reader).await;
            if matches!(exit, StreamExit::Fatal) {
                break;
            }

            if let Err(e) = reader.checkpoint().await {
                error!(
                    peer_id = %self.peer.id(),
                    "Write to mark file failed: {}, program exit", e
                );
                self.ctx.shutdown.cancel();
                break;
            }

            drop(conn);
            drop(reader);

            if self.cancel.is_cancelled() {
                break;
            }

            let connection_lost = match &exit {
                StreamExit::Disconnected(e) => {
                    info!(peer_id = %self.peer.id(), "Trunk sync to {} interrupted: {}", ip_addr, e);
                    e.is_connection_lost()
                }
                _ => false,
            };
            if !connection_lost && !self.pause(RECONNECT_DELAY).await {
                break;
            }
        }

        info!(peer_id = %self.peer.id(), "Trunk sync task exit");
    }

    fn keep_running(&self) -> bool {
        !self.cancel.is_cancelled()
            && self.ctx.trunker_self.load(Ordering::Acquire)
            && !self.peer.status().is_terminal()
    }

    async fn connect(&self) -> Option<PeerConnection> {
        let config = &self.ctx.config;
        let mut previous_error: Option<String> = None;
        let mut continuous_fail = 0u32;

        while self.keep_running() {
            let addr = format!("{}:{}", self.peer.ip_addr(), config.server_port);
            let result = self
                .guarded(PeerConnection::connect(
                    &addr,
                    config.connect_timeout(),
                    config.network_timeout(),
                ))
                .await;

            match result {
                Ok(conn) => {
                    if continuous_fail > 0 {
                        info!(
                            peer_id = %self.peer.id(),
                            "Successfully connect to storage server {}, continuous fail count: {}",
                            addr, continuous_fail
                        );
                    } else {
                        info!(peer_id = %self.peer.id(), "Successfully connect to storage server {}", addr);
                    }
                    return Some(conn);
                }
                Err(TrunkError::Cancelled) => break,
                Err(e) => {
                    let message = e.to_string();
                    if previous_error.as_deref() != Some(message.as_str()) {
                        error!(
                            peer_id = %self.peer.id(),
                            "Connect to storage server {} failed: {}", addr, message
                        );
                        previous_error = Some(message);
                    }
                    continuous_fail += 1;
                    if !self.pause(CONNECT_RETRY_DELAY).await {
                        break;
                    }
                }
            }
        }

        if continuous_fail > 0 {
            warn!(
                peer_id = %self.peer.id(),
                "Connect to storage server {} gave up, try count: {}",
                self.peer.ip_addr(),
                continuous_fail
            );
        }
        None
    }

    async fn stream(&self, conn: &mut PeerConnection, reader: &mut TrunkBinlogReader) -> StreamExit {
        let config = &self.ctx.config;
        let heart_beat = Duration::from_secs(config.heart_beat_interval_secs);
        let mut last_keep_alive: Option<Instant> = None;

        while self.keep_running() {
            match reader.preread().await {
                Ok(()) => {}
                Err(TrunkError::NotFound) => {
                    if let Some(exit) = self.idle(conn, reader, heart_beat, &mut last_keep_alive).await {
                        return exit;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(peer_id = %self.peer.id(), "Read binlog failed: {}", e);
                    if !self.pause(READ_RETRY_DELAY).await {
                        return StreamExit::Stopped;
                    }
                    continue;
                }
            }

            match self.sync_data(conn, reader).await {
                Ok(true) => {
                    let pause = config.sync_interval();
                    if !pause.is_zero() && !self.pause(pause).await {
                        return StreamExit::Stopped;
                    }
                }
                Ok(false) => {
                    // Only a partial line is buffered; the writer will finish it
                    if let Some(exit) = self.idle(conn, reader, heart_beat, &mut last_keep_alive).await {
                        return exit;
                    }
                }
                Err(TrunkError::Cancelled) => return StreamExit::Stopped,
                Err(e) => return StreamExit::Disconnected(e),
            }
        }
        StreamExit::Stopped
    }

    /// Checkpoint, keep the connection alive and wait for new binlog data
    async fn idle(
        &self,
        conn: &mut PeerConnection,
        reader: &mut TrunkBinlogReader,
        heart_beat: Duration,
        last_keep_alive: &mut Option<Instant>,
    ) -> Option<StreamExit> {
        if let Err(e) = reader.checkpoint().await {
            error!(
                peer_id = %self.peer.id(),
                "Write to mark file failed: {}, program exit", e
            );
            self.ctx.shutdown.cancel();
            return Some(StreamExit::Fatal);
        }

        if last_keep_alive.map_or(true, |t| t.elapsed() >= heart_beat) {
            match self.guarded(conn.active_test()).await {
                Ok(()) => *last_keep_alive = Some(Instant::now()),
                Err(TrunkError::Cancelled) => return Some(StreamExit::Stopped),
                Err(e) => return Some(StreamExit::Disconnected(e)),
            }
        }

        if !self.ctx.trunker_self.load(Ordering::Acquire) {
            return Some(StreamExit::Stopped);
        }

        if !self.pause(self.ctx.config.sync_wait()).await {
            return Some(StreamExit::Stopped);
        }
        None
    }

    /// Send the complete lines in the reader's buffer. Returns false when
    /// there is no complete line to send.
    async fn sync_data(&self, conn: &mut PeerConnection, reader: &mut TrunkBinlogReader) -> Result<bool> {
        let sent = match reader.sync_payload() {
            Some(payload) => {
                self.guarded(conn.send_binlog(payload)).await?;
                payload.len()
            }
            None => {
                debug!(
                    peer_id = %self.peer.id(),
                    "No complete binlog line at offset {}",
                    reader.binlog_offset()
                );
                return Ok(false);
            }
        };

        reader.consume(sent);
        Ok(true)
    }

    /// Run `fut` unless the task is cancelled first
    async fn guarded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TrunkError::Cancelled),
            result = fut => result,
        }
    }

    /// Sleep for `duration`; false if cancelled meanwhile
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
