//! Peer sync task registry
//!
//! Owns one cancellable tokio task per replication peer, keyed by peer id.
//! A finished task's entry is replaced when the peer is started again.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::peer::{LocalHost, StoragePeer};
use super::replicator::{PeerReplicator, SyncContext};
use crate::binlog::TrunkBinlogWriter;
use crate::config::TrunkConfig;
use crate::error::{Result, TrunkError};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct PeerTask {
    cancel: CancellationToken,
    reset: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl PeerTask {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Starts, tracks and stops peer sync tasks.
///
/// Must be used from within a tokio runtime.
pub struct SyncSupervisor {
    ctx: Arc<SyncContext>,
    tasks: Mutex<HashMap<String, PeerTask>>,
}

impl SyncSupervisor {
    /// `shutdown` is the process-wide token: peer tasks stop when it is
    /// cancelled, and cancel it themselves on unrecoverable local failures.
    pub fn new(
        config: Arc<TrunkConfig>,
        writer: Arc<TrunkBinlogWriter>,
        local_host: Arc<LocalHost>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx: Arc::new(SyncContext {
                config,
                writer,
                local_host,
                trunker_self: AtomicBool::new(true),
                shutdown,
            }),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the sync task for `peer`.
    ///
    /// Returns false without spawning when the peer is in a terminal status
    /// or is this node. `AlreadyExists` if its task is still running.
    pub fn start(&self, peer: Arc<StoragePeer>) -> Result<bool> {
        if peer.status().is_terminal() {
            debug!(peer_id = %peer.id(), "Skip peer in status {:?}", peer.status());
            return Ok(false);
        }
        if peer.id() == self.ctx.config.storage_id
            || self.ctx.local_host.is_local_host_ip(&peer.ip_addr())
        {
            return Ok(false);
        }

        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.get(peer.id()) {
            if task.is_running() {
                return Err(TrunkError::AlreadyExists);
            }
        }

        let cancel = self.ctx.shutdown.child_token();
        let reset = Arc::new(AtomicBool::new(false));
        let replicator =
            PeerReplicator::new(self.ctx.clone(), peer.clone(), reset.clone(), cancel.clone());
        let handle = tokio::spawn(replicator.run());

        tasks.insert(
            peer.id().to_string(),
            PeerTask {
                cancel,
                reset,
                handle,
            },
        );
        Ok(true)
    }

    /// Start every eligible peer; returns how many tasks were spawned
    pub fn start_all(&self, peers: &[Arc<StoragePeer>]) -> usize {
        let mut started = 0;
        for peer in peers {
            match self.start(peer.clone()) {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => warn!(peer_id = %peer.id(), "Start trunk sync task failed: {}", e),
            }
        }
        info!("Started {} trunk sync tasks", started);
        started
    }

    /// Make the peer's task resend the whole binlog on its next
    /// (re)connect
    pub fn reset_binlog_offset(&self, peer_id: &str) -> Result<()> {
        let tasks = self.tasks.lock();
        let task = tasks.get(peer_id).ok_or(TrunkError::NotFound)?;
        task.reset.store(true, Ordering::Release);
        Ok(())
    }

    /// Cancel one peer's task and wait for it
    pub async fn stop(&self, peer_id: &str) -> Result<()> {
        let task = self
            .tasks
            .lock()
            .remove(peer_id)
            .ok_or(TrunkError::NotFound)?;

        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!(peer_id = %peer_id, "Trunk sync task ended abnormally: {}", e);
        }
        Ok(())
    }

    /// Cancel every task and wait up to the configured shutdown timeout.
    ///
    /// Returns how many tasks were still running when the wait gave up.
    pub async fn kill_all(&self) -> usize {
        let count = {
            let tasks = self.tasks.lock();
            for task in tasks.values() {
                task.cancel.cancel();
            }
            tasks.len()
        };
        info!("Stopping {} trunk sync tasks", count);

        let timeout = self.ctx.config.shutdown_timeout();
        if tokio::time::timeout(timeout, self.wait_all_exit())
            .await
            .is_err()
        {
            let remaining = self.running_count();
            warn!(
                "{} trunk sync tasks still running after {:?}, giving up",
                remaining, timeout
            );
            return remaining;
        }
        0
    }

    /// Wait until no task is running
    pub async fn wait_all_exit(&self) {
        while self.running_count() > 0 {
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    pub fn running_count(&self) -> usize {
        self.tasks.lock().values().filter(|t| t.is_running()).count()
    }

    pub fn is_running(&self, peer_id: &str) -> bool {
        self.tasks
            .lock()
            .get(peer_id)
            .is_some_and(|t| t.is_running())
    }

    /// Whether this node is the trunk server. Streaming loops stop once
    /// this is cleared.
    pub fn set_trunker_self(&self, trunker_self: bool) {
        self.ctx.trunker_self.store(trunker_self, Ordering::Release);
    }

    pub fn is_trunker_self(&self) -> bool {
        self.ctx.trunker_self.load(Ordering::Acquire)
    }
}

impl Drop for SyncSupervisor {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        let running = tasks.values().filter(|t| t.is_running()).count();
        if running > 0 {
            warn!("SyncSupervisor dropped with {} running tasks, cancelling", running);
        }
        for task in tasks.values() {
            task.cancel.cancel();
        }
    }
}
