//! Cooperative periodic scheduler
//!
//! Runs every maintenance task of the storage node on one dedicated thread.
//! Other threads change the task set through a mailbox of capacity one: a
//! pending batch of additions and a pending deletion. While a request is
//! still waiting to be picked up, further requests fail with
//! [`TrunkError::Busy`] and the caller retries later.
//!
//! Schedule mutations are administrative and rare. The mailbox gives no
//! fairness between concurrent callers, so at most one thread should issue
//! `add_entries`/`delete_entry` at a time.
//!
//! The thread sleeps in short slices (one second by default), waking early
//! when the mailbox receives a request or the cancellation token fires. A
//! running task is never interrupted.

mod chain;
mod entry;

pub use entry::{ScheduleEntry, TaskFn, TimeBase};

use chain::ScheduleChain;
use chrono::{DateTime, Local, TimeZone};
use crossbeam_channel::{bounded, Receiver, Select, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{Result, TrunkError};

/// Task id of the periodic binlog flush
pub const BINLOG_FLUSH_TASK_ID: u32 = 1;

/// Task id of the file-id expiry sweep
pub const CLEAR_EXPIRED_FILE_ID_TASK_ID: u32 = 2;

/// Default sleep slice of the scheduler thread
pub const SLEEP_SLICE: Duration = Duration::from_secs(1);

/// Outcome of draining the mailbox
enum Mailbox {
    Unchanged,
    Changed,
    Closed,
}

/// Handle to the scheduler thread
pub struct Scheduler {
    add_tx: Sender<Vec<ScheduleEntry>>,
    del_tx: Sender<u32>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Validate `entries` and start the scheduler thread.
    ///
    /// The thread stops when `cancel` (or the scheduler's own child token)
    /// is cancelled.
    pub fn start(
        entries: Vec<ScheduleEntry>,
        clock: Arc<dyn Clock>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        Self::start_with_slice(entries, clock, cancel, SLEEP_SLICE)
    }

    /// Like [`Scheduler::start`] with a custom sleep slice
    pub fn start_with_slice(
        mut entries: Vec<ScheduleEntry>,
        clock: Arc<dyn Clock>,
        cancel: &CancellationToken,
        slice: Duration,
    ) -> Result<Self> {
        init_entries(&mut entries, clock.as_ref())?;

        let (add_tx, add_rx) = bounded::<Vec<ScheduleEntry>>(1);
        let (del_tx, del_rx) = bounded::<u32>(1);
        let cancel = cancel.child_token();
        let running = Arc::new(AtomicBool::new(true));

        info!("Starting scheduler thread with {} entries", entries.len());

        let thread_clock = clock.clone();
        let thread_cancel = cancel.clone();
        let thread_running = running.clone();
        let thread_handle = thread::Builder::new()
            .name("trunk-scheduler".to_string())
            .spawn(move || {
                let chain = ScheduleChain::with_entries(entries);
                Self::scheduler_thread(chain, add_rx, del_rx, thread_clock, thread_cancel, slice);
                thread_running.store(false, Ordering::SeqCst);
            })?;

        Ok(Self {
            add_tx,
            del_tx,
            clock,
            cancel,
            running,
            thread_handle: Some(thread_handle),
        })
    }

    /// Stage a batch of entries for the scheduler thread.
    ///
    /// Entries whose id is already scheduled replace the existing entry;
    /// the others are appended. Fails with `Busy` while an earlier batch
    /// has not been merged yet.
    pub fn add_entries(&self, mut entries: Vec<ScheduleEntry>) -> Result<()> {
        if entries.is_empty() {
            return Err(TrunkError::NotFound);
        }
        init_entries(&mut entries, self.clock.as_ref())?;

        match self.add_tx.try_send(entries) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TrunkError::Busy),
            Err(TrySendError::Disconnected(_)) => Err(TrunkError::SchedulerStopped),
        }
    }

    /// Stage the removal of the entry with `id`.
    ///
    /// Fails with `Busy` while an earlier deletion is still pending.
    pub fn delete_entry(&self, id: u32) -> Result<()> {
        match self.del_tx.try_send(id) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TrunkError::Busy),
            Err(TrySendError::Disconnected(_)) => Err(TrunkError::SchedulerStopped),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request a stop and wait for the current task to finish
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("Scheduler thread panicked");
            }
        }
    }

    fn scheduler_thread(
        mut chain: ScheduleChain,
        add_rx: Receiver<Vec<ScheduleEntry>>,
        del_rx: Receiver<u32>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
        slice: Duration,
    ) {
        info!("Scheduler thread started");

        'outer: while !cancel.is_cancelled() {
            if let Mailbox::Closed = Self::check_waiting(&mut chain, &add_rx, &del_rx) {
                break;
            }

            let Some(mut due) = chain.head_time() else {
                if let Mailbox::Closed = Self::wait_slice(&mut chain, &add_rx, &del_rx, slice) {
                    break;
                }
                continue;
            };

            while clock.now() < due && !cancel.is_cancelled() {
                match Self::wait_slice(&mut chain, &add_rx, &del_rx, slice) {
                    Mailbox::Closed => break 'outer,
                    Mailbox::Changed => match chain.head_time() {
                        Some(t) => due = t,
                        None => continue 'outer,
                    },
                    Mailbox::Unchanged => {}
                }
            }

            if cancel.is_cancelled() {
                break;
            }

            let now = clock.now();
            let executed = chain.run_due(now, || !cancel.is_cancelled());
            if executed > 0 {
                debug!("Executed {} scheduled tasks at {}", executed, now);
            }
        }

        info!("Scheduler thread stopped");
    }

    /// Sleep one slice, waking early when the mailbox has a request
    fn wait_slice(
        chain: &mut ScheduleChain,
        add_rx: &Receiver<Vec<ScheduleEntry>>,
        del_rx: &Receiver<u32>,
        slice: Duration,
    ) -> Mailbox {
        let mut sel = Select::new();
        sel.recv(add_rx);
        sel.recv(del_rx);
        match sel.ready_timeout(slice) {
            Ok(_) => Self::check_waiting(chain, add_rx, del_rx),
            Err(_) => Mailbox::Unchanged,
        }
    }

    /// Apply a pending deletion, then a pending batch
    fn check_waiting(
        chain: &mut ScheduleChain,
        add_rx: &Receiver<Vec<ScheduleEntry>>,
        del_rx: &Receiver<u32>,
    ) -> Mailbox {
        let mut changed = false;

        match del_rx.try_recv() {
            Ok(id) => {
                if chain.remove(id) {
                    changed = true;
                } else {
                    debug!("Schedule delete of unknown task id {}", id);
                }
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return Mailbox::Closed,
        }

        match add_rx.try_recv() {
            Ok(entries) => {
                chain.merge(entries);
                changed = true;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return Mailbox::Closed,
        }

        if changed {
            Mailbox::Changed
        } else {
            Mailbox::Unchanged
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            warn!("Scheduler dropped without explicit stop - forcing shutdown");
            self.stop();
        }
    }
}

fn local_time(ts: i64) -> DateTime<Local> {
    Local.timestamp_opt(ts, 0).single().unwrap_or_else(Local::now)
}

/// Validate entries and compute their first fire time
fn init_entries(entries: &mut [ScheduleEntry], clock: &dyn Clock) -> Result<()> {
    let now = local_time(clock.now());
    for entry in entries.iter_mut() {
        entry.validate()?;
        entry.next_call_time = entry.first_call_time(&now);
    }
    Ok(())
}
