//! Integration tests for the scheduler driving the binlog and file-id table

use chrono::{Local, TimeZone};
use ouroboros_trunk::binlog::{TrunkBinlogWriter, TrunkFullInfo, TrunkOpType};
use ouroboros_trunk::{Clock, FileIdConfig, FileIdTable, ManualClock, ScheduleEntry, Scheduler, TrunkConfig, TrunkError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

const SLICE: Duration = Duration::from_millis(10);

fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn small_table(clock: Arc<ManualClock>) -> Arc<FileIdTable> {
    let config = FileIdConfig {
        bucket_count: 1021,
        lock_count: 7,
        grace_period_secs: 3,
    };
    Arc::new(FileIdTable::new(&config, clock).unwrap())
}

/// Test the dedup window: duplicate rejected until the expiry task runs
#[test]
fn test_file_id_expires_through_scheduler() {
    let clock = ManualClock::new(10_000);
    let table = small_table(clock.clone());
    let cancel = CancellationToken::new();

    let mut scheduler = Scheduler::start_with_slice(
        vec![FileIdTable::expiry_entry(table.clone())],
        clock.clone(),
        &cancel,
        SLICE,
    )
    .unwrap();

    assert_ok!(table.add(b"group1/M00/00/00/abc"));
    assert!(matches!(
        assert_err!(table.add(b"group1/M00/00/00/abc")),
        TrunkError::AlreadyExists
    ));

    for _ in 0..4 {
        clock.advance(1);
        thread::sleep(SLICE * 5);
    }
    assert!(wait_until(|| table.is_empty()));

    assert_ok!(table.add(b"group1/M00/00/00/abc"));
    scheduler.stop();
}

/// Test that the flush task makes buffered records durable
#[test]
fn test_binlog_flushed_by_scheduler() {
    let temp_dir = TempDir::new().unwrap();
    let config = TrunkConfig::new(temp_dir.path());
    let writer = Arc::new(TrunkBinlogWriter::open(&config).unwrap());
    let clock = ManualClock::new(0);
    let cancel = CancellationToken::new();

    let mut scheduler = Scheduler::start_with_slice(
        vec![TrunkBinlogWriter::flush_entry(writer.clone(), 1)],
        clock.clone(),
        &cancel,
        SLICE,
    )
    .unwrap();

    writer
        .write(1, TrunkOpType::AddSpace, &TrunkFullInfo::default())
        .unwrap();
    assert_eq!(writer.write_version(), 0);

    clock.advance(1);
    assert!(wait_until(|| writer.write_version() == 1));
    assert_eq!(writer.buffered_len(), 0);

    // Nothing new: later runs do not bump the version
    clock.advance(1);
    thread::sleep(SLICE * 10);
    assert_eq!(writer.write_version(), 1);

    scheduler.stop();
}

/// Test that a daily anchor aligns the first run to the anchor grid
#[test]
fn test_time_base_aligns_first_run() {
    let start = Local
        .with_ymd_and_hms(2024, 1, 10, 10, 0, 0)
        .single()
        .unwrap()
        .timestamp();
    let clock = ManualClock::new(start);
    let hits = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();

    let task_hits = hits.clone();
    let task_clock = clock.clone();
    let entry = ScheduleEntry::new(7, 3_600, move || {
        task_hits.lock().push(task_clock.now());
        Ok(())
    })
    .with_time_base(9, 30);

    let mut scheduler = Scheduler::start_with_slice(vec![entry], clock.clone(), &cancel, SLICE).unwrap();

    clock.set(start + 1_799);
    thread::sleep(SLICE * 10);
    assert!(hits.lock().is_empty());

    clock.set(start + 1_800);
    assert!(wait_until(|| hits.lock().len() == 1));
    assert_eq!(hits.lock()[0], start + 1_800);

    scheduler.stop();
}

/// Test that cancelling the shared token stops the scheduler thread
#[test]
fn test_cancel_token_stops_scheduler() {
    let clock = ManualClock::new(0);
    let cancel = CancellationToken::new();
    let scheduler = Scheduler::start_with_slice(Vec::new(), clock, &cancel, SLICE).unwrap();
    assert!(scheduler.is_running());

    cancel.cancel();
    assert!(wait_until(|| !scheduler.is_running()));
    assert!(matches!(
        scheduler.add_entries(vec![ScheduleEntry::new(1, 1, || Ok(()))]),
        Err(TrunkError::SchedulerStopped)
    ));
}
