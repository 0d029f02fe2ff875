//! Integration tests for binlog replication against an in-process peer

use ouroboros_trunk::binlog::mark::{mark_file_path, render_mark};
use ouroboros_trunk::binlog::TrunkBinlogWriter;
use ouroboros_trunk::sync::{Command, PacketHeader, PACKET_HEADER_SIZE};
use ouroboros_trunk::{LocalHost, PeerStatus, StoragePeer, SyncSupervisor, TrunkConfig};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

const LINE_1: &[u8] = b"1700000001 A 0 1 2 3 0 1024\n";
const LINE_2: &[u8] = b"1700000002 D 0 1 2 3 0 1024\n";
const LINE_3_HEAD: &[u8] = b"1700000003 A 0 1";
const LINE_3_TAIL: &[u8] = b" 2 4 1024 512\n";

/// Fake storage node: acks every request and reports `(cmd, body)`
async fn spawn_fake_peer(ip: &str) -> (u16, mpsc::UnboundedReceiver<(u8, Vec<u8>)>) {
    spawn_fake_peer_with(ip, false).await
}

/// Like [`spawn_fake_peer`], optionally rejecting the first binlog batch
/// with a non-zero status
async fn spawn_fake_peer_with(
    ip: &str,
    reject_first_sync: bool,
) -> (u16, mpsc::UnboundedReceiver<(u8, Vec<u8>)>) {
    let reject = Arc::new(AtomicBool::new(reject_first_sync));
    let listener = TcpListener::bind((ip, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            let reject = reject.clone();
            tokio::spawn(async move {
                loop {
                    let mut buf = [0u8; PACKET_HEADER_SIZE];
                    if socket.read_exact(&mut buf).await.is_err() {
                        return;
                    }
                    let header = PacketHeader::decode(&buf);
                    let mut body = vec![0u8; header.pkg_len as usize];
                    if socket.read_exact(&mut body).await.is_err() {
                        return;
                    }
                    let _ = tx.send((header.cmd, body));
                    if header.cmd == Command::Quit as u8 {
                        return;
                    }
                    let status = if header.cmd == Command::TrunkSyncBinlog as u8
                        && reject.swap(false, Ordering::SeqCst)
                    {
                        5
                    } else {
                        0
                    };
                    let resp = PacketHeader::response(status, 0).encode();
                    if socket.write_all(&resp).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    (port, rx)
}

/// Next message with the given command, skipping keepalives
async fn next_command(rx: &mut mpsc::UnboundedReceiver<(u8, Vec<u8>)>, cmd: Command) -> Vec<u8> {
    tokio::time::timeout(WAIT, async {
        loop {
            let (got, body) = rx.recv().await.unwrap();
            if got == cmd as u8 {
                return body;
            }
            assert_eq!(got, Command::ActiveTest as u8, "unexpected command {}", got);
        }
    })
    .await
    .unwrap()
}

async fn wait_for_mark(path: &Path, offset: usize) {
    let expected = render_mark(offset as i64);
    tokio::time::timeout(WAIT, async {
        loop {
            if fs::read_to_string(path).ok().as_deref() == Some(expected.as_str()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

fn create_config(dir: &TempDir, port: u16) -> TrunkConfig {
    TrunkConfig::new(dir.path())
        .with_server_port(port)
        .with_sync_wait_usec(10_000)
}

fn create_supervisor(config: &TrunkConfig, writer: Arc<TrunkBinlogWriter>, shutdown: CancellationToken) -> SyncSupervisor {
    SyncSupervisor::new(
        Arc::new(config.clone()),
        writer,
        Arc::new(LocalHost::new()),
        shutdown,
    )
}

/// Test that a partial trailing line is held back until it is complete
#[tokio::test]
async fn test_partial_line_never_sent() {
    let temp_dir = TempDir::new().unwrap();
    let (port, mut rx) = spawn_fake_peer("127.0.0.2").await;
    let config = create_config(&temp_dir, port);
    let writer = Arc::new(TrunkBinlogWriter::open(&config).unwrap());

    writer
        .write_buffer(&[LINE_1, LINE_2, LINE_3_HEAD].concat())
        .unwrap();
    writer.sync().unwrap();

    let supervisor = create_supervisor(&config, writer.clone(), CancellationToken::new());
    let peer = Arc::new(StoragePeer::new("100002", "127.0.0.2", PeerStatus::Active));
    assert!(supervisor.start(peer.clone()).unwrap());

    // Fresh mark: the peer is told to drop its copy first
    next_command(&mut rx, Command::TrunkTruncateBinlogFile).await;

    let body = next_command(&mut rx, Command::TrunkSyncBinlog).await;
    assert_eq!(body, [LINE_1, LINE_2].concat());

    let mark = mark_file_path(&config, peer.id());
    wait_for_mark(&mark, LINE_1.len() + LINE_2.len()).await;

    // Completing the line releases it
    writer.write_buffer(LINE_3_TAIL).unwrap();
    writer.sync().unwrap();

    let body = next_command(&mut rx, Command::TrunkSyncBinlog).await;
    assert_eq!(body, [LINE_3_HEAD, LINE_3_TAIL].concat());

    let total = LINE_1.len() + LINE_2.len() + LINE_3_HEAD.len() + LINE_3_TAIL.len();
    wait_for_mark(&mark, total).await;

    assert_eq!(supervisor.kill_all().await, 0);
}

/// Test that replication resumes from the persisted offset without a truncate
#[tokio::test]
async fn test_resume_from_mark_file() {
    let temp_dir = TempDir::new().unwrap();
    let (port, mut rx) = spawn_fake_peer("127.0.0.2").await;
    let config = create_config(&temp_dir, port);
    let writer = Arc::new(TrunkBinlogWriter::open(&config).unwrap());

    writer.write_buffer(&[LINE_1, LINE_2].concat()).unwrap();
    writer.sync().unwrap();

    let peer = Arc::new(StoragePeer::new("100003", "127.0.0.2", PeerStatus::Active));
    fs::write(mark_file_path(&config, peer.id()), render_mark(LINE_1.len() as i64)).unwrap();

    let supervisor = create_supervisor(&config, writer, CancellationToken::new());
    supervisor.start(peer).unwrap();

    let body = next_command(&mut rx, Command::TrunkSyncBinlog).await;
    assert_eq!(body, LINE_2);

    assert_eq!(supervisor.kill_all().await, 0);
}

/// Test that a peer address belonging to this node ends the task with a quit
#[tokio::test]
async fn test_self_peer_quits() {
    let temp_dir = TempDir::new().unwrap();
    let (port, mut rx) = spawn_fake_peer("127.0.0.1").await;
    let config = create_config(&temp_dir, port);
    let writer = Arc::new(TrunkBinlogWriter::open(&config).unwrap());

    let supervisor = create_supervisor(&config, writer, CancellationToken::new());
    let peer = Arc::new(StoragePeer::new("100004", "127.0.0.1", PeerStatus::Active));
    supervisor.start(peer).unwrap();

    next_command(&mut rx, Command::Quit).await;
    tokio::time::timeout(WAIT, supervisor.wait_all_exit())
        .await
        .unwrap();
}

/// Test that an unwritable mark file shuts the process down
#[tokio::test]
async fn test_mark_failure_cancels_shutdown_token() {
    let temp_dir = TempDir::new().unwrap();
    let (port, _rx) = spawn_fake_peer("127.0.0.2").await;
    let config = create_config(&temp_dir, port);
    let writer = Arc::new(TrunkBinlogWriter::open(&config).unwrap());

    let peer = Arc::new(StoragePeer::new("100005", "127.0.0.2", PeerStatus::Active));
    let mark = mark_file_path(&config, peer.id());
    // A directory in the way of the temp file makes every mark write fail
    fs::create_dir_all(mark.with_extension("mark.tmp")).unwrap();

    let shutdown = CancellationToken::new();
    let supervisor = create_supervisor(&config, writer, shutdown.clone());
    supervisor.start(peer).unwrap();

    tokio::time::timeout(WAIT, shutdown.cancelled())
        .await
        .unwrap();
    tokio::time::timeout(WAIT, supervisor.wait_all_exit())
        .await
        .unwrap();
}

/// Test that clearing the trunk-server role stops streaming
#[tokio::test]
async fn test_trunker_self_cleared_stops_tasks() {
    let temp_dir = TempDir::new().unwrap();
    let (port, mut rx) = spawn_fake_peer("127.0.0.2").await;
    let config = create_config(&temp_dir, port);
    let writer = Arc::new(TrunkBinlogWriter::open(&config).unwrap());

    let supervisor = create_supervisor(&config, writer, CancellationToken::new());
    let peer = Arc::new(StoragePeer::new("100006", "127.0.0.2", PeerStatus::Active));
    supervisor.start(peer).unwrap();

    next_command(&mut rx, Command::TrunkTruncateBinlogFile).await;
    supervisor.set_trunker_self(false);

    tokio::time::timeout(WAIT, supervisor.wait_all_exit())
        .await
        .unwrap();
}

/// Test that a binlog written before a restart is streamed by the new process
#[tokio::test]
async fn test_binlog_from_previous_process_is_sent() {
    let temp_dir = TempDir::new().unwrap();
    let (port, mut rx) = spawn_fake_peer("127.0.0.2").await;
    let config = create_config(&temp_dir, port);

    {
        let writer = TrunkBinlogWriter::open(&config).unwrap();
        writer.write_buffer(&[LINE_1, LINE_2].concat()).unwrap();
        writer.sync().unwrap();
    }

    // Restart: nothing new is written by this process
    let writer = Arc::new(TrunkBinlogWriter::open(&config).unwrap());
    let supervisor = create_supervisor(&config, writer, CancellationToken::new());
    let peer = Arc::new(StoragePeer::new("100007", "127.0.0.2", PeerStatus::Active));
    supervisor.start(peer.clone()).unwrap();

    next_command(&mut rx, Command::TrunkTruncateBinlogFile).await;
    let body = next_command(&mut rx, Command::TrunkSyncBinlog).await;
    assert_eq!(body, [LINE_1, LINE_2].concat());

    wait_for_mark(&mark_file_path(&config, peer.id()), LINE_1.len() + LINE_2.len()).await;
    assert_eq!(supervisor.kill_all().await, 0);
}

/// Test that a batch the peer rejects is resent after reconnecting
#[tokio::test]
async fn test_rejected_batch_resent_from_unchanged_offset() {
    let temp_dir = TempDir::new().unwrap();
    let (port, mut rx) = spawn_fake_peer_with("127.0.0.2", true).await;
    let config = create_config(&temp_dir, port);
    let writer = Arc::new(TrunkBinlogWriter::open(&config).unwrap());

    writer.write_buffer(LINE_1).unwrap();
    writer.sync().unwrap();

    let supervisor = create_supervisor(&config, writer, CancellationToken::new());
    let peer = Arc::new(StoragePeer::new("100008", "127.0.0.2", PeerStatus::Active));
    supervisor.start(peer.clone()).unwrap();
    let mark = mark_file_path(&config, peer.id());

    next_command(&mut rx, Command::TrunkTruncateBinlogFile).await;
    let rejected = next_command(&mut rx, Command::TrunkSyncBinlog).await;
    assert_eq!(rejected, LINE_1);

    // Reconnect starts over from offset 0, so the peer is truncated again
    next_command(&mut rx, Command::TrunkTruncateBinlogFile).await;
    assert_eq!(fs::read_to_string(&mark).unwrap(), render_mark(0));

    let resent = next_command(&mut rx, Command::TrunkSyncBinlog).await;
    assert_eq!(resent, LINE_1);

    wait_for_mark(&mark, LINE_1.len()).await;
    assert_eq!(supervisor.kill_all().await, 0);
}
