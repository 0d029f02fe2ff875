//! Trunk Server
//!
//! Runs the trunk core of a storage node: periodic binlog flush and file-id
//! expiry on the scheduler thread, plus binlog replication to every peer.

use clap::Parser;
use ouroboros_trunk::clock::system_clock;
use ouroboros_trunk::{
    FileIdTable, LocalHost, ScheduleEntry, Scheduler, StoragePeer, SyncSupervisor,
    TrunkBinlogWriter, TrunkConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "trunk-server")]
#[command(about = "Trunk binlog writer and replicator for a storage node")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the storage base path
    #[arg(long)]
    base_path: Option<PathBuf>,

    /// Override the local storage id
    #[arg(long)]
    storage_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => TrunkConfig::from_file(path)?,
        None => TrunkConfig::default(),
    };
    if let Some(base_path) = args.base_path {
        config.base_path = base_path;
    }
    if let Some(storage_id) = args.storage_id {
        config.storage_id = storage_id;
    }
    config.validate()?;
    let config = Arc::new(config);

    info!(
        "Starting trunk server {} with base path {}",
        config.storage_id,
        config.base_path.display()
    );

    let writer = Arc::new(TrunkBinlogWriter::open(&config)?);

    // A rollback file left by an interrupted compression must be merged back
    // before anything else touches the binlog
    writer.compress_rollback()?;

    let clock = system_clock();
    let file_ids = Arc::new(FileIdTable::new(&config.file_id, clock.clone())?);

    let shutdown = CancellationToken::new();

    let entries: Vec<ScheduleEntry> = vec![
        TrunkBinlogWriter::flush_entry(writer.clone(), config.binlog_flush_interval_secs),
        FileIdTable::expiry_entry(file_ids.clone()),
    ];
    let mut scheduler = Scheduler::start(entries, clock, &shutdown)?;

    let supervisor = SyncSupervisor::new(
        config.clone(),
        writer.clone(),
        Arc::new(LocalHost::new()),
        shutdown.clone(),
    );
    let peers: Vec<Arc<StoragePeer>> = config
        .peers
        .iter()
        .map(|peer| Arc::new(StoragePeer::from(peer)))
        .collect();
    supervisor.start_all(&peers);

    // Wait for ctrl-c, or for a component to request shutdown
    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown signal received"),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
        _ = shutdown.cancelled() => {
            error!("Fatal error in trunk sync, shutting down");
        }
    }
    shutdown.cancel();

    let remaining = supervisor.kill_all().await;
    if remaining > 0 {
        warn!("Exiting with {} trunk sync tasks still running", remaining);
    }

    scheduler.stop();

    if let Err(e) = writer.sync() {
        error!("Final binlog flush failed: {}", e);
    }

    info!("Trunk server shutdown complete");
    Ok(())
}
