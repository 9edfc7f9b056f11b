//! The tally daemon: an authoritative replicator speaking newline-delimited
//! JSON frames on stdin/stdout.
//!
//! A gateway process (websocket fanout, ZMQ bridge) owns the client
//! connections and pipes frames through this process, which owns the state,
//! the revisions, and the durable store.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tally::link::ChannelLink;
use tally::{ReplicantStore, Replicator, ReplicatorTuning, SyncFrame};
use tallyconf::TallyConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

/// The tally replicant authority
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a config file (takes the place of ./tally.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured state directory
    #[arg(short, long)]
    state_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config =
        TallyConfig::load_from(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = cli.state_dir {
        config.paths.state_dir = dir;
    }

    tally::telemetry::init(&config.telemetry.log_level);

    std::fs::create_dir_all(&config.paths.state_dir)
        .context("Failed to create state directory")?;
    info!("Using state directory: {}", config.paths.state_dir.display());

    let store = ReplicantStore::open(&config.paths.state_dir)
        .context("Failed to open the replicant store")?;
    let (link, outbound) = ChannelLink::pair();
    let replicator = Replicator::authority_with_store(link, store).with_tuning(ReplicatorTuning {
        predeclare_cap: config.replication.predeclare_buffer,
        queue_warn_depth: config.replication.queue_warn_depth,
        default_persistence_interval: Duration::from_millis(
            config.replication.persistence_interval_ms,
        ),
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut tick = tokio::time::interval(Duration::from_millis(25));

    info!("tally authority ready");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        match replicator.receive_json(&line) {
                            Ok(()) => {}
                            Err(e @ tally::ReplicantError::UnknownOperationMethod { .. }) => {
                                error!("fatal protocol error: {e}");
                                anyhow::bail!(e);
                            }
                            Err(e) => warn!("rejected inbound frame: {e}"),
                        }
                        // Each inbound frame is one turn.
                        replicator.flush_pending();
                    }
                    None => break,
                }
            }
            _ = tick.tick() => {
                replicator.flush_pending();
                if let Some(persistor) = replicator.persistor() {
                    persistor.flush_due(Instant::now());
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
        drain_outbound(&outbound, &mut stdout).await?;
    }

    replicator.flush_pending();
    drain_outbound(&outbound, &mut stdout).await?;
    if let Some(persistor) = replicator.persistor() {
        let written = persistor.flush_all();
        info!("flushed {written} pending write(s) to the store");
    }
    info!("shutting down");
    Ok(())
}

async fn drain_outbound(
    outbound: &std::sync::mpsc::Receiver<SyncFrame>,
    stdout: &mut tokio::io::Stdout,
) -> Result<()> {
    let mut wrote = false;
    while let Ok(frame) = outbound.try_recv() {
        let line = serde_json::to_string(&frame).context("Failed to encode frame")?;
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        wrote = true;
    }
    if wrote {
        stdout.flush().await?;
    }
    Ok(())
}
