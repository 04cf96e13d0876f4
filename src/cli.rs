use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use flowsentry::config::Config;
use flowsentry::warehouse::{self, WarehouseMode, WarehouseWriter};
use flowsentry::{kernel, Daemon};

#[derive(Parser)]
#[command(name = "flowsentry")]
#[command(author, version, about = "Userspace packet inspection daemon")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// host:port for the categorisation daemon
    #[arg(long, value_name = "HOST:PORT")]
    pub classd: Option<String>,

    /// Disable the session dictionary
    #[arg(long)]
    pub disable_dict: bool,

    /// Ignore live traffic (no queue binding)
    #[arg(long)]
    pub bypass: bool,

    /// Playback traffic from the specified capture file
    #[arg(long, value_name = "FILE")]
    pub playback: Option<PathBuf>,

    /// Capture traffic to the specified file
    #[arg(long, value_name = "FILE")]
    pub capture: Option<PathBuf>,

    /// Traffic playback speed percentage
    #[arg(long, default_value_t = 100)]
    pub playspeed: u32,
}

impl Cli {
    /// Resolve the effective configuration from file plus flag overrides
    fn build_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::load_or_default()?,
        };

        if let Some(classd) = &self.classd {
            config.classify.host_port = classd.clone();
        }
        if self.disable_dict {
            config.general.disable_dict = true;
        }
        if self.bypass {
            config.general.bypass = true;
        }
        if let Some(file) = &self.playback {
            config.warehouse.file = Some(file.display().to_string());
        }
        if let Some(file) = &self.capture {
            config.warehouse.file = Some(file.display().to_string());
        }
        config.warehouse.speed = self.playspeed;

        Ok(config)
    }

    /// Which warehouse mode the flags select
    fn warehouse_mode(&self) -> WarehouseMode {
        if self.playback.is_some() {
            WarehouseMode::Playback
        } else if self.capture.is_some() {
            WarehouseMode::Capture
        } else {
            WarehouseMode::Live
        }
    }
}

/// Run the daemon until playback completes or a signal arrives
pub async fn run(cli: Cli) -> Result<()> {
    let config = cli.build_config()?;
    let mode = cli.warehouse_mode();
    let daemon = Daemon::startup(config).await?;

    match mode {
        WarehouseMode::Playback => {
            let file = cli.playback.as_ref().expect("playback file");
            let stats = warehouse::playback(file, cli.playspeed, &daemon.dispatch).await?;
            info!("processed {} recorded events", stats.events);
        }
        WarehouseMode::Capture | WarehouseMode::Live => {
            let capture = match &cli.capture {
                Some(path) => Some(Arc::new(WarehouseWriter::create(path)?)),
                None => None,
            };

            let stop = Arc::new(AtomicBool::new(false));
            let queue = if daemon.config.general.bypass {
                info!("bypass enabled; not binding the packet queue");
                None
            } else {
                let dispatch = Arc::clone(&daemon.dispatch);
                let queue_num = daemon.config.dispatch.queue_num;
                let stop = Arc::clone(&stop);
                Some(tokio::spawn(async move {
                    if let Err(err) = kernel::run_live_queue(dispatch, queue_num, capture, stop).await {
                        warn!("queue loop failed: {}", err);
                    }
                }))
            };

            wait_for_shutdown_signal().await;
            stop.store(true, Ordering::Release);
            if let Some(queue) = queue {
                queue.abort();
                let _ = queue.await;
            }
        }
    }

    daemon.shutdown().await;
    Ok(())
}

/// Block until SIGINT or SIGTERM
async fn wait_for_shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!("unable to install SIGTERM handler: {}", err);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = term.recv() => info!("received SIGTERM, shutting down"),
    }
}
