//! cfd-hostnames binary entry point.

use cfd_hostnames::{telemetry, Config, Daemon};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Sync Cloudflare tunnel ingress rules and DNS records from Docker container labels.
#[derive(Parser, Debug)]
#[command(name = "cfd-hostnames")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, env = "CFD_HOSTNAMES_CONFIG")]
    config: Option<PathBuf>,

    /// Compute and log changes without calling mutating APIs.
    #[arg(long)]
    dry_run: bool,

    /// Log level filter, overrides `telemetry.log_level`.
    #[arg(long)]
    log_level: Option<String>,
}

/// Resolve on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if args.dry_run {
        config.reconcile.dry_run = true;
    }
    if let Some(level) = args.log_level {
        config.telemetry.log_level = level;
    }

    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = ?args.config,
        account_id = %config.cloudflare.account_id,
        api_base = %config.cloudflare.api_base,
        "Starting cfd-hostnames"
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = shutdown_signal().await {
                error!("Failed to listen for shutdown signals: {}", e);
            }
            cancel.cancel();
        }
    });

    let result = match Daemon::new(config) {
        Ok(daemon) => daemon.run(cancel).await,
        Err(e) => Err(e),
    };

    telemetry::shutdown();

    if let Err(e) = result {
        error!("cfd-hostnames error: {}", e);
        return Err(e.into());
    }

    info!("cfd-hostnames shutdown complete");
    Ok(())
}
