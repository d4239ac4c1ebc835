//! Daemon wiring and lifecycle.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cloudflare::{CloudflareClient, TunnelApi};
use crate::config::Config;
use crate::docker::DockerSource;
use crate::error::Error;
use crate::metrics::TriggerReason;
use crate::reconciler::{PassTrigger, ReconcileSettings, Reconciler};
use crate::source::ContainerSource;
use crate::watcher::{EventWatcher, WatcherSettings};

/// Syncs tunnel ingress and DNS from container labels until cancelled.
pub struct Daemon {
    config: Config,
    source: Arc<dyn ContainerSource>,
    api: Arc<dyn TunnelApi>,
}

impl Daemon {
    /// Connect to the local Docker Engine and build the Cloudflare client.
    pub fn new(config: Config) -> Result<Self, Error> {
        let source = Arc::new(DockerSource::connect()?);
        let api = Arc::new(CloudflareClient::new(&config.cloudflare)?);
        Ok(Self::with_backends(config, source, api))
    }

    /// Use the given container source and tunnel API.
    pub fn with_backends(
        config: Config,
        source: Arc<dyn ContainerSource>,
        api: Arc<dyn TunnelApi>,
    ) -> Self {
        Self {
            config,
            source,
            api,
        }
    }

    /// Run until `cancel` fires. A pass is requested immediately on start.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        info!(
            default_tunnel = ?self.config.tunnel.default_tunnel_id,
            orphans = ?self.config.reconcile.orphans,
            dry_run = self.config.reconcile.dry_run,
            debounce_ms = self.config.reconcile.debounce_ms,
            resync_interval_secs = self.config.reconcile.resync_interval_secs,
            "Starting cfd-hostnames"
        );

        let trigger = PassTrigger::new();
        let reconciler = Arc::new(Reconciler::new(
            self.source.clone(),
            self.api.clone(),
            ReconcileSettings::from(&self.config),
        ));

        let worker_handle = tokio::spawn(reconciler.run(trigger.clone(), cancel.clone()));

        let watcher = EventWatcher::new(
            self.source.clone(),
            trigger.clone(),
            WatcherSettings::from(&self.config.reconcile),
        );
        let watcher_handle = tokio::spawn(watcher.run(cancel.clone()));

        trigger.request(TriggerReason::Startup);

        cancel.cancelled().await;
        info!("Shutdown requested, waiting for in-flight pass to finish...");

        let (worker_result, watcher_result) = tokio::join!(worker_handle, watcher_handle);
        if let Err(e) = worker_result {
            error!("Reconciler task panicked: {}", e);
        }
        if let Err(e) = watcher_result {
            error!("Event watcher task panicked: {}", e);
        }

        info!("cfd-hostnames stopped");
        Ok(())
    }
}
