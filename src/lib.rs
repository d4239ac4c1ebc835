//! cfd-hostnames - Cloudflare tunnel hostnames from Docker container labels.
//!
//! This crate keeps a Cloudflare tunnel's public-hostname ingress rules and
//! the matching DNS records in sync with the containers running on a host.
//! Containers opt in by carrying labels; the daemon watches the container
//! runtime and converges the remote configuration whenever containers come
//! and go.
//!
//! ## Features
//!
//! - Declarative routing via `cloudflare.zero_trust.access.tunnel.*` labels
//! - Idempotent passes: no remote call when nothing changed
//! - Hostnames managed by hand on the same tunnel are left alone
//! - Debounced event handling plus a periodic drift-correcting pass
//! - Automatic reconnection to the container runtime
//! - Dry-run mode and graceful shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         cfd-hostnames                          │
//! │                                                                │
//! │  ┌──────────────┐  request   ┌──────────────┐                  │
//! │  │ EventWatcher │───────────▶│ PassTrigger  │                  │
//! │  │ (events,     │            └──────┬───────┘                  │
//! │  │  resync)     │                   │ one pending permit       │
//! │  └──────┬───────┘                   ▼                          │
//! │         │ subscribe          ┌──────────────┐    TunnelApi     │
//! │         ▼                    │  Reconciler  │─────────────────▶│── ingress + DNS
//! │  ┌──────────────┐    list    │   (gated)    │                  │
//! │  │ DockerSource │◀───────────┴──────────────┘                  │
//! │  └──────────────┘                                              │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Labels
//!
//! ```text
//! cloudflare.zero_trust.access.tunnel.public_hostname = app.example.com
//! cloudflare.zero_trust.access.tunnel.service         = http://app:8080
//! cloudflare.zero_trust.access.tunnel.id              = <tunnel uuid>
//! cloudflare.zero_trust.access.tunnel.tls.notlsverify = true
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use cfd_hostnames::{Config, Daemon};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     let cancel = CancellationToken::new();
//!
//!     let daemon = Daemon::new(config)?;
//!     daemon.run(cancel).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod cloudflare;
pub mod config;
pub mod daemon;
pub mod desired;
pub mod docker;
pub mod error;
pub mod labels;
pub mod metrics;
pub mod model;
pub mod reconciler;
pub mod source;
pub mod telemetry;
pub mod watcher;

// Re-export main types
pub use cloudflare::{CloudflareClient, TunnelApi};
pub use config::{CloudflareConfig, Config, OrphanPolicy, ReconcileConfig, TelemetryConfig, TunnelDefaults};
pub use daemon::Daemon;
pub use desired::DesiredState;
pub use error::{ApiError, ConfigError, ConnectionError, Error, ExtractionError};
pub use model::{DnsRecord, IngressRule, RoutingRule, TunnelRouting};
pub use reconciler::{PassReport, PassTrigger, ReconcileSettings, Reconciler};
pub use source::{ContainerEvent, ContainerMetadata, ContainerSource};
pub use watcher::{EventWatcher, WatcherSettings};
