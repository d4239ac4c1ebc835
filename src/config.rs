//! Configuration types for cfd-hostnames.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Prefix for environment overrides, e.g. `CFD_HOSTNAMES__TUNNEL__DEFAULT_SERVICE`.
pub const ENV_PREFIX: &str = "CFD_HOSTNAMES";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cloudflare API access.
    #[serde(default)]
    pub cloudflare: CloudflareConfig,

    /// Defaults applied to container labels.
    #[serde(default)]
    pub tunnel: TunnelDefaults,

    /// Reconciliation timing and policy.
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Cloudflare API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudflareConfig {
    /// Account that owns the tunnels.
    #[serde(default)]
    pub account_id: String,

    /// API token, sent as a bearer credential.
    #[serde(default)]
    pub api_token: String,

    /// API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Bounded exponential backoff for API calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

/// Process-wide fallbacks for container labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelDefaults {
    /// Tunnel used when a container has no tunnel ID label.
    #[serde(default)]
    pub default_tunnel_id: Option<String>,

    /// Service used when a container has no service label.
    #[serde(default)]
    pub default_service: Option<String>,

    /// Set the HTTP host header and origin server name from the hostname.
    #[serde(default)]
    pub auto_http_host_header: bool,
}

/// What happens to hostnames no running container declares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Leave foreign entries alone and never delete DNS records.
    #[default]
    Keep,
    /// Routing list is exactly what containers declare; stale tunnel CNAMEs are deleted.
    Prune,
}

/// Reconciliation timing and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Quiet period after the last container event before a pass, in milliseconds.
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Interval of the unconditional drift-correcting pass, in seconds.
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    /// Orphan hostname handling.
    #[serde(default)]
    pub orphans: OrphanPolicy,

    /// Plan and log, but never mutate remote state.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
            resync_interval_secs: default_resync_interval(),
            orphans: OrphanPolicy::default(),
            dry_run: false,
        }
    }
}

impl ReconcileConfig {
    /// Debounce window.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Periodic resync interval.
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "cfd_hostnames=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,

    /// OpenTelemetry configuration.
    #[serde(default)]
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

/// OpenTelemetry exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317").
    pub endpoint: String,

    /// Service name for traces.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
            opentelemetry: None,
        }
    }
}

impl Default for CloudflareConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            api_token: String::new(),
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

fn default_api_base() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    8000
}

fn default_debounce() -> u64 {
    2000
}

fn default_resync_interval() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "cfd-hostnames".to_string()
}

fn legacy_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.trim().is_empty())
}

impl Config {
    /// Load configuration from an optional TOML file, `CFD_HOSTNAMES__*`
    /// environment variables and the legacy `CLOUDFLARE_*` variables, then
    /// validate it.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("cloudflare.account_id", legacy_env(&["CLOUDFLARE_ACCOUNT_ID"]))?
            .set_override_option(
                "cloudflare.api_token",
                legacy_env(&["CLOUDFLARE_API_TOKEN", "CLOUDFLARE_API_KEY"]),
            )?
            .set_override_option(
                "tunnel.default_tunnel_id",
                legacy_env(&["CLOUDFLARE_TUNNEL_ID"]),
            )?
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check required credentials and reject unusable values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cloudflare.account_id.trim().is_empty() {
            return Err(ConfigError::Missing("cloudflare.account_id"));
        }
        if self.cloudflare.api_token.trim().is_empty() {
            return Err(ConfigError::Missing("cloudflare.api_token"));
        }
        if self.cloudflare.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "cloudflare.request_timeout_secs must be positive".into(),
            ));
        }
        if self.cloudflare.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "cloudflare.retry.max_attempts must be positive".into(),
            ));
        }
        let retry = &self.cloudflare.retry;
        if retry.initial_backoff_ms == 0 {
            return Err(ConfigError::Invalid(
                "cloudflare.retry.initial_backoff_ms must be positive".into(),
            ));
        }
        if retry.max_backoff_ms < retry.initial_backoff_ms {
            return Err(ConfigError::Invalid(
                "cloudflare.retry.max_backoff_ms must not be below initial_backoff_ms".into(),
            ));
        }
        if self.reconcile.debounce_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconcile.debounce_ms must be positive".into(),
            ));
        }
        if self.reconcile.resync_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "reconcile.resync_interval_secs must be positive".into(),
            ));
        }
        if let Some(service) = &self.tunnel.default_service {
            crate::labels::validate_service(service)
                .map_err(|e| ConfigError::Invalid(format!("tunnel.default_service: {e}")))?;
        }
        Ok(())
    }
}
