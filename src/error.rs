//! Error types for cfd-hostnames.

use thiserror::Error;

/// A container's labels could not be turned into a routing rule.
///
/// Scoped to one container: the container is skipped and reported, the
/// pass carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    /// Hostname declared but no service label and no default service.
    #[error("no service for hostname \"{hostname}\" and no default service configured")]
    MissingService {
        /// Hostname that was declared.
        hostname: String,
    },

    /// No tunnel ID label and no default tunnel ID.
    #[error("no tunnel id for hostname \"{hostname}\" and no default tunnel configured")]
    MissingTunnelId {
        /// Hostname that was declared.
        hostname: String,
    },

    /// A label value could not be parsed.
    #[error("invalid value \"{value}\" for label {key}: {reason}")]
    InvalidAttribute {
        /// Label key.
        key: &'static str,
        /// Offending value as written.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Two running containers declared the same hostname.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("hostname \"{hostname}\" declared by {container} is already claimed by {winner}")]
pub struct ConflictError {
    /// The contested hostname.
    pub hostname: String,
    /// The container whose rule was rejected.
    pub container: String,
    /// The container discovered first, which keeps the hostname.
    pub winner: String,
}

/// Failure of a single tunnel/DNS API call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Rate limit, server error, timeout or network failure. Worth retrying.
    #[error("{op}: transient failure: {reason}")]
    Transient {
        /// API operation name.
        op: &'static str,
        /// Failure description.
        reason: String,
    },

    /// Rejected by the API. Retrying the same request will not help.
    #[error("{op}: request rejected{}: {reason}", status_suffix(.status))]
    Permanent {
        /// API operation name.
        op: &'static str,
        /// HTTP status, when the failure came from a response.
        status: Option<u16>,
        /// Failure description.
        reason: String,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl ApiError {
    /// Whether the call may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient { .. })
    }

    /// Name of the operation that failed.
    pub fn op(&self) -> &'static str {
        match self {
            ApiError::Transient { op, .. } | ApiError::Permanent { op, .. } => op,
        }
    }
}

/// Lost or failed connection to the container runtime.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Docker Engine API error.
    #[error("container runtime error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// The event stream terminated.
    #[error("container event stream ended")]
    StreamEnded,

    /// Runtime is unreachable for another reason.
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
}

/// Invalid or incomplete process configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting is absent or empty.
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    /// Configuration sources could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A setting has an unusable value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that stop the daemon.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Container runtime could not be reached.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// HTTP client construction failed.
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),
}
