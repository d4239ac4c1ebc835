//! Read-only view of the container runtime.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;

use crate::error::ConnectionError;

/// A container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMetadata {
    /// Runtime container ID.
    pub id: String,
    /// Human readable name, used in logs.
    pub name: String,
    /// Container labels.
    pub labels: HashMap<String, String>,
    /// Whether the container is running.
    pub running: bool,
}

/// Lifecycle action carried by a container event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerAction {
    /// Container started.
    Start,
    /// Container stopped.
    Stop,
    /// Container process exited.
    Die,
    /// Health check status changed.
    HealthChange,
    /// Anything else (create, attach, exec_*, ...).
    Other(String),
}

impl ContainerAction {
    /// Parse a runtime action string.
    pub fn parse(action: &str) -> Self {
        match action {
            "start" => ContainerAction::Start,
            "stop" => ContainerAction::Stop,
            "die" => ContainerAction::Die,
            a if a.starts_with("health_status") => ContainerAction::HealthChange,
            other => ContainerAction::Other(other.to_string()),
        }
    }

    /// Whether the action can change the set of running containers.
    pub fn is_relevant(&self) -> bool {
        !matches!(self, ContainerAction::Other(_))
    }

    /// Short label for logs and metrics.
    pub fn as_str(&self) -> &str {
        match self {
            ContainerAction::Start => "start",
            ContainerAction::Stop => "stop",
            ContainerAction::Die => "die",
            ContainerAction::HealthChange => "health_status",
            ContainerAction::Other(other) => other,
        }
    }
}

/// A container lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    /// Container the event is about.
    pub container_id: String,
    /// What happened.
    pub action: ContainerAction,
}

/// Stream of lifecycle events. Ends (or yields an error) on disconnect and
/// cannot be resumed; subscribe again instead.
pub type EventStream = BoxStream<'static, Result<ContainerEvent, ConnectionError>>;

/// Source of container metadata and lifecycle events.
#[async_trait]
pub trait ContainerSource: Send + Sync {
    /// Running containers in discovery order.
    async fn list_running(&self) -> Result<Vec<ContainerMetadata>, ConnectionError>;

    /// Subscribe to container lifecycle events.
    async fn subscribe(&self) -> Result<EventStream, ConnectionError>;
}
