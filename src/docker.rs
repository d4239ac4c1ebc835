//! Docker Engine container source.

use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerSummary, EventMessage};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::ConnectionError;
use crate::source::{
    ContainerAction, ContainerEvent, ContainerMetadata, ContainerSource, EventStream,
};

/// Lifecycle actions the event subscription asks the daemon for.
const WATCHED_ACTIONS: &[&str] = &["start", "stop", "die", "health_status"];

/// [`ContainerSource`] backed by the local Docker Engine API.
#[derive(Clone)]
pub struct DockerSource {
    docker: Docker,
}

impl DockerSource {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self, ConnectionError> {
        let docker = Docker::connect_with_local_defaults()?;
        info!("Using local Docker Engine");
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerSource for DockerSource {
    async fn list_running(&self) -> Result<Vec<ContainerMetadata>, ConnectionError> {
        let options = ListContainersOptions::<String> {
            all: false,
            filters: HashMap::from([("status".to_string(), vec!["running".to_string()])]),
            ..Default::default()
        };
        let mut summaries = self.docker.list_containers(Some(options)).await?;

        summaries.sort_by(|a, b| {
            a.created
                .unwrap_or_default()
                .cmp(&b.created.unwrap_or_default())
                .then_with(|| a.id.cmp(&b.id))
        });

        let containers: Vec<ContainerMetadata> =
            summaries.into_iter().filter_map(to_metadata).collect();
        debug!(count = containers.len(), "listed running containers");
        Ok(containers)
    }

    async fn subscribe(&self) -> Result<EventStream, ConnectionError> {
        self.docker.ping().await?;

        let options = EventsOptions::<String> {
            filters: HashMap::from([
                ("type".to_string(), vec!["container".to_string()]),
                (
                    "event".to_string(),
                    WATCHED_ACTIONS.iter().map(|a| a.to_string()).collect(),
                ),
            ]),
            ..Default::default()
        };

        let stream = self
            .docker
            .events(Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(message) => to_event(message).map(Ok),
                    Err(e) => Some(Err(ConnectionError::Docker(e))),
                }
            })
            .boxed();
        Ok(stream)
    }
}

fn to_metadata(summary: ContainerSummary) -> Option<ContainerMetadata> {
    let id = summary.id?;
    let name = summary
        .names
        .as_deref()
        .and_then(|names| names.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.chars().take(12).collect());
    let running = summary.state.as_deref().map_or(true, |s| s == "running");

    Some(ContainerMetadata {
        id,
        name,
        labels: summary.labels.unwrap_or_default(),
        running,
    })
}

fn to_event(message: EventMessage) -> Option<ContainerEvent> {
    let container_id = message.actor.and_then(|actor| actor.id)?;
    let action = ContainerAction::parse(message.action.as_deref()?);
    Some(ContainerEvent {
        container_id,
        action,
    })
}
