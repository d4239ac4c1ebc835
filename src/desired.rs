//! Desired routing state built from running containers.

use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::config::TunnelDefaults;
use crate::error::{ConflictError, ConnectionError, ExtractionError};
use crate::labels;
use crate::metrics::{self, SkipReason};
use crate::model::RoutingRule;
use crate::source::{ContainerMetadata, ContainerSource};

/// A container that was skipped while building the desired state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildIssue {
    /// Labels could not be parsed.
    Extraction {
        /// Container name.
        container: String,
        /// What was wrong.
        error: ExtractionError,
    },
    /// Hostname already claimed by an earlier container.
    Conflict(ConflictError),
}

/// Routing rules that should exist, in container discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    rules: Vec<RoutingRule>,
}

impl DesiredState {
    /// Build from containers in discovery order. Per-container problems are
    /// logged and returned alongside the state; they never abort the build.
    pub fn build(
        containers: &[ContainerMetadata],
        defaults: &TunnelDefaults,
    ) -> (DesiredState, Vec<BuildIssue>) {
        let mut rules: Vec<RoutingRule> = Vec::new();
        let mut owners: HashMap<String, &str> = HashMap::new();
        let mut issues = Vec::new();

        for container in containers.iter().filter(|c| c.running) {
            debug!(container = %container.name, "inspecting container");

            let rule = match labels::extract(&container.labels, defaults) {
                Ok(Some(rule)) => rule,
                Ok(None) => continue,
                Err(error) => {
                    warn!(container = %container.name, %error, "skipping container with invalid labels");
                    metrics::record_skipped(SkipReason::Invalid);
                    issues.push(BuildIssue::Extraction {
                        container: container.name.clone(),
                        error,
                    });
                    continue;
                }
            };

            if let Some(winner) = owners.get(&rule.hostname) {
                let conflict = ConflictError {
                    hostname: rule.hostname.clone(),
                    container: container.name.clone(),
                    winner: winner.to_string(),
                };
                warn!(%conflict, "skipping duplicate hostname");
                metrics::record_skipped(SkipReason::Conflict);
                issues.push(BuildIssue::Conflict(conflict));
                continue;
            }

            owners.insert(rule.hostname.clone(), &container.name);
            rules.push(rule);
        }

        (DesiredState { rules }, issues)
    }

    /// List running containers from `source` and build from them.
    pub async fn collect(
        source: &dyn ContainerSource,
        defaults: &TunnelDefaults,
    ) -> Result<(DesiredState, Vec<BuildIssue>), ConnectionError> {
        let containers = source.list_running().await?;
        Ok(Self::build(&containers, defaults))
    }

    /// All rules in discovery order.
    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// No qualifying containers.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules served by one tunnel, in discovery order.
    pub fn rules_for<'a>(&'a self, tunnel_id: &'a str) -> impl Iterator<Item = &'a RoutingRule> + 'a {
        self.rules.iter().filter(move |r| r.tunnel_id == tunnel_id)
    }

    /// Tunnels referenced by at least one rule.
    pub fn tunnel_ids(&self) -> BTreeSet<&str> {
        self.rules.iter().map(|r| r.tunnel_id.as_str()).collect()
    }

    /// Hostnames that need a DNS record.
    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.hostname.as_str())
    }

    /// Whether a hostname is declared (case-insensitive).
    pub fn contains(&self, hostname: &str) -> bool {
        self.rules
            .iter()
            .any(|r| r.hostname.eq_ignore_ascii_case(hostname))
    }
}
