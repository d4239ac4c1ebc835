//! Reconciliation passes.
//!
//! A pass moves through `Building → Fetching → Diffing → Applying` and back
//! to `Idle`:
//!
//! ```text
//! containers ──▶ DesiredState ─┐
//!                              ├─▶ plan_routing / plan_dns ──▶ mutations
//! tunnel + zone snapshots ─────┘
//! ```
//!
//! Passes never overlap: [`Reconciler::run_pass`] holds an async mutex for
//! its whole duration, and the worker started by [`Reconciler::run`] only
//! starts a pass when a [`PassTrigger`] permit is available. Any number of
//! requests that arrive during a pass collapse into a single rerun.
//!
//! Remote state is fetched fresh on every pass. The only thing carried
//! between passes is the ownership ledger: which hostnames this process has
//! published on which tunnel, so that a hostname whose container went away
//! can be told apart from one somebody else manages.

use futures::future::join_all;
use parking_lot::Mutex as SyncMutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cloudflare::TunnelApi;
use crate::config::{Config, OrphanPolicy, TunnelDefaults};
use crate::desired::DesiredState;
use crate::error::ApiError;
use crate::metrics::{self, MutationKind, MutationResult, Timer, TriggerReason};
use crate::model::{zone_candidates, DnsRecord, IngressRule, TunnelRouting};
use crate::source::ContainerSource;

/// Where a pass currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPhase {
    /// No pass running.
    Idle,
    /// Listing containers and extracting rules.
    Building,
    /// Reading tunnel and DNS state.
    Fetching,
    /// Computing mutations.
    Diffing,
    /// Issuing mutations.
    Applying,
}

impl PassPhase {
    fn gauge(self) -> u8 {
        match self {
            PassPhase::Idle => 0,
            PassPhase::Building => 1,
            PassPhase::Fetching => 2,
            PassPhase::Diffing => 3,
            PassPhase::Applying => 4,
        }
    }
}

/// What a failure affected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureScope {
    /// The container runtime could not be listed.
    Source,
    /// A tunnel's routing could not be read or replaced.
    Tunnel(String),
    /// A hostname's DNS record could not be checked or written.
    Hostname(String),
}

impl fmt::Display for FailureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureScope::Source => write!(f, "container source"),
            FailureScope::Tunnel(id) => write!(f, "tunnel {id}"),
            FailureScope::Hostname(h) => write!(f, "hostname {h}"),
        }
    }
}

/// One failed target in a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassFailure {
    /// Affected target.
    pub scope: FailureScope,
    /// Error description.
    pub error: String,
}

/// Summary of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Rules in the desired state.
    pub rules: usize,
    /// Mutating calls issued (or planned, in dry-run mode).
    pub changes: usize,
    /// Containers skipped for invalid labels or hostname conflicts.
    pub skipped: usize,
    /// Targets that did not converge.
    pub failures: Vec<PassFailure>,
}

impl PassReport {
    /// At least one target failed; the next pass retries it.
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }

    fn fail(&mut self, scope: FailureScope, error: impl ToString) {
        self.failures.push(PassFailure {
            scope,
            error: error.to_string(),
        });
    }
}

/// Settings that shape every pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileSettings {
    /// Label fallbacks.
    pub defaults: TunnelDefaults,
    /// Orphan hostname handling.
    pub orphans: OrphanPolicy,
    /// Plan without mutating.
    pub dry_run: bool,
}

impl From<&Config> for ReconcileSettings {
    fn from(config: &Config) -> Self {
        Self {
            defaults: config.tunnel.clone(),
            orphans: config.reconcile.orphans,
            dry_run: config.reconcile.dry_run,
        }
    }
}

/// Handle used to ask for a pass.
///
/// Requests set a single pending permit; they never run reconciliation
/// themselves.
#[derive(Debug, Clone, Default)]
pub struct PassTrigger {
    notify: Arc<Notify>,
    requests: Arc<AtomicU64>,
}

impl PassTrigger {
    /// Create a trigger with no pending request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a pass.
    pub fn request(&self, reason: TriggerReason) {
        debug!(reason = reason.as_str(), "reconciliation pass requested");
        metrics::record_trigger(reason);
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Total requests made through this trigger and its clones.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Wait for, and consume, the pending request.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Hostnames this process has published, per tunnel, and zones it has touched.
#[derive(Debug, Default)]
struct Ownership {
    hostnames: BTreeMap<String, BTreeSet<String>>,
    zones: BTreeSet<String>,
}

/// DNS state of the zones a pass touches.
#[derive(Debug, Default)]
pub struct ZoneSnapshot {
    /// Zone ID per desired hostname (`None`: no zone in the account).
    pub zone_of: HashMap<String, Result<Option<String>, ApiError>>,
    /// Records per zone ID.
    pub records: BTreeMap<String, Result<Vec<DnsRecord>, ApiError>>,
}

/// A DNS mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsChange {
    /// New CNAME.
    Create {
        /// Zone ID.
        zone_id: String,
        /// Record name.
        hostname: String,
        /// CNAME target.
        target: String,
    },
    /// Repoint an existing CNAME.
    Update {
        /// Zone ID.
        zone_id: String,
        /// Record name.
        hostname: String,
        /// CNAME target.
        target: String,
        /// Record to patch.
        record_id: String,
    },
    /// Remove a stale tunnel CNAME.
    Delete {
        /// Zone ID.
        zone_id: String,
        /// Record name.
        hostname: String,
        /// Record to delete.
        record_id: String,
    },
}

impl DnsChange {
    fn zone_id(&self) -> &str {
        match self {
            DnsChange::Create { zone_id, .. }
            | DnsChange::Update { zone_id, .. }
            | DnsChange::Delete { zone_id, .. } => zone_id,
        }
    }

    fn hostname(&self) -> &str {
        match self {
            DnsChange::Create { hostname, .. }
            | DnsChange::Update { hostname, .. }
            | DnsChange::Delete { hostname, .. } => hostname,
        }
    }

    fn kind(&self) -> MutationKind {
        match self {
            DnsChange::Create { .. } => MutationKind::CreateDns,
            DnsChange::Update { .. } => MutationKind::UpdateDns,
            DnsChange::Delete { .. } => MutationKind::DeleteDns,
        }
    }
}

/// DNS mutations plus hostnames that cannot be converged this pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DnsPlan {
    /// Mutations in desired-state order, deletions last.
    pub changes: Vec<DnsChange>,
    /// Per-hostname failures found while planning.
    pub failures: Vec<PassFailure>,
}

/// Target ingress list for one tunnel.
///
/// Rules the desired state assigns to `tunnel_id` come first, in discovery
/// order, reusing the remote entry verbatim when it already matches. With
/// [`OrphanPolicy::Keep`], remote entries for hostnames nobody declares and
/// this process does not own follow in their remote order. The list always
/// ends in exactly one catch-all: the remote's own if it had one, else
/// `http_status:404`.
pub fn plan_routing(
    tunnel_id: &str,
    desired: &DesiredState,
    remote: &TunnelRouting,
    owned: Option<&BTreeSet<String>>,
    orphans: OrphanPolicy,
) -> TunnelRouting {
    let mut ingress: Vec<IngressRule> = desired
        .rules_for(tunnel_id)
        .map(|rule| {
            remote
                .ingress
                .iter()
                .find(|entry| rule.matches(entry))
                .cloned()
                .unwrap_or_else(|| rule.to_ingress())
        })
        .collect();

    if orphans == OrphanPolicy::Keep {
        let foreign = remote.ingress.iter().filter(|entry| {
            if entry.is_catch_all() {
                return false;
            }
            match (&entry.hostname, &entry.path) {
                (Some(hostname), None) => {
                    let lower = hostname.to_ascii_lowercase();
                    let claimed = desired.contains(&lower);
                    let released = owned.is_some_and(|o| o.contains(&lower));
                    !claimed && !released
                }
                _ => true,
            }
        });
        ingress.extend(foreign.cloned());
    }

    let catch_all = remote
        .ingress
        .last()
        .filter(|entry| entry.is_catch_all())
        .cloned()
        .unwrap_or_else(IngressRule::catch_all);
    ingress.push(catch_all);

    TunnelRouting {
        ingress,
        extra: remote.extra.clone(),
    }
}

/// DNS mutations needed for the desired hostnames.
///
/// With [`OrphanPolicy::Prune`], CNAMEs into any of `managed_tunnels` whose
/// name nobody declares are deleted as well.
pub fn plan_dns(
    desired: &DesiredState,
    zones: &ZoneSnapshot,
    managed_tunnels: &BTreeSet<String>,
    orphans: OrphanPolicy,
) -> DnsPlan {
    let mut plan = DnsPlan::default();

    for rule in desired.rules() {
        let hostname = &rule.hostname;
        let mut fail = |error: String| {
            plan.failures.push(PassFailure {
                scope: FailureScope::Hostname(hostname.clone()),
                error,
            })
        };

        let zone_id = match zones.zone_of.get(hostname) {
            Some(Ok(Some(zone_id))) => zone_id,
            Some(Ok(None)) => {
                fail("no zone in the account contains this hostname".to_string());
                continue;
            }
            Some(Err(e)) => {
                fail(e.to_string());
                continue;
            }
            None => continue,
        };

        let records = match zones.records.get(zone_id) {
            Some(Ok(records)) => records,
            Some(Err(e)) => {
                fail(e.to_string());
                continue;
            }
            None => continue,
        };

        let target = rule.dns_target();
        let existing: Vec<&DnsRecord> = records.iter().filter(|r| r.has_name(hostname)).collect();

        match existing.iter().find(|r| r.is_cname()) {
            Some(record) if record.content.eq_ignore_ascii_case(&target) => {
                debug!(%hostname, %target, "DNS record already exists");
            }
            Some(record) => plan.changes.push(DnsChange::Update {
                zone_id: zone_id.clone(),
                hostname: hostname.clone(),
                target,
                record_id: record.id.clone(),
            }),
            None if existing.is_empty() => plan.changes.push(DnsChange::Create {
                zone_id: zone_id.clone(),
                hostname: hostname.clone(),
                target,
            }),
            None => {
                let types: Vec<&str> = existing.iter().map(|r| r.record_type.as_str()).collect();
                fail(format!(
                    "existing {} record(s) prevent creating a CNAME",
                    types.join("/")
                ));
            }
        }
    }

    if orphans == OrphanPolicy::Prune {
        for (zone_id, records) in &zones.records {
            let Ok(records) = records else { continue };
            for record in records {
                let stale = record
                    .tunnel_id()
                    .is_some_and(|t| managed_tunnels.contains(t))
                    && !desired.contains(&record.name);
                if stale {
                    plan.changes.push(DnsChange::Delete {
                        zone_id: zone_id.clone(),
                        hostname: record.name.to_ascii_lowercase(),
                        record_id: record.id.clone(),
                    });
                }
            }
        }
    }

    plan
}

/// Outcome of syncing one tunnel's routing.
struct TunnelOutcome {
    tunnel_id: String,
    /// Remote now matches the target (or already did).
    converged: bool,
}

/// Drives reconciliation passes.
pub struct Reconciler {
    source: Arc<dyn ContainerSource>,
    api: Arc<dyn TunnelApi>,
    settings: ReconcileSettings,
    gate: Mutex<Ownership>,
    phase: SyncMutex<PassPhase>,
}

impl Reconciler {
    /// Create a reconciler.
    pub fn new(
        source: Arc<dyn ContainerSource>,
        api: Arc<dyn TunnelApi>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            source,
            api,
            settings,
            gate: Mutex::new(Ownership::default()),
            phase: SyncMutex::new(PassPhase::Idle),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> PassPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: PassPhase) {
        *self.phase.lock() = phase;
        metrics::record_phase(phase.gauge());
    }

    /// Run passes whenever `trigger` has a pending request, until cancelled.
    ///
    /// Cancellation is observed between passes.
    pub async fn run(self: Arc<Self>, trigger: PassTrigger, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Reconciler shutting down");
                    return;
                }

                _ = trigger.wait() => {}
            }

            self.run_pass().await;
        }
    }

    /// Run one full pass. Waits for any pass already in progress.
    pub async fn run_pass(&self) -> PassReport {
        let mut ownership = self.gate.lock().await;
        let timer = Timer::start();
        let mut report = PassReport::default();
        let orphans = self.settings.orphans;

        self.set_phase(PassPhase::Building);
        let desired =
            match DesiredState::collect(self.source.as_ref(), &self.settings.defaults).await {
                Ok((desired, issues)) => {
                    report.skipped = issues.len();
                    desired
                }
                Err(e) => {
                    error!(error = %e, "Failed to list running containers");
                    report.fail(FailureScope::Source, e);
                    self.finish(&report, &timer);
                    return report;
                }
            };
        report.rules = desired.len();
        metrics::record_desired_rules(desired.len());

        let mut tunnels: BTreeSet<String> = desired
            .tunnel_ids()
            .into_iter()
            .map(str::to_string)
            .collect();
        tunnels.extend(self.settings.defaults.default_tunnel_id.iter().cloned());
        tunnels.extend(ownership.hostnames.keys().cloned());

        self.set_phase(PassPhase::Fetching);
        let (remote_routing, zones) = tokio::join!(
            self.fetch_routing(&tunnels),
            self.fetch_zones(&desired, &ownership)
        );

        self.set_phase(PassPhase::Diffing);
        let mut replacements = Vec::new();
        let mut outcomes = Vec::new();
        for (tunnel_id, fetched) in remote_routing {
            match fetched {
                Ok(remote) => {
                    let target = plan_routing(
                        &tunnel_id,
                        &desired,
                        &remote,
                        ownership.hostnames.get(&tunnel_id),
                        orphans,
                    );
                    if target == remote {
                        debug!(%tunnel_id, "Tunnel ingress up to date");
                        outcomes.push(TunnelOutcome {
                            tunnel_id,
                            converged: true,
                        });
                    } else {
                        replacements.push((tunnel_id, target));
                    }
                }
                Err(e) => {
                    error!(%tunnel_id, error = %e, "Failed to fetch tunnel ingress");
                    report.fail(FailureScope::Tunnel(tunnel_id.clone()), e);
                    outcomes.push(TunnelOutcome {
                        tunnel_id,
                        converged: false,
                    });
                }
            }
        }
        let dns_plan = plan_dns(&desired, &zones, &tunnels, orphans);
        report.failures.extend(dns_plan.failures.iter().cloned());
        for failure in &dns_plan.failures {
            warn!(scope = %failure.scope, error = %failure.error, "Cannot converge DNS record");
        }

        self.set_phase(PassPhase::Applying);
        let (routing_results, dns_results) = tokio::join!(
            self.apply_routing(replacements),
            self.apply_dns(dns_plan.changes)
        );

        for (tunnel_id, result) in routing_results {
            let converged = match result {
                Ok(()) => {
                    report.changes += 1;
                    !self.settings.dry_run
                }
                Err(e) => {
                    report.fail(FailureScope::Tunnel(tunnel_id.clone()), e);
                    false
                }
            };
            outcomes.push(TunnelOutcome {
                tunnel_id,
                converged,
            });
        }

        for (hostname, result) in dns_results {
            match result {
                Ok(()) => report.changes += 1,
                Err(e) => report.fail(FailureScope::Hostname(hostname), e),
            }
        }

        Self::record_ownership(&mut ownership, &desired, &zones, outcomes);

        self.finish(&report, &timer);
        report
    }

    fn finish(&self, report: &PassReport, timer: &Timer) {
        self.set_phase(PassPhase::Idle);
        metrics::record_pass(report.is_degraded(), timer.elapsed());

        if report.is_degraded() {
            warn!(
                rules = report.rules,
                changes = report.changes,
                failures = report.failures.len(),
                "Reconciliation pass degraded, failed targets retry on the next pass"
            );
        } else if report.changes > 0 {
            info!(
                rules = report.rules,
                changes = report.changes,
                skipped = report.skipped,
                "Reconciliation pass complete"
            );
        } else {
            debug!(rules = report.rules, skipped = report.skipped, "Reconciliation pass found no changes");
        }
    }

    async fn fetch_routing(
        &self,
        tunnels: &BTreeSet<String>,
    ) -> Vec<(String, Result<TunnelRouting, ApiError>)> {
        join_all(tunnels.iter().map(|tunnel_id| async move {
            (tunnel_id.clone(), self.api.fetch_routing(tunnel_id).await)
        }))
        .await
    }

    async fn fetch_zones(&self, desired: &DesiredState, ownership: &Ownership) -> ZoneSnapshot {
        let zone_of: HashMap<_, _> = join_all(desired.hostnames().map(|hostname| async move {
            (hostname.to_string(), self.lookup_zone(hostname).await)
        }))
        .await
        .into_iter()
        .collect();

        let mut zone_ids: BTreeSet<String> = zone_of
            .values()
            .filter_map(|z| z.as_ref().ok().cloned().flatten())
            .collect();
        if self.settings.orphans == OrphanPolicy::Prune {
            zone_ids.extend(ownership.zones.iter().cloned());
        }

        let records = join_all(zone_ids.into_iter().map(|zone_id| async move {
            let records = self.api.fetch_dns(&zone_id).await;
            if let Err(e) = &records {
                error!(%zone_id, error = %e, "Failed to fetch DNS records");
            }
            (zone_id, records)
        }))
        .await
        .into_iter()
        .collect();

        ZoneSnapshot { zone_of, records }
    }

    /// Find the zone for a hostname by trying its suffixes, shortest first.
    async fn lookup_zone(&self, hostname: &str) -> Result<Option<String>, ApiError> {
        for candidate in zone_candidates(hostname) {
            if let Some(zone_id) = self.api.find_zone(&candidate).await? {
                return Ok(Some(zone_id));
            }
        }
        Ok(None)
    }

    /// Replace routing on each tunnel. Tunnels run concurrently.
    async fn apply_routing(
        &self,
        replacements: Vec<(String, TunnelRouting)>,
    ) -> Vec<(String, Result<(), ApiError>)> {
        join_all(replacements.into_iter().map(|(tunnel_id, target)| async move {
            let hostnames: Vec<&str> = target
                .ingress
                .iter()
                .filter_map(|r| r.hostname.as_deref())
                .collect();
            info!(%tunnel_id, rules = target.ingress.len(), ?hostnames, "Updating tunnel ingress");

            if self.settings.dry_run {
                info!(%tunnel_id, "Dry run: tunnel ingress not updated");
                metrics::record_mutation(MutationKind::ReplaceRouting, MutationResult::DryRun);
                return (tunnel_id, Ok(()));
            }

            let result = self.api.replace_routing(&tunnel_id, &target).await;
            match &result {
                Ok(()) => metrics::record_mutation(MutationKind::ReplaceRouting, MutationResult::Ok),
                Err(e) => {
                    error!(%tunnel_id, error = %e, "Failed to update tunnel ingress");
                    metrics::record_mutation(MutationKind::ReplaceRouting, MutationResult::Error);
                }
            }
            (tunnel_id, result)
        }))
        .await
    }

    /// Apply DNS changes. Zones run concurrently, changes within a zone in order.
    async fn apply_dns(&self, changes: Vec<DnsChange>) -> Vec<(String, Result<(), ApiError>)> {
        let mut by_zone: BTreeMap<String, Vec<DnsChange>> = BTreeMap::new();
        for change in changes {
            by_zone
                .entry(change.zone_id().to_string())
                .or_default()
                .push(change);
        }

        join_all(by_zone.into_values().map(|changes| async move {
            let mut results = Vec::with_capacity(changes.len());
            for change in changes {
                let result = self.apply_dns_change(&change).await;
                results.push((change.hostname().to_string(), result));
            }
            results
        }))
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    async fn apply_dns_change(&self, change: &DnsChange) -> Result<(), ApiError> {
        match change {
            DnsChange::Create { hostname, target, .. } | DnsChange::Update { hostname, target, .. } => {
                info!(%hostname, %target, "Adding CNAME DNS record");
            }
            DnsChange::Delete { hostname, .. } => {
                info!(%hostname, "Removing stale tunnel DNS record");
            }
        }

        if self.settings.dry_run {
            info!(hostname = change.hostname(), "Dry run: DNS record not changed");
            metrics::record_mutation(change.kind(), MutationResult::DryRun);
            return Ok(());
        }

        let result = match change {
            DnsChange::Create {
                zone_id,
                hostname,
                target,
            } => self.api.upsert_dns_record(zone_id, hostname, target, None).await,
            DnsChange::Update {
                zone_id,
                hostname,
                target,
                record_id,
            } => {
                self.api
                    .upsert_dns_record(zone_id, hostname, target, Some(record_id))
                    .await
            }
            DnsChange::Delete {
                zone_id, record_id, ..
            } => self.api.delete_dns_record(zone_id, record_id).await,
        };

        match &result {
            Ok(()) => metrics::record_mutation(change.kind(), MutationResult::Ok),
            Err(e) => {
                error!(hostname = change.hostname(), error = %e, "Failed to change DNS record");
                metrics::record_mutation(change.kind(), MutationResult::Error);
            }
        }
        result
    }

    /// Update the ledger: converged tunnels own exactly their desired
    /// hostnames; the rest keep what they owned plus what they should own.
    fn record_ownership(
        ownership: &mut Ownership,
        desired: &DesiredState,
        zones: &ZoneSnapshot,
        outcomes: Vec<TunnelOutcome>,
    ) {
        for outcome in outcomes {
            let wanted = desired
                .rules_for(&outcome.tunnel_id)
                .map(|r| r.hostname.clone());
            let owned = ownership
                .hostnames
                .entry(outcome.tunnel_id.clone())
                .or_default();
            if outcome.converged {
                owned.clear();
            }
            owned.extend(wanted);
            if owned.is_empty() {
                ownership.hostnames.remove(&outcome.tunnel_id);
            }
        }

        ownership.zones.extend(
            zones
                .zone_of
                .values()
                .filter_map(|z| z.as_ref().ok().cloned().flatten()),
        );
    }
}
