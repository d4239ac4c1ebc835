//! Metrics instrumentation for cfd-hostnames.
//!
//! All metrics are prefixed with `cfd_hostnames.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Why a pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// Daemon startup.
    Startup,
    /// Debounced burst of container events.
    Event,
    /// Periodic drift correction.
    Periodic,
    /// Container event stream reconnected.
    Reconnect,
}

impl TriggerReason {
    /// Label value.
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerReason::Startup => "startup",
            TriggerReason::Event => "event",
            TriggerReason::Periodic => "periodic",
            TriggerReason::Reconnect => "reconnect",
        }
    }
}

/// Record a pass request.
pub fn record_trigger(reason: TriggerReason) {
    counter!("cfd_hostnames.reconcile.trigger.count", "reason" => reason.as_str()).increment(1);
}

/// Record a finished reconciliation pass.
pub fn record_pass(degraded: bool, duration: std::time::Duration) {
    let outcome = if degraded { "degraded" } else { "clean" };
    counter!("cfd_hostnames.reconcile.pass.count", "outcome" => outcome).increment(1);
    histogram!("cfd_hostnames.reconcile.pass.duration.seconds").record(duration.as_secs_f64());
}

/// Record the current pass phase.
pub fn record_phase(phase: u8) {
    gauge!("cfd_hostnames.reconcile.phase").set(f64::from(phase));
}

/// Kinds of mutating API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// Full ingress replacement.
    ReplaceRouting,
    /// New DNS record.
    CreateDns,
    /// Repointed DNS record.
    UpdateDns,
    /// Removed DNS record.
    DeleteDns,
}

/// Outcome of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationResult {
    /// Applied.
    Ok,
    /// Failed after retries.
    Error,
    /// Planned only (dry run).
    DryRun,
}

/// Record a mutation.
pub fn record_mutation(kind: MutationKind, result: MutationResult) {
    let kind_str = match kind {
        MutationKind::ReplaceRouting => "replace_routing",
        MutationKind::CreateDns => "create_dns",
        MutationKind::UpdateDns => "update_dns",
        MutationKind::DeleteDns => "delete_dns",
    };
    let result_str = match result {
        MutationResult::Ok => "ok",
        MutationResult::Error => "error",
        MutationResult::DryRun => "dry_run",
    };

    counter!("cfd_hostnames.reconcile.mutation.count", "kind" => kind_str, "result" => result_str)
        .increment(1);
}

/// Why a container was left out of the desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Malformed labels.
    Invalid,
    /// Hostname already claimed.
    Conflict,
}

/// Record a skipped container.
pub fn record_skipped(reason: SkipReason) {
    let reason_str = match reason {
        SkipReason::Invalid => "invalid",
        SkipReason::Conflict => "conflict",
    };
    counter!("cfd_hostnames.desired.skipped.count", "reason" => reason_str).increment(1);
}

/// Record the size of the desired state.
pub fn record_desired_rules(rules: usize) {
    gauge!("cfd_hostnames.desired.rules").set(rules as f64);
}

/// Record an API request outcome.
pub fn record_api_request(op: &'static str, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!("cfd_hostnames.api.request.count", "op" => op, "result" => result).increment(1);
}

/// Record an API retry.
pub fn record_api_retry(op: &'static str) {
    counter!("cfd_hostnames.api.retry.count", "op" => op).increment(1);
}

/// Record a container event seen by the watcher.
pub fn record_event(action: &str) {
    counter!("cfd_hostnames.watcher.event.count", "action" => action.to_string()).increment(1);
}

/// Record an event stream (re)connect.
pub fn record_watcher_reconnect(reason: ReconnectReason) {
    let reason_str = match reason {
        ReconnectReason::StreamEnded => "stream_ended",
        ReconnectReason::Error => "error",
        ReconnectReason::InitialConnect => "initial_connect",
    };

    counter!("cfd_hostnames.watcher.reconnect.count", "reason" => reason_str).increment(1);
}

/// Reconnect reasons.
#[derive(Debug, Clone, Copy)]
pub enum ReconnectReason {
    /// Event stream ended.
    StreamEnded,
    /// Subscribe or stream error.
    Error,
    /// First connection to the runtime.
    InitialConnect,
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
