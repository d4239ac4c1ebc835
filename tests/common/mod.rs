//! Shared test infrastructure for reconciliation and watcher integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use tokio::sync::Notify;

use cfd_hostnames::cloudflare::TunnelApi;
use cfd_hostnames::config::{OrphanPolicy, TunnelDefaults};
use cfd_hostnames::error::{ApiError, ConnectionError};
use cfd_hostnames::labels;
use cfd_hostnames::model::{DnsRecord, IngressRule, TunnelRouting};
use cfd_hostnames::reconciler::{ReconcileSettings, Reconciler};
use cfd_hostnames::source::{
    ContainerAction, ContainerEvent, ContainerMetadata, ContainerSource, EventStream,
};

// --- Constants ---

pub const TUNNEL: &str = "tunnel-a";
pub const OTHER_TUNNEL: &str = "tunnel-b";
pub const ZONE: &str = "example.com";
pub const ZONE_ID: &str = "zone-1";

pub type EventSender = UnboundedSender<Result<ContainerEvent, ConnectionError>>;

// --- FakeSource ---

/// In-memory container runtime. Containers are listed in insertion order.
#[derive(Default)]
pub struct FakeSource {
    containers: Mutex<Vec<ContainerMetadata>>,
    streams: Mutex<VecDeque<UnboundedReceiver<Result<ContainerEvent, ConnectionError>>>>,
    unavailable: AtomicBool,
    subscribes: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a container whose ID and name are both `name`.
    pub fn start(&self, name: &str, labels: &[(&str, &str)]) {
        self.containers.lock().unwrap().push(ContainerMetadata {
            id: name.to_string(),
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            running: true,
        });
    }

    /// Start a container serving `hostname` on the default tunnel.
    pub fn start_web(&self, name: &str, hostname: &str) {
        let service = format!("http://{name}:80");
        self.start(
            name,
            &[(labels::HOSTNAME, hostname), (labels::SERVICE, &service)],
        );
    }

    pub fn stop(&self, name: &str) {
        self.containers.lock().unwrap().retain(|c| c.name != name);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Queue an event stream for the next subscribe call.
    pub fn push_stream(&self) -> EventSender {
        let (tx, rx) = unbounded();
        self.streams.lock().unwrap().push_back(rx);
        tx
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerSource for FakeSource {
    async fn list_running(&self) -> Result<Vec<ContainerMetadata>, ConnectionError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ConnectionError::Unavailable("runtime is down".into()));
        }
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn subscribe(&self) -> Result<EventStream, ConnectionError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        match self.streams.lock().unwrap().pop_front() {
            Some(rx) => Ok(rx.boxed()),
            None => Err(ConnectionError::Unavailable("no event stream".into())),
        }
    }
}

/// Build a container event.
pub fn event(container: &str, action: &str) -> Result<ContainerEvent, ConnectionError> {
    Ok(ContainerEvent {
        container_id: container.to_string(),
        action: ContainerAction::parse(action),
    })
}

// --- FakeTunnelApi ---

/// A call made against [`FakeTunnelApi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    FetchRouting(String),
    ReplaceRouting(String),
    FindZone(String),
    FetchDns(String),
    UpsertDns { hostname: String, update: bool },
    DeleteDns(String),
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Call::ReplaceRouting(_) | Call::UpsertDns { .. } | Call::DeleteDns(_)
        )
    }
}

#[derive(Default)]
struct ApiState {
    routing: HashMap<String, TunnelRouting>,
    zones: HashMap<String, String>,
    records: HashMap<String, Vec<DnsRecord>>,
    calls: Vec<Call>,
    failing_hostnames: HashSet<String>,
    failing_tunnels: HashSet<String>,
    next_record: u64,
}

/// In-memory tunnel and DNS API.
///
/// Tunnels without stored routing read as the default catch-all list.
pub struct FakeTunnelApi {
    state: Mutex<ApiState>,
    fetch_gate: Mutex<Option<Arc<Notify>>>,
    fetches_in_flight: AtomicUsize,
    max_fetches_in_flight: AtomicUsize,
}

impl FakeTunnelApi {
    /// API with one zone, `example.com`.
    pub fn new() -> Arc<Self> {
        let api = Self {
            state: Mutex::new(ApiState::default()),
            fetch_gate: Mutex::new(None),
            fetches_in_flight: AtomicUsize::new(0),
            max_fetches_in_flight: AtomicUsize::new(0),
        };
        api.add_zone(ZONE, ZONE_ID);
        Arc::new(api)
    }

    pub fn add_zone(&self, name: &str, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.zones.insert(name.to_string(), id.to_string());
        state.records.entry(id.to_string()).or_default();
    }

    pub fn set_routing(&self, tunnel_id: &str, ingress: Vec<IngressRule>) {
        self.state
            .lock()
            .unwrap()
            .routing
            .insert(tunnel_id.to_string(), TunnelRouting::new(ingress));
    }

    pub fn routing(&self, tunnel_id: &str) -> TunnelRouting {
        self.state
            .lock()
            .unwrap()
            .routing
            .get(tunnel_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Hostnames of a tunnel's ingress rules, `None` for the catch-all.
    pub fn hostnames(&self, tunnel_id: &str) -> Vec<Option<String>> {
        self.routing(tunnel_id)
            .ingress
            .into_iter()
            .map(|r| r.hostname)
            .collect()
    }

    pub fn add_record(&self, zone_id: &str, name: &str, record_type: &str, content: &str) {
        let mut state = self.state.lock().unwrap();
        state.next_record += 1;
        let id = format!("seed-{}", state.next_record);
        state
            .records
            .entry(zone_id.to_string())
            .or_default()
            .push(DnsRecord {
                id,
                name: name.to_string(),
                record_type: record_type.to_string(),
                content: content.to_string(),
                proxied: Some(true),
            });
    }

    pub fn records(&self, zone_id: &str) -> Vec<DnsRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(zone_id)
            .cloned()
            .unwrap_or_default()
    }

    /// CNAME content for a hostname, if a CNAME exists.
    pub fn cname(&self, hostname: &str) -> Option<String> {
        self.records(ZONE_ID)
            .into_iter()
            .find(|r| r.name == hostname && r.record_type == "CNAME")
            .map(|r| r.content)
    }

    pub fn fail_hostname(&self, hostname: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_hostnames
            .insert(hostname.to_string());
    }

    pub fn fail_tunnel(&self, tunnel_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_tunnels
            .insert(tunnel_id.to_string());
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing_hostnames.clear();
        state.failing_tunnels.clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Park every `fetch_routing` call until [`release_fetches`](Self::release_fetches).
    pub fn hold_fetches(&self) {
        *self.fetch_gate.lock().unwrap() = Some(Arc::new(Notify::new()));
    }

    /// Wake parked fetches and stop parking new ones.
    pub fn release_fetches(&self) {
        if let Some(gate) = self.fetch_gate.lock().unwrap().take() {
            gate.notify_waiters();
        }
    }

    pub fn fetches_in_flight(&self) -> usize {
        self.fetches_in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of `fetch_routing` calls that were running at once.
    pub fn max_fetches_in_flight(&self) -> usize {
        self.max_fetches_in_flight.load(Ordering::SeqCst)
    }

    pub fn routing_fetches(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::FetchRouting(_)))
            .count()
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

fn rejected(op: &'static str) -> ApiError {
    ApiError::Permanent {
        op,
        status: Some(400),
        reason: "injected failure".into(),
    }
}

#[async_trait]
impl TunnelApi for FakeTunnelApi {
    async fn fetch_routing(&self, tunnel_id: &str) -> Result<TunnelRouting, ApiError> {
        self.record(Call::FetchRouting(tunnel_id.to_string()));
        let running = self.fetches_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_fetches_in_flight.fetch_max(running, Ordering::SeqCst);

        let gate = self.fetch_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.fetches_in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(self.routing(tunnel_id))
    }

    async fn replace_routing(
        &self,
        tunnel_id: &str,
        routing: &TunnelRouting,
    ) -> Result<(), ApiError> {
        self.record(Call::ReplaceRouting(tunnel_id.to_string()));
        let mut state = self.state.lock().unwrap();
        if state.failing_tunnels.contains(tunnel_id) {
            return Err(rejected("replace_routing"));
        }
        state
            .routing
            .insert(tunnel_id.to_string(), routing.clone());
        Ok(())
    }

    async fn find_zone(&self, zone_name: &str) -> Result<Option<String>, ApiError> {
        self.record(Call::FindZone(zone_name.to_string()));
        Ok(self.state.lock().unwrap().zones.get(zone_name).cloned())
    }

    async fn fetch_dns(&self, zone_id: &str) -> Result<Vec<DnsRecord>, ApiError> {
        self.record(Call::FetchDns(zone_id.to_string()));
        Ok(self.records(zone_id))
    }

    async fn upsert_dns_record(
        &self,
        zone_id: &str,
        hostname: &str,
        target: &str,
        existing: Option<&str>,
    ) -> Result<(), ApiError> {
        self.record(Call::UpsertDns {
            hostname: hostname.to_string(),
            update: existing.is_some(),
        });
        let mut state = self.state.lock().unwrap();
        if state.failing_hostnames.contains(hostname) {
            return Err(rejected("upsert_dns_record"));
        }

        state.next_record += 1;
        let new_id = format!("rec-{}", state.next_record);
        let records = state.records.entry(zone_id.to_string()).or_default();
        match existing.and_then(|id| records.iter_mut().find(|r| r.id == id)) {
            Some(record) => record.content = target.to_string(),
            None => records.push(DnsRecord {
                id: new_id,
                name: hostname.to_string(),
                record_type: "CNAME".to_string(),
                content: target.to_string(),
                proxied: Some(true),
            }),
        }
        Ok(())
    }

    async fn delete_dns_record(&self, zone_id: &str, record_id: &str) -> Result<(), ApiError> {
        self.record(Call::DeleteDns(record_id.to_string()));
        if let Some(records) = self.state.lock().unwrap().records.get_mut(zone_id) {
            records.retain(|r| r.id != record_id);
        }
        Ok(())
    }
}

// --- Builders ---

pub fn settings(orphans: OrphanPolicy) -> ReconcileSettings {
    ReconcileSettings {
        defaults: TunnelDefaults {
            default_tunnel_id: Some(TUNNEL.to_string()),
            ..Default::default()
        },
        orphans,
        dry_run: false,
    }
}

pub fn reconciler(
    source: &Arc<FakeSource>,
    api: &Arc<FakeTunnelApi>,
    settings: ReconcileSettings,
) -> Reconciler {
    Reconciler::new(source.clone(), api.clone(), settings)
}

/// Ingress entry for a hostname with no origin options.
pub fn ingress(hostname: &str, service: &str) -> IngressRule {
    IngressRule {
        hostname: Some(hostname.to_string()),
        path: None,
        service: service.to_string(),
        origin_request: Default::default(),
    }
}

pub fn tunnel_target(tunnel_id: &str) -> String {
    format!("{tunnel_id}.cfargotunnel.com")
}

/// Assert the tunnel's ingress hostnames, `None` standing for the catch-all.
pub fn assert_hostnames(api: &FakeTunnelApi, tunnel_id: &str, expected: &[Option<&str>]) {
    let actual = api.hostnames(tunnel_id);
    let expected: Vec<Option<String>> = expected.iter().map(|h| h.map(String::from)).collect();
    assert_eq!(
        actual, expected,
        "ingress mismatch for {tunnel_id}.\nactual:   {:?}\nexpected: {:?}",
        actual, expected
    );
}
