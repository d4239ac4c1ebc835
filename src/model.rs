//! Routing rules and the remote representations they are reconciled against.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Service of the synthesized trailing catch-all rule.
pub const CATCH_ALL_SERVICE: &str = "http_status:404";

/// Suffix of a tunnel's canonical DNS name.
pub const TUNNEL_DNS_SUFFIX: &str = "cfargotunnel.com";

/// DNS record type written for tunnel hostnames.
pub const CNAME: &str = "CNAME";

/// One hostname → local service mapping derived from a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    /// Public hostname, lower case.
    pub hostname: String,
    /// Origin service URI exactly as declared.
    pub service: String,
    /// Tunnel that serves the hostname.
    pub tunnel_id: String,
    /// Verify the origin's TLS certificate.
    pub origin_tls_verify: bool,
    /// Host header sent to the origin.
    pub http_host_header: Option<String>,
    /// SNI/certificate name expected from the origin.
    pub origin_server_name: Option<String>,
}

impl RoutingRule {
    /// Ingress entry for this rule.
    pub fn to_ingress(&self) -> IngressRule {
        IngressRule {
            hostname: Some(self.hostname.clone()),
            path: None,
            service: self.service.clone(),
            origin_request: OriginRequest {
                no_tls_verify: (!self.origin_tls_verify).then_some(true),
                http_host_header: self.http_host_header.clone(),
                origin_server_name: self.origin_server_name.clone(),
                extra: Map::new(),
            },
        }
    }

    /// Whether a remote ingress entry already expresses this rule.
    ///
    /// Options this system does not manage are ignored, so an entry the
    /// API decorated with extra fields still counts as a match.
    pub fn matches(&self, ingress: &IngressRule) -> bool {
        ingress.has_hostname(&self.hostname)
            && ingress.path.is_none()
            && ingress.service == self.service
            && ingress.origin_request.no_tls_verify.unwrap_or(false) == !self.origin_tls_verify
            && ingress.origin_request.http_host_header == self.http_host_header
            && ingress.origin_request.origin_server_name == self.origin_server_name
    }

    /// Canonical CNAME target for this rule's tunnel.
    pub fn dns_target(&self) -> String {
        tunnel_dns_target(&self.tunnel_id)
    }
}

/// `<tunnel_id>.cfargotunnel.com`
pub fn tunnel_dns_target(tunnel_id: &str) -> String {
    format!("{tunnel_id}.{TUNNEL_DNS_SUFFIX}")
}

/// Zone name of a hostname: its last two labels.
///
/// Returns `None` for single-label names.
pub fn zone_name(hostname: &str) -> Option<String> {
    let labels: Vec<&str> = hostname.split('.').collect();
    if labels.len() < 2 {
        return None;
    }
    Some(labels[labels.len() - 2..].join("."))
}

/// Candidate zone names for a hostname, shortest first, at least two labels each.
///
/// `a.b.example.com` → `example.com`, `b.example.com`, `a.b.example.com`.
pub fn zone_candidates(hostname: &str) -> Vec<String> {
    let labels: Vec<&str> = hostname.split('.').collect();
    (2..=labels.len())
        .map(|n| labels[labels.len() - n..].join("."))
        .collect()
}

/// One entry of a tunnel's ingress list, as exchanged with the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressRule {
    /// Matched hostname; absent on the catch-all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Matched path regex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Origin service.
    pub service: String,

    /// Per-rule origin options.
    #[serde(
        rename = "originRequest",
        default,
        skip_serializing_if = "OriginRequest::is_empty"
    )]
    pub origin_request: OriginRequest,
}

impl IngressRule {
    /// The default trailing rule.
    pub fn catch_all() -> Self {
        Self {
            hostname: None,
            path: None,
            service: CATCH_ALL_SERVICE.to_string(),
            origin_request: OriginRequest::default(),
        }
    }

    /// Matches every request: no hostname, no path.
    pub fn is_catch_all(&self) -> bool {
        self.hostname.is_none() && self.path.is_none()
    }

    /// Case-insensitive hostname match.
    pub fn has_hostname(&self, hostname: &str) -> bool {
        self.hostname
            .as_deref()
            .is_some_and(|h| h.eq_ignore_ascii_case(hostname))
    }
}

/// `originRequest` options. Unknown keys are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OriginRequest {
    /// Disable origin certificate verification.
    #[serde(rename = "noTLSVerify", default, skip_serializing_if = "Option::is_none")]
    pub no_tls_verify: Option<bool>,

    /// Host header override.
    #[serde(rename = "httpHostHeader", default, skip_serializing_if = "Option::is_none")]
    pub http_host_header: Option<String>,

    /// Origin server name override.
    #[serde(rename = "originServerName", default, skip_serializing_if = "Option::is_none")]
    pub origin_server_name: Option<String>,

    /// Everything else.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OriginRequest {
    /// No options set.
    pub fn is_empty(&self) -> bool {
        self.no_tls_verify.is_none()
            && self.http_host_header.is_none()
            && self.origin_server_name.is_none()
            && self.extra.is_empty()
    }
}

/// A tunnel's routing configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelRouting {
    /// Ordered ingress rules, trailing catch-all included.
    pub ingress: Vec<IngressRule>,

    /// Other configuration keys (e.g. `warp-routing`), preserved on replace.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TunnelRouting {
    /// Routing with the given ingress and no other settings.
    pub fn new(ingress: Vec<IngressRule>) -> Self {
        Self {
            ingress,
            extra: Map::new(),
        }
    }
}

impl Default for TunnelRouting {
    /// What an unconfigured tunnel looks like: only the catch-all.
    fn default() -> Self {
        Self::new(vec![IngressRule::catch_all()])
    }
}

/// A DNS record in a zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    /// Record identifier.
    pub id: String,
    /// Fully qualified name.
    pub name: String,
    /// Record type (`CNAME`, `A`, ...).
    #[serde(rename = "type")]
    pub record_type: String,
    /// Record content (target for CNAMEs).
    pub content: String,
    /// Proxied through the edge.
    #[serde(default)]
    pub proxied: Option<bool>,
}

impl DnsRecord {
    /// Case-insensitive name match.
    pub fn has_name(&self, hostname: &str) -> bool {
        self.name.eq_ignore_ascii_case(hostname)
    }

    /// Record is a CNAME.
    pub fn is_cname(&self) -> bool {
        self.record_type.eq_ignore_ascii_case(CNAME)
    }

    /// Tunnel ID if this is a CNAME to a tunnel's canonical name.
    pub fn tunnel_id(&self) -> Option<&str> {
        if !self.is_cname() {
            return None;
        }
        self.content
            .strip_suffix(TUNNEL_DNS_SUFFIX)
            .and_then(|rest| rest.strip_suffix('.'))
            .filter(|id| !id.is_empty())
    }
}
