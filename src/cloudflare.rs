//! Cloudflare tunnel configuration and DNS API client.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{CloudflareConfig, RetryConfig};
use crate::error::ApiError;
use crate::metrics;
use crate::model::{DnsRecord, TunnelRouting, CNAME};

const DNS_PAGE_SIZE: u32 = 100;

/// Remote routing and DNS state.
#[async_trait]
pub trait TunnelApi: Send + Sync {
    /// Current ingress configuration of a tunnel.
    async fn fetch_routing(&self, tunnel_id: &str) -> Result<TunnelRouting, ApiError>;

    /// Overwrite a tunnel's ingress configuration.
    async fn replace_routing(&self, tunnel_id: &str, routing: &TunnelRouting)
        -> Result<(), ApiError>;

    /// Zone ID for an exact zone name, if the account has that zone.
    async fn find_zone(&self, zone_name: &str) -> Result<Option<String>, ApiError>;

    /// All DNS records of a zone.
    async fn fetch_dns(&self, zone_id: &str) -> Result<Vec<DnsRecord>, ApiError>;

    /// Point `hostname` at `target` with a proxied CNAME, patching
    /// `existing` when a record is already there.
    async fn upsert_dns_record(
        &self,
        zone_id: &str,
        hostname: &str,
        target: &str,
        existing: Option<&str>,
    ) -> Result<(), ApiError>;

    /// Delete a DNS record.
    async fn delete_dns_record(&self, zone_id: &str, record_id: &str) -> Result<(), ApiError>;
}

/// Standard v4 response wrapper.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct TunnelConfiguration {
    #[serde(default)]
    config: Option<TunnelConfigBody>,
}

/// The `config` object; `ingress` may be absent on unconfigured tunnels.
#[derive(Debug, Deserialize)]
struct TunnelConfigBody {
    #[serde(default)]
    ingress: Vec<crate::model::IngressRule>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct PutTunnelConfiguration<'a> {
    config: &'a TunnelRouting,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct DnsRecordBody<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    proxied: bool,
}

/// HTTP client for the Cloudflare v4 API.
#[derive(Debug)]
pub struct CloudflareClient {
    http: reqwest::Client,
    base: String,
    account_id: String,
    token: String,
    retry: RetryConfig,
    zones: RwLock<HashMap<String, String>>,
}

impl CloudflareClient {
    /// Create a client from configuration.
    pub fn new(config: &CloudflareConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("cfd-hostnames/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base: config.api_base.trim_end_matches('/').to_string(),
            account_id: config.account_id.clone(),
            token: config.api_token.clone(),
            retry: config.retry.clone(),
            zones: RwLock::new(HashMap::new()),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.base, path))
            .bearer_auth(&self.token)
    }

    fn tunnel_path(&self, tunnel_id: &str) -> String {
        format!(
            "accounts/{}/cfd_tunnel/{}/configurations",
            self.account_id, tunnel_id
        )
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 1u32;
        loop {
            match call().await {
                Ok(value) => {
                    metrics::record_api_request(op, true);
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying Cloudflare API call"
                    );
                    metrics::record_api_retry(op);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    metrics::record_api_request(op, false);
                    return Err(e);
                }
            }
        }
    }

    /// Send once and decode the envelope.
    async fn send<T: DeserializeOwned>(
        op: &'static str,
        request: RequestBuilder,
    ) -> Result<Envelope<T>, ApiError> {
        let response = request.send().await.map_err(|e| classify_reqwest(op, e))?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(ApiError::Transient {
                op,
                reason: format!("HTTP {status}"),
            });
        }

        let body = response.text().await.map_err(|e| classify_reqwest(op, e))?;
        let envelope: Result<Envelope<T>, _> = serde_json::from_str(&body);

        match envelope {
            Ok(envelope) if status.is_success() && envelope.success => Ok(envelope),
            Ok(envelope) => Err(ApiError::Permanent {
                op,
                status: Some(status.as_u16()),
                reason: describe_errors(&envelope.errors),
            }),
            Err(e) if status.is_success() => Err(ApiError::Permanent {
                op,
                status: Some(status.as_u16()),
                reason: format!("invalid response body: {e}"),
            }),
            Err(_) => Err(ApiError::Permanent {
                op,
                status: Some(status.as_u16()),
                reason: truncate(&body, 200),
            }),
        }
    }

    fn cached_zone(&self, zone_name: &str) -> Option<String> {
        self.zones.read().get(zone_name).cloned()
    }
}

fn classify_reqwest(op: &'static str, e: reqwest::Error) -> ApiError {
    if e.is_timeout() || e.is_connect() || e.is_body() {
        ApiError::Transient {
            op,
            reason: e.to_string(),
        }
    } else {
        ApiError::Permanent {
            op,
            status: e.status().map(|s| s.as_u16()),
            reason: e.to_string(),
        }
    }
}

fn describe_errors(errors: &[ApiMessage]) -> String {
    if errors.is_empty() {
        return "request unsuccessful".to_string();
    }
    errors
        .iter()
        .map(|e| format!("{} ({})", e.message, e.code))
        .collect::<Vec<_>>()
        .join("; ")
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[async_trait]
impl TunnelApi for CloudflareClient {
    async fn fetch_routing(&self, tunnel_id: &str) -> Result<TunnelRouting, ApiError> {
        const OP: &str = "fetch_routing";
        let path = self.tunnel_path(tunnel_id);
        let envelope: Envelope<TunnelConfiguration> = self
            .with_retry(OP, || Self::send(OP, self.request(Method::GET, &path)))
            .await?;

        let config = envelope.result.and_then(|r| r.config);
        let routing = match config {
            Some(body) if !body.ingress.is_empty() => TunnelRouting {
                ingress: body.ingress,
                extra: body.extra,
            },
            Some(body) => TunnelRouting {
                extra: body.extra,
                ..TunnelRouting::default()
            },
            None => TunnelRouting::default(),
        };
        debug!(tunnel_id, rules = routing.ingress.len(), "fetched tunnel ingress");
        Ok(routing)
    }

    async fn replace_routing(
        &self,
        tunnel_id: &str,
        routing: &TunnelRouting,
    ) -> Result<(), ApiError> {
        const OP: &str = "replace_routing";
        let path = self.tunnel_path(tunnel_id);
        let body = PutTunnelConfiguration { config: routing };
        self.with_retry(OP, || {
            Self::send::<serde_json::Value>(OP, self.request(Method::PUT, &path).json(&body))
        })
        .await?;
        Ok(())
    }

    async fn find_zone(&self, zone_name: &str) -> Result<Option<String>, ApiError> {
        const OP: &str = "find_zone";
        if let Some(id) = self.cached_zone(zone_name) {
            return Ok(Some(id));
        }

        let envelope: Envelope<Vec<Zone>> = self
            .with_retry(OP, || {
                Self::send(
                    OP,
                    self.request(Method::GET, "zones").query(&[
                        ("name", zone_name),
                        ("account.id", self.account_id.as_str()),
                    ]),
                )
            })
            .await?;

        let zone = envelope
            .result
            .unwrap_or_default()
            .into_iter()
            .find(|z| z.name.eq_ignore_ascii_case(zone_name));

        Ok(zone.map(|z| {
            self.zones.write().insert(zone_name.to_string(), z.id.clone());
            z.id
        }))
    }

    async fn fetch_dns(&self, zone_id: &str) -> Result<Vec<DnsRecord>, ApiError> {
        const OP: &str = "fetch_dns";
        let path = format!("zones/{zone_id}/dns_records");
        let mut records = Vec::new();
        let mut page = 1u32;

        loop {
            let page_str = page.to_string();
            let per_page = DNS_PAGE_SIZE.to_string();
            let envelope: Envelope<Vec<DnsRecord>> = self
                .with_retry(OP, || {
                    Self::send(
                        OP,
                        self.request(Method::GET, &path).query(&[
                            ("page", page_str.as_str()),
                            ("per_page", per_page.as_str()),
                        ]),
                    )
                })
                .await?;

            records.extend(envelope.result.unwrap_or_default());

            match envelope.result_info {
                Some(info) if page < info.total_pages => page += 1,
                _ => break,
            }
        }

        debug!(zone_id, records = records.len(), "fetched DNS records");
        Ok(records)
    }

    async fn upsert_dns_record(
        &self,
        zone_id: &str,
        hostname: &str,
        target: &str,
        existing: Option<&str>,
    ) -> Result<(), ApiError> {
        let body = DnsRecordBody {
            record_type: CNAME,
            name: hostname,
            content: target,
            proxied: true,
        };

        match existing {
            Some(record_id) => {
                const OP: &str = "update_dns_record";
                let path = format!("zones/{zone_id}/dns_records/{record_id}");
                self.with_retry(OP, || {
                    Self::send::<serde_json::Value>(OP, self.request(Method::PATCH, &path).json(&body))
                })
                .await?;
            }
            None => {
                const OP: &str = "create_dns_record";
                let path = format!("zones/{zone_id}/dns_records");
                self.with_retry(OP, || {
                    Self::send::<serde_json::Value>(OP, self.request(Method::POST, &path).json(&body))
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn delete_dns_record(&self, zone_id: &str, record_id: &str) -> Result<(), ApiError> {
        const OP: &str = "delete_dns_record";
        let path = format!("zones/{zone_id}/dns_records/{record_id}");
        self.with_retry(OP, || {
            Self::send::<serde_json::Value>(OP, self.request(Method::DELETE, &path))
        })
        .await?;
        Ok(())
    }
}
