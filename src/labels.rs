//! Container label parsing.
//!
//! Recognised labels, all optional except the hostname:
//!
//! ```text
//! cloudflare.zero_trust.access.tunnel.public_hostname   app.example.com
//! cloudflare.zero_trust.access.tunnel.service           http://app:8080
//! cloudflare.zero_trust.access.tunnel.id                <tunnel uuid>
//! cloudflare.zero_trust.access.tunnel.tls.notlsverify   true | false
//! cloudflare.zero_trust.access.tunnel.http_host_header  app.internal
//! cloudflare.zero_trust.access.tunnel.origin_server_name app.internal
//! ```
//!
//! Other keys, including unknown keys in the same namespace, are ignored.

use std::collections::HashMap;
use url::Url;

use crate::config::TunnelDefaults;
use crate::error::ExtractionError;
use crate::model::{zone_name, RoutingRule};

/// Public hostname label.
pub const HOSTNAME: &str = "cloudflare.zero_trust.access.tunnel.public_hostname";
/// Origin service label.
pub const SERVICE: &str = "cloudflare.zero_trust.access.tunnel.service";
/// Tunnel ID label.
pub const TUNNEL_ID: &str = "cloudflare.zero_trust.access.tunnel.id";
/// Disable origin TLS verification label.
pub const NO_TLS_VERIFY: &str = "cloudflare.zero_trust.access.tunnel.tls.notlsverify";
/// Host header override label.
pub const HTTP_HOST_HEADER: &str = "cloudflare.zero_trust.access.tunnel.http_host_header";
/// Origin server name override label.
pub const ORIGIN_SERVER_NAME: &str = "cloudflare.zero_trust.access.tunnel.origin_server_name";

const SERVICE_SCHEMES: &[&str] = &["http", "https", "tcp", "ssh", "rdp", "smb"];

const TRUES: &[&str] = &["true", "True", "TRUE", "t", "T", "1"];
const FALSES: &[&str] = &["false", "False", "FALSE", "f", "F", "0"];

/// Build the routing rule a container declares, if any.
///
/// `Ok(None)` means the container has no hostname label and is not a
/// candidate.
pub fn extract(
    labels: &HashMap<String, String>,
    defaults: &TunnelDefaults,
) -> Result<Option<RoutingRule>, ExtractionError> {
    let Some(raw_hostname) = label(labels, HOSTNAME) else {
        return Ok(None);
    };
    let hostname = validate_hostname(raw_hostname)?;

    let service = match label(labels, SERVICE) {
        Some(service) => service.to_string(),
        None => defaults
            .default_service
            .clone()
            .ok_or_else(|| ExtractionError::MissingService {
                hostname: hostname.clone(),
            })?,
    };
    validate_service(&service)?;

    let tunnel_id = label(labels, TUNNEL_ID)
        .map(str::to_string)
        .or_else(|| defaults.default_tunnel_id.clone())
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ExtractionError::MissingTunnelId {
            hostname: hostname.clone(),
        })?;

    let no_tls_verify = match label(labels, NO_TLS_VERIFY) {
        Some(value) => parse_flag(NO_TLS_VERIFY, value)?,
        None => false,
    };

    let host_header_override = label(labels, HTTP_HOST_HEADER).map(str::to_string);
    let auto = defaults.auto_http_host_header && host_header_override.is_none();

    let http_host_header = match host_header_override {
        Some(header) => Some(header),
        None if auto && !is_wildcard(&hostname) => Some(hostname.clone()),
        None => None,
    };

    let origin_server_name = match label(labels, ORIGIN_SERVER_NAME) {
        Some(name) => Some(name.to_string()),
        None if auto => wildcard_server_name(&hostname),
        None => None,
    };

    Ok(Some(RoutingRule {
        hostname,
        service,
        tunnel_id,
        origin_tls_verify: !no_tls_verify,
        http_host_header,
        origin_server_name,
    }))
}

/// Trimmed label value; empty counts as absent.
fn label<'a>(labels: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    labels
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// `foo.example.com` → `*.example.com`. `None` for single-label names.
pub fn wildcard_server_name(hostname: &str) -> Option<String> {
    zone_name(hostname).map(|zone| format!("*.{zone}"))
}

fn is_wildcard(hostname: &str) -> bool {
    hostname.starts_with("*.")
}

/// Normalise and check a hostname. A single leading `*` label is allowed.
pub fn validate_hostname(hostname: &str) -> Result<String, ExtractionError> {
    let hostname = hostname.trim().trim_end_matches('.').to_ascii_lowercase();
    let invalid = |reason: &str| ExtractionError::InvalidAttribute {
        key: HOSTNAME,
        value: hostname.clone(),
        reason: reason.to_string(),
    };

    if hostname.is_empty() {
        return Err(invalid("empty hostname"));
    }
    if hostname.len() > 253 {
        return Err(invalid("longer than 253 characters"));
    }
    // A leading `*` label makes a wildcard hostname.
    let name = match hostname.strip_prefix("*.") {
        Some(rest) => rest,
        None => hostname.as_str(),
    };
    for part in name.split('.') {
        if part.is_empty() || part.len() > 63 {
            return Err(invalid("each label must be 1-63 characters"));
        }
        if part.starts_with('-') || part.ends_with('-') {
            return Err(invalid("labels cannot start or end with '-'"));
        }
        if !part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid("only letters, digits, '-' and '_' are allowed"));
        }
    }
    Ok(hostname)
}

/// Check that a service is a URI with a supported scheme and a host.
pub fn validate_service(service: &str) -> Result<(), ExtractionError> {
    let invalid = |reason: String| ExtractionError::InvalidAttribute {
        key: SERVICE,
        value: service.to_string(),
        reason,
    };

    let url = Url::parse(service).map_err(|e| invalid(e.to_string()))?;
    if !SERVICE_SCHEMES.contains(&url.scheme()) {
        return Err(invalid(format!(
            "unsupported scheme \"{}\", expected one of {}",
            url.scheme(),
            SERVICE_SCHEMES.join(", ")
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(())
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ExtractionError> {
    if TRUES.contains(&value) {
        Ok(true)
    } else if FALSES.contains(&value) {
        Ok(false)
    } else {
        Err(ExtractionError::InvalidAttribute {
            key,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        })
    }
}
