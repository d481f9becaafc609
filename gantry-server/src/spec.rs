//! Server configuration and hot-reload classification.

use crate::error::{ServerError, ServerResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_CONNECTIONS: u32 = 10240;

/// Configuration of one managed HTTP server.
///
/// Changes restricted to `max_connections`, `cache_size`, `x_forwarded_for`,
/// `tracing`, `ip_filter`, and `rules` are applied in place; any other
/// difference restarts the listener (see [`ServerSpec::needs_restart`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSpec {
    /// Port to listen on; required.
    pub port: u16,
    /// Serve HTTP/1+2 over TLS.
    pub https_enabled: bool,
    /// Serve HTTP/3 over QUIC instead of HTTP/1+2; wins over `https_enabled`.
    pub http3_enabled: bool,
    /// Whether idle connections are kept open between requests.
    pub keep_alive: bool,
    /// Idle timeout for kept-alive connections.
    pub keep_alive_timeout: Duration,
    /// Concurrent connection cap; hot-reloadable.
    pub max_connections: u32,
    /// Route cache size; hot-reloadable.
    pub cache_size: u32,
    /// Append the peer address to `X-Forwarded-For`; hot-reloadable.
    pub x_forwarded_for: bool,
    /// Distributed tracing settings; hot-reloadable.
    pub tracing: Option<TracingSpec>,
    /// Source-address filter; hot-reloadable.
    pub ip_filter: Option<IpFilterSpec>,
    /// Routing rules; hot-reloadable.
    pub rules: Vec<RuleSpec>,
    /// PEM certificate chain for TLS serving.
    pub cert_pem: Option<String>,
    /// PEM private key for TLS serving.
    pub key_pem: Option<String>,
}

impl Default for ServerSpec {
    fn default() -> Self {
        Self {
            port: 0,
            https_enabled: false,
            http3_enabled: false,
            keep_alive: true,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            cache_size: 0,
            x_forwarded_for: false,
            tracing: None,
            ip_filter: None,
            rules: Vec::new(),
            cert_pem: None,
            key_pem: None,
        }
    }
}

/// Distributed tracing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracingSpec {
    /// Service name reported on spans.
    pub service_name: String,
    /// Collector endpoint.
    pub endpoint: String,
}

/// Source-address filter. An empty allow list admits everyone not blocked.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IpFilterSpec {
    /// Addresses admitted; empty means all.
    pub allow: Vec<String>,
    /// Addresses refused; wins over `allow`.
    pub block: Vec<String>,
}

/// One routing rule: an optional host match and its paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Exact host to match; `None` matches every host.
    pub host: Option<String>,
    /// Path matches tried in order.
    pub paths: Vec<PathSpec>,
}

/// One path match inside a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathSpec {
    /// Exact path to match.
    pub path: Option<String>,
    /// Path prefix to match; tried when `path` misses.
    pub path_prefix: Option<String>,
    /// Backend handler name resolved through the mux mapper.
    pub backend: String,
}

impl ServerSpec {
    /// Validate the spec.
    pub fn validate(&self) -> ServerResult<()> {
        if self.port == 0 {
            return Err(ServerError::Config("port is required".to_string()));
        }
        if (self.https_enabled || self.http3_enabled)
            && (self.cert_pem.is_none() || self.key_pem.is_none())
        {
            return Err(ServerError::Config(
                "https/http3 requires cert_pem and key_pem".to_string(),
            ));
        }
        if self.keep_alive_timeout.is_zero() {
            return Err(ServerError::Config(
                "keep_alive_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether switching to `next` forces a listener restart.
    ///
    /// Both specs are compared with the six hot-reloadable fields blanked;
    /// structural equality of the rest means the listener can stay up.
    pub fn needs_restart(&self, next: &ServerSpec) -> bool {
        blanked(self.clone()) != blanked(next.clone())
    }

    /// Build the TLS server configuration from the embedded PEM material.
    pub fn tls_config(&self) -> ServerResult<rustls::ServerConfig> {
        let (Some(cert_pem), Some(key_pem)) = (&self.cert_pem, &self.key_pem) else {
            return Err(ServerError::Tls(
                "tls serving enabled without certificate material".to_string(),
            ));
        };

        let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServerError::Tls(format!("reading certificates: {e}")))?;
        if certs.is_empty() {
            return Err(ServerError::Tls("no certificate found in cert_pem".to_string()));
        }
        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| ServerError::Tls(format!("reading private key: {e}")))?
            .ok_or_else(|| ServerError::Tls("no private key found in key_pem".to_string()))?;

        let provider = std::sync::Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ServerError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?;
        Ok(config)
    }
}

fn blanked(mut spec: ServerSpec) -> ServerSpec {
    spec.max_connections = 0;
    spec.cache_size = 0;
    spec.x_forwarded_for = false;
    spec.tracing = None;
    spec.ip_filter = None;
    spec.rules = Vec::new();
    spec
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ServerSpec {
        ServerSpec {
            port: 8080,
            ..ServerSpec::default()
        }
    }

    #[test]
    fn validation_requires_port_and_certs() {
        assert!(ServerSpec::default().validate().is_err());
        assert!(base().validate().is_ok());

        let mut spec = base();
        spec.https_enabled = true;
        assert!(spec.validate().is_err());
        spec.cert_pem = Some("cert".to_string());
        spec.key_pem = Some("key".to_string());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn hot_fields_do_not_force_restart() {
        let old = base();
        let mut next = base();
        next.max_connections = 1;
        next.cache_size = 64;
        next.x_forwarded_for = true;
        next.tracing = Some(TracingSpec {
            service_name: "gw".to_string(),
            endpoint: "collector:4317".to_string(),
        });
        next.ip_filter = Some(IpFilterSpec {
            allow: vec!["10.0.0.1".to_string()],
            block: Vec::new(),
        });
        next.rules = vec![RuleSpec {
            host: None,
            paths: vec![PathSpec {
                path: Some("/".to_string()),
                path_prefix: None,
                backend: "b".to_string(),
            }],
        }];
        assert!(!old.needs_restart(&next));
    }

    #[test]
    fn cold_fields_force_restart() {
        let old = base();

        let mut next = base();
        next.port = 8081;
        assert!(old.needs_restart(&next));

        let mut next = base();
        next.keep_alive = false;
        assert!(old.needs_restart(&next));

        let mut next = base();
        next.http3_enabled = true;
        assert!(old.needs_restart(&next));

        let mut next = base();
        next.keep_alive_timeout = Duration::from_secs(10);
        assert!(old.needs_restart(&next));
    }

    #[test]
    fn spec_round_trips_through_json() {
        let mut spec = base();
        spec.rules = vec![RuleSpec {
            host: Some("api.example.com".to_string()),
            paths: vec![PathSpec {
                path: None,
                path_prefix: Some("/v1".to_string()),
                backend: "api".to_string(),
            }],
        }];
        let json = serde_json::to_string(&spec).unwrap();
        let back: ServerSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
