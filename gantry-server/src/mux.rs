//! Request multiplexer.
//!
//! The mux owns the routing view of one server: the spec's rules, the IP
//! filter, and the handler mapper supplied by the host. A reload swaps that
//! view atomically without touching the listener; the runtime calls it for
//! every reload, hot or cold. Handlers are resolved by backend name through
//! the [`MuxMapper`] collaborator; a miss is a plain 404.

use crate::metrics::ServerMetrics;
use crate::spec::ServerSpec;
use crate::stat::{HttpStat, RequestMetric, TopN};
use async_trait::async_trait;
use bytes::Bytes;
use http_body::Body;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, StatusCode};
use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// A backend request handler.
///
/// Handlers receive the request with its body collected; what happens inside
/// (filter chains, proxying) is the host's business.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Process one request.
    async fn handle(&self, req: Request<Bytes>) -> Response<Full<Bytes>>;
}

/// Resolves backend names from routing rules to handlers.
///
/// Supplied by the host; `None` is served as 404.
pub trait MuxMapper: Send + Sync {
    /// Look up the handler registered under `name`.
    fn get_handler(&self, name: &str) -> Option<Arc<dyn Handler>>;
}

#[derive(Default)]
struct MuxInner {
    spec: Option<ServerSpec>,
    mapper: Option<Arc<dyn MuxMapper>>,
    allow: Vec<IpAddr>,
    block: Vec<IpAddr>,
}

impl MuxInner {
    fn admits(&self, peer: IpAddr) -> bool {
        if self.block.contains(&peer) {
            return false;
        }
        self.allow.is_empty() || self.allow.contains(&peer)
    }
}

enum Routed {
    Unconfigured,
    Forbidden,
    NotFound,
    Handle {
        handler: Arc<dyn Handler>,
        backend: String,
        x_forwarded_for: bool,
    },
}

/// The swap-able routing core shared by every listener generation.
#[derive(Clone)]
pub(crate) struct Mux {
    inner: Arc<RwLock<MuxInner>>,
    stat: Arc<HttpStat>,
    top_n: Arc<TopN>,
    metrics: Arc<ServerMetrics>,
}

impl Mux {
    pub(crate) fn new(stat: Arc<HttpStat>, top_n: Arc<TopN>, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MuxInner::default())),
            stat,
            top_n,
            metrics,
        }
    }

    /// Swap in a new spec and mapper.
    pub(crate) fn reload(&self, spec: &ServerSpec, mapper: Arc<dyn MuxMapper>) {
        let (allow, block) = match &spec.ip_filter {
            Some(filter) => (parse_addrs(&filter.allow), parse_addrs(&filter.block)),
            None => (Vec::new(), Vec::new()),
        };
        let mut inner = self.inner.write();
        inner.spec = Some(spec.clone());
        inner.mapper = Some(mapper);
        inner.allow = allow;
        inner.block = block;
    }

    /// Drop the routing view; requests are refused afterwards.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.write();
        inner.spec = None;
        inner.mapper = None;
    }

    /// Serve one request, recording statistics and metrics around it.
    pub(crate) async fn serve<B>(&self, req: Request<B>, peer: IpAddr) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let start = Instant::now();
        let path = req.uri().path().to_string();
        let host = request_host(&req);

        let routed = {
            let inner = self.inner.read();
            match (&inner.spec, &inner.mapper) {
                (Some(spec), Some(mapper)) => {
                    if !inner.admits(peer) {
                        Routed::Forbidden
                    } else {
                        match route(spec, host.as_deref(), &path) {
                            Some(backend) => match mapper.get_handler(&backend) {
                                Some(handler) => Routed::Handle {
                                    handler,
                                    backend,
                                    x_forwarded_for: spec.x_forwarded_for,
                                },
                                None => Routed::NotFound,
                            },
                            None => Routed::NotFound,
                        }
                    }
                }
                _ => Routed::Unconfigured,
            }
        };

        let mut request_size = 0u64;
        let (resp, backend, router_kind) = match routed {
            Routed::Unconfigured => (plain(StatusCode::SERVICE_UNAVAILABLE), String::new(), "none"),
            Routed::Forbidden => (plain(StatusCode::FORBIDDEN), String::new(), "ipFilter"),
            Routed::NotFound => (plain(StatusCode::NOT_FOUND), String::new(), "rule"),
            Routed::Handle {
                handler,
                backend,
                x_forwarded_for,
            } => {
                let (mut parts, body) = req.into_parts();
                match body.collect().await {
                    Ok(collected) => {
                        let body = collected.to_bytes();
                        request_size = body.len() as u64;
                        if x_forwarded_for {
                            if let Ok(value) = HeaderValue::from_str(&peer.to_string()) {
                                parts.headers.append(X_FORWARDED_FOR, value);
                            }
                        }
                        let resp = handler.handle(Request::from_parts(parts, body)).await;
                        (resp, backend, "rule")
                    }
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "reading the request body failed");
                        (plain(StatusCode::BAD_REQUEST), backend, "rule")
                    }
                }
            }
        };

        let metric = RequestMetric {
            status_code: resp.status().as_u16(),
            duration: start.elapsed(),
            request_size,
            response_size: resp.body().size_hint().exact().unwrap_or(0),
        };
        self.stat.record(&metric);
        self.top_n.record(&path, &metric);
        self.metrics.record_request(router_kind, &backend, &metric);

        resp
    }
}

fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_string());
    }
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
}

fn route(spec: &ServerSpec, host: Option<&str>, path: &str) -> Option<String> {
    for rule in &spec.rules {
        if let Some(rule_host) = &rule.host {
            if host != Some(rule_host.as_str()) {
                continue;
            }
        }
        for p in &rule.paths {
            if let Some(exact) = &p.path {
                if exact == path {
                    return Some(p.backend.clone());
                }
            }
            if let Some(prefix) = &p.path_prefix {
                if path.starts_with(prefix.as_str()) {
                    return Some(p.backend.clone());
                }
            }
        }
    }
    None
}

fn parse_addrs(addrs: &[String]) -> Vec<IpAddr> {
    addrs
        .iter()
        .filter_map(|a| match a.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                debug!(address = %a, "unparseable ip filter entry, skipped");
                None
            }
        })
        .collect()
}

fn plain(status: StatusCode) -> Response<Full<Bytes>> {
    let body = status.canonical_reason().unwrap_or("");
    let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
    *resp.status_mut() = status;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricLabels;
    use crate::spec::{IpFilterSpec, PathSpec, RuleSpec};
    use prometheus::Registry;
    use std::collections::HashMap;

    struct EchoHandler(&'static str);

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(&self, req: Request<Bytes>) -> Response<Full<Bytes>> {
            let xff = req
                .headers()
                .get(X_FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            Response::new(Full::new(Bytes::from(format!("{}|{}", self.0, xff))))
        }
    }

    struct MapMapper(HashMap<String, Arc<dyn Handler>>);

    impl MuxMapper for MapMapper {
        fn get_handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
            self.0.get(name).cloned()
        }
    }

    fn test_mux() -> Mux {
        let registry = Registry::new();
        let metrics = Arc::new(ServerMetrics::new(
            &registry,
            "test",
            &MetricLabels {
                cluster_name: "c".to_string(),
                cluster_role: "Write".to_string(),
                instance_name: "n".to_string(),
            },
        ));
        Mux::new(
            Arc::new(HttpStat::new()),
            Arc::new(TopN::new(10)),
            metrics,
        )
    }

    fn mapper_with(backends: &[&'static str]) -> Arc<dyn MuxMapper> {
        let map: HashMap<String, Arc<dyn Handler>> = backends
            .iter()
            .map(|b| (b.to_string(), Arc::new(EchoHandler(b)) as Arc<dyn Handler>))
            .collect();
        Arc::new(MapMapper(map))
    }

    fn spec_with_rules() -> ServerSpec {
        ServerSpec {
            port: 8080,
            rules: vec![RuleSpec {
                host: None,
                paths: vec![
                    PathSpec {
                        path: Some("/exact".to_string()),
                        path_prefix: None,
                        backend: "exact".to_string(),
                    },
                    PathSpec {
                        path: None,
                        path_prefix: Some("/api".to_string()),
                        backend: "api".to_string(),
                    },
                ],
            }],
            ..ServerSpec::default()
        }
    }

    fn request(path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(path)
            .body(Full::new(Bytes::from_static(b"body")))
            .unwrap()
    }

    fn peer() -> IpAddr {
        "192.0.2.7".parse().unwrap()
    }

    async fn body_string(resp: Response<Full<Bytes>>) -> String {
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map(|c| c.to_bytes())
            .unwrap_or_default();
        String::from_utf8_lossy(&bytes).to_string()
    }

    #[tokio::test]
    async fn routes_exact_then_prefix_then_404() {
        let mux = test_mux();
        mux.reload(&spec_with_rules(), mapper_with(&["exact", "api"]));

        let resp = mux.serve(request("/exact"), peer()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_string(resp).await.starts_with("exact|"));

        let resp = mux.serve(request("/api/v1/plugins"), peer()).await;
        assert!(body_string(resp).await.starts_with("api|"));

        let resp = mux.serve(request("/missing"), peer()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unmapped_backend_is_404() {
        let mux = test_mux();
        mux.reload(&spec_with_rules(), mapper_with(&["api"]));

        let resp = mux.serve(request("/exact"), peer()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ip_filter_blocks_before_routing() {
        let mux = test_mux();
        let mut spec = spec_with_rules();
        spec.ip_filter = Some(IpFilterSpec {
            allow: Vec::new(),
            block: vec!["192.0.2.7".to_string()],
        });
        mux.reload(&spec, mapper_with(&["exact", "api"]));

        let resp = mux.serve(request("/exact"), peer()).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let other: IpAddr = "192.0.2.8".parse().unwrap();
        let resp = mux.serve(request("/exact"), other).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn x_forwarded_for_is_appended_when_enabled() {
        let mux = test_mux();
        let mut spec = spec_with_rules();
        spec.x_forwarded_for = true;
        mux.reload(&spec, mapper_with(&["exact", "api"]));

        let resp = mux.serve(request("/exact"), peer()).await;
        assert_eq!(body_string(resp).await, "exact|192.0.2.7");
    }

    #[tokio::test]
    async fn host_rules_only_match_their_host() {
        let mux = test_mux();
        let mut spec = spec_with_rules();
        spec.rules[0].host = Some("api.example.com".to_string());
        mux.reload(&spec, mapper_with(&["exact", "api"]));

        let resp = mux.serve(request("/exact"), peer()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = Request::builder()
            .uri("/exact")
            .header(HOST, "api.example.com:8080")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = mux.serve(req, peer()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn closed_mux_refuses_requests() {
        let mux = test_mux();
        mux.reload(&spec_with_rules(), mapper_with(&["exact", "api"]));
        mux.close();

        let resp = mux.serve(request("/exact"), peer()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn statistics_are_recorded() {
        let mux = test_mux();
        mux.reload(&spec_with_rules(), mapper_with(&["exact", "api"]));

        mux.serve(request("/exact"), peer()).await;
        mux.serve(request("/missing"), peer()).await;

        let snap = mux.stat.status();
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.total_error_requests, 1);

        let top = mux.top_n.status();
        assert_eq!(top.len(), 2);
    }
}
