//! Prometheus metrics for managed HTTP servers.
//!
//! # Metrics
//!
//! ## Gauges
//! - `httpserver_health` - 1 while the server is running, 0 otherwise
//!
//! ## Counters
//! - `httpserver_total_requests` - requests received
//! - `httpserver_total_responses` - responses sent
//! - `httpserver_total_error_requests` - responses with a 4xx/5xx status
//!
//! ## Histograms
//! - `httpserver_requests_duration_seconds` - request processing duration
//! - `httpserver_requests_size_bytes` - request size including body
//! - `httpserver_responses_size_bytes` - response body size
//!
//! Every metric carries the constant labels `clusterName`, `clusterRole`,
//! `instanceName`, `httpServerName`, and `kind`; the per-request series add
//! `routerKind` and `backend`.

use crate::stat::RequestMetric;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use std::collections::HashMap;

const KIND: &str = "HTTPServer";

const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

const SIZE_BUCKETS: &[f64] = &[
    64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0, 4194304.0,
];

/// Identity labels shared by every metric of one server.
#[derive(Debug, Clone)]
pub struct MetricLabels {
    /// Name of the cluster the node belongs to.
    pub cluster_name: String,
    /// The node's role in its cluster (writer or reader).
    pub cluster_role: String,
    /// The node's instance name.
    pub instance_name: String,
}

/// Prometheus metrics of one managed server.
pub struct ServerMetrics {
    health: IntGauge,
    total_requests: IntCounterVec,
    total_responses: IntCounterVec,
    total_error_requests: IntCounterVec,
    requests_duration: HistogramVec,
    request_size_bytes: HistogramVec,
    response_size_bytes: HistogramVec,
}

impl ServerMetrics {
    /// Build and register the metrics for server `name`.
    pub fn new(registry: &Registry, name: &str, labels: &MetricLabels) -> Self {
        let const_labels: HashMap<String, String> = [
            ("clusterName".to_string(), labels.cluster_name.clone()),
            ("clusterRole".to_string(), labels.cluster_role.clone()),
            ("instanceName".to_string(), labels.instance_name.clone()),
            ("httpServerName".to_string(), name.to_string()),
            ("kind".to_string(), KIND.to_string()),
        ]
        .into_iter()
        .collect();
        let request_labels = ["routerKind", "backend"];

        let health = IntGauge::with_opts(
            Opts::new(
                "httpserver_health",
                "status of the http server: 1 for ready, 0 for down",
            )
            .const_labels(const_labels.clone()),
        )
        .expect("metric creation should not fail");

        let total_requests = IntCounterVec::new(
            Opts::new("httpserver_total_requests", "total count of http requests")
                .const_labels(const_labels.clone()),
            &request_labels,
        )
        .expect("metric creation should not fail");

        let total_responses = IntCounterVec::new(
            Opts::new(
                "httpserver_total_responses",
                "total count of http responses",
            )
            .const_labels(const_labels.clone()),
            &request_labels,
        )
        .expect("metric creation should not fail");

        let total_error_requests = IntCounterVec::new(
            Opts::new(
                "httpserver_total_error_requests",
                "total count of http error requests",
            )
            .const_labels(const_labels.clone()),
            &request_labels,
        )
        .expect("metric creation should not fail");

        let requests_duration = HistogramVec::new(
            HistogramOpts::new(
                "httpserver_requests_duration_seconds",
                "request processing duration histogram",
            )
            .const_labels(const_labels.clone())
            .buckets(DURATION_BUCKETS.to_vec()),
            &request_labels,
        )
        .expect("metric creation should not fail");

        let request_size_bytes = HistogramVec::new(
            HistogramOpts::new(
                "httpserver_requests_size_bytes",
                "histogram of the total size of the request, body included",
            )
            .const_labels(const_labels.clone())
            .buckets(SIZE_BUCKETS.to_vec()),
            &request_labels,
        )
        .expect("metric creation should not fail");

        let response_size_bytes = HistogramVec::new(
            HistogramOpts::new(
                "httpserver_responses_size_bytes",
                "histogram of the total size of the returned response body",
            )
            .const_labels(const_labels)
            .buckets(SIZE_BUCKETS.to_vec()),
            &request_labels,
        )
        .expect("metric creation should not fail");

        registry
            .register(Box::new(health.clone()))
            .expect("registration should not fail");
        registry
            .register(Box::new(total_requests.clone()))
            .expect("registration should not fail");
        registry
            .register(Box::new(total_responses.clone()))
            .expect("registration should not fail");
        registry
            .register(Box::new(total_error_requests.clone()))
            .expect("registration should not fail");
        registry
            .register(Box::new(requests_duration.clone()))
            .expect("registration should not fail");
        registry
            .register(Box::new(request_size_bytes.clone()))
            .expect("registration should not fail");
        registry
            .register(Box::new(response_size_bytes.clone()))
            .expect("registration should not fail");

        Self {
            health,
            total_requests,
            total_responses,
            total_error_requests,
            requests_duration,
            request_size_bytes,
            response_size_bytes,
        }
    }

    /// Export the server's health: 1 while running, 0 otherwise.
    pub fn set_health(&self, running: bool) {
        self.health.set(i64::from(running));
    }

    /// Record one finished request.
    pub fn record_request(&self, router_kind: &str, backend: &str, m: &RequestMetric) {
        let labels = [router_kind, backend];
        self.total_requests.with_label_values(&labels).inc();
        self.total_responses.with_label_values(&labels).inc();
        if m.status_code >= 400 {
            self.total_error_requests.with_label_values(&labels).inc();
        }
        self.requests_duration
            .with_label_values(&labels)
            .observe(m.duration.as_secs_f64());
        self.request_size_bytes
            .with_label_values(&labels)
            .observe(m.request_size as f64);
        self.response_size_bytes
            .with_label_values(&labels)
            .observe(m.response_size as f64);
    }
}
