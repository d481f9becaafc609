//! Request statistics.
//!
//! [`HttpStat`] keeps counters and a latency sampler for one server;
//! [`TopN`] keeps an `HttpStat` per request path and reports the busiest
//! ones. Recording is atomic-increment only, so it sits directly on the
//! request path.

use gantry_core::{DurationSampler, Percentiles};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How many paths [`TopN`] tracks at most; new paths beyond the cap are not
/// tracked individually.
const MAX_TRACKED_PATHS: usize = 128;

/// One finished request, as seen by the statistics layer.
#[derive(Debug, Clone)]
pub struct RequestMetric {
    /// Response status code.
    pub status_code: u16,
    /// Wall-clock request duration.
    pub duration: Duration,
    /// Request body size in bytes.
    pub request_size: u64,
    /// Response body size in bytes.
    pub response_size: u64,
}

/// Concurrent request statistics for one server.
#[derive(Default)]
pub struct HttpStat {
    total_requests: AtomicU64,
    total_responses: AtomicU64,
    total_error_requests: AtomicU64,
    request_bytes: AtomicU64,
    response_bytes: AtomicU64,
    status_classes: [AtomicU64; 5],
    sampler: DurationSampler,
}

/// Snapshot of [`HttpStat`] for status output.
#[derive(Debug, Clone, Serialize)]
pub struct StatSnapshot {
    /// Requests started.
    pub total_requests: u64,
    /// Responses finished.
    pub total_responses: u64,
    /// Responses with a 4xx or 5xx status.
    pub total_error_requests: u64,
    /// Request bytes seen.
    pub request_bytes: u64,
    /// Response bytes sent.
    pub response_bytes: u64,
    /// Responses by status class, `1xx` through `5xx`.
    pub status_codes: HashMap<String, u64>,
    /// Latency percentiles in milliseconds.
    pub durations: Percentiles,
}

impl HttpStat {
    /// Create zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished request.
    pub fn record(&self, m: &RequestMetric) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_responses.fetch_add(1, Ordering::Relaxed);
        if m.status_code >= 400 {
            self.total_error_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.request_bytes.fetch_add(m.request_size, Ordering::Relaxed);
        self.response_bytes
            .fetch_add(m.response_size, Ordering::Relaxed);

        let class = (m.status_code / 100).clamp(1, 5) as usize - 1;
        self.status_classes[class].fetch_add(1, Ordering::Relaxed);

        self.sampler.update(m.duration);
    }

    /// Produce a snapshot for status output.
    pub fn status(&self) -> StatSnapshot {
        let mut status_codes = HashMap::new();
        for (i, class) in self.status_classes.iter().enumerate() {
            let count = class.load(Ordering::Relaxed);
            if count > 0 {
                status_codes.insert(format!("{}xx", i + 1), count);
            }
        }
        StatSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_responses: self.total_responses.load(Ordering::Relaxed),
            total_error_requests: self.total_error_requests.load(Ordering::Relaxed),
            request_bytes: self.request_bytes.load(Ordering::Relaxed),
            response_bytes: self.response_bytes.load(Ordering::Relaxed),
            status_codes,
            durations: self.sampler.percentiles(),
        }
    }
}

/// One entry of the top-N report.
#[derive(Debug, Clone, Serialize)]
pub struct TopNItem {
    /// Request path.
    pub path: String,
    /// Statistics for that path.
    #[serde(flatten)]
    pub stat: StatSnapshot,
}

/// Per-path statistics, reporting the N busiest paths.
pub struct TopN {
    n: usize,
    paths: RwLock<HashMap<String, Arc<HttpStat>>>,
}

impl TopN {
    /// Track the busiest `n` paths.
    pub fn new(n: usize) -> Self {
        Self {
            n,
            paths: RwLock::new(HashMap::new()),
        }
    }

    /// Record a finished request against its path.
    pub fn record(&self, path: &str, m: &RequestMetric) {
        let stat = {
            let paths = self.paths.read();
            paths.get(path).cloned()
        };
        let stat = match stat {
            Some(stat) => stat,
            None => {
                let mut paths = self.paths.write();
                if paths.len() >= MAX_TRACKED_PATHS && !paths.contains_key(path) {
                    return;
                }
                Arc::clone(
                    paths
                        .entry(path.to_string())
                        .or_insert_with(|| Arc::new(HttpStat::new())),
                )
            }
        };
        stat.record(m);
    }

    /// The busiest paths, most requests first.
    pub fn status(&self) -> Vec<TopNItem> {
        let mut items: Vec<TopNItem> = self
            .paths
            .read()
            .iter()
            .map(|(path, stat)| TopNItem {
                path: path.clone(),
                stat: stat.status(),
            })
            .collect();
        items.sort_by(|a, b| {
            b.stat
                .total_requests
                .cmp(&a.stat.total_requests)
                .then_with(|| a.path.cmp(&b.path))
        });
        items.truncate(self.n);
        items
    }
}
