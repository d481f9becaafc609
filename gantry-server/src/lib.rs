//! HTTP server lifecycle management for the Gantry gateway.
//!
//! Each managed server is driven by a single-threaded state machine
//! (`nil → running ⇄ failed → closed`) that owns the listener, the routing
//! mux, and the statistics surface. Configuration changes arrive as reload
//! events: changes limited to the connection cap, cache size,
//! `X-Forwarded-For`, tracing, the IP filter, and the routing rules are
//! applied in place; anything else restarts the listener under a new round
//! number, draining in-flight HTTP/1+2 requests for up to thirty seconds.
//!
//! HTTP/1 and HTTP/2 are served from one TCP listener (hyper, optionally
//! behind TLS) wrapped in a connection cap; HTTP/3 is served from a QUIC
//! endpoint instead when the spec enables it. Request handlers come from the
//! host through the [`MuxMapper`] contract; statistics and Prometheus
//! metrics are recorded around every request.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod grace;
pub mod limit_listener;
pub mod metrics;
pub mod spec;
pub mod stat;

mod http3;
mod mux;
mod runtime;

pub use error::{ServerError, ServerResult};
pub use grace::{default_listen, ListenFn};
pub use metrics::MetricLabels;
pub use mux::{Handler, MuxMapper};
pub use runtime::{Runtime, State, Status};
pub use spec::{IpFilterSpec, PathSpec, RuleSpec, ServerSpec, TracingSpec};
