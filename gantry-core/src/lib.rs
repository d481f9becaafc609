//! Gantry Core Library
//!
//! This crate provides the foundational types shared by the Gantry gateway
//! crates: the cluster data model (operations, members, node modes), the
//! error taxonomy, host-environment options, telemetry setup, and the
//! request-latency sampler.
//!
//! # Key Components
//!
//! - **Types**: `Operation`, `Member`, `Mode`, and friends, the vocabulary
//!   of the coordination layer
//! - **Options**: host-supplied environment knobs (`CLUSTER_HOST`,
//!   `INVENTORY_HOME`, ...)
//! - **Sampler**: a lock-free bucketed histogram for request latencies
//! - **Telemetry**: `tracing` subscriber setup shared by daemons and tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod option;
pub mod sampler;
pub mod telemetry;
pub mod types;

pub use error::{CoreError, CoreResult};
pub use option::HostOptions;
pub use sampler::{DurationSampler, Percentiles};
pub use types::{Member, MemberStatus, MemberTags, Mode, OpKind, Operation};
