//! Group-scoped coordination for the Gantry gateway.
//!
//! A cluster is partitioned into **groups**; inside a group exactly one
//! member runs in `Write` mode and orders every administrative operation
//! into a durable, dense, 1-based log. `Read` members pull the log from the
//! writer and replay it into their model, so every member of a group serves
//! the same configuration. Fan-out queries (statistics, state retrieval,
//! membership) run over a scatter-gather RPC primitive with per-responder
//! deduplication and an aggregate timeout.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────────────┐
//!                 │                 GatewayCluster               │
//!                 │                                              │
//!  substrate ───► │ dispatch ──► handlers ──► OpLog / Model      │
//!   events        │     │                        ▲               │
//!                 │     │ (readers)              │               │
//!                 │     └──► sync loop ──────────┘               │
//!                 │              │                               │
//!                 │              └──► scatter-gather ──► peers   │
//!                 └──────────────────────────────────────────────┘
//! ```
//!
//! The gossip substrate is a collaborator behind the [`basis::Basis`] trait;
//! [`basis::memory::MemoryHub`] connects in-process nodes for tests and
//! single-process embeddings. Ordering is strictly per-writer: there is no
//! cross-group consensus, and delivery is at-least-once with idempotent
//! sequence numbers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod basis;
pub mod config;
pub mod error;
pub mod gather;
pub mod message;
pub mod model;
pub mod oplog;

mod gateway;
mod handlers;
mod sync;

pub use config::{ClusterConfig, ClusterConfigBuilder};
pub use error::{ClusterError, ClusterResult};
pub use gateway::GatewayCluster;
pub use model::Model;
pub use oplog::OpLog;
