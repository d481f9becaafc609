//! The gossip substrate contract.
//!
//! The gateway cluster does not implement gossip itself; it wraps a
//! substrate that owns membership probing and request fan-out, the same way
//! the model layer is plugged in from outside. [`Basis`] is that contract:
//! implementations deliver [`ClusterEvent`]s over the channel handed to them
//! at construction (the substrate writes, the cluster reads, no back
//! pointer), answer member snapshots, and ship request payloads to a set of
//! target nodes, streaming responses back until a deadline.
//!
//! [`memory::MemoryHub`] is the in-process backend used by tests and
//! single-process embeddings; network substrates plug in behind the same
//! trait.

pub mod memory;

use crate::error::{ClusterError, ClusterResult};
use bytes::Bytes;
use gantry_core::{Member, MemberTags};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Configuration handed to a substrate backend at connect time.
#[derive(Debug, Clone)]
pub struct BasisConfig {
    /// Cluster-unique node name.
    pub node_name: String,
    /// Address the substrate binds to.
    pub bind_address: String,
    /// Port the substrate binds to and advertises.
    pub bind_port: u16,
    /// Address advertised to peers; must be reachable from them.
    pub advertise_address: String,
    /// UDP buffer size for gossip packets.
    pub udp_buffer_bytes: usize,
    /// Gossip fan-out interval.
    pub gossip_interval: Duration,
    /// The `{group, mode}` tag pair advertised with every probe.
    pub tags: MemberTags,
}

/// What kind of membership change an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEventKind {
    /// A member joined the cluster.
    Joined,
    /// A member left voluntarily.
    Left,
    /// The failure detector declared a member dead.
    Failed,
    /// A member's tags changed.
    Updated,
    /// A dead member's record was cleaned up.
    Cleaned,
}

/// A membership change observed by the substrate.
#[derive(Debug, Clone)]
pub struct MemberEvent {
    /// What happened.
    pub kind: MemberEventKind,
    /// The member it happened to.
    pub member: Member,
}

/// One member's answer inside a [`RequestFuture`] stream.
#[derive(Debug, Clone)]
pub struct MemberResponse {
    /// The responding node.
    pub node: String,
    /// The response frame; `None` only if the substrate lost the body.
    pub payload: Option<Bytes>,
}

/// An inbound request delivered by the substrate.
///
/// The payload's first byte is the message type; the dispatcher routes on
/// it. `respond` ships a frame back to the requester and fails once the
/// request's deadline has passed.
pub struct RequestEvent {
    /// Request name, for logs.
    pub request_name: String,
    /// The node that issued the request.
    pub source: String,
    /// The raw request frame.
    pub payload: Bytes,
    deadline: Instant,
    responder_name: String,
    response_to: mpsc::UnboundedSender<MemberResponse>,
}

impl RequestEvent {
    /// Construct an event for delivery to `responder_name`. Substrate-side.
    pub fn new(
        request_name: String,
        source: String,
        payload: Bytes,
        deadline: Instant,
        responder_name: String,
        response_to: mpsc::UnboundedSender<MemberResponse>,
    ) -> Self {
        Self {
            request_name,
            source,
            payload,
            deadline,
            responder_name,
            response_to,
        }
    }

    /// Whether the request's deadline has already passed.
    pub fn closed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Send a response frame back to the requester.
    pub fn respond(&self, payload: Vec<u8>) -> ClusterResult<()> {
        if self.closed() {
            return Err(ClusterError::RequestClosed(self.request_name.clone()));
        }
        self.response_to
            .send(MemberResponse {
                node: self.responder_name.clone(),
                payload: Some(Bytes::from(payload)),
            })
            .map_err(|_| ClusterError::RequestClosed(self.request_name.clone()))
    }
}

impl std::fmt::Debug for RequestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestEvent")
            .field("request_name", &self.request_name)
            .field("source", &self.source)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Events the substrate delivers to the cluster's dispatch loop.
#[derive(Debug)]
pub enum ClusterEvent {
    /// An inbound RPC.
    Request(RequestEvent),
    /// A membership change.
    Member(MemberEvent),
}

/// The response stream of one fan-out request.
///
/// Responses arrive unordered; the stream ends when every target responded,
/// when all in-flight deliveries are dropped, or at the deadline, whichever
/// comes first. Late responses are dropped by the responder side.
pub struct RequestFuture {
    /// Per-member responses, unordered.
    pub responses: mpsc::UnboundedReceiver<MemberResponse>,
    /// Absolute deadline of the request.
    pub deadline: Instant,
}

/// The gossip substrate seen from the gateway cluster.
pub trait Basis: Send + Sync {
    /// This node's name.
    fn node_name(&self) -> &str;

    /// Snapshot of every known member, any status.
    fn members(&self) -> Vec<Member>;

    /// Contact peers and merge member lists; returns how many members the
    /// node is connected to afterwards.
    fn join(&self, peers: &[String]) -> ClusterResult<usize>;

    /// Announce a voluntary departure.
    fn leave(&self) -> ClusterResult<()>;

    /// Tear the substrate down.
    fn stop(&self) -> ClusterResult<()>;

    /// Token cancelled when the substrate stops on its own or via `stop`.
    fn stopped_token(&self) -> CancellationToken;

    /// Ship `payload` to `targets`, collecting responses until `timeout`.
    fn request(
        &self,
        name: &str,
        targets: &[String],
        payload: Vec<u8>,
        timeout: Duration,
    ) -> ClusterResult<RequestFuture>;
}

/// Factory connecting a node to a substrate backend.
pub trait BasisProvider {
    /// Join the substrate under `config`, delivering events to `events`.
    fn connect(
        &self,
        config: BasisConfig,
        events: mpsc::Sender<ClusterEvent>,
    ) -> ClusterResult<Arc<dyn Basis>>;
}
