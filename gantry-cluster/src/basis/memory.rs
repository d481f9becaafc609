//! In-process substrate backend.
//!
//! A [`MemoryHub`] connects any number of nodes living in the same process:
//! member snapshots are served from a shared table, requests are delivered
//! straight onto the target's event channel, and liveness transitions are
//! driven explicitly (tests flip them with [`MemoryHub::fail_node`]).

use super::{
    Basis, BasisConfig, BasisProvider, ClusterEvent, MemberEvent, MemberEventKind, RequestEvent,
    RequestFuture,
};
use crate::error::{ClusterError, ClusterResult};
use bytes::Bytes;
use gantry_core::{Member, MemberStatus};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct NodeSlot {
    member: Member,
    events: mpsc::Sender<ClusterEvent>,
    stopped: CancellationToken,
}

#[derive(Default)]
struct HubInner {
    nodes: RwLock<BTreeMap<String, NodeSlot>>,
}

/// A hub connecting in-process nodes.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip a node to `Failed` and notify everyone else, simulating a
    /// failure-detector verdict.
    pub fn fail_node(&self, name: &str) {
        let member = {
            let mut nodes = self.inner.nodes.write();
            let Some(slot) = nodes.get_mut(name) else {
                return;
            };
            slot.member.status = MemberStatus::Failed;
            slot.member.clone()
        };
        self.inner.broadcast(
            name,
            MemberEvent {
                kind: MemberEventKind::Failed,
                member,
            },
        );
    }
}

impl BasisProvider for MemoryHub {
    fn connect(
        &self,
        config: BasisConfig,
        events: mpsc::Sender<ClusterEvent>,
    ) -> ClusterResult<Arc<dyn Basis>> {
        let member = Member {
            name: config.node_name.clone(),
            address: config.advertise_address.clone(),
            port: config.bind_port,
            status: MemberStatus::Alive,
            tags: config.tags.clone(),
        };

        {
            let mut nodes = self.inner.nodes.write();
            if nodes.contains_key(&config.node_name) {
                return Err(ClusterError::Config(format!(
                    "node name {} already joined the hub",
                    config.node_name
                )));
            }
            nodes.insert(
                config.node_name.clone(),
                NodeSlot {
                    member: member.clone(),
                    events,
                    stopped: CancellationToken::new(),
                },
            );
        }

        self.inner.broadcast(
            &config.node_name,
            MemberEvent {
                kind: MemberEventKind::Joined,
                member,
            },
        );

        Ok(Arc::new(MemoryBasis {
            hub: Arc::clone(&self.inner),
            name: config.node_name,
        }))
    }
}

impl HubInner {
    /// Deliver a member event to every node except `origin`.
    fn broadcast(&self, origin: &str, event: MemberEvent) {
        let nodes = self.nodes.read();
        for (name, slot) in nodes.iter() {
            if name == origin || slot.stopped.is_cancelled() {
                continue;
            }
            if slot
                .events
                .try_send(ClusterEvent::Member(event.clone()))
                .is_err()
            {
                warn!(node = %name, "event channel full, dropping member event");
            }
        }
    }

    fn set_status(&self, name: &str, status: MemberStatus) -> Option<Member> {
        let mut nodes = self.nodes.write();
        let slot = nodes.get_mut(name)?;
        slot.member.status = status;
        Some(slot.member.clone())
    }
}

/// One node's handle onto a [`MemoryHub`].
pub struct MemoryBasis {
    hub: Arc<HubInner>,
    name: String,
}

impl Basis for MemoryBasis {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn members(&self) -> Vec<Member> {
        self.hub
            .nodes
            .read()
            .values()
            .map(|slot| slot.member.clone())
            .collect()
    }

    fn join(&self, _peers: &[String]) -> ClusterResult<usize> {
        // Every hub node already sees every other; report the live count.
        let connected = self
            .hub
            .nodes
            .read()
            .values()
            .filter(|s| s.member.status == MemberStatus::Alive)
            .count();
        Ok(connected)
    }

    fn leave(&self) -> ClusterResult<()> {
        if let Some(member) = self.hub.set_status(&self.name, MemberStatus::Left) {
            self.hub.broadcast(
                &self.name,
                MemberEvent {
                    kind: MemberEventKind::Left,
                    member,
                },
            );
        }
        Ok(())
    }

    fn stop(&self) -> ClusterResult<()> {
        let nodes = self.hub.nodes.read();
        if let Some(slot) = nodes.get(&self.name) {
            slot.stopped.cancel();
        }
        Ok(())
    }

    fn stopped_token(&self) -> CancellationToken {
        let nodes = self.hub.nodes.read();
        match nodes.get(&self.name) {
            Some(slot) => slot.stopped.clone(),
            None => CancellationToken::new(),
        }
    }

    fn request(
        &self,
        name: &str,
        targets: &[String],
        payload: Vec<u8>,
        timeout: Duration,
    ) -> ClusterResult<RequestFuture> {
        let deadline = Instant::now() + timeout;
        let (tx, rx) = mpsc::unbounded_channel();
        let payload = Bytes::from(payload);

        let nodes = self.hub.nodes.read();
        let mut delivered: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for target in targets {
            if !delivered.insert(target.as_str()) {
                continue;
            }

            let Some(slot) = nodes.get(target) else {
                debug!(request = %name, node = %target, "request target unknown, it will time out");
                continue;
            };
            if slot.stopped.is_cancelled() {
                debug!(request = %name, node = %target, "request target stopped, it will time out");
                continue;
            }

            let event = RequestEvent::new(
                name.to_string(),
                self.name.clone(),
                payload.clone(),
                deadline,
                target.clone(),
                tx.clone(),
            );
            if slot.events.try_send(ClusterEvent::Request(event)).is_err() {
                warn!(request = %name, node = %target, "event channel full, dropping request");
            }
        }

        Ok(RequestFuture {
            responses: rx,
            deadline,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{MemberTags, Mode};

    fn config(name: &str, group: &str, mode: Mode) -> BasisConfig {
        BasisConfig {
            node_name: name.to_string(),
            bind_address: "10.0.0.1".to_string(),
            bind_port: 9090,
            advertise_address: "10.0.0.1".to_string(),
            udp_buffer_bytes: 4096,
            gossip_interval: Duration::from_millis(200),
            tags: MemberTags {
                group: group.to_string(),
                mode,
            },
        }
    }

    #[tokio::test]
    async fn join_is_observed_by_earlier_members() {
        let hub = MemoryHub::new();
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let _a = hub.connect(config("a", "g1", Mode::Write), tx_a).unwrap();

        let (tx_b, _rx_b) = mpsc::channel(16);
        let _b = hub.connect(config("b", "g1", Mode::Read), tx_b).unwrap();

        match rx_a.recv().await {
            Some(ClusterEvent::Member(ev)) => {
                assert_eq!(ev.kind, MemberEventKind::Joined);
                assert_eq!(ev.member.name, "b");
            }
            other => panic!("expected member event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let hub = MemoryHub::new();
        let (tx, _rx) = mpsc::channel(16);
        hub.connect(config("a", "g1", Mode::Write), tx).unwrap();
        let (tx, _rx) = mpsc::channel(16);
        assert!(hub.connect(config("a", "g1", Mode::Read), tx).is_err());
    }

    #[tokio::test]
    async fn request_reaches_target_and_response_flows_back() {
        let hub = MemoryHub::new();
        let (tx_a, _rx_a) = mpsc::channel(16);
        let a = hub.connect(config("a", "g1", Mode::Write), tx_a).unwrap();
        let (tx_b, mut rx_b) = mpsc::channel(16);
        let _b = hub.connect(config("b", "g1", Mode::Read), tx_b).unwrap();

        let mut future = a
            .request(
                "ping",
                &["b".to_string()],
                vec![9, 1, 2],
                Duration::from_secs(5),
            )
            .unwrap();

        match rx_b.recv().await {
            Some(ClusterEvent::Request(req)) => {
                assert_eq!(req.source, "a");
                assert_eq!(&req.payload[..], &[9, 1, 2]);
                assert!(!req.closed());
                req.respond(vec![42]).unwrap();
            }
            other => panic!("expected request event, got {other:?}"),
        }

        let resp = future.responses.recv().await.unwrap();
        assert_eq!(resp.node, "b");
        assert_eq!(&resp.payload.unwrap()[..], &[42]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_is_rejected() {
        let hub = MemoryHub::new();
        let (tx_a, _rx_a) = mpsc::channel(16);
        let a = hub.connect(config("a", "g1", Mode::Write), tx_a).unwrap();
        let (tx_b, mut rx_b) = mpsc::channel(16);
        let _b = hub.connect(config("b", "g1", Mode::Read), tx_b).unwrap();

        let _future = a
            .request(
                "ping",
                &["b".to_string()],
                vec![1],
                Duration::from_millis(10),
            )
            .unwrap();

        let req = match rx_b.recv().await {
            Some(ClusterEvent::Request(req)) => req,
            other => panic!("expected request event, got {other:?}"),
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(req.closed());
        assert!(req.respond(vec![1]).is_err());
    }
}
