//! The gateway cluster: membership queries, the dispatch loop, and the
//! public operation/retrieve/stat surface.

use crate::basis::{
    Basis, BasisConfig, BasisProvider, ClusterEvent, MemberEvent, MemberEventKind, RequestEvent,
};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::gather::{new_response_book, record_resp};
use crate::handlers;
use crate::message::{
    pack_with_header, unpack_response, MessageType, OperationAck, OperationRequest,
    QuerySeqResponse, RetrieveRequest, RetrieveResponse,
};
use crate::model::Model;
use crate::oplog::OpLog;
use crate::sync;
use bytes::Bytes;
use gantry_core::{HostOptions, Member, MemberStatus, MemberTags, Mode, OpKind, Operation};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Port the gossip substrate binds and advertises.
const GOSSIP_PORT: u16 = 9099;

/// Capacity of the substrate event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Advertise addresses peers can never reach.
const UNREACHABLE_ADDRESSES: [&str; 5] = ["127.0.0.1", "localhost", "0.0.0.0", "::", "::1"];

/// One node of the gateway coordination cluster.
///
/// Construction joins the substrate, opens the oplog, and spawns the
/// background loops (dispatch, substrate watchdog, and, on readers, the
/// oplog sync loop). All of them exit promptly when [`stop`](Self::stop) is
/// called. Must be created inside a tokio runtime.
pub struct GatewayCluster {
    pub(crate) conf: ClusterConfig,
    pub(crate) model: Arc<dyn Model>,
    pub(crate) basis: Arc<dyn Basis>,
    pub(crate) log: Arc<OpLog>,
    pub(crate) mode: Mode,
    pub(crate) stop: CancellationToken,
    pub(crate) sync_oplog_lock: tokio::sync::Mutex<()>,
    stopped: RwLock<bool>,
}

impl std::fmt::Debug for GatewayCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayCluster")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl GatewayCluster {
    /// Join the cluster and start serving.
    pub fn new(
        conf: ClusterConfig,
        options: &HostOptions,
        model: Arc<dyn Model>,
        provider: &dyn BasisProvider,
    ) -> ClusterResult<Arc<Self>> {
        conf.validate()?;

        if UNREACHABLE_ADDRESSES.contains(&options.cluster_host.as_str()) {
            return Err(ClusterError::Config(format!(
                "invalid advertise address {}, it should be reachable from peers",
                options.cluster_host
            )));
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let basis_conf = BasisConfig {
            node_name: conf.member_name.clone(),
            bind_address: options.cluster_host.clone(),
            bind_port: GOSSIP_PORT,
            advertise_address: options.cluster_host.clone(),
            udp_buffer_bytes: options.packet_buffer_bytes,
            gossip_interval: options.gossip_interval,
            tags: MemberTags {
                group: conf.group.clone(),
                mode: conf.member_mode,
            },
        };
        let basis = provider.connect(basis_conf, event_tx)?;
        let log = Arc::new(OpLog::open(&options.oplog_dir())?);

        let gc = Arc::new(Self {
            mode: conf.member_mode,
            conf,
            model,
            basis,
            log,
            stop: CancellationToken::new(),
            sync_oplog_lock: tokio::sync::Mutex::new(()),
            stopped: RwLock::new(false),
        });

        // If the substrate dies underneath us there is nothing left to serve.
        let watchdog = Arc::clone(&gc);
        tokio::spawn(async move {
            let basis_stopped = watchdog.basis.stopped_token();
            tokio::select! {
                _ = watchdog.stop.cancelled() => {}
                _ = basis_stopped.cancelled() => {
                    warn!("stopping the gateway cluster internally, the substrate is gone");
                    let _ = watchdog.internal_stop(false);
                }
            }
        });

        let dispatcher = Arc::clone(&gc);
        tokio::spawn(async move { dispatcher.dispatch(event_rx).await });

        if !gc.conf.peers.is_empty() {
            info!(
                total = gc.conf.peers.len(),
                peers = %gc.conf.peers.join(", "),
                "joining peer members"
            );
            match gc.basis.join(&gc.conf.peers) {
                Ok(connected) => info!(connected, "peer members joined"),
                Err(e) => error!(error = %e, "joining peer members failed"),
            }
        }

        if gc.mode == Mode::Read {
            let syncer = Arc::clone(&gc);
            tokio::spawn(async move { sync::sync_oplog_loop(syncer).await });
        }

        Ok(gc)
    }

    /// This node's name.
    pub fn node_name(&self) -> &str {
        &self.conf.member_name
    }

    /// This node's mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// This node's group.
    pub fn group(&self) -> &str {
        &self.conf.group
    }

    /// The node-local operation log.
    pub fn oplog(&self) -> &OpLog {
        &self.log
    }

    /// The cluster configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.conf
    }

    pub(crate) fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Stop the node: leave the substrate, stop it, and close the oplog.
    ///
    /// Idempotent in effect; a second call reports `AlreadyStopped`.
    pub fn stop(&self) -> ClusterResult<()> {
        self.internal_stop(true)
    }

    fn internal_stop(&self, stop_basis: bool) -> ClusterResult<()> {
        let mut stopped = self.stopped.write();
        if *stopped {
            return Err(ClusterError::AlreadyStopped);
        }

        self.stop.cancel();

        if stop_basis {
            self.basis.leave()?;
            self.basis.stop()?;
        }

        self.log.close()?;

        *stopped = true;
        Ok(())
    }

    /// Whether the node has been stopped.
    pub fn is_stopped(&self) -> bool {
        *self.stopped.read()
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    async fn dispatch(self: Arc<Self>, mut events: mpsc::Receiver<ClusterEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.stop.cancelled() => break,
                ev = events.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            match event {
                ClusterEvent::Request(req) => self.dispatch_request(req),
                ClusterEvent::Member(ev) => log_member_event(&ev),
            }
        }
        debug!(node = %self.node_name(), "dispatch loop stopped");
    }

    fn dispatch_request(self: &Arc<Self>, req: RequestEvent) {
        if req.payload.is_empty() {
            return;
        }

        if req.closed() {
            warn!(
                node = %self.node_name(),
                request = %req.request_name,
                "received a closed request, it arrives too late, ignored"
            );
            return;
        }

        let Some(mt) = MessageType::from_header(req.payload[0]) else {
            warn!(
                node = %self.node_name(),
                header = req.payload[0],
                "received a request with an unknown message type, ignored"
            );
            return;
        };

        // Writer-only and reader-only messages landing on the wrong mode are
        // a peer bug; drop them without a response.
        match mt {
            MessageType::Operation | MessageType::Retrieve if self.mode != Mode::Write => {
                error!(
                    message = mt.name(),
                    "BUG: member with read mode received a writer-only message"
                );
                return;
            }
            MessageType::OperationRelay | MessageType::RetrieveRelay
                if self.mode != Mode::Read =>
            {
                error!(
                    message = mt.name(),
                    "BUG: member with write mode received a reader-only message"
                );
                return;
            }
            _ => {}
        }

        debug!(node = %self.node_name(), message = mt.name(), source = %req.source, "received message");

        let gc = Arc::clone(self);
        tokio::spawn(async move { handlers::handle(gc, mt, req).await });
    }

    // ---------------------------------------------------------------------
    // Membership queries (all filter on Alive)
    // ---------------------------------------------------------------------

    fn alive_members(&self) -> Vec<Member> {
        self.basis
            .members()
            .into_iter()
            .filter(|m| m.status == MemberStatus::Alive)
            .collect()
    }

    /// The alive writer of `group`.
    ///
    /// Two alive writers in one group is an operator error; the query warns
    /// and proceeds with the first by sorted node name.
    pub fn writer_in_group(&self, group: &str) -> ClusterResult<String> {
        let mut writers: Vec<String> = self
            .alive_members()
            .into_iter()
            .filter(|m| m.tags.group == group && m.tags.mode == Mode::Write)
            .map(|m| m.name)
            .collect();
        writers.sort();
        match writers.len() {
            0 => Err(ClusterError::NoWriter(group.to_string())),
            1 => Ok(writers.remove(0)),
            _ => {
                warn!(
                    group = %group,
                    writers = ?writers,
                    "multiple alive writers in one group, proceeding with the first by name"
                );
                Ok(writers.remove(0))
            }
        }
    }

    /// An alive peer of `group`, preferring the writer.
    pub fn choose_peer_for_group(&self, group: &str) -> ClusterResult<String> {
        if let Ok(writer) = self.writer_in_group(group) {
            return Ok(writer);
        }
        let mut candidates: Vec<String> = self
            .alive_members()
            .into_iter()
            .filter(|m| m.tags.group == group)
            .map(|m| m.name)
            .collect();
        candidates.sort();
        candidates
            .into_iter()
            .next()
            .ok_or_else(|| ClusterError::EmptyGroup(group.to_string()))
    }

    /// One alive writer per observed group; fails naming the first group
    /// without one.
    pub fn writers_in_every_group(&self) -> ClusterResult<Vec<String>> {
        let mut groups: BTreeSet<String> = BTreeSet::new();
        let mut writers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for member in self.alive_members() {
            groups.insert(member.tags.group.clone());
            if member.tags.mode == Mode::Write {
                writers.entry(member.tags.group).or_default().push(member.name);
            }
        }

        let mut nodes = Vec::with_capacity(groups.len());
        for group in groups {
            match writers.get_mut(&group) {
                None => return Err(ClusterError::IncompleteWriters(group)),
                Some(names) => {
                    names.sort();
                    if names.len() > 1 {
                        warn!(
                            group = %group,
                            writers = ?names,
                            "multiple alive writers in one group, proceeding with the first by name"
                        );
                    }
                    nodes.push(names[0].clone());
                }
            }
        }
        Ok(nodes)
    }

    /// Alive node names matching `mode` (`Mode::Nil` matches all) and
    /// `group` (`None` matches all), sorted ascending.
    pub fn alive_nodes(&self, mode: Mode, group: Option<&str>) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .alive_members()
            .into_iter()
            .filter(|m| mode == Mode::Nil || m.tags.mode == mode)
            .filter(|m| group.is_none_or(|g| m.tags.group == g))
            .map(|m| m.name)
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    /// Every group with at least one alive member, sorted ascending.
    pub fn groups_in_cluster(&self) -> Vec<String> {
        let groups: BTreeSet<String> = self
            .alive_members()
            .into_iter()
            .map(|m| m.tags.group)
            .collect();
        groups.into_iter().collect()
    }

    /// Alive members of this node's group, excluding this node.
    pub fn rest_alive_members_in_same_group(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .alive_members()
            .into_iter()
            .filter(|m| m.tags.group == self.conf.group && m.name != self.conf.member_name)
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    // ---------------------------------------------------------------------
    // Requests
    // ---------------------------------------------------------------------

    /// Ship a frame to one node and wait for its single response.
    pub(crate) async fn request_single(
        &self,
        mt: MessageType,
        target: &str,
        frame: Vec<u8>,
        timeout: Duration,
    ) -> ClusterResult<Bytes> {
        let targets = [target.to_string()];
        let future = self.basis.request(mt.name(), &targets, frame, timeout)?;
        let mut book = new_response_book(&targets);
        record_resp(mt.name(), future, &mut book, &self.stop).await;
        book.remove(target)
            .flatten()
            .ok_or_else(|| ClusterError::NoResponse {
                node: target.to_string(),
                request: mt.name().to_string(),
            })
    }

    /// Ask `target` for its oplog max sequence.
    pub(crate) async fn query_max_seq(&self, target: &str) -> ClusterResult<u64> {
        let frame = vec![MessageType::QuerySeq.header()];
        let resp = self
            .request_single(MessageType::QuerySeq, target, frame, self.conf.request_timeout)
            .await?;
        let body: QuerySeqResponse = unpack_response(target, MessageType::QuerySeq, &resp)?;
        Ok(body.max_seq)
    }

    // ---------------------------------------------------------------------
    // Public operation surface
    // ---------------------------------------------------------------------

    /// Issue an administrative operation.
    ///
    /// On the writer this orders, appends, applies, and relays the operation
    /// directly; on a reader it is forwarded to the group's writer. Returns
    /// the committed sequence.
    pub async fn issue_operation(&self, kind: OpKind, content: Vec<u8>) -> ClusterResult<u64> {
        match self.mode {
            Mode::Write => {
                let op = Operation::new(self.log.max_seq() + 1, kind, content);
                handlers::commit_operation(self, &op).await?;
                Ok(op.seq)
            }
            Mode::Read => {
                let writer = self.writer_in_group(&self.conf.group)?;
                let writer_max = self.query_max_seq(&writer).await?;
                let op = Operation::new(writer_max + 1, kind, content);
                let seq = op.seq;
                let frame = pack_with_header(
                    &OperationRequest { operation: op },
                    MessageType::Operation.header(),
                )?;
                let resp = self
                    .request_single(
                        MessageType::Operation,
                        &writer,
                        frame,
                        self.conf.request_timeout,
                    )
                    .await?;
                let ack: OperationAck = unpack_response(&writer, MessageType::Operation, &resp)?;
                if let Some(cause) = ack.error {
                    return Err(ClusterError::Remote { node: writer, cause });
                }
                Ok(seq)
            }
            Mode::Nil => Err(ClusterError::Config("node has no mode".to_string())),
        }
    }

    /// Answer a read-only model query from the authoritative snapshot.
    pub async fn retrieve(&self, query: &[u8]) -> ClusterResult<Vec<u8>> {
        if self.mode == Mode::Write {
            return self.model.retrieve(query);
        }

        let writer = self.writer_in_group(&self.conf.group)?;
        let frame = pack_with_header(
            &RetrieveRequest {
                query: query.to_vec(),
            },
            MessageType::Retrieve.header(),
        )?;
        let resp = self
            .request_single(
                MessageType::Retrieve,
                &writer,
                frame,
                self.conf.request_timeout,
            )
            .await?;
        let body: RetrieveResponse = unpack_response(&writer, MessageType::Retrieve, &resp)?;
        match body.error {
            Some(cause) => Err(ClusterError::Remote { node: writer, cause }),
            None => Ok(body.payload),
        }
    }

    /// Aggregate statistics across the group.
    ///
    /// Slots of members that did not answer before the deadline are `None`;
    /// callers proceed with the partial result.
    pub async fn stat(
        &self,
        query: &[u8],
    ) -> ClusterResult<BTreeMap<String, Option<Vec<u8>>>> {
        handlers::aggregate_group_stat(self, query).await
    }
}

fn log_member_event(ev: &MemberEvent) {
    match ev.kind {
        MemberEventKind::Joined => info!(member = %ev.member, "member joined the cluster"),
        MemberEventKind::Left => info!(member = %ev.member, "member left the cluster"),
        MemberEventKind::Failed => warn!(member = %ev.member, "member failed in the cluster"),
        MemberEventKind::Updated => info!(member = %ev.member, "member updated in the cluster"),
        MemberEventKind::Cleaned => debug!(member = %ev.member, "member record cleaned up"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::memory::MemoryHub;
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct NullModel;

    impl Model for NullModel {
        fn apply(&self, _op: &Operation) -> ClusterResult<()> {
            Ok(())
        }
        fn retrieve(&self, _query: &[u8]) -> ClusterResult<Vec<u8>> {
            Ok(Vec::new())
        }
        fn stat(&self, _query: &[u8]) -> ClusterResult<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn node(
        hub: &MemoryHub,
        name: &str,
        group: &str,
        mode: Mode,
    ) -> (Arc<GatewayCluster>, TempDir) {
        let dir = TempDir::new().unwrap();
        let conf = ClusterConfig::builder()
            .group(group)
            .member_mode(mode)
            .member_name(name)
            .build()
            .unwrap();
        let options = HostOptions {
            cluster_host: "10.1.0.1".to_string(),
            inventory_home: dir.path().to_path_buf(),
            ..HostOptions::default()
        };
        let gc = GatewayCluster::new(conf, &options, Arc::new(NullModel), hub).unwrap();
        (gc, dir)
    }

    #[tokio::test]
    async fn construction_rejects_loopback_advertise() {
        let hub = MemoryHub::new();
        let dir = TempDir::new().unwrap();
        let conf = ClusterConfig::builder()
            .group("g1")
            .member_mode(Mode::Write)
            .member_name("w0")
            .build()
            .unwrap();
        let options = HostOptions {
            cluster_host: "127.0.0.1".to_string(),
            inventory_home: dir.path().to_path_buf(),
            ..HostOptions::default()
        };
        let err = GatewayCluster::new(conf, &options, Arc::new(NullModel), &hub).unwrap_err();
        assert!(err.to_string().contains("advertise address"));
    }

    #[tokio::test]
    async fn membership_queries_filter_and_sort() {
        let hub = MemoryHub::new();
        let (w1, _d1) = node(&hub, "g1-writer", "g1", Mode::Write);
        let (_r1, _d2) = node(&hub, "g1-reader-b", "g1", Mode::Read);
        let (_r2, _d3) = node(&hub, "g1-reader-a", "g1", Mode::Read);
        let (_w2, _d4) = node(&hub, "g2-writer", "g2", Mode::Write);

        assert_eq!(w1.writer_in_group("g1").unwrap(), "g1-writer");
        assert_eq!(w1.writer_in_group("g2").unwrap(), "g2-writer");
        assert!(matches!(
            w1.writer_in_group("g3"),
            Err(ClusterError::NoWriter(_))
        ));

        assert_eq!(
            w1.alive_nodes(Mode::Read, Some("g1")),
            vec!["g1-reader-a".to_string(), "g1-reader-b".to_string()]
        );
        assert_eq!(
            w1.alive_nodes(Mode::Nil, None),
            vec![
                "g1-reader-a".to_string(),
                "g1-reader-b".to_string(),
                "g1-writer".to_string(),
                "g2-writer".to_string()
            ]
        );

        assert_eq!(w1.groups_in_cluster(), vec!["g1".to_string(), "g2".to_string()]);
        assert_eq!(
            w1.writers_in_every_group().unwrap(),
            vec!["g1-writer".to_string(), "g2-writer".to_string()]
        );

        let rest: Vec<String> = w1
            .rest_alive_members_in_same_group()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(rest, vec!["g1-reader-a".to_string(), "g1-reader-b".to_string()]);
    }

    #[tokio::test]
    async fn choose_peer_prefers_writer_then_any_member() {
        let hub = MemoryHub::new();
        let (w1, _d1) = node(&hub, "w0", "g1", Mode::Write);
        let (_r1, _d2) = node(&hub, "r0", "g1", Mode::Read);
        let (_r2, _d3) = node(&hub, "r-only", "g2", Mode::Read);

        assert_eq!(w1.choose_peer_for_group("g1").unwrap(), "w0");
        assert_eq!(w1.choose_peer_for_group("g2").unwrap(), "r-only");
        assert!(matches!(
            w1.choose_peer_for_group("g9"),
            Err(ClusterError::EmptyGroup(_))
        ));
    }

    #[tokio::test]
    async fn two_writers_resolve_to_first_by_name() {
        let hub = MemoryHub::new();
        let (w1, _d1) = node(&hub, "writer-b", "g1", Mode::Write);
        let (_w2, _d2) = node(&hub, "writer-a", "g1", Mode::Write);

        // Assert-and-proceed: the first by sorted name wins.
        assert_eq!(w1.writer_in_group("g1").unwrap(), "writer-a");
    }

    #[tokio::test]
    async fn failed_members_disappear_from_queries() {
        let hub = MemoryHub::new();
        let (w1, _d1) = node(&hub, "w0", "g1", Mode::Write);
        let (_r1, _d2) = node(&hub, "r0", "g1", Mode::Read);

        assert_eq!(w1.alive_nodes(Mode::Read, Some("g1")).len(), 1);
        hub.fail_node("r0");
        assert!(w1.alive_nodes(Mode::Read, Some("g1")).is_empty());
        assert!(w1.rest_alive_members_in_same_group().is_empty());
    }

    #[tokio::test]
    async fn stop_is_guarded_against_double_calls() {
        let hub = MemoryHub::new();
        let (w1, _d1) = node(&hub, "w0", "g1", Mode::Write);

        assert!(!w1.is_stopped());
        w1.stop().unwrap();
        assert!(w1.is_stopped());
        assert!(matches!(w1.stop(), Err(ClusterError::AlreadyStopped)));
    }

    #[tokio::test]
    async fn writer_issues_and_retrieves_locally() {
        let hub = MemoryHub::new();

        struct RecordingModel {
            applied: parking_lot::Mutex<Vec<u64>>,
        }
        impl Model for RecordingModel {
            fn apply(&self, op: &Operation) -> ClusterResult<()> {
                self.applied.lock().push(op.seq);
                Ok(())
            }
            fn retrieve(&self, query: &[u8]) -> ClusterResult<Vec<u8>> {
                Ok(query.to_vec())
            }
            fn stat(&self, _query: &[u8]) -> ClusterResult<Vec<u8>> {
                Ok(b"stat".to_vec())
            }
        }

        let dir = TempDir::new().unwrap();
        let conf = ClusterConfig::builder()
            .group("g1")
            .member_mode(Mode::Write)
            .member_name("w0")
            .build()
            .unwrap();
        let options = HostOptions {
            cluster_host: "10.1.0.1".to_string(),
            inventory_home: dir.path().to_path_buf(),
            ..HostOptions::default()
        };
        let model = Arc::new(RecordingModel {
            applied: parking_lot::Mutex::new(Vec::new()),
        });
        let gc = GatewayCluster::new(conf, &options, model.clone(), &hub).unwrap();

        let seq = gc
            .issue_operation(OpKind::CreatePlugin, b"p1".to_vec())
            .await
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(gc.oplog().max_seq(), 1);
        assert_eq!(*model.applied.lock(), vec![1]);

        assert_eq!(gc.retrieve(b"q").await.unwrap(), b"q".to_vec());

        let stats = gc.stat(b"s").await.unwrap();
        let own: HashMap<_, _> = stats.into_iter().collect();
        assert_eq!(own["w0"], Some(b"stat".to_vec()));
    }
}
