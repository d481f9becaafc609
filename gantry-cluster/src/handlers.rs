//! Request handlers for the eleven cluster message types.
//!
//! Each accepted request runs in its own task (the dispatcher spawns one per
//! event), decodes its body, acts, and responds with the complementary
//! response frame. Unrecoverable encode failures are logged and swallowed;
//! the requester times out instead of receiving garbage.

use crate::basis::RequestEvent;
use crate::error::{ClusterError, ClusterResult};
use crate::gateway::GatewayCluster;
use crate::gather::{new_response_book, record_resp};
use crate::message::{
    pack_with_header, unpack_body, unpack_response, MessageType, OpLogPullRequest,
    OpLogPullResponse, OperationAck, OperationRequest, QueryGroupResponse, QueryMemberResponse,
    QueryMembersListResponse, QuerySeqResponse, RetrieveRequest, RetrieveResponse, StatRelayResponse,
    StatRequest, StatResponse,
};
use gantry_core::{Member, MemberStatus, MemberTags, Mode, Operation};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Route one accepted request to its handler.
pub(crate) async fn handle(gc: Arc<GatewayCluster>, mt: MessageType, req: RequestEvent) {
    match mt {
        MessageType::QuerySeq => handle_query_seq(&gc, &req),
        MessageType::QueryMember => handle_query_member(&gc, &req),
        MessageType::QueryMembersList => handle_query_members_list(&gc, &req),
        MessageType::QueryGroup => handle_query_group(&gc, &req),
        MessageType::Operation => handle_operation(&gc, &req).await,
        MessageType::OperationRelay => handle_operation_relay(&gc, &req),
        MessageType::Retrieve => handle_retrieve(&gc, &req).await,
        MessageType::RetrieveRelay => handle_retrieve_relay(&gc, &req),
        MessageType::Stat => handle_stat(&gc, &req).await,
        MessageType::StatRelay => handle_stat_relay(&gc, &req),
        MessageType::OpLogPull => handle_oplog_pull(&gc, &req),
    }
}

/// Pack and send a response; pack failures are a local bug, logged and
/// swallowed so the requester times out.
fn respond<T: Serialize>(req: &RequestEvent, mt: MessageType, body: &T) {
    let frame = match pack_with_header(body, mt.response_header()) {
        Ok(frame) => frame,
        Err(e) => {
            error!(request = %req.request_name, error = %e, "BUG: packing a response failed");
            return;
        }
    };
    if let Err(e) = req.respond(frame) {
        warn!(
            request = %req.request_name,
            node = %req.source,
            error = %e,
            "responding to a request failed"
        );
    }
}

fn handle_query_seq(gc: &GatewayCluster, req: &RequestEvent) {
    respond(
        req,
        MessageType::QuerySeq,
        &QuerySeqResponse {
            node: gc.node_name().to_string(),
            group: gc.group().to_string(),
            mode: gc.mode(),
            max_seq: gc.oplog().max_seq(),
        },
    );
}

fn handle_query_member(gc: &GatewayCluster, req: &RequestEvent) {
    let member = self_member(gc);
    respond(
        req,
        MessageType::QueryMember,
        &QueryMemberResponse {
            member,
            max_seq: gc.oplog().max_seq(),
        },
    );
}

fn handle_query_members_list(gc: &GatewayCluster, req: &RequestEvent) {
    respond(
        req,
        MessageType::QueryMembersList,
        &QueryMembersListResponse {
            members: gc.basis.members(),
        },
    );
}

fn handle_query_group(gc: &GatewayCluster, req: &RequestEvent) {
    let members: Vec<Member> = gc
        .basis
        .members()
        .into_iter()
        .filter(|m| m.status == MemberStatus::Alive && m.tags.group == gc.group())
        .collect();
    respond(
        req,
        MessageType::QueryGroup,
        &QueryGroupResponse {
            group: gc.group().to_string(),
            writer: gc.writer_in_group(gc.group()).ok(),
            members,
        },
    );
}

/// Writer side: order, append, apply, then relay to the group's readers.
async fn handle_operation(gc: &Arc<GatewayCluster>, req: &RequestEvent) {
    let request: OperationRequest = match unpack_body(&req.payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(source = %req.source, error = %e, "bad operation request, ignored");
            return;
        }
    };

    let ack = match commit_operation(gc, &request.operation).await {
        Ok(()) => OperationAck {
            node: gc.node_name().to_string(),
            max_seq: gc.oplog().max_seq(),
            error: None,
        },
        Err(e) => {
            warn!(
                source = %req.source,
                seq = request.operation.seq,
                error = %e,
                "operation rejected"
            );
            OperationAck {
                node: gc.node_name().to_string(),
                max_seq: gc.oplog().max_seq(),
                error: Some(e.to_string()),
            }
        }
    };
    respond(req, MessageType::Operation, &ack);
}

/// Append + apply an operation on the writer, then relay it to every alive
/// reader of the group. The local commit stands whatever the relay does;
/// readers that miss it recover through the sync loop.
pub(crate) async fn commit_operation(gc: &GatewayCluster, op: &Operation) -> ClusterResult<()> {
    gc.log.append(op)?;
    if let Err(e) = gc.model.apply(op) {
        // The operation is durable; the model is expected to converge on
        // a later idempotent replay.
        error!(seq = op.seq, error = %e, "model apply failed after append");
    }

    let readers = gc.alive_nodes(Mode::Read, Some(gc.group()));
    if readers.is_empty() {
        return Ok(());
    }

    let frame = pack_with_header(
        &OperationRequest {
            operation: op.clone(),
        },
        MessageType::OperationRelay.header(),
    )?;
    let future = gc.basis.request(
        MessageType::OperationRelay.name(),
        &readers,
        frame,
        gc.config().request_timeout,
    )?;
    let mut book = new_response_book(&readers);
    record_resp(MessageType::OperationRelay.name(), future, &mut book, gc.stop_token()).await;

    for (node, slot) in &book {
        match slot {
            None => warn!(
                node = %node,
                seq = op.seq,
                "reader did not acknowledge the relay, it will catch up by pulling"
            ),
            Some(frame) => match unpack_response::<OperationAck>(node, MessageType::OperationRelay, frame)
            {
                Ok(ack) if ack.error.is_none() && ack.max_seq >= op.seq => {
                    debug!(node = %node, seq = op.seq, "relay acknowledged");
                }
                Ok(ack) => warn!(
                    node = %node,
                    seq = op.seq,
                    ack_max_seq = ack.max_seq,
                    ack_error = ?ack.error,
                    "reader acknowledged the relay behind or with an error"
                ),
                Err(e) => warn!(node = %node, error = %e, "bad relay acknowledgement"),
            },
        }
    }
    Ok(())
}

/// Reader side: append and apply a relayed operation, ack with the local
/// max sequence. Replays of stored sequences are acknowledged as success.
fn handle_operation_relay(gc: &GatewayCluster, req: &RequestEvent) {
    let request: OperationRequest = match unpack_body(&req.payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(source = %req.source, error = %e, "bad operation relay, ignored");
            return;
        }
    };
    let op = request.operation;

    let error = match gc.log.append(&op) {
        Ok(()) => {
            if let Err(e) = gc.model.apply(&op) {
                error!(seq = op.seq, error = %e, "model apply failed after append");
            }
            None
        }
        Err(ClusterError::Duplicate { seq, max_seq }) => {
            debug!(seq, max_seq, "relay replayed an already-stored operation");
            None
        }
        Err(e) => {
            warn!(seq = op.seq, error = %e, "relayed operation rejected");
            Some(e.to_string())
        }
    };

    respond(
        req,
        MessageType::OperationRelay,
        &OperationAck {
            node: gc.node_name().to_string(),
            max_seq: gc.log.max_seq(),
            error,
        },
    );
}

/// Writer side: answer from the local model, then probe the readers'
/// snapshots and log any divergence. The response always carries the
/// writer's own answer.
async fn handle_retrieve(gc: &GatewayCluster, req: &RequestEvent) {
    let request: RetrieveRequest = match unpack_body(&req.payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(source = %req.source, error = %e, "bad retrieve request, ignored");
            return;
        }
    };

    let body = match gc.model.retrieve(&request.query) {
        Ok(payload) => RetrieveResponse {
            payload,
            error: None,
        },
        Err(e) => RetrieveResponse {
            payload: Vec::new(),
            error: Some(e.to_string()),
        },
    };

    if body.error.is_none() {
        probe_reader_snapshots(gc, &request, &body.payload).await;
    }

    respond(req, MessageType::Retrieve, &body);
}

/// Compare the readers' local answers against the writer's; log-only.
async fn probe_reader_snapshots(gc: &GatewayCluster, request: &RetrieveRequest, local: &[u8]) {
    let readers = gc.alive_nodes(Mode::Read, Some(gc.group()));
    if readers.is_empty() {
        return;
    }
    let frame = match pack_with_header(request, MessageType::RetrieveRelay.header()) {
        Ok(frame) => frame,
        Err(e) => {
            error!(error = %e, "BUG: packing a retrieve relay failed");
            return;
        }
    };
    let future = match gc.basis.request(
        MessageType::RetrieveRelay.name(),
        &readers,
        frame,
        gc.config().request_timeout,
    ) {
        Ok(future) => future,
        Err(e) => {
            warn!(error = %e, "retrieve relay failed to start");
            return;
        }
    };
    let mut book = new_response_book(&readers);
    record_resp(MessageType::RetrieveRelay.name(), future, &mut book, gc.stop_token()).await;

    for (node, slot) in &book {
        let Some(frame) = slot else {
            debug!(node = %node, "reader did not answer the retrieve probe");
            continue;
        };
        match unpack_response::<RetrieveResponse>(node, MessageType::RetrieveRelay, frame) {
            Ok(resp) if resp.error.is_none() && resp.payload == local => {}
            Ok(resp) => warn!(
                node = %node,
                error = ?resp.error,
                "reader snapshot differs from the writer, it should converge after the next pull"
            ),
            Err(e) => warn!(node = %node, error = %e, "bad retrieve probe answer"),
        }
    }
}

/// Reader side: answer a retrieve probe from the local model.
fn handle_retrieve_relay(gc: &GatewayCluster, req: &RequestEvent) {
    let request: RetrieveRequest = match unpack_body(&req.payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(source = %req.source, error = %e, "bad retrieve relay, ignored");
            return;
        }
    };
    let body = match gc.model.retrieve(&request.query) {
        Ok(payload) => RetrieveResponse {
            payload,
            error: None,
        },
        Err(e) => RetrieveResponse {
            payload: Vec::new(),
            error: Some(e.to_string()),
        },
    };
    respond(req, MessageType::RetrieveRelay, &body);
}

/// Gather per-node statistics across the group, local node included.
pub(crate) async fn aggregate_group_stat(
    gc: &GatewayCluster,
    query: &[u8],
) -> ClusterResult<BTreeMap<String, Option<Vec<u8>>>> {
    let mut stats = BTreeMap::new();

    match gc.model.stat(query) {
        Ok(payload) => {
            stats.insert(gc.node_name().to_string(), Some(payload));
        }
        Err(e) => {
            error!(error = %e, "local stat failed");
            stats.insert(gc.node_name().to_string(), None);
        }
    }

    let others: Vec<String> = gc
        .rest_alive_members_in_same_group()
        .into_iter()
        .map(|m| m.name)
        .collect();
    if others.is_empty() {
        return Ok(stats);
    }

    let frame = pack_with_header(
        &StatRequest {
            query: query.to_vec(),
        },
        MessageType::StatRelay.header(),
    )?;
    let future = gc.basis.request(
        MessageType::StatRelay.name(),
        &others,
        frame,
        gc.config().request_timeout,
    )?;
    let mut book = new_response_book(&others);
    record_resp(MessageType::StatRelay.name(), future, &mut book, gc.stop_token()).await;

    for (node, slot) in book {
        let value = slot.and_then(|frame| {
            match unpack_response::<StatRelayResponse>(&node, MessageType::StatRelay, &frame) {
                Ok(resp) if resp.error.is_none() => Some(resp.payload),
                Ok(resp) => {
                    warn!(node = %node, error = ?resp.error, "member stat failed");
                    None
                }
                Err(e) => {
                    warn!(node = %node, error = %e, "bad stat relay answer");
                    None
                }
            }
        });
        stats.insert(node, value);
    }
    Ok(stats)
}

/// Any node: aggregate group statistics and answer the requester.
async fn handle_stat(gc: &GatewayCluster, req: &RequestEvent) {
    let request: StatRequest = match unpack_body(&req.payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(source = %req.source, error = %e, "bad stat request, ignored");
            return;
        }
    };
    match aggregate_group_stat(gc, &request.query).await {
        Ok(stats) => respond(req, MessageType::Stat, &StatResponse { stats }),
        Err(e) => {
            error!(error = %e, "stat aggregation failed");
        }
    }
}

/// Any node: answer local statistics.
fn handle_stat_relay(gc: &GatewayCluster, req: &RequestEvent) {
    let request: StatRequest = match unpack_body(&req.payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(source = %req.source, error = %e, "bad stat relay, ignored");
            return;
        }
    };
    let body = match gc.model.stat(&request.query) {
        Ok(payload) => StatRelayResponse {
            payload,
            error: None,
        },
        Err(e) => StatRelayResponse {
            payload: Vec::new(),
            error: Some(e.to_string()),
        },
    };
    respond(req, MessageType::StatRelay, &body);
}

/// Any node: serve a range of the local oplog.
fn handle_oplog_pull(gc: &GatewayCluster, req: &RequestEvent) {
    let request: OpLogPullRequest = match unpack_body(&req.payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(source = %req.source, error = %e, "bad oplog pull, ignored");
            return;
        }
    };
    match gc.log.read_since(request.since, request.max_count) {
        Ok(operations) => {
            respond(req, MessageType::OpLogPull, &OpLogPullResponse { operations });
        }
        Err(e) => {
            // No response; the puller times out and retries next tick.
            error!(
                since = request.since,
                max_count = request.max_count,
                error = %e,
                "reading the oplog for a pull failed"
            );
        }
    }
}

fn self_member(gc: &GatewayCluster) -> Member {
    gc.basis
        .members()
        .into_iter()
        .find(|m| m.name == gc.node_name())
        .unwrap_or_else(|| Member {
            name: gc.node_name().to_string(),
            address: String::new(),
            port: 0,
            status: MemberStatus::Alive,
            tags: MemberTags {
                group: gc.group().to_string(),
                mode: gc.mode(),
            },
        })
}
