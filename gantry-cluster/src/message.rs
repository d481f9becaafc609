//! Wire messages exchanged between cluster members.
//!
//! Every frame is `[header: u8] ++ body`, where the body is JSON. Request
//! headers are the fixed codes 1 through 11; a response reuses its request's
//! header with the high bit set, so the two directions stay distinguishable
//! in captures while the request codes remain stable on the wire.

use crate::error::{ClusterError, ClusterResult};
use gantry_core::{Member, Mode, Operation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// High bit marking a response frame.
pub const RESPONSE_FLAG: u8 = 0x80;

/// The eleven request message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Ask a node for its oplog max sequence.
    QuerySeq = 1,
    /// Ask a node for its own member view.
    QueryMember = 2,
    /// Ask a node for its full member list.
    QueryMembersList = 3,
    /// Ask a node for its group roster.
    QueryGroup = 4,
    /// Submit an ordered operation; writers only.
    Operation = 5,
    /// Writer-to-reader replication of a committed operation; readers only.
    OperationRelay = 6,
    /// Read the authoritative model state; writers only.
    Retrieve = 7,
    /// Writer-to-reader consistency probe of a retrieve; readers only.
    RetrieveRelay = 8,
    /// Aggregate statistics across the group.
    Stat = 9,
    /// Answer local statistics for an aggregation.
    StatRelay = 10,
    /// Pull a range of operations from a peer's oplog.
    OpLogPull = 11,
}

impl MessageType {
    /// Decode a request header byte.
    pub fn from_header(b: u8) -> Option<Self> {
        Some(match b {
            1 => MessageType::QuerySeq,
            2 => MessageType::QueryMember,
            3 => MessageType::QueryMembersList,
            4 => MessageType::QueryGroup,
            5 => MessageType::Operation,
            6 => MessageType::OperationRelay,
            7 => MessageType::Retrieve,
            8 => MessageType::RetrieveRelay,
            9 => MessageType::Stat,
            10 => MessageType::StatRelay,
            11 => MessageType::OpLogPull,
            _ => return None,
        })
    }

    /// The request header byte.
    pub fn header(self) -> u8 {
        self as u8
    }

    /// The header byte of this request's response frame.
    pub fn response_header(self) -> u8 {
        self as u8 | RESPONSE_FLAG
    }

    /// Request name used in logs and substrate bookkeeping.
    pub fn name(self) -> &'static str {
        match self {
            MessageType::QuerySeq => "query_seq",
            MessageType::QueryMember => "query_member",
            MessageType::QueryMembersList => "query_members_list",
            MessageType::QueryGroup => "query_group",
            MessageType::Operation => "operation",
            MessageType::OperationRelay => "operation_relay",
            MessageType::Retrieve => "retrieve",
            MessageType::RetrieveRelay => "retrieve_relay",
            MessageType::Stat => "stat",
            MessageType::StatRelay => "stat_relay",
            MessageType::OpLogPull => "oplog_pull",
        }
    }
}

/// Body of a `QuerySeq` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySeqResponse {
    /// Responding node.
    pub node: String,
    /// Responding node's group.
    pub group: String,
    /// Responding node's mode.
    pub mode: Mode,
    /// Max sequence of the responder's oplog.
    pub max_seq: u64,
}

/// Body of a `QueryMember` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMemberResponse {
    /// The responder's view of itself.
    pub member: Member,
    /// Max sequence of the responder's oplog.
    pub max_seq: u64,
}

/// Body of a `QueryMembersList` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMembersListResponse {
    /// Every member the responder knows about, any status.
    pub members: Vec<Member>,
}

/// Body of a `QueryGroup` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryGroupResponse {
    /// The responder's group.
    pub group: String,
    /// The group's writer, when one is alive.
    pub writer: Option<String>,
    /// Alive members of the group.
    pub members: Vec<Member>,
}

/// Body of an `Operation` or `OperationRelay` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    /// The sequenced operation.
    pub operation: Operation,
}

/// Acknowledgement for `Operation` and `OperationRelay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationAck {
    /// Acknowledging node.
    pub node: String,
    /// The acknowledging node's oplog max sequence after handling.
    pub max_seq: u64,
    /// Set when the operation was rejected.
    pub error: Option<String>,
}

/// Body of a `Retrieve` or `RetrieveRelay` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveRequest {
    /// Opaque model query.
    pub query: Vec<u8>,
}

/// Body of a `Retrieve` or `RetrieveRelay` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveResponse {
    /// Model answer; empty on error.
    pub payload: Vec<u8>,
    /// Set when the model rejected the query.
    pub error: Option<String>,
}

/// Body of a `Stat` or `StatRelay` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatRequest {
    /// Opaque statistics query.
    pub query: Vec<u8>,
}

/// Body of a `StatRelay` response: one node's local statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatRelayResponse {
    /// Local statistics payload.
    pub payload: Vec<u8>,
    /// Set when local statistics could not be produced.
    pub error: Option<String>,
}

/// Body of a `Stat` response: statistics aggregated across the group.
///
/// Missing entries are `None`, meaning the member did not answer in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatResponse {
    /// Per-node statistics payloads.
    pub stats: BTreeMap<String, Option<Vec<u8>>>,
}

/// Body of an `OpLogPull` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpLogPullRequest {
    /// First sequence wanted.
    pub since: u64,
    /// Maximum number of operations to return.
    pub max_count: u64,
}

/// Body of an `OpLogPull` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpLogPullResponse {
    /// Operations in ascending sequence order.
    pub operations: Vec<Operation>,
}

/// Encode `body` behind a one-byte header.
pub fn pack_with_header<T: Serialize>(body: &T, header: u8) -> ClusterResult<Vec<u8>> {
    let mut buf = vec![header];
    serde_json::to_writer(&mut buf, body)?;
    Ok(buf)
}

/// Decode the body of a frame, ignoring its header byte.
pub fn unpack_body<T: DeserializeOwned>(frame: &[u8]) -> ClusterResult<T> {
    if frame.is_empty() {
        return Err(ClusterError::Storage("empty frame".to_string()));
    }
    Ok(serde_json::from_slice(&frame[1..])?)
}

/// Decode a response frame, checking its header matches the request type.
pub fn unpack_response<T: DeserializeOwned>(
    node: &str,
    mt: MessageType,
    frame: &[u8],
) -> ClusterResult<T> {
    match frame.first() {
        None => Err(ClusterError::Remote {
            node: node.to_string(),
            cause: "empty response frame".to_string(),
        }),
        Some(&h) if h != mt.response_header() => Err(ClusterError::Remote {
            node: node.to_string(),
            cause: format!(
                "unexpected response header {h:#04x} for request {}",
                mt.name()
            ),
        }),
        Some(_) => unpack_body(frame),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::OpKind;

    #[test]
    fn header_codes_are_stable() {
        let expected: [(MessageType, u8); 11] = [
            (MessageType::QuerySeq, 1),
            (MessageType::QueryMember, 2),
            (MessageType::QueryMembersList, 3),
            (MessageType::QueryGroup, 4),
            (MessageType::Operation, 5),
            (MessageType::OperationRelay, 6),
            (MessageType::Retrieve, 7),
            (MessageType::RetrieveRelay, 8),
            (MessageType::Stat, 9),
            (MessageType::StatRelay, 10),
            (MessageType::OpLogPull, 11),
        ];
        for (mt, code) in expected {
            assert_eq!(mt.header(), code);
            assert_eq!(MessageType::from_header(code), Some(mt));
            assert_eq!(mt.response_header(), code | RESPONSE_FLAG);
        }
        assert_eq!(MessageType::from_header(0), None);
        assert_eq!(MessageType::from_header(12), None);
    }

    #[test]
    fn pack_then_unpack_checks_headers() {
        let req = OpLogPullRequest {
            since: 4,
            max_count: 2,
        };
        let frame = pack_with_header(&req, MessageType::OpLogPull.header()).unwrap();
        assert_eq!(frame[0], 11);
        let back: OpLogPullRequest = unpack_body(&frame).unwrap();
        assert_eq!(back.since, 4);

        let resp = OpLogPullResponse {
            operations: vec![Operation::new(4, OpKind::CreatePlugin, vec![1, 2])],
        };
        let frame =
            pack_with_header(&resp, MessageType::OpLogPull.response_header()).unwrap();
        let ok: ClusterResult<OpLogPullResponse> =
            unpack_response("w0", MessageType::OpLogPull, &frame);
        assert_eq!(ok.unwrap().operations.len(), 1);

        // A frame answering the wrong request type is rejected.
        let err: ClusterResult<OpLogPullResponse> =
            unpack_response("w0", MessageType::QuerySeq, &frame);
        assert!(err.is_err());
    }
}
