//! Error types for cluster operations.

use thiserror::Error;

/// Result type for cluster operations.
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Configuration rejected at construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// An append skipped ahead of the dense prefix.
    #[error("sequence gap: oplog max is {max_seq}, operation is {seq}")]
    SeqGap {
        /// Sequence carried by the rejected operation.
        seq: u64,
        /// Max sequence of the local log at rejection time.
        max_seq: u64,
    },

    /// An append re-delivered an already-stored sequence.
    #[error("duplicate sequence: oplog max is {max_seq}, operation is {seq}")]
    Duplicate {
        /// Sequence carried by the rejected operation.
        seq: u64,
        /// Max sequence of the local log at rejection time.
        max_seq: u64,
    },

    /// The oplog was used after `close`.
    #[error("oplog is closed")]
    LogClosed,

    /// No alive writer advertises the group.
    #[error("writer doesn't exist in group {0}")]
    NoWriter(String),

    /// The group has no alive member at all.
    #[error("group {0} doesn't have any peer")]
    EmptyGroup(String),

    /// At least one observed group is missing its writer.
    #[error("writer doesn't exist in group {0} (cluster writer set incomplete)")]
    IncompleteWriters(String),

    /// The target node is not registered with the substrate.
    #[error("node {0} is unknown to the substrate")]
    UnknownNode(String),

    /// A single-target request produced no response before its deadline.
    #[error("no response from node {node} for request {request}")]
    NoResponse {
        /// The node queried.
        node: String,
        /// The request name, for logs.
        request: String,
    },

    /// A peer answered with an unexpected frame or an error body.
    #[error("remote error from {node}: {cause}")]
    Remote {
        /// The responding node.
        node: String,
        /// What was wrong with the answer.
        cause: String,
    },

    /// A response was produced after the request's deadline.
    #[error("request {0} closed before the response was sent")]
    RequestClosed(String),

    /// `stop` called twice.
    #[error("already stopped")]
    AlreadyStopped,

    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Oplog storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::DatabaseError> for ClusterError {
    fn from(e: redb::DatabaseError) -> Self {
        ClusterError::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for ClusterError {
    fn from(e: redb::TransactionError) -> Self {
        ClusterError::Storage(e.to_string())
    }
}

impl From<redb::TableError> for ClusterError {
    fn from(e: redb::TableError) -> Self {
        ClusterError::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for ClusterError {
    fn from(e: redb::StorageError) -> Self {
        ClusterError::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for ClusterError {
    fn from(e: redb::CommitError) -> Self {
        ClusterError::Storage(e.to_string())
    }
}
