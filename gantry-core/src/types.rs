//! The cluster data model: operations, members, and node modes.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// The role a node plays inside its group.
///
/// At most one Alive member per group carries [`Mode::Write`]; everyone else
/// is a reader. `Nil` is the zero value used by mode-agnostic queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Mode {
    /// No mode; matches any mode in queries.
    #[default]
    Nil,
    /// The single ordering authority of a group.
    Write,
    /// A replica that pulls and replays the writer's operation log.
    Read,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Nil => write!(f, ""),
            Mode::Write => write!(f, "Write"),
            Mode::Read => write!(f, "Read"),
        }
    }
}

impl FromStr for Mode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Mode::Nil),
            "Write" | "write" => Ok(Mode::Write),
            "Read" | "read" => Ok(Mode::Read),
            other => Err(CoreError::UnknownMode {
                value: other.to_string(),
            }),
        }
    }
}

/// Gossip-inferred liveness of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Responding to the failure detector.
    Alive,
    /// Missed a probe; may come back.
    Suspect,
    /// Declared dead by the failure detector.
    Failed,
    /// Left the cluster voluntarily.
    Left,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberStatus::Alive => "alive",
            MemberStatus::Suspect => "suspect",
            MemberStatus::Failed => "failed",
            MemberStatus::Left => "left",
        };
        write!(f, "{s}")
    }
}

/// The two tags every node advertises through gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberTags {
    /// Replication scope the node belongs to.
    pub group: String,
    /// Writer or reader within that group.
    pub mode: Mode,
}

/// A read-only view of one cluster member, derived from the gossip snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Cluster-unique node name.
    pub name: String,
    /// Advertised address, reachable from peers.
    pub address: String,
    /// Advertised port.
    pub port: u16,
    /// Liveness as seen by the local failure detector.
    pub status: MemberStatus,
    /// The `{group, mode}` tag pair.
    pub tags: MemberTags,
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{}) {} group={} mode={}",
            self.name, self.address, self.port, self.status, self.tags.group, self.tags.mode
        )
    }
}

/// The kind of an administrative operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Register a new plugin.
    CreatePlugin,
    /// Replace an existing plugin's definition.
    UpdatePlugin,
    /// Remove a plugin.
    DeletePlugin,
    /// Register a new pipeline.
    CreatePipeline,
    /// Replace an existing pipeline's definition.
    UpdatePipeline,
    /// Remove a pipeline.
    DeletePipeline,
}

impl OpKind {
    /// Human-readable name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::CreatePlugin => "create_plugin",
            OpKind::UpdatePlugin => "update_plugin",
            OpKind::DeletePlugin => "delete_plugin",
            OpKind::CreatePipeline => "create_pipeline",
            OpKind::UpdatePipeline => "update_pipeline",
            OpKind::DeletePipeline => "delete_pipeline",
        }
    }
}

/// One entry of the administrative operation log.
///
/// Immutable once written. Sequence numbers are 1-based, dense, and assigned
/// by the group's writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Monotonic per-writer sequence number.
    pub seq: u64,
    /// What the operation does to the model.
    pub kind: OpKind,
    /// Opaque payload interpreted by the model layer.
    pub content: Vec<u8>,
    /// Assignment time, nanoseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Operation {
    /// Create an operation stamped with the current time.
    pub fn new(seq: u64, kind: OpKind, content: Vec<u8>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            seq,
            kind,
            content,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_str() {
        for mode in [Mode::Nil, Mode::Write, Mode::Read] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
        assert!("Primary".parse::<Mode>().is_err());
    }

    #[test]
    fn operation_serializes_stably() {
        let op = Operation {
            seq: 7,
            kind: OpKind::UpdatePipeline,
            content: b"pipeline: p1".to_vec(),
            timestamp: 42,
        };
        let json = serde_json::to_vec(&op).unwrap();
        let back: Operation = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, op);
    }
}
