//! The model collaborator contract.

use crate::error::ClusterResult;
use gantry_core::Operation;

/// The state the cluster replicates operations into.
///
/// The model lives outside this crate; the cluster only drives it. `apply`
/// must be idempotent with respect to `op.seq`; replication is
/// at-least-once, and a reader replays duplicates during recovery.
pub trait Model: Send + Sync {
    /// Apply one ordered operation.
    fn apply(&self, op: &Operation) -> ClusterResult<()>;

    /// Answer a read-only query against the current state.
    fn retrieve(&self, query: &[u8]) -> ClusterResult<Vec<u8>>;

    /// Answer a statistics query against the current state.
    fn stat(&self, query: &[u8]) -> ClusterResult<Vec<u8>>;
}
