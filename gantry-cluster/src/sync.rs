//! The reader-side oplog sync loop.
//!
//! Readers converge on their writer's log by polling: every tick the loop
//! asks the group's writer for its max sequence, pulls the missing range
//! (capped per pull), appends it, and drives the model apply callback. The
//! pull mutex keeps at most one pull in flight.

use crate::error::{ClusterError, ClusterResult};
use crate::gateway::GatewayCluster;
use crate::message::{pack_with_header, unpack_response, MessageType, OpLogPullRequest, OpLogPullResponse};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

pub(crate) async fn sync_oplog_loop(gc: Arc<GatewayCluster>) {
    let mut ticker = tokio::time::interval(gc.config().oplog_pull_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; consume it so the loop sleeps one
    // interval before its first pull.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = gc.stop_token().cancelled() => {
                debug!(node = %gc.node_name(), "oplog sync loop stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let _pull_guard = gc.sync_oplog_lock.lock().await;
        if let Err(e) = pull_once(&gc).await {
            warn!(node = %gc.node_name(), error = %e, "oplog pull failed, retrying next tick");
        }
    }
}

/// One pull: query the writer's max sequence, fetch the missing range, and
/// append-then-apply it as a batch.
async fn pull_once(gc: &GatewayCluster) -> ClusterResult<()> {
    let writer = gc.writer_in_group(gc.group())?;
    let writer_max = gc.query_max_seq(&writer).await?;

    let local_max = gc.oplog().max_seq();
    if writer_max <= local_max {
        if writer_max < local_max {
            warn!(
                writer = %writer,
                writer_max,
                local_max,
                "local oplog is ahead of the writer"
            );
        }
        return Ok(());
    }

    let mut gap = writer_max - local_max;
    let max_gap = u64::from(gc.config().oplog_max_seq_gap_to_pull);
    if gap > max_gap {
        debug!(gap, capped_to = max_gap, "capping the pull gap");
        gap = max_gap;
    }
    let max_count = gap.min(u64::from(gc.config().oplog_pull_max_count_once));

    let frame = pack_with_header(
        &OpLogPullRequest {
            since: local_max + 1,
            max_count,
        },
        MessageType::OpLogPull.header(),
    )?;
    let resp = gc
        .request_single(
            MessageType::OpLogPull,
            &writer,
            frame,
            gc.config().oplog_pull_timeout,
        )
        .await?;
    let pull: OpLogPullResponse = unpack_response(&writer, MessageType::OpLogPull, &resp)?;

    // Validate the batch before touching the log: ascending order,
    // already-stored sequences trimmed, and the remainder a dense
    // continuation of the local prefix. A gap abandons the whole batch;
    // the next tick re-queries the writer.
    let mut ops = pull.operations;
    ops.sort_by_key(|op| op.seq);
    let local_max = gc.oplog().max_seq();
    ops.retain(|op| {
        if op.seq <= local_max {
            debug!(seq = op.seq, "skipping an already-stored operation from the pull");
            false
        } else {
            true
        }
    });
    if ops.is_empty() {
        return Ok(());
    }
    let mut expected = local_max + 1;
    for op in &ops {
        if op.seq != expected {
            return Err(ClusterError::SeqGap {
                seq: op.seq,
                max_seq: expected - 1,
            });
        }
        expected += 1;
    }

    let mut appended = 0usize;
    let mut append_err = None;
    for op in &ops {
        match gc.oplog().append(op) {
            Ok(()) => appended += 1,
            Err(e) => {
                append_err = Some(e);
                break;
            }
        }
    }

    // Apply is all-or-nothing per batch: a shutdown signaled mid-pull skips
    // it entirely. The appended entries stand; the model is rebuilt from the
    // log at the next start and apply is idempotent by sequence.
    if gc.stop_token().is_cancelled() {
        debug!(appended, "shutdown during pull, skipping the batch apply");
        return Ok(());
    }
    for op in &ops[..appended] {
        if let Err(e) = gc.model.apply(op) {
            error!(seq = op.seq, error = %e, "model apply failed");
        }
    }
    debug!(
        appended,
        max_seq = gc.oplog().max_seq(),
        "pulled and applied operations"
    );

    match append_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
