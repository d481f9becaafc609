//! The durable operation log.
//!
//! An append-only, sequence-numbered store of administrative operations,
//! backed by a key-ordered `redb` table. Keys are the 8-byte big-endian
//! sequence number, values the JSON-encoded operation, so a range scan walks
//! sequences in order. Sequences form a dense prefix `[1..max_seq]`: appends
//! are accepted only at `max_seq + 1`, and the transaction commit is the
//! durability barrier before an append is acknowledged.

use crate::error::{ClusterError, ClusterResult};
use gantry_core::Operation;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

const OPERATIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("operations");

const DB_FILE: &str = "operations.redb";

/// The node-local operation log.
///
/// Single-writer, multi-reader: `append` calls are serialized internally,
/// while `read_since` and `max_seq` run against read snapshots and never
/// block each other.
pub struct OpLog {
    db: Database,
    max_seq: AtomicU64,
    closed: AtomicBool,
    append_lock: Mutex<()>,
}

impl OpLog {
    /// Open (or create) the log under `dir`.
    pub fn open(dir: &Path) -> ClusterResult<Self> {
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join(DB_FILE))?;

        // Make sure the table exists, then recover the max sequence.
        let txn = db.begin_write()?;
        txn.open_table(OPERATIONS)?;
        txn.commit()?;

        let max_seq = {
            let txn = db.begin_read()?;
            let table = txn.open_table(OPERATIONS)?;
            let last = table.last()?;
            match last {
                Some((key, _)) => decode_seq(key.value())?,
                None => 0,
            }
        };
        debug!(max_seq, dir = %dir.display(), "oplog opened");

        Ok(Self {
            db,
            max_seq: AtomicU64::new(max_seq),
            closed: AtomicBool::new(false),
            append_lock: Mutex::new(()),
        })
    }

    /// Max sequence currently stored; 0 when the log is empty.
    pub fn max_seq(&self) -> u64 {
        self.max_seq.load(Ordering::Acquire)
    }

    /// Append one operation at `max_seq + 1`.
    ///
    /// Rejects `Duplicate` when `op.seq <= max_seq` and `SeqGap` when
    /// `op.seq > max_seq + 1`. Returns only after the entry is durable.
    pub fn append(&self, op: &Operation) -> ClusterResult<()> {
        self.check_open()?;
        let _guard = self.append_lock.lock();

        let max_seq = self.max_seq.load(Ordering::Acquire);
        if op.seq <= max_seq {
            return Err(ClusterError::Duplicate {
                seq: op.seq,
                max_seq,
            });
        }
        if op.seq != max_seq + 1 {
            return Err(ClusterError::SeqGap {
                seq: op.seq,
                max_seq,
            });
        }

        let encoded = serde_json::to_vec(op)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(OPERATIONS)?;
            table.insert(op.seq.to_be_bytes().as_slice(), encoded.as_slice())?;
        }
        txn.commit()?;

        self.max_seq.store(op.seq, Ordering::Release);
        Ok(())
    }

    /// Read operations with sequences in `[since, min(since + max_count - 1,
    /// max_seq)]`, in order. Empty when `since > max_seq` or `max_count` is
    /// zero.
    pub fn read_since(&self, since: u64, max_count: u64) -> ClusterResult<Vec<Operation>> {
        self.check_open()?;
        if max_count == 0 || since > self.max_seq() {
            return Ok(Vec::new());
        }
        let until = since.saturating_add(max_count - 1);

        let txn = self.db.begin_read()?;
        let table = txn.open_table(OPERATIONS)?;
        let start = since.to_be_bytes();
        let end = until.to_be_bytes();

        let mut operations = Vec::new();
        for item in table.range::<&[u8]>(start.as_slice()..=end.as_slice())? {
            let (_, value) = item?;
            let op: Operation = serde_json::from_slice(value.value())?;
            operations.push(op);
        }
        Ok(operations)
    }

    /// Mark the log closed; subsequent appends and reads are rejected.
    ///
    /// Every acknowledged append is already durable, so close has nothing
    /// left to flush.
    pub fn close(&self) -> ClusterResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn check_open(&self) -> ClusterResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClusterError::LogClosed);
        }
        Ok(())
    }
}

fn decode_seq(key: &[u8]) -> ClusterResult<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| ClusterError::Storage(format!("malformed oplog key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}
