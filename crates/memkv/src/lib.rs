//! In-memory transactional ordered KV backend.
//!
//! Implements the `manifold-core` KV contract over a `BTreeMap` with
//! optimistic concurrency: transactions read at their start version, record
//! their read set, and validate it at commit against every commit that
//! happened since. Writes are buffered (with read-your-writes visibility),
//! atomic mutations are applied at commit time where they commute, and
//! versionstamp placeholders are substituted with the commit version.
//!
//! The backend exists so the runtime and its suites can exercise the full
//! contract — conflicts, retries, atomics, versionstamps — without an
//! external cluster. Data is ephemeral.

mod transaction;

pub use transaction::MemTransaction;

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::trace;

use manifold_core::kv::{AtomicMutation, KvDatabase, NumericOperand};
use manifold_core::{KvError, Versionstamp};

use transaction::{Op, ReadRecord};

/// How many recent commits keep their conflict information. A transaction
/// older than the retained window fails conservatively with `TooOld`.
const MAX_COMMIT_LOG: usize = 1024;

/// Size caps mirroring typical distributed-store limits.
const MAX_KEY_BYTES: usize = 10_000;
const MAX_VALUE_BYTES: usize = 100_000;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

struct CommitRecord {
    version: u64,
    written_keys: Vec<Vec<u8>>,
    cleared_ranges: Vec<(Vec<u8>, Vec<u8>)>,
}

pub(crate) struct Store {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    commit_version: u64,
    log: VecDeque<CommitRecord>,
}

impl Store {
    fn oldest_validatable_version(&self) -> u64 {
        self.log.front().map(|r| r.version - 1).unwrap_or(self.commit_version)
    }
}

/// The in-memory database handle; cheap to clone, shared by all sessions.
#[derive(Clone)]
pub struct MemKv {
    store: Arc<Mutex<Store>>,
    timeout: Duration,
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemKv {
    pub fn new() -> Self {
        MemKv {
            store: Arc::new(Mutex::new(Store {
                data: BTreeMap::new(),
                commit_version: 0,
                log: VecDeque::new(),
            })),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Overrides the per-transaction timeout (default five seconds).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of live keys; test observability only.
    pub fn key_count(&self) -> usize {
        self.store.lock().unwrap().data.len()
    }

    pub(crate) fn read_version(&self) -> u64 {
        self.store.lock().unwrap().commit_version
    }

    pub(crate) fn with_store<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        f(&self.store.lock().unwrap())
    }

    /// Validates the transaction's read set and applies its buffered ops.
    pub(crate) fn commit_ops(
        &self,
        read_version: u64,
        reads: &[ReadRecord],
        ops: Vec<Op>,
    ) -> Result<Versionstamp, KvError> {
        let mut store = self.store.lock().unwrap();

        // Read-only transactions serialize trivially.
        if ops.is_empty() {
            return Ok(Versionstamp::from_parts(store.commit_version, 0));
        }

        if read_version < store.oldest_validatable_version() {
            return Err(KvError::TooOld);
        }
        for record in store.log.iter().filter(|r| r.version > read_version) {
            for read in reads {
                if read_conflicts(read, record) {
                    trace!(version = record.version, "commit conflict");
                    return Err(KvError::Conflict);
                }
            }
        }

        let version = store.commit_version + 1;
        // Every versionstamped write in one transaction carries the same
        // stamp; the trailing batch-order bytes stay zero for a store that
        // commits one transaction at a time.
        let stamp = Versionstamp::from_parts(version, 0);
        let mut written_keys = Vec::new();
        let mut cleared_ranges = Vec::new();

        for op in ops {
            match op {
                Op::Set(key, value) => {
                    written_keys.push(key.clone());
                    store.data.insert(key, value);
                }
                Op::Clear(key) => {
                    written_keys.push(key.clone());
                    store.data.remove(&key);
                }
                Op::ClearRange(begin, end) => {
                    if begin < end {
                        let doomed: Vec<Vec<u8>> = store
                            .data
                            .range((Bound::Included(begin.clone()), Bound::Excluded(end.clone())))
                            .map(|(k, _)| k.clone())
                            .collect();
                        for key in doomed {
                            store.data.remove(&key);
                        }
                        cleared_ranges.push((begin, end));
                    }
                }
                Op::Atomic(key, mutation) => {
                    let existing = store.data.get(&key).cloned();
                    let merged = apply_mutation(existing, mutation);
                    written_keys.push(key.clone());
                    store.data.insert(key, merged);
                }
                Op::VersionstampedKey {
                    mut bytes,
                    offset,
                    value,
                } => {
                    bytes[offset..offset + 10].copy_from_slice(stamp.as_bytes());
                    written_keys.push(bytes.clone());
                    store.data.insert(bytes, value);
                }
                Op::VersionstampedValue {
                    key,
                    mut template,
                    offset,
                } => {
                    template[offset..offset + 10].copy_from_slice(stamp.as_bytes());
                    written_keys.push(key.clone());
                    store.data.insert(key, template);
                }
            }
        }

        store.commit_version = version;
        store.log.push_back(CommitRecord {
            version,
            written_keys,
            cleared_ranges,
        });
        while store.log.len() > MAX_COMMIT_LOG {
            store.log.pop_front();
        }
        trace!(version, "commit applied");
        Ok(stamp)
    }
}

impl KvDatabase for MemKv {
    type Tx = MemTransaction;

    async fn begin(&self) -> Result<MemTransaction, KvError> {
        Ok(MemTransaction::new(
            self.clone(),
            self.read_version(),
            self.timeout,
        ))
    }
}

fn read_conflicts(read: &ReadRecord, record: &CommitRecord) -> bool {
    match read {
        ReadRecord::Key(key) => {
            record.written_keys.iter().any(|w| w == key)
                || record
                    .cleared_ranges
                    .iter()
                    .any(|(b, e)| b.as_slice() <= key.as_slice() && key.as_slice() < e.as_slice())
        }
        // Conservative closed interval over the selector anchors.
        ReadRecord::Range(lo, hi) => {
            record
                .written_keys
                .iter()
                .any(|w| lo.as_slice() <= w.as_slice() && w.as_slice() <= hi.as_slice())
                || record
                    .cleared_ranges
                    .iter()
                    .any(|(b, e)| b.as_slice() <= hi.as_slice() && lo.as_slice() < e.as_slice())
        }
    }
}

/// Applies a commutative mutation to the current cell, in the operand's
/// arithmetic domain. Absent cells behave as the domain zero for `Add` and as
/// the operand itself for `Min`/`Max`.
pub(crate) fn apply_mutation(existing: Option<Vec<u8>>, mutation: AtomicMutation) -> Vec<u8> {
    let cell_i64 = |raw: &Option<Vec<u8>>| {
        raw.as_ref().map(|r| le_i64(r)).unwrap_or(0)
    };
    let cell_f64 = |raw: &Option<Vec<u8>>| {
        raw.as_ref().map(|r| le_f64(r)).unwrap_or(0.0)
    };
    match mutation {
        AtomicMutation::Add(NumericOperand::Int(v)) => {
            cell_i64(&existing).wrapping_add(v).to_le_bytes().to_vec()
        }
        AtomicMutation::Add(NumericOperand::Float(v)) => {
            (cell_f64(&existing) + v).to_le_bytes().to_vec()
        }
        AtomicMutation::Min(operand) => match (existing, operand) {
            (None, op) => op.encode().to_vec(),
            (Some(raw), NumericOperand::Int(v)) => le_i64(&raw).min(v).to_le_bytes().to_vec(),
            (Some(raw), NumericOperand::Float(v)) => le_f64(&raw).min(v).to_le_bytes().to_vec(),
        },
        AtomicMutation::Max(operand) => match (existing, operand) {
            (None, op) => op.encode().to_vec(),
            (Some(raw), NumericOperand::Int(v)) => le_i64(&raw).max(v).to_le_bytes().to_vec(),
            (Some(raw), NumericOperand::Float(v)) => le_f64(&raw).max(v).to_le_bytes().to_vec(),
        },
    }
}

pub(crate) fn le_i64(raw: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let len = raw.len().min(8);
    buf[..len].copy_from_slice(&raw[..len]);
    i64::from_le_bytes(buf)
}

pub(crate) fn le_f64(raw: &[u8]) -> f64 {
    let mut buf = [0u8; 8];
    let len = raw.len().min(8);
    buf[..len].copy_from_slice(&raw[..len]);
    f64::from_le_bytes(buf)
}

pub(crate) fn check_key_size(key: &[u8]) -> Result<(), KvError> {
    if key.len() > MAX_KEY_BYTES {
        return Err(KvError::KeyTooLarge);
    }
    Ok(())
}

pub(crate) fn check_value_size(value: &[u8]) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_BYTES {
        return Err(KvError::ValueTooLarge);
    }
    Ok(())
}
