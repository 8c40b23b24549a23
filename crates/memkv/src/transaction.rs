//! Optimistic transactions over the in-memory store.
//!
//! Writes are buffered as an ordered op list and stay visible to the
//! transaction's own reads (read-your-writes), including range scans and
//! pending atomic mutations. Versionstamped writes are the exception: their
//! final keys and values only exist at commit, so in-transaction reads skip
//! them. Every non-snapshot read records conflict information validated at
//! commit.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use manifold_core::kv::{
    AtomicMutation, CommitMeta, KeySelector, KeyValue, KvTransaction, RangeOptions,
};
use manifold_core::subspace::VersionstampedKey;
use manifold_core::KvError;

use crate::{apply_mutation, check_key_size, check_value_size, MemKv};

#[derive(Debug, Clone)]
pub(crate) enum Op {
    Set(Vec<u8>, Vec<u8>),
    Clear(Vec<u8>),
    ClearRange(Vec<u8>, Vec<u8>),
    Atomic(Vec<u8>, AtomicMutation),
    VersionstampedKey {
        bytes: Vec<u8>,
        offset: usize,
        value: Vec<u8>,
    },
    VersionstampedValue {
        key: Vec<u8>,
        template: Vec<u8>,
        offset: usize,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum ReadRecord {
    Key(Vec<u8>),
    /// Conservative closed interval over the selector anchor keys.
    Range(Vec<u8>, Vec<u8>),
}

#[derive(Default)]
struct TxState {
    ops: Vec<Op>,
    reads: Vec<ReadRecord>,
    /// Buffered-write errors surface at commit, like a remote store would.
    deferred_error: Option<KvError>,
}

pub struct MemTransaction {
    db: MemKv,
    read_version: u64,
    started: Instant,
    timeout: Duration,
    state: Mutex<TxState>,
}

impl MemTransaction {
    pub(crate) fn new(db: MemKv, read_version: u64, timeout: Duration) -> Self {
        MemTransaction {
            db,
            read_version,
            started: Instant::now(),
            timeout,
            state: Mutex::new(TxState::default()),
        }
    }

    fn check_deadline(&self) -> Result<(), KvError> {
        if self.started.elapsed() > self.timeout {
            return Err(KvError::TimedOut);
        }
        Ok(())
    }

    fn defer(&self, result: Result<(), KvError>) {
        if let Err(e) = result {
            let mut state = self.state.lock().unwrap();
            state.deferred_error.get_or_insert(e);
        }
    }

    fn push_op(&self, op: Op) {
        self.state.lock().unwrap().ops.push(op);
    }

    /// Applies the buffered ops on top of a base value for `key`.
    fn overlay_get(&self, key: &[u8], base: Option<Vec<u8>>) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let mut value = base;
        for op in &state.ops {
            match op {
                Op::Set(k, v) if k.as_slice() == key => value = Some(v.clone()),
                Op::Clear(k) if k.as_slice() == key => value = None,
                Op::ClearRange(b, e) if b.as_slice() <= key && key < e.as_slice() => {
                    value = None;
                }
                Op::Atomic(k, mutation) if k.as_slice() == key => {
                    value = Some(apply_mutation(value.take(), *mutation));
                }
                _ => {}
            }
        }
        value
    }
}

fn range_bounds(
    begin: &KeySelector,
    end: &KeySelector,
) -> Option<(Bound<Vec<u8>>, Bound<Vec<u8>>)> {
    let lower = match begin {
        KeySelector::FirstGreaterOrEqual(k) => Bound::Included(k.clone()),
        KeySelector::FirstGreaterThan(k) => Bound::Excluded(k.clone()),
    };
    let upper = match end {
        KeySelector::FirstGreaterOrEqual(k) => Bound::Excluded(k.clone()),
        KeySelector::FirstGreaterThan(k) => Bound::Included(k.clone()),
    };
    let (bk, ek) = (begin.key(), end.key());
    if bk > ek {
        return None;
    }
    if bk == ek && matches!((&lower, &upper), (Bound::Excluded(_), Bound::Excluded(_))) {
        return None;
    }
    Some((lower, upper))
}

fn within(key: &[u8], bounds: &(Bound<Vec<u8>>, Bound<Vec<u8>>)) -> bool {
    let lower_ok = match &bounds.0 {
        Bound::Included(b) => b.as_slice() <= key,
        Bound::Excluded(b) => b.as_slice() < key,
        Bound::Unbounded => true,
    };
    let upper_ok = match &bounds.1 {
        Bound::Included(e) => key <= e.as_slice(),
        Bound::Excluded(e) => key < e.as_slice(),
        Bound::Unbounded => true,
    };
    lower_ok && upper_ok
}

impl KvTransaction for MemTransaction {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        self.check_deadline()?;
        check_key_size(key)?;
        let base = self.db.with_store(|store| store.data.get(key).cloned());
        self.state
            .lock()
            .unwrap()
            .reads
            .push(ReadRecord::Key(key.to_vec()));
        Ok(self.overlay_get(key, base))
    }

    async fn get_range(
        &self,
        begin: KeySelector,
        end: KeySelector,
        options: RangeOptions,
    ) -> Result<Vec<KeyValue>, KvError> {
        self.check_deadline()?;
        let Some(bounds) = range_bounds(&begin, &end) else {
            return Ok(Vec::new());
        };

        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self.db.with_store(|store| {
            store
                .data
                .range((bounds.0.clone(), bounds.1.clone()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        });

        {
            let state = self.state.lock().unwrap();
            for op in &state.ops {
                match op {
                    Op::Set(k, v) if within(k, &bounds) => {
                        merged.insert(k.clone(), v.clone());
                    }
                    Op::Clear(k) => {
                        merged.remove(k);
                    }
                    Op::ClearRange(b, e) => {
                        merged.retain(|k, _| !(b.as_slice() <= k.as_slice() && k.as_slice() < e.as_slice()));
                    }
                    Op::Atomic(k, mutation) if within(k, &bounds) => {
                        let existing = merged.remove(k);
                        merged.insert(k.clone(), apply_mutation(existing, *mutation));
                    }
                    _ => {}
                }
            }
        }

        if !options.snapshot {
            self.state.lock().unwrap().reads.push(ReadRecord::Range(
                begin.key().to_vec(),
                end.key().to_vec(),
            ));
        }

        let pairs: Vec<KeyValue> = merged
            .into_iter()
            .map(|(key, value)| KeyValue { key, value })
            .collect();
        let directed: Vec<KeyValue> = if options.reverse {
            pairs.into_iter().rev().collect()
        } else {
            pairs
        };
        let limited = match options.limit {
            Some(limit) => directed.into_iter().take(limit).collect(),
            None => directed,
        };
        Ok(limited)
    }

    fn set(&self, key: &[u8], value: &[u8]) {
        self.defer(check_key_size(key).and_then(|_| check_value_size(value)));
        self.push_op(Op::Set(key.to_vec(), value.to_vec()));
    }

    fn clear(&self, key: &[u8]) {
        self.defer(check_key_size(key));
        self.push_op(Op::Clear(key.to_vec()));
    }

    fn clear_range(&self, begin: &[u8], end: &[u8]) {
        self.defer(check_key_size(begin).and_then(|_| check_key_size(end)));
        self.push_op(Op::ClearRange(begin.to_vec(), end.to_vec()));
    }

    fn atomic(&self, key: &[u8], mutation: AtomicMutation) {
        self.defer(check_key_size(key));
        self.push_op(Op::Atomic(key.to_vec(), mutation));
    }

    fn set_versionstamped_key(&self, key: VersionstampedKey, value: &[u8]) {
        self.defer(check_key_size(&key.bytes).and_then(|_| check_value_size(value)));
        self.push_op(Op::VersionstampedKey {
            bytes: key.bytes,
            offset: key.offset,
            value: value.to_vec(),
        });
    }

    fn set_versionstamped_value(&self, key: &[u8], template: Vec<u8>, offset: usize) {
        self.defer(check_key_size(key).and_then(|_| check_value_size(&template)));
        self.push_op(Op::VersionstampedValue {
            key: key.to_vec(),
            template,
            offset,
        });
    }

    async fn commit(self) -> Result<CommitMeta, KvError> {
        self.check_deadline()?;
        let state = self.state.into_inner().unwrap();
        if let Some(e) = state.deferred_error {
            return Err(e);
        }
        let stamp = self
            .db
            .commit_ops(self.read_version, &state.reads, state.ops)?;
        Ok(CommitMeta { versionstamp: stamp })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::kv::KvDatabase;

    fn fge(key: &[u8]) -> KeySelector {
        KeySelector::first_greater_or_equal(key.to_vec())
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let db = MemKv::new();
        let tx = db.begin().await.unwrap();
        tx.set(b"a", b"1");
        assert_eq!(tx.get(b"a").await.unwrap(), Some(b"1".to_vec()));
        tx.clear(b"a");
        assert_eq!(tx.get(b"a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overlay_visible_in_range() {
        let db = MemKv::new();
        let tx = db.begin().await.unwrap();
        tx.set(b"k1", b"v1");
        tx.set(b"k3", b"v3");
        tx.commit().await.unwrap();

        let tx = db.begin().await.unwrap();
        tx.set(b"k2", b"v2");
        tx.clear(b"k3");
        let pairs = tx
            .get_range(fge(b"k"), fge(b"l"), RangeOptions::default())
            .await
            .unwrap();
        let keys: Vec<&[u8]> = pairs.iter().map(|kv| kv.key.as_slice()).collect();
        assert_eq!(keys, vec![b"k1".as_slice(), b"k2".as_slice()]);
    }

    #[tokio::test]
    async fn test_pending_atomic_visible_to_get() {
        let db = MemKv::new();
        let tx = db.begin().await.unwrap();
        tx.atomic(
            b"ctr",
            AtomicMutation::Add(manifold_core::kv::NumericOperand::Int(2)),
        );
        tx.atomic(
            b"ctr",
            AtomicMutation::Add(manifold_core::kv::NumericOperand::Int(3)),
        );
        let cell = tx.get(b"ctr").await.unwrap().unwrap();
        assert_eq!(crate::le_i64(&cell), 5);
    }

    #[tokio::test]
    async fn test_reverse_and_limit() {
        let db = MemKv::new();
        let tx = db.begin().await.unwrap();
        for i in 0..5u8 {
            tx.set(&[b'k', i], &[i]);
        }
        tx.commit().await.unwrap();

        let tx = db.begin().await.unwrap();
        let pairs = tx
            .get_range(
                fge(b"k"),
                fge(b"l"),
                RangeOptions {
                    limit: Some(2),
                    reverse: true,
                    snapshot: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].key, vec![b'k', 4]);
        assert_eq!(pairs[1].key, vec![b'k', 3]);
    }

    #[tokio::test]
    async fn test_oversized_key_fails_at_commit() {
        let db = MemKv::new();
        let tx = db.begin().await.unwrap();
        tx.set(&vec![0u8; 20_000], b"v");
        assert!(matches!(tx.commit().await, Err(KvError::KeyTooLarge)));
    }
}
