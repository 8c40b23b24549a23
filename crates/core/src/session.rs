//! Change-tracking session: a unit of work staging inserts and deletes until
//! `save` applies them in one transaction.
//!
//! Staging rules: an insert replaces a prior delete of the same key; a
//! delete cancels a prior insert outright when the item was never persisted,
//! and replaces it otherwise so the commit issues the clear. Pending changes
//! apply in insertion order. A failed save leaves the pending set intact for
//! correction and retry; only a successful save prunes what it committed.
//!
//! `save` is single-flight per session: a second concurrent call fails with
//! `ConcurrentSaveNotAllowed` instead of racing. Autosave drains the pending
//! set from a background task after each mutation, coalescing mutations that
//! arrive while a save is in flight into one follow-up save.
//!
//! Fetches read committed state only; pending, not-yet-saved writes are not
//! visible to them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::container::Container;
use crate::errors::{RuntimeError, SessionError};
use crate::item::ItemStore;
use crate::kv::{with_transaction, KvDatabase};
use crate::record::RecordValue;
use crate::tuple::Tuple;

#[derive(Debug, Clone, PartialEq)]
enum PendingOp {
    Insert { bytes: Vec<u8>, record: RecordValue },
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    item_type: String,
    packed_id: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StagedChange {
    key: PendingKey,
    id: Tuple,
    op: PendingOp,
}

/// Insertion-ordered pending map.
#[derive(Debug, Default)]
struct PendingSet {
    order: Vec<PendingKey>,
    ops: HashMap<PendingKey, (Tuple, PendingOp)>,
}

impl PendingSet {
    fn stage(&mut self, key: PendingKey, id: Tuple, op: PendingOp) {
        if self.ops.insert(key.clone(), (id, op)).is_none() {
            self.order.push(key);
        }
    }

    fn cancel(&mut self, key: &PendingKey) {
        if self.ops.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    fn get(&self, key: &PendingKey) -> Option<&PendingOp> {
        self.ops.get(key).map(|(_, op)| op)
    }

    fn snapshot(&self) -> Vec<StagedChange> {
        self.order
            .iter()
            .map(|key| {
                let (id, op) = &self.ops[key];
                StagedChange {
                    key: key.clone(),
                    id: id.clone(),
                    op: op.clone(),
                }
            })
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub struct ChangeSession<D: KvDatabase> {
    container: Arc<Container<D>>,
    /// Self-handle for the autosave drain task.
    this: Weak<ChangeSession<D>>,
    pending: Mutex<PendingSet>,
    save_gate: tokio::sync::Mutex<()>,
    autosave: AtomicBool,
    autosave_running: AtomicBool,
    autosave_rerun: AtomicBool,
}

impl<D: KvDatabase> ChangeSession<D> {
    pub(crate) fn new(container: Arc<Container<D>>) -> Arc<Self> {
        Arc::new_cyclic(|this| ChangeSession {
            container,
            this: this.clone(),
            pending: Mutex::new(PendingSet::default()),
            save_gate: tokio::sync::Mutex::new(()),
            autosave: AtomicBool::new(false),
            autosave_running: AtomicBool::new(false),
            autosave_rerun: AtomicBool::new(false),
        })
    }

    fn pending_key(item_type: &str, id: &Tuple) -> PendingKey {
        PendingKey {
            item_type: item_type.to_string(),
            packed_id: id.pack(),
        }
    }

    /// Stages an insert (or overwrite). The record is encoded immediately so
    /// codec failures surface before anything is staged.
    pub async fn insert(
        &self,
        item_type: &str,
        id: &Tuple,
        record: RecordValue,
    ) -> Result<(), RuntimeError> {
        ItemStore::validate_id(id)?;
        self.container.require_entity(item_type)?;
        let bytes = self.container.codec().encode(item_type, &record)?;
        {
            let mut pending = self.pending.lock().unwrap();
            pending.stage(
                Self::pending_key(item_type, id),
                id.clone(),
                PendingOp::Insert { bytes, record },
            );
        }
        self.trigger_autosave();
        Ok(())
    }

    /// Stages a delete. A pending insert of a never-persisted item cancels
    /// out to a net no-op; for persisted items the delete is retained so the
    /// commit issues the clear.
    pub async fn delete(
        &self,
        item_type: &str,
        id: &Tuple,
    ) -> Result<(), RuntimeError> {
        ItemStore::validate_id(id)?;
        self.container.require_entity(item_type)?;
        let key = Self::pending_key(item_type, id);

        let pending_insert = {
            let pending = self.pending.lock().unwrap();
            matches!(pending.get(&key), Some(PendingOp::Insert { .. }))
        };
        if pending_insert {
            let persisted = self.container.fetch_bytes(item_type, id).await?.is_some();
            let mut pending = self.pending.lock().unwrap();
            if persisted {
                pending.stage(key, id.clone(), PendingOp::Delete);
            } else {
                pending.cancel(&key);
            }
        } else {
            let mut pending = self.pending.lock().unwrap();
            pending.stage(key, id.clone(), PendingOp::Delete);
        }
        self.trigger_autosave();
        Ok(())
    }

    /// Discards all pending changes without committing.
    pub fn rollback(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = PendingSet::default();
    }

    pub fn has_changes(&self) -> bool {
        !self.pending.lock().unwrap().is_empty()
    }

    /// Commits pending changes in insertion order within one transaction:
    /// for each change the item store is updated and the index manager
    /// dispatches to every maintain-eligible index.
    pub async fn save(&self) -> Result<(), RuntimeError> {
        let guard = self
            .save_gate
            .try_lock()
            .map_err(|_| SessionError::ConcurrentSaveNotAllowed)?;
        self.save_locked(guard).await
    }

    /// Autosave entry: waits for an in-flight save instead of failing.
    async fn save_queued(&self) -> Result<(), RuntimeError> {
        let guard = self.save_gate.lock().await;
        self.save_locked(guard).await
    }

    async fn save_locked(
        &self,
        _guard: tokio::sync::MutexGuard<'_, ()>,
    ) -> Result<(), RuntimeError> {
        let staged = Arc::new(self.pending.lock().unwrap().snapshot());
        if staged.is_empty() {
            return Ok(());
        }

        let container = &self.container;
        with_transaction(container.db(), container.retry(), |tx| {
            let staged = staged.clone();
            async move {
                for change in staged.iter() {
                    let old_bytes = container
                        .items()
                        .load(tx.as_ref(), &change.key.item_type, &change.id)
                        .await?;
                    let old_record = match &old_bytes {
                        Some(bytes) => {
                            Some(container.codec().decode(&change.key.item_type, bytes)?)
                        }
                        None => None,
                    };
                    match &change.op {
                        PendingOp::Insert { bytes, record } => {
                            container
                                .items()
                                .save(tx.as_ref(), &change.key.item_type, &change.id, bytes)
                                .await?;
                            container
                                .manager()
                                .update_all(
                                    tx.as_ref(),
                                    &change.key.item_type,
                                    &change.id,
                                    old_record.as_ref(),
                                    Some(record),
                                )
                                .await?;
                        }
                        PendingOp::Delete => {
                            container
                                .items()
                                .delete(tx.as_ref(), &change.key.item_type, &change.id)
                                .await?;
                            container
                                .manager()
                                .update_all(
                                    tx.as_ref(),
                                    &change.key.item_type,
                                    &change.id,
                                    old_record.as_ref(),
                                    None,
                                )
                                .await?;
                        }
                    }
                }
                Ok(())
            }
        })
        .await?;

        self.prune_saved(&staged);
        debug!(changes = staged.len(), "session save committed");
        Ok(())
    }

    /// Drops committed changes from the pending set, keeping any key that
    /// was re-staged while the save was in flight.
    fn prune_saved(&self, staged: &[StagedChange]) {
        let mut pending = self.pending.lock().unwrap();
        for change in staged {
            if pending.get(&change.key) == Some(&change.op) {
                pending.cancel(&change.key);
            }
        }
    }

    /// Enables or disables autosave; enabling drains any already-pending
    /// changes.
    pub fn set_autosave(&self, enabled: bool) {
        self.autosave.store(enabled, Ordering::Release);
        if enabled && self.has_changes() {
            self.trigger_autosave();
        }
    }

    fn trigger_autosave(&self) {
        if !self.autosave.load(Ordering::Acquire) {
            return;
        }
        if self.autosave_running.swap(true, Ordering::AcqRel) {
            // A drain task is active; ask it for one more pass.
            self.autosave_rerun.store(true, Ordering::Release);
            return;
        }
        let Some(session) = self.this.upgrade() else {
            self.autosave_running.store(false, Ordering::Release);
            return;
        };
        tokio::spawn(async move {
            loop {
                if let Err(e) = session.save_queued().await {
                    warn!(error = %e, "autosave failed; changes remain staged");
                    break;
                }
                if !session.autosave_rerun.swap(false, Ordering::AcqRel) {
                    break;
                }
            }
            session.autosave_running.store(false, Ordering::Release);
            // A mutation that raced the flag reset above only marked rerun;
            // pick it up with a fresh task.
            if session.autosave_rerun.swap(false, Ordering::AcqRel) && session.has_changes() {
                session.trigger_autosave();
            }
        });
    }

    /// Reads the committed value of an item; pending writes are not visible.
    pub async fn fetch(
        &self,
        item_type: &str,
        id: &Tuple,
    ) -> Result<Option<RecordValue>, RuntimeError> {
        self.container.fetch(item_type, id).await
    }

    /// All committed items of a type, in id order.
    pub async fn fetch_all(
        &self,
        item_type: &str,
    ) -> Result<Vec<(Tuple, RecordValue)>, RuntimeError> {
        self.container.fetch_all(item_type).await
    }

    pub fn container(&self) -> &Arc<Container<D>> {
        &self.container
    }
}
