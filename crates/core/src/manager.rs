//! Index manager: registration, persisted state machine, and maintainer
//! dispatch.
//!
//! The in-memory registry is rebuilt from the schema on every startup — only
//! index *state* is persisted, never definitions. To catch descriptor drift
//! across processes, registration persists a fingerprint of the descriptor
//! next to the state cell and refuses to register a mismatching one.
//!
//! Per-index metadata layout:
//!
//! ```text
//! <root>/_idx_meta/<name>/state        = 1 byte (0=readable 1=disabled 2=writeOnly)
//! <root>/_idx_meta/<name>/fingerprint  = 8-byte BE xxh3 of the descriptor
//! <root>/_idx_meta/<name>/progress     = packed scan position of the online build
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::config::IndexConfiguration;
use crate::errors::{IndexError, KvError};
use crate::index::{Index, IndexState, SubspaceStructure};
use crate::indexes::{scan_position, Maintainer};
use crate::kv::KvTransaction;
use crate::record::RecordValue;
use crate::subspace::Subspace;
use crate::tuple::Tuple;

#[derive(Debug)]
pub struct RegisteredIndex {
    pub index: Index,
    pub maintainer: Maintainer,
    pub configurations: Vec<IndexConfiguration>,
}

/// Shared by every session of one container. Registry mutations happen only
/// at startup and during migration; callers serialize them externally.
#[derive(Debug)]
pub struct IndexManager {
    meta: Subspace,
    index_space: Subspace,
    version_space: Subspace,
    registry: Mutex<BTreeMap<String, Arc<RegisteredIndex>>>,
}

impl IndexManager {
    pub fn new(root: &Subspace) -> Self {
        IndexManager {
            meta: root.subspace("_idx_meta"),
            index_space: root.subspace("I"),
            version_space: root.subspace("V"),
            registry: Mutex::new(BTreeMap::new()),
        }
    }

    fn state_key(&self, name: &str) -> Vec<u8> {
        self.meta.pack(&Tuple::new().with(name).with("state"))
    }

    fn fingerprint_key(&self, name: &str) -> Vec<u8> {
        self.meta.pack(&Tuple::new().with(name).with("fingerprint"))
    }

    pub(crate) fn progress_key(&self, name: &str) -> Vec<u8> {
        self.meta.pack(&Tuple::new().with(name).with("progress"))
    }

    /// Registers the runtime index in memory and returns the handle. The
    /// persisted side (initial state, fingerprint check) is done separately
    /// in [`ensure_persisted`](Self::ensure_persisted) so callers control the
    /// transaction.
    pub fn register(
        &self,
        index: Index,
        configurations: Vec<IndexConfiguration>,
    ) -> Arc<RegisteredIndex> {
        let maintainer = Maintainer::for_index(&index, &self.index_space, &self.version_space);
        let registered = Arc::new(RegisteredIndex {
            index,
            maintainer,
            configurations,
        });
        let mut registry = self.registry.lock().unwrap();
        registry.insert(registered.index.name().to_string(), registered.clone());
        debug!(index = %registered.index.name(), "index registered");
        registered
    }

    pub fn unregister(&self, name: &str) {
        self.registry.lock().unwrap().remove(name);
        debug!(index = %name, "index unregistered");
    }

    pub fn registered(&self, name: &str) -> Result<Arc<RegisteredIndex>, IndexError> {
        self.registry
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| IndexError::Unknown(name.to_string()))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.lock().unwrap().contains_key(name)
    }

    /// Registered indexes covering one item type, ascending by name so that
    /// maintainer dispatch order is deterministic.
    pub fn registered_for(&self, item_type: &str) -> Vec<Arc<RegisteredIndex>> {
        self.registry
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.index.covers(item_type))
            .cloned()
            .collect()
    }

    pub fn all_registered(&self) -> Vec<Arc<RegisteredIndex>> {
        self.registry.lock().unwrap().values().cloned().collect()
    }

    /// Persists the initial disabled state and the descriptor fingerprint if
    /// absent; refuses a fingerprint mismatch.
    pub async fn ensure_persisted<T: KvTransaction>(
        &self,
        tx: &T,
        registered: &RegisteredIndex,
        initial: IndexState,
    ) -> Result<(), IndexError> {
        let name = registered.index.name();
        let fingerprint = registered.index.descriptor.fingerprint();
        match tx.get(&self.fingerprint_key(name)).await? {
            Some(raw) => {
                let persisted = raw
                    .as_slice()
                    .try_into()
                    .map(u64::from_be_bytes)
                    .map_err(|_| KvError::Internal("bad fingerprint cell".into()))?;
                if persisted != fingerprint {
                    return Err(IndexError::DescriptorMismatch(name.to_string()));
                }
            }
            None => tx.set(&self.fingerprint_key(name), &fingerprint.to_be_bytes()),
        }
        if tx.get(&self.state_key(name)).await?.is_none() {
            tx.set(&self.state_key(name), &[initial.to_byte()]);
            info!(index = %name, state = ?initial, "index state initialized");
        }
        Ok(())
    }

    pub async fn read_state<T: KvTransaction>(
        &self,
        tx: &T,
        name: &str,
    ) -> Result<Option<IndexState>, IndexError> {
        let raw = tx.get(&self.state_key(name)).await?;
        match raw {
            None => Ok(None),
            Some(raw) => {
                let byte = *raw
                    .first()
                    .ok_or_else(|| KvError::Internal("empty state cell".into()))?;
                IndexState::from_byte(byte)
                    .map(Some)
                    .ok_or_else(|| KvError::Internal(format!("bad state byte {byte}")).into())
            }
        }
    }

    /// Current state of a registered index; absent cells read as disabled.
    pub async fn state<T: KvTransaction>(
        &self,
        tx: &T,
        name: &str,
    ) -> Result<IndexState, IndexError> {
        if !self.is_registered(name) {
            return Err(IndexError::Unknown(name.to_string()));
        }
        Ok(self.read_state(tx, name).await?.unwrap_or(IndexState::Disabled))
    }

    /// Atomically transitions the index state, enforcing the state machine.
    /// The read of the current state registers a conflict, so two concurrent
    /// transitions serialize at the store: the committed value is always the
    /// latest committed transition.
    pub async fn transition<T: KvTransaction>(
        &self,
        tx: &T,
        name: &str,
        to: IndexState,
    ) -> Result<IndexState, IndexError> {
        let from = self.state(tx, name).await?;
        if !from.can_transition_to(to) {
            return Err(IndexError::StateTransitionNotAllowed {
                index: name.to_string(),
                from,
                to,
            });
        }
        if from != to {
            tx.set(&self.state_key(name), &[to.to_byte()]);
            info!(index = %name, ?from, ?to, "index state transition");
        }
        Ok(from)
    }

    /// Fails unless the index is readable; readers that need complete
    /// results must call this before consulting entries.
    pub async fn require_readable<T: KvTransaction>(
        &self,
        tx: &T,
        name: &str,
    ) -> Result<Arc<RegisteredIndex>, IndexError> {
        let registered = self.registered(name)?;
        let state = self.state(tx, name).await?;
        if !state.is_readable() {
            return Err(IndexError::NotReadable {
                index: name.to_string(),
                state,
            });
        }
        Ok(registered)
    }

    /// Dispatches one item mutation to every maintain-eligible index covering
    /// its type, in ascending index-name order.
    ///
    /// While an index is write-only, aggregation maintainers are fenced by
    /// the online build's progress: contributions of items the builder has
    /// not reached yet are skipped, because the builder will count their
    /// current value when it gets there. Flat maintainers are idempotent per
    /// entry and always run.
    pub async fn update_all<T: KvTransaction>(
        &self,
        tx: &T,
        item_type: &str,
        id: &Tuple,
        old: Option<&RecordValue>,
        new: Option<&RecordValue>,
    ) -> Result<(), IndexError> {
        for registered in self.registered_for(item_type) {
            let name = registered.index.name();
            let state = self.state(tx, name).await?;
            if !state.should_maintain() {
                continue;
            }
            if state == IndexState::WriteOnly
                && registered.maintainer.structure() == SubspaceStructure::Aggregation
            {
                let built_through = tx.get(&self.progress_key(name)).await?;
                let position = scan_position(item_type, id);
                let built = built_through
                    .map(|progress| position.as_slice() <= progress.as_slice())
                    .unwrap_or(false);
                if !built {
                    continue;
                }
            }
            registered
                .maintainer
                .update(tx, item_type, id, old, new)
                .await?;
        }
        Ok(())
    }

    /// Range-clears every entry and the build progress of one index. Version
    /// sidecars are item properties shared across version indexes and stay.
    pub fn clear_entries<T: KvTransaction>(&self, tx: &T, registered: &RegisteredIndex) {
        let (begin, end) = registered.maintainer.subspace().range_of(&Tuple::new());
        tx.clear_range(&begin, &end);
        tx.clear(&self.progress_key(registered.index.name()));
    }

    /// Drops the persisted descriptor fingerprint, releasing the name for a
    /// future descriptor after removal.
    pub fn clear_fingerprint<T: KvTransaction>(&self, tx: &T, name: &str) {
        tx.clear(&self.fingerprint_key(name));
    }
}
