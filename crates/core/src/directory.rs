//! Directory layer: human-readable paths mapped to allocated short prefixes.
//!
//! Path-to-prefix mappings live under the reserved `0xfe` node subspace,
//! keyed by the tuple of path components. Prefix allocation draws from a
//! monotonic counter inside the same transaction, so allocated prefixes never
//! collide. Data written under an allocated prefix is untouched by renames
//! (the prefix travels with the path) and removed wholesale by `remove`.

use std::collections::BTreeSet;

use tracing::debug;

use crate::errors::DirectoryError;
use crate::kv::{KeySelector, KvTransaction, RangeOptions};
use crate::subspace::Subspace;
use crate::tuple::{Element, Tuple};

const NODE_PREFIX: u8 = 0xfe;

#[derive(Debug, Clone)]
pub struct DirectoryLayer {
    nodes: Subspace,
    counter_key: Vec<u8>,
}

impl Default for DirectoryLayer {
    fn default() -> Self {
        let nodes = Subspace::new(vec![NODE_PREFIX]);
        // Null sorts below every string, so the counter cell can never
        // collide with a path mapping.
        let counter_key = nodes.pack(&Tuple::new().with(Element::Null).with("seq"));
        DirectoryLayer { nodes, counter_key }
    }
}

impl DirectoryLayer {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate(path: &[&str]) -> Result<(), DirectoryError> {
        if path.is_empty() {
            return Err(DirectoryError::PathInvalid("empty path".into()));
        }
        if path.iter().any(|c| c.is_empty()) {
            return Err(DirectoryError::PathInvalid(
                "empty path component".into(),
            ));
        }
        Ok(())
    }

    fn owned(path: &[&str]) -> Vec<String> {
        path.iter().map(|s| s.to_string()).collect()
    }

    fn node_key(&self, path: &[&str]) -> Vec<u8> {
        let tuple = path.iter().fold(Tuple::new(), |t, c| t.with(*c));
        self.nodes.pack(&tuple)
    }

    async fn read_prefix<T: KvTransaction>(
        &self,
        tx: &T,
        path: &[&str],
    ) -> Result<Option<Subspace>, DirectoryError> {
        let value = tx.get(&self.node_key(path)).await?;
        Ok(value.map(Subspace::new))
    }

    pub async fn exists<T: KvTransaction>(
        &self,
        tx: &T,
        path: &[&str],
    ) -> Result<bool, DirectoryError> {
        Self::validate(path)?;
        Ok(self.read_prefix(tx, path).await?.is_some())
    }

    pub async fn open<T: KvTransaction>(
        &self,
        tx: &T,
        path: &[&str],
    ) -> Result<Subspace, DirectoryError> {
        Self::validate(path)?;
        self.read_prefix(tx, path)
            .await?
            .ok_or_else(|| DirectoryError::NotFound(Self::owned(path)))
    }

    pub async fn create<T: KvTransaction>(
        &self,
        tx: &T,
        path: &[&str],
    ) -> Result<Subspace, DirectoryError> {
        Self::validate(path)?;
        if self.read_prefix(tx, path).await?.is_some() {
            return Err(DirectoryError::AlreadyExists(Self::owned(path)));
        }
        let prefix = self.allocate(tx).await?;
        tx.set(&self.node_key(path), prefix.prefix());
        debug!(path = ?path, prefix = %hex::encode(prefix.prefix()), "directory created");
        Ok(prefix)
    }

    pub async fn create_or_open<T: KvTransaction>(
        &self,
        tx: &T,
        path: &[&str],
    ) -> Result<Subspace, DirectoryError> {
        Self::validate(path)?;
        match self.read_prefix(tx, path).await? {
            Some(existing) => Ok(existing),
            None => self.create(tx, path).await,
        }
    }

    /// Re-homes `old_path` (and every directory nested under it) at
    /// `new_path` within one transaction. Allocated prefixes travel with the
    /// paths, so no data moves.
    pub async fn move_to<T: KvTransaction>(
        &self,
        tx: &T,
        old_path: &[&str],
        new_path: &[&str],
    ) -> Result<(), DirectoryError> {
        Self::validate(old_path)?;
        Self::validate(new_path)?;
        if self.read_prefix(tx, old_path).await?.is_none() {
            return Err(DirectoryError::NotFound(Self::owned(old_path)));
        }
        if self.read_prefix(tx, new_path).await?.is_some() {
            return Err(DirectoryError::AlreadyExists(Self::owned(new_path)));
        }

        let new_base = new_path.iter().fold(Tuple::new(), |t, c| t.with(*c));
        for entry in self.subtree(tx, old_path).await? {
            let suffix = entry.path_suffix;
            let mut renamed = new_base.clone();
            renamed.append(suffix);
            tx.set(&self.nodes.pack(&renamed), &entry.prefix);
            tx.clear(&entry.node_key);
        }
        Ok(())
    }

    /// Removes the directory, its nested directories, and all data stored
    /// under their allocated prefixes.
    pub async fn remove<T: KvTransaction>(
        &self,
        tx: &T,
        path: &[&str],
    ) -> Result<(), DirectoryError> {
        Self::validate(path)?;
        if self.read_prefix(tx, path).await?.is_none() {
            return Err(DirectoryError::NotFound(Self::owned(path)));
        }
        for entry in self.subtree(tx, path).await? {
            let data = Subspace::new(entry.prefix);
            let (begin, end) = data.range_of(&Tuple::new());
            tx.clear_range(&begin, &end);
        }
        let mapping_key = self.node_key(path);
        let end = crate::tuple::next_prefix(&mapping_key);
        tx.clear_range(&mapping_key, &end);
        debug!(path = ?path, "directory removed");
        Ok(())
    }

    /// Immediate child names under `path`.
    pub async fn list<T: KvTransaction>(
        &self,
        tx: &T,
        path: &[&str],
    ) -> Result<Vec<String>, DirectoryError> {
        Self::validate(path)?;
        if self.read_prefix(tx, path).await?.is_none() {
            return Err(DirectoryError::NotFound(Self::owned(path)));
        }
        let mut children = BTreeSet::new();
        for entry in self.subtree(tx, path).await? {
            if let Some(Element::String(name)) = entry.path_suffix.elements().first() {
                children.insert(name.clone());
            }
        }
        Ok(children.into_iter().collect())
    }

    async fn allocate<T: KvTransaction>(&self, tx: &T) -> Result<Subspace, DirectoryError> {
        let next = match tx.get(&self.counter_key).await? {
            Some(raw) => {
                let bytes: [u8; 8] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| crate::errors::KvError::Internal("bad counter".into()))?;
                i64::from_le_bytes(bytes)
            }
            None => 0,
        };
        tx.set(&self.counter_key, &(next + 1).to_le_bytes());
        Ok(Subspace::from_tuple(&Tuple::new().with(next)))
    }

    /// Mapping entries for `path` and everything nested under it.
    async fn subtree<T: KvTransaction>(
        &self,
        tx: &T,
        path: &[&str],
    ) -> Result<Vec<SubtreeEntry>, DirectoryError> {
        let exact = self.node_key(path);
        let end = crate::tuple::next_prefix(&exact);
        let pairs = tx
            .get_range(
                KeySelector::first_greater_or_equal(exact.clone()),
                KeySelector::first_greater_or_equal(end),
                RangeOptions::default(),
            )
            .await?;

        let mut entries = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let tuple = self.nodes.unpack(&pair.key)?;
            let suffix = Tuple::from_elements(
                tuple.elements()[path.len().min(tuple.len())..].to_vec(),
            );
            entries.push(SubtreeEntry {
                node_key: pair.key,
                path_suffix: suffix,
                prefix: pair.value,
            });
        }
        Ok(entries)
    }
}

struct SubtreeEntry {
    node_key: Vec<u8>,
    /// Path components below the queried path; empty for the path itself.
    path_suffix: Tuple,
    prefix: Vec<u8>,
}
