//! The container: process-wide owner of the directory root, schema, index
//! registry, and codec for one logical store.
//!
//! Opening a container allocates (or reopens) its directory prefix, rebuilds
//! the in-memory index registry from the schema, and initializes persisted
//! index state. A fresh container (no persisted schema version) starts its
//! indexes readable — the store is empty, so empty indexes are complete. On
//! an existing container, indexes that have no persisted state yet start
//! disabled and are enabled through migration.

use std::sync::Arc;

use futures_util::StreamExt;
use tracing::info;

use crate::builder::OnlineIndexBuilder;
use crate::codec::Codec;
use crate::config::RuntimeConfig;
use crate::directory::DirectoryLayer;
use crate::errors::{IndexError, KvError, RuntimeError, SchemaError};
use crate::index::{Index, IndexDescriptor, IndexState};
use crate::indexes::{IndexEntry, Maintainer, VersionEntry};
use crate::item::ItemStore;
use crate::kv::{
    with_transaction, KvDatabase, KvTransaction, NumericOperand, RangeOptions, RetryConfig,
};
use crate::manager::IndexManager;
use crate::migration::Migrator;
use crate::record::RecordValue;
use crate::schema::{Entity, FieldType, Schema, SchemaVersion};
use crate::session::ChangeSession;
use crate::subspace::Subspace;
use crate::tuple::{Element, Tuple, Versionstamp};

pub struct Container<D: KvDatabase> {
    db: D,
    config: RuntimeConfig,
    codec: Arc<dyn Codec>,
    root: Subspace,
    meta: Subspace,
    items: ItemStore,
    manager: Arc<IndexManager>,
    directory: DirectoryLayer,
}

impl<D: KvDatabase> std::fmt::Debug for Container<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("root", &self.root)
            .field("meta", &self.meta)
            .field("manager", &self.manager)
            .field("directory", &self.directory)
            .finish()
    }
}

impl<D: KvDatabase> Container<D> {
    pub async fn open(
        db: D,
        config: RuntimeConfig,
        codec: Arc<dyn Codec>,
    ) -> Result<Arc<Self>, RuntimeError> {
        config.validate()?;

        let directory = DirectoryLayer::new();
        let path = config.resolved_root_path();
        let root = with_transaction(&db, &config.retry, |tx| {
            let directory = directory.clone();
            let path = path.clone();
            async move {
                let components: Vec<&str> = path.iter().map(String::as_str).collect();
                directory
                    .create_or_open(tx.as_ref(), &components)
                    .await
                    .map_err(RuntimeError::from)
            }
        })
        .await?;

        let meta = root.subspace("_meta");
        let items = ItemStore::new(&root);
        let manager = Arc::new(IndexManager::new(&root));

        let container = Container {
            db,
            config,
            codec,
            root,
            meta,
            items,
            manager,
            directory,
        };

        for entity in &container.config.schema.entities {
            for descriptor in &entity.indexes {
                let index = Index::compile(descriptor.clone(), entity)?;
                let configurations = container.config.configurations_for(&descriptor.name);
                container.manager.register(index, configurations);
            }
        }

        let registered = container.manager.all_registered();
        let version_key = container.version_key();
        let version_value = encode_version(container.config.schema.version);
        let manager = container.manager.clone();
        with_transaction(&container.db, &container.config.retry, |tx| {
            let registered = registered.clone();
            let version_key = version_key.clone();
            let version_value = version_value.clone();
            let manager = manager.clone();
            async move {
                let fresh = tx
                    .get(&version_key)
                    .await
                    .map_err(RuntimeError::Kv)?
                    .is_none();
                if fresh {
                    tx.set(&version_key, &version_value);
                }
                // Fresh container: nothing stored yet, so empty indexes are
                // already complete.
                let initial = if fresh {
                    IndexState::Readable
                } else {
                    IndexState::Disabled
                };
                for reg in registered.iter() {
                    manager.ensure_persisted(tx.as_ref(), reg, initial).await?;
                }
                Ok(fresh)
            }
        })
        .await?;

        info!(
            path = ?container.config.resolved_root_path(),
            version = %container.config.schema.version,
            indexes = container.manager.all_registered().len(),
            "container opened"
        );
        Ok(Arc::new(container))
    }

    pub fn db(&self) -> &D {
        &self.db
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.config.retry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.config.schema
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub fn items(&self) -> &ItemStore {
        &self.items
    }

    pub fn manager(&self) -> &Arc<IndexManager> {
        &self.manager
    }

    pub fn root(&self) -> &Subspace {
        &self.root
    }

    /// Directory layer of the underlying cluster; shared by all containers
    /// on the same store.
    pub fn directory(&self) -> &DirectoryLayer {
        &self.directory
    }

    pub(crate) fn require_entity(&self, item_type: &str) -> Result<&Entity, RuntimeError> {
        self.config
            .schema
            .entity(item_type)
            .ok_or_else(|| SchemaError::UnknownEntity(item_type.to_string()).into())
    }

    pub fn session(self: &Arc<Self>) -> Arc<ChangeSession<D>> {
        ChangeSession::new(self.clone())
    }

    pub fn index_builder(&self) -> OnlineIndexBuilder<D> {
        OnlineIndexBuilder::new(
            self.db.clone(),
            self.manager.clone(),
            self.items.clone(),
            self.codec.clone(),
            self.config.retry.clone(),
        )
    }

    /// Runs the online build for one index to completion.
    pub async fn build_index(&self, name: &str) -> Result<(), RuntimeError> {
        self.index_builder().build(name).await?;
        Ok(())
    }

    /// Current persisted lifecycle state of a registered index.
    pub async fn index_state(&self, name: &str) -> Result<IndexState, RuntimeError> {
        with_transaction(&self.db, self.retry(), |tx| async move {
            Ok(self.manager.state(tx.as_ref(), name).await?)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Committed reads
    // ------------------------------------------------------------------

    pub(crate) async fn fetch_bytes(
        &self,
        item_type: &str,
        id: &Tuple,
    ) -> Result<Option<Vec<u8>>, RuntimeError> {
        self.require_entity(item_type)?;
        with_transaction(&self.db, self.retry(), |tx| async move {
            self.items
                .load(tx.as_ref(), item_type, id)
                .await
                .map_err(RuntimeError::from)
        })
        .await
    }

    pub async fn fetch(
        &self,
        item_type: &str,
        id: &Tuple,
    ) -> Result<Option<RecordValue>, RuntimeError> {
        let bytes = self.fetch_bytes(item_type, id).await?;
        match bytes {
            Some(bytes) => Ok(Some(self.codec.decode(item_type, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Like [`fetch`](Self::fetch) but absent items are an error.
    pub async fn fetch_existing(
        &self,
        item_type: &str,
        id: &Tuple,
    ) -> Result<RecordValue, RuntimeError> {
        self.require_entity(item_type)?;
        let bytes = with_transaction(&self.db, self.retry(), |tx| async move {
            self.items
                .load_required(tx.as_ref(), item_type, id)
                .await
                .map_err(RuntimeError::from)
        })
        .await?;
        Ok(self.codec.decode(item_type, &bytes)?)
    }

    /// All committed items of a type, in id order, in one transaction.
    pub async fn fetch_all(
        &self,
        item_type: &str,
    ) -> Result<Vec<(Tuple, RecordValue)>, RuntimeError> {
        self.require_entity(item_type)?;
        with_transaction(&self.db, self.retry(), |tx| async move {
            let mut out = Vec::new();
            let stream = self.items.scan(tx.as_ref(), item_type);
            futures_util::pin_mut!(stream);
            while let Some(next) = stream.next().await {
                let (id, bytes) = next?;
                out.push((id, self.codec.decode(item_type, &bytes)?));
            }
            Ok(out)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Index read surface (lookup primitives; all readable-guarded)
    // ------------------------------------------------------------------

    /// Right-open prefix lookup on a scalar index.
    pub async fn scan_index(
        &self,
        name: &str,
        prefix: &Tuple,
        limit: Option<usize>,
    ) -> Result<Vec<IndexEntry>, RuntimeError> {
        with_transaction(&self.db, self.retry(), |tx| async move {
            let registered = self.manager.require_readable(tx.as_ref(), name).await?;
            match &registered.maintainer {
                Maintainer::Scalar(m) => {
                    let options = RangeOptions {
                        limit,
                        ..Default::default()
                    };
                    Ok(m.scan_prefix(tx.as_ref(), prefix, options).await?)
                }
                other => Err(IndexError::UnsupportedKind(format!(
                    "{:?} does not support prefix scans",
                    other.structure()
                ))
                .into()),
            }
        })
        .await
    }

    /// Reduced count of one group of a count index.
    pub async fn count_value(&self, name: &str, group: &Tuple) -> Result<i64, RuntimeError> {
        with_transaction(&self.db, self.retry(), |tx| async move {
            let registered = self.manager.require_readable(tx.as_ref(), name).await?;
            match &registered.maintainer {
                Maintainer::Count(m) => Ok(m.group_count(tx.as_ref(), group).await?),
                _ => Err(IndexError::UnsupportedKind(format!(
                    "{name} is not a count index"
                ))
                .into()),
            }
        })
        .await
    }

    /// Reduced sum of one group of a sum index.
    pub async fn sum_value(&self, name: &str, group: &Tuple) -> Result<f64, RuntimeError> {
        with_transaction(&self.db, self.retry(), |tx| async move {
            let registered = self.manager.require_readable(tx.as_ref(), name).await?;
            match &registered.maintainer {
                Maintainer::Sum(m) => Ok(m.group_sum(tx.as_ref(), group).await?),
                _ => Err(
                    IndexError::UnsupportedKind(format!("{name} is not a sum index")).into(),
                ),
            }
        })
        .await
    }

    /// Reduced min/max cell of one group, decoded in the domain of the
    /// trailing key field.
    pub async fn extremum_value(
        &self,
        name: &str,
        group: &Tuple,
    ) -> Result<Option<NumericOperand>, RuntimeError> {
        let trailing = self.trailing_field_type(name)?;
        with_transaction(&self.db, self.retry(), |tx| {
            let trailing = trailing.clone();
            async move {
                let registered = self.manager.require_readable(tx.as_ref(), name).await?;
                let raw = match &registered.maintainer {
                    Maintainer::Extremum(m) => m.group_value(tx.as_ref(), group).await?,
                    _ => {
                        return Err(IndexError::UnsupportedKind(format!(
                            "{name} is not a min/max index"
                        ))
                        .into())
                    }
                };
                Ok(raw.map(|raw| match trailing {
                    FieldType::Float => {
                        NumericOperand::Float(crate::indexes::decode_f64_cell(raw))
                    }
                    _ => NumericOperand::Int(crate::indexes::decode_i64_cell(raw)),
                }))
            }
        })
        .await
    }

    /// Entries of one version index group changed strictly after `since`.
    pub async fn changed_since(
        &self,
        name: &str,
        group: &Tuple,
        since: Option<Versionstamp>,
    ) -> Result<Vec<VersionEntry>, RuntimeError> {
        with_transaction(&self.db, self.retry(), |tx| async move {
            let registered = self.manager.require_readable(tx.as_ref(), name).await?;
            match &registered.maintainer {
                Maintainer::Version(m) => Ok(m
                    .changed_since(tx.as_ref(), group, since, RangeOptions::default())
                    .await?),
                _ => Err(IndexError::UnsupportedKind(format!(
                    "{name} is not a version index"
                ))
                .into()),
            }
        })
        .await
    }

    fn trailing_field_type(&self, name: &str) -> Result<FieldType, RuntimeError> {
        let descriptor = self
            .config
            .schema
            .descriptor(name)
            .ok_or_else(|| IndexError::Unknown(name.to_string()))?;
        let entity = self
            .config
            .schema
            .entity_for_index(name)
            .ok_or_else(|| IndexError::Unknown(name.to_string()))?;
        let path = descriptor
            .key_paths
            .last()
            .ok_or_else(|| IndexError::Unknown(name.to_string()))?;
        entity
            .resolve_path(path)
            .cloned()
            .ok_or_else(|| IndexError::Unknown(name.to_string()).into())
    }

    // ------------------------------------------------------------------
    // Schema version persistence
    // ------------------------------------------------------------------

    fn version_key(&self) -> Vec<u8> {
        self.meta.pack(&Tuple::new().with("schema").with("version"))
    }

    pub async fn current_schema_version(&self) -> Result<Option<SchemaVersion>, RuntimeError> {
        let key = self.version_key();
        let raw = with_transaction(&self.db, self.retry(), |tx| {
            let key = key.clone();
            async move { tx.get(&key).await.map_err(RuntimeError::Kv) }
        })
        .await?;
        raw.map(|raw| decode_version(&raw)).transpose()
    }

    pub(crate) async fn persist_schema_version(
        &self,
        version: SchemaVersion,
    ) -> Result<(), RuntimeError> {
        let key = self.version_key();
        let value = encode_version(version);
        with_transaction(&self.db, self.retry(), |tx| {
            let key = key.clone();
            let value = value.clone();
            async move {
                tx.set(&key, &value);
                Ok(())
            }
        })
        .await?;
        info!(version = %version, "persisted schema version");
        Ok(())
    }

    /// Resolves and runs the migration chain from the persisted version to
    /// the schema's version. Returns the number of executed stages.
    pub async fn migrate_if_needed(
        self: &Arc<Self>,
        migrator: &Migrator<D>,
    ) -> Result<usize, RuntimeError> {
        let target = self.config.schema.version;
        let current = self.current_schema_version().await?.unwrap_or(target);
        if current == target {
            return Ok(0);
        }
        if target < current {
            return Err(SchemaError::DowngradeNotSupported {
                from: current,
                to: target,
            }
            .into());
        }
        info!(from = %current, to = %target, "schema migration required");
        migrator.run(self, current, target).await
    }

    // ------------------------------------------------------------------
    // Entity-scoped index lifecycle (used by migrations)
    // ------------------------------------------------------------------

    /// Registers a descriptor on its entity's store and flips the index to
    /// write-only. Idempotent: re-adding a write-only or readable index is a
    /// no-op. The index is never marked readable here.
    pub(crate) async fn add_index(&self, descriptor: IndexDescriptor) -> Result<(), RuntimeError> {
        let entity = self
            .config
            .schema
            .entity_for_index(&descriptor.name)
            .ok_or_else(|| {
                SchemaError::InvalidConfiguration(format!(
                    "index {:?} does not belong to any entity in the schema",
                    descriptor.name
                ))
            })?;
        let declared = self
            .config
            .schema
            .descriptor(&descriptor.name)
            .expect("entity_for_index implies descriptor");
        if declared != &descriptor {
            return Err(SchemaError::InvalidConfiguration(format!(
                "descriptor for {:?} differs from the schema's declaration",
                descriptor.name
            ))
            .into());
        }

        let name = descriptor.name.clone();
        let registered = if self.manager.is_registered(&name) {
            self.manager.registered(&name)?
        } else {
            let index = Index::compile(descriptor, entity)?;
            let configurations = self.config.configurations_for(&name);
            self.manager.register(index, configurations)
        };

        let manager = self.manager.clone();
        with_transaction(&self.db, self.retry(), |tx| {
            let manager = manager.clone();
            let registered = registered.clone();
            let name = name.clone();
            async move {
                manager
                    .ensure_persisted(tx.as_ref(), &registered, IndexState::Disabled)
                    .await?;
                if manager.state(tx.as_ref(), &name).await? == IndexState::Disabled {
                    manager
                        .transition(tx.as_ref(), &name, IndexState::WriteOnly)
                        .await?;
                }
                Ok(())
            }
        })
        .await
    }

    /// Range-clears the index subspace, disables the index, and removes the
    /// registration and persisted fingerprint.
    pub(crate) async fn remove_index(&self, name: &str) -> Result<(), RuntimeError> {
        let registered = self.manager.registered(name)?;
        let manager = self.manager.clone();
        with_transaction(&self.db, self.retry(), |tx| {
            let manager = manager.clone();
            let registered = registered.clone();
            let name = name.to_string();
            async move {
                manager.clear_entries(tx.as_ref(), &registered);
                manager
                    .transition(tx.as_ref(), &name, IndexState::Disabled)
                    .await?;
                manager.clear_fingerprint(tx.as_ref(), &name);
                Ok(())
            }
        })
        .await?;
        self.manager.unregister(name);
        Ok(())
    }

    /// Flips a readable index back to write-only, clears prior entries, and
    /// runs the online build to completion.
    pub(crate) async fn rebuild_index(&self, name: &str) -> Result<(), RuntimeError> {
        let registered = self.manager.registered(name)?;
        let manager = self.manager.clone();
        with_transaction(&self.db, self.retry(), |tx| {
            let manager = manager.clone();
            let registered = registered.clone();
            let name = name.to_string();
            async move {
                if manager.state(tx.as_ref(), &name).await? == IndexState::Readable {
                    manager
                        .transition(tx.as_ref(), &name, IndexState::WriteOnly)
                        .await?;
                }
                manager.clear_entries(tx.as_ref(), &registered);
                Ok(())
            }
        })
        .await?;
        self.build_index(name).await
    }
}

fn encode_version(version: SchemaVersion) -> Vec<u8> {
    Tuple::new()
        .with(version.major as i64)
        .with(version.minor as i64)
        .with(version.patch as i64)
        .pack()
}

fn decode_version(raw: &[u8]) -> Result<SchemaVersion, RuntimeError> {
    let tuple = Tuple::unpack(raw).map_err(RuntimeError::Tuple)?;
    match tuple.elements() {
        [Element::Int(major), Element::Int(minor), Element::Int(patch)] => Ok(
            SchemaVersion::new(*major as u64, *minor as u64, *patch as u64),
        ),
        _ => Err(RuntimeError::Kv(KvError::Internal(
            "malformed schema version cell".into(),
        ))),
    }
}
