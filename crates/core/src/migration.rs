//! Versioned schema migration.
//!
//! Registered migrations form a directed graph over schema versions (a
//! linear chain in practice). `Migrator::resolve` walks the edges from the
//! persisted version to the target; each stage runs its closure against a
//! [`MigrationContext`] and the persisted version advances after every
//! stage, so an interrupted migration resumes at the first unapplied stage.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::info;

use crate::config::IndexConfiguration;
use crate::container::Container;
use crate::errors::{RuntimeError, SchemaError};
use crate::index::IndexDescriptor;
use crate::kv::KvDatabase;
use crate::schema::SchemaVersion;

pub type MigrationFn<D> =
    Arc<dyn Fn(MigrationContext<D>) -> BoxFuture<'static, Result<(), RuntimeError>> + Send + Sync>;

pub struct Migration<D: KvDatabase> {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub description: String,
    run: MigrationFn<D>,
}

impl<D: KvDatabase> Migration<D> {
    pub fn new<F>(
        from: SchemaVersion,
        to: SchemaVersion,
        description: impl Into<String>,
        run: F,
    ) -> Self
    where
        F: Fn(MigrationContext<D>) -> BoxFuture<'static, Result<(), RuntimeError>>
            + Send
            + Sync
            + 'static,
    {
        Migration {
            from,
            to,
            description: description.into(),
            run: Arc::new(run),
        }
    }
}

/// Entity-scoped operations available to a migration closure.
pub struct MigrationContext<D: KvDatabase> {
    container: Arc<Container<D>>,
}

impl<D: KvDatabase> MigrationContext<D> {
    pub(crate) fn new(container: Arc<Container<D>>) -> Self {
        MigrationContext { container }
    }

    /// Registers the descriptor on its entity's store and flips the index to
    /// write-only in one transaction. The index is deliberately *not* marked
    /// readable — an empty readable index would answer queries with false
    /// negatives; a separate online build closes the gap.
    pub async fn add_index(&self, descriptor: IndexDescriptor) -> Result<(), RuntimeError> {
        self.container.add_index(descriptor).await
    }

    /// Range-clears the index subspace, disables the index, and drops it
    /// from the registration.
    pub async fn remove_index(&self, name: &str) -> Result<(), RuntimeError> {
        self.container.remove_index(name).await
    }

    /// Transitions readable back to write-only, clears prior entries, and
    /// runs the online build to completion.
    pub async fn rebuild_index(&self, name: &str) -> Result<(), RuntimeError> {
        self.container.rebuild_index(name).await
    }

    /// Configuration records targeting one index.
    pub fn configurations(&self, index_name: &str) -> Vec<IndexConfiguration> {
        self.container.config().configurations_for(index_name)
    }

    pub fn container(&self) -> &Arc<Container<D>> {
        &self.container
    }
}

pub struct Migrator<D: KvDatabase> {
    migrations: Vec<Migration<D>>,
}

impl<D: KvDatabase> Migrator<D> {
    pub fn new(migrations: Vec<Migration<D>>) -> Result<Self, SchemaError> {
        for migration in &migrations {
            if migration.to <= migration.from {
                return Err(SchemaError::VersionsNotOrdered {
                    from: migration.from,
                    to: migration.to,
                });
            }
        }
        Ok(Migrator { migrations })
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Ordered chain of migrations connecting `from` to `to`.
    pub fn resolve(
        &self,
        from: SchemaVersion,
        to: SchemaVersion,
    ) -> Result<Vec<&Migration<D>>, SchemaError> {
        if to < from {
            return Err(SchemaError::DowngradeNotSupported { from, to });
        }
        let mut chain = Vec::new();
        let mut current = from;
        while current < to {
            let next = self
                .migrations
                .iter()
                .find(|m| m.from == current)
                .ok_or(SchemaError::NoMigrationPath { from, to })?;
            if next.to > to {
                return Err(SchemaError::NoMigrationPath { from, to });
            }
            chain.push(next);
            current = next.to;
        }
        Ok(chain)
    }

    /// Runs the resolved chain, persisting the schema version after each
    /// stage. The executed count is checked against the plan as a guard
    /// against registry mutation mid-run.
    pub(crate) async fn run(
        &self,
        container: &Arc<Container<D>>,
        from: SchemaVersion,
        to: SchemaVersion,
    ) -> Result<usize, RuntimeError> {
        let plan = self.resolve(from, to)?;
        let planned = plan.len();
        let mut executed = 0;
        for migration in plan {
            info!(
                from = %migration.from,
                to = %migration.to,
                description = %migration.description,
                "running schema migration stage"
            );
            (migration.run)(MigrationContext::new(container.clone())).await?;
            container.persist_schema_version(migration.to).await?;
            executed += 1;
        }
        if executed != planned {
            return Err(SchemaError::StageCountMismatch { planned, executed }.into());
        }
        Ok(executed)
    }
}
