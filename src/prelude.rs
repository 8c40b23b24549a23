//! Convenience re-exports for the common runtime surface.

pub use manifold_core::{
    Codec, Container, Entity, FieldType, FieldValue, IndexDescriptor, IndexKind, IndexState,
    Migration, MigrationContext, Migrator, RecordValue, RuntimeConfig, RuntimeError, Schema,
    SchemaVersion, Tuple,
};
pub use manifold_memkv::MemKv;

pub use crate::adapters::{open_container, StorageDriver};
