//! Manifold: a multi-model persistence runtime over a transactional ordered
//! key/value store.
//!
//! Higher layers (record, document, vector, graph) share one physical store
//! through typed item storage, a pluggable index-maintenance framework,
//! transactional change tracking with autosave, schema versioning with
//! migration, and an online index-build pipeline with explicit readability
//! states.
//!
//! This crate is the integration surface: it re-exports the runtime core and
//! the bundled in-memory KV backend, and wires storage driver configuration
//! to concrete containers in [`adapters`].

pub mod adapters;
pub mod prelude;

pub use manifold_core::*;
pub use manifold_memkv::MemKv;
