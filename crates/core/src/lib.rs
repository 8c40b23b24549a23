//! Core contracts and runtime logic of the manifold persistence runtime.
//!
//! Manifold lets record-, document-, and graph-shaped layers share one
//! physical transactional ordered KV store. This crate owns the hard parts:
//!
//! - tuple/subspace/directory key layout ([`tuple`], [`subspace`],
//!   [`directory`]),
//! - key expressions deriving index tuples from items ([`expr`]),
//! - the index maintenance framework and its built-in kinds ([`indexes`],
//!   [`manager`]),
//! - the index lifecycle state machine and online build ([`manager`],
//!   [`builder`]),
//! - change-tracking sessions and schema migration ([`session`],
//!   [`migration`]).
//!
//! The KV store itself is a collaborator behind the [`kv`] traits (the
//! `manifold-memkv` crate provides the in-memory implementation used by the
//! test suites), and the bytes-level item codec is a collaborator behind
//! [`codec::Codec`].

pub mod builder;
pub mod codec;
pub mod config;
pub mod container;
pub mod directory;
pub mod errors;
pub mod expr;
pub mod index;
pub mod indexes;
pub mod item;
pub mod kv;
pub mod manager;
pub mod migration;
pub mod record;
pub mod schema;
pub mod session;
pub mod subspace;
pub mod tuple;

pub use builder::{BuildOutcome, OnlineIndexBuilder};
pub use codec::Codec;
pub use config::{IndexConfiguration, RuntimeConfig};
pub use container::Container;
pub use directory::DirectoryLayer;
pub use errors::{
    CodecError, DirectoryError, ExpressionError, IndexError, KvError, RuntimeError, SchemaError,
    SessionError, StorageError, TupleError,
};
pub use expr::KeyExpression;
pub use index::{CommonOptions, Index, IndexDescriptor, IndexKind, IndexState, SubspaceStructure};
pub use item::ItemStore;
pub use kv::{
    with_transaction, with_transaction_meta, AtomicMutation, CommitMeta, KeySelector, KeyValue,
    KvDatabase, KvTransaction, NumericOperand, RangeOptions, RetryConfig,
};
pub use manager::{IndexManager, RegisteredIndex};
pub use migration::{Migration, MigrationContext, Migrator};
pub use record::{FieldValue, RecordValue};
pub use schema::{Entity, FieldDef, FieldType, Schema, SchemaVersion};
pub use session::ChangeSession;
pub use subspace::{Subspace, VersionstampedKey};
pub use tuple::{Element, Tuple, Versionstamp};
