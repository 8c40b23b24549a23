//! Error types shared across the runtime.
//!
//! Each subsystem owns its own error enum; `RuntimeError` aggregates them
//! through transparent conversions so callers can bubble everything with `?`
//! and still match on the precise failure when they need to.

use thiserror::Error;

use crate::index::IndexState;
use crate::schema::SchemaVersion;

/// Errors surfaced by the underlying KV store.
///
/// Conflicts and too-old snapshots are retryable; the transaction wrapper
/// handles them silently up to the configured retry budget. Everything else
/// propagates to the caller.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("transaction conflict")]
    Conflict,

    #[error("transaction timed out")]
    TimedOut,

    #[error("transaction read version is too old")]
    TooOld,

    #[error("key exceeds maximum size")]
    KeyTooLarge,

    #[error("value exceeds maximum size")]
    ValueTooLarge,

    #[error("retry limit exhausted after {attempts} attempts")]
    RetryLimit { attempts: usize },

    #[error("kv store error: {0}")]
    Internal(String),
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::Conflict | KvError::TooOld)
    }
}

#[derive(Debug, Error)]
pub enum TupleError {
    #[error("encoded tuple is truncated")]
    Truncated,

    #[error("unknown tuple type code {0:#04x}")]
    InvalidTypeCode(u8),

    #[error("invalid utf-8 in string element")]
    InvalidString,

    #[error("integer element out of supported range")]
    IntegerOverflow,

    #[error("key {} does not start with subspace prefix {}", hex::encode(.key), hex::encode(.prefix))]
    PrefixMismatch { prefix: Vec<u8>, key: Vec<u8> },

    #[error("expected exactly one incomplete versionstamp, found {0}")]
    IncompleteVersionstampCount(usize),
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory already exists: {0:?}")]
    AlreadyExists(Vec<String>),

    #[error("directory not found: {0:?}")]
    NotFound(Vec<String>),

    #[error("invalid directory path: {0}")]
    PathInvalid(String),

    #[error(transparent)]
    Tuple(#[from] TupleError),

    #[error(transparent)]
    Kv(#[from] KvError),
}

#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("field not found: {0}")]
    FieldNotFound(String),

    #[error("type mismatch at field {field}: {reason}")]
    TypeMismatch { field: String, reason: String },

    #[error("invalid key path: {0:?}")]
    InvalidKeyPath(String),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed for {entity}: {reason}")]
    Encode { entity: String, reason: String },

    #[error("decode failed for {entity}: {reason}")]
    Decode { entity: String, reason: String },
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("unknown index: {0}")]
    Unknown(String),

    #[error("unsupported index kind: {0}")]
    UnsupportedKind(String),

    #[error("index kind mismatch for {index}: expected {expected}, got {actual}")]
    KindMismatch {
        index: String,
        expected: String,
        actual: String,
    },

    #[error("state transition not allowed for {index}: {from:?} -> {to:?}")]
    StateTransitionNotAllowed {
        index: String,
        from: IndexState,
        to: IndexState,
    },

    #[error("index {index} is not readable (state {state:?})")]
    NotReadable { index: String, state: IndexState },

    #[error("uniqueness violation on index {index}")]
    UniquenessViolation { index: String },

    #[error("index {index} requires at least two key columns")]
    InsufficientFields { index: String },

    #[error("index {index} produced a non-numeric value column")]
    NonNumericValue { index: String },

    #[error("registered descriptor for {0} does not match the persisted one")]
    DescriptorMismatch(String),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Tuple(#[from] TupleError),

    #[error(transparent)]
    Kv(#[from] KvError),
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("duplicate entity name: {0}")]
    DuplicateEntity(String),

    #[error("duplicate index name: {0}")]
    DuplicateIndex(String),

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("index {index} is not valid for its declared field types: {reason}")]
    InvalidIndex { index: String, reason: String },

    #[error("no migration path from {from} to {to}")]
    NoMigrationPath {
        from: SchemaVersion,
        to: SchemaVersion,
    },

    #[error("downgrade from {from} to {to} is not supported")]
    DowngradeNotSupported {
        from: SchemaVersion,
        to: SchemaVersion,
    },

    #[error("migration versions not ordered: {from} -> {to}")]
    VersionsNotOrdered {
        from: SchemaVersion,
        to: SchemaVersion,
    },

    #[error("migration plan had {planned} stages but {executed} executed")]
    StageCountMismatch { planned: usize, executed: usize },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("another save is already in flight on this session")]
    ConcurrentSaveNotAllowed,
}

/// Errors from byte-level item storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid item id: {0}")]
    IdValidation(String),

    #[error("item not found: {item_type}/{id}")]
    KeyNotFound { item_type: String, id: String },

    #[error(transparent)]
    Tuple(#[from] TupleError),

    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Top-level error for runtime entry points.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Tuple(#[from] TupleError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Kv(#[from] KvError),
}

impl RuntimeError {
    /// Whether the underlying cause is a retryable KV failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            RuntimeError::Kv(e) => e.is_retryable(),
            RuntimeError::Index(IndexError::Kv(e)) => e.is_retryable(),
            RuntimeError::Storage(StorageError::Kv(e)) => e.is_retryable(),
            RuntimeError::Directory(DirectoryError::Kv(e)) => e.is_retryable(),
            _ => false,
        }
    }
}
