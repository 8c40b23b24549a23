//! Contract for the underlying transactional ordered KV store.
//!
//! The runtime is generic over a [`KvDatabase`], which hands out optimistic
//! transactions. Reads register conflict information, writes are buffered and
//! applied atomically at commit, and atomic mutations commute so their order
//! within a transaction never changes the committed outcome. Commit returns
//! the versionstamp used to substitute placeholders written through
//! [`KvTransaction::set_versionstamped_key`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::{KvError, RuntimeError};
use crate::subspace::VersionstampedKey;
use crate::tuple::Versionstamp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Resolves to the first key at-or-after / strictly-after the anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
    FirstGreaterOrEqual(Vec<u8>),
    FirstGreaterThan(Vec<u8>),
}

impl KeySelector {
    pub fn first_greater_or_equal(key: impl Into<Vec<u8>>) -> Self {
        KeySelector::FirstGreaterOrEqual(key.into())
    }

    pub fn first_greater_than(key: impl Into<Vec<u8>>) -> Self {
        KeySelector::FirstGreaterThan(key.into())
    }

    pub fn key(&self) -> &[u8] {
        match self {
            KeySelector::FirstGreaterOrEqual(k) | KeySelector::FirstGreaterThan(k) => k,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RangeOptions {
    /// Maximum number of pairs to return; `None` means unbounded.
    pub limit: Option<usize>,
    pub reverse: bool,
    /// Snapshot reads do not register read conflicts.
    pub snapshot: bool,
}

impl RangeOptions {
    pub fn limited(limit: usize) -> Self {
        RangeOptions {
            limit: Some(limit),
            ..Default::default()
        }
    }
}

/// Eight-byte operand for commutative mutations, carrying its arithmetic
/// domain so the store can add in the right one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericOperand {
    Int(i64),
    Float(f64),
}

impl NumericOperand {
    pub fn encode(&self) -> [u8; 8] {
        match self {
            NumericOperand::Int(v) => v.to_le_bytes(),
            NumericOperand::Float(v) => v.to_le_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AtomicMutation {
    Add(NumericOperand),
    Min(NumericOperand),
    Max(NumericOperand),
}

/// Metadata returned by a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitMeta {
    pub versionstamp: Versionstamp,
}

#[trait_variant::make(Send)]
pub trait KvTransaction: Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    async fn get_range(
        &self,
        begin: KeySelector,
        end: KeySelector,
        options: RangeOptions,
    ) -> Result<Vec<KeyValue>, KvError>;

    fn set(&self, key: &[u8], value: &[u8]);

    fn clear(&self, key: &[u8]);

    /// Clears the right-open range `[begin, end)`.
    fn clear_range(&self, begin: &[u8], end: &[u8]);

    fn atomic(&self, key: &[u8], mutation: AtomicMutation);

    /// Writes `value` under a key whose placeholder is substituted with the
    /// commit versionstamp.
    fn set_versionstamped_key(&self, key: VersionstampedKey, value: &[u8]);

    /// Writes a value whose 10 bytes at `offset` are substituted with the
    /// commit versionstamp.
    fn set_versionstamped_value(&self, key: &[u8], template: Vec<u8>, offset: usize);

    /// Commits buffered writes; fails with a retryable error on conflict.
    async fn commit(self) -> Result<CommitMeta, KvError>;
}

#[trait_variant::make(Send)]
pub trait KvDatabase: Clone + Send + Sync + 'static {
    type Tx: KvTransaction + Send + Sync;

    async fn begin(&self) -> Result<Self::Tx, KvError>;
}

/// Retry/backoff policy for optimistic transactions.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub backoff_unit: Duration,
    pub backoff_factor: u32,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 16,
            backoff_unit: Duration::from_millis(2),
            backoff_factor: 2,
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryConfig {
    fn backoff_for(&self, attempt: usize) -> Duration {
        let factor = self.backoff_factor.saturating_pow(attempt.min(16) as u32);
        self.backoff_unit
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Runs `body` inside a transaction, committing on success and retrying the
/// whole body on retryable KV failures (conflicts) with exponential backoff.
///
/// The body receives a shared handle to the transaction and must not retain
/// it past its own future. Non-retryable errors from the body or from commit
/// propagate untouched, so validation failures never consume retry budget.
pub async fn with_transaction<D, T, F, Fut>(
    db: &D,
    retry: &RetryConfig,
    body: F,
) -> Result<T, RuntimeError>
where
    D: KvDatabase,
    T: Send,
    F: Fn(Arc<D::Tx>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, RuntimeError>> + Send,
{
    let (value, _) = with_transaction_meta(db, retry, body).await?;
    Ok(value)
}

/// Like [`with_transaction`] but also returns the commit metadata.
pub async fn with_transaction_meta<D, T, F, Fut>(
    db: &D,
    retry: &RetryConfig,
    body: F,
) -> Result<(T, CommitMeta), RuntimeError>
where
    D: KvDatabase,
    T: Send,
    F: Fn(Arc<D::Tx>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, RuntimeError>> + Send,
{
    let mut attempt = 0;
    loop {
        let tx = Arc::new(db.begin().await?);
        let error: RuntimeError = match body(tx.clone()).await {
            Ok(value) => {
                let tx = Arc::try_unwrap(tx).map_err(|_| {
                    RuntimeError::Kv(KvError::Internal(
                        "transaction handle retained beyond body".into(),
                    ))
                })?;
                match tx.commit().await {
                    Ok(meta) => return Ok((value, meta)),
                    Err(e) => RuntimeError::Kv(e),
                }
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            return Err(error);
        }
        if attempt >= retry.max_retries {
            warn!(attempt, "transaction retry budget exhausted");
            return Err(RuntimeError::Kv(KvError::RetryLimit { attempts: attempt }));
        }
        let backoff = retry.backoff_for(attempt);
        attempt += 1;
        debug!(attempt, ?backoff, "transaction conflict, retrying");
        tokio::time::sleep(backoff).await;
    }
}
