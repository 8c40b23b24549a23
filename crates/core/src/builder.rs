//! Online index build: promote a write-only index to readable without
//! blocking concurrent writes.
//!
//! The builder walks the covered item ranges in bounded batches, each batch
//! in its own retried transaction that re-applies the maintainer and advances
//! the persisted progress cell atomically with the scanned entries — a
//! retried batch therefore never double-applies an aggregation contribution.
//! Concurrent writers keep the index correct for items at or behind the
//! progress cell (see the manager's write-only fencing); items ahead of it
//! are picked up when the scan reaches them.
//!
//! The final transaction observes an empty tail beyond the progress cell and
//! flips write-only to readable; a concurrent insert into the tail conflicts
//! with that read and serializes either before the flip (and is scanned) or
//! after it (and is maintained as readable).
//!
//! Cancellation halts at a batch boundary leaving the state write-only and
//! the progress cell in place, so a later call resumes where the build
//! stopped.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::codec::Codec;
use crate::errors::{IndexError, RuntimeError};
use crate::index::IndexState;
use crate::item::ItemStore;
use crate::kv::{
    with_transaction, KeySelector, KvDatabase, KvTransaction, RangeOptions, RetryConfig,
};
use crate::manager::{IndexManager, RegisteredIndex};
use crate::tuple::Tuple;

/// Default per-batch item bound.
pub const DEFAULT_BATCH_ITEMS: usize = 500;

/// Default per-batch byte bound.
pub const DEFAULT_BATCH_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildOutcome {
    pub batches: usize,
    pub items_scanned: u64,
    /// False when the build was cancelled at a batch boundary; the index
    /// stays write-only and the recorded progress allows resuming.
    pub completed: bool,
}

pub struct OnlineIndexBuilder<D: KvDatabase> {
    db: D,
    manager: Arc<IndexManager>,
    items: ItemStore,
    codec: Arc<dyn Codec>,
    retry: RetryConfig,
    batch_items: usize,
    batch_bytes: usize,
}

struct BatchResult {
    processed: usize,
    bytes: usize,
    /// True when every covered item range was exhausted within budget.
    reached_end: bool,
    /// True when this transaction performed the readable flip.
    flipped: bool,
}

impl<D: KvDatabase> OnlineIndexBuilder<D> {
    pub fn new(
        db: D,
        manager: Arc<IndexManager>,
        items: ItemStore,
        codec: Arc<dyn Codec>,
        retry: RetryConfig,
    ) -> Self {
        OnlineIndexBuilder {
            db,
            manager,
            items,
            codec,
            retry,
            batch_items: DEFAULT_BATCH_ITEMS,
            batch_bytes: DEFAULT_BATCH_BYTES,
        }
    }

    pub fn with_batch_items(mut self, batch_items: usize) -> Self {
        self.batch_items = batch_items.max(1);
        self
    }

    pub fn with_batch_bytes(mut self, batch_bytes: usize) -> Self {
        self.batch_bytes = batch_bytes.max(1);
        self
    }

    pub async fn build(&self, index_name: &str) -> Result<BuildOutcome, RuntimeError> {
        self.build_with_cancellation(index_name, CancellationToken::new())
            .await
    }

    pub async fn build_with_cancellation(
        &self,
        index_name: &str,
        cancel: CancellationToken,
    ) -> Result<BuildOutcome, RuntimeError> {
        let registered = self.manager.registered(index_name)?;

        // Precondition: write-only. A disabled index is flipped first; an
        // already readable one has nothing to do.
        let ready = with_transaction(&self.db, &self.retry, |tx| async move {
            match self.manager.state(tx.as_ref(), index_name).await? {
                IndexState::Readable => Ok(false),
                IndexState::WriteOnly => Ok(true),
                IndexState::Disabled => {
                    self.manager
                        .transition(tx.as_ref(), index_name, IndexState::WriteOnly)
                        .await?;
                    Ok(true)
                }
            }
        })
        .await?;
        if !ready {
            return Ok(BuildOutcome {
                completed: true,
                ..Default::default()
            });
        }

        let mut outcome = BuildOutcome::default();
        loop {
            if cancel.is_cancelled() {
                info!(index = %index_name, batches = outcome.batches, "online build cancelled");
                return Ok(outcome);
            }

            let batch = with_transaction(&self.db, &self.retry, |tx| {
                let registered = registered.clone();
                async move { self.run_batch(tx.as_ref(), &registered).await }
            })
            .await?;

            outcome.batches += 1;
            outcome.items_scanned += batch.processed as u64;
            debug!(
                index = %index_name,
                batch = outcome.batches,
                processed = batch.processed,
                bytes = batch.bytes,
                reached_end = batch.reached_end,
                "online build batch committed"
            );

            if batch.flipped {
                outcome.completed = true;
                info!(
                    index = %index_name,
                    items = outcome.items_scanned,
                    "online build complete, index readable"
                );
                return Ok(outcome);
            }
        }
    }

    /// One bounded batch. When the batch observes an empty tail without
    /// having processed anything, it performs the readable flip in the same
    /// transaction, which makes the tail verification and the flip atomic.
    async fn run_batch<T: KvTransaction>(
        &self,
        tx: &T,
        registered: &RegisteredIndex,
    ) -> Result<BatchResult, RuntimeError> {
        let name = registered.index.name();
        let state = self.manager.state(tx, name).await?;
        if state != IndexState::WriteOnly {
            return Err(IndexError::StateTransitionNotAllowed {
                index: name.to_string(),
                from: state,
                to: IndexState::Readable,
            }
            .into());
        }

        let progress = tx.get(&self.manager.progress_key(name)).await.map_err(IndexError::from)?;
        let mut result = BatchResult {
            processed: 0,
            bytes: 0,
            reached_end: true,
            flipped: false,
        };
        let mut last_position: Option<Vec<u8>> = None;

        'types: for item_type in &registered.index.item_types {
            let type_position = Tuple::new().with(item_type.as_str()).pack();
            let subspace = self.items.type_subspace(item_type);
            let (type_begin, type_end) = subspace.range();

            let mut cursor = match &progress {
                None => KeySelector::first_greater_or_equal(type_begin),
                Some(p) if p.as_slice() < type_position.as_slice() => {
                    KeySelector::first_greater_or_equal(type_begin)
                }
                Some(p) if p.starts_with(&type_position) => {
                    // Resume inside this type, strictly after the recorded id.
                    let mut key = subspace.prefix().to_vec();
                    key.extend_from_slice(&p[type_position.len()..]);
                    KeySelector::first_greater_than(key)
                }
                Some(_) => continue,
            };

            loop {
                let remaining = self.batch_items - result.processed;
                if remaining == 0 || result.bytes >= self.batch_bytes {
                    result.reached_end = false;
                    break 'types;
                }
                let page = tx
                    .get_range(
                        cursor.clone(),
                        KeySelector::first_greater_or_equal(type_end.clone()),
                        RangeOptions::limited(remaining),
                    )
                    .await
                    .map_err(IndexError::from)?;
                let exhausted = page.len() < remaining;

                let mut byte_capped = false;
                for kv in &page {
                    let id = subspace.unpack(&kv.key).map_err(IndexError::from)?;
                    let record = self.codec.decode(item_type, &kv.value)?;
                    registered
                        .maintainer
                        .scan_item(tx, item_type, &id, &record)
                        .await?;
                    result.processed += 1;
                    result.bytes += kv.value.len();
                    last_position = Some(crate::indexes::scan_position(item_type, &id));
                    if result.bytes >= self.batch_bytes {
                        byte_capped = true;
                        break;
                    }
                }
                if byte_capped {
                    result.reached_end = false;
                    break 'types;
                }

                match page.last() {
                    Some(last) if !exhausted => {
                        cursor = KeySelector::first_greater_than(last.key.clone());
                    }
                    _ => break,
                }
            }
        }

        if let Some(position) = &last_position {
            tx.set(&self.manager.progress_key(name), position);
        }

        if result.reached_end && result.processed == 0 {
            // Tail verified empty within this transaction: flip to readable
            // and drop the progress cell.
            self.manager
                .transition(tx, name, IndexState::Readable)
                .await?;
            tx.clear(&self.manager.progress_key(name));
            result.flipped = true;
        }

        Ok(result)
    }
}
