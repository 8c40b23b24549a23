//! Scalar (value) index maintenance.
//!
//! Entry layout: `<idx_subspace>/<field_tuple>/<id_tuple>` with an empty
//! value. Updates compute the delta between the entry sets derived from the
//! old and new record, clearing `old \ new` and writing `new \ old`. Unique
//! indexes read the candidate prefix before any write goes out, so a
//! violation never leaves partial entries behind.

use std::collections::BTreeSet;

use tracing::trace;

use crate::errors::IndexError;
use crate::expr::KeyExpression;
use crate::kv::{KeySelector, KvTransaction, RangeOptions};
use crate::record::RecordValue;
use crate::subspace::Subspace;
use crate::tuple::Tuple;

use super::eval_rows;

/// One decoded scalar index entry.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub values: Tuple,
    pub id: Tuple,
}

#[derive(Debug, Clone)]
pub struct ScalarMaintainer {
    name: String,
    expr: KeyExpression,
    subspace: Subspace,
    unique: bool,
}

impl ScalarMaintainer {
    pub fn new(name: String, expr: KeyExpression, subspace: Subspace, unique: bool) -> Self {
        ScalarMaintainer {
            name,
            expr,
            subspace,
            unique,
        }
    }

    pub fn subspace(&self) -> &Subspace {
        &self.subspace
    }

    fn entry_keys(
        &self,
        record: &RecordValue,
        id: &Tuple,
    ) -> Result<BTreeSet<Vec<u8>>, IndexError> {
        let rows = self
            .expr
            .eval_with_id(record, id)
            .map_err(IndexError::from)?;
        Ok(rows.iter().map(|row| self.subspace.pack(row)).collect())
    }

    /// Fails when any row of `record` is already indexed under a different
    /// id. Must run before this maintainer writes anything.
    async fn check_uniqueness<T: KvTransaction>(
        &self,
        tx: &T,
        record: &RecordValue,
        id: &Tuple,
    ) -> Result<(), IndexError> {
        for row in eval_rows(&self.expr, record)? {
            let mut own = row.clone();
            own.append(id.clone());
            let own_key = self.subspace.pack(&own);
            let (begin, end) = self.subspace.range_of(&row);
            let existing = tx
                .get_range(
                    KeySelector::first_greater_or_equal(begin),
                    KeySelector::first_greater_or_equal(end),
                    RangeOptions::limited(2),
                )
                .await?;
            if existing.iter().any(|kv| kv.key != own_key) {
                return Err(IndexError::UniquenessViolation {
                    index: self.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub async fn update<T: KvTransaction>(
        &self,
        tx: &T,
        id: &Tuple,
        old: Option<&RecordValue>,
        new: Option<&RecordValue>,
    ) -> Result<(), IndexError> {
        if self.unique {
            if let Some(new) = new {
                self.check_uniqueness(tx, new, id).await?;
            }
        }

        let old_keys = match old {
            Some(record) => self.entry_keys(record, id)?,
            None => BTreeSet::new(),
        };
        let new_keys = match new {
            Some(record) => self.entry_keys(record, id)?,
            None => BTreeSet::new(),
        };

        for key in old_keys.difference(&new_keys) {
            tx.clear(key);
        }
        for key in new_keys.difference(&old_keys) {
            tx.set(key, &[]);
        }
        trace!(
            index = %self.name,
            cleared = old_keys.difference(&new_keys).count(),
            written = new_keys.difference(&old_keys).count(),
            "scalar index delta applied"
        );
        Ok(())
    }

    /// Right-open prefix lookup returning decoded entries in key order.
    pub async fn scan_prefix<T: KvTransaction>(
        &self,
        tx: &T,
        prefix: &Tuple,
        options: RangeOptions,
    ) -> Result<Vec<IndexEntry>, IndexError> {
        let (begin, end) = self.subspace.range_of(prefix);
        let pairs = tx
            .get_range(
                KeySelector::first_greater_or_equal(begin),
                KeySelector::first_greater_or_equal(end),
                options,
            )
            .await?;
        let columns = self.expr.column_count();
        pairs
            .into_iter()
            .map(|kv| {
                let tuple = self.subspace.unpack(&kv.key)?;
                let elements = tuple.into_elements();
                let split = columns.min(elements.len());
                let (values, id) = elements.split_at(split);
                Ok(IndexEntry {
                    values: Tuple::from_elements(values.to_vec()),
                    id: Tuple::from_elements(id.to_vec()),
                })
            })
            .collect()
    }

    pub fn compute_index_keys(
        &self,
        id: &Tuple,
        record: &RecordValue,
    ) -> Result<Vec<Vec<u8>>, IndexError> {
        Ok(self.entry_keys(record, id)?.into_iter().collect())
    }
}
