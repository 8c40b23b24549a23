//! Aggregation index maintenance: count, sum, min, max.
//!
//! These kinds store one reduced eight-byte cell per grouping key and rely on
//! the store's commutative mutations, so concurrent contributions never need
//! a read-modify-write. Count cells are little-endian i64, sum cells are
//! little-endian f64, min/max cells carry the operand domain of the trailing
//! field.
//!
//! Min/max deletes cannot shrink the reduced value atomically: a delete (or
//! the old group of a group-changing update) leaves the cell possibly stale,
//! and a scrubber cannot detect this without a full rescan. Repair requires
//! `rebuild_index`.

use std::collections::BTreeMap;

use crate::errors::IndexError;
use crate::expr::KeyExpression;
use crate::kv::{AtomicMutation, KvTransaction, NumericOperand};
use crate::record::RecordValue;
use crate::subspace::Subspace;
use crate::tuple::Tuple;

use super::{eval_rows, float_value, numeric_operand, split_trailing};

#[derive(Debug, Clone)]
pub struct CountMaintainer {
    name: String,
    expr: KeyExpression,
    subspace: Subspace,
}

impl CountMaintainer {
    pub fn new(name: String, expr: KeyExpression, subspace: Subspace) -> Self {
        CountMaintainer {
            name,
            expr,
            subspace,
        }
    }

    pub fn subspace(&self) -> &Subspace {
        &self.subspace
    }

    fn group_keys(&self, record: &RecordValue) -> Result<Vec<Vec<u8>>, IndexError> {
        let rows = eval_rows(&self.expr, record)?;
        Ok(rows.iter().map(|row| self.subspace.pack(row)).collect())
    }

    pub async fn update<T: KvTransaction>(
        &self,
        tx: &T,
        old: Option<&RecordValue>,
        new: Option<&RecordValue>,
    ) -> Result<(), IndexError> {
        let mut deltas: BTreeMap<Vec<u8>, i64> = BTreeMap::new();
        if let Some(old) = old {
            for key in self.group_keys(old)? {
                *deltas.entry(key).or_default() -= 1;
            }
        }
        if let Some(new) = new {
            for key in self.group_keys(new)? {
                *deltas.entry(key).or_default() += 1;
            }
        }
        for (key, delta) in deltas {
            // Same-group updates cancel out to zero and stay untouched.
            if delta != 0 {
                tx.atomic(&key, AtomicMutation::Add(NumericOperand::Int(delta)));
            }
        }
        Ok(())
    }

    /// Reads the reduced count of one group; absent groups count zero.
    pub async fn group_count<T: KvTransaction>(
        &self,
        tx: &T,
        group: &Tuple,
    ) -> Result<i64, IndexError> {
        let raw = tx.get(&self.subspace.pack(group)).await?;
        Ok(raw.map(decode_i64).unwrap_or(0))
    }

    pub fn compute_index_keys(&self, record: &RecordValue) -> Result<Vec<Vec<u8>>, IndexError> {
        let mut keys = self.group_keys(record)?;
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone)]
pub struct SumMaintainer {
    name: String,
    expr: KeyExpression,
    subspace: Subspace,
}

impl SumMaintainer {
    pub fn new(name: String, expr: KeyExpression, subspace: Subspace) -> Self {
        SumMaintainer {
            name,
            expr,
            subspace,
        }
    }

    pub fn subspace(&self) -> &Subspace {
        &self.subspace
    }

    /// `(group cell, contribution)` pairs for one record. Rows must carry at
    /// least a grouping column plus the trailing numeric value.
    fn contributions(&self, record: &RecordValue) -> Result<Vec<(Vec<u8>, f64)>, IndexError> {
        let mut out = Vec::new();
        for row in eval_rows(&self.expr, record)? {
            if row.len() < 2 {
                return Err(IndexError::InsufficientFields {
                    index: self.name.clone(),
                });
            }
            let (group, value) = split_trailing(&self.name, row)?;
            out.push((self.subspace.pack(&group), float_value(&self.name, &value)?));
        }
        Ok(out)
    }

    pub async fn update<T: KvTransaction>(
        &self,
        tx: &T,
        old: Option<&RecordValue>,
        new: Option<&RecordValue>,
    ) -> Result<(), IndexError> {
        let mut deltas: BTreeMap<Vec<u8>, f64> = BTreeMap::new();
        if let Some(old) = old {
            for (key, value) in self.contributions(old)? {
                *deltas.entry(key).or_default() -= value;
            }
        }
        if let Some(new) = new {
            for (key, value) in self.contributions(new)? {
                *deltas.entry(key).or_default() += value;
            }
        }
        for (key, delta) in deltas {
            if delta != 0.0 {
                tx.atomic(&key, AtomicMutation::Add(NumericOperand::Float(delta)));
            }
        }
        Ok(())
    }

    /// Reads the reduced sum of one group; absent groups sum to zero.
    pub async fn group_sum<T: KvTransaction>(
        &self,
        tx: &T,
        group: &Tuple,
    ) -> Result<f64, IndexError> {
        let raw = tx.get(&self.subspace.pack(group)).await?;
        Ok(raw.map(decode_f64).unwrap_or(0.0))
    }

    pub fn compute_index_keys(&self, record: &RecordValue) -> Result<Vec<Vec<u8>>, IndexError> {
        let mut keys: Vec<_> = self
            .contributions(record)?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extremum {
    Min,
    Max,
}

#[derive(Debug, Clone)]
pub struct ExtremumMaintainer {
    name: String,
    expr: KeyExpression,
    subspace: Subspace,
    op: Extremum,
}

impl ExtremumMaintainer {
    pub fn new(name: String, expr: KeyExpression, subspace: Subspace, op: Extremum) -> Self {
        ExtremumMaintainer {
            name,
            expr,
            subspace,
            op,
        }
    }

    pub fn subspace(&self) -> &Subspace {
        &self.subspace
    }

    fn contributions(
        &self,
        record: &RecordValue,
    ) -> Result<Vec<(Vec<u8>, NumericOperand)>, IndexError> {
        let mut out = Vec::new();
        for row in eval_rows(&self.expr, record)? {
            let (group, value) = split_trailing(&self.name, row)?;
            out.push((
                self.subspace.pack(&group),
                numeric_operand(&self.name, &value)?,
            ));
        }
        Ok(out)
    }

    /// Applies the new value's contributions. Deletes (and the old group of
    /// a group-changing update) are intentionally not applied; see the module
    /// docs.
    pub async fn update<T: KvTransaction>(
        &self,
        tx: &T,
        new: Option<&RecordValue>,
    ) -> Result<(), IndexError> {
        let Some(new) = new else { return Ok(()) };
        for (key, operand) in self.contributions(new)? {
            let mutation = match self.op {
                Extremum::Min => AtomicMutation::Min(operand),
                Extremum::Max => AtomicMutation::Max(operand),
            };
            tx.atomic(&key, mutation);
        }
        Ok(())
    }

    /// Reads the raw reduced cell of one group; callers decode it in the
    /// operand domain of the trailing field.
    pub async fn group_value<T: KvTransaction>(
        &self,
        tx: &T,
        group: &Tuple,
    ) -> Result<Option<Vec<u8>>, IndexError> {
        Ok(tx.get(&self.subspace.pack(group)).await?)
    }

    pub fn compute_index_keys(&self, record: &RecordValue) -> Result<Vec<Vec<u8>>, IndexError> {
        let mut keys: Vec<_> = self
            .contributions(record)?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

pub(crate) fn decode_i64(raw: Vec<u8>) -> i64 {
    let mut buf = [0u8; 8];
    let len = raw.len().min(8);
    buf[..len].copy_from_slice(&raw[..len]);
    i64::from_le_bytes(buf)
}

pub(crate) fn decode_f64(raw: Vec<u8>) -> f64 {
    let mut buf = [0u8; 8];
    let len = raw.len().min(8);
    buf[..len].copy_from_slice(&raw[..len]);
    f64::from_le_bytes(buf)
}
