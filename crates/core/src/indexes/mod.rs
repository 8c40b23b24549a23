//! Index maintainers.
//!
//! One maintainer per index kind, dispatched through a tagged sum. All of a
//! maintainer's entries live under its index subspace; the version kind also
//! writes the shared per-item version sidecar under `<root>/V`.
//!
//! Every maintainer implements the same surface: `update` applies the delta
//! between the old and new value of one item, `scan_item` re-applies a live
//! item during an online build, and `compute_index_keys` derives the keys an
//! item contributes (used by scrubbing and tests).

use crate::errors::IndexError;
use crate::expr::KeyExpression;
use crate::index::{Index, IndexKind, SubspaceStructure};
use crate::kv::{KvTransaction, NumericOperand};
use crate::record::RecordValue;
use crate::subspace::Subspace;
use crate::tuple::{Element, Tuple};

mod aggregate;
mod scalar;
mod version;

pub use aggregate::{CountMaintainer, Extremum, ExtremumMaintainer, SumMaintainer};
pub(crate) use aggregate::{decode_f64 as decode_f64_cell, decode_i64 as decode_i64_cell};
pub use scalar::{IndexEntry, ScalarMaintainer};
pub use version::{VersionEntry, VersionMaintainer};

/// Neutral scan position of an item, comparable against persisted build
/// progress: item types in ascending order, ids in key order within a type.
pub fn scan_position(item_type: &str, id: &Tuple) -> Vec<u8> {
    let mut tuple = Tuple::new().with(item_type);
    tuple.append(id.clone());
    tuple.pack()
}

#[derive(Debug, Clone)]
pub enum Maintainer {
    Scalar(ScalarMaintainer),
    Count(CountMaintainer),
    Sum(SumMaintainer),
    Extremum(ExtremumMaintainer),
    Version(VersionMaintainer),
}

impl Maintainer {
    /// Builds the maintainer for a compiled index. Entries go under
    /// `<index_space>/<subspace_key>`; the version kind additionally uses
    /// `version_space` for its per-item sidecar.
    pub fn for_index(index: &Index, index_space: &Subspace, version_space: &Subspace) -> Self {
        let subspace = index_space.subspace(index.subspace_key.as_str());
        let name = index.name().to_string();
        let expr = index.grouping_expr().clone();
        match index.descriptor.kind {
            IndexKind::Scalar => Maintainer::Scalar(ScalarMaintainer::new(
                name,
                expr,
                subspace,
                index.descriptor.options.unique,
            )),
            IndexKind::Count => Maintainer::Count(CountMaintainer::new(name, expr, subspace)),
            IndexKind::Sum => Maintainer::Sum(SumMaintainer::new(name, expr, subspace)),
            IndexKind::Min => Maintainer::Extremum(ExtremumMaintainer::new(
                name,
                expr,
                subspace,
                Extremum::Min,
            )),
            IndexKind::Max => Maintainer::Extremum(ExtremumMaintainer::new(
                name,
                expr,
                subspace,
                Extremum::Max,
            )),
            IndexKind::Version => Maintainer::Version(VersionMaintainer::new(
                name,
                expr,
                subspace,
                version_space.clone(),
            )),
        }
    }

    pub fn subspace(&self) -> &Subspace {
        match self {
            Maintainer::Scalar(m) => m.subspace(),
            Maintainer::Count(m) => m.subspace(),
            Maintainer::Sum(m) => m.subspace(),
            Maintainer::Extremum(m) => m.subspace(),
            Maintainer::Version(m) => m.subspace(),
        }
    }

    /// Aggregation kinds store reduced values, so during an online build
    /// their updates must be fenced by the builder's progress; flat kinds are
    /// idempotent per entry and need no fence.
    pub fn structure(&self) -> SubspaceStructure {
        match self {
            Maintainer::Scalar(_) | Maintainer::Version(_) => SubspaceStructure::Flat,
            Maintainer::Count(_) | Maintainer::Sum(_) | Maintainer::Extremum(_) => {
                SubspaceStructure::Aggregation
            }
        }
    }

    pub async fn update<T: KvTransaction>(
        &self,
        tx: &T,
        item_type: &str,
        id: &Tuple,
        old: Option<&RecordValue>,
        new: Option<&RecordValue>,
    ) -> Result<(), IndexError> {
        match self {
            Maintainer::Scalar(m) => m.update(tx, id, old, new).await,
            Maintainer::Count(m) => m.update(tx, old, new).await,
            Maintainer::Sum(m) => m.update(tx, old, new).await,
            Maintainer::Extremum(m) => m.update(tx, new).await,
            Maintainer::Version(m) => m.update(tx, item_type, id, old, new).await,
        }
    }

    /// Applies one live item during an online build.
    pub async fn scan_item<T: KvTransaction>(
        &self,
        tx: &T,
        item_type: &str,
        id: &Tuple,
        record: &RecordValue,
    ) -> Result<(), IndexError> {
        match self {
            Maintainer::Scalar(m) => m.update(tx, id, None, Some(record)).await,
            Maintainer::Count(m) => m.update(tx, None, Some(record)).await,
            Maintainer::Sum(m) => m.update(tx, None, Some(record)).await,
            Maintainer::Extremum(m) => m.update(tx, Some(record)).await,
            Maintainer::Version(m) => m.scan_item(tx, item_type, id, record).await,
        }
    }

    /// Keys the item contributes under the index subspace. For aggregation
    /// kinds these are the group cells; exact reduced values cannot be
    /// verified without a full rescan.
    pub fn compute_index_keys(
        &self,
        item_type: &str,
        id: &Tuple,
        record: &RecordValue,
    ) -> Result<Vec<Vec<u8>>, IndexError> {
        match self {
            Maintainer::Scalar(m) => m.compute_index_keys(id, record),
            Maintainer::Count(m) => m.compute_index_keys(record),
            Maintainer::Sum(m) => m.compute_index_keys(record),
            Maintainer::Extremum(m) => m.compute_index_keys(record),
            Maintainer::Version(m) => m.compute_index_keys(item_type, id, record),
        }
    }
}

/// Evaluates an expression, mapping failures to the index error surface.
pub(crate) fn eval_rows(
    expr: &KeyExpression,
    record: &RecordValue,
) -> Result<Vec<Tuple>, IndexError> {
    expr.eval(record).map_err(IndexError::from)
}

/// Splits one evaluated row into grouping columns and the trailing value.
pub(crate) fn split_trailing(
    index: &str,
    row: Tuple,
) -> Result<(Tuple, Element), IndexError> {
    let mut elements = row.into_elements();
    let value = elements.pop().ok_or_else(|| IndexError::InsufficientFields {
        index: index.to_string(),
    })?;
    Ok((Tuple::from_elements(elements), value))
}

/// Coerces a trailing element into an eight-byte numeric operand.
pub(crate) fn numeric_operand(
    index: &str,
    element: &Element,
) -> Result<NumericOperand, IndexError> {
    match element {
        Element::Int(v) => Ok(NumericOperand::Int(*v)),
        Element::Float(v) => Ok(NumericOperand::Float(*v)),
        _ => Err(IndexError::NonNumericValue {
            index: index.to_string(),
        }),
    }
}

/// Coerces a trailing element into the f64 domain used by sum indexes.
pub(crate) fn float_value(index: &str, element: &Element) -> Result<f64, IndexError> {
    match element {
        Element::Int(v) => Ok(*v as f64),
        Element::Float(v) => Ok(*v),
        _ => Err(IndexError::NonNumericValue {
            index: index.to_string(),
        }),
    }
}
