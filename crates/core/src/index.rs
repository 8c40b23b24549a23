//! Index metadata: descriptors, kinds, persisted states, and the runtime
//! index compiled from a descriptor.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::errors::SchemaError;
use crate::expr::KeyExpression;
use crate::schema::{Entity, FieldType};

/// Which shape of entries a kind stores under its subspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubspaceStructure {
    /// One entry per derived row, id appended to the key.
    Flat,
    /// One reduced value per grouping key.
    Aggregation,
    /// Reserved for tree-shaped kinds.
    Hierarchical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexKind {
    Scalar,
    Count,
    Sum,
    Min,
    Max,
    Version,
}

impl IndexKind {
    /// Stable identifier used in configuration records and diagnostics.
    pub fn identifier(&self) -> &'static str {
        match self {
            IndexKind::Scalar => "scalar",
            IndexKind::Count => "count",
            IndexKind::Sum => "sum",
            IndexKind::Min => "min",
            IndexKind::Max => "max",
            IndexKind::Version => "version",
        }
    }

    pub fn structure(&self) -> SubspaceStructure {
        match self {
            IndexKind::Scalar | IndexKind::Version => SubspaceStructure::Flat,
            IndexKind::Count | IndexKind::Sum | IndexKind::Min | IndexKind::Max => {
                SubspaceStructure::Aggregation
            }
        }
    }

    /// Validates the declared types of the resolved key paths for this kind.
    fn validate_key_types(
        &self,
        index: &str,
        resolved: &[&FieldType],
    ) -> Result<(), SchemaError> {
        let scalar = |ty: &FieldType| match ty {
            FieldType::Array { element } => element.as_ref().clone(),
            other => other.clone(),
        };
        let all_ordered = |tys: &[&FieldType]| {
            tys.iter().all(|ty| scalar(ty).is_ordered())
        };
        let fail = |reason: &str| {
            Err(SchemaError::InvalidIndex {
                index: index.to_string(),
                reason: reason.to_string(),
            })
        };

        match self {
            IndexKind::Scalar | IndexKind::Version | IndexKind::Count => {
                if !all_ordered(resolved) {
                    return fail("every key field must be totally ordered");
                }
            }
            IndexKind::Sum => {
                if resolved.len() < 2 {
                    return fail("sum requires grouping fields plus a value field");
                }
                if !all_ordered(&resolved[..resolved.len() - 1]) {
                    return fail("grouping fields must be totally ordered");
                }
                if !scalar(resolved[resolved.len() - 1]).is_numeric() {
                    return fail("trailing value field must be numeric");
                }
            }
            IndexKind::Min | IndexKind::Max => {
                if resolved.is_empty() {
                    return fail("at least a value field is required");
                }
                if !all_ordered(&resolved[..resolved.len() - 1]) {
                    return fail("grouping fields must be totally ordered");
                }
                // The reduced cell holds an eight-byte numeric, so ordered
                // non-numeric trailing fields are rejected here even though
                // they would sort fine in a flat index.
                if !scalar(resolved[resolved.len() - 1]).is_numeric() {
                    return fail("trailing value field must be numeric");
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommonOptions {
    #[serde(default)]
    pub unique: bool,
}

/// Serializable index schema. Two descriptors are equal iff every field is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub key_paths: Vec<String>,
    pub kind: IndexKind,
    #[serde(default)]
    pub options: CommonOptions,
}

impl IndexDescriptor {
    pub fn new(
        name: impl Into<String>,
        kind: IndexKind,
        key_paths: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        IndexDescriptor {
            name: name.into(),
            key_paths: key_paths.into_iter().map(Into::into).collect(),
            kind,
            options: CommonOptions::default(),
        }
    }

    pub fn scalar(
        name: impl Into<String>,
        key_paths: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::new(name, IndexKind::Scalar, key_paths)
    }

    pub fn unique(mut self) -> Self {
        self.options.unique = true;
        self
    }

    /// Stable fingerprint over the canonical JSON encoding, persisted next to
    /// the index state to detect descriptor drift across processes.
    pub fn fingerprint(&self) -> u64 {
        let encoded = serde_json::to_vec(self).expect("descriptor serializes");
        xxh3_64(&encoded)
    }

    /// Checks the descriptor against the entity's declared field types.
    pub fn validate_for(&self, entity: &Entity) -> Result<(), SchemaError> {
        if self.key_paths.is_empty() {
            return Err(SchemaError::InvalidIndex {
                index: self.name.clone(),
                reason: "no key paths".to_string(),
            });
        }
        let mut resolved = Vec::with_capacity(self.key_paths.len());
        for path in &self.key_paths {
            let ty = entity.resolve_path(path).ok_or_else(|| SchemaError::InvalidIndex {
                index: self.name.clone(),
                reason: format!("key path {path:?} does not resolve on {}", entity.name),
            })?;
            resolved.push(ty);
        }
        self.kind.validate_key_types(&self.name, &resolved)
    }
}

/// Per-index persisted lifecycle state.
///
/// The single-byte encoding is part of the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Readable,
    Disabled,
    WriteOnly,
}

impl IndexState {
    pub fn to_byte(self) -> u8 {
        match self {
            IndexState::Readable => 0,
            IndexState::Disabled => 1,
            IndexState::WriteOnly => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(IndexState::Readable),
            1 => Some(IndexState::Disabled),
            2 => Some(IndexState::WriteOnly),
            _ => None,
        }
    }

    pub fn is_readable(self) -> bool {
        self == IndexState::Readable
    }

    /// Whether maintainers receive updates in this state.
    pub fn should_maintain(self) -> bool {
        matches!(self, IndexState::WriteOnly | IndexState::Readable)
    }

    /// Allowed transitions; identical states are a permitted no-op so that
    /// repeated lifecycle operations stay idempotent.
    pub fn can_transition_to(self, to: IndexState) -> bool {
        match (self, to) {
            (a, b) if a == b => true,
            (_, IndexState::Disabled) => true,
            (IndexState::Disabled, IndexState::WriteOnly) => true,
            (IndexState::WriteOnly, IndexState::Readable) => true,
            (IndexState::Readable, IndexState::WriteOnly) => true,
            _ => false,
        }
    }
}

/// Runtime form of a descriptor: compiled expression, subspace key, and the
/// item types it covers.
#[derive(Debug, Clone)]
pub struct Index {
    pub descriptor: IndexDescriptor,
    pub expr: KeyExpression,
    pub subspace_key: String,
    pub item_types: BTreeSet<String>,
}

impl Index {
    pub fn compile(descriptor: IndexDescriptor, entity: &Entity) -> Result<Self, SchemaError> {
        descriptor.validate_for(entity)?;
        let inner = KeyExpression::from_key_paths_for(&descriptor.key_paths, entity)
            .map_err(|e| SchemaError::InvalidIndex {
                index: descriptor.name.clone(),
                reason: e.to_string(),
            })?;
        let expr = match descriptor.kind {
            IndexKind::Version => KeyExpression::version(inner),
            IndexKind::Sum | IndexKind::Min | IndexKind::Max => mark_trailing_value(inner),
            IndexKind::Scalar | IndexKind::Count => inner,
        };
        let subspace_key = descriptor.name.clone();
        let item_types = BTreeSet::from([entity.name.clone()]);
        Ok(Index {
            descriptor,
            expr,
            subspace_key,
            item_types,
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn covers(&self, item_type: &str) -> bool {
        self.item_types.contains(item_type)
    }

    /// Expression with version/value markers stripped, used for grouping
    /// evaluation.
    pub fn grouping_expr(&self) -> &KeyExpression {
        match &self.expr {
            KeyExpression::Version { child } => child,
            other => other,
        }
    }
}

/// Wraps the trailing concat child in a `Value` marker.
fn mark_trailing_value(expr: KeyExpression) -> KeyExpression {
    match expr {
        KeyExpression::Concat { mut children } => {
            if let Some(last) = children.pop() {
                children.push(KeyExpression::value(last));
            }
            KeyExpression::concat(children)
        }
        single => KeyExpression::value(single),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Entity;

    fn order_entity() -> Entity {
        Entity::new("Order")
            .field("customer_id", FieldType::String)
            .field("amount", FieldType::Float)
            .field("note", FieldType::Bytes)
    }

    #[test]
    fn test_state_bytes_roundtrip() {
        for state in [IndexState::Readable, IndexState::Disabled, IndexState::WriteOnly] {
            assert_eq!(IndexState::from_byte(state.to_byte()), Some(state));
        }
        assert_eq!(IndexState::from_byte(3), None);
    }

    #[test]
    fn test_state_machine_table() {
        use IndexState::*;
        assert!(Disabled.can_transition_to(WriteOnly));
        assert!(WriteOnly.can_transition_to(Readable));
        assert!(Readable.can_transition_to(WriteOnly));
        assert!(Readable.can_transition_to(Disabled));
        assert!(!Disabled.can_transition_to(Readable));
        assert!(WriteOnly.can_transition_to(WriteOnly));
        assert!(WriteOnly.should_maintain());
        assert!(Readable.should_maintain());
        assert!(!Disabled.should_maintain());
        assert!(Readable.is_readable());
        assert!(!WriteOnly.is_readable());
    }

    #[test]
    fn test_descriptor_equality_and_fingerprint() {
        let a = IndexDescriptor::scalar("user_email", ["email"]).unique();
        let b = IndexDescriptor::scalar("user_email", ["email"]).unique();
        let c = IndexDescriptor::scalar("user_email", ["email"]);
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a, c);
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_descriptor_serde_roundtrip() {
        let desc = IndexDescriptor::new(
            "sum_amount_by_customer",
            IndexKind::Sum,
            ["customer_id", "amount"],
        );
        let json = serde_json::to_string(&desc).unwrap();
        let back: IndexDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn test_sum_requires_numeric_trailing() {
        let entity = order_entity();
        let bad = IndexDescriptor::new("s", IndexKind::Sum, ["customer_id", "note"]);
        assert!(matches!(
            bad.validate_for(&entity),
            Err(SchemaError::InvalidIndex { .. })
        ));
        let good = IndexDescriptor::new("s", IndexKind::Sum, ["customer_id", "amount"]);
        assert!(good.validate_for(&entity).is_ok());
    }

    #[test]
    fn test_sum_requires_two_fields() {
        let entity = order_entity();
        let bad = IndexDescriptor::new("s", IndexKind::Sum, ["amount"]);
        assert!(bad.validate_for(&entity).is_err());
    }

    #[test]
    fn test_compile_marks_version() {
        let entity = order_entity();
        let desc = IndexDescriptor::new("v", IndexKind::Version, ["customer_id"]);
        let index = Index::compile(desc, &entity).unwrap();
        assert!(index.expr.has_version_marker());
        assert_eq!(index.grouping_expr(), &KeyExpression::field("customer_id"));
    }

    #[test]
    fn test_compile_unknown_path() {
        let entity = order_entity();
        let desc = IndexDescriptor::scalar("x", ["missing"]);
        assert!(Index::compile(desc, &entity).is_err());
    }
}
