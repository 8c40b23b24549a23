//! Schema metadata: entities, declared field types, and versions.
//!
//! Entities are produced by an out-of-scope declarative facility; the runtime
//! consumes the resulting data only. A schema is immutable once constructed
//! and validated.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::errors::SchemaError;
use crate::index::IndexDescriptor;

/// Semantic schema version, totally ordered lexicographically.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SchemaVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SchemaVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        SchemaVersion {
            major,
            minor,
            patch,
        }
    }
}

impl Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Declared type of an entity field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    Int,
    Float,
    String,
    Bytes,
    Uuid,
    Record { fields: Vec<FieldDef> },
    Array { element: Box<FieldType> },
}

impl FieldType {
    /// Whether values of this type have a total order usable in index keys.
    pub fn is_ordered(&self) -> bool {
        !matches!(self, FieldType::Record { .. } | FieldType::Array { .. })
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Int | FieldType::Float)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    /// Wire tag; 1-based declared order unless overridden.
    pub field_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub indexes: Vec<IndexDescriptor>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Entity {
            name: name.into(),
            fields: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Builder-style field declaration; the wire tag follows declared order.
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        let field_number = self.fields.len() as u32 + 1;
        self.fields.push(FieldDef {
            name: name.into(),
            field_type,
            field_number,
        });
        self
    }

    pub fn index(mut self, descriptor: IndexDescriptor) -> Self {
        self.indexes.push(descriptor);
        self
    }

    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Resolves a dotted key path against declared types, descending through
    /// records and through array elements.
    pub fn resolve_path(&self, path: &str) -> Option<&FieldType> {
        let mut fields = &self.fields;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let def = fields.iter().find(|f| f.name == segment)?;
            let mut ty = &def.field_type;
            if let FieldType::Array { element } = ty {
                ty = element;
            }
            if segments.peek().is_none() {
                return Some(&def.field_type);
            }
            match ty {
                FieldType::Record { fields: inner } => fields = inner,
                _ => return None,
            }
        }
        None
    }
}

/// An ordered, validated set of entities plus the schema version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub version: SchemaVersion,
    pub entities: Vec<Entity>,
}

impl Schema {
    pub fn new(version: SchemaVersion, entities: Vec<Entity>) -> Result<Self, SchemaError> {
        let schema = Schema { version, entities };
        schema.validate()?;
        Ok(schema)
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Entity owning the descriptor with the given index name.
    pub fn entity_for_index(&self, index_name: &str) -> Option<&Entity> {
        self.entities
            .iter()
            .find(|e| e.indexes.iter().any(|d| d.name == index_name))
    }

    pub fn descriptor(&self, index_name: &str) -> Option<&IndexDescriptor> {
        self.entities
            .iter()
            .flat_map(|e| e.indexes.iter())
            .find(|d| d.name == index_name)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        let mut entity_names = std::collections::BTreeSet::new();
        let mut index_names = std::collections::BTreeSet::new();
        for entity in &self.entities {
            if !entity_names.insert(entity.name.as_str()) {
                return Err(SchemaError::DuplicateEntity(entity.name.clone()));
            }
            for descriptor in &entity.indexes {
                if !index_names.insert(descriptor.name.as_str()) {
                    return Err(SchemaError::DuplicateIndex(descriptor.name.clone()));
                }
                descriptor.validate_for(entity)?;
            }
        }
        Ok(())
    }
}
