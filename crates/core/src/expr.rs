//! Key expressions: trees that derive ordered index tuples from a record.
//!
//! Evaluation is pure and deterministic. A `List` node fans one row out per
//! array element; `Concat` combines its children row-wise (cartesian product
//! when a child fans out). `Value` marks the trailing value column used by
//! aggregation kinds, and `Version` marks the position where the maintainer
//! appends the commit versionstamp.

use itertools::Itertools as _;
use serde::{Deserialize, Serialize};

use crate::errors::ExpressionError;
use crate::record::{FieldValue, RecordValue};
use crate::schema::{Entity, FieldType};
use crate::tuple::{Element, Tuple};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "expr", rename_all = "snake_case")]
pub enum KeyExpression {
    Field {
        name: String,
    },
    Nest {
        parent: String,
        child: Box<KeyExpression>,
    },
    Concat {
        children: Vec<KeyExpression>,
    },
    List {
        parent: String,
        child: Option<Box<KeyExpression>>,
    },
    Value {
        child: Box<KeyExpression>,
    },
    Version {
        child: Box<KeyExpression>,
    },
}

impl KeyExpression {
    pub fn field(name: impl Into<String>) -> Self {
        KeyExpression::Field { name: name.into() }
    }

    pub fn nest(parent: impl Into<String>, child: KeyExpression) -> Self {
        KeyExpression::Nest {
            parent: parent.into(),
            child: Box::new(child),
        }
    }

    pub fn concat(children: Vec<KeyExpression>) -> Self {
        KeyExpression::Concat { children }
    }

    pub fn list(parent: impl Into<String>, child: Option<KeyExpression>) -> Self {
        KeyExpression::List {
            parent: parent.into(),
            child: child.map(Box::new),
        }
    }

    pub fn value(child: KeyExpression) -> Self {
        KeyExpression::Value {
            child: Box::new(child),
        }
    }

    pub fn version(child: KeyExpression) -> Self {
        KeyExpression::Version {
            child: Box::new(child),
        }
    }

    /// Compiles `"a.b.c"` into `nest("a", nest("b", field("c")))`.
    pub fn from_dot_notation(path: &str) -> Result<Self, ExpressionError> {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ExpressionError::InvalidKeyPath(path.to_string()));
        }
        let mut expr = KeyExpression::field(segments[segments.len() - 1]);
        for segment in segments[..segments.len() - 1].iter().rev() {
            expr = KeyExpression::nest(*segment, expr);
        }
        Ok(expr)
    }

    /// Compiles a list of dotted paths into their concatenation.
    pub fn from_key_paths(paths: &[String]) -> Result<Self, ExpressionError> {
        if paths.is_empty() {
            return Err(ExpressionError::InvalidKeyPath(String::new()));
        }
        let mut children = paths
            .iter()
            .map(|p| Self::from_dot_notation(p))
            .collect::<Result<Vec<_>, _>>()?;
        if children.len() == 1 {
            Ok(children.pop().unwrap())
        } else {
            Ok(KeyExpression::concat(children))
        }
    }

    /// Like [`from_key_paths`], but consults the entity's declared field
    /// types so that a path crossing an array field compiles into a `List`
    /// fan-out at that segment.
    ///
    /// [`from_key_paths`]: KeyExpression::from_key_paths
    pub fn from_key_paths_for(
        paths: &[String],
        entity: &Entity,
    ) -> Result<Self, ExpressionError> {
        if paths.is_empty() {
            return Err(ExpressionError::InvalidKeyPath(String::new()));
        }
        let mut children = paths
            .iter()
            .map(|p| compile_typed_path(p, &entity.fields))
            .collect::<Result<Vec<_>, _>>()?;
        if children.len() == 1 {
            Ok(children.pop().unwrap())
        } else {
            Ok(KeyExpression::concat(children))
        }
    }

    /// Number of tuple columns one evaluated row carries.
    pub fn column_count(&self) -> usize {
        match self {
            KeyExpression::Field { .. } => 1,
            KeyExpression::Nest { child, .. } => child.column_count(),
            KeyExpression::Concat { children } => {
                children.iter().map(KeyExpression::column_count).sum()
            }
            KeyExpression::List { child, .. } => {
                child.as_ref().map_or(1, |c| c.column_count())
            }
            KeyExpression::Value { child } => child.column_count(),
            KeyExpression::Version { child } => child.column_count(),
        }
    }

    pub fn has_version_marker(&self) -> bool {
        match self {
            KeyExpression::Version { .. } => true,
            KeyExpression::Field { .. } => false,
            KeyExpression::Nest { child, .. } => child.has_version_marker(),
            KeyExpression::Concat { children } => {
                children.iter().any(KeyExpression::has_version_marker)
            }
            KeyExpression::List { child, .. } => {
                child.as_ref().is_some_and(|c| c.has_version_marker())
            }
            KeyExpression::Value { child } => child.has_version_marker(),
        }
    }

    /// Evaluates the expression against a record, producing one tuple per
    /// derived row.
    pub fn eval(&self, record: &RecordValue) -> Result<Vec<Tuple>, ExpressionError> {
        match self {
            KeyExpression::Field { name } => {
                let value = record
                    .get(name)
                    .ok_or_else(|| ExpressionError::FieldNotFound(name.clone()))?;
                Ok(vec![Tuple::new().with(value.to_element(name)?)])
            }
            KeyExpression::Nest { parent, child } => {
                let value = record
                    .get(parent)
                    .ok_or_else(|| ExpressionError::FieldNotFound(parent.clone()))?;
                match value {
                    FieldValue::Record(inner) => child.eval(inner),
                    other => Err(ExpressionError::TypeMismatch {
                        field: parent.clone(),
                        reason: format!("expected record, got {}", other.type_name()),
                    }),
                }
            }
            KeyExpression::Concat { children } => {
                if children.is_empty() {
                    return Ok(vec![Tuple::new()]);
                }
                let per_child: Vec<Vec<Tuple>> = children
                    .iter()
                    .map(|child| child.eval(record))
                    .collect::<Result<_, _>>()?;
                let rows = per_child
                    .into_iter()
                    .multi_cartesian_product()
                    .map(|combo| {
                        let mut row = Tuple::new();
                        for part in combo {
                            row.append(part);
                        }
                        row
                    })
                    .collect();
                Ok(rows)
            }
            KeyExpression::List { parent, child } => {
                let value = record
                    .get(parent)
                    .ok_or_else(|| ExpressionError::FieldNotFound(parent.clone()))?;
                let items = match value {
                    FieldValue::Array(items) => items,
                    other => {
                        return Err(ExpressionError::TypeMismatch {
                            field: parent.clone(),
                            reason: format!("expected array, got {}", other.type_name()),
                        })
                    }
                };
                let mut rows = Vec::new();
                for item in items {
                    match child {
                        None => rows.push(Tuple::new().with(item.to_element(parent)?)),
                        Some(child) => match item {
                            FieldValue::Record(inner) => rows.extend(child.eval(inner)?),
                            other => {
                                return Err(ExpressionError::TypeMismatch {
                                    field: parent.clone(),
                                    reason: format!(
                                        "expected record elements, got {}",
                                        other.type_name()
                                    ),
                                })
                            }
                        },
                    }
                }
                Ok(rows)
            }
            KeyExpression::Value { child } => child.eval(record),
            KeyExpression::Version { child } => child.eval(record),
        }
    }

    /// Evaluates and appends the id columns, the shape index entries use.
    pub fn eval_with_id(
        &self,
        record: &RecordValue,
        id: &Tuple,
    ) -> Result<Vec<Tuple>, ExpressionError> {
        let mut rows = self.eval(record)?;
        for row in &mut rows {
            row.append(id.clone());
        }
        Ok(rows)
    }
}

/// Compiles one dotted path using declared types, inserting `List` nodes at
/// array-typed segments.
fn compile_typed_path(
    path: &str,
    fields: &[crate::schema::FieldDef],
) -> Result<KeyExpression, ExpressionError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(ExpressionError::InvalidKeyPath(path.to_string()));
    }
    compile_segments(path, &segments, fields)
}

fn compile_segments(
    path: &str,
    segments: &[&str],
    fields: &[crate::schema::FieldDef],
) -> Result<KeyExpression, ExpressionError> {
    let segment = segments[0];
    let def = fields
        .iter()
        .find(|f| f.name == segment)
        .ok_or_else(|| ExpressionError::FieldNotFound(path.to_string()))?;

    let (is_array, element_type) = match &def.field_type {
        FieldType::Array { element } => (true, element.as_ref()),
        other => (false, other),
    };

    let rest = &segments[1..];
    if rest.is_empty() {
        return Ok(if is_array {
            KeyExpression::list(segment, None)
        } else {
            KeyExpression::field(segment)
        });
    }

    let inner_fields = match element_type {
        FieldType::Record { fields } => fields.as_slice(),
        _ => {
            return Err(ExpressionError::TypeMismatch {
                field: segment.to_string(),
                reason: "path descends into a non-record field".to_string(),
            })
        }
    };
    let child = compile_segments(path, rest, inner_fields)?;
    Ok(if is_array {
        KeyExpression::list(segment, Some(child))
    } else {
        KeyExpression::nest(segment, child)
    })
}
