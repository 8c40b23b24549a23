//! Decoded item values.
//!
//! The wire codec is an external collaborator; the runtime only ever sees
//! items as a [`RecordValue`] — an accessor table from field names to typed
//! values. Key expressions walk this table to derive index tuples.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::errors::ExpressionError;
use crate::tuple::Element;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Record(RecordValue),
    Array(Vec<FieldValue>),
}

impl FieldValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "bool",
            FieldValue::Int(_) => "int",
            FieldValue::Float(_) => "float",
            FieldValue::String(_) => "string",
            FieldValue::Bytes(_) => "bytes",
            FieldValue::Uuid(_) => "uuid",
            FieldValue::Record(_) => "record",
            FieldValue::Array(_) => "array",
        }
    }

    /// Converts a scalar value into a tuple element for key derivation.
    pub fn to_element(&self, field: &str) -> Result<Element, ExpressionError> {
        match self {
            FieldValue::Null => Ok(Element::Null),
            FieldValue::Bool(v) => Ok(Element::Bool(*v)),
            FieldValue::Int(v) => Ok(Element::Int(*v)),
            FieldValue::Float(v) => Ok(Element::Float(*v)),
            FieldValue::String(v) => Ok(Element::String(v.clone())),
            FieldValue::Bytes(v) => Ok(Element::Bytes(v.clone())),
            FieldValue::Uuid(v) => Ok(Element::Uuid(*v)),
            FieldValue::Record(_) | FieldValue::Array(_) => Err(ExpressionError::TypeMismatch {
                field: field.to_string(),
                reason: format!("{} is not an indexable scalar", self.type_name()),
            }),
        }
    }
}

macro_rules! field_value_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for FieldValue {
            fn from(value: $ty) -> Self {
                FieldValue::$variant(value.into())
            }
        }
    };
}

field_value_from!(bool, Bool);
field_value_from!(i64, Int);
field_value_from!(i32, Int);
field_value_from!(f64, Float);
field_value_from!(&str, String);
field_value_from!(String, String);
field_value_from!(Vec<u8>, Bytes);
field_value_from!(Uuid, Uuid);
field_value_from!(RecordValue, Record);
field_value_from!(Vec<FieldValue>, Array);

/// A decoded item: an ordered map of field name to value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordValue {
    fields: BTreeMap<String, FieldValue>,
}

impl RecordValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field assignment.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, FieldValue)> for RecordValue {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        RecordValue {
            fields: iter.into_iter().collect(),
        }
    }
}
