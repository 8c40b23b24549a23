//! JSON item codec for test suites.
//!
//! The production wire codec is a collaborator outside this workspace; tests
//! only need *a* faithful `Codec`, and JSON keeps failures readable. Bytes
//! and UUIDs ride in tagged single-key objects since JSON has no native
//! representation for them.

use manifold_core::record::{FieldValue, RecordValue};
use manifold_core::{Codec, CodecError};

const BYTES_TAG: &str = "$bytes";
const UUID_TAG: &str = "$uuid";

#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        JsonCodec
    }

    fn to_json(value: &FieldValue) -> serde_json::Value {
        match value {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Bool(v) => (*v).into(),
            FieldValue::Int(v) => (*v).into(),
            FieldValue::Float(v) => (*v).into(),
            FieldValue::String(v) => v.clone().into(),
            FieldValue::Bytes(v) => {
                serde_json::json!({ BYTES_TAG: hex::encode(v) })
            }
            FieldValue::Uuid(v) => serde_json::json!({ UUID_TAG: v.to_string() }),
            FieldValue::Record(record) => Self::record_to_json(record),
            FieldValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
        }
    }

    fn record_to_json(record: &RecordValue) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for name in record.field_names() {
            map.insert(name.to_string(), Self::to_json(record.get(name).unwrap()));
        }
        serde_json::Value::Object(map)
    }

    fn from_json(entity: &str, value: &serde_json::Value) -> Result<FieldValue, CodecError> {
        let decode_err = |reason: String| CodecError::Decode {
            entity: entity.to_string(),
            reason,
        };
        match value {
            serde_json::Value::Null => Ok(FieldValue::Null),
            serde_json::Value::Bool(v) => Ok(FieldValue::Bool(*v)),
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Ok(FieldValue::Int(v))
                } else if let Some(v) = n.as_f64() {
                    Ok(FieldValue::Float(v))
                } else {
                    Err(decode_err(format!("unrepresentable number {n}")))
                }
            }
            serde_json::Value::String(v) => Ok(FieldValue::String(v.clone())),
            serde_json::Value::Array(items) => Ok(FieldValue::Array(
                items
                    .iter()
                    .map(|item| Self::from_json(entity, item))
                    .collect::<Result<_, _>>()?,
            )),
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(serde_json::Value::String(hexed)) = map.get(BYTES_TAG) {
                        let bytes = hex::decode(hexed)
                            .map_err(|e| decode_err(format!("bad bytes field: {e}")))?;
                        return Ok(FieldValue::Bytes(bytes));
                    }
                    if let Some(serde_json::Value::String(raw)) = map.get(UUID_TAG) {
                        let uuid = raw
                            .parse()
                            .map_err(|e| decode_err(format!("bad uuid field: {e}")))?;
                        return Ok(FieldValue::Uuid(uuid));
                    }
                }
                let mut record = RecordValue::new();
                for (name, value) in map {
                    record.set(name.clone(), Self::from_json(entity, value)?);
                }
                Ok(FieldValue::Record(record))
            }
        }
    }
}

impl Codec for JsonCodec {
    fn encode(&self, entity: &str, record: &RecordValue) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(&Self::record_to_json(record)).map_err(|e| CodecError::Encode {
            entity: entity.to_string(),
            reason: e.to_string(),
        })
    }

    fn decode(&self, entity: &str, bytes: &[u8]) -> Result<RecordValue, CodecError> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
                entity: entity.to_string(),
                reason: e.to_string(),
            })?;
        match Self::from_json(entity, &value)? {
            FieldValue::Record(record) => Ok(record),
            other => Err(CodecError::Decode {
                entity: entity.to_string(),
                reason: format!("top-level value is {}, not a record", other.type_name()),
            }),
        }
    }
}
