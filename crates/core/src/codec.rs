//! Interface to the bytes-level item codec.
//!
//! The production codec (a length-prefixed, field-tagged wire format whose
//! field numbers come from the declared field order) lives outside this
//! runtime; everything here goes through this trait. Test suites use the JSON
//! codec from `manifold-testing`.

use crate::errors::CodecError;
use crate::record::RecordValue;

pub trait Codec: Send + Sync {
    fn encode(&self, entity: &str, record: &RecordValue) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, entity: &str, bytes: &[u8]) -> Result<RecordValue, CodecError>;
}
