//! Prefixed key spaces.
//!
//! A subspace scopes tuple-encoded keys under a fixed byte prefix. Nesting a
//! subspace appends one packed element, so the resulting keys stay
//! order-preserving within the parent range.

use crate::errors::TupleError;
use crate::tuple::{next_prefix, Element, Tuple};

/// A packed key containing one incomplete versionstamp that the store fills
/// in at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionstampedKey {
    pub bytes: Vec<u8>,
    /// Byte offset of the 10-byte placeholder within `bytes`.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Subspace {
            prefix: prefix.into(),
        }
    }

    /// Subspace rooted at the packed form of `tuple`.
    pub fn from_tuple(tuple: &Tuple) -> Self {
        Subspace {
            prefix: tuple.pack(),
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Child subspace scoped by one more element.
    pub fn subspace(&self, element: impl Into<Element>) -> Subspace {
        let mut prefix = self.prefix.clone();
        prefix.extend(Tuple::new().with(element).pack());
        Subspace { prefix }
    }

    pub fn pack(&self, tuple: &Tuple) -> Vec<u8> {
        let mut out = self.prefix.clone();
        out.extend(tuple.pack());
        out
    }

    pub fn pack_with_versionstamp(
        &self,
        tuple: &Tuple,
    ) -> Result<VersionstampedKey, TupleError> {
        let (packed, offset) = tuple.pack_with_versionstamp()?;
        let mut bytes = self.prefix.clone();
        let offset = offset + bytes.len();
        bytes.extend(packed);
        Ok(VersionstampedKey { bytes, offset })
    }

    pub fn unpack(&self, key: &[u8]) -> Result<Tuple, TupleError> {
        let rest = key
            .strip_prefix(self.prefix.as_slice())
            .ok_or_else(|| TupleError::PrefixMismatch {
                prefix: self.prefix.clone(),
                key: key.to_vec(),
            })?;
        Tuple::unpack(rest)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key.starts_with(&self.prefix)
    }

    /// Right-open range covering every packed tuple under this subspace.
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        let mut begin = self.prefix.clone();
        begin.push(0x00);
        let end = next_prefix(&self.prefix);
        (begin, end)
    }

    /// Right-open range covering keys that extend `prefix_tuple` with more
    /// elements, i.e. an index prefix lookup.
    pub fn range_of(&self, prefix_tuple: &Tuple) -> (Vec<u8>, Vec<u8>) {
        let packed = self.pack(prefix_tuple);
        let end = next_prefix(&packed);
        (packed, end)
    }
}
