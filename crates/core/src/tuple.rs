//! Order-preserving tuple encoding.
//!
//! Keys are composed as tuples of typed elements and packed into bytes such
//! that byte-lexicographic order over the encodings equals element-wise order
//! over the tuples. All multi-byte scalars are big-endian for that reason,
//! variable-length elements are NUL-escaped and NUL-terminated, and signed
//! values are offset- or bit-transformed into an unsigned ordering.
//!
//! Supported elements: null, bool, i64, f64, bytes, utf-8 string, UUID,
//! nested tuple, and a 10-byte versionstamp filled in by the KV store at
//! commit time.

use uuid::Uuid;

use crate::errors::TupleError;

const NULL: u8 = 0x00;
const BYTES: u8 = 0x01;
const STRING: u8 = 0x02;
const NESTED: u8 = 0x05;
const INT_ZERO: u8 = 0x14;
const DOUBLE: u8 = 0x21;
const FALSE: u8 = 0x26;
const TRUE: u8 = 0x27;
const UUID: u8 = 0x30;
const VERSIONSTAMP: u8 = 0x33;

const ESCAPE: u8 = 0xff;

/// Size of an encoded versionstamp.
pub const VERSIONSTAMP_SIZE: usize = 10;

/// A commit-ordered token produced by the KV store.
///
/// The first eight bytes are the big-endian commit version, the trailing two
/// the in-batch order, so byte order equals commit order. An *incomplete*
/// stamp (all `0xff`) is a placeholder that the store substitutes during
/// commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Versionstamp([u8; VERSIONSTAMP_SIZE]);

impl Versionstamp {
    pub fn incomplete() -> Self {
        Versionstamp([0xff; VERSIONSTAMP_SIZE])
    }

    pub fn from_parts(commit_version: u64, batch_order: u16) -> Self {
        let mut bytes = [0u8; VERSIONSTAMP_SIZE];
        bytes[..8].copy_from_slice(&commit_version.to_be_bytes());
        bytes[8..].copy_from_slice(&batch_order.to_be_bytes());
        Versionstamp(bytes)
    }

    pub fn from_bytes(bytes: [u8; VERSIONSTAMP_SIZE]) -> Self {
        Versionstamp(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; VERSIONSTAMP_SIZE] {
        &self.0
    }

    pub fn is_incomplete(&self) -> bool {
        self.0 == [0xff; VERSIONSTAMP_SIZE]
    }

    pub fn commit_version(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().unwrap())
    }
}

impl std::fmt::Display for Versionstamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// One typed element of a tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    String(String),
    Uuid(Uuid),
    Nested(Tuple),
    Versionstamp(Versionstamp),
}

impl Element {
    fn encode(&self, out: &mut Vec<u8>, nested: bool) {
        match self {
            Element::Null => {
                out.push(NULL);
                // Inside a nested tuple NUL doubles as the terminator, so an
                // embedded null needs the escape marker to stay unambiguous.
                if nested {
                    out.push(ESCAPE);
                }
            }
            Element::Bool(false) => out.push(FALSE),
            Element::Bool(true) => out.push(TRUE),
            Element::Int(v) => encode_int(*v, out),
            Element::Float(v) => {
                out.push(DOUBLE);
                out.extend_from_slice(&transform_double(*v));
            }
            Element::Bytes(b) => {
                out.push(BYTES);
                escape_into(b, out);
                out.push(NULL);
            }
            Element::String(s) => {
                out.push(STRING);
                escape_into(s.as_bytes(), out);
                out.push(NULL);
            }
            Element::Uuid(u) => {
                out.push(UUID);
                out.extend_from_slice(u.as_bytes());
            }
            Element::Nested(t) => {
                out.push(NESTED);
                for e in &t.elements {
                    e.encode(out, true);
                }
                out.push(NULL);
            }
            Element::Versionstamp(v) => {
                out.push(VERSIONSTAMP);
                out.extend_from_slice(v.as_bytes());
            }
        }
    }

    pub fn is_incomplete_versionstamp(&self) -> bool {
        match self {
            Element::Versionstamp(v) => v.is_incomplete(),
            Element::Nested(t) => t.has_incomplete_versionstamp(),
            _ => false,
        }
    }
}

impl PartialOrd for Element {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        let mut a = Vec::new();
        let mut b = Vec::new();
        self.encode(&mut a, false);
        other.encode(&mut b, false);
        Some(a.cmp(&b))
    }
}

macro_rules! element_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Element {
            fn from(value: $ty) -> Self {
                Element::$variant(value.into())
            }
        }
    };
}

element_from!(bool, Bool);
element_from!(i64, Int);
element_from!(i32, Int);
element_from!(u32, Int);
element_from!(f64, Float);
element_from!(Vec<u8>, Bytes);
element_from!(&str, String);
element_from!(String, String);
element_from!(Uuid, Uuid);
element_from!(Tuple, Nested);
element_from!(Versionstamp, Versionstamp);

/// An ordered, heterogeneous sequence of elements.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tuple {
    elements: Vec<Element>,
}

impl Tuple {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_elements(elements: Vec<Element>) -> Self {
        Tuple { elements }
    }

    /// Builder-style append.
    pub fn with(mut self, element: impl Into<Element>) -> Self {
        self.elements.push(element.into());
        self
    }

    pub fn push(&mut self, element: impl Into<Element>) {
        self.elements.push(element.into());
    }

    pub fn append(&mut self, mut other: Tuple) {
        self.elements.append(&mut other.elements);
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn into_elements(self) -> Vec<Element> {
        self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn has_incomplete_versionstamp(&self) -> bool {
        self.elements.iter().any(Element::is_incomplete_versionstamp)
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for e in &self.elements {
            e.encode(&mut out, false);
        }
        out
    }

    /// Packs a tuple holding exactly one incomplete versionstamp, returning
    /// the encoding plus the byte offset where the store must substitute the
    /// commit stamp.
    pub fn pack_with_versionstamp(&self) -> Result<(Vec<u8>, usize), TupleError> {
        let mut out = Vec::new();
        let mut offsets = Vec::new();
        for e in &self.elements {
            if let Element::Versionstamp(v) = e {
                if v.is_incomplete() {
                    // +1 skips the type code written by encode.
                    offsets.push(out.len() + 1);
                }
            }
            e.encode(&mut out, false);
        }
        match offsets.len() {
            1 => Ok((out, offsets[0])),
            n => Err(TupleError::IncompleteVersionstampCount(n)),
        }
    }

    pub fn unpack(bytes: &[u8]) -> Result<Tuple, TupleError> {
        let mut pos = 0;
        let mut elements = Vec::new();
        while pos < bytes.len() {
            let (element, consumed) = decode_element(&bytes[pos..], false)?;
            elements.push(element);
            pos += consumed;
        }
        Ok(Tuple { elements })
    }
}

impl FromIterator<Element> for Tuple {
    fn from_iter<I: IntoIterator<Item = Element>>(iter: I) -> Self {
        Tuple {
            elements: iter.into_iter().collect(),
        }
    }
}

fn escape_into(data: &[u8], out: &mut Vec<u8>) {
    for &b in data {
        out.push(b);
        if b == NULL {
            out.push(ESCAPE);
        }
    }
}

fn encode_int(value: i64, out: &mut Vec<u8>) {
    if value == 0 {
        out.push(INT_ZERO);
        return;
    }
    if value > 0 {
        let magnitude = value as u64;
        let n = byte_len(magnitude);
        out.push(INT_ZERO + n as u8);
        out.extend_from_slice(&magnitude.to_be_bytes()[8 - n..]);
    } else {
        let magnitude = (value as i128).unsigned_abs() as u64;
        let n = byte_len(magnitude);
        let max = max_for_len(n);
        let encoded = max - magnitude;
        out.push(INT_ZERO - n as u8);
        out.extend_from_slice(&encoded.to_be_bytes()[8 - n..]);
    }
}

fn byte_len(magnitude: u64) -> usize {
    ((64 - magnitude.leading_zeros() as usize) + 7) / 8
}

fn max_for_len(n: usize) -> u64 {
    if n == 8 {
        u64::MAX
    } else {
        (1u64 << (8 * n)) - 1
    }
}

fn transform_double(value: f64) -> [u8; 8] {
    let bits = value.to_bits();
    let transformed = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    };
    transformed.to_be_bytes()
}

fn untransform_double(bytes: [u8; 8]) -> f64 {
    let raw = u64::from_be_bytes(bytes);
    let bits = if raw & (1 << 63) != 0 {
        raw & !(1 << 63)
    } else {
        !raw
    };
    f64::from_bits(bits)
}

fn take<'a>(bytes: &'a [u8], n: usize) -> Result<&'a [u8], TupleError> {
    bytes.get(..n).ok_or(TupleError::Truncated)
}

/// Decodes one element, returning it and the number of bytes consumed.
fn decode_element(bytes: &[u8], nested: bool) -> Result<(Element, usize), TupleError> {
    let code = *bytes.first().ok_or(TupleError::Truncated)?;
    let body = &bytes[1..];
    match code {
        NULL => {
            if nested {
                // Consumes the escape marker that distinguishes an embedded
                // null from the nested-tuple terminator.
                match body.first() {
                    Some(&ESCAPE) => Ok((Element::Null, 2)),
                    _ => Err(TupleError::Truncated),
                }
            } else {
                Ok((Element::Null, 1))
            }
        }
        FALSE => Ok((Element::Bool(false), 1)),
        TRUE => Ok((Element::Bool(true), 1)),
        BYTES => {
            let (data, consumed) = unescape(body)?;
            Ok((Element::Bytes(data), 1 + consumed))
        }
        STRING => {
            let (data, consumed) = unescape(body)?;
            let s = String::from_utf8(data).map_err(|_| TupleError::InvalidString)?;
            Ok((Element::String(s), 1 + consumed))
        }
        DOUBLE => {
            let raw = take(body, 8)?;
            Ok((Element::Float(untransform_double(raw.try_into().unwrap())), 9))
        }
        UUID => {
            let raw = take(body, 16)?;
            Ok((Element::Uuid(Uuid::from_bytes(raw.try_into().unwrap())), 17))
        }
        VERSIONSTAMP => {
            let raw = take(body, VERSIONSTAMP_SIZE)?;
            let stamp = Versionstamp::from_bytes(raw.try_into().unwrap());
            Ok((Element::Versionstamp(stamp), 1 + VERSIONSTAMP_SIZE))
        }
        NESTED => {
            let mut pos = 0;
            let mut elements = Vec::new();
            loop {
                match body.get(pos) {
                    None => return Err(TupleError::Truncated),
                    Some(&NULL) if body.get(pos + 1) != Some(&ESCAPE) => {
                        pos += 1;
                        break;
                    }
                    Some(_) => {
                        let (element, consumed) = decode_element(&body[pos..], true)?;
                        elements.push(element);
                        pos += consumed;
                    }
                }
            }
            Ok((Element::Nested(Tuple { elements }), 1 + pos))
        }
        code if (INT_ZERO - 8..=INT_ZERO + 8).contains(&code) => {
            if code == INT_ZERO {
                return Ok((Element::Int(0), 1));
            }
            let positive = code > INT_ZERO;
            let n = if positive {
                (code - INT_ZERO) as usize
            } else {
                (INT_ZERO - code) as usize
            };
            let raw = take(body, n)?;
            let mut buf = [0u8; 8];
            buf[8 - n..].copy_from_slice(raw);
            let magnitude = u64::from_be_bytes(buf);
            let value = if positive {
                i64::try_from(magnitude).map_err(|_| TupleError::IntegerOverflow)?
            } else {
                let magnitude = max_for_len(n) - magnitude;
                i64::try_from(-(magnitude as i128)).map_err(|_| TupleError::IntegerOverflow)?
            };
            Ok((Element::Int(value), 1 + n))
        }
        other => Err(TupleError::InvalidTypeCode(other)),
    }
}

/// Reads an escaped byte run up to its terminator; returns the raw data and
/// the encoded length including the terminator.
fn unescape(bytes: &[u8]) -> Result<(Vec<u8>, usize), TupleError> {
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        match bytes.get(pos) {
            None => return Err(TupleError::Truncated),
            Some(&NULL) => {
                if bytes.get(pos + 1) == Some(&ESCAPE) {
                    out.push(NULL);
                    pos += 2;
                } else {
                    return Ok((out, pos + 1));
                }
            }
            Some(&b) => {
                out.push(b);
                pos += 1;
            }
        }
    }
}

/// First key strictly greater than every key with the given prefix.
pub fn next_prefix(prefix: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last() {
        if *last == 0xff {
            out.pop();
        } else {
            *out.last_mut().unwrap() += 1;
            return out;
        }
    }
    // All-0xff prefixes have no successor; fall back to the maximal key.
    vec![0xff; prefix.len() + 1]
}
