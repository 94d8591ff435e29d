//! Keys and spans of the replicated keyspace.
//!
//! Row keys produced by the table codec end in a column family suffix. The last byte of such a
//! key is an ascending uvarint holding the length of the family id encoding that precedes it, so
//! stripping `len + 1` bytes from the end yields the row prefix shared by every column family of
//! the row. Sorting and partitioning on that prefix keeps all mutations to a row together.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Smallest single byte uvarint marker, encodes the value `0`.
const UVARINT_ZERO: u8 = 136;
/// Largest value that fits in a single byte uvarint.
const UVARINT_SMALL: u64 = 109;
/// Marker for the widest (8 byte) multi-byte uvarint.
const UVARINT_MAX: u8 = 253;

/// A key in the replicated keyspace, ordered lexicographically by its bytes.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Bytes);

impl Key {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub const fn from_static(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the key with its column family suffix removed.
    ///
    /// The returned key shares the underlying allocation with `self`.
    pub fn ensure_safe_split_key(&self) -> Result<Self> {
        let Some(&last) = self.0.last() else {
            return Err(Error::EmptyKey);
        };
        let suffix_len = decode_single_byte_uvarint(last).ok_or_else(|| {
            Error::MalformedFamilySuffix { key: self.clone() }
        })? as usize;
        match self.0.len().checked_sub(suffix_len + 1) {
            Some(prefix_len) if prefix_len > 0 => Ok(Self(self.0.slice(..prefix_len))),
            _ => Err(Error::MalformedFamilySuffix { key: self.clone() }),
        }
    }

    /// Returns the split-safe key when one can be derived, or a clone of the raw key otherwise.
    pub fn split_safe_or_raw(&self) -> Self {
        self.ensure_safe_split_key().unwrap_or_else(|_| self.clone())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            if b.is_ascii_graphic() {
                write!(f, "{}", *b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl From<Bytes> for Key {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl From<Vec<u8>> for Key {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl From<&'static str> for Key {
    fn from(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Build a row key for `family_id` under `row_prefix`, the inverse of
/// [`Key::ensure_safe_split_key`].
pub fn encode_family_key(row_prefix: &[u8], family_id: u64) -> Key {
    let mut buf = BytesMut::with_capacity(row_prefix.len() + 10);
    buf.put_slice(row_prefix);
    let before = buf.len();
    encode_uvarint_ascending(&mut buf, family_id);
    let family_len = (buf.len() - before) as u64;
    encode_uvarint_ascending(&mut buf, family_len);
    Key(buf.freeze())
}

fn encode_uvarint_ascending(buf: &mut BytesMut, v: u64) {
    if v <= UVARINT_SMALL {
        buf.put_u8(UVARINT_ZERO + v as u8);
        return;
    }
    let width = 8 - (v.leading_zeros() / 8) as usize;
    buf.put_u8(UVARINT_MAX - 8 + width as u8);
    buf.put_slice(&v.to_be_bytes()[8 - width..]);
}

fn decode_single_byte_uvarint(b: u8) -> Option<u64> {
    let v = b.checked_sub(UVARINT_ZERO)? as u64;
    (v <= UVARINT_SMALL).then_some(v)
}

/// A half-open range `[key, end_key)` of the keyspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub key: Key,
    pub end_key: Key,
}

impl Span {
    pub fn new(key: impl Into<Key>, end_key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            end_key: end_key.into(),
        }
    }

    /// A span is valid when its start sorts strictly before its end.
    pub fn is_valid(&self) -> bool {
        self.key < self.end_key
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.key < other.end_key && other.key < self.end_key
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        &self.key <= key && key < &self.end_key
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.key, self.end_key)
    }
}
