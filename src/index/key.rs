//! Index keys and collation-aware ordering.
//!
//! Keys are encoded as a type tag followed by the payload; strings and
//! binaries carry a u16 length. Numbers of different widths compare by value,
//! and the `MinValue`/`MaxValue` sentinels sort below/above everything.

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// String comparison settings stored in the file header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collation {
    /// Culture name, informational only
    pub culture: String,
    /// Compare strings after lowercasing
    pub ignore_case: bool,
}

impl Default for Collation {
    fn default() -> Self {
        Self {
            culture: "invariant".to_string(),
            ignore_case: true,
        }
    }
}

impl Collation {
    /// Ordinal, case-sensitive comparison
    pub fn binary() -> Self {
        Self {
            culture: "invariant".to_string(),
            ignore_case: false,
        }
    }

    pub fn compare_str(&self, a: &str, b: &str) -> Ordering {
        if self.ignore_case {
            a.chars()
                .flat_map(char::to_lowercase)
                .cmp(b.chars().flat_map(char::to_lowercase))
        } else {
            a.cmp(b)
        }
    }

    pub fn starts_with(&self, value: &str, prefix: &str) -> bool {
        if self.ignore_case {
            let mut value = value.chars().flat_map(char::to_lowercase);
            prefix
                .chars()
                .flat_map(char::to_lowercase)
                .all(|p| value.next() == Some(p))
        } else {
            value.starts_with(prefix)
        }
    }
}

/// A typed index key
#[derive(Debug, Clone, PartialEq)]
pub enum IndexKey {
    MinValue,
    Null,
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    ObjectId([u8; 12]),
    Guid([u8; 16]),
    Boolean(bool),
    /// Milliseconds since the unix epoch
    DateTime(i64),
    MaxValue,
}

mod tag {
    pub const MIN_VALUE: u8 = 0;
    pub const NULL: u8 = 1;
    pub const INT32: u8 = 2;
    pub const INT64: u8 = 3;
    pub const DOUBLE: u8 = 4;
    pub const STRING: u8 = 5;
    pub const BINARY: u8 = 6;
    pub const OBJECT_ID: u8 = 7;
    pub const GUID: u8 = 8;
    pub const BOOLEAN: u8 = 9;
    pub const DATE_TIME: u8 = 10;
    pub const MAX_VALUE: u8 = 11;
}

impl IndexKey {
    /// Rank used to order keys of different types
    fn type_rank(&self) -> u8 {
        match self {
            Self::MinValue => 0,
            Self::Null => 1,
            Self::Int32(_) | Self::Int64(_) | Self::Double(_) => 2,
            Self::String(_) => 3,
            Self::Binary(_) => 4,
            Self::ObjectId(_) => 5,
            Self::Guid(_) => 6,
            Self::Boolean(_) => 7,
            Self::DateTime(_) => 8,
            Self::MaxValue => 9,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, Self::MinValue | Self::MaxValue)
    }

    /// Compare two keys under a collation
    pub fn compare(&self, other: &IndexKey, collation: &Collation) -> Ordering {
        use IndexKey::*;

        match (self, other) {
            (Int32(a), Int32(b)) => a.cmp(b),
            (Int32(a), Int64(b)) => (*a as i64).cmp(b),
            (Int64(a), Int32(b)) => a.cmp(&(*b as i64)),
            (Int64(a), Int64(b)) => a.cmp(b),
            (Double(a), Double(b)) => a.total_cmp(b),
            (Double(a), Int32(b)) => compare_int_double(i64::from(*b), *a).reverse(),
            (Double(a), Int64(b)) => compare_int_double(*b, *a).reverse(),
            (Int32(a), Double(b)) => compare_int_double(i64::from(*a), *b),
            (Int64(a), Double(b)) => compare_int_double(*a, *b),
            (String(a), String(b)) => collation.compare_str(a, b),
            (Binary(a), Binary(b)) => a.cmp(b),
            (ObjectId(a), ObjectId(b)) => a.cmp(b),
            (Guid(a), Guid(b)) => a.cmp(b),
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    /// Number of bytes `encode` produces
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Self::MinValue | Self::Null | Self::MaxValue => 0,
            Self::Int32(_) => 4,
            Self::Int64(_) | Self::Double(_) | Self::DateTime(_) => 8,
            Self::String(s) => 2 + s.len(),
            Self::Binary(b) => 2 + b.len(),
            Self::ObjectId(_) => 12,
            Self::Guid(_) => 16,
            Self::Boolean(_) => 1,
        }
    }

    /// Append the encoded key to `out`
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let len = self.encoded_len();
        if len > crate::types::MAX_INDEX_KEY_LENGTH {
            return Err(StorageError::IndexKeyTooLong {
                size: len,
                max: crate::types::MAX_INDEX_KEY_LENGTH,
            });
        }

        match self {
            Self::MinValue => out.push(tag::MIN_VALUE),
            Self::Null => out.push(tag::NULL),
            Self::MaxValue => out.push(tag::MAX_VALUE),
            Self::Int32(v) => {
                out.push(tag::INT32);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Self::Int64(v) => {
                out.push(tag::INT64);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Self::Double(v) => {
                out.push(tag::DOUBLE);
                out.extend_from_slice(&v.to_bits().to_be_bytes());
            }
            Self::String(s) => {
                out.push(tag::STRING);
                out.extend_from_slice(&(s.len() as u16).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Self::Binary(b) => {
                out.push(tag::BINARY);
                out.extend_from_slice(&(b.len() as u16).to_be_bytes());
                out.extend_from_slice(b);
            }
            Self::ObjectId(id) => {
                out.push(tag::OBJECT_ID);
                out.extend_from_slice(id);
            }
            Self::Guid(id) => {
                out.push(tag::GUID);
                out.extend_from_slice(id);
            }
            Self::Boolean(v) => {
                out.push(tag::BOOLEAN);
                out.push(*v as u8);
            }
            Self::DateTime(v) => {
                out.push(tag::DATE_TIME);
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        Ok(())
    }

    /// Decode a key from the start of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&t, payload) = bytes.split_first().ok_or_else(truncated)?;

        let key = match t {
            tag::MIN_VALUE => Self::MinValue,
            tag::NULL => Self::Null,
            tag::MAX_VALUE => Self::MaxValue,
            tag::INT32 => Self::Int32(i32::from_be_bytes(fixed(payload)?)),
            tag::INT64 => Self::Int64(i64::from_be_bytes(fixed(payload)?)),
            tag::DOUBLE => Self::Double(f64::from_bits(u64::from_be_bytes(fixed(payload)?))),
            tag::DATE_TIME => Self::DateTime(i64::from_be_bytes(fixed(payload)?)),
            tag::STRING => {
                let s = std::str::from_utf8(var_len(payload)?)
                    .map_err(|_| StorageError::corruption("index key is not valid UTF-8"))?;
                Self::String(s.to_string())
            }
            tag::BINARY => Self::Binary(var_len(payload)?.to_vec()),
            tag::OBJECT_ID => Self::ObjectId(fixed(payload)?),
            tag::GUID => Self::Guid(fixed(payload)?),
            tag::BOOLEAN => Self::Boolean(fixed::<1>(payload)?[0] != 0),
            other => {
                return Err(StorageError::corruption(format!(
                    "unknown index key type tag {}",
                    other
                )))
            }
        };
        Ok(key)
    }
}

fn truncated() -> StorageError {
    StorageError::corruption("truncated index key")
}

fn fixed<const N: usize>(payload: &[u8]) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(payload.get(..N).ok_or_else(truncated)?);
    Ok(out)
}

fn var_len(payload: &[u8]) -> Result<&[u8]> {
    let len = u16::from_be_bytes(fixed(payload)?) as usize;
    payload.get(2..2 + len).ok_or_else(truncated)
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinValue => write!(f, "MinValue"),
            Self::Null => write!(f, "null"),
            Self::MaxValue => write!(f, "MaxValue"),
            Self::Int32(v) => write!(f, "{}", v),
            Self::Int64(v) => write!(f, "{}L", v),
            Self::Double(v) => write!(f, "{:?}", v),
            Self::String(s) => write!(f, "{:?}", s),
            Self::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Self::ObjectId(id) => id.iter().try_for_each(|b| write!(f, "{:02x}", b)),
            Self::Guid(id) => id.iter().try_for_each(|b| write!(f, "{:02x}", b)),
            Self::Boolean(v) => write!(f, "{}", v),
            Self::DateTime(v) => write!(f, "date({})", v),
        }
    }
}

impl From<i32> for IndexKey {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for IndexKey {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for IndexKey {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for IndexKey {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for IndexKey {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<bool> for IndexKey {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

/// Exact integer/double ordering, consistent with `f64::total_cmp` for
/// NaN and negative zero
fn compare_int_double(int: i64, double: f64) -> Ordering {
    // 2^63, the first double above i64::MAX
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;

    if double.is_nan() {
        return if double.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if double >= LIMIT {
        return Ordering::Less;
    }
    if double < -LIMIT {
        return Ordering::Greater;
    }

    let whole = double.trunc();
    match int.cmp(&(whole as i64)) {
        Ordering::Equal => {
            let fraction = double - whole;
            if fraction > 0.0 {
                Ordering::Less
            } else if fraction < 0.0 || (double.is_sign_negative() && int == 0) {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}
