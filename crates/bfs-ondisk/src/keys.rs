//! Key types and the on-disk key ordering.
//!
//! The comparator is picked at runtime from the tree header's `data_type`,
//! so dispatch goes through a plain function table indexed by that tag.

use bfs_types::{
    BPLUSTREE_DOUBLE_TYPE, BPLUSTREE_FLOAT_TYPE, BPLUSTREE_INT32_TYPE, BPLUSTREE_INT64_TYPE,
    BPLUSTREE_STRING_TYPE, BPLUSTREE_UINT32_TYPE, BPLUSTREE_UINT64_TYPE, ByteOrder,
    S_DOUBLE_INDEX, S_FLOAT_INDEX, S_INT_INDEX, S_LONG_LONG_INDEX, S_STR_INDEX, S_UINT_INDEX,
    S_ULONG_LONG_INDEX,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Key type of a B+tree, from `bplustree_header::data_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    String,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float,
    Double,
}

type Comparator = fn(ByteOrder, &[u8], &[u8]) -> Ordering;

/// Indexed by `KeyType as usize`.
const COMPARATORS: [Comparator; 7] = [
    compare_strings,
    compare_i32,
    compare_u32,
    compare_i64,
    compare_u64,
    compare_f32,
    compare_f64,
];

impl KeyType {
    /// Decode a header `data_type`; `None` for unknown tags.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            BPLUSTREE_STRING_TYPE => Self::String,
            BPLUSTREE_INT32_TYPE => Self::Int32,
            BPLUSTREE_UINT32_TYPE => Self::Uint32,
            BPLUSTREE_INT64_TYPE => Self::Int64,
            BPLUSTREE_UINT64_TYPE => Self::Uint64,
            BPLUSTREE_FLOAT_TYPE => Self::Float,
            BPLUSTREE_DOUBLE_TYPE => Self::Double,
            _ => return None,
        })
    }

    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::String => BPLUSTREE_STRING_TYPE,
            Self::Int32 => BPLUSTREE_INT32_TYPE,
            Self::Uint32 => BPLUSTREE_UINT32_TYPE,
            Self::Int64 => BPLUSTREE_INT64_TYPE,
            Self::Uint64 => BPLUSTREE_UINT64_TYPE,
            Self::Float => BPLUSTREE_FLOAT_TYPE,
            Self::Double => BPLUSTREE_DOUBLE_TYPE,
        }
    }

    /// Index-type mode bit an index directory of this key type carries.
    #[must_use]
    pub fn index_mode(self) -> u32 {
        match self {
            Self::String => S_STR_INDEX,
            Self::Int32 => S_INT_INDEX,
            Self::Uint32 => S_UINT_INDEX,
            Self::Int64 => S_LONG_LONG_INDEX,
            Self::Uint64 => S_ULONG_LONG_INDEX,
            Self::Float => S_FLOAT_INDEX,
            Self::Double => S_DOUBLE_INDEX,
        }
    }

    /// Fixed key width, `None` for strings.
    #[must_use]
    pub fn width(self) -> Option<usize> {
        match self {
            Self::String => None,
            Self::Int32 | Self::Uint32 | Self::Float => Some(4),
            Self::Int64 | Self::Uint64 | Self::Double => Some(8),
        }
    }
}

/// Order two keys of the given type.
#[must_use]
pub fn compare_keys(key_type: KeyType, order: ByteOrder, a: &[u8], b: &[u8]) -> Ordering {
    COMPARATORS[key_type as usize](order, a, b)
}

/// `strncmp` over the shorter length, then shorter-first. One trailing NUL
/// on either key is not part of the name.
fn compare_strings(_order: ByteOrder, a: &[u8], b: &[u8]) -> Ordering {
    let a = a.strip_suffix(b"\0").unwrap_or(a);
    let b = b.strip_suffix(b"\0").unwrap_or(b);
    for (x, y) in a.iter().zip(b) {
        match x.cmp(y) {
            Ordering::Equal if *x == 0 => break,
            Ordering::Equal => {}
            unequal => return unequal,
        }
    }
    a.len().cmp(&b.len())
}

fn fixed<const N: usize>(key: &[u8]) -> Option<[u8; N]> {
    key.try_into().ok()
}

/// Decode both keys or fall back to comparing their lengths.
macro_rules! numeric_comparator {
    ($name:ident, $width:literal, $decode:path, $cmp:path) => {
        fn $name(order: ByteOrder, a: &[u8], b: &[u8]) -> Ordering {
            match (fixed::<$width>(a), fixed::<$width>(b)) {
                (Some(x), Some(y)) => $cmp(&$decode(order, x), &$decode(order, y)),
                _ => a.len().cmp(&b.len()),
            }
        }
    };
}

fn decode_u32(order: ByteOrder, raw: [u8; 4]) -> u32 {
    match order {
        ByteOrder::Little => u32::from_le_bytes(raw),
        ByteOrder::Big => u32::from_be_bytes(raw),
    }
}

fn decode_u64(order: ByteOrder, raw: [u8; 8]) -> u64 {
    match order {
        ByteOrder::Little => u64::from_le_bytes(raw),
        ByteOrder::Big => u64::from_be_bytes(raw),
    }
}

fn decode_i32(order: ByteOrder, raw: [u8; 4]) -> i32 {
    decode_u32(order, raw) as i32
}

fn decode_i64(order: ByteOrder, raw: [u8; 8]) -> i64 {
    decode_u64(order, raw) as i64
}

fn decode_f32(order: ByteOrder, raw: [u8; 4]) -> f32 {
    f32::from_bits(decode_u32(order, raw))
}

fn decode_f64(order: ByteOrder, raw: [u8; 8]) -> f64 {
    f64::from_bits(decode_u64(order, raw))
}

numeric_comparator!(compare_i32, 4, decode_i32, Ord::cmp);
numeric_comparator!(compare_u32, 4, decode_u32, Ord::cmp);
numeric_comparator!(compare_i64, 8, decode_i64, Ord::cmp);
numeric_comparator!(compare_u64, 8, decode_u64, Ord::cmp);
/// IEEE comparison: `-0.0 == 0.0`, and NaN compares equal to everything.
fn partial_order<T: PartialOrd>(a: &T, b: &T) -> Ordering {
    a.partial_cmp(b).unwrap_or(Ordering::Equal)
}

numeric_comparator!(compare_f32, 4, decode_f32, partial_order);
numeric_comparator!(compare_f64, 8, decode_f64, partial_order);
