//! B+tree header, node layout, and duplicate-link encoding.
//!
//! Node layout (`node_size` bytes, 1024 in practice):
//!
//! ```text
//! 0   left_link      i64
//! 8   right_link     i64
//! 16  overflow_link  i64   (NULL on leaves)
//! 24  all_key_count  u16
//! 26  all_key_length u16
//! 28  key bytes, packed
//!     u16 cumulative key end offsets, 8-byte aligned
//!     i64 values, one per key
//! ```
//!
//! A duplicate node reuses the same page: `overflow_link` holds the value
//! count and the values follow it. A fragment node is split into
//! 64-byte slots, each a count followed by up to seven values.

use bfs_types::{
    BPLUSTREE_DUPLICATE_FRAGMENT, BPLUSTREE_DUPLICATE_NODE, BPLUSTREE_HEADER_SIZE,
    BPLUSTREE_MAX_KEY_LENGTH, BPLUSTREE_NULL, ByteOrder, NUM_DUPLICATE_VALUES,
    NUM_FRAGMENT_VALUES, ParseError, align_up, ensure_slice,
};
use serde::{Deserialize, Serialize};

/// Fixed part of a node before the packed keys.
pub const NODE_HEADER_SIZE: usize = 28;

const FRAGMENT_OFFSET_MASK: u64 = 0x3fff_ffff_ffff_fc00;
const FRAGMENT_INDEX_MASK: u64 = 0x3ff;
/// Bytes per fragment slot: count plus `NUM_FRAGMENT_VALUES` values.
const FRAGMENT_SLOT_SIZE: usize = (NUM_FRAGMENT_VALUES + 1) * 8;
/// Byte offset of the duplicate array inside a duplicate node.
const DUPLICATE_ARRAY_OFFSET: usize = 16;

/// `bplustree_header`, stored at offset 0 of the tree's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BPlusTreeHeader {
    pub magic: u32,
    pub node_size: u32,
    pub max_number_of_levels: u32,
    pub data_type: u32,
    pub root_node_pointer: i64,
    pub free_node_pointer: i64,
    pub maximum_size: i64,
}

impl BPlusTreeHeader {
    pub fn parse(order: ByteOrder, data: &[u8]) -> Result<Self, ParseError> {
        let _ = ensure_slice(data, 0, BPLUSTREE_HEADER_SIZE)?;
        Ok(Self {
            magic: order.read_u32(data, 0)?,
            node_size: order.read_u32(data, 4)?,
            max_number_of_levels: order.read_u32(data, 8)?,
            data_type: order.read_u32(data, 12)?,
            root_node_pointer: order.read_i64(data, 16)?,
            free_node_pointer: order.read_i64(data, 24)?,
            maximum_size: order.read_i64(data, 32)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self, order: ByteOrder) -> [u8; BPLUSTREE_HEADER_SIZE] {
        let mut out = [0_u8; BPLUSTREE_HEADER_SIZE];
        out[0..4].copy_from_slice(&order.u32_bytes(self.magic));
        out[4..8].copy_from_slice(&order.u32_bytes(self.node_size));
        out[8..12].copy_from_slice(&order.u32_bytes(self.max_number_of_levels));
        out[12..16].copy_from_slice(&order.u32_bytes(self.data_type));
        out[16..24].copy_from_slice(&order.i64_bytes(self.root_node_pointer));
        out[24..32].copy_from_slice(&order.i64_bytes(self.free_node_pointer));
        out[32..40].copy_from_slice(&order.i64_bytes(self.maximum_size));
        out
    }

    /// `NULL`, or a positive offset that leaves room for a whole node.
    #[must_use]
    pub fn is_valid_link(&self, link: i64) -> bool {
        link == BPLUSTREE_NULL
            || (link > 0 && link <= self.maximum_size - i64::from(self.node_size))
    }
}

// ── Links ───────────────────────────────────────────────────────────────────

/// Link type tag stored in the top two bits.
#[must_use]
pub fn link_type(link: i64) -> u8 {
    ((link as u64) >> 62) as u8
}

/// Whether a leaf value points at duplicate storage rather than an inode.
#[must_use]
pub fn is_duplicate_link(link: i64) -> bool {
    matches!(
        link_type(link),
        BPLUSTREE_DUPLICATE_NODE | BPLUSTREE_DUPLICATE_FRAGMENT
    )
}

/// Node offset encoded in a duplicate link.
#[must_use]
pub fn fragment_offset(link: i64) -> i64 {
    ((link as u64) & FRAGMENT_OFFSET_MASK) as i64
}

/// Fragment slot index encoded in a duplicate link.
#[must_use]
pub fn fragment_index(link: i64) -> usize {
    ((link as u64) & FRAGMENT_INDEX_MASK) as usize
}

/// Build a tagged link (used by image builders).
#[must_use]
pub fn make_link(kind: u8, offset: i64, fragment: usize) -> i64 {
    let tag = u64::from(kind & 0x3) << 62;
    (tag | ((offset as u64) & FRAGMENT_OFFSET_MASK) | (fragment as u64 & FRAGMENT_INDEX_MASK))
        as i64
}

// ── Node view ───────────────────────────────────────────────────────────────

/// Borrowed view of one node page; decodes fields on access.
#[derive(Debug, Clone, Copy)]
pub struct NodeView<'a> {
    data: &'a [u8],
    order: ByteOrder,
    left_link: i64,
    right_link: i64,
    overflow_link: i64,
    key_count: u16,
    key_length: u16,
}

impl<'a> NodeView<'a> {
    pub fn new(order: ByteOrder, data: &'a [u8]) -> Result<Self, ParseError> {
        let _ = ensure_slice(data, 0, NODE_HEADER_SIZE)?;
        Ok(Self {
            data,
            order,
            left_link: order.read_i64(data, 0)?,
            right_link: order.read_i64(data, 8)?,
            overflow_link: order.read_i64(data, 16)?,
            key_count: order.read_u16(data, 24)?,
            key_length: order.read_u16(data, 26)?,
        })
    }

    #[must_use]
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    #[must_use]
    pub fn left_link(&self) -> i64 {
        self.left_link
    }

    #[must_use]
    pub fn right_link(&self) -> i64 {
        self.right_link
    }

    #[must_use]
    pub fn overflow_link(&self) -> i64 {
        self.overflow_link
    }

    #[must_use]
    pub fn num_keys(&self) -> u16 {
        self.key_count
    }

    #[must_use]
    pub fn all_key_length(&self) -> u16 {
        self.key_length
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.overflow_link == BPLUSTREE_NULL
    }

    /// Byte offset of the key-length table.
    #[must_use]
    pub fn key_lengths_offset(&self) -> usize {
        let raw = (NODE_HEADER_SIZE + usize::from(self.key_length)) as u64;
        // 28 + u16::MAX cannot overflow when rounded to 8
        align_up(raw, 8).unwrap_or(raw) as usize
    }

    /// Byte offset of the value array.
    #[must_use]
    pub fn values_offset(&self) -> usize {
        self.key_lengths_offset() + usize::from(self.key_count) * 2
    }

    /// Whether the value array ends inside the node.
    #[must_use]
    pub fn values_fit(&self) -> bool {
        self.values_offset() + usize::from(self.key_count) * 8 <= self.data.len()
    }

    pub fn value(&self, index: u16) -> Result<i64, ParseError> {
        self.order
            .read_i64(self.data, self.values_offset() + usize::from(index) * 8)
    }

    fn key_end(&self, index: u16) -> Result<usize, ParseError> {
        Ok(usize::from(self.order.read_u16(
            self.data,
            self.key_lengths_offset() + usize::from(index) * 2,
        )?))
    }

    /// Key bytes at `index`, bounds-checked against the node.
    ///
    /// Mirrors the probe check of the lookup path: the key plus one value
    /// and one length entry must fit in the node, and the key must not be
    /// longer than `BPLUSTREE_MAX_KEY_LENGTH`.
    pub fn key_at(&self, index: u16) -> Result<&'a [u8], ParseError> {
        if index >= self.key_count {
            return Err(ParseError::InvalidField {
                field: "key_index",
                reason: "beyond all_key_count",
            });
        }
        let start = if index == 0 {
            0
        } else {
            self.key_end(index - 1)?
        };
        let end = self.key_end(index)?;
        if end < start {
            return Err(ParseError::InvalidField {
                field: "key_lengths",
                reason: "offsets not ascending",
            });
        }
        let len = end - start;
        let key_start = NODE_HEADER_SIZE + start;
        if key_start + len + 8 + 2 > self.data.len() || len > BPLUSTREE_MAX_KEY_LENGTH {
            return Err(ParseError::InvalidField {
                field: "key",
                reason: "key exceeds node boundary",
            });
        }
        Ok(&self.data[key_start..key_start + len])
    }

    /// Number of values in the duplicate storage `link` points into.
    pub fn duplicate_count(&self, link: i64, is_fragment: bool) -> Result<usize, ParseError> {
        let (offset, max) = if is_fragment {
            let slot = fragment_index(link);
            if (slot + 1) * FRAGMENT_SLOT_SIZE > self.data.len() {
                return Err(ParseError::InvalidField {
                    field: "fragment_index",
                    reason: "slot outside node",
                });
            }
            (slot * FRAGMENT_SLOT_SIZE, NUM_FRAGMENT_VALUES)
        } else {
            (DUPLICATE_ARRAY_OFFSET, NUM_DUPLICATE_VALUES)
        };
        let count = self.order.read_i64(self.data, offset)?;
        match usize::try_from(count) {
            Ok(count) if count <= max => Ok(count),
            _ => Err(ParseError::InvalidField {
                field: "duplicate_count",
                reason: "negative or above array capacity",
            }),
        }
    }

    /// Value `index` of the duplicate storage `link` points into.
    pub fn duplicate_at(&self, link: i64, is_fragment: bool, index: usize) -> Result<i64, ParseError> {
        let base = if is_fragment {
            fragment_index(link) * FRAGMENT_SLOT_SIZE
        } else {
            DUPLICATE_ARRAY_OFFSET
        };
        self.order.read_i64(self.data, base + 8 + index * 8)
    }
}

/// Serialize a leaf or internal node page (used by image builders).
///
/// Returns `None` when the keys and values do not fit in `node_size`.
#[must_use]
pub fn encode_node(
    order: ByteOrder,
    node_size: usize,
    links: (i64, i64, i64),
    keys: &[&[u8]],
    values: &[i64],
) -> Option<Vec<u8>> {
    let key_bytes: usize = keys.iter().map(|k| k.len()).sum();
    let count = u16::try_from(keys.len()).ok()?;
    let key_length = u16::try_from(key_bytes).ok()?;
    let lengths_at = align_up((NODE_HEADER_SIZE + key_bytes) as u64, 8)? as usize;
    let values_at = lengths_at + keys.len() * 2;
    if values_at + values.len() * 8 > node_size || keys.len() != values.len() {
        return None;
    }

    let mut page = vec![0_u8; node_size];
    page[0..8].copy_from_slice(&order.i64_bytes(links.0));
    page[8..16].copy_from_slice(&order.i64_bytes(links.1));
    page[16..24].copy_from_slice(&order.i64_bytes(links.2));
    page[24..26].copy_from_slice(&order.u16_bytes(count));
    page[26..28].copy_from_slice(&order.u16_bytes(key_length));
    let mut at = NODE_HEADER_SIZE;
    for (i, key) in keys.iter().enumerate() {
        page[at..at + key.len()].copy_from_slice(key);
        at += key.len();
        let end = u16::try_from(at - NODE_HEADER_SIZE).ok()?;
        page[lengths_at + i * 2..lengths_at + i * 2 + 2].copy_from_slice(&order.u16_bytes(end));
    }
    for (i, value) in values.iter().enumerate() {
        page[values_at + i * 8..values_at + i * 8 + 8].copy_from_slice(&order.i64_bytes(*value));
    }
    Some(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfs_types::{BPLUSTREE_MAGIC, BPLUSTREE_NODE_SIZE};

    const ORDER: ByteOrder = ByteOrder::Little;

    fn header(maximum_size: i64) -> BPlusTreeHeader {
        BPlusTreeHeader {
            magic: BPLUSTREE_MAGIC,
            node_size: BPLUSTREE_NODE_SIZE,
            max_number_of_levels: 1,
            data_type: 0,
            root_node_pointer: 1024,
            free_node_pointer: BPLUSTREE_NULL,
            maximum_size,
        }
    }

    #[test]
    fn header_parses_back() {
        let h = header(4096);
        assert_eq!(BPlusTreeHeader::parse(ORDER, &h.to_bytes(ORDER)).expect("header"), h);
        assert!(BPlusTreeHeader::parse(ORDER, &[0_u8; 20]).is_err());
    }

    #[test]
    fn link_validity() {
        let h = header(4096);
        assert!(h.is_valid_link(BPLUSTREE_NULL));
        assert!(h.is_valid_link(1024));
        assert!(h.is_valid_link(3072));
        assert!(!h.is_valid_link(3073));
        assert!(!h.is_valid_link(0));
        assert!(!h.is_valid_link(-2));
    }

    #[test]
    fn duplicate_link_encoding() {
        let link = make_link(BPLUSTREE_DUPLICATE_FRAGMENT, 5 * 1024, 3);
        assert_eq!(link_type(link), BPLUSTREE_DUPLICATE_FRAGMENT);
        assert!(is_duplicate_link(link));
        assert_eq!(fragment_offset(link), 5 * 1024);
        assert_eq!(fragment_index(link), 3);

        let node = make_link(BPLUSTREE_DUPLICATE_NODE, 2048, 0);
        assert_eq!(link_type(node), BPLUSTREE_DUPLICATE_NODE);
        assert_eq!(fragment_offset(node), 2048);

        assert!(!is_duplicate_link(4242));
    }

    #[test]
    fn node_keys_and_values() {
        let keys: [&[u8]; 3] = [b"README", b"boot", b"home"];
        let page = encode_node(
            ORDER,
            1024,
            (BPLUSTREE_NULL, BPLUSTREE_NULL, BPLUSTREE_NULL),
            &keys,
            &[9, 5, 12],
        )
        .expect("fits");
        let node = NodeView::new(ORDER, &page).expect("node");
        assert!(node.is_leaf());
        assert_eq!(node.num_keys(), 3);
        assert_eq!(node.all_key_length(), 14);
        assert_eq!(node.key_lengths_offset(), 48);
        assert_eq!(node.values_offset(), 54);
        assert!(node.values_fit());
        assert_eq!(node.key_at(0).expect("key"), b"README");
        assert_eq!(node.key_at(2).expect("key"), b"home");
        assert_eq!(node.value(1).expect("value"), 5);
        assert!(node.key_at(3).is_err());
    }

    #[test]
    fn oversized_key_count_does_not_fit() {
        let mut page = encode_node(
            ORDER,
            1024,
            (BPLUSTREE_NULL, BPLUSTREE_NULL, BPLUSTREE_NULL),
            &[b"a".as_slice()],
            &[1],
        )
        .expect("fits");
        page[24..26].copy_from_slice(&ORDER.u16_bytes(200));
        let node = NodeView::new(ORDER, &page).expect("node");
        assert!(!node.values_fit());
    }

    #[test]
    fn key_beyond_boundary_is_rejected() {
        let mut page = encode_node(
            ORDER,
            1024,
            (BPLUSTREE_NULL, BPLUSTREE_NULL, BPLUSTREE_NULL),
            &[b"abc".as_slice()],
            &[1],
        )
        .expect("fits");
        let lengths_at = NodeView::new(ORDER, &page).expect("node").key_lengths_offset();
        page[lengths_at..lengths_at + 2].copy_from_slice(&ORDER.u16_bytes(1000));
        let node = NodeView::new(ORDER, &page).expect("node");
        assert!(node.key_at(0).is_err());
    }

    #[test]
    fn duplicate_arrays() {
        let mut page = vec![0_u8; 1024];
        // dedicated duplicate node: count at 16, values from 24
        page[16..24].copy_from_slice(&ORDER.i64_bytes(3));
        for (i, v) in [70_i64, 71, 72].iter().enumerate() {
            page[24 + i * 8..32 + i * 8].copy_from_slice(&ORDER.i64_bytes(*v));
        }
        let node = NodeView::new(ORDER, &page).expect("node");
        let link = make_link(BPLUSTREE_DUPLICATE_NODE, 1024, 0);
        assert_eq!(node.duplicate_count(link, false).expect("count"), 3);
        assert_eq!(node.duplicate_at(link, false, 2).expect("value"), 72);

        // fragment slot 2: count at 128, values from 136
        let mut page = vec![0_u8; 1024];
        page[128..136].copy_from_slice(&ORDER.i64_bytes(2));
        page[136..144].copy_from_slice(&ORDER.i64_bytes(80));
        page[144..152].copy_from_slice(&ORDER.i64_bytes(81));
        let node = NodeView::new(ORDER, &page).expect("node");
        let link = make_link(BPLUSTREE_DUPLICATE_FRAGMENT, 1024, 2);
        assert_eq!(node.duplicate_count(link, true).expect("count"), 2);
        assert_eq!(node.duplicate_at(link, true, 1).expect("value"), 81);

        page[128..136].copy_from_slice(&ORDER.i64_bytes(8));
        let node = NodeView::new(ORDER, &page).expect("node");
        assert!(node.duplicate_count(link, true).is_err());
    }
}
