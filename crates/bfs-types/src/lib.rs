#![forbid(unsafe_code)]
//! Shared vocabulary for the BFS reader: on-disk constants, unit-carrying
//! newtypes, and byte-order aware field readers.
//!
//! Every multi-byte on-disk field goes through [`ByteOrder`]. BFS volumes
//! written on x86 are little-endian, while legacy PowerPC volumes are
//! big-endian; the superblock's `fs_byte_order` field says which.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Superblock ──────────────────────────────────────────────────────────────

/// Byte offset of the superblock on current volumes.
pub const BFS_SUPERBLOCK_OFFSET: u64 = 512;
/// Byte offset of the superblock on legacy big-endian volumes.
pub const BFS_LEGACY_SUPERBLOCK_OFFSET: u64 = 0;
/// Size of the superblock region read from the device.
pub const BFS_SUPERBLOCK_SIZE: usize = 512;

pub const SUPER_BLOCK_MAGIC1: u32 = 0x4246_5331; // 'BFS1'
pub const SUPER_BLOCK_MAGIC2: u32 = 0xdd12_1031;
pub const SUPER_BLOCK_MAGIC3: u32 = 0x15b6_830e;

/// `fs_byte_order` value as written by the volume's own byte order ('BIGE').
pub const SUPER_BLOCK_FS_BYTE_ORDER: u32 = 0x4249_4745;

pub const SUPER_BLOCK_DISK_CLEAN: u32 = 0x434c_454e; // 'CLEN'
pub const SUPER_BLOCK_DISK_DIRTY: u32 = 0x4449_5254; // 'DIRT'

/// Length of the NUL-padded volume name.
pub const BFS_DISK_NAME_LENGTH: usize = 32;

// ── Inode ───────────────────────────────────────────────────────────────────

pub const INODE_MAGIC1: u32 = 0x3bbe_0ad9;

pub const INODE_IN_USE: u32 = 0x0000_0001;
pub const INODE_ATTR_INODE: u32 = 0x0000_0004;
pub const INODE_LOGGED: u32 = 0x0000_0008;
pub const INODE_DELETED: u32 = 0x0000_0010;
pub const INODE_NOT_READY: u32 = 0x0000_0020;
pub const INODE_LONG_SYMLINK: u32 = 0x0000_0040;

/// Number of direct block runs in a data stream.
pub const NUM_DIRECT_BLOCKS: usize = 12;
/// Bytes available for a symlink target stored inside the inode.
pub const SHORT_SYMLINK_NAME_LENGTH: usize = 144;

/// Small-data type tag of the inode's own file name ('CSTR').
pub const FILE_NAME_TYPE: u32 = 0x4353_5452;
/// Small-data name of the inode's own file name.
pub const FILE_NAME_NAME: u8 = 0x13;

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of the POSIX mode).
pub const S_IFMT: u32 = 0o170_000;
pub const S_IFIFO: u32 = 0o010_000;
pub const S_IFCHR: u32 = 0o020_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFBLK: u32 = 0o060_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFLNK: u32 = 0o120_000;
pub const S_IFSOCK: u32 = 0o140_000;

// ── BFS-specific mode bits ──────────────────────────────────────────────────

/// Attribute directory of an inode.
pub const S_ATTR_DIR: u32 = 0o1_000_000_000;
/// Attribute file.
pub const S_ATTR: u32 = 0o2_000_000_000;
/// Index directory (the volume's index root or one index).
pub const S_INDEX_DIR: u32 = 0o4_000_000_000;

pub const S_STR_INDEX: u32 = 0o100_000_000;
pub const S_INT_INDEX: u32 = 0o200_000_000;
pub const S_UINT_INDEX: u32 = 0o400_000_000;
pub const S_LONG_LONG_INDEX: u32 = 0o010_000_000;
pub const S_ULONG_LONG_INDEX: u32 = 0o020_000_000;
pub const S_FLOAT_INDEX: u32 = 0o040_000_000;
pub const S_DOUBLE_INDEX: u32 = 0o001_000_000;
/// Tree may hold several values for one key.
pub const S_ALLOW_DUPS: u32 = 0o002_000_000;

/// Union of all index type bits.
pub const S_INDEX_TYPES: u32 = S_STR_INDEX
    | S_INT_INDEX
    | S_UINT_INDEX
    | S_LONG_LONG_INDEX
    | S_ULONG_LONG_INDEX
    | S_FLOAT_INDEX
    | S_DOUBLE_INDEX;

// ── B+tree ──────────────────────────────────────────────────────────────────

pub const BPLUSTREE_MAGIC: u32 = 0x69f6_c2e8;
pub const BPLUSTREE_NODE_SIZE: u32 = 1024;
pub const BPLUSTREE_HEADER_SIZE: usize = 40;
pub const BPLUSTREE_MIN_KEY_LENGTH: usize = 1;
pub const BPLUSTREE_MAX_KEY_LENGTH: usize = 256;

/// Link value meaning "no node".
pub const BPLUSTREE_NULL: i64 = -1;
/// Link value of a node on the free list.
pub const BPLUSTREE_FREE: i64 = -2;

pub const BPLUSTREE_STRING_TYPE: u32 = 0;
pub const BPLUSTREE_INT32_TYPE: u32 = 1;
pub const BPLUSTREE_UINT32_TYPE: u32 = 2;
pub const BPLUSTREE_INT64_TYPE: u32 = 3;
pub const BPLUSTREE_UINT64_TYPE: u32 = 4;
pub const BPLUSTREE_FLOAT_TYPE: u32 = 5;
pub const BPLUSTREE_DOUBLE_TYPE: u32 = 6;

/// Link type tags stored in the top two bits of a value.
pub const BPLUSTREE_NODE: u8 = 0;
pub const BPLUSTREE_DUPLICATE_NODE: u8 = 2;
pub const BPLUSTREE_DUPLICATE_FRAGMENT: u8 = 3;

/// Values held by one fragment of a shared duplicate node.
pub const NUM_FRAGMENT_VALUES: usize = 7;
/// Values held by a dedicated duplicate node.
pub const NUM_DUPLICATE_VALUES: usize = 125;

// ── Unit newtypes ───────────────────────────────────────────────────────────

/// Flat block number: `(allocation_group << ag_shift) | start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Inode identifier. On BFS this is the block number holding the inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeId(pub u64);

/// Byte offset on a `ByteDevice` (pread semantics).
///
/// This is a unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

/// Validated block size (must be a power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [1024, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(1024..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Block size as `usize`, for buffer allocation.
    #[must_use]
    pub fn as_usize(self) -> usize {
        // 65536 fits every supported target
        self.0 as usize
    }

    /// Convert a byte offset to a block number (truncating).
    #[must_use]
    pub fn byte_to_block(self, byte_offset: u64) -> BlockNumber {
        BlockNumber(byte_offset >> u64::from(self.shift()))
    }

    /// Convert a block number to a byte offset.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<u64> {
        block.0.checked_mul(u64::from(self.0))
    }
}

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Subtract a byte count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }
}

impl InodeId {
    /// The block this inode lives in.
    #[must_use]
    pub fn block(self) -> BlockNumber {
        BlockNumber(self.0)
    }
}

impl From<BlockNumber> for InodeId {
    fn from(block: BlockNumber) -> Self {
        Self(block.0)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

// ── Byte order ──────────────────────────────────────────────────────────────

/// Byte order of every multi-byte field on a given volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Decide the volume byte order from the raw `fs_byte_order` field.
    #[must_use]
    pub fn detect(raw: [u8; 4]) -> Option<Self> {
        if u32::from_le_bytes(raw) == SUPER_BLOCK_FS_BYTE_ORDER {
            Some(Self::Little)
        } else if u32::from_be_bytes(raw) == SUPER_BLOCK_FS_BYTE_ORDER {
            Some(Self::Big)
        } else {
            None
        }
    }

    #[inline]
    pub fn read_u16(self, data: &[u8], offset: usize) -> Result<u16, ParseError> {
        let raw = read_fixed::<2>(data, offset)?;
        Ok(match self {
            Self::Little => u16::from_le_bytes(raw),
            Self::Big => u16::from_be_bytes(raw),
        })
    }

    #[inline]
    pub fn read_u32(self, data: &[u8], offset: usize) -> Result<u32, ParseError> {
        let raw = read_fixed::<4>(data, offset)?;
        Ok(match self {
            Self::Little => u32::from_le_bytes(raw),
            Self::Big => u32::from_be_bytes(raw),
        })
    }

    #[inline]
    pub fn read_u64(self, data: &[u8], offset: usize) -> Result<u64, ParseError> {
        let raw = read_fixed::<8>(data, offset)?;
        Ok(match self {
            Self::Little => u64::from_le_bytes(raw),
            Self::Big => u64::from_be_bytes(raw),
        })
    }

    #[inline]
    pub fn read_i32(self, data: &[u8], offset: usize) -> Result<i32, ParseError> {
        let raw = read_fixed::<4>(data, offset)?;
        Ok(match self {
            Self::Little => i32::from_le_bytes(raw),
            Self::Big => i32::from_be_bytes(raw),
        })
    }

    #[inline]
    pub fn read_i64(self, data: &[u8], offset: usize) -> Result<i64, ParseError> {
        let raw = read_fixed::<8>(data, offset)?;
        Ok(match self {
            Self::Little => i64::from_le_bytes(raw),
            Self::Big => i64::from_be_bytes(raw),
        })
    }

    /// Encode helpers, used by image builders and tests.
    #[must_use]
    pub fn u16_bytes(self, value: u16) -> [u8; 2] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    #[must_use]
    pub fn u32_bytes(self, value: u32) -> [u8; 4] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    #[must_use]
    pub fn u64_bytes(self, value: u64) -> [u8; 8] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    #[must_use]
    pub fn i32_bytes(self, value: i32) -> [u8; 4] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    #[must_use]
    pub fn i64_bytes(self, value: i64) -> [u8; 8] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Little => f.write_str("little-endian"),
            Self::Big => f.write_str("big-endian"),
        }
    }
}

// ── Misc helpers ────────────────────────────────────────────────────────────

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// BFS timestamps keep seconds in the upper 48 bits of a `bigtime_t`.
#[must_use]
pub fn bfs_time_to_secs(raw: i64) -> i64 {
    raw >> 16
}
