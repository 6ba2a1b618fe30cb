use bfs_types::{ByteOrder, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Contiguous extent of blocks inside one allocation group.
///
/// Value type, copied freely. `length == 0` marks an unused slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRun {
    pub allocation_group: i32,
    pub start: u16,
    pub length: u16,
}

impl BlockRun {
    /// On-disk size of a `block_run`.
    pub const SIZE: usize = 8;

    #[must_use]
    pub const fn new(allocation_group: i32, start: u16, length: u16) -> Self {
        Self {
            allocation_group,
            start,
            length,
        }
    }

    pub fn parse(order: ByteOrder, data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            allocation_group: order.read_i32(data, offset)?,
            start: order.read_u16(data, offset + 4)?,
            length: order.read_u16(data, offset + 6)?,
        })
    }

    /// Serialize into the 8-byte on-disk form.
    #[must_use]
    pub fn to_bytes(self, order: ByteOrder) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0..4].copy_from_slice(&order.i32_bytes(self.allocation_group));
        out[4..6].copy_from_slice(&order.u16_bytes(self.start));
        out[6..8].copy_from_slice(&order.u16_bytes(self.length));
        out
    }

    /// Unused slot: all three fields zero.
    #[must_use]
    pub fn is_zero(self) -> bool {
        self.allocation_group == 0 && self.start == 0 && self.length == 0
    }
}

impl fmt::Display for BlockRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.allocation_group, self.start, self.length
        )
    }
}

/// Read `count` consecutive block runs starting at `offset`.
pub fn parse_block_runs(
    order: ByteOrder,
    data: &[u8],
    offset: usize,
    count: usize,
) -> Result<Vec<BlockRun>, ParseError> {
    (0..count)
        .map(|i| BlockRun::parse(order, data, offset + i * BlockRun::SIZE))
        .collect()
}
