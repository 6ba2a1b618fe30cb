use crate::block_run::BlockRun;
use bfs_types::{
    BFS_DISK_NAME_LENGTH, BFS_SUPERBLOCK_SIZE, BlockSize, ByteOrder, ParseError,
    SUPER_BLOCK_DISK_CLEAN, SUPER_BLOCK_MAGIC1, SUPER_BLOCK_MAGIC2, SUPER_BLOCK_MAGIC3,
    ensure_slice, read_fixed, trim_nul_padded,
};
use serde::{Deserialize, Serialize};

/// Parsed BFS superblock (`disk_super_block`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub name: String,
    pub byte_order: ByteOrder,
    pub magic1: u32,
    pub block_size: u32,
    pub block_shift: u32,
    pub num_blocks: i64,
    pub used_blocks: i64,
    pub inode_size: i32,
    pub magic2: u32,
    pub blocks_per_ag: i32,
    pub ag_shift: i32,
    pub num_ags: i32,
    pub flags: u32,
    pub log_blocks: BlockRun,
    pub log_start: i64,
    pub log_end: i64,
    pub magic3: u32,
    pub root_dir: BlockRun,
    pub indices: BlockRun,
}

impl Superblock {
    /// Parse a superblock from the 512-byte region read at its disk offset.
    ///
    /// The byte order is taken from `fs_byte_order`; every other field is
    /// decoded with it. No geometry validation happens here, see
    /// [`Superblock::validate`].
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        let _ = ensure_slice(region, 0, BFS_SUPERBLOCK_SIZE)?;

        let byte_order =
            ByteOrder::detect(read_fixed::<4>(region, 36)?).ok_or(ParseError::InvalidField {
                field: "fs_byte_order",
                reason: "neither little- nor big-endian marker",
            })?;
        let o = byte_order;

        let magic1 = o.read_u32(region, 32)?;
        if magic1 != SUPER_BLOCK_MAGIC1 {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SUPER_BLOCK_MAGIC1),
                actual: u64::from(magic1),
            });
        }

        Ok(Self {
            name: trim_nul_padded(ensure_slice(region, 0, BFS_DISK_NAME_LENGTH)?),
            byte_order,
            magic1,
            block_size: o.read_u32(region, 40)?,
            block_shift: o.read_u32(region, 44)?,
            num_blocks: o.read_i64(region, 48)?,
            used_blocks: o.read_i64(region, 56)?,
            inode_size: o.read_i32(region, 64)?,
            magic2: o.read_u32(region, 68)?,
            blocks_per_ag: o.read_i32(region, 72)?,
            ag_shift: o.read_i32(region, 76)?,
            num_ags: o.read_i32(region, 80)?,
            flags: o.read_u32(region, 84)?,
            log_blocks: BlockRun::parse(o, region, 88)?,
            log_start: o.read_i64(region, 96)?,
            log_end: o.read_i64(region, 104)?,
            magic3: o.read_u32(region, 112)?,
            root_dir: BlockRun::parse(o, region, 116)?,
            indices: BlockRun::parse(o, region, 124)?,
        })
    }

    /// Check magic numbers and geometry.
    ///
    /// Rules:
    /// - all three magics match
    /// - block size is a power of two in 1024..=65536 and equals the inode size
    /// - `1 << block_shift == block_size`
    /// - `num_ags >= 1`, `ag_shift >= 1`, `blocks_per_ag >= 1`, `num_blocks >= 10`
    /// - `num_ags == ceil(num_blocks / 2^ag_shift)`
    pub fn validate(&self) -> Result<(), ParseError> {
        for (expected, actual) in [
            (SUPER_BLOCK_MAGIC1, self.magic1),
            (SUPER_BLOCK_MAGIC2, self.magic2),
            (SUPER_BLOCK_MAGIC3, self.magic3),
        ] {
            if expected != actual {
                return Err(ParseError::InvalidMagic {
                    expected: u64::from(expected),
                    actual: u64::from(actual),
                });
            }
        }

        let block_size = BlockSize::new(self.block_size)?;
        if i64::from(self.inode_size) != i64::from(block_size.get()) {
            return Err(ParseError::InvalidField {
                field: "inode_size",
                reason: "must equal block_size",
            });
        }
        if self.block_shift != block_size.shift() {
            return Err(ParseError::InvalidField {
                field: "block_shift",
                reason: "1 << block_shift != block_size",
            });
        }

        if self.num_ags < 1 {
            return Err(ParseError::InvalidField {
                field: "num_ags",
                reason: "must be at least 1",
            });
        }
        if !(1..=48).contains(&self.ag_shift) {
            return Err(ParseError::InvalidField {
                field: "ag_shift",
                reason: "out of range",
            });
        }
        if self.blocks_per_ag < 1 {
            return Err(ParseError::InvalidField {
                field: "blocks_per_ag",
                reason: "must be at least 1",
            });
        }
        if self.num_blocks < 10 {
            return Err(ParseError::InvalidField {
                field: "num_blocks",
                reason: "volume too small",
            });
        }

        let group_blocks = 1_i64 << self.ag_shift;
        let expected_ags = self
            .num_blocks
            .checked_add(group_blocks - 1)
            .ok_or(ParseError::IntegerConversion {
                field: "num_blocks",
            })?
            >> self.ag_shift;
        if expected_ags != i64::from(self.num_ags) {
            return Err(ParseError::InvalidField {
                field: "num_ags",
                reason: "does not match ceil(num_blocks / 2^ag_shift)",
            });
        }

        Ok(())
    }

    /// Number of blocks in one allocation group (`2^ag_shift`).
    #[must_use]
    pub fn blocks_per_group(&self) -> u64 {
        1_u64 << self.ag_shift.clamp(0, 63)
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.flags == SUPER_BLOCK_DISK_CLEAN
    }
}
