#![forbid(unsafe_code)]
//! BFS volume: superblock discovery, block addressing, and block reads.
//!
//! A [`Volume`] owns the device and the validated superblock. Everything
//! above it (streams, trees, nodes) borrows the volume; nothing here ever
//! writes to the device.

use bfs_block::{ArcCache, ByteDevice, FileByteDevice, read_superblock_region};
use bfs_error::{BfsError, Result};
use bfs_ondisk::{BlockRun, Superblock};
use bfs_types::{
    BFS_LEGACY_SUPERBLOCK_OFFSET, BFS_SUPERBLOCK_OFFSET, BlockNumber, BlockSize, ByteOrder,
    InodeId, ParseError,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, error, trace};

/// Options for opening a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Retry the superblock at byte 0 when the one at byte 512 is invalid.
    pub probe_legacy_offset: bool,
    /// Blocks held by a shared ARC cache under every read. `0` disables it.
    pub cache_blocks: usize,
    /// Symlinks followed during one path resolution before giving up.
    pub max_symlink_depth: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            probe_legacy_offset: true,
            cache_blocks: 0,
            max_symlink_depth: 40,
        }
    }
}

/// Convert a parse error into the runtime taxonomy.
///
/// Every structural parse failure is corruption of whatever was being read,
/// so the caller supplies the device offset it came from.
#[must_use]
pub fn parse_to_bfs_error(offset: u64, e: &ParseError) -> BfsError {
    BfsError::bad_data(offset, e.to_string())
}

/// An opened, validated BFS volume.
pub struct Volume {
    dev: Box<dyn ByteDevice>,
    superblock: Superblock,
    superblock_offset: u64,
    block_size: BlockSize,
    options: OpenOptions,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.superblock.name)
            .field("block_size", &self.block_size)
            .field("num_blocks", &self.superblock.num_blocks)
            .field("superblock_offset", &self.superblock_offset)
            .finish_non_exhaustive()
    }
}

impl Volume {
    /// Open an image file with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &OpenOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let dev = FileByteDevice::open(path.as_ref())?;
        Self::from_device(Box::new(dev), options)
    }

    /// Initialise from an already-opened device.
    ///
    /// Reads the superblock at byte 512 and, if that one does not validate
    /// and `probe_legacy_offset` is set, at byte 0. When `cache_blocks` is
    /// non-zero the device is wrapped in an [`ArcCache`] sized in blocks.
    pub fn from_device(dev: Box<dyn ByteDevice>, options: &OpenOptions) -> Result<Self> {
        let (superblock, superblock_offset) = match load_superblock(&*dev, BFS_SUPERBLOCK_OFFSET)
        {
            Ok(sb) => (sb, BFS_SUPERBLOCK_OFFSET),
            Err(primary) if options.probe_legacy_offset => {
                debug!(error = %primary, "superblock_probe_legacy_offset");
                let sb = load_superblock(&*dev, BFS_LEGACY_SUPERBLOCK_OFFSET).map_err(|legacy| {
                    BfsError::BadSuperblock(format!("at 512: {primary}; at 0: {legacy}"))
                })?;
                (sb, BFS_LEGACY_SUPERBLOCK_OFFSET)
            }
            Err(primary) => return Err(BfsError::BadSuperblock(primary)),
        };

        let block_size = BlockSize::new(superblock.block_size)
            .map_err(|e| BfsError::BadSuperblock(e.to_string()))?;

        let dev: Box<dyn ByteDevice> = if options.cache_blocks > 0 {
            Box::new(ArcCache::new(dev, block_size.get(), options.cache_blocks)?)
        } else {
            dev
        };

        debug!(
            name = %superblock.name,
            byte_order = %superblock.byte_order,
            block_size = block_size.get(),
            num_blocks = superblock.num_blocks,
            num_ags = superblock.num_ags,
            ag_shift = superblock.ag_shift,
            superblock_offset,
            cache_blocks = options.cache_blocks,
            "volume_open"
        );

        Ok(Self {
            dev,
            superblock,
            superblock_offset,
            block_size,
            options: options.clone(),
        })
    }

    /// Open an in-memory image with default options.
    pub fn from_bytes(image: Vec<u8>) -> Result<Self> {
        Self::from_device(
            Box::new(bfs_block::MemoryByteDevice::new(image)),
            &OpenOptions::default(),
        )
    }

    // ── Accessors ─────────────────────────────────────────────────────

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// Byte offset the superblock was found at (512, or 0 for legacy images).
    #[must_use]
    pub fn superblock_offset(&self) -> u64 {
        self.superblock_offset
    }

    #[must_use]
    pub fn options(&self) -> &OpenOptions {
        &self.options
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.superblock.name
    }

    #[must_use]
    pub fn byte_order(&self) -> ByteOrder {
        self.superblock.byte_order
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn block_shift(&self) -> u32 {
        self.block_size.shift()
    }

    /// Inode size in bytes; validated equal to the block size.
    #[must_use]
    pub fn inode_size(&self) -> usize {
        self.block_size.as_usize()
    }

    #[must_use]
    pub fn num_blocks(&self) -> u64 {
        u64::try_from(self.superblock.num_blocks).unwrap_or(0)
    }

    #[must_use]
    pub fn allocation_groups(&self) -> u32 {
        u32::try_from(self.superblock.num_ags).unwrap_or(0)
    }

    #[must_use]
    pub fn allocation_group_shift(&self) -> u32 {
        u32::try_from(self.superblock.ag_shift).unwrap_or(0)
    }

    /// Root directory run.
    #[must_use]
    pub fn root(&self) -> BlockRun {
        self.superblock.root_dir
    }

    /// Index directory run; all zero on volumes without indices.
    #[must_use]
    pub fn indices(&self) -> BlockRun {
        self.superblock.indices
    }

    #[must_use]
    pub fn device(&self) -> &dyn ByteDevice {
        &*self.dev
    }

    // ── Block arithmetic ──────────────────────────────────────────────

    /// `(allocation_group << ag_shift) | start`.
    ///
    /// Callers validate the run first; a negative group maps to block 0.
    #[must_use]
    pub fn to_block(&self, run: BlockRun) -> BlockNumber {
        let group = u64::try_from(run.allocation_group).unwrap_or(0);
        BlockNumber((group << self.allocation_group_shift()) | u64::from(run.start))
    }

    /// Byte offset of the first block of `run`.
    #[must_use]
    pub fn to_offset(&self, run: BlockRun) -> u64 {
        self.block_to_offset(self.to_block(run))
    }

    #[must_use]
    pub fn block_to_offset(&self, block: BlockNumber) -> u64 {
        block.0 << self.block_shift()
    }

    /// Single-block run addressing `block` (inverse of [`Volume::to_block`]).
    pub fn to_block_run(&self, block: BlockNumber) -> Result<BlockRun> {
        let shift = self.allocation_group_shift();
        let group = i32::try_from(block.0 >> shift)
            .map_err(|_| BfsError::BadValue(format!("block {block} beyond addressable groups")))?;
        let start = u16::try_from(block.0 & ((1_u64 << shift) - 1))
            .map_err(|_| BfsError::BadValue(format!("block {block} start exceeds u16")))?;
        Ok(BlockRun::new(group, start, 1))
    }

    /// Inode ids are the block numbers holding the inodes.
    #[must_use]
    pub fn to_inode_id(&self, run: BlockRun) -> InodeId {
        InodeId::from(self.to_block(run))
    }

    /// Reject runs outside the volume's allocation groups.
    pub fn validate_block_run(&self, run: BlockRun) -> Result<()> {
        let group_blocks = 1_u64 << self.allocation_group_shift();
        let start = u64::from(run.start);
        let in_group_range =
            run.allocation_group >= 0 && run.allocation_group < self.superblock.num_ags;
        if !in_group_range
            || start > group_blocks
            || run.length == 0
            || start + u64::from(run.length) > group_blocks
        {
            error!(
                invariant = "block_run_in_bounds",
                allocation_group = run.allocation_group,
                start = run.start,
                length = run.length,
                num_ags = self.superblock.num_ags,
                group_blocks,
                "block_run_invariant_violation"
            );
            return Err(BfsError::bad_data(
                if in_group_range {
                    self.to_offset(run)
                } else {
                    0
                },
                format!("invalid block run {run}"),
            ));
        }
        Ok(())
    }

    // ── Raw reads ─────────────────────────────────────────────────────

    /// Read `buf.len()` bytes at an absolute byte offset.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.dev.read_exact_at(offset, buf)
    }

    /// Read `count` whole blocks starting at `block`.
    pub fn read_blocks(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        trace!(block = block.0, len = buf.len(), "volume_read_blocks");
        self.read_at(self.block_to_offset(block), buf)
    }
}

fn load_superblock(dev: &dyn ByteDevice, offset: u64) -> std::result::Result<Superblock, String> {
    let region = read_superblock_region(dev, offset).map_err(|e| e.to_string())?;
    let sb = Superblock::parse_region(&region).map_err(|e| e.to_string())?;
    sb.validate().map_err(|e| e.to_string())?;
    Ok(sb)
}

// ── CachedBlock ─────────────────────────────────────────────────────────────

/// One-block read-through buffer, owned by the calling frame.
///
/// Re-reads only when asked for a different block than the one it holds.
#[derive(Debug)]
pub struct CachedBlock<'v> {
    volume: &'v Volume,
    block: Option<BlockNumber>,
    data: Vec<u8>,
}

impl<'v> CachedBlock<'v> {
    #[must_use]
    pub fn new(volume: &'v Volume) -> Self {
        Self {
            volume,
            block: None,
            data: vec![0_u8; volume.block_size().as_usize()],
        }
    }

    /// Load `block` (if not already held) and return its bytes.
    pub fn set_to(&mut self, block: BlockNumber) -> Result<&[u8]> {
        if self.block != Some(block) {
            self.block = None;
            self.volume.read_blocks(block, &mut self.data)?;
            self.block = Some(block);
        }
        Ok(&self.data)
    }

    /// Block currently held, if any.
    #[must_use]
    pub fn block(&self) -> Option<BlockNumber> {
        self.block
    }

    #[must_use]
    pub fn volume(&self) -> &'v Volume {
        self.volume
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfs_harness::{ImageBuilder, ImageConfig};
    use bfs_types::SUPER_BLOCK_MAGIC2;

    fn image(config: ImageConfig) -> Vec<u8> {
        let mut builder = ImageBuilder::new(config).expect("builder");
        let root = builder.reserve_inode().expect("root inode");
        builder
            .write_directory(root, root, "", &[])
            .expect("root dir");
        builder.set_root(root);
        builder.finish().expect("image")
    }

    #[test]
    fn opens_primary_superblock() {
        let volume = Volume::from_bytes(image(ImageConfig::default())).expect("open");
        assert_eq!(volume.superblock_offset(), BFS_SUPERBLOCK_OFFSET);
        assert_eq!(volume.block_size().get(), 1024);
        assert_eq!(volume.inode_size(), 1024);
        assert_eq!(volume.name(), "harness");
        assert_eq!(volume.byte_order(), ByteOrder::Little);
        assert!(volume.indices().is_zero());
        volume.validate_block_run(volume.root()).expect("root run");
    }

    #[test]
    fn falls_back_to_legacy_offset() {
        let config = ImageConfig {
            legacy_superblock: true,
            byte_order: ByteOrder::Big,
            ..ImageConfig::default()
        };
        let bytes = image(config);
        let volume = Volume::from_bytes(bytes.clone()).expect("open legacy");
        assert_eq!(volume.superblock_offset(), BFS_LEGACY_SUPERBLOCK_OFFSET);
        assert_eq!(volume.byte_order(), ByteOrder::Big);

        let strict = OpenOptions {
            probe_legacy_offset: false,
            ..OpenOptions::default()
        };
        let err = Volume::from_device(Box::new(bfs_block::MemoryByteDevice::new(bytes)), &strict)
            .expect_err("no probe");
        assert!(matches!(err, BfsError::BadSuperblock(_)));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = image(ImageConfig::default());
        let at = usize::try_from(BFS_SUPERBLOCK_OFFSET).expect("offset") + 68;
        bytes[at..at + 4].copy_from_slice(&(SUPER_BLOCK_MAGIC2 ^ 1).to_le_bytes());
        let err = Volume::from_bytes(bytes).expect_err("bad magic");
        assert!(matches!(err, BfsError::BadSuperblock(_)));
        assert_eq!(err.to_errno(), libc::EINVAL);
    }

    #[test]
    fn block_arithmetic() {
        let config = ImageConfig {
            ag_shift: 10,
            ..ImageConfig::default()
        };
        let volume = Volume::from_bytes(image(config)).expect("open");
        assert_eq!(volume.allocation_group_shift(), 10);
        assert_eq!(volume.allocation_groups(), 4);

        let run = BlockRun::new(2, 5, 3);
        assert_eq!(volume.to_block(run), BlockNumber(2053));
        assert_eq!(volume.to_offset(run), 2053 * 1024);
        assert_eq!(volume.to_inode_id(run), InodeId(2053));
        assert_eq!(
            volume.to_block_run(BlockNumber(2053)).expect("run"),
            BlockRun::new(2, 5, 1)
        );
    }

    #[test]
    fn validates_block_runs() {
        let config = ImageConfig {
            ag_shift: 10,
            ..ImageConfig::default()
        };
        let volume = Volume::from_bytes(image(config)).expect("open");
        volume
            .validate_block_run(BlockRun::new(3, 1000, 24))
            .expect("ends at group boundary");
        for bad in [
            BlockRun::new(-1, 0, 1),
            BlockRun::new(4, 0, 1),
            BlockRun::new(0, 0, 0),
            BlockRun::new(0, 1000, 25),
        ] {
            let err = volume.validate_block_run(bad).expect_err("invalid run");
            assert!(err.is_corruption(), "{bad}: {err}");
        }
    }

    #[test]
    fn cached_block_rereads_only_on_change() {
        let volume = Volume::from_bytes(image(ImageConfig::default())).expect("open");
        let mut cached = CachedBlock::new(&volume);
        assert_eq!(cached.block(), None);
        let magic = cached.set_to(BlockNumber(0)).expect("block 0")[544..548].to_vec();
        assert_eq!(magic, bfs_types::SUPER_BLOCK_MAGIC1.to_le_bytes());
        assert_eq!(cached.block(), Some(BlockNumber(0)));
        assert!(cached.set_to(BlockNumber(u64::MAX >> 20)).is_err());
        assert_eq!(cached.block(), None);
    }

    #[test]
    fn shared_cache_serves_repeat_reads() {
        let options = OpenOptions {
            cache_blocks: 8,
            ..OpenOptions::default()
        };
        let bytes = image(ImageConfig::default());
        let volume =
            Volume::from_device(Box::new(bfs_block::MemoryByteDevice::new(bytes)), &options)
                .expect("open cached");
        let mut a = [0_u8; 16];
        let mut b = [0_u8; 16];
        volume.read_at(2048, &mut a).expect("first");
        volume.read_at(2048, &mut b).expect("second");
        assert_eq!(a, b);
    }

    #[test]
    fn parse_errors_become_corruption() {
        let err = parse_to_bfs_error(
            4096,
            &ParseError::InvalidField {
                field: "key",
                reason: "key exceeds node boundary",
            },
        );
        assert!(matches!(err, BfsError::BadData { offset: 4096, .. }));
    }
}
