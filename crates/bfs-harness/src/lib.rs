#![forbid(unsafe_code)]
//! In-memory BFS image synthesis for tests and fixtures.
//!
//! [`ImageBuilder`] lays out a volume block by block: superblock, inodes,
//! data streams over all three block-run tiers, and B+trees (with
//! duplicate fragments and duplicate nodes). Layout follows the on-disk
//! rules the reader enforces, so images built here open cleanly unless a
//! test corrupts them on purpose.

use anyhow::{Context, Result, bail, ensure};
use bfs_ondisk::{
    BPlusTreeHeader, BlockRun, DataStream, KeyType, SmallData, Superblock, compare_keys,
    encode_node, make_link,
};
use bfs_types::{
    BFS_DISK_NAME_LENGTH, BFS_LEGACY_SUPERBLOCK_OFFSET, BFS_SUPERBLOCK_OFFSET,
    BFS_SUPERBLOCK_SIZE, BPLUSTREE_DUPLICATE_FRAGMENT, BPLUSTREE_DUPLICATE_NODE,
    BPLUSTREE_MAGIC, BPLUSTREE_NODE_SIZE, BPLUSTREE_NULL, ByteOrder, FILE_NAME_NAME,
    FILE_NAME_TYPE, INODE_IN_USE, INODE_LONG_SYMLINK, INODE_MAGIC1, NUM_DIRECT_BLOCKS,
    NUM_DUPLICATE_VALUES, NUM_FRAGMENT_VALUES, S_IFDIR, S_IFLNK, S_IFREG,
    SHORT_SYMLINK_NAME_LENGTH, SUPER_BLOCK_DISK_CLEAN, SUPER_BLOCK_FS_BYTE_ORDER,
    SUPER_BLOCK_MAGIC1, SUPER_BLOCK_MAGIC2, SUPER_BLOCK_MAGIC3, align_up,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

const NODE_SIZE: usize = BPLUSTREE_NODE_SIZE as usize;
const FRAGMENT_SLOT_SIZE: usize = (NUM_FRAGMENT_VALUES + 1) * 8;
/// 2023-11-14 in `bigtime_t` form (seconds << 16).
pub const FIXTURE_TIME: i64 = 1_700_000_000 << 16;

/// Inode id of `/boot` in [`boot_fixture`].
pub const FIXTURE_BOOT_ID: u64 = 5;
/// Inode id of `/README` in [`boot_fixture`].
pub const FIXTURE_README_ID: u64 = 9;
/// Contents of `/README` in [`boot_fixture`].
pub const FIXTURE_README: &[u8] = b"Welcome to the BFS boot fixture.\n";

/// Geometry of a synthesised volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub name: String,
    pub block_size: u32,
    pub byte_order: ByteOrder,
    pub ag_shift: u32,
    pub num_blocks: u64,
    /// Write the superblock at byte 0 instead of byte 512.
    pub legacy_superblock: bool,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            name: "harness".to_owned(),
            block_size: 1024,
            byte_order: ByteOrder::Little,
            ag_shift: 13,
            num_blocks: 4096,
            legacy_superblock: false,
        }
    }
}

/// How a data stream spreads over the three tiers.
///
/// Each entry is a run length in blocks. Indirect and double-indirect
/// arrays are allocated and filled by the builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPlan {
    pub direct: Vec<u16>,
    pub indirect: Vec<u16>,
    pub double_indirect: Option<DoubleIndirectPlan>,
}

/// Double-indirect tier: `leaf_runs` data runs, each `run_length` blocks.
///
/// `run_length` is also the length of the top array and of every
/// intermediate array, as the reader requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoubleIndirectPlan {
    pub run_length: u16,
    pub leaf_runs: usize,
}

impl StreamPlan {
    /// Total data blocks the plan addresses.
    #[must_use]
    pub fn capacity_blocks(&self) -> u64 {
        let direct: u64 = self.direct.iter().map(|l| u64::from(*l)).sum();
        let indirect: u64 = self.indirect.iter().map(|l| u64::from(*l)).sum();
        let double = self
            .double_indirect
            .map_or(0, |d| u64::from(d.run_length) * d.leaf_runs as u64);
        direct + indirect + double
    }
}

/// Fields of one inode to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeSpec {
    pub mode: u32,
    pub flags: u32,
    pub parent: BlockRun,
    pub name: Option<String>,
    pub uid: i32,
    pub gid: i32,
    pub create_time: i64,
    pub modified_time: i64,
    pub data: DataStream,
    pub short_symlink: Option<Vec<u8>>,
}

impl InodeSpec {
    #[must_use]
    pub fn new(mode: u32, parent: BlockRun, name: &str) -> Self {
        Self {
            mode,
            flags: INODE_IN_USE,
            parent,
            name: (!name.is_empty()).then(|| name.to_owned()),
            uid: 0,
            gid: 0,
            create_time: FIXTURE_TIME,
            modified_time: FIXTURE_TIME,
            data: DataStream::default(),
            short_symlink: None,
        }
    }
}

/// Keys and values of one B+tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeSpec {
    pub key_type: KeyType,
    /// Key bytes and their values; more than one value makes a duplicate.
    pub entries: Vec<(Vec<u8>, Vec<i64>)>,
    /// Cap on keys per node, to force multi-level trees in small tests.
    pub max_keys_per_node: Option<usize>,
}

impl TreeSpec {
    #[must_use]
    pub fn new(key_type: KeyType) -> Self {
        Self {
            key_type,
            entries: Vec::new(),
            max_keys_per_node: None,
        }
    }

    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: i64) {
        self.entries.push((key.into(), vec![value]));
    }

    pub fn insert_duplicates(&mut self, key: impl Into<Vec<u8>>, values: Vec<i64>) {
        self.entries.push((key.into(), values));
    }
}

/// Block-level builder of a BFS image.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    config: ImageConfig,
    image: Vec<u8>,
    used: Vec<bool>,
    root: Option<BlockRun>,
    indices: BlockRun,
}

impl ImageBuilder {
    pub fn new(config: ImageConfig) -> Result<Self> {
        ensure!(
            config.block_size.is_power_of_two() && (1024..=65536).contains(&config.block_size),
            "block size {} must be a power of two in 1024..=65536",
            config.block_size
        );
        ensure!(
            (1..=16).contains(&config.ag_shift),
            "ag_shift {} out of range",
            config.ag_shift
        );
        ensure!(config.num_blocks >= 16, "volume needs at least 16 blocks");
        ensure!(
            config.name.len() < BFS_DISK_NAME_LENGTH,
            "volume name too long"
        );
        let len = usize::try_from(config.num_blocks * u64::from(config.block_size))
            .context("image size does not fit in memory")?;
        let mut used = vec![false; usize::try_from(config.num_blocks)?];
        // block 0 holds the superblock
        used[0] = true;
        Ok(Self {
            config,
            image: vec![0_u8; len],
            used,
            root: None,
            indices: BlockRun::default(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.config.block_size as usize
    }

    #[must_use]
    pub fn byte_order(&self) -> ByteOrder {
        self.config.byte_order
    }

    fn group_blocks(&self) -> u64 {
        1_u64 << self.config.ag_shift
    }

    /// Flat block number of a run's first block.
    #[must_use]
    pub fn to_block(&self, run: BlockRun) -> u64 {
        (u64::try_from(run.allocation_group).unwrap_or(0) << self.config.ag_shift)
            | u64::from(run.start)
    }

    /// Inode id stored in directory trees for the inode at `run`.
    #[must_use]
    pub fn inode_id(&self, run: BlockRun) -> i64 {
        self.to_block(run) as i64
    }

    /// Byte offset of a run inside the image.
    #[must_use]
    pub fn offset_of(&self, run: BlockRun) -> usize {
        self.to_block(run) as usize * self.block_size()
    }

    fn run_at(&self, block: u64, length: u16) -> Result<BlockRun> {
        let start = block & (self.group_blocks() - 1);
        ensure!(
            start + u64::from(length) <= self.group_blocks(),
            "run at block {block} crosses an allocation group"
        );
        Ok(BlockRun::new(
            i32::try_from(block >> self.config.ag_shift)?,
            u16::try_from(start)?,
            length,
        ))
    }

    fn is_free(&self, block: u64, count: u16) -> bool {
        (block..block + u64::from(count))
            .all(|b| self.used.get(b as usize).is_some_and(|used| !used))
    }

    fn mark(&mut self, block: u64, count: u16) {
        for b in block..block + u64::from(count) {
            self.used[b as usize] = true;
        }
    }

    /// Allocate `count` contiguous blocks inside one allocation group.
    pub fn alloc(&mut self, count: u16) -> Result<BlockRun> {
        ensure!(count > 0, "cannot allocate an empty run");
        let group = self.group_blocks();
        let found = (1..self.config.num_blocks).find(|&b| {
            (b & (group - 1)) + u64::from(count) <= group.min(1 << 16) && self.is_free(b, count)
        });
        let Some(block) = found else {
            bail!("no free run of {count} blocks");
        };
        self.mark(block, count);
        self.run_at(block, count)
    }

    /// Allocate `count` blocks starting exactly at `block`.
    pub fn alloc_at(&mut self, block: u64, count: u16) -> Result<BlockRun> {
        ensure!(count > 0, "cannot allocate an empty run");
        ensure!(self.is_free(block, count), "blocks at {block} already in use");
        let run = self.run_at(block, count)?;
        self.mark(block, count);
        Ok(run)
    }

    /// Reserve one block for an inode, to be written later.
    pub fn reserve_inode(&mut self) -> Result<BlockRun> {
        self.alloc(1)
    }

    /// Reserve the inode whose id is `id`.
    pub fn reserve_inode_at(&mut self, id: u64) -> Result<BlockRun> {
        self.alloc_at(id, 1)
    }

    /// Copy `data` into the blocks of `run`; the remainder stays zero.
    pub fn write_run(&mut self, run: BlockRun, data: &[u8]) -> Result<()> {
        let capacity = usize::from(run.length) * self.block_size();
        ensure!(
            data.len() <= capacity,
            "{} bytes do not fit in run {run}",
            data.len()
        );
        let at = self.offset_of(run);
        self.image[at..at + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn set_root(&mut self, root: BlockRun) {
        self.root = Some(root);
    }

    pub fn set_indices(&mut self, indices: BlockRun) {
        self.indices = indices;
    }

    // ── Data streams ──────────────────────────────────────────────────

    /// Direct-only plan for `len` bytes, split into group-sized runs.
    pub fn direct_plan(&self, len: usize) -> Result<StreamPlan> {
        let mut blocks = len.div_ceil(self.block_size()) as u64;
        let max_run = (self.group_blocks() - 1).min(u64::from(u16::MAX));
        let mut direct = Vec::new();
        while blocks > 0 {
            let take = blocks.min(max_run);
            direct.push(u16::try_from(take)?);
            blocks -= take;
        }
        ensure!(
            direct.len() <= NUM_DIRECT_BLOCKS,
            "{len} bytes need more than {NUM_DIRECT_BLOCKS} direct runs"
        );
        Ok(StreamPlan {
            direct,
            ..StreamPlan::default()
        })
    }

    fn write_run_array(&mut self, array: BlockRun, runs: &[BlockRun]) -> Result<()> {
        let order = self.byte_order();
        let bytes: Vec<u8> = runs.iter().flat_map(|r| r.to_bytes(order)).collect();
        self.write_run(array, &bytes)
    }

    /// Allocate the runs of `plan`, fill them with `contents`, and return
    /// the resulting data stream (`size == contents.len()`).
    pub fn write_stream(&mut self, plan: &StreamPlan, contents: &[u8]) -> Result<DataStream> {
        ensure!(
            plan.direct.len() <= NUM_DIRECT_BLOCKS,
            "too many direct runs"
        );
        let bs = self.block_size();
        let runs_per_block = bs / BlockRun::SIZE;
        let mut stream = DataStream::default();
        let mut data_runs = Vec::new();
        let mut range = 0_i64;

        for (slot, len) in plan.direct.iter().enumerate() {
            let run = self.alloc(*len)?;
            stream.direct[slot] = run;
            data_runs.push(run);
            range += i64::from(*len) * bs as i64;
        }
        stream.max_direct_range = range;

        if !plan.indirect.is_empty() {
            let array_blocks = u16::try_from(plan.indirect.len().div_ceil(runs_per_block))?;
            let array = self.alloc(array_blocks)?;
            let mut runs = Vec::with_capacity(plan.indirect.len());
            for len in &plan.indirect {
                let run = self.alloc(*len)?;
                runs.push(run);
                range += i64::from(*len) * bs as i64;
            }
            self.write_run_array(array, &runs)?;
            data_runs.extend(runs);
            stream.indirect = array;
        }
        if !plan.indirect.is_empty() || plan.double_indirect.is_some() {
            stream.max_indirect_range = range;
        }

        if let Some(double) = plan.double_indirect {
            let n = double.run_length;
            ensure!(n > 0 && double.leaf_runs > 0, "empty double-indirect plan");
            let per_array = runs_per_block * usize::from(n);
            let leaves = (0..double.leaf_runs)
                .map(|_| self.alloc(n))
                .collect::<Result<Vec<_>>>()?;
            let mut intermediates = Vec::new();
            for chunk in leaves.chunks(per_array) {
                let array = self.alloc(n)?;
                self.write_run_array(array, chunk)?;
                intermediates.push(array);
            }
            ensure!(
                intermediates.len() <= per_array,
                "double-indirect plan exceeds one top-level array"
            );
            let top = self.alloc(n)?;
            self.write_run_array(top, &intermediates)?;
            stream.double_indirect = top;
            range += (double.leaf_runs * usize::from(n) * bs) as i64;
            stream.max_double_indirect_range = range;
            data_runs.extend(leaves);
        }

        let capacity = plan.capacity_blocks() as usize * bs;
        ensure!(
            contents.len() <= capacity,
            "{} bytes exceed plan capacity {capacity}",
            contents.len()
        );
        let mut rest = contents;
        for run in data_runs {
            if rest.is_empty() {
                break;
            }
            let take = rest.len().min(usize::from(run.length) * bs);
            self.write_run(run, &rest[..take])?;
            rest = &rest[take..];
        }
        stream.size = contents.len() as i64;
        Ok(stream)
    }

    // ── Inodes ────────────────────────────────────────────────────────

    /// Write a complete inode block at `at`.
    pub fn write_inode(&mut self, at: BlockRun, spec: &InodeSpec) -> Result<()> {
        let order = self.byte_order();
        let bs = self.block_size();
        let mut raw = vec![0_u8; bs];
        let mut put = |offset: usize, bytes: &[u8]| {
            raw[offset..offset + bytes.len()].copy_from_slice(bytes);
        };
        put(0, &order.u32_bytes(INODE_MAGIC1));
        put(4, &BlockRun::new(at.allocation_group, at.start, 1).to_bytes(order));
        put(12, &order.i32_bytes(spec.uid));
        put(16, &order.i32_bytes(spec.gid));
        put(20, &order.u32_bytes(spec.mode));
        put(24, &order.u32_bytes(spec.flags));
        put(28, &order.i64_bytes(spec.create_time));
        put(36, &order.i64_bytes(spec.modified_time));
        put(44, &spec.parent.to_bytes(order));
        put(64, &order.i32_bytes(i32::try_from(bs)?));
        match &spec.short_symlink {
            Some(target) => {
                ensure!(
                    target.len() < SHORT_SYMLINK_NAME_LENGTH,
                    "short symlink target too long"
                );
                put(bfs_ondisk::inode::DATA_STREAM_OFFSET, target);
            }
            None => put(bfs_ondisk::inode::DATA_STREAM_OFFSET, &spec.data.to_bytes(order)),
        }
        if let Some(name) = &spec.name {
            let entry = SmallData::encode(order, FILE_NAME_TYPE, &[FILE_NAME_NAME], name.as_bytes());
            ensure!(
                bfs_ondisk::SMALL_DATA_OFFSET + entry.len() <= bs,
                "name {name:?} does not fit in the inode"
            );
            put(bfs_ondisk::SMALL_DATA_OFFSET, &entry);
        }
        self.write_run(at, &raw)
    }

    /// Write a regular file with an explicit stream layout.
    pub fn write_file(
        &mut self,
        at: BlockRun,
        parent: BlockRun,
        name: &str,
        plan: &StreamPlan,
        contents: &[u8],
    ) -> Result<()> {
        let mut spec = InodeSpec::new(S_IFREG | 0o644, parent, name);
        spec.data = self.write_stream(plan, contents)?;
        self.write_inode(at, &spec)
    }

    /// Allocate and write a regular file stored in direct runs.
    pub fn add_file(&mut self, parent: BlockRun, name: &str, contents: &[u8]) -> Result<BlockRun> {
        let at = self.reserve_inode()?;
        let plan = self.direct_plan(contents.len())?;
        self.write_file(at, parent, name, &plan, contents)?;
        Ok(at)
    }

    /// Allocate and write a symlink; long targets go into a data stream.
    pub fn add_symlink(&mut self, parent: BlockRun, name: &str, target: &str) -> Result<BlockRun> {
        let at = self.reserve_inode()?;
        let mut spec = InodeSpec::new(S_IFLNK | 0o777, parent, name);
        if target.len() < SHORT_SYMLINK_NAME_LENGTH {
            spec.short_symlink = Some(target.as_bytes().to_vec());
        } else {
            let plan = self.direct_plan(target.len())?;
            spec.data = self.write_stream(&plan, target.as_bytes())?;
            spec.flags |= INODE_LONG_SYMLINK;
        }
        self.write_inode(at, &spec)?;
        Ok(at)
    }

    // ── B+trees ───────────────────────────────────────────────────────

    /// Lay out a B+tree and store it in a new data stream.
    pub fn write_tree(&mut self, spec: &TreeSpec) -> Result<DataStream> {
        let pages = build_tree_pages(self.byte_order(), spec)?;
        let plan = self.direct_plan(pages.len())?;
        self.write_stream(&plan, &pages)
    }

    /// Write an inode whose stream is the B+tree described by `tree`.
    pub fn write_tree_inode(
        &mut self,
        at: BlockRun,
        parent: BlockRun,
        name: &str,
        mode: u32,
        tree: &TreeSpec,
    ) -> Result<()> {
        let mut spec = InodeSpec::new(mode, parent, name);
        spec.data = self.write_tree(tree)?;
        self.write_inode(at, &spec)
    }

    /// Write a directory with `.`/`..` plus `entries`.
    pub fn write_directory(
        &mut self,
        at: BlockRun,
        parent: BlockRun,
        name: &str,
        entries: &[(&str, BlockRun)],
    ) -> Result<()> {
        let mut tree = TreeSpec::new(KeyType::String);
        tree.insert(".", self.inode_id(at));
        tree.insert("..", self.inode_id(parent));
        for (entry, run) in entries {
            tree.insert(*entry, self.inode_id(*run));
        }
        self.write_tree_inode(at, parent, name, S_IFDIR | 0o755, &tree)
    }

    /// Allocate and write a directory.
    pub fn add_directory(
        &mut self,
        parent: BlockRun,
        name: &str,
        entries: &[(&str, BlockRun)],
    ) -> Result<BlockRun> {
        let at = self.reserve_inode()?;
        self.write_directory(at, parent, name, entries)?;
        Ok(at)
    }

    // ── Finish ────────────────────────────────────────────────────────

    /// Superblock as it will be written by [`ImageBuilder::finish`].
    pub fn superblock(&self) -> Result<Superblock> {
        let root = self.root.context("root directory not set")?;
        let c = &self.config;
        let num_ags = c.num_blocks.div_ceil(self.group_blocks());
        Ok(Superblock {
            name: c.name.clone(),
            byte_order: c.byte_order,
            magic1: SUPER_BLOCK_MAGIC1,
            block_size: c.block_size,
            block_shift: c.block_size.trailing_zeros(),
            num_blocks: i64::try_from(c.num_blocks)?,
            used_blocks: self.used.iter().filter(|u| **u).count() as i64,
            inode_size: i32::try_from(c.block_size)?,
            magic2: SUPER_BLOCK_MAGIC2,
            blocks_per_ag: 1,
            ag_shift: i32::try_from(c.ag_shift)?,
            num_ags: i32::try_from(num_ags)?,
            flags: SUPER_BLOCK_DISK_CLEAN,
            log_blocks: BlockRun::default(),
            log_start: 0,
            log_end: 0,
            magic3: SUPER_BLOCK_MAGIC3,
            root_dir: root,
            indices: self.indices,
        })
    }

    /// Write the superblock and return the image bytes.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        let region = encode_superblock(&self.superblock()?);
        let at = if self.config.legacy_superblock {
            BFS_LEGACY_SUPERBLOCK_OFFSET
        } else {
            BFS_SUPERBLOCK_OFFSET
        } as usize;
        self.image[at..at + BFS_SUPERBLOCK_SIZE].copy_from_slice(&region);
        Ok(self.image)
    }
}

/// Serialize a superblock into its 512-byte region.
#[must_use]
pub fn encode_superblock(sb: &Superblock) -> [u8; BFS_SUPERBLOCK_SIZE] {
    let o = sb.byte_order;
    let mut r = [0_u8; BFS_SUPERBLOCK_SIZE];
    let mut put = |offset: usize, bytes: &[u8]| r[offset..offset + bytes.len()].copy_from_slice(bytes);
    let name = sb.name.as_bytes();
    put(0, &name[..name.len().min(BFS_DISK_NAME_LENGTH - 1)]);
    put(32, &o.u32_bytes(sb.magic1));
    put(36, &o.u32_bytes(SUPER_BLOCK_FS_BYTE_ORDER));
    put(40, &o.u32_bytes(sb.block_size));
    put(44, &o.u32_bytes(sb.block_shift));
    put(48, &o.i64_bytes(sb.num_blocks));
    put(56, &o.i64_bytes(sb.used_blocks));
    put(64, &o.i32_bytes(sb.inode_size));
    put(68, &o.u32_bytes(sb.magic2));
    put(72, &o.i32_bytes(sb.blocks_per_ag));
    put(76, &o.i32_bytes(sb.ag_shift));
    put(80, &o.i32_bytes(sb.num_ags));
    put(84, &o.u32_bytes(sb.flags));
    put(88, &sb.log_blocks.to_bytes(o));
    put(96, &o.i64_bytes(sb.log_start));
    put(104, &o.i64_bytes(sb.log_end));
    put(112, &o.u32_bytes(sb.magic3));
    put(116, &sb.root_dir.to_bytes(o));
    put(124, &sb.indices.to_bytes(o));
    r
}

// ── Tree layout ─────────────────────────────────────────────────────────────

fn node_fits(key_bytes: usize, count: usize) -> bool {
    align_up((bfs_ondisk::NODE_HEADER_SIZE + key_bytes) as u64, 8)
        .is_some_and(|at| at as usize + count * 10 <= NODE_SIZE)
}

/// Pack one level of `(offset, key)` items into nodes, greedily.
///
/// `reserve_last` keeps the final item of every node out of the key
/// array (internal nodes store it in `overflow_link`).
fn chunk_level(items: &[(i64, Vec<u8>)], max_keys: usize, reserve_last: bool) -> Vec<usize> {
    let mut sizes = Vec::new();
    let mut start = 0;
    while start < items.len() {
        let mut end = start;
        let mut key_bytes = 0;
        while end < items.len() {
            let keys = end - start + usize::from(!reserve_last);
            let extra = if reserve_last {
                // the previous overflow child becomes a keyed child
                if end > start { items[end - 1].1.len() } else { 0 }
            } else {
                items[end].1.len()
            };
            if keys > max_keys || !node_fits(key_bytes + extra, keys) {
                break;
            }
            key_bytes += extra;
            end += 1;
        }
        // always make progress; an internal node needs at least two children
        let end = end.max(start + if reserve_last { 2 } else { 1 }).min(items.len());
        sizes.push(end - start);
        start = end;
    }
    sizes
}

fn build_tree_pages(order: ByteOrder, spec: &TreeSpec) -> Result<Vec<u8>> {
    let key_type = spec.key_type;
    let mut entries = spec.entries.clone();
    entries.sort_by(|a, b| compare_keys(key_type, order, &a.0, &b.0));
    for pair in entries.windows(2) {
        ensure!(
            compare_keys(key_type, order, &pair[0].0, &pair[1].0) != Ordering::Equal,
            "duplicate key {:?}; use insert_duplicates",
            pair[0].0
        );
    }
    let max_keys = spec.max_keys_per_node.unwrap_or(usize::MAX).max(1);

    // page 0 is the header
    let mut pages: Vec<Vec<u8>> = vec![vec![0_u8; NODE_SIZE]];
    let offset_of = |page: usize| (page * NODE_SIZE) as i64;

    // duplicate storage first, so leaf values can point at it
    let mut fragment: Option<(usize, usize)> = None;
    let mut leaf_items: Vec<(i64, Vec<u8>)> = Vec::with_capacity(entries.len());
    for (key, values) in &entries {
        ensure!(!values.is_empty(), "key {key:?} has no values");
        let value = if values.len() == 1 {
            values[0]
        } else if values.len() <= NUM_FRAGMENT_VALUES {
            let (page, slot) = match fragment {
                Some((page, slot)) if slot < NODE_SIZE / FRAGMENT_SLOT_SIZE => (page, slot),
                _ => {
                    pages.push(vec![0_u8; NODE_SIZE]);
                    (pages.len() - 1, 0)
                }
            };
            fragment = Some((page, slot + 1));
            let base = slot * FRAGMENT_SLOT_SIZE;
            let node = &mut pages[page];
            node[base..base + 8].copy_from_slice(&order.i64_bytes(values.len() as i64));
            for (i, v) in values.iter().enumerate() {
                let at = base + 8 + i * 8;
                node[at..at + 8].copy_from_slice(&order.i64_bytes(*v));
            }
            make_link(BPLUSTREE_DUPLICATE_FRAGMENT, offset_of(page), slot)
        } else {
            let first = pages.len();
            let chunks: Vec<&[i64]> = values.chunks(NUM_DUPLICATE_VALUES).collect();
            for (i, chunk) in chunks.iter().enumerate() {
                let page = first + i;
                let left = if i == 0 { BPLUSTREE_NULL } else { offset_of(page - 1) };
                let right = if i + 1 == chunks.len() {
                    BPLUSTREE_NULL
                } else {
                    offset_of(page + 1)
                };
                let mut node = vec![0_u8; NODE_SIZE];
                node[0..8].copy_from_slice(&order.i64_bytes(left));
                node[8..16].copy_from_slice(&order.i64_bytes(right));
                node[16..24].copy_from_slice(&order.i64_bytes(chunk.len() as i64));
                for (j, v) in chunk.iter().enumerate() {
                    node[24 + j * 8..32 + j * 8].copy_from_slice(&order.i64_bytes(*v));
                }
                pages.push(node);
            }
            make_link(BPLUSTREE_DUPLICATE_NODE, offset_of(first), 0)
        };
        leaf_items.push((value, key.clone()));
    }

    // leaves
    let mut level: Vec<(i64, Vec<u8>)> = Vec::new();
    let sizes = if leaf_items.is_empty() {
        vec![0]
    } else {
        chunk_level(&leaf_items, max_keys, false)
    };
    let first_leaf = pages.len();
    let mut at = 0;
    for (i, size) in sizes.iter().enumerate() {
        let items = &leaf_items[at..at + size];
        let left = if i == 0 { BPLUSTREE_NULL } else { offset_of(first_leaf + i - 1) };
        let right = if i + 1 == sizes.len() {
            BPLUSTREE_NULL
        } else {
            offset_of(first_leaf + i + 1)
        };
        let keys: Vec<&[u8]> = items.iter().map(|(_, k)| k.as_slice()).collect();
        let values: Vec<i64> = items.iter().map(|(v, _)| *v).collect();
        let page = encode_node(order, NODE_SIZE, (left, right, BPLUSTREE_NULL), &keys, &values)
            .context("leaf does not fit in a node")?;
        pages.push(page);
        let last_key = items.last().map(|(_, k)| k.clone()).unwrap_or_default();
        level.push((offset_of(first_leaf + i), last_key));
        at += size;
    }

    // internal levels
    let mut levels = 1_u32;
    while level.len() > 1 {
        let mut parents = Vec::new();
        let mut at = 0;
        for size in chunk_level(&level, max_keys, true) {
            let children = &level[at..at + size];
            let (last, keyed) = children.split_last().context("empty internal node")?;
            let keys: Vec<&[u8]> = keyed.iter().map(|(_, k)| k.as_slice()).collect();
            let values: Vec<i64> = keyed.iter().map(|(o, _)| *o).collect();
            let page = encode_node(
                order,
                NODE_SIZE,
                (BPLUSTREE_NULL, BPLUSTREE_NULL, last.0),
                &keys,
                &values,
            )
            .context("internal node does not fit")?;
            pages.push(page);
            parents.push((offset_of(pages.len() - 1), last.1.clone()));
            at += size;
        }
        level = parents;
        levels += 1;
    }

    let header = BPlusTreeHeader {
        magic: BPLUSTREE_MAGIC,
        node_size: BPLUSTREE_NODE_SIZE,
        max_number_of_levels: levels,
        data_type: key_type.code(),
        root_node_pointer: level[0].0,
        free_node_pointer: BPLUSTREE_NULL,
        maximum_size: offset_of(pages.len()),
    };
    pages[0][..bfs_types::BPLUSTREE_HEADER_SIZE].copy_from_slice(&header.to_bytes(order));
    Ok(pages.concat())
}

// ── Fixtures ────────────────────────────────────────────────────────────────

/// Small boot volume:
///
/// ```text
/// /            root (id 1)
/// /README      file, id 9
/// /boot        directory, id 5
/// /boot/haiku_loader  file spanning several blocks
/// /loader      symlink -> boot/haiku_loader
/// ```
pub fn boot_fixture(byte_order: ByteOrder) -> Result<Vec<u8>> {
    boot_fixture_with(ImageConfig {
        name: "BootFixture".to_owned(),
        byte_order,
        ..ImageConfig::default()
    })
}

/// [`boot_fixture`] laid out with an explicit geometry.
pub fn boot_fixture_with(config: ImageConfig) -> Result<Vec<u8>> {
    let mut b = ImageBuilder::new(config)?;
    let boot = b.reserve_inode_at(FIXTURE_BOOT_ID)?;
    let readme = b.reserve_inode_at(FIXTURE_README_ID)?;
    let root = b.reserve_inode()?;

    let loader = b.add_file(boot, "haiku_loader", &loader_payload())?;
    let plan = b.direct_plan(FIXTURE_README.len())?;
    b.write_file(readme, root, "README", &plan, FIXTURE_README)?;
    let link = b.add_symlink(root, "loader", "boot/haiku_loader")?;

    b.write_directory(boot, root, "boot", &[("haiku_loader", loader)])?;
    b.write_directory(
        root,
        root,
        "",
        &[("README", readme), ("boot", boot), ("loader", link)],
    )?;
    b.set_root(root);
    b.finish()
}

/// Deterministic contents of `/boot/haiku_loader` in [`boot_fixture`].
#[must_use]
pub fn loader_payload() -> Vec<u8> {
    (0..5000_u32).map(|i| (i % 251) as u8).collect()
}

/// Deterministic byte at logical position `pos` of [`pattern`] data.
#[must_use]
pub fn pattern_byte(pos: usize) -> u8 {
    (pos.wrapping_mul(31) % 253) as u8
}

/// `len` bytes of position-dependent data, handy for tier tests.
#[must_use]
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(pattern_byte).collect()
}
