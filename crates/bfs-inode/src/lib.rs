#![forbid(unsafe_code)]
//! Inode streams.
//!
//! A [`Stream`] is the in-memory view of one inode: it checks the inode on
//! load, maps byte positions onto block runs through the direct, indirect
//! and double-indirect tiers, and performs positioned reads.
//!
//! Tier layout, with `N = double_indirect.length` and `R = block_size / 8`:
//!
//! ```text
//! [0, max_direct_range)                      direct runs, scanned in order
//! [max_direct_range, max_indirect_range)     runs listed in the indirect blocks
//! [max_indirect_range, max_double_indirect)  N blocks of pointers to N-block
//!                                            arrays of N-block data runs
//! ```
//!
//! In the double-indirect tier every data run is exactly `N` blocks, so a
//! position resolves by arithmetic instead of a scan.

use bfs_error::{BfsError, Result};
use bfs_ondisk::{BlockRun, DataStream, Inode};
use bfs_types::{BlockNumber, INODE_MAGIC1, InodeId};
use bfs_volume::{CachedBlock, Volume, parse_to_bfs_error};
use tracing::{error, trace, warn};

/// Loaded inode plus the volume it lives on.
#[derive(Debug, Clone)]
pub struct Stream<'v> {
    volume: &'v Volume,
    id: InodeId,
    inode: Inode,
}

impl<'v> Stream<'v> {
    /// Load the inode addressed by `run`.
    pub fn load(volume: &'v Volume, run: BlockRun) -> Result<Self> {
        volume.validate_block_run(run)?;
        Self::load_id(volume, volume.to_inode_id(run))
    }

    /// Load the inode with the given id (its block number).
    pub fn load_id(volume: &'v Volume, id: InodeId) -> Result<Self> {
        if id.0 >= volume.num_blocks() {
            return Err(BfsError::bad_inode(id.0, "inode id beyond end of volume"));
        }
        let offset = volume.block_to_offset(id.block());
        let mut raw = vec![0_u8; volume.inode_size()];
        volume.read_blocks(id.block(), &mut raw)?;
        let inode =
            Inode::parse(volume.byte_order(), &raw).map_err(|e| parse_to_bfs_error(offset, &e))?;
        check_inode(volume, id, &inode)?;
        trace!(inode = id.0, mode = inode.mode, size = inode.data.size, "stream_load");
        Ok(Self { volume, id, inode })
    }

    #[must_use]
    pub fn volume(&self) -> &'v Volume {
        self.volume
    }

    #[must_use]
    pub fn id(&self) -> InodeId {
        self.id
    }

    #[must_use]
    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    #[must_use]
    pub fn data(&self) -> &DataStream {
        &self.inode.data
    }

    /// Logical size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inode.data.size_bytes()
    }

    #[must_use]
    pub fn mode(&self) -> u32 {
        self.inode.mode
    }

    /// Inode id of the parent directory.
    #[must_use]
    pub fn parent(&self) -> InodeId {
        self.volume.to_inode_id(self.inode.parent)
    }

    #[must_use]
    pub fn is_container(&self) -> bool {
        self.inode.is_container()
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.inode.is_directory()
    }

    #[must_use]
    pub fn is_index(&self) -> bool {
        self.inode.is_index()
    }

    #[must_use]
    pub fn is_attribute_directory(&self) -> bool {
        self.inode.is_attribute_directory()
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.inode.is_symlink()
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.inode.is_file()
    }

    #[must_use]
    pub fn allows_duplicates(&self) -> bool {
        self.inode.allows_duplicates()
    }

    /// File name stored in the inode's small-data area.
    pub fn name(&self) -> Result<String> {
        let offset = self.volume.block_to_offset(self.id.block());
        self.inode
            .file_name()
            .map_err(|e| parse_to_bfs_error(offset, &e))?
            .ok_or_else(|| BfsError::NotFound(format!("name of inode {}", self.id)))
    }

    // ── Block-run resolution ──────────────────────────────────────────

    /// Find the run holding byte `pos`.
    ///
    /// Returns the run and the logical byte offset at which it starts.
    /// Every returned run has passed [`Volume::validate_block_run`].
    pub fn find_block_run(&self, pos: u64) -> Result<(BlockRun, u64)> {
        let data = &self.inode.data;
        let max_direct = range(data.max_direct_range);
        let max_indirect = range(data.max_indirect_range);
        let max_double = range(data.max_double_indirect_range);

        let found = if max_direct > 0 && pos >= max_direct {
            if max_double > 0 && pos >= max_indirect {
                self.find_double_indirect(pos, max_indirect, max_double)?
            } else if max_indirect > 0 {
                self.find_indirect(pos, max_direct)?
            } else {
                None
            }
        } else {
            self.find_direct(pos)
        };

        let Some((run, offset)) = found else {
            return Err(BfsError::NotFound(format!(
                "no block run for position {pos} in inode {}",
                self.id
            )));
        };
        self.volume.validate_block_run(run)?;
        trace!(inode = self.id.0, pos, run = %run, offset, "find_block_run");
        Ok((run, offset))
    }

    fn run_bytes(&self, run: BlockRun) -> u64 {
        u64::from(run.length) << self.volume.block_shift()
    }

    fn find_direct(&self, pos: u64) -> Option<(BlockRun, u64)> {
        let mut offset = 0_u64;
        for run in self.inode.data.direct {
            if run.is_zero() {
                break;
            }
            let len = self.run_bytes(run);
            if pos < offset + len {
                return Some((run, offset));
            }
            offset += len;
        }
        None
    }

    fn find_indirect(&self, pos: u64, max_direct: u64) -> Result<Option<(BlockRun, u64)>> {
        let indirect = self.inode.data.indirect;
        self.volume.validate_block_run(indirect)?;
        let runs_per_block = self.volume.block_size().as_usize() / BlockRun::SIZE;
        let first = self.volume.to_block(indirect);
        let mut cached = CachedBlock::new(self.volume);
        let mut offset = max_direct;

        for i in 0..u64::from(indirect.length) {
            let block = BlockNumber(first.0 + i);
            for slot in 0..runs_per_block {
                let run = self.run_in_block(&mut cached, block, slot)?;
                if run.is_zero() {
                    return Ok(None);
                }
                let len = self.run_bytes(run);
                if pos < offset + len {
                    return Ok(Some((run, offset)));
                }
                offset += len;
            }
        }
        Ok(None)
    }

    fn find_double_indirect(
        &self,
        pos: u64,
        max_indirect: u64,
        max_double: u64,
    ) -> Result<Option<(BlockRun, u64)>> {
        if pos >= max_double {
            return Ok(None);
        }
        let double = self.inode.data.double_indirect;
        self.volume.validate_block_run(double)?;

        let n = u64::from(double.length);
        let runs_per_block = self.volume.block_size().as_usize() as u64 / BlockRun::SIZE as u64;
        let direct_size = n << self.volume.block_shift();
        let indirect_size = direct_size * runs_per_block * n;

        let start = pos - max_indirect;
        let index = start / indirect_size;
        let current = (start % indirect_size) / direct_size;

        if index / runs_per_block >= n {
            return Err(self.double_indirect_violation(
                double,
                "top-level index beyond double-indirect array",
                index,
            ));
        }
        let mut cached = CachedBlock::new(self.volume);
        let top = BlockNumber(self.volume.to_block(double).0 + index / runs_per_block);
        let array = self.run_in_block(&mut cached, top, (index % runs_per_block) as usize)?;
        self.volume.validate_block_run(array)?;

        if current / runs_per_block >= u64::from(array.length) {
            return Err(self.double_indirect_violation(
                array,
                "second-level index beyond indirect array",
                current,
            ));
        }
        let block = BlockNumber(self.volume.to_block(array).0 + current / runs_per_block);
        let run = self.run_in_block(&mut cached, block, (current % runs_per_block) as usize)?;
        if run.length != double.length {
            return Err(self.double_indirect_violation(
                run,
                "data run length differs from double-indirect length",
                current,
            ));
        }

        let offset = max_indirect + index * indirect_size + current * direct_size;
        Ok(Some((run, offset)))
    }

    fn double_indirect_violation(&self, run: BlockRun, detail: &str, index: u64) -> BfsError {
        error!(
            invariant = "double_indirect_layout",
            inode = self.id.0,
            run = %run,
            index,
            detail,
            "double_indirect_invariant_violation"
        );
        BfsError::bad_data(
            self.volume.block_to_offset(self.id.block()),
            format!("inode {}: {detail} ({run})", self.id),
        )
    }

    fn run_in_block(
        &self,
        cached: &mut CachedBlock<'_>,
        block: BlockNumber,
        slot: usize,
    ) -> Result<BlockRun> {
        let bytes = cached.set_to(block)?;
        BlockRun::parse(self.volume.byte_order(), bytes, slot * BlockRun::SIZE).map_err(|e| {
            parse_to_bfs_error(self.volume.block_to_offset(block), &e)
        })
    }

    // ── Reads ─────────────────────────────────────────────────────────

    /// Read up to `buf.len()` bytes at `pos`, reporting partial progress.
    ///
    /// The count is the number of bytes copied into `buf` before the first
    /// failure (or in total, on success). Reads past the end of the stream
    /// are clamped; `pos >= size` transfers nothing and succeeds.
    pub fn read_at_partial(&self, pos: u64, buf: &mut [u8]) -> (usize, Result<()>) {
        let size = self.size();
        if pos >= size || buf.is_empty() {
            return (0, Ok(()));
        }
        let length = usize::try_from(size - pos).map_or(buf.len(), |left| left.min(buf.len()));
        let mut done = 0;
        let result = self.read_into(pos, &mut buf[..length], &mut done);
        (done, result)
    }

    /// Read at `pos`; fails only when nothing could be read.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        match self.read_at_partial(pos, buf) {
            (n, Ok(())) => Ok(n),
            (0, Err(err)) => Err(err),
            (n, Err(err)) => {
                warn!(inode = self.id.0, pos, transferred = n, error = %err, "stream_short_read");
                Ok(n)
            }
        }
    }

    fn read_into(&self, pos: u64, buf: &mut [u8], done: &mut usize) -> Result<()> {
        let shift = self.volume.block_shift();
        let block_size = self.volume.block_size().as_usize();
        let mut cached = CachedBlock::new(self.volume);

        while *done < buf.len() {
            let here = pos + *done as u64;
            let remaining = buf.len() - *done;
            let (run, run_offset) = self.find_block_run(here)?;
            let blocks_in = (here - run_offset) >> shift;
            let block = BlockNumber(self.volume.to_block(run).0 + blocks_in);
            let within = (here & (block_size as u64 - 1)) as usize;

            if within != 0 || remaining < block_size {
                // unaligned head or short tail goes through the block buffer
                let bytes = cached.set_to(block)?;
                let take = (block_size - within).min(remaining);
                buf[*done..*done + take].copy_from_slice(&bytes[within..within + take]);
                *done += take;
                continue;
            }

            // whole blocks straight from the device, up to the end of the run
            let run_left = u64::from(run.length) - blocks_in;
            let whole = run_left.min((remaining >> shift) as u64) as usize;
            let len = whole << shift;
            self.volume
                .read_blocks(block, &mut buf[*done..*done + len])?;
            *done += len;
        }
        Ok(())
    }

    /// Symlink target: inline, or the stream contents for long links.
    pub fn read_link(&self) -> Result<String> {
        if !self.inode.is_symlink() {
            return Err(BfsError::NotSymlink);
        }
        if !self.inode.is_long_symlink() {
            return Ok(String::from_utf8_lossy(self.inode.short_symlink()).into_owned());
        }
        let size = usize::try_from(self.size())
            .map_err(|_| BfsError::bad_inode(self.id.0, "symlink size does not fit memory"))?;
        let mut target = vec![0_u8; size];
        let n = self.read_at(0, &mut target)?;
        target.truncate(n);
        if let Some(nul) = target.iter().position(|b| *b == 0) {
            target.truncate(nul);
        }
        Ok(String::from_utf8_lossy(&target).into_owned())
    }
}

/// Negative ranges read as "tier absent".
fn range(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn run_in_volume(volume: &Volume, run: BlockRun) -> bool {
    run.allocation_group >= 0
        && u32::try_from(run.allocation_group).is_ok_and(|g| g < volume.allocation_groups())
        && u64::from(run.start) <= 1_u64 << volume.allocation_group_shift()
}

/// Inode self-check, then the lifecycle flags.
fn check_inode(volume: &Volume, id: InodeId, inode: &Inode) -> Result<()> {
    let failure = if inode.magic1 != INODE_MAGIC1 {
        Some("bad magic")
    } else if !inode.is_in_use() {
        Some("inode not in use")
    } else if inode.inode_num.length != 1 {
        Some("inode run length is not 1")
    } else if volume.to_inode_id(inode.inode_num) != id {
        Some("inode number does not match its block")
    } else if usize::try_from(inode.inode_size).ok() != Some(volume.inode_size()) {
        Some("inode size differs from volume inode size")
    } else if !run_in_volume(volume, inode.parent) || inode.parent.length != 1 {
        Some("parent run outside volume")
    } else if !run_in_volume(volume, inode.attributes) {
        Some("attribute run outside volume")
    } else {
        None
    };
    if let Some(detail) = failure {
        error!(
            invariant = "inode_self_check",
            inode = id.0,
            magic = inode.magic1,
            flags = inode.flags,
            detail,
            "inode_invariant_violation"
        );
        return Err(BfsError::bad_inode(id.0, detail));
    }
    if inode.is_deleted() {
        return Err(BfsError::NotAllowed);
    }
    if inode.is_not_ready() {
        return Err(BfsError::Busy);
    }
    Ok(())
}
