#![forbid(unsafe_code)]
//! Raw device access for the BFS reader.
//!
//! The reader needs exactly one primitive from its host: "read N bytes at
//! absolute byte offset". [`ByteDevice`] is that primitive. Nothing in this
//! crate (or above it) ever writes.
//!
//! [`ArcCache`] is an optional shared block cache that sits underneath the
//! per-call `CachedBlock` buffers. It is off by default.

use bfs_error::{BfsError, Result};
use bfs_types::{BFS_SUPERBLOCK_SIZE, BlockNumber};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Byte-addressed, read-only device (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

impl<D: ByteDevice + ?Sized> ByteDevice for Box<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

fn check_range(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let len = u64::try_from(len)
        .map_err(|_| BfsError::BadValue("read length overflows u64".to_owned()))?;
    let end = offset
        .checked_add(len)
        .ok_or_else(|| BfsError::BadValue("read range overflows u64".to_owned()))?;
    if end > device_len {
        return Err(BfsError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("read out of bounds: offset={offset} len={len} device_len={device_len}"),
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`-style I/O.
///
/// The file is opened read-only and shared through an `Arc`, so clones are
/// cheap and do not share a seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory device over an owned image.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len_bytes())?;
        let start = usize::try_from(offset)
            .map_err(|_| BfsError::BadValue("offset does not fit usize".to_owned()))?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

/// Read the superblock region (512 bytes) at `offset`.
pub fn read_superblock_region(
    dev: &dyn ByteDevice,
    offset: u64,
) -> Result<[u8; BFS_SUPERBLOCK_SIZE]> {
    let mut buf = [0_u8; BFS_SUPERBLOCK_SIZE];
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}

// ── ARC block cache ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArcList {
    T1,
    T2,
    B1,
    B2,
}

/// Hit/miss counters of an [`ArcCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
struct ArcState {
    capacity: usize,
    /// Target size for the T1 list.
    p: usize,
    t1: VecDeque<BlockNumber>,
    t2: VecDeque<BlockNumber>,
    b1: VecDeque<BlockNumber>,
    b2: VecDeque<BlockNumber>,
    loc: HashMap<BlockNumber, ArcList>,
    resident: HashMap<BlockNumber, Arc<[u8]>>,
    stats: CacheStats,
}

impl ArcState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            p: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            loc: HashMap::new(),
            resident: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    fn unlink(list: &mut VecDeque<BlockNumber>, key: BlockNumber) {
        if let Some(pos) = list.iter().position(|k| *k == key) {
            let _ = list.remove(pos);
        }
    }

    fn lookup(&mut self, key: BlockNumber) -> Option<Arc<[u8]>> {
        let bytes = self.resident.get(&key).cloned()?;
        // A second reference promotes the block to the frequency list.
        match self.loc.get(&key).copied() {
            Some(ArcList::T1) => {
                Self::unlink(&mut self.t1, key);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            Some(ArcList::T2) => {
                Self::unlink(&mut self.t2, key);
                self.t2.push_back(key);
            }
            _ => {}
        }
        self.stats.hits += 1;
        Some(bytes)
    }

    /// Demote one resident block to its ghost list.
    fn replace(&mut self, incoming_in_b2: bool) {
        let t1_len = self.t1.len();
        let from_t1 = t1_len >= 1 && (t1_len > self.p || (incoming_in_b2 && t1_len == self.p));
        let (source, ghost, tag) = if from_t1 {
            (&mut self.t1, &mut self.b1, ArcList::B1)
        } else {
            (&mut self.t2, &mut self.b2, ArcList::B2)
        };
        if let Some(victim) = source.pop_front() {
            let _ = self.resident.remove(&victim);
            ghost.push_back(victim);
            self.loc.insert(victim, tag);
        }
        for ghost in [&mut self.b1, &mut self.b2] {
            while ghost.len() > self.capacity {
                if let Some(victim) = ghost.pop_front() {
                    let _ = self.loc.remove(&victim);
                }
            }
        }
    }

    fn insert(&mut self, key: BlockNumber, bytes: Arc<[u8]>) {
        self.stats.misses += 1;
        match self.loc.get(&key).copied() {
            Some(ArcList::B1) => {
                let delta = (self.b2.len().max(1) / self.b1.len().max(1)).max(1);
                self.p = (self.p + delta).min(self.capacity);
                Self::unlink(&mut self.b1, key);
                self.replace(false);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            Some(ArcList::B2) => {
                let delta = (self.b1.len().max(1) / self.b2.len().max(1)).max(1);
                self.p = self.p.saturating_sub(delta);
                Self::unlink(&mut self.b2, key);
                self.replace(true);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            Some(ArcList::T1 | ArcList::T2) => {}
            None => {
                let l1 = self.t1.len() + self.b1.len();
                let total = l1 + self.t2.len() + self.b2.len();
                if l1 == self.capacity {
                    if self.t1.len() < self.capacity {
                        if let Some(old) = self.b1.pop_front() {
                            let _ = self.loc.remove(&old);
                        }
                        self.replace(false);
                    } else if let Some(victim) = self.t1.pop_front() {
                        let _ = self.loc.remove(&victim);
                        let _ = self.resident.remove(&victim);
                    }
                } else if total >= self.capacity {
                    if total >= self.capacity.saturating_mul(2) {
                        if let Some(old) = self.b2.pop_front() {
                            let _ = self.loc.remove(&old);
                        }
                    }
                    self.replace(false);
                }
                self.t1.push_back(key);
                self.loc.insert(key, ArcList::T1);
            }
        }
        self.resident.insert(key, bytes);
    }
}

/// Block-granular ARC cache in front of a [`ByteDevice`].
///
/// Reads are split on `block_size` boundaries; each block is fetched whole
/// from the inner device on a miss and kept until the ARC policy evicts it.
#[derive(Debug)]
pub struct ArcCache<D: ByteDevice> {
    inner: D,
    block_size: u64,
    state: Mutex<ArcState>,
}

impl<D: ByteDevice> ArcCache<D> {
    pub fn new(inner: D, block_size: u32, capacity_blocks: usize) -> Result<Self> {
        if capacity_blocks == 0 {
            return Err(BfsError::BadValue(
                "ArcCache capacity_blocks must be > 0".to_owned(),
            ));
        }
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(BfsError::BadValue(format!(
                "invalid cache block_size={block_size} (must be power of two)"
            )));
        }
        Ok(Self {
            inner,
            block_size: u64::from(block_size),
            state: Mutex::new(ArcState::new(capacity_blocks)),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    fn fetch(&self, block: BlockNumber) -> Result<Arc<[u8]>> {
        if let Some(bytes) = self.state.lock().lookup(block) {
            return Ok(bytes);
        }

        let start = block.0 * self.block_size;
        let len = self
            .block_size
            .min(self.inner.len_bytes().saturating_sub(start));
        let len = usize::try_from(len)
            .map_err(|_| BfsError::BadValue("block length does not fit usize".to_owned()))?;
        let mut buf = vec![0_u8; len];
        self.inner.read_exact_at(start, &mut buf)?;
        trace!(block = block.0, len, "arc_cache_fill");

        let bytes: Arc<[u8]> = buf.into();
        self.state.lock().insert(block, Arc::clone(&bytes));
        Ok(bytes)
    }
}

impl<D: ByteDevice> ByteDevice for ArcCache<D> {
    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.inner.len_bytes())?;
        let mut done = 0_usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block = BlockNumber(pos / self.block_size);
            // the offset inside a block is always < block_size
            let within = (pos % self.block_size) as usize;
            let bytes = self.fetch(block)?;
            let take = (bytes.len() - within).min(buf.len() - done);
            buf[done..done + take].copy_from_slice(&bytes[within..within + take]);
            done += take;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn memory_device_reads_and_bounds_checks() {
        let dev = MemoryByteDevice::new(patterned(4096));
        let mut buf = [0_u8; 4];
        dev.read_exact_at(251, &mut buf).expect("read");
        assert_eq!(buf, [0, 1, 2, 3]);

        let err = dev.read_exact_at(4094, &mut buf).expect_err("oob");
        assert!(matches!(err, BfsError::Io(_)));
    }

    #[test]
    fn superblock_region_is_512_bytes() {
        let dev = MemoryByteDevice::new(patterned(2048));
        let region = read_superblock_region(&dev, 512).expect("region");
        assert_eq!(region.len(), 512);
        assert_eq!(region[0], (512 % 251) as u8);
    }

    #[test]
    fn boxed_devices_forward() {
        let dev: Box<dyn ByteDevice> = Box::new(MemoryByteDevice::new(patterned(1024)));
        assert_eq!(dev.len_bytes(), 1024);
        let mut buf = [0_u8; 2];
        dev.read_exact_at(0, &mut buf).expect("read");
        assert_eq!(buf, [0, 1]);
    }

    #[test]
    fn arc_cache_hits_after_first_read() {
        let cache = ArcCache::new(MemoryByteDevice::new(patterned(4096)), 1024, 2).expect("cache");
        let mut a = [0_u8; 16];
        let mut b = [0_u8; 16];
        cache.read_exact_at(1030, &mut a).expect("read1");
        cache.read_exact_at(1030, &mut b).expect("read2");
        assert_eq!(a, b);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[test]
    fn arc_cache_reads_span_blocks() {
        let image = patterned(4096);
        let cache = ArcCache::new(MemoryByteDevice::new(image.clone()), 1024, 4).expect("cache");
        let mut buf = vec![0_u8; 2100];
        cache.read_exact_at(1000, &mut buf).expect("read");
        assert_eq!(buf.as_slice(), &image[1000..3100]);
        assert_eq!(cache.stats().misses, 4);
    }

    #[test]
    fn arc_cache_evicts_beyond_capacity() {
        let image = patterned(8192);
        let cache = ArcCache::new(MemoryByteDevice::new(image.clone()), 1024, 2).expect("cache");
        let mut buf = [0_u8; 8];
        for block in 0..8_u64 {
            cache.read_exact_at(block * 1024, &mut buf).expect("read");
            assert_eq!(&buf, &image[(block * 1024) as usize..(block * 1024) as usize + 8]);
        }
        let resident = cache.state.lock().resident.len();
        assert!(resident <= 2, "resident={resident}");
    }

    #[test]
    fn arc_cache_rejects_zero_capacity() {
        assert!(ArcCache::new(MemoryByteDevice::new(vec![0; 1024]), 1024, 0).is_err());
        assert!(ArcCache::new(MemoryByteDevice::new(vec![0; 1024]), 1000, 4).is_err());
    }
}
