use crate::block_run::{BlockRun, parse_block_runs};
use bfs_types::{
    ByteOrder, FILE_NAME_NAME, FILE_NAME_TYPE, INODE_DELETED, INODE_IN_USE, INODE_LONG_SYMLINK,
    INODE_NOT_READY, NUM_DIRECT_BLOCKS, ParseError, S_ALLOW_DUPS, S_ATTR_DIR, S_IFDIR, S_IFLNK,
    S_IFMT, S_IFREG, S_INDEX_DIR, SHORT_SYMLINK_NAME_LENGTH, ensure_slice,
};
use serde::{Deserialize, Serialize};

/// Byte offset of the data stream (or inline symlink) inside an inode.
pub const DATA_STREAM_OFFSET: usize = 72;
/// Size of the on-disk `data_stream`.
pub const DATA_STREAM_SIZE: usize = 144;
/// Byte offset where the small-data area begins.
pub const SMALL_DATA_OFFSET: usize = 232;
/// Fixed inode header, everything before the small-data area.
pub const INODE_HEADER_SIZE: usize = SMALL_DATA_OFFSET;

/// Size of a small-data entry header (type, name_size, data_size).
pub const SMALL_DATA_HEADER_SIZE: usize = 8;
/// Gap between an entry's name and its data.
const SMALL_DATA_NAME_GAP: usize = 3;

/// Three-tier block map of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStream {
    pub direct: [BlockRun; NUM_DIRECT_BLOCKS],
    pub max_direct_range: i64,
    pub indirect: BlockRun,
    pub max_indirect_range: i64,
    pub double_indirect: BlockRun,
    pub max_double_indirect_range: i64,
    pub size: i64,
}

impl DataStream {
    pub fn parse(order: ByteOrder, data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let runs = parse_block_runs(order, data, offset, NUM_DIRECT_BLOCKS)?;
        let mut direct = [BlockRun::default(); NUM_DIRECT_BLOCKS];
        direct.copy_from_slice(&runs);
        let base = offset + NUM_DIRECT_BLOCKS * BlockRun::SIZE;
        Ok(Self {
            direct,
            max_direct_range: order.read_i64(data, base)?,
            indirect: BlockRun::parse(order, data, base + 8)?,
            max_indirect_range: order.read_i64(data, base + 16)?,
            double_indirect: BlockRun::parse(order, data, base + 24)?,
            max_double_indirect_range: order.read_i64(data, base + 32)?,
            size: order.read_i64(data, base + 40)?,
        })
    }

    /// Serialize into the 144-byte on-disk form.
    #[must_use]
    pub fn to_bytes(&self, order: ByteOrder) -> [u8; DATA_STREAM_SIZE] {
        let mut out = [0_u8; DATA_STREAM_SIZE];
        for (i, run) in self.direct.iter().enumerate() {
            let at = i * BlockRun::SIZE;
            out[at..at + BlockRun::SIZE].copy_from_slice(&run.to_bytes(order));
        }
        let base = NUM_DIRECT_BLOCKS * BlockRun::SIZE;
        out[base..base + 8].copy_from_slice(&order.i64_bytes(self.max_direct_range));
        out[base + 8..base + 16].copy_from_slice(&self.indirect.to_bytes(order));
        out[base + 16..base + 24].copy_from_slice(&order.i64_bytes(self.max_indirect_range));
        out[base + 24..base + 32].copy_from_slice(&self.double_indirect.to_bytes(order));
        out[base + 32..base + 40]
            .copy_from_slice(&order.i64_bytes(self.max_double_indirect_range));
        out[base + 40..base + 48].copy_from_slice(&order.i64_bytes(self.size));
        out
    }

    /// Logical size in bytes; negative sizes read as empty.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        u64::try_from(self.size).unwrap_or(0)
    }
}

impl Default for DataStream {
    fn default() -> Self {
        Self {
            direct: [BlockRun::default(); NUM_DIRECT_BLOCKS],
            max_direct_range: 0,
            indirect: BlockRun::default(),
            max_indirect_range: 0,
            double_indirect: BlockRun::default(),
            max_double_indirect_range: 0,
            size: 0,
        }
    }
}

/// Parsed `bfs_inode` plus the raw bytes it came from.
///
/// The raw copy backs the inline symlink text and the small-data area,
/// both of which are variable-length and read lazily.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub magic1: u32,
    pub inode_num: BlockRun,
    pub uid: i32,
    pub gid: i32,
    pub mode: u32,
    pub flags: u32,
    pub create_time: i64,
    pub last_modified_time: i64,
    pub parent: BlockRun,
    pub attributes: BlockRun,
    pub type_code: u32,
    pub inode_size: i32,
    pub data: DataStream,
    raw: Vec<u8>,
    order: ByteOrder,
}

impl Inode {
    /// Parse an inode from its block. `data` should be the full inode
    /// (`inode_size` bytes); at least the fixed header must be present.
    pub fn parse(order: ByteOrder, data: &[u8]) -> Result<Self, ParseError> {
        let _ = ensure_slice(data, 0, INODE_HEADER_SIZE)?;
        Ok(Self {
            magic1: order.read_u32(data, 0)?,
            inode_num: BlockRun::parse(order, data, 4)?,
            uid: order.read_i32(data, 12)?,
            gid: order.read_i32(data, 16)?,
            mode: order.read_u32(data, 20)?,
            flags: order.read_u32(data, 24)?,
            create_time: order.read_i64(data, 28)?,
            last_modified_time: order.read_i64(data, 36)?,
            parent: BlockRun::parse(order, data, 44)?,
            attributes: BlockRun::parse(order, data, 52)?,
            type_code: order.read_u32(data, 60)?,
            inode_size: order.read_i32(data, 64)?,
            data: DataStream::parse(order, data, DATA_STREAM_OFFSET)?,
            raw: data.to_vec(),
            order,
        })
    }

    #[must_use]
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    #[must_use]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.has_flag(INODE_IN_USE)
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.has_flag(INODE_DELETED)
    }

    #[must_use]
    pub fn is_not_ready(&self) -> bool {
        self.has_flag(INODE_NOT_READY)
    }

    #[must_use]
    pub fn is_long_symlink(&self) -> bool {
        self.has_flag(INODE_LONG_SYMLINK)
    }

    /// Directory, attribute directory, or index directory.
    #[must_use]
    pub fn is_container(&self) -> bool {
        self.mode & (S_IFDIR | S_INDEX_DIR | S_ATTR_DIR) != 0
    }

    /// Plain directory (not an attribute or index directory).
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.mode & (S_INDEX_DIR | S_ATTR_DIR | S_IFDIR) == S_IFDIR
    }

    /// One index of the volume's index directory (not the index root).
    #[must_use]
    pub fn is_index(&self) -> bool {
        self.mode & (S_INDEX_DIR | 0o777) == S_INDEX_DIR
    }

    #[must_use]
    pub fn is_attribute_directory(&self) -> bool {
        self.mode & S_ATTR_DIR != 0
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.mode & (S_IFMT | S_ATTR_DIR | S_INDEX_DIR) == S_IFREG
    }

    /// Whether a B+tree stored in this inode may hold duplicate keys.
    #[must_use]
    pub fn allows_duplicates(&self) -> bool {
        self.is_index() || self.mode & S_ALLOW_DUPS != 0
    }

    /// Inline symlink target, up to the first NUL.
    #[must_use]
    pub fn short_symlink(&self) -> &[u8] {
        let end = (DATA_STREAM_OFFSET + SHORT_SYMLINK_NAME_LENGTH).min(self.raw.len());
        let area = &self.raw[DATA_STREAM_OFFSET.min(end)..end];
        let len = area.iter().position(|b| *b == 0).unwrap_or(area.len());
        &area[..len]
    }

    /// Iterate the small-data entries stored after the header.
    #[must_use]
    pub fn small_data(&self) -> SmallDataIter<'_> {
        let limit = usize::try_from(self.inode_size)
            .unwrap_or(0)
            .min(self.raw.len());
        SmallDataIter {
            raw: &self.raw,
            order: self.order,
            pos: SMALL_DATA_OFFSET,
            limit,
            done: false,
        }
    }

    /// The inode's own file name, kept as a small-data entry.
    pub fn file_name(&self) -> Result<Option<String>, ParseError> {
        for entry in self.small_data() {
            let entry = entry?;
            if entry.type_code == FILE_NAME_TYPE && entry.name == &[FILE_NAME_NAME][..] {
                let len = entry
                    .data
                    .iter()
                    .position(|b| *b == 0)
                    .unwrap_or(entry.data.len());
                return Ok(Some(String::from_utf8_lossy(&entry.data[..len]).into_owned()));
            }
        }
        Ok(None)
    }
}

/// One small-data entry (an attribute stored inside the inode block).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmallData<'a> {
    pub type_code: u32,
    pub name: &'a [u8],
    pub data: &'a [u8],
}

impl SmallData<'_> {
    /// Bytes an entry with the given name and data lengths occupies.
    #[must_use]
    pub fn encoded_len(name_len: usize, data_len: usize) -> usize {
        SMALL_DATA_HEADER_SIZE + name_len + SMALL_DATA_NAME_GAP + data_len + 1
    }

    /// Encode one entry; the data is followed by a NUL terminator.
    #[must_use]
    pub fn encode(order: ByteOrder, type_code: u32, name: &[u8], data: &[u8]) -> Vec<u8> {
        let mut out = vec![0_u8; Self::encoded_len(name.len(), data.len())];
        out[0..4].copy_from_slice(&order.u32_bytes(type_code));
        out[4..6].copy_from_slice(&order.u16_bytes(u16::try_from(name.len()).unwrap_or(0)));
        out[6..8].copy_from_slice(&order.u16_bytes(u16::try_from(data.len()).unwrap_or(0)));
        let name_end = SMALL_DATA_HEADER_SIZE + name.len();
        out[SMALL_DATA_HEADER_SIZE..name_end].copy_from_slice(name);
        let data_start = name_end + SMALL_DATA_NAME_GAP;
        out[data_start..data_start + data.len()].copy_from_slice(data);
        out
    }
}

/// Iterator over an inode's small-data area. Stops at the first empty
/// entry; yields one error and stops if an entry overruns the inode.
#[derive(Debug, Clone)]
pub struct SmallDataIter<'a> {
    raw: &'a [u8],
    order: ByteOrder,
    pos: usize,
    limit: usize,
    done: bool,
}

impl<'a> SmallDataIter<'a> {
    fn read_entry(&mut self) -> Result<Option<SmallData<'a>>, ParseError> {
        if self.pos + SMALL_DATA_HEADER_SIZE > self.limit {
            return Ok(None);
        }
        let type_code = self.order.read_u32(self.raw, self.pos)?;
        let name_size = usize::from(self.order.read_u16(self.raw, self.pos + 4)?);
        let data_size = usize::from(self.order.read_u16(self.raw, self.pos + 6)?);
        if name_size == 0 {
            return Ok(None);
        }

        let total = SmallData::encoded_len(name_size, data_size);
        if self.pos + total > self.limit {
            return Err(ParseError::InvalidField {
                field: "small_data",
                reason: "entry overruns inode",
            });
        }
        let name_start = self.pos + SMALL_DATA_HEADER_SIZE;
        let data_start = name_start + name_size + SMALL_DATA_NAME_GAP;
        let entry = SmallData {
            type_code,
            name: &self.raw[name_start..name_start + name_size],
            data: &self.raw[data_start..data_start + data_size],
        };
        self.pos += total;
        Ok(Some(entry))
    }
}

impl<'a> Iterator for SmallDataIter<'a> {
    type Item = Result<SmallData<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfs_types::{INODE_MAGIC1, S_INT_INDEX, S_STR_INDEX};

    fn inode_bytes(order: ByteOrder, mode: u32, flags: u32) -> Vec<u8> {
        let mut raw = vec![0_u8; 1024];
        raw[0..4].copy_from_slice(&order.u32_bytes(INODE_MAGIC1));
        raw[4..12].copy_from_slice(&BlockRun::new(0, 40, 1).to_bytes(order));
        raw[20..24].copy_from_slice(&order.u32_bytes(mode));
        raw[24..28].copy_from_slice(&order.u32_bytes(flags));
        raw[44..52].copy_from_slice(&BlockRun::new(0, 8, 1).to_bytes(order));
        raw[64..68].copy_from_slice(&order.i32_bytes(1024));
        raw
    }

    #[test]
    fn parses_header_and_stream() {
        let order = ByteOrder::Big;
        let mut raw = inode_bytes(order, S_IFREG | 0o644, INODE_IN_USE);
        let mut stream = DataStream::default();
        stream.direct[0] = BlockRun::new(1, 2, 3);
        stream.max_direct_range = 3 * 1024;
        stream.size = 3000;
        raw[DATA_STREAM_OFFSET..DATA_STREAM_OFFSET + DATA_STREAM_SIZE]
            .copy_from_slice(&stream.to_bytes(order));

        let inode = Inode::parse(order, &raw).expect("inode");
        assert_eq!(inode.magic1, INODE_MAGIC1);
        assert_eq!(inode.inode_num, BlockRun::new(0, 40, 1));
        assert_eq!(inode.parent, BlockRun::new(0, 8, 1));
        assert_eq!(inode.data, stream);
        assert_eq!(inode.data.size_bytes(), 3000);
        assert!(inode.is_file());
        assert!(inode.is_in_use());
        assert!(!inode.is_container());
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(matches!(
            Inode::parse(ByteOrder::Little, &[0_u8; 100]),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn mode_classification() {
        let order = ByteOrder::Little;
        let parse = |mode| Inode::parse(order, &inode_bytes(order, mode, INODE_IN_USE)).expect("inode");

        let dir = parse(S_IFDIR | 0o755);
        assert!(dir.is_directory() && dir.is_container() && !dir.is_index());
        assert!(!dir.allows_duplicates());

        let index_root = parse(S_INDEX_DIR | S_IFDIR | 0o700);
        assert!(index_root.is_container() && !index_root.is_directory());
        assert!(!index_root.is_index());

        let index = parse(S_INDEX_DIR | S_STR_INDEX);
        assert!(index.is_index() && index.is_container());
        assert!(index.allows_duplicates());

        let attrs = parse(S_ATTR_DIR | S_IFDIR);
        assert!(attrs.is_attribute_directory() && !attrs.is_directory());

        let dups = parse(S_IFDIR | S_ALLOW_DUPS | S_INT_INDEX);
        assert!(dups.allows_duplicates());

        let link = parse(S_IFLNK | 0o777);
        assert!(link.is_symlink() && !link.is_file());
    }

    #[test]
    fn short_symlink_stops_at_nul() {
        let order = ByteOrder::Little;
        let mut raw = inode_bytes(order, S_IFLNK | 0o777, INODE_IN_USE);
        raw[DATA_STREAM_OFFSET..DATA_STREAM_OFFSET + 11].copy_from_slice(b"/boot/home\0");
        let inode = Inode::parse(order, &raw).expect("inode");
        assert_eq!(inode.short_symlink(), b"/boot/home");
        assert!(!inode.is_long_symlink());
    }

    #[test]
    fn small_data_holds_file_name() {
        let order = ByteOrder::Little;
        let mut raw = inode_bytes(order, S_IFREG, INODE_IN_USE);
        let first = SmallData::encode(order, 0x4c4f_4e47, b"be:size", &[1, 2, 3]);
        let name = SmallData::encode(order, FILE_NAME_TYPE, &[FILE_NAME_NAME], b"kernel_x86");
        let mut at = SMALL_DATA_OFFSET;
        for entry in [&first, &name] {
            raw[at..at + entry.len()].copy_from_slice(entry);
            at += entry.len();
        }

        let inode = Inode::parse(order, &raw).expect("inode");
        let entries: Vec<_> = inode
            .small_data()
            .collect::<Result<_, _>>()
            .expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, b"be:size");
        assert_eq!(entries[0].data, &[1_u8, 2, 3]);
        assert_eq!(
            inode.file_name().expect("name").as_deref(),
            Some("kernel_x86")
        );
    }

    #[test]
    fn small_data_overrun_is_reported() {
        let order = ByteOrder::Little;
        let mut raw = inode_bytes(order, S_IFREG, INODE_IN_USE);
        let entry = SmallData::encode(order, FILE_NAME_TYPE, &[FILE_NAME_NAME], b"x");
        raw[SMALL_DATA_OFFSET..SMALL_DATA_OFFSET + entry.len()].copy_from_slice(&entry);
        // claim a data size far past the inode end
        raw[SMALL_DATA_OFFSET + 6..SMALL_DATA_OFFSET + 8].copy_from_slice(&order.u16_bytes(4000));
        let inode = Inode::parse(order, &raw).expect("inode");
        assert!(inode.file_name().is_err());
    }

    #[test]
    fn missing_name_is_none() {
        let order = ByteOrder::Little;
        let inode = Inode::parse(order, &inode_bytes(order, S_IFREG, INODE_IN_USE)).expect("inode");
        assert_eq!(inode.file_name().expect("scan"), None);
    }
}
