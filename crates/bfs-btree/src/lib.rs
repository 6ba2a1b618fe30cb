#![forbid(unsafe_code)]
//! B+tree index over a BFS stream.
//!
//! Directories, attribute directories and indices all store their entries
//! in a B+tree whose pages live in the inode's own data stream. Page 0 is
//! the [`BPlusTreeHeader`]; every other page is a 1024-byte node addressed
//! by its byte offset in the stream.
//!
//! All structural checks happen when a node is loaded through
//! [`CachedNode`], before any key or value of it is trusted.

mod iterator;

pub use iterator::{Boundary, Direction, DuplicateMarker, TreeEntry, TreeIterator};

use bfs_error::{BfsError, Result};
use bfs_inode::Stream;
use bfs_ondisk::{BPlusTreeHeader, KeyType, NodeView, compare_keys};
use bfs_types::{
    BPLUSTREE_HEADER_SIZE, BPLUSTREE_MAGIC, BPLUSTREE_MAX_KEY_LENGTH, BPLUSTREE_MIN_KEY_LENGTH,
    BPLUSTREE_NODE_SIZE, ParseError, S_INDEX_DIR, S_INDEX_TYPES,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{error, trace};

// ── Search results ──────────────────────────────────────────────────────────

/// Outcome of a binary search inside one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySearch {
    /// Index of the matching key, or of the first key greater than it.
    pub index: u16,
    /// Link to follow: the value at `index`, or the overflow link when the
    /// key sorts after every key in the node.
    pub next: i64,
    pub found: bool,
}

/// One node visited on the way down, with the key index taken there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePosition {
    pub offset: i64,
    pub index: u16,
}

// ── Tree ────────────────────────────────────────────────────────────────────

/// An opened B+tree. Owns the stream it is stored in.
#[derive(Debug)]
pub struct BPlusTree<'v> {
    stream: Stream<'v>,
    header: BPlusTreeHeader,
    key_type: KeyType,
    allow_duplicates: bool,
}

impl<'v> BPlusTree<'v> {
    /// Read and check the header in page 0 of `stream`.
    pub fn open(stream: Stream<'v>) -> Result<Self> {
        let at = inode_offset(&stream);
        let mut raw = [0_u8; BPLUSTREE_HEADER_SIZE];
        let n = stream.read_at(0, &mut raw)?;
        if n != raw.len() {
            return Err(BfsError::bad_data(
                at,
                format!("inode {}: B+tree header truncated", stream.id()),
            ));
        }
        let header = BPlusTreeHeader::parse(stream.volume().byte_order(), &raw)
            .map_err(|e| bfs_volume::parse_to_bfs_error(at, &e))?;
        check_header(&stream, &header)?;

        let mode = stream.mode();
        let key_type = KeyType::from_code(header.data_type)
            .filter(|kt| mode & S_INDEX_DIR == 0 || kt.index_mode() == mode & S_INDEX_TYPES)
            .filter(|_| stream.is_container());
        let Some(key_type) = key_type else {
            return Err(BfsError::BadType(format!(
                "inode {}: key type {} does not fit mode {:#o}",
                stream.id(),
                header.data_type,
                mode
            )));
        };

        let allow_duplicates = stream.allows_duplicates();
        trace!(
            inode = stream.id().0,
            root = header.root_node_pointer,
            levels = header.max_number_of_levels,
            key_type = ?key_type,
            allow_duplicates,
            "bplustree_open"
        );
        Ok(Self {
            stream,
            header,
            key_type,
            allow_duplicates,
        })
    }

    #[must_use]
    pub fn stream(&self) -> &Stream<'v> {
        &self.stream
    }

    #[must_use]
    pub fn into_stream(self) -> Stream<'v> {
        self.stream
    }

    #[must_use]
    pub fn header(&self) -> &BPlusTreeHeader {
        &self.header
    }

    #[must_use]
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    #[must_use]
    pub fn allows_duplicates(&self) -> bool {
        self.allow_duplicates
    }

    #[must_use]
    pub fn node_size(&self) -> usize {
        self.header.node_size as usize
    }

    /// Order two keys the way this tree sorts them.
    #[must_use]
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        compare_keys(self.key_type, self.stream.volume().byte_order(), a, b)
    }

    /// Iterator positioned before the first key.
    pub fn iterator(&self) -> Result<TreeIterator<'_, 'v>> {
        let mut it = TreeIterator::new(self);
        it.rewind()?;
        Ok(it)
    }

    /// Binary search for `key` in a loaded node.
    ///
    /// Every probed key is bounds-checked against the node before it is
    /// compared.
    pub fn find_key(&self, node: &NodeView<'_>, key: &[u8]) -> Result<KeySearch> {
        let count = node.num_keys();
        let (mut lo, mut hi) = (0_u16, count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let probe = node
                .key_at(mid)
                .map_err(|e| self.corrupt(None, "key probe", &e))?;
            match self.compare(key, probe) {
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
                Ordering::Equal => {
                    return Ok(KeySearch {
                        index: mid,
                        next: self.value(node, mid)?,
                        found: true,
                    });
                }
            }
        }
        let next = if lo == count {
            node.overflow_link()
        } else {
            self.value(node, lo)?
        };
        Ok(KeySearch {
            index: lo,
            next,
            found: false,
        })
    }

    /// Value stored for `key`.
    ///
    /// Trees that may hold duplicates have no single value per key and are
    /// rejected with `BadType`; use a [`TreeIterator`] for those.
    pub fn find(&self, key: &[u8]) -> Result<i64> {
        check_key_length(key)?;
        if self.allow_duplicates {
            return Err(BfsError::BadType(format!(
                "inode {}: single-value lookup on a tree with duplicates",
                self.stream.id()
            )));
        }
        let (_, search) = self.descend(key, |_, _| {})?;
        if search.found {
            Ok(search.next)
        } else {
            Err(BfsError::NotFound(String::from_utf8_lossy(key).into_owned()))
        }
    }

    /// Path from the root to the leaf where `key` is or would be.
    pub fn seek_down(&self, key: &[u8]) -> Result<Vec<NodePosition>> {
        check_key_length(key)?;
        let mut path = Vec::new();
        self.descend(key, |offset, search| {
            path.push(NodePosition {
                offset,
                index: search.index,
            });
        })?;
        Ok(path)
    }

    /// Walk from the root to the leaf for `key`, reporting every node.
    ///
    /// Returns the leaf offset and the search result inside it.
    pub(crate) fn descend(
        &self,
        key: &[u8],
        mut visit: impl FnMut(i64, KeySearch),
    ) -> Result<(i64, KeySearch)> {
        let mut cached = CachedNode::new(self);
        let mut offset = self.header.root_node_pointer;
        for depth in 0..self.max_depth() {
            let node = cached.set_to(offset)?;
            let search = self.find_key(&node, key)?;
            trace!(
                inode = self.stream.id().0,
                node = offset,
                depth,
                index = search.index,
                found = search.found,
                "bplustree_descend"
            );
            visit(offset, search);
            if node.is_leaf() {
                return Ok((offset, search));
            }
            if search.next == offset {
                return Err(self.violation(Some(offset), "node links to itself"));
            }
            offset = search.next;
        }
        Err(self.violation(Some(offset), "descent deeper than max_number_of_levels"))
    }

    /// Upper bound on nodes visited by one descent.
    pub(crate) fn max_depth(&self) -> u64 {
        u64::from(self.header.max_number_of_levels).min(self.page_count())
    }

    /// Number of pages in the tree, header included.
    pub(crate) fn page_count(&self) -> u64 {
        u64::try_from(self.header.maximum_size).unwrap_or(0) / u64::from(self.header.node_size)
    }

    pub(crate) fn value(&self, node: &NodeView<'_>, index: u16) -> Result<i64> {
        node.value(index)
            .map_err(|e| self.corrupt(None, "value", &e))
    }

    /// Log and build the error for a structural violation in a node.
    pub(crate) fn violation(&self, node: Option<i64>, detail: &str) -> BfsError {
        error!(
            invariant = "bplustree_node",
            inode = self.stream.id().0,
            node = ?node,
            detail,
            "bplustree_invariant_violation"
        );
        let place = node.map_or_else(String::new, |n| format!(" {n}"));
        BfsError::bad_data(
            inode_offset(&self.stream),
            format!("inode {}: B+tree node{place}: {detail}", self.stream.id()),
        )
    }

    pub(crate) fn corrupt(&self, node: Option<i64>, what: &str, e: &ParseError) -> BfsError {
        self.violation(node, &format!("{what}: {e}"))
    }
}

fn inode_offset(stream: &Stream<'_>) -> u64 {
    stream.volume().block_to_offset(stream.id().block())
}

pub(crate) fn check_key_length(key: &[u8]) -> Result<()> {
    if (BPLUSTREE_MIN_KEY_LENGTH..=BPLUSTREE_MAX_KEY_LENGTH).contains(&key.len()) {
        Ok(())
    } else {
        Err(BfsError::BadValue(format!(
            "key length {} outside {BPLUSTREE_MIN_KEY_LENGTH}..={BPLUSTREE_MAX_KEY_LENGTH}",
            key.len()
        )))
    }
}

fn check_header(stream: &Stream<'_>, header: &BPlusTreeHeader) -> Result<()> {
    let root = header.root_node_pointer;
    let failure = if header.magic != BPLUSTREE_MAGIC {
        Some("bad magic")
    } else if header.node_size != BPLUSTREE_NODE_SIZE {
        Some("unsupported node size")
    } else if u64::try_from(header.maximum_size).ok() != Some(stream.size()) {
        Some("maximum size differs from stream size")
    } else if header.max_number_of_levels == 0 {
        Some("tree has no levels")
    } else if root % i64::from(header.node_size) != 0 || root <= 0 || !header.is_valid_link(root) {
        Some("invalid root node link")
    } else if !header.is_valid_link(header.free_node_pointer) {
        Some("invalid free node link")
    } else {
        None
    };
    if let Some(detail) = failure {
        error!(
            invariant = "bplustree_header",
            inode = stream.id().0,
            magic = header.magic,
            root,
            maximum_size = header.maximum_size,
            stream_size = stream.size(),
            detail,
            "bplustree_invariant_violation"
        );
        return Err(BfsError::bad_data(
            inode_offset(stream),
            format!("inode {}: B+tree header: {detail}", stream.id()),
        ));
    }
    Ok(())
}

// ── CachedNode ──────────────────────────────────────────────────────────────

/// One-node read-through buffer over a tree's stream.
///
/// Lives in the calling frame; reloading the offset it already holds is
/// free.
#[derive(Debug)]
pub struct CachedNode<'t, 'v> {
    tree: &'t BPlusTree<'v>,
    offset: Option<i64>,
    data: Vec<u8>,
}

impl<'t, 'v> CachedNode<'t, 'v> {
    #[must_use]
    pub fn new(tree: &'t BPlusTree<'v>) -> Self {
        Self {
            tree,
            offset: None,
            data: vec![0_u8; tree.node_size()],
        }
    }

    /// Offset of the node currently held.
    #[must_use]
    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    /// Load the tree node at `offset` and check its links and value array.
    pub fn set_to(&mut self, offset: i64) -> Result<NodeView<'_>> {
        let tree = self.tree;
        self.load(offset)?;
        let node = NodeView::new(tree.stream.volume().byte_order(), &self.data)
            .map_err(|e| tree.corrupt(Some(offset), "node header", &e))?;
        let header = &tree.header;
        let links_ok = header.is_valid_link(node.left_link())
            && header.is_valid_link(node.right_link())
            && header.is_valid_link(node.overflow_link());
        if !links_ok {
            return Err(tree.violation(Some(offset), "sibling or overflow link out of range"));
        }
        if !node.values_fit() {
            return Err(tree.violation(Some(offset), "value array exceeds node"));
        }
        Ok(node)
    }

    /// Load a duplicate page. Those reuse the link fields for their own
    /// data, so only the offset is checked.
    pub fn set_to_duplicate(&mut self, offset: i64) -> Result<NodeView<'_>> {
        let tree = self.tree;
        self.load(offset)?;
        NodeView::new(tree.stream.volume().byte_order(), &self.data)
            .map_err(|e| tree.corrupt(Some(offset), "duplicate node", &e))
    }

    fn load(&mut self, offset: i64) -> Result<()> {
        let tree = self.tree;
        let node_size = i64::from(tree.header.node_size);
        if offset <= 0 || offset > tree.header.maximum_size - node_size || offset % node_size != 0 {
            self.offset = None;
            return Err(tree.violation(Some(offset), "node offset outside tree"));
        }
        if self.offset == Some(offset) {
            return Ok(());
        }
        self.offset = None;
        let n = tree.stream.read_at(offset as u64, &mut self.data)?;
        if n != self.data.len() {
            return Err(tree.violation(Some(offset), "short node read"));
        }
        self.offset = Some(offset);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{patched, tree_volume};
    use super::*;
    use bfs_harness::{ImageBuilder, ImageConfig, InodeSpec, TreeSpec, pattern};
    use bfs_types::{S_IFDIR, S_IFREG, S_UINT_INDEX};
    use bfs_volume::Volume;

    const UINT_INDEX: u32 = S_INDEX_DIR | S_IFDIR | S_UINT_INDEX;

    fn names(count: usize) -> TreeSpec {
        let mut tree = TreeSpec::new(KeyType::String);
        for i in 0..count {
            tree.insert(format!("entry-{i:04}"), 1000 + i as i64);
        }
        tree
    }

    #[test]
    fn find_every_key_in_multilevel_tree() {
        let mut tree = names(200);
        tree.max_keys_per_node = Some(4);
        let (volume, run) = tree_volume(S_IFDIR | 0o755, &tree);
        let tree = BPlusTree::open(Stream::load(&volume, run).expect("stream")).expect("tree");
        assert!(tree.header().max_number_of_levels >= 3);
        assert_eq!(tree.key_type(), KeyType::String);
        assert!(!tree.allows_duplicates());

        for i in 0..200 {
            let key = format!("entry-{i:04}");
            assert_eq!(tree.find(key.as_bytes()).expect("present"), 1000 + i as i64);
        }
        for missing in ["entry-", "entry-0200", "a", "zzz"] {
            assert!(matches!(
                tree.find(missing.as_bytes()),
                Err(BfsError::NotFound(_))
            ));
        }
    }

    #[test]
    fn seek_down_visits_one_node_per_level() {
        let mut tree = names(120);
        tree.max_keys_per_node = Some(5);
        let (volume, run) = tree_volume(S_IFDIR | 0o755, &tree);
        let tree = BPlusTree::open(Stream::load(&volume, run).expect("stream")).expect("tree");
        let path = tree.seek_down(b"entry-0042").expect("path");
        assert_eq!(path.len() as u32, tree.header().max_number_of_levels);
        assert_eq!(path[0].offset, tree.header().root_node_pointer);

        let mut cached = CachedNode::new(&tree);
        let leaf = path.last().expect("leaf");
        let node = cached.set_to(leaf.offset).expect("leaf node");
        assert!(node.is_leaf());
        assert_eq!(node.key_at(leaf.index).expect("key"), b"entry-0042");
    }

    #[test]
    fn find_key_reports_insertion_point() {
        let mut tree = TreeSpec::new(KeyType::String);
        for (name, id) in [("b", 2), ("d", 4), ("f", 6)] {
            tree.insert(name, id);
        }
        let (volume, run) = tree_volume(S_IFDIR | 0o755, &tree);
        let tree = BPlusTree::open(Stream::load(&volume, run).expect("stream")).expect("tree");
        let mut cached = CachedNode::new(&tree);
        let root = tree.header().root_node_pointer;
        let node = cached.set_to(root).expect("root");

        let hit = tree.find_key(&node, b"d").expect("search");
        assert_eq!((hit.index, hit.next, hit.found), (1, 4, true));
        let between = tree.find_key(&node, b"c").expect("search");
        assert_eq!((between.index, between.next, between.found), (1, 4, false));
        let after = tree.find_key(&node, b"g").expect("search");
        assert_eq!(after.index, 3);
        assert_eq!(after.next, node.overflow_link());
        assert!(!after.found);
    }

    #[test]
    fn key_length_is_validated() {
        let (volume, run) = tree_volume(S_IFDIR | 0o755, &names(3));
        let tree = BPlusTree::open(Stream::load(&volume, run).expect("stream")).expect("tree");
        assert!(matches!(tree.find(b""), Err(BfsError::BadValue(_))));
        assert!(matches!(tree.find(&[b'x'; 257]), Err(BfsError::BadValue(_))));
        assert!(matches!(tree.find(&[b'x'; 256]), Err(BfsError::NotFound(_))));
        assert!(matches!(tree.seek_down(b""), Err(BfsError::BadValue(_))));
    }

    #[test]
    fn duplicate_trees_refuse_single_value_find() {
        let mut tree = TreeSpec::new(KeyType::Uint32);
        tree.insert_duplicates(7_u32.to_le_bytes(), vec![1, 2, 3]);
        let mode = S_INDEX_DIR | S_IFDIR | S_UINT_INDEX;
        let (volume, run) = tree_volume(mode, &tree);
        let tree = BPlusTree::open(Stream::load(&volume, run).expect("stream")).expect("tree");
        assert!(tree.allows_duplicates());
        assert!(matches!(
            tree.find(&7_u32.to_le_bytes()),
            Err(BfsError::BadType(_))
        ));
    }

    #[test]
    fn index_mode_must_match_key_type() {
        let tree = TreeSpec::new(KeyType::String);
        let (volume, run) = tree_volume(S_INDEX_DIR | S_IFDIR | S_UINT_INDEX, &tree);
        let err = BPlusTree::open(Stream::load(&volume, run).expect("stream"))
            .expect_err("string tree under uint index");
        assert!(matches!(err, BfsError::BadType(_)));
    }

    #[test]
    fn non_container_and_garbage_streams_are_rejected() {
        let mut b = ImageBuilder::new(ImageConfig::default()).expect("builder");
        let root = b.reserve_inode().expect("root");
        let file = b.reserve_inode().expect("file");
        b.write_tree_inode(file, root, "file", S_IFREG | 0o644, &names(2))
            .expect("tree in a file");
        let garbage = b.reserve_inode().expect("garbage");
        let plan = b.direct_plan(2048).expect("plan");
        let mut spec = InodeSpec::new(S_IFDIR | 0o755, root, "garbage");
        spec.data = b.write_stream(&plan, &pattern(2048)).expect("stream");
        b.write_inode(garbage, &spec).expect("inode");
        b.write_directory(root, root, "", &[]).expect("root dir");
        b.set_root(root);
        let volume = Volume::from_bytes(b.finish().expect("image")).expect("volume");

        let err = BPlusTree::open(Stream::load(&volume, file).expect("file")).expect_err("file");
        assert!(matches!(err, BfsError::BadType(_)));
        let err =
            BPlusTree::open(Stream::load(&volume, garbage).expect("garbage")).expect_err("magic");
        assert!(matches!(err, BfsError::BadData { .. }));
    }

    #[test]
    fn overflowing_value_array_is_corruption() {
        let (volume, run) = tree_volume(S_IFDIR | 0o755, &names(3));
        let stream = Stream::load(&volume, run).expect("stream");
        let root = BPlusTree::open(stream.clone())
            .expect("tree")
            .header()
            .root_node_pointer;
        let leaf_at = volume.to_offset(stream.data().direct[0]) + root as u64;

        // all_key_count = 500 puts the value array far past the node end
        let volume = patched(&volume, leaf_at + 24, &500_u16.to_le_bytes());
        let tree = BPlusTree::open(Stream::load(&volume, run).expect("stream")).expect("tree");
        assert!(matches!(
            tree.find(b"entry-0001"),
            Err(BfsError::BadData { .. })
        ));
    }

    #[test]
    fn header_size_mismatch_is_corruption() {
        let (volume, run) = tree_volume(S_IFDIR | 0o755, &names(3));
        let stream = Stream::load(&volume, run).expect("stream");
        let header_at = volume.to_offset(stream.data().direct[0]);
        let volume = patched(&volume, header_at + 32, &(64 * 1024_i64).to_le_bytes());
        let err = BPlusTree::open(Stream::load(&volume, run).expect("stream"))
            .expect_err("maximum_size");
        assert!(matches!(err, BfsError::BadData { .. }));
    }

    /// Device offset of byte `pos` of the tree stream; small trees sit in
    /// one direct run.
    fn tree_offset(volume: &Volume, run: bfs_ondisk::BlockRun, pos: u64) -> u64 {
        let stream = Stream::load(volume, run).expect("stream");
        volume.to_offset(stream.data().direct[0]) + pos
    }

    #[test]
    fn empty_duplicate_fragment_is_corruption() {
        let mut spec = TreeSpec::new(KeyType::Uint32);
        spec.insert(1_u32.to_le_bytes(), 10);
        spec.insert_duplicates(2_u32.to_le_bytes(), vec![21, 22, 23]);
        let (volume, run) = tree_volume(UINT_INDEX, &spec);

        // fragment page is the first page after the header; slot 0 count
        let at = tree_offset(&volume, run, 1024);
        let volume = patched(&volume, at, &0_i64.to_le_bytes());
        let tree = BPlusTree::open(Stream::load(&volume, run).expect("stream")).expect("tree");
        let mut it = tree.iterator().expect("iterator");
        let first = it.traverse(Direction::Forward).expect("plain key");
        assert_eq!(first.map(|e| e.value), Some(10));
        assert!(matches!(
            it.traverse(Direction::Forward),
            Err(BfsError::BadData { .. })
        ));
    }

    #[test]
    fn looping_duplicate_node_chain_is_corruption() {
        let mut spec = TreeSpec::new(KeyType::Uint32);
        spec.insert_duplicates(3_u32.to_le_bytes(), (0..130).collect());
        let (volume, run) = tree_volume(UINT_INDEX, &spec);

        // 130 values span duplicate nodes at 1024 and 2048; close the loop
        let at = tree_offset(&volume, run, 2048 + 8);
        let volume = patched(&volume, at, &1024_i64.to_le_bytes());
        let tree = BPlusTree::open(Stream::load(&volume, run).expect("stream")).expect("tree");
        let mut it = tree.iterator().expect("iterator");
        let mut yielded = 0_usize;
        let err = loop {
            match it.traverse(Direction::Forward) {
                Ok(Some(_)) => yielded += 1,
                Ok(None) => panic!("looping chain ended after {yielded} values"),
                Err(err) => break err,
            }
            assert!(yielded < 10_000, "duplicate chain never stopped");
        };
        assert!(matches!(err, BfsError::BadData { .. }));
        assert!(yielded >= 130);
    }

    #[test]
    fn cached_node_rejects_unaligned_and_header_offsets() {
        let (volume, run) = tree_volume(S_IFDIR | 0o755, &names(3));
        let tree = BPlusTree::open(Stream::load(&volume, run).expect("stream")).expect("tree");
        let mut cached = CachedNode::new(&tree);
        assert!(cached.set_to(0).is_err());
        assert!(cached.set_to(1500).is_err());
        assert!(cached.set_to(tree.header().maximum_size).is_err());
        assert_eq!(cached.offset(), None);
        cached.set_to(1024).expect("first real node");
        assert_eq!(cached.offset(), Some(1024));
    }
}
