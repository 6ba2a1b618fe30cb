//! Ordered traversal over the leaves of a [`BPlusTree`].
//!
//! Leaves form a doubly linked list. The iterator sits on one key of one
//! leaf; when that key's value points at duplicate storage it also walks
//! the duplicate chain before moving on.

use crate::{BPlusTree, CachedNode, check_key_length};
use bfs_error::Result;
use bfs_ondisk::{fragment_offset, is_duplicate_link, link_type};
use bfs_types::{BPLUSTREE_DUPLICATE_FRAGMENT, BPLUSTREE_NULL};
use serde::{Deserialize, Serialize};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Boundary {
    Begin,
    End,
}

/// How an entry relates to the duplicate chain of its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicateMarker {
    /// The key has a single value.
    None,
    /// First value of a duplicate chain.
    First,
    /// Further value of the chain started by the previous `First`.
    Continuation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub key: Vec<u8>,
    pub value: i64,
    pub duplicate: DuplicateMarker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LeafPosition {
    node: i64,
    /// May be one before the first or one past the last key.
    key: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DuplicateChain {
    key: Vec<u8>,
    /// Tagged link from the leaf; selects the fragment slot.
    link: i64,
    /// Page the next value is read from.
    node: i64,
    is_fragment: bool,
    next: usize,
    count: usize,
    /// Duplicate pages followed so far; bounded by the tree's page count.
    hops: u64,
}

/// Cursor over a tree's entries.
///
/// Starts unpositioned; [`TreeIterator::goto`], [`TreeIterator::rewind`] or
/// [`TreeIterator::find`] place it. Duplicates are always yielded in stored
/// order, whatever the direction.
#[derive(Debug, Clone)]
pub struct TreeIterator<'t, 'v> {
    tree: &'t BPlusTree<'v>,
    position: Option<LeafPosition>,
    chain: Option<DuplicateChain>,
}

impl<'t, 'v> TreeIterator<'t, 'v> {
    #[must_use]
    pub fn new(tree: &'t BPlusTree<'v>) -> Self {
        Self {
            tree,
            position: None,
            chain: None,
        }
    }

    #[must_use]
    pub fn tree(&self) -> &'t BPlusTree<'v> {
        self.tree
    }

    /// Move before the first key, or past the last one.
    pub fn goto(&mut self, to: Boundary) -> Result<()> {
        let tree = self.tree;
        let mut cached = CachedNode::new(tree);
        let mut offset = tree.header().root_node_pointer;
        for _ in 0..tree.max_depth() {
            let node = cached.set_to(offset)?;
            if node.is_leaf() {
                let key = match to {
                    Boundary::Begin => -1,
                    Boundary::End => i32::from(node.num_keys()),
                };
                self.position = Some(LeafPosition { node: offset, key });
                self.chain = None;
                return Ok(());
            }
            let next = if to == Boundary::End || node.num_keys() == 0 {
                node.overflow_link()
            } else {
                tree.value(&node, 0)?
            };
            if next == offset {
                return Err(tree.violation(Some(offset), "node links to itself"));
            }
            offset = next;
        }
        Err(tree.violation(Some(offset), "descent deeper than max_number_of_levels"))
    }

    pub fn rewind(&mut self) -> Result<()> {
        self.goto(Boundary::Begin)
    }

    /// Drop the rest of the current duplicate chain.
    pub fn skip_duplicates(&mut self) {
        self.chain = None;
    }

    /// Park just before `key`, or before the first greater key.
    ///
    /// Returns whether `key` is present. A following forward traverse
    /// yields that key (or its successor) first.
    pub fn find(&mut self, key: &[u8]) -> Result<bool> {
        check_key_length(key)?;
        let (leaf, search) = self.tree.descend(key, |_, _| {})?;
        self.position = Some(LeafPosition {
            node: leaf,
            key: i32::from(search.index) - 1,
        });
        self.chain = None;
        Ok(search.found)
    }

    /// Next entry in `direction`, `None` once the tree is exhausted.
    ///
    /// At either end the position stays on the last key returned, so
    /// traversing the other way resumes from there.
    pub fn traverse(&mut self, direction: Direction) -> Result<Option<TreeEntry>> {
        let tree = self.tree;
        let Some(saved) = self.position else {
            return Ok(None);
        };
        let mut cached = CachedNode::new(tree);
        if let Some(entry) = self.next_duplicate(&mut cached)? {
            return Ok(Some(entry));
        }

        let forward = direction == Direction::Forward;
        let mut offset = saved.node;
        let mut index = saved.key + if forward { 1 } else { -1 };
        let mut node = cached.set_to(offset)?;
        let mut hops = 0_u64;
        while (forward && index >= i32::from(node.num_keys())) || (!forward && index < 0) {
            let sibling = if forward {
                node.right_link()
            } else {
                node.left_link()
            };
            if sibling == BPLUSTREE_NULL {
                self.position = Some(saved);
                return Ok(None);
            }
            hops += 1;
            if hops > tree.page_count() {
                return Err(tree.violation(Some(sibling), "leaf chain does not end"));
            }
            offset = sibling;
            node = cached.set_to(offset)?;
            index = if forward {
                0
            } else {
                i32::from(node.num_keys()) - 1
            };
        }

        // index is inside 0..num_keys here
        let slot = index as u16;
        let key = node
            .key_at(slot)
            .map_err(|e| tree.corrupt(Some(offset), "key", &e))?
            .to_vec();
        let value = tree.value(&node, slot)?;
        self.position = Some(LeafPosition {
            node: offset,
            key: index,
        });
        trace!(node = offset, index, value, "tree_iterator_step");

        if !is_duplicate_link(value) {
            return Ok(Some(TreeEntry {
                key,
                value,
                duplicate: DuplicateMarker::None,
            }));
        }

        let is_fragment = link_type(value) == BPLUSTREE_DUPLICATE_FRAGMENT;
        let page = fragment_offset(value);
        let dup = cached.set_to_duplicate(page)?;
        let count = dup
            .duplicate_count(value, is_fragment)
            .map_err(|e| tree.corrupt(Some(page), "duplicate count", &e))?;
        if count == 0 {
            self.chain = None;
            return Err(tree.violation(Some(page), "empty duplicate array"));
        }
        let first = dup
            .duplicate_at(value, is_fragment, 0)
            .map_err(|e| tree.corrupt(Some(page), "duplicate value", &e))?;
        self.chain = Some(DuplicateChain {
            key: key.clone(),
            link: value,
            node: page,
            is_fragment,
            next: 1,
            count,
            hops: 0,
        });
        Ok(Some(TreeEntry {
            key,
            value: first,
            duplicate: DuplicateMarker::First,
        }))
    }

    /// Next `(key, value)` going forward, duplicates included.
    pub fn get_next_entry(&mut self) -> Result<Option<(Vec<u8>, i64)>> {
        Ok(self
            .traverse(Direction::Forward)?
            .map(|entry| (entry.key, entry.value)))
    }

    fn next_duplicate(&mut self, cached: &mut CachedNode<'t, 'v>) -> Result<Option<TreeEntry>> {
        let tree = self.tree;
        let Some(chain) = self.chain.as_mut() else {
            return Ok(None);
        };
        if chain.next >= chain.count && !chain.is_fragment {
            // continue in the next page of a duplicate node chain
            let right = cached.set_to_duplicate(chain.node)?.right_link();
            if right != BPLUSTREE_NULL {
                chain.hops += 1;
                if chain.hops > tree.page_count() {
                    let at = chain.node;
                    self.chain = None;
                    return Err(tree.violation(Some(at), "duplicate chain does not end"));
                }
                let page = cached.set_to_duplicate(right)?;
                let count = page
                    .duplicate_count(right, false)
                    .map_err(|e| tree.corrupt(Some(right), "duplicate count", &e))?;
                if count == 0 {
                    self.chain = None;
                    return Err(tree.violation(Some(right), "empty duplicate array"));
                }
                chain.count = count;
                chain.node = right;
                chain.next = 0;
            }
        }
        if chain.next >= chain.count {
            self.chain = None;
            return Ok(None);
        }
        let page = cached.set_to_duplicate(chain.node)?;
        let value = page
            .duplicate_at(chain.link, chain.is_fragment, chain.next)
            .map_err(|e| tree.corrupt(Some(chain.node), "duplicate value", &e))?;
        chain.next += 1;
        Ok(Some(TreeEntry {
            key: chain.key.clone(),
            value,
            duplicate: DuplicateMarker::Continuation,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::tree_volume;
    use bfs_error::BfsError;
    use bfs_harness::TreeSpec;
    use bfs_inode::Stream;
    use bfs_ondisk::KeyType;
    use bfs_types::{ByteOrder, S_IFDIR, S_INDEX_DIR, S_UINT_INDEX};
    use proptest::prelude::*;
    use std::cmp::Ordering;

    const UINT_INDEX: u32 = S_INDEX_DIR | S_IFDIR | S_UINT_INDEX;

    fn key(n: u32) -> Vec<u8> {
        ByteOrder::Little.u32_bytes(n).to_vec()
    }

    fn collect(it: &mut TreeIterator<'_, '_>, direction: Direction) -> Vec<TreeEntry> {
        let mut out = Vec::new();
        while let Some(entry) = it.traverse(direction).expect("traverse") {
            out.push(entry);
        }
        out
    }

    #[test]
    fn unpositioned_iterator_yields_nothing() {
        let mut tree = TreeSpec::new(KeyType::Uint32);
        tree.insert(key(1), 10);
        let (volume, run) = tree_volume(UINT_INDEX, &tree);
        let tree = BPlusTree::open(Stream::load(&volume, run).expect("stream")).expect("tree");
        let mut it = TreeIterator::new(&tree);
        assert_eq!(it.traverse(Direction::Forward).expect("traverse"), None);
        it.rewind().expect("rewind");
        assert_eq!(it.get_next_entry().expect("entry"), Some((key(1), 10)));
    }

    #[test]
    fn duplicates_are_expanded_in_order() {
        let mut spec = TreeSpec::new(KeyType::Uint32);
        spec.insert(key(1), 100);
        spec.insert_duplicates(key(2), vec![21, 22, 23]);
        let big: Vec<i64> = (0..130).map(|v| 3000 + v).collect();
        spec.insert_duplicates(key(3), big.clone());
        spec.insert(key(4), 400);
        spec.max_keys_per_node = Some(2);
        let (volume, run) = tree_volume(UINT_INDEX, &spec);
        let tree = BPlusTree::open(Stream::load(&volume, run).expect("stream")).expect("tree");
        let mut it = tree.iterator().expect("iterator");
        let entries = collect(&mut it, Direction::Forward);

        assert_eq!(entries.len(), 1 + 3 + 130 + 1);
        assert_eq!(entries[0].duplicate, DuplicateMarker::None);
        let fragment: Vec<_> = entries[1..4].iter().map(|e| (e.value, e.duplicate)).collect();
        assert_eq!(
            fragment,
            vec![
                (21, DuplicateMarker::First),
                (22, DuplicateMarker::Continuation),
                (23, DuplicateMarker::Continuation),
            ]
        );
        let chain = &entries[4..134];
        assert_eq!(chain[0].duplicate, DuplicateMarker::First);
        assert!(chain[1..]
            .iter()
            .all(|e| e.duplicate == DuplicateMarker::Continuation && e.key == key(3)));
        assert_eq!(chain.iter().map(|e| e.value).collect::<Vec<_>>(), big);
        assert_eq!(entries[134].value, 400);
    }

    #[test]
    fn skip_duplicates_moves_to_next_key() {
        let mut spec = TreeSpec::new(KeyType::Uint32);
        spec.insert_duplicates(key(5), vec![1, 2, 3, 4]);
        spec.insert(key(6), 60);
        let (volume, run) = tree_volume(UINT_INDEX, &spec);
        let tree = BPlusTree::open(Stream::load(&volume, run).expect("stream")).expect("tree");
        let mut it = tree.iterator().expect("iterator");
        let first = it.traverse(Direction::Forward).expect("first").expect("entry");
        assert_eq!((first.value, first.duplicate), (1, DuplicateMarker::First));
        it.skip_duplicates();
        let next = it.traverse(Direction::Forward).expect("next").expect("entry");
        assert_eq!((next.key, next.value), (key(6), 60));
    }

    #[test]
    fn find_parks_before_key_or_successor() {
        let mut spec = TreeSpec::new(KeyType::Uint32);
        for n in (0..60).map(|n| n * 2) {
            spec.insert(key(n), i64::from(n));
        }
        spec.max_keys_per_node = Some(4);
        let (volume, run) = tree_volume(UINT_INDEX, &spec);
        let tree = BPlusTree::open(Stream::load(&volume, run).expect("stream")).expect("tree");
        let mut it = TreeIterator::new(&tree);

        assert!(it.find(&key(40)).expect("find"));
        assert_eq!(it.get_next_entry().expect("next"), Some((key(40), 40)));
        assert!(!it.find(&key(41)).expect("find"));
        assert_eq!(it.get_next_entry().expect("next"), Some((key(42), 42)));
        assert!(!it.find(&key(1000)).expect("past the end"));
        assert_eq!(it.get_next_entry().expect("next"), None);
        assert!(matches!(it.find(b""), Err(BfsError::BadValue(_))));
    }

    #[test]
    fn end_of_tree_keeps_position_for_reverse() {
        let mut spec = TreeSpec::new(KeyType::Uint32);
        for n in 0..9 {
            spec.insert(key(n), i64::from(n));
        }
        spec.max_keys_per_node = Some(2);
        let (volume, run) = tree_volume(UINT_INDEX, &spec);
        let tree = BPlusTree::open(Stream::load(&volume, run).expect("stream")).expect("tree");
        let mut it = tree.iterator().expect("iterator");
        let all = collect(&mut it, Direction::Forward);
        assert_eq!(all.len(), 9);
        assert_eq!(it.traverse(Direction::Forward).expect("again"), None);
        let back = it.traverse(Direction::Backward).expect("back").expect("entry");
        assert_eq!(back.value, 7);

        it.goto(Boundary::End).expect("end");
        let reversed: Vec<i64> = collect(&mut it, Direction::Backward)
            .into_iter()
            .map(|e| e.value)
            .collect();
        assert_eq!(reversed, (0..9).rev().collect::<Vec<i64>>());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn forward_scan_is_sorted(keys in proptest::collection::btree_set(any::<u32>(), 1..150),
                                  fanout in 2_usize..9) {
            let mut spec = TreeSpec::new(KeyType::Uint32);
            for k in &keys {
                spec.insert(key(*k), i64::from(*k));
            }
            spec.max_keys_per_node = Some(fanout);
            let (volume, run) = tree_volume(UINT_INDEX, &spec);
            let tree = BPlusTree::open(Stream::load(&volume, run).expect("stream")).expect("tree");
            let mut it = tree.iterator().expect("iterator");
            let entries = collect(&mut it, Direction::Forward);
            prop_assert_eq!(entries.len(), keys.len());
            for pair in entries.windows(2) {
                prop_assert_eq!(tree.compare(&pair[0].key, &pair[1].key), Ordering::Less);
            }
            let values: Vec<i64> = entries.iter().map(|e| e.value).collect();
            let expected: Vec<i64> = keys.iter().map(|k| i64::from(*k)).collect();
            prop_assert_eq!(values, expected);
        }
    }
}
