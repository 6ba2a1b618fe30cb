#![forbid(unsafe_code)]
//! On-disk format parsing for BFS structures.
//!
//! Pure parsing crate, no I/O. Turns byte slices into typed superblock,
//! inode, data stream, and B+tree structures. Every multi-byte field is
//! decoded with the volume's byte order, never by reinterpreting memory.

pub mod block_run;
pub mod btree;
pub mod inode;
pub mod keys;
pub mod superblock;

pub use block_run::{BlockRun, parse_block_runs};
pub use btree::{
    BPlusTreeHeader, NODE_HEADER_SIZE, NodeView, encode_node, fragment_index, fragment_offset,
    is_duplicate_link, link_type, make_link,
};
pub use inode::{DataStream, INODE_HEADER_SIZE, Inode, SMALL_DATA_OFFSET, SmallData, SmallDataIter};
pub use keys::{KeyType, compare_keys};
pub use superblock::Superblock;
