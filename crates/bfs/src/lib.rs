#![forbid(unsafe_code)]
//! Read-only BFS public API facade.
//!
//! Re-exports the node layer from `bfs-core` together with the volume,
//! error and on-disk types callers need to use it. The CLI and the
//! end-to-end tests depend on this crate only.

pub use bfs_core::*;

pub use bfs_btree::{BPlusTree, Boundary, Direction, TreeEntry, TreeIterator};
pub use bfs_error::{BfsError, Result};
pub use bfs_inode::Stream;
pub use bfs_ondisk::{BlockRun, Superblock};
pub use bfs_types::{ByteOrder, InodeId};
pub use bfs_volume::{OpenOptions, Volume};
