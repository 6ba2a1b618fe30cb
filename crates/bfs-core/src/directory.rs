//! Directories and their entry cookies.

use crate::{Node, inode_id};
use bfs_btree::{BPlusTree, TreeIterator};
use bfs_error::{BfsError, Result};
use bfs_inode::Stream;
use bfs_types::{InodeId, S_ATTR_DIR, S_INDEX_DIR};
use bfs_volume::Volume;
use tracing::trace;

/// A container inode: plain, attribute, or index directory.
#[derive(Debug)]
pub struct Directory<'v> {
    tree: BPlusTree<'v>,
}

impl<'v> Directory<'v> {
    /// Open the entry tree of a container stream.
    pub fn from_stream(stream: Stream<'v>) -> Result<Self> {
        if !stream.is_container() {
            return Err(BfsError::NotDirectory);
        }
        Ok(Self {
            tree: BPlusTree::open(stream)?,
        })
    }

    #[must_use]
    pub fn stream(&self) -> &Stream<'v> {
        self.tree.stream()
    }

    #[must_use]
    pub fn tree(&self) -> &BPlusTree<'v> {
        &self.tree
    }

    #[must_use]
    pub fn volume(&self) -> &'v Volume {
        self.stream().volume()
    }

    #[must_use]
    pub fn inode(&self) -> InodeId {
        self.stream().id()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.inode() == self.volume().to_inode_id(self.volume().root())
    }

    /// The root directory is named after the volume.
    pub fn name(&self) -> Result<String> {
        if self.is_root() {
            return Ok(self.volume().name().to_owned());
        }
        self.stream().name()
    }

    /// Inode id stored under `name`, without loading it.
    pub fn lookup_id(&self, name: &str) -> Result<InodeId> {
        let value = self.tree.find(name.as_bytes())?;
        trace!(dir = self.inode().0, name, value, "directory_lookup");
        inode_id(self.stream(), value)
    }

    /// Entry `name` as a node; symlinks are returned as links.
    pub fn lookup_dont_traverse(&self, name: &str) -> Result<Node<'v>> {
        let id = self.lookup_id(name)?;
        Node::load(self.volume(), id)
    }

    pub fn read_at(&self, _pos: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(BfsError::IsDirectory)
    }

    pub fn write_at(&self, _pos: u64, _buf: &[u8]) -> Result<usize> {
        Err(BfsError::NotAllowed)
    }

    /// Whether the directory holds no entries besides `.` and `..`.
    ///
    /// Attribute and index directories have no dot entries, so any entry
    /// at all makes them non-empty.
    pub fn is_empty(&self) -> Result<bool> {
        let dotless = self.stream().mode() & (S_ATTR_DIR | S_INDEX_DIR) != 0;
        let mut it = self.tree.iterator()?;
        let mut count = 0;
        while let Some((name, _)) = it.get_next_entry()? {
            if dotless {
                return Ok(false);
            }
            count += 1;
            if count > 2 || (name != b"." && name != b"..") {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Start reading entries.
    pub fn open(&self) -> Result<DirCookie<'_, 'v>> {
        Ok(DirCookie {
            iterator: self.tree.iterator()?,
        })
    }

    /// All `(name, inode)` entries in tree order, dot entries included.
    pub fn entries(&self) -> Result<Vec<(String, InodeId)>> {
        let mut cookie = self.open()?;
        let mut out = Vec::new();
        while let Some(entry) = cookie.get_next_entry()? {
            out.push(entry);
        }
        Ok(out)
    }
}

/// Read position inside an open directory. Closing is dropping.
#[derive(Debug, Clone)]
pub struct DirCookie<'d, 'v> {
    iterator: TreeIterator<'d, 'v>,
}

impl<'v> DirCookie<'_, 'v> {
    /// Next `(name, inode)` pair, `None` at the end.
    pub fn get_next_entry(&mut self) -> Result<Option<(String, InodeId)>> {
        let Some((key, value)) = self.iterator.get_next_entry()? else {
            return Ok(None);
        };
        let id = inode_id(self.iterator.tree().stream(), value)?;
        Ok(Some((String::from_utf8_lossy(&key).into_owned(), id)))
    }

    /// Next entry, loaded as a node.
    pub fn get_next_node(&mut self) -> Result<Option<Node<'v>>> {
        let volume = self.iterator.tree().stream().volume();
        match self.get_next_entry()? {
            Some((_, id)) => Node::load(volume, id).map(Some),
            None => Ok(None),
        }
    }

    pub fn rewind(&mut self) -> Result<()> {
        self.iterator.rewind()
    }
}
