#![forbid(unsafe_code)]
//! BFS nodes and path resolution.
//!
//! An inode's mode bits decide what it is: containers become
//! [`Directory`], symlinks become [`Link`], everything else is a [`File`].
//! [`Node`] is the sum of the three, built by a single factory.

mod directory;

pub use directory::{DirCookie, Directory};

use bfs_error::{BfsError, Result};
use bfs_inode::Stream;
use bfs_ondisk::BlockRun;
use bfs_types::{
    InodeId, S_IFBLK, S_IFCHR, S_IFIFO, S_IFLNK, S_IFMT, S_IFSOCK, bfs_time_to_secs,
};
use bfs_volume::Volume;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};

// ── Attributes ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileType {
    /// Classify an inode; every container counts as a directory.
    #[must_use]
    pub fn of(stream: &Stream<'_>) -> Self {
        if stream.is_container() {
            return Self::Directory;
        }
        match stream.mode() & S_IFMT {
            S_IFLNK => Self::Symlink,
            S_IFBLK => Self::BlockDevice,
            S_IFCHR => Self::CharDevice,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Socket,
            _ => Self::RegularFile,
        }
    }
}

/// Stat-like view of one inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttr {
    pub inode: InodeId,
    pub kind: FileType,
    /// Full mode word, BFS index and attribute bits included.
    pub mode: u32,
    /// Lower 12 bits of `mode`.
    pub perm: u16,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub flags: u32,
    pub created: SystemTime,
    pub modified: SystemTime,
}

impl NodeAttr {
    #[must_use]
    pub fn from_stream(stream: &Stream<'_>) -> Self {
        let inode = stream.inode();
        Self {
            inode: stream.id(),
            kind: FileType::of(stream),
            mode: inode.mode,
            perm: (inode.mode & 0o7777) as u16,
            size: stream.size(),
            uid: inode.uid as u32,
            gid: inode.gid as u32,
            flags: inode.flags,
            created: bfs_time(inode.create_time),
            modified: bfs_time(inode.last_modified_time),
        }
    }
}

fn bfs_time(raw: i64) -> SystemTime {
    let secs = bfs_time_to_secs(raw);
    let offset = Duration::from_secs(secs.unsigned_abs());
    let time = if secs >= 0 {
        SystemTime::UNIX_EPOCH.checked_add(offset)
    } else {
        SystemTime::UNIX_EPOCH.checked_sub(offset)
    };
    time.unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Tree values are inode block numbers; negative ones are corruption.
pub(crate) fn inode_id(stream: &Stream<'_>, value: i64) -> Result<InodeId> {
    u64::try_from(value).map(InodeId).map_err(|_| {
        BfsError::bad_data(
            stream.volume().block_to_offset(stream.id().block()),
            format!("inode {}: entry value {value} is not an inode", stream.id()),
        )
    })
}

// ── File / Link ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct File<'v> {
    stream: Stream<'v>,
}

impl<'v> File<'v> {
    #[must_use]
    pub fn new(stream: Stream<'v>) -> Self {
        Self { stream }
    }

    #[must_use]
    pub fn stream(&self) -> &Stream<'v> {
        &self.stream
    }

    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.stream.read_at(pos, buf)
    }

    pub fn write_at(&self, _pos: u64, _buf: &[u8]) -> Result<usize> {
        Err(BfsError::NotAllowed)
    }
}

/// A symlink. Its stream, if any, holds only the target.
#[derive(Debug, Clone)]
pub struct Link<'v> {
    stream: Stream<'v>,
}

impl<'v> Link<'v> {
    #[must_use]
    pub fn new(stream: Stream<'v>) -> Self {
        Self { stream }
    }

    #[must_use]
    pub fn stream(&self) -> &Stream<'v> {
        &self.stream
    }

    pub fn read_link(&self) -> Result<String> {
        self.stream.read_link()
    }

    pub fn read_at(&self, _pos: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(BfsError::NotAllowed)
    }

    pub fn write_at(&self, _pos: u64, _buf: &[u8]) -> Result<usize> {
        Err(BfsError::NotAllowed)
    }
}

// ── Node ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum Node<'v> {
    Directory(Directory<'v>),
    File(File<'v>),
    Link(Link<'v>),
}

impl<'v> Node<'v> {
    /// Load inode `id` and wrap it according to its mode.
    pub fn load(volume: &'v Volume, id: InodeId) -> Result<Self> {
        Self::from_stream(Stream::load_id(volume, id)?)
    }

    pub fn from_run(volume: &'v Volume, run: BlockRun) -> Result<Self> {
        Self::from_stream(Stream::load(volume, run)?)
    }

    pub fn from_stream(stream: Stream<'v>) -> Result<Self> {
        if stream.is_container() {
            Ok(Self::Directory(Directory::from_stream(stream)?))
        } else if stream.is_symlink() {
            Ok(Self::Link(Link::new(stream)))
        } else {
            Ok(Self::File(File::new(stream)))
        }
    }

    #[must_use]
    pub fn stream(&self) -> &Stream<'v> {
        match self {
            Self::Directory(dir) => dir.stream(),
            Self::File(file) => file.stream(),
            Self::Link(link) => link.stream(),
        }
    }

    #[must_use]
    pub fn inode(&self) -> InodeId {
        self.stream().id()
    }

    #[must_use]
    pub fn file_type(&self) -> FileType {
        FileType::of(self.stream())
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.stream().size()
    }

    pub fn name(&self) -> Result<String> {
        match self {
            Self::Directory(dir) => dir.name(),
            other => other.stream().name(),
        }
    }

    #[must_use]
    pub fn attr(&self) -> NodeAttr {
        NodeAttr::from_stream(self.stream())
    }

    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::Directory(dir) => dir.read_at(pos, buf),
            Self::File(file) => file.read_at(pos, buf),
            Self::Link(link) => link.read_at(pos, buf),
        }
    }

    pub fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        match self {
            Self::Directory(dir) => dir.write_at(pos, buf),
            Self::File(file) => file.write_at(pos, buf),
            Self::Link(link) => link.write_at(pos, buf),
        }
    }

    pub fn read_link(&self) -> Result<String> {
        match self {
            Self::Link(link) => link.read_link(),
            _ => Err(BfsError::NotSymlink),
        }
    }

    pub fn into_directory(self) -> Result<Directory<'v>> {
        match self {
            Self::Directory(dir) => Ok(dir),
            _ => Err(BfsError::NotDirectory),
        }
    }
}

// ── Volume entry points ─────────────────────────────────────────────────────

/// Node-level access to a mounted [`Volume`].
pub trait VolumeExt {
    fn root_directory(&self) -> Result<Directory<'_>>;

    /// The volume's index directory; `NotFound` when it has none.
    fn index_directory(&self) -> Result<Directory<'_>>;

    /// Walk `path` from the root without following symlinks.
    fn resolve_path(&self, path: &str) -> Result<Node<'_>>;

    /// Walk `path` from the root, following symlinks anywhere in it.
    ///
    /// Relative targets resolve against the directory holding the link,
    /// absolute ones against the root. More than
    /// `OpenOptions::max_symlink_depth` links fail with `TooManyLinks`.
    fn resolve_path_follow(&self, path: &str) -> Result<Node<'_>>;
}

impl VolumeExt for Volume {
    fn root_directory(&self) -> Result<Directory<'_>> {
        Node::from_run(self, self.root())?.into_directory()
    }

    fn index_directory(&self) -> Result<Directory<'_>> {
        let indices = self.indices();
        if indices.is_zero() {
            return Err(BfsError::NotFound("index directory".to_owned()));
        }
        Node::from_run(self, indices)?.into_directory()
    }

    fn resolve_path(&self, path: &str) -> Result<Node<'_>> {
        let mut node = Node::Directory(self.root_directory()?);
        for name in components(path) {
            node = node.into_directory()?.lookup_dont_traverse(name)?;
        }
        trace!(path, inode = node.inode().0, "resolve_path");
        Ok(node)
    }

    fn resolve_path_follow(&self, path: &str) -> Result<Node<'_>> {
        let max_links = self.options().max_symlink_depth;
        let mut pending: Vec<String> = components(path).rev().map(str::to_owned).collect();
        let mut node = Node::Directory(self.root_directory()?);
        let mut links = 0_u32;

        while let Some(name) = pending.pop() {
            let dir = node.into_directory()?;
            let found = dir.lookup_dont_traverse(&name)?;
            node = match found {
                Node::Link(link) => {
                    links += 1;
                    if links > max_links {
                        debug!(path, links, "symlink_depth_exceeded");
                        return Err(BfsError::TooManyLinks);
                    }
                    let target = link.read_link()?;
                    trace!(link = link.stream().id().0, target = %target, "follow_symlink");
                    pending.extend(components(&target).rev().map(str::to_owned));
                    if target.starts_with('/') {
                        Node::Directory(self.root_directory()?)
                    } else {
                        Node::Directory(dir)
                    }
                }
                other => other,
            };
        }
        trace!(path, inode = node.inode().0, links, "resolve_path_follow");
        Ok(node)
    }
}

fn components(path: &str) -> impl DoubleEndedIterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfs_harness::{
        FIXTURE_BOOT_ID, FIXTURE_README, FIXTURE_README_ID, FIXTURE_TIME, ImageBuilder,
        ImageConfig, TreeSpec, boot_fixture, loader_payload,
    };
    use bfs_ondisk::KeyType;
    use bfs_types::{ByteOrder, S_ATTR_DIR, S_IFDIR, S_INDEX_DIR, S_STR_INDEX};

    fn fixture() -> Volume {
        Volume::from_bytes(boot_fixture(ByteOrder::Little).expect("fixture")).expect("volume")
    }

    #[test]
    fn factory_picks_kind_from_mode() {
        let volume = fixture();
        let root = volume.root_directory().expect("root");
        assert_eq!(root.name().expect("name"), "BootFixture");
        assert!(root.is_root());

        let boot = root.lookup_dont_traverse("boot").expect("boot");
        assert!(matches!(boot, Node::Directory(_)));
        assert_eq!(boot.inode(), InodeId(FIXTURE_BOOT_ID));
        assert_eq!(boot.name().expect("name"), "boot");

        let readme = root.lookup_dont_traverse("README").expect("readme");
        assert_eq!(readme.file_type(), FileType::RegularFile);
        assert_eq!(readme.inode(), InodeId(FIXTURE_README_ID));

        let loader = root.lookup_dont_traverse("loader").expect("loader");
        assert_eq!(loader.file_type(), FileType::Symlink);
        assert_eq!(loader.read_link().expect("target"), "boot/haiku_loader");

        assert!(matches!(
            root.lookup_dont_traverse("missing"),
            Err(BfsError::NotFound(_))
        ));
    }

    #[test]
    fn reads_and_refused_writes() {
        let volume = fixture();
        let readme = volume.resolve_path("/README").expect("readme");
        let mut buf = vec![0_u8; 256];
        let n = readme.read_at(0, &mut buf).expect("read");
        assert_eq!(&buf[..n], FIXTURE_README);
        assert!(matches!(readme.write_at(0, b"x"), Err(BfsError::NotAllowed)));

        let boot = volume.resolve_path("boot").expect("boot");
        assert!(matches!(boot.read_at(0, &mut buf), Err(BfsError::IsDirectory)));
        assert!(matches!(boot.write_at(0, b"x"), Err(BfsError::NotAllowed)));

        let link = volume.resolve_path("/loader").expect("link");
        assert!(matches!(link.read_at(0, &mut buf), Err(BfsError::NotAllowed)));
        assert!(matches!(readme.read_link(), Err(BfsError::NotSymlink)));
    }

    #[test]
    fn cookie_lists_entries_in_tree_order() {
        let volume = fixture();
        let root = volume.root_directory().expect("root");
        let names: Vec<String> = root
            .entries()
            .expect("entries")
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, [".", "..", "README", "boot", "loader"]);

        let mut cookie = root.open().expect("open");
        let dot = cookie.get_next_node().expect("node").expect("dot");
        assert_eq!(dot.inode(), root.inode());
        cookie.get_next_entry().expect("dotdot");
        let readme = cookie.get_next_node().expect("node").expect("readme");
        assert_eq!(readme.size(), FIXTURE_README.len() as u64);
        cookie.rewind().expect("rewind");
        assert_eq!(
            cookie.get_next_entry().expect("entry").map(|(name, _)| name),
            Some(".".to_owned())
        );
        assert!(!root.is_empty().expect("is_empty"));
    }

    #[test]
    fn emptiness_depends_on_directory_kind() {
        let mut b = ImageBuilder::new(ImageConfig::default()).expect("builder");
        let root = b.reserve_inode().expect("root");
        let empty = b.add_directory(root, "empty", &[]).expect("empty");
        let attrs_empty = b.reserve_inode().expect("attr dir");
        b.write_tree_inode(
            attrs_empty,
            root,
            "",
            S_ATTR_DIR | S_IFDIR | 0o755,
            &TreeSpec::new(KeyType::String),
        )
        .expect("empty attr dir");
        let attrs = b.reserve_inode().expect("attr dir");
        let mut tree = TreeSpec::new(KeyType::String);
        tree.insert("BEOS:TYPE", 77);
        b.write_tree_inode(attrs, root, "", S_ATTR_DIR | S_IFDIR | 0o755, &tree)
            .expect("attr dir");
        b.write_directory(root, root, "", &[("empty", empty)])
            .expect("root dir");
        b.set_root(root);
        let volume = Volume::from_bytes(b.finish().expect("image")).expect("volume");

        let dir = |run| {
            Node::from_run(&volume, run)
                .expect("node")
                .into_directory()
                .expect("directory")
        };
        assert!(dir(empty).is_empty().expect("plain"));
        assert!(dir(attrs_empty).is_empty().expect("empty attrs"));
        assert!(!dir(attrs).is_empty().expect("attrs"));
    }

    #[test]
    fn follows_symlinks_along_the_path() {
        let volume = fixture();
        let via_link = volume.resolve_path_follow("/loader").expect("follow");
        let direct = volume.resolve_path("/boot/haiku_loader").expect("direct");
        assert_eq!(via_link.inode(), direct.inode());

        let mut payload = vec![0_u8; 6000];
        let n = via_link.read_at(0, &mut payload).expect("read");
        assert_eq!(&payload[..n], loader_payload().as_slice());

        assert!(matches!(
            volume.resolve_path("/README/child"),
            Err(BfsError::NotDirectory)
        ));
        assert!(matches!(
            volume.resolve_path_follow("/boot/nope"),
            Err(BfsError::NotFound(_))
        ));
        let root = volume.resolve_path_follow("/").expect("root");
        assert_eq!(root.name().expect("name"), "BootFixture");
    }

    #[test]
    fn symlink_cycles_stop() {
        let mut b = ImageBuilder::new(ImageConfig::default()).expect("builder");
        let root = b.reserve_inode().expect("root");
        let a = b.add_symlink(root, "a", "b").expect("a");
        let bl = b.add_symlink(root, "b", "/a").expect("b");
        b.write_directory(root, root, "", &[("a", a), ("b", bl)])
            .expect("root dir");
        b.set_root(root);
        let volume = Volume::from_bytes(b.finish().expect("image")).expect("volume");
        assert!(matches!(
            volume.resolve_path_follow("a"),
            Err(BfsError::TooManyLinks)
        ));
        assert!(matches!(volume.resolve_path("a"), Ok(Node::Link(_))));
    }

    #[test]
    fn index_directory_when_present() {
        assert!(matches!(
            fixture().index_directory(),
            Err(BfsError::NotFound(_))
        ));

        let mut b = ImageBuilder::new(ImageConfig::default()).expect("builder");
        let root = b.reserve_inode().expect("root");
        let indices = b.reserve_inode().expect("indices");
        let name_index = b.reserve_inode().expect("name index");
        let mut names = TreeSpec::new(KeyType::String);
        names.insert_duplicates("kernel", vec![100, 101]);
        b.write_tree_inode(
            name_index,
            indices,
            "name",
            S_INDEX_DIR | S_IFDIR | S_STR_INDEX,
            &names,
        )
        .expect("name index");
        let mut root_tree = TreeSpec::new(KeyType::String);
        root_tree.insert("name", b.inode_id(name_index));
        b.write_tree_inode(
            indices,
            indices,
            "",
            S_INDEX_DIR | S_IFDIR | S_STR_INDEX | 0o700,
            &root_tree,
        )
        .expect("index root");
        b.write_directory(root, root, "", &[]).expect("root dir");
        b.set_root(root);
        b.set_indices(indices);
        let volume = Volume::from_bytes(b.finish().expect("image")).expect("volume");

        let index_root = volume.index_directory().expect("indices");
        let name = index_root.lookup_dont_traverse("name").expect("name index");
        let Node::Directory(name) = name else {
            panic!("index is not a directory");
        };
        assert!(name.tree().allows_duplicates());
        assert!(matches!(name.lookup_id("kernel"), Err(BfsError::BadType(_))));
        let entries = name.entries().expect("entries");
        assert_eq!(
            entries,
            [
                ("kernel".to_owned(), InodeId(100)),
                ("kernel".to_owned(), InodeId(101)),
            ]
        );
    }

    #[test]
    fn attributes_decode_time_and_kind() {
        let volume = fixture();
        let attr = volume.resolve_path("/README").expect("readme").attr();
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, FIXTURE_README.len() as u64);
        assert_eq!(attr.perm, 0o644);
        let secs = attr
            .modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("after epoch")
            .as_secs();
        assert_eq!(secs as i64, FIXTURE_TIME >> 16);
        let boot = volume.resolve_path("/boot").expect("boot").attr();
        assert_eq!(boot.kind, FileType::Directory);
    }
}
