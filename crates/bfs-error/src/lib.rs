#![forbid(unsafe_code)]
//! Error types for the BFS reader.
//!
//! # Error Taxonomy
//!
//! Two layers, as everywhere in this workspace:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `bfs-types` | Byte-level format violations found while decoding a buffer |
//! | Runtime | `BfsError` | `bfs-error` (this crate) | Errors returned by volume, stream, tree and node operations |
//!
//! ## Mapping Policy: ParseError → BfsError
//!
//! `bfs-error` does not depend on `bfs-types`. The conversion lives in
//! `bfs-volume` (`parse_to_bfs_error`), the first crate that knows both the
//! parse error and the device offset it came from.
//!
//! | ParseError Variant | BfsError Variant |
//! |--------------------|------------------|
//! | `InsufficientData` | `BadData { offset, detail }` |
//! | `InvalidMagic` | `BadData { offset, detail }` |
//! | `InvalidField` | `BadData { offset, detail }` |
//! | `IntegerConversion` | `BadData { offset, detail }` |
//!
//! Superblock failures are the exception: every rejection during volume
//! initialisation surfaces as `BadSuperblock` so callers can tell "not a BFS
//! volume" from "a BFS volume with a corrupt tree".
//!
//! ## errno Mapping
//!
//! Every `BfsError` variant maps to exactly one POSIX errno via
//! [`BfsError::to_errno`]. The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `BadSuperblock` | `EINVAL` |
//! | `BadData` | `EIO` |
//! | `BadInode` | `EIO` |
//! | `NotFound` | `ENOENT` |
//! | `NotAllowed` | `EROFS` |
//! | `Busy` | `EBUSY` |
//! | `BadType` | `EINVAL` |
//! | `BadValue` | `EINVAL` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotSymlink` | `EINVAL` |
//! | `TooManyLinks` | `ELOOP` |

use thiserror::Error;

/// Unified error type for all BFS reader operations.
#[derive(Debug, Error)]
pub enum BfsError {
    /// Device read failure (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The superblock is missing or fails validation.
    #[error("bad superblock: {0}")]
    BadSuperblock(String),

    /// Structural corruption: out-of-range link, oversized key,
    /// node-boundary overflow, invalid block run.
    #[error("corrupt data at byte {offset}: {detail}")]
    BadData { offset: u64, detail: String },

    /// An inode failed its self-check.
    #[error("bad inode {inode}: {detail}")]
    BadInode { inode: u64, detail: String },

    /// Named entry, key, or block run does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A write was attempted, or a read on a node that has no readable data.
    #[error("operation not allowed")]
    NotAllowed,

    /// The inode is still being created.
    #[error("inode busy")]
    Busy,

    /// Tree or key type mismatch (e.g. single-value lookup on a duplicate tree).
    #[error("bad type: {0}")]
    BadType(String),

    /// Invalid caller-supplied argument (e.g. key length out of range).
    #[error("bad value: {0}")]
    BadValue(String),

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// `read_link` on something that is not a symlink.
    #[error("not a symbolic link")]
    NotSymlink,

    /// Symlink resolution exceeded the configured depth.
    #[error("too many levels of symbolic links")]
    TooManyLinks,
}

impl BfsError {
    /// Shorthand for [`BfsError::BadData`].
    pub fn bad_data(offset: u64, detail: impl Into<String>) -> Self {
        Self::BadData {
            offset,
            detail: detail.into(),
        }
    }

    /// Shorthand for [`BfsError::BadInode`].
    pub fn bad_inode(inode: u64, detail: impl Into<String>) -> Self {
        Self::BadInode {
            inode,
            detail: detail.into(),
        }
    }

    /// Convert this error into a POSIX errno.
    ///
    /// - `NotAllowed` → `EROFS`: the only forbidden operations are writes.
    /// - `NotSymlink` → `EINVAL`: what `readlink(2)` reports.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::BadData { .. } | Self::BadInode { .. } => libc::EIO,
            Self::BadSuperblock(_) | Self::BadType(_) | Self::BadValue(_) | Self::NotSymlink => {
                libc::EINVAL
            }
            Self::NotFound(_) => libc::ENOENT,
            Self::NotAllowed => libc::EROFS,
            Self::Busy => libc::EBUSY,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::TooManyLinks => libc::ELOOP,
        }
    }

    /// Whether the error reports on-disk corruption rather than a caller mistake.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::BadSuperblock(_) | Self::BadData { .. } | Self::BadInode { .. }
        )
    }
}

/// Result alias using `BfsError`.
pub type Result<T> = std::result::Result<T, BfsError>;
