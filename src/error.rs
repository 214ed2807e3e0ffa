//! The error taxonomy shared by every component of the engine.

use std::path::PathBuf;

/// Errors produced by the virtual file system engine.
///
/// Every fallible operation exposed by [`crate::fs::FileSystem`] and its
/// collaborators returns this type rather than panicking or exiting the
/// process; the transaction manager (`crate::transaction`) reacts only to
/// the `Err` variant, never to a language-level exception.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A path component does not exist.
    #[error("no such file or directory: {path}")]
    NotFound {
        /// The path that failed to resolve.
        path: String,
    },

    /// A name collision was found in the target parent directory.
    #[error("already exists: {path}")]
    AlreadyExists {
        /// The colliding path.
        path: String,
    },

    /// A non-directory was found where a directory was required.
    #[error("not a directory: {path}")]
    NotADirectory {
        /// The offending path.
        path: String,
    },

    /// A directory was found where a file was required.
    #[error("is a directory: {path}")]
    IsADirectory {
        /// The offending path.
        path: String,
    },

    /// An encoded name exceeded the image's configured name field width.
    #[error("name too long: `{name}` exceeds the {limit}-byte name field")]
    NameTooLong {
        /// The name that was rejected.
        name: String,
        /// The configured name field width, in bytes.
        limit: usize,
    },

    /// The allocator could not find a contiguous run of the requested length.
    #[error("out of space: no contiguous run of {requested} block(s) available")]
    OutOfSpace {
        /// The number of blocks that were requested.
        requested: u32,
    },

    /// The inode table has no free slot left.
    #[error("index is full")]
    NoIndexSpace,

    /// The metadata sidecar was required but is absent.
    #[error("metadata sidecar missing: {path}")]
    MetadataMissing {
        /// The path of the sidecar that was expected.
        path: PathBuf,
    },

    /// Decoded on-disk bytes violate a core invariant.
    #[error("on-disk corruption: {detail}")]
    Corruption {
        /// Human-readable description of the violated invariant.
        detail: String,
    },

    /// A lower-level I/O failure, folded into the domain taxonomy.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
