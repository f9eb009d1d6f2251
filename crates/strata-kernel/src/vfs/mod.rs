//! Virtual Filesystem (VFS) for strata.
//!
//! Every module location, whatever its origin, is read through the same
//! read-only [`Filesystem`] contract:
//!
//! - **LocalFs**: a directory on the host (never fingerprinted)
//! - **ZipFs**: a zip archive held in memory (content hash)
//! - **GitFs**: a tree of a cached git mirror (tree id)
//! - **MemoryFs**: generated content and tests (hash once sealed)
//! - **UnionFs**: several of the above layered by precedence
//!
//! # Paths
//!
//! ```text
//! ""              # root directory
//! "lib/"          # directory (trailing separator)
//! "lib"           # file `lib`, else directory `lib/`
//! "lib/core.rs"   # file
//! ```
//!
//! A lookup that walks below a file is simply absent.

mod archive;
mod git;
mod hash;
mod local;
mod memory;
mod traits;
mod union;

pub use archive::ZipFs;
pub use git::GitFs;
pub use hash::{hash_bytes, hash_chunks};
pub use local::LocalFs;
pub use memory::MemoryFs;
pub use traits::{
    dir_name, file_name, validate_path, Entry, EntryType, Filesystem, VirtualDirectory,
    VirtualFile,
};
pub use union::{UnionDirectory, UnionFs};

#[cfg(test)]
pub(crate) use git::fixtures as git_fixtures;
