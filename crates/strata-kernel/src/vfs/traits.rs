//! Core VFS traits and types.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Type of a VFS entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
}

/// A readable file inside a filesystem.
///
/// `name()` is the full slash-separated path from the filesystem root,
/// never with a trailing separator.
#[async_trait]
pub trait VirtualFile: Send + Sync + fmt::Debug {
    /// Path of this file relative to the filesystem root.
    fn name(&self) -> &str;

    /// Size in bytes, if the backend knows it without reading.
    fn size_hint(&self) -> Option<u64> {
        None
    }

    /// Read the entire contents of the file.
    async fn read(&self) -> io::Result<Vec<u8>>;
}

/// A listable directory inside a filesystem.
///
/// `name()` always ends with `/`, except for the root which is `""`.
#[async_trait]
pub trait VirtualDirectory: Send + Sync + fmt::Debug {
    /// Path of this directory relative to the filesystem root.
    fn name(&self) -> &str;

    /// List the directory.
    ///
    /// With `recursive` set, entries of every descendant directory are
    /// included as well. The result never contains the same name twice and
    /// its order is stable for an unchanged source.
    async fn list(&self, recursive: bool) -> io::Result<Vec<Entry>>;
}

/// Result of a path lookup: either a file or a directory, never both.
#[derive(Debug, Clone)]
pub enum Entry {
    File(Arc<dyn VirtualFile>),
    Directory(Arc<dyn VirtualDirectory>),
}

impl Entry {
    pub fn name(&self) -> &str {
        match self {
            Entry::File(f) => f.name(),
            Entry::Directory(d) => d.name(),
        }
    }

    pub fn entry_type(&self) -> EntryType {
        match self {
            Entry::File(_) => EntryType::File,
            Entry::Directory(_) => EntryType::Directory,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Entry::File(_))
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Entry::Directory(_))
    }

    pub fn as_file(&self) -> Option<&Arc<dyn VirtualFile>> {
        match self {
            Entry::File(f) => Some(f),
            Entry::Directory(_) => None,
        }
    }

    pub fn as_dir(&self) -> Option<&Arc<dyn VirtualDirectory>> {
        match self {
            Entry::Directory(d) => Some(d),
            Entry::File(_) => None,
        }
    }

    /// Read the entry as bytes.
    ///
    /// Files return their contents. Directories return the names of their
    /// immediate children relative to the directory, one per line.
    pub async fn read(&self) -> io::Result<Vec<u8>> {
        match self {
            Entry::File(f) => f.read().await,
            Entry::Directory(d) => {
                let mut out = Vec::new();
                for child in d.list(false).await? {
                    let name = child.name();
                    let relative = name.strip_prefix(d.name()).unwrap_or(name);
                    out.extend_from_slice(relative.as_bytes());
                    out.push(b'\n');
                }
                Ok(out)
            }
        }
    }
}

/// Read-only filesystem over one backing source.
///
/// Paths are slash-separated and relative to the filesystem root. The empty
/// path is the root directory. A path ending in `/` only ever resolves to a
/// directory; a path without it resolves to a file, or to a directory of
/// that name when no file exists.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Look up a path. Missing paths (including paths below a file) are `Ok(None)`.
    async fn get(&self, path: &str) -> io::Result<Option<Entry>>;

    /// Stable identifier of the current content snapshot.
    ///
    /// `None` when the source can change underneath us.
    async fn fingerprint(&self) -> io::Result<Option<String>>;

    /// The root directory.
    async fn root(&self) -> io::Result<Option<Entry>> {
        self.get("").await
    }
}

/// Reject paths the VFS cannot address.
///
/// Absolute paths, empty segments, `.`/`..` segments and NUL bytes are errors.
pub fn validate_path(path: &str) -> io::Result<()> {
    if path.is_empty() {
        return Ok(());
    }
    let invalid = |why: &str| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid path {:?}: {}", path, why),
        )
    };
    if path.starts_with('/') {
        return Err(invalid("must be relative"));
    }
    if path.contains('\0') {
        return Err(invalid("contains NUL"));
    }
    let body = path.strip_suffix('/').unwrap_or(path);
    for segment in body.split('/') {
        match segment {
            "" => return Err(invalid("empty segment")),
            "." | ".." => return Err(invalid("relative segment")),
            _ => {}
        }
    }
    Ok(())
}

/// Normalize a directory name: non-empty names end with exactly one `/`.
pub fn dir_name(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Normalize a file name: no trailing `/`.
pub fn file_name(path: &str) -> String {
    path.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::root("")]
    #[case::file("a.txt")]
    #[case::nested("a/b/c.txt")]
    #[case::dir("a/b/")]
    fn valid_paths(#[case] path: &str) {
        assert!(validate_path(path).is_ok());
    }

    #[rstest]
    #[case::absolute("/etc/passwd")]
    #[case::double_slash("a//b")]
    #[case::parent("a/../b")]
    #[case::current("./a")]
    #[case::only_slash("/")]
    fn invalid_paths(#[case] path: &str) {
        let err = validate_path(path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_name_normalization() {
        assert_eq!(dir_name(""), "");
        assert_eq!(dir_name("a"), "a/");
        assert_eq!(dir_name("a/b/"), "a/b/");
        assert_eq!(file_name("a/b/"), "a/b");
        assert_eq!(file_name("a"), "a");
    }
}
