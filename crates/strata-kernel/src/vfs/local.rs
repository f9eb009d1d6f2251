//! Directory-backed filesystem.
//!
//! Exposes an existing directory on the host. The directory can change at
//! any time, so it never reports a fingerprint.

use super::traits::{dir_name, validate_path, Entry, Filesystem, VirtualDirectory, VirtualFile};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

/// Local filesystem backend.
///
/// All lookups are relative to `root`. For example, if `root` is
/// `/home/amy/project`, then `get("src/main.rs")` looks at
/// `/home/amy/project/src/main.rs`.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    /// Create a new local filesystem rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Host directory this filesystem exposes.
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            self.root.clone()
        } else {
            self.root.join(trimmed)
        }
    }
}

/// Missing paths and paths below a regular file are both "absent".
fn is_absent(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

#[async_trait]
impl Filesystem for LocalFs {
    async fn get(&self, path: &str) -> io::Result<Option<Entry>> {
        validate_path(path)?;
        let full = self.full_path(path);

        let meta = match fs::metadata(&full).await {
            Ok(meta) => meta,
            Err(e) if is_absent(&e) => return Ok(None),
            Err(e) => return Err(e),
        };

        if meta.is_dir() {
            Ok(Some(Entry::Directory(Arc::new(LocalDirectory {
                name: dir_name(path),
                path: full,
            }))))
        } else if meta.is_file() && !path.ends_with('/') {
            Ok(Some(Entry::File(Arc::new(LocalFile {
                name: path.to_string(),
                path: full,
                size: meta.len(),
            }))))
        } else {
            Ok(None)
        }
    }

    async fn fingerprint(&self) -> io::Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Debug)]
struct LocalFile {
    name: String,
    path: PathBuf,
    size: u64,
}

#[async_trait]
impl VirtualFile for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.size)
    }

    async fn read(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path).await
    }
}

#[derive(Debug)]
struct LocalDirectory {
    name: String,
    path: PathBuf,
}

/// One child of a host directory.
struct Child {
    name: String,
    path: PathBuf,
    is_dir: bool,
    is_link: bool,
    len: u64,
}

/// Directory children sorted by name.
async fn read_sorted(dir: &Path) -> io::Result<Vec<Child>> {
    let mut children = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        let is_link = entry.file_type().await?.is_symlink();
        // follow symlinks so linked directories list like real ones
        let meta = match fs::metadata(entry.path()).await {
            Ok(meta) => meta,
            Err(e) if is_absent(&e) => continue,
            Err(e) => return Err(e),
        };
        if !meta.is_dir() && !meta.is_file() {
            continue;
        }
        children.push(Child {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path(),
            is_dir: meta.is_dir(),
            is_link,
            len: meta.len(),
        });
    }
    children.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(children)
}

#[async_trait]
impl VirtualDirectory for LocalDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self, recursive: bool) -> io::Result<Vec<Entry>> {
        let mut contents = Vec::new();

        // Pre-order walk with an explicit stack; children are pushed in
        // reverse so they pop in name order.
        let mut stack: Vec<(String, Child)> = Vec::new();
        for child in read_sorted(&self.path).await?.into_iter().rev() {
            stack.push((format!("{}{}", self.name, child.name), child));
        }

        while let Some((name, child)) = stack.pop() {
            if child.is_dir {
                let name = format!("{}/", name);
                // linked directories are listed but not descended into, so
                // a link cycle cannot recurse forever
                if recursive && !child.is_link {
                    for grandchild in read_sorted(&child.path).await?.into_iter().rev() {
                        stack.push((format!("{}{}", name, grandchild.name), grandchild));
                    }
                }
                contents.push(Entry::Directory(Arc::new(LocalDirectory {
                    name,
                    path: child.path,
                })));
            } else {
                contents.push(Entry::File(Arc::new(LocalFile {
                    name,
                    path: child.path,
                    size: child.len,
                })));
            }
        }

        Ok(contents)
    }
}
