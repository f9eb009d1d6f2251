//! Git-tree-backed filesystem.
//!
//! GitFs exposes one tree object of a repository. Tree ids are content
//! addressed, so the tree id doubles as the fingerprint.
//!
//! # Example
//!
//! ```ignore
//! let repo = Arc::new(Mutex::new(Repository::open_bare("/cache/repo.git")?));
//! let fs = GitFs::from_commit(repo, commit_id, "lib/")?.expect("path exists");
//! let entry = fs.get("module.toml").await?;
//! ```

use async_trait::async_trait;
use git2::{ObjectType, Oid, Repository, Tree, TreeWalkMode, TreeWalkResult};
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{dir_name, validate_path, Entry, Filesystem, VirtualDirectory, VirtualFile};

type SharedRepo = Arc<Mutex<Repository>>;

fn lock(repo: &SharedRepo) -> io::Result<MutexGuard<'_, Repository>> {
    repo.lock()
        .map_err(|_| io::Error::other("failed to acquire repository lock"))
}

fn git_err(err: git2::Error) -> io::Error {
    io::Error::other(err)
}

/// Read-only filesystem over a git tree.
#[derive(Clone)]
pub struct GitFs {
    repo: SharedRepo,
    tree: Oid,
}

impl fmt::Debug for GitFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitFs").field("tree", &self.tree).finish()
    }
}

impl GitFs {
    /// Expose the tree with the given id.
    pub fn new(repo: SharedRepo, tree: Oid) -> Self {
        Self { repo, tree }
    }

    /// Expose the directory at `path` inside a commit's tree.
    ///
    /// Returns `None` when the path does not exist or is not a directory.
    pub fn from_commit(repo: SharedRepo, commit: Oid, path: &str) -> io::Result<Option<Self>> {
        validate_path(path)?;
        let tree = {
            let guard = lock(&repo)?;
            let root = guard
                .find_commit(commit)
                .and_then(|c| c.tree())
                .map_err(git_err)?;
            let trimmed = path.trim_end_matches('/');
            if trimmed.is_empty() {
                Some(root.id())
            } else {
                match root.get_path(Path::new(trimmed)) {
                    Ok(entry) if entry.kind() == Some(ObjectType::Tree) => Some(entry.id()),
                    Ok(_) => None,
                    Err(e) if e.code() == git2::ErrorCode::NotFound => None,
                    Err(e) => return Err(git_err(e)),
                }
            }
        };
        Ok(tree.map(|tree| Self { repo, tree }))
    }

    /// The tree object this filesystem exposes.
    pub fn tree_id(&self) -> Oid {
        self.tree
    }

    fn directory(&self, name: String, tree: Oid) -> Entry {
        Entry::Directory(Arc::new(GitDirectory {
            name,
            tree,
            repo: self.repo.clone(),
        }))
    }

    fn file(&self, name: String, blob: Oid, size: Option<u64>) -> Entry {
        Entry::File(Arc::new(GitFile {
            name,
            blob,
            size,
            repo: self.repo.clone(),
        }))
    }
}

#[async_trait]
impl Filesystem for GitFs {
    async fn get(&self, path: &str) -> io::Result<Option<Entry>> {
        validate_path(path)?;
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(Some(self.directory(String::new(), self.tree)));
        }

        let repo = lock(&self.repo)?;
        let tree = repo.find_tree(self.tree).map_err(git_err)?;
        let entry = match tree.get_path(Path::new(trimmed)) {
            Ok(entry) => entry,
            // also covers paths below a blob
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(git_err(e)),
        };

        match entry.kind() {
            Some(ObjectType::Tree) => Ok(Some(self.directory(dir_name(trimmed), entry.id()))),
            Some(ObjectType::Blob) if !path.ends_with('/') => {
                let size = repo.find_blob(entry.id()).ok().map(|b| b.size() as u64);
                Ok(Some(self.file(trimmed.to_string(), entry.id(), size)))
            }
            // submodule commits and blobs addressed as directories
            _ => Ok(None),
        }
    }

    async fn fingerprint(&self) -> io::Result<Option<String>> {
        Ok(Some(self.tree.to_string()))
    }
}

struct GitFile {
    name: String,
    blob: Oid,
    size: Option<u64>,
    repo: SharedRepo,
}

impl fmt::Debug for GitFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitFile")
            .field("name", &self.name)
            .field("blob", &self.blob)
            .finish()
    }
}

#[async_trait]
impl VirtualFile for GitFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size_hint(&self) -> Option<u64> {
        self.size
    }

    async fn read(&self) -> io::Result<Vec<u8>> {
        let repo = lock(&self.repo)?;
        let blob = repo.find_blob(self.blob).map_err(git_err)?;
        Ok(blob.content().to_vec())
    }
}

struct GitDirectory {
    name: String,
    tree: Oid,
    repo: SharedRepo,
}

impl fmt::Debug for GitDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitDirectory")
            .field("name", &self.name)
            .field("tree", &self.tree)
            .finish()
    }
}

impl GitDirectory {
    fn entry(&self, name: String, kind: Option<ObjectType>, id: Oid) -> Option<Entry> {
        match kind {
            Some(ObjectType::Tree) => Some(Entry::Directory(Arc::new(GitDirectory {
                name: format!("{}/", name),
                tree: id,
                repo: self.repo.clone(),
            }))),
            Some(ObjectType::Blob) => Some(Entry::File(Arc::new(GitFile {
                name,
                blob: id,
                size: None,
                repo: self.repo.clone(),
            }))),
            _ => None,
        }
    }

    fn collect(&self, tree: &Tree<'_>, recursive: bool) -> io::Result<Vec<Entry>> {
        let mut contents = Vec::new();
        if recursive {
            tree.walk(TreeWalkMode::PreOrder, |root, entry| {
                if let Some(name) = entry.name()
                    && let Some(e) =
                        self.entry(format!("{}{}{}", self.name, root, name), entry.kind(), entry.id())
                {
                    contents.push(e);
                }
                TreeWalkResult::Ok
            })
            .map_err(git_err)?;
        } else {
            for entry in tree.iter() {
                // non-UTF-8 names are not addressable
                let Some(name) = entry.name() else {
                    continue;
                };
                if let Some(e) = self.entry(format!("{}{}", self.name, name), entry.kind(), entry.id()) {
                    contents.push(e);
                }
            }
        }
        Ok(contents)
    }
}

#[async_trait]
impl VirtualDirectory for GitDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self, recursive: bool) -> io::Result<Vec<Entry>> {
        let repo = lock(&self.repo)?;
        let tree = repo.find_tree(self.tree).map_err(git_err)?;
        self.collect(&tree, recursive)
    }
}
