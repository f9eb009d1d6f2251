//! Union filesystem: several filesystems layered into one view.
//!
//! Members are ordered by precedence, first member highest. Same-named
//! directories merge across members; files are never merged, and a file
//! always shadows a directory of the same name, and everything below it,
//! whatever the member order.

use super::hash::hash_chunks;
use super::traits::{dir_name, Entry, Filesystem, VirtualDirectory, VirtualFile};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::io;
use std::sync::Arc;

/// Precedence-ordered composition of filesystems.
#[derive(Clone)]
pub struct UnionFs {
    members: Vec<Arc<dyn Filesystem>>,
}

impl UnionFs {
    pub fn new(members: Vec<Arc<dyn Filesystem>>) -> Self {
        Self { members }
    }

    pub fn members(&self) -> &[Arc<dyn Filesystem>] {
        &self.members
    }
}

impl UnionFs {
    /// Some member has a file at `path`.
    async fn has_file(&self, path: &str) -> io::Result<bool> {
        for member in &self.members {
            if let Some(Entry::File(_)) = member.get(path).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl std::fmt::Debug for UnionFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnionFs")
            .field("members", &self.members.len())
            .finish()
    }
}

#[async_trait]
impl Filesystem for UnionFs {
    async fn get(&self, path: &str) -> io::Result<Option<Entry>> {
        let trimmed = path.trim_end_matches('/');
        for (i, _) in trimmed.match_indices('/') {
            if self.has_file(&trimmed[..i]).await? {
                return Ok(None);
            }
        }

        let mut dirs = Vec::new();
        for member in &self.members {
            match member.get(path).await? {
                Some(Entry::File(file)) => return Ok(Some(Entry::File(file))),
                Some(Entry::Directory(dir)) => dirs.push(dir),
                None => {}
            }
        }
        // `dir/` asks for a directory only, so members with a file of that
        // name never answered above
        if !dirs.is_empty() && path.ends_with('/') && self.has_file(trimmed).await? {
            return Ok(None);
        }
        Ok(merge_directories(dir_name(path), dirs))
    }

    async fn fingerprint(&self) -> io::Result<Option<String>> {
        let mut parts = Vec::with_capacity(self.members.len());
        for member in &self.members {
            match member.fingerprint().await? {
                Some(fp) => parts.push(fp),
                None => return Ok(None),
            }
        }
        Ok(Some(hash_chunks(parts.iter().map(|p| p.as_bytes()))))
    }
}

/// Zero directories is absent, one is returned as is, more become a union.
fn merge_directories(name: String, mut dirs: Vec<Arc<dyn VirtualDirectory>>) -> Option<Entry> {
    match dirs.len() {
        0 => None,
        1 => dirs.pop().map(Entry::Directory),
        _ => Some(Entry::Directory(Arc::new(UnionDirectory {
            name,
            members: dirs,
        }))),
    }
}

/// One logical directory backed by several member directories.
#[derive(Debug)]
pub struct UnionDirectory {
    name: String,
    members: Vec<Arc<dyn VirtualDirectory>>,
}

enum Slot {
    File(Arc<dyn VirtualFile>),
    Directories(Vec<Arc<dyn VirtualDirectory>>),
}

#[async_trait]
impl VirtualDirectory for UnionDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self, recursive: bool) -> io::Result<Vec<Entry>> {
        // Keyed without the trailing `/` so a file and a directory of the
        // same name land in one slot.
        let mut slots: IndexMap<String, Slot> = IndexMap::new();

        for member in &self.members {
            for entry in member.list(recursive).await? {
                let key = entry.name().trim_end_matches('/').to_string();
                match slots.get_mut(&key) {
                    None => {
                        let slot = match entry {
                            Entry::File(file) => Slot::File(file),
                            Entry::Directory(dir) => Slot::Directories(vec![dir]),
                        };
                        slots.insert(key, slot);
                    }
                    Some(Slot::File(_)) => {}
                    Some(slot) => match entry {
                        Entry::File(file) => *slot = Slot::File(file),
                        Entry::Directory(dir) => {
                            if let Slot::Directories(dirs) = slot {
                                dirs.push(dir);
                            }
                        }
                    },
                }
            }
        }

        // descendants of a directory that a file shadows are gone too
        let shadowed: Vec<String> = slots
            .keys()
            .filter(|key| {
                key.match_indices('/')
                    .any(|(i, _)| matches!(slots.get(&key[..i]), Some(Slot::File(_))))
            })
            .cloned()
            .collect();
        for key in &shadowed {
            slots.shift_remove(key);
        }

        Ok(slots
            .into_iter()
            .filter_map(|(key, slot)| match slot {
                Slot::File(file) => Some(Entry::File(file)),
                Slot::Directories(dirs) => merge_directories(dir_name(&key), dirs),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryFs;

    fn mem(files: &[(&str, &str)]) -> Arc<dyn Filesystem> {
        let fs = MemoryFs::new();
        for (path, content) in files {
            fs.insert_file(path, *content).unwrap();
        }
        Arc::new(fs)
    }

    fn sealed(files: &[(&str, &str)]) -> Arc<dyn Filesystem> {
        let fs = MemoryFs::new();
        for (path, content) in files {
            fs.insert_file(path, *content).unwrap();
        }
        fs.seal().unwrap();
        Arc::new(fs)
    }

    async fn list_names(fs: &UnionFs, path: &str, recursive: bool) -> Vec<String> {
        let entry = fs.get(path).await.unwrap().unwrap();
        entry
            .as_dir()
            .unwrap()
            .list(recursive)
            .await
            .unwrap()
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_file_beats_directory_in_both_orders() {
        let file = || mem(&[("a", "file")]);
        let dir = || mem(&[("a/inner.txt", "dir")]);

        for fs in [
            UnionFs::new(vec![file(), dir()]),
            UnionFs::new(vec![dir(), file()]),
        ] {
            let entry = fs.get("a").await.unwrap().unwrap();
            assert!(entry.is_file());
            assert_eq!(entry.read().await.unwrap(), b"file");
        }
    }

    #[tokio::test]
    async fn test_listing_file_beats_directory_in_both_orders() {
        let file = || mem(&[("a", "file"), ("z.txt", "z")]);
        let dir = || mem(&[("a/inner.txt", "dir")]);

        let fs = UnionFs::new(vec![file(), dir()]);
        assert_eq!(list_names(&fs, "", false).await, vec!["a", "z.txt"]);

        // the file replaces the directory in its first-seen position
        let fs = UnionFs::new(vec![dir(), file()]);
        assert_eq!(list_names(&fs, "", false).await, vec!["a", "z.txt"]);
    }

    #[tokio::test]
    async fn test_shadowed_directory_is_unreachable_in_both_orders() {
        let file = || mem(&[("a", "file")]);
        let dir = || mem(&[("a/inner.txt", "dir"), ("a/deep/x", "x")]);

        for fs in [
            UnionFs::new(vec![file(), dir()]),
            UnionFs::new(vec![dir(), file()]),
        ] {
            assert!(fs.get("a").await.unwrap().unwrap().is_file());
            assert!(fs.get("a/").await.unwrap().is_none());
            assert!(fs.get("a/inner.txt").await.unwrap().is_none());
            assert!(fs.get("a/deep/").await.unwrap().is_none());
            assert!(fs.get("a/deep/x").await.unwrap().is_none());
            assert_eq!(list_names(&fs, "", true).await, vec!["a"]);
        }
    }

    #[tokio::test]
    async fn test_recursive_listing_drops_shadowed_descendants() {
        let fs = UnionFs::new(vec![
            mem(&[("a/inner.txt", "dir"), ("a/deep/x", "x")]),
            mem(&[("a", "file")]),
        ]);
        assert_eq!(list_names(&fs, "", true).await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_higher_precedence_file_wins() {
        let fs = UnionFs::new(vec![mem(&[("x.txt", "first")]), mem(&[("x.txt", "second")])]);
        let entry = fs.get("x.txt").await.unwrap().unwrap();
        assert_eq!(entry.read().await.unwrap(), b"first");

        let root = fs.root().await.unwrap().unwrap();
        let listed = root.as_dir().unwrap().list(false).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].read().await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_directories_merge() {
        let fs = UnionFs::new(vec![
            mem(&[("pkg/a.txt", "a"), ("pkg/sub/one.txt", "1")]),
            mem(&[("pkg/b.txt", "b"), ("pkg/sub/two.txt", "2")]),
        ]);
        assert_eq!(
            list_names(&fs, "pkg/", false).await,
            vec!["pkg/a.txt", "pkg/sub/", "pkg/b.txt"]
        );
        assert_eq!(
            list_names(&fs, "pkg/sub", false).await,
            vec!["pkg/sub/one.txt", "pkg/sub/two.txt"]
        );
    }

    #[tokio::test]
    async fn test_single_directory_hit_is_unwrapped() {
        let fs = UnionFs::new(vec![mem(&[("only/a.txt", "a")]), mem(&[])]);
        let entry = fs.get("only/").await.unwrap().unwrap();
        assert_eq!(entry.name(), "only/");
        assert!(fs.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listing_is_idempotent() {
        let fs = UnionFs::new(vec![
            mem(&[("a/x", "1"), ("b", "2")]),
            mem(&[("a/y", "3"), ("c/z", "4")]),
        ]);
        let first = list_names(&fs, "", true).await;
        let second = list_names(&fs, "", true).await;
        assert_eq!(first, second);
        assert_eq!(first, vec!["a/", "a/x", "b", "a/y", "c/", "c/z"]);
    }

    #[tokio::test]
    async fn test_fingerprint_requires_every_member() {
        let fs = UnionFs::new(vec![sealed(&[("a", "1")]), sealed(&[("b", "2")])]);
        let fp = fs.fingerprint().await.unwrap();
        assert!(fp.is_some());
        assert_eq!(fp, fs.fingerprint().await.unwrap());

        let fs = UnionFs::new(vec![sealed(&[("a", "1")]), mem(&[("b", "2")])]);
        assert!(fs.fingerprint().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fingerprint_depends_on_order() {
        let a = sealed(&[("a", "1")]);
        let b = sealed(&[("b", "2")]);
        let ab = UnionFs::new(vec![a.clone(), b.clone()]);
        let ba = UnionFs::new(vec![b, a]);
        assert_ne!(
            ab.fingerprint().await.unwrap(),
            ba.fingerprint().await.unwrap()
        );
    }
}
