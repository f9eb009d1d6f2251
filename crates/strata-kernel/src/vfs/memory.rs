//! In-memory filesystem implementation.
//!
//! Used for generated modules and testing. Content stays mutable until the
//! filesystem is sealed; only a sealed filesystem has a fingerprint.

use super::hash::hash_chunks;
use super::traits::{dir_name, validate_path, Entry, Filesystem, VirtualDirectory, VirtualFile};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
enum Node {
    File(Arc<[u8]>),
    Directory,
}

#[derive(Debug, Default)]
struct State {
    /// Keyed by path without trailing `/`. The root is `""`.
    nodes: BTreeMap<String, Node>,
    /// Set once sealed.
    fingerprint: Option<String>,
}

impl State {
    fn children(&self, dir: &str) -> Vec<(String, Node)> {
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k.is_empty() && !k[prefix.len()..].contains('/'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// In-memory filesystem.
///
/// Thread-safe via internal `RwLock`. Clones share the same content.
#[derive(Debug, Clone)]
pub struct MemoryFs {
    state: Arc<RwLock<State>>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> io::Error {
    io::Error::other("lock poisoned")
}

impl MemoryFs {
    /// Create a new empty in-memory filesystem.
    pub fn new() -> Self {
        let mut state = State::default();
        // Root directory always exists
        state.nodes.insert(String::new(), Node::Directory);
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Builder-style [`insert_file`](Self::insert_file) for fixtures.
    pub fn with_file(self, path: &str, data: impl Into<Vec<u8>>) -> io::Result<Self> {
        self.insert_file(path, data)?;
        Ok(self)
    }

    /// Write a file, creating parent directories as needed.
    pub fn insert_file(&self, path: &str, data: impl Into<Vec<u8>>) -> io::Result<()> {
        validate_path(path)?;
        let key = path.trim_end_matches('/');
        if key.is_empty() || path.ends_with('/') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a file path: {:?}", path),
            ));
        }
        let mut state = self.state.write().map_err(|_| poisoned())?;
        Self::check_writable(&state)?;
        if let Some((parent, _)) = key.rsplit_once('/') {
            Self::ensure_dirs(&mut state, parent)?;
        }
        if let Some(Node::Directory) = state.nodes.get(key) {
            return Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("is a directory: {}", key),
            ));
        }
        let data: Vec<u8> = data.into();
        state.nodes.insert(key.to_string(), Node::File(data.into()));
        Ok(())
    }

    /// Create a directory and its parents.
    pub fn mkdir(&self, path: &str) -> io::Result<()> {
        validate_path(path)?;
        let mut state = self.state.write().map_err(|_| poisoned())?;
        Self::check_writable(&state)?;
        Self::ensure_dirs(&mut state, path.trim_end_matches('/'))
    }

    /// Freeze the content and compute its fingerprint.
    ///
    /// Further writes fail with `PermissionDenied`. Sealing twice is a no-op.
    pub fn seal(&self) -> io::Result<()> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        if state.fingerprint.is_some() {
            return Ok(());
        }
        let mut chunks: Vec<&[u8]> = Vec::new();
        for (key, node) in &state.nodes {
            match node {
                Node::Directory => {
                    chunks.push(b"D");
                    chunks.push(key.as_bytes());
                    chunks.push(b"\0");
                }
                Node::File(data) => {
                    chunks.push(b"F");
                    chunks.push(key.as_bytes());
                    chunks.push(b"\0");
                    chunks.push(&data[..]);
                    chunks.push(b"\0");
                }
            }
        }
        let fingerprint = hash_chunks(chunks);
        state.fingerprint = Some(fingerprint);
        Ok(())
    }

    /// Whether [`seal`](Self::seal) has been called.
    pub fn is_sealed(&self) -> bool {
        self.state
            .read()
            .map(|s| s.fingerprint.is_some())
            .unwrap_or(false)
    }

    fn check_writable(state: &State) -> io::Result<()> {
        if state.fingerprint.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "filesystem is sealed",
            ));
        }
        Ok(())
    }

    fn ensure_dirs(state: &mut State, path: &str) -> io::Result<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            match state.nodes.get(&current) {
                Some(Node::File(_)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotADirectory,
                        format!("not a directory: {}", current),
                    ));
                }
                Some(Node::Directory) => {}
                None => {
                    state.nodes.insert(current.clone(), Node::Directory);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Filesystem for MemoryFs {
    async fn get(&self, path: &str) -> io::Result<Option<Entry>> {
        validate_path(path)?;
        let state = self.state.read().map_err(|_| poisoned())?;
        let key = path.trim_end_matches('/');
        let entry = match state.nodes.get(key) {
            Some(Node::File(data)) if !path.ends_with('/') => {
                Some(Entry::File(Arc::new(MemoryFile {
                    name: key.to_string(),
                    data: data.clone(),
                })))
            }
            Some(Node::Directory) => Some(Entry::Directory(Arc::new(MemoryDirectory {
                name: dir_name(key),
                state: self.state.clone(),
            }))),
            _ => None,
        };
        Ok(entry)
    }

    async fn fingerprint(&self) -> io::Result<Option<String>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.fingerprint.clone())
    }
}

#[derive(Debug)]
struct MemoryFile {
    name: String,
    data: Arc<[u8]>,
}

#[async_trait]
impl VirtualFile for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    async fn read(&self) -> io::Result<Vec<u8>> {
        Ok(self.data.to_vec())
    }
}

#[derive(Debug)]
struct MemoryDirectory {
    name: String,
    state: Arc<RwLock<State>>,
}

#[async_trait]
impl VirtualDirectory for MemoryDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self, recursive: bool) -> io::Result<Vec<Entry>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let mut contents = Vec::new();

        let mut stack: Vec<(String, Node)> = state
            .children(self.name.trim_end_matches('/'))
            .into_iter()
            .rev()
            .collect();
        while let Some((key, node)) = stack.pop() {
            match node {
                Node::File(data) => contents.push(Entry::File(Arc::new(MemoryFile {
                    name: key,
                    data,
                }))),
                Node::Directory => {
                    if recursive {
                        stack.extend(state.children(&key).into_iter().rev());
                    }
                    contents.push(Entry::Directory(Arc::new(MemoryDirectory {
                        name: dir_name(&key),
                        state: self.state.clone(),
                    })));
                }
            }
        }

        Ok(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryFs {
        MemoryFs::new()
            .with_file("a/one.txt", "one")
            .unwrap()
            .with_file("a/b/two.txt", "two")
            .unwrap()
            .with_file("a-z.txt", "z")
            .unwrap()
    }

    fn names(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(|e| e.name()).collect()
    }

    #[tokio::test]
    async fn test_read_write() {
        let fs = sample();
        let entry = fs.get("a/one.txt").await.unwrap().unwrap();
        assert_eq!(entry.read().await.unwrap(), b"one");
        assert!(fs.get("a/one.txt/").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_parents_created() {
        let fs = sample();
        let b = fs.get("a/b").await.unwrap().unwrap();
        assert!(b.is_dir());
        assert_eq!(b.name(), "a/b/");
    }

    #[tokio::test]
    async fn test_recursive_listing_is_preorder() {
        let fs = sample();
        let root = fs.root().await.unwrap().unwrap();
        let entries = root.as_dir().unwrap().list(true).await.unwrap();
        assert_eq!(
            names(&entries),
            vec!["a/", "a/b/", "a/b/two.txt", "a/one.txt", "a-z.txt"]
        );
    }

    #[tokio::test]
    async fn test_file_blocks_directory() {
        let fs = sample();
        let err = fs.insert_file("a/one.txt/x", "x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotADirectory);
        let err = fs.insert_file("a/b", "x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::IsADirectory);
    }

    #[tokio::test]
    async fn test_fingerprint_only_when_sealed() {
        let fs = sample();
        assert!(fs.fingerprint().await.unwrap().is_none());
        fs.seal().unwrap();
        let fp = fs.fingerprint().await.unwrap().unwrap();
        assert_eq!(fp, sample_sealed().fingerprint().await.unwrap().unwrap());

        let err = fs.insert_file("c.txt", "c").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_fingerprint_tracks_content() {
        let other = sample().with_file("a/one.txt", "changed").unwrap();
        other.seal().unwrap();
        assert_ne!(
            other.fingerprint().await.unwrap(),
            sample_sealed().fingerprint().await.unwrap()
        );
    }

    fn sample_sealed() -> MemoryFs {
        let fs = sample();
        fs.seal().unwrap();
        fs
    }
}
