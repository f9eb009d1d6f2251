//! Zip-archive-backed filesystem.
//!
//! The archive is held in memory and indexed once. Directories are either
//! explicit `dir/` entries or implied by the names of the files inside them.

use super::hash::hash_bytes;
use super::traits::{dir_name, validate_path, Entry, Filesystem, VirtualDirectory, VirtualFile};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{self, Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use zip::ZipArchive;

type Archive = ZipArchive<Cursor<Arc<[u8]>>>;

struct ZipIndex {
    archive: Archive,
    /// Entry names in archive order.
    names: Vec<String>,
    sizes: Vec<u64>,
    by_name: HashMap<String, usize>,
    fingerprint: String,
}

impl fmt::Debug for ZipIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZipIndex")
            .field("entries", &self.names.len())
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Read-only filesystem over a zip archive.
#[derive(Debug, Clone)]
pub struct ZipFs {
    index: Arc<ZipIndex>,
}

impl ZipFs {
    /// Read and index the archive at `path`.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        Self::from_bytes(bytes).map_err(|e| {
            io::Error::new(e.kind(), format!("{}: {}", path.display(), e))
        })
    }

    /// Index an archive held in memory.
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> io::Result<Self> {
        let bytes: Arc<[u8]> = bytes.into();
        let fingerprint = hash_bytes(&bytes);
        let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(invalid_archive)?;

        let mut names = Vec::with_capacity(archive.len());
        let mut sizes = Vec::with_capacity(archive.len());
        let mut by_name = HashMap::with_capacity(archive.len());
        for i in 0..archive.len() {
            let entry = archive.by_index_raw(i).map_err(invalid_archive)?;
            let name = entry.name().to_string();
            sizes.push(entry.size());
            // first entry wins when an archive repeats a name
            by_name.entry(name.clone()).or_insert(i);
            names.push(name);
        }

        Ok(Self {
            index: Arc::new(ZipIndex {
                archive,
                names,
                sizes,
                by_name,
                fingerprint,
            }),
        })
    }

    fn directory(&self, name: String) -> Entry {
        Entry::Directory(Arc::new(ZipDirectory {
            name,
            index: self.index.clone(),
        }))
    }

    fn file(&self, i: usize) -> Entry {
        Entry::File(Arc::new(ZipEntryFile {
            name: self.index.names[i].clone(),
            position: i,
            index: self.index.clone(),
        }))
    }

    /// Look for any entry below `prefix`, for archives without directory entries.
    ///
    /// Stops at the first explicit directory entry: an archive that has them
    /// would already have answered through the index.
    fn implied_directory(&self, prefix: &str) -> bool {
        for name in &self.index.names {
            if name.ends_with('/') {
                return false;
            }
            if name.starts_with(prefix) {
                return true;
            }
        }
        false
    }
}

/// Largest buffer reserved up front from a size the archive claims.
const MAX_PREALLOCATION: u64 = 1 << 20;

/// Headers can lie about member sizes; reads grow the buffer past this.
fn initial_capacity(declared: u64) -> usize {
    declared.min(MAX_PREALLOCATION) as usize
}

fn invalid_archive(err: zip::result::ZipError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[async_trait]
impl Filesystem for ZipFs {
    async fn get(&self, path: &str) -> io::Result<Option<Entry>> {
        validate_path(path)?;
        if path.is_empty() {
            return Ok(Some(self.directory(String::new())));
        }

        if let Some(&i) = self.index.by_name.get(path) {
            return Ok(Some(if path.ends_with('/') {
                self.directory(path.to_string())
            } else {
                self.file(i)
            }));
        }

        let prefix = dir_name(path);
        if !path.ends_with('/') && self.index.by_name.contains_key(&prefix) {
            return Ok(Some(self.directory(prefix)));
        }
        if self.implied_directory(&prefix) {
            return Ok(Some(self.directory(prefix)));
        }
        Ok(None)
    }

    async fn fingerprint(&self) -> io::Result<Option<String>> {
        Ok(Some(self.index.fingerprint.clone()))
    }
}

#[derive(Debug)]
struct ZipEntryFile {
    name: String,
    position: usize,
    index: Arc<ZipIndex>,
}

#[async_trait]
impl VirtualFile for ZipEntryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size_hint(&self) -> Option<u64> {
        self.index.sizes.get(self.position).copied()
    }

    async fn read(&self) -> io::Result<Vec<u8>> {
        let mut archive = self.index.archive.clone();
        let position = self.position;
        tokio::task::spawn_blocking(move || {
            let mut entry = archive.by_index(position).map_err(invalid_archive)?;
            let mut data = Vec::with_capacity(initial_capacity(entry.size()));
            entry.read_to_end(&mut data)?;
            Ok::<_, io::Error>(data)
        })
        .await
        .map_err(io::Error::other)?
    }
}

#[derive(Debug)]
struct ZipDirectory {
    name: String,
    index: Arc<ZipIndex>,
}

#[async_trait]
impl VirtualDirectory for ZipDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self, recursive: bool) -> io::Result<Vec<Entry>> {
        let prefix = self.name.as_str();
        let mut seen = HashSet::new();
        let mut contents = Vec::new();
        let fs = ZipFs {
            index: self.index.clone(),
        };

        for (i, name) in self.index.names.iter().enumerate() {
            let Some(rest) = name.strip_prefix(prefix) else {
                continue;
            };
            let relative = rest.trim_end_matches('/');
            if relative.is_empty() {
                continue;
            }

            // Directories implied by the entry's name come first.
            let components: Vec<&str> = relative.split('/').collect();
            let depth = components.len();
            for k in 1..depth {
                let implied = format!("{}{}/", prefix, components[..k].join("/"));
                if seen.insert(implied.clone()) {
                    contents.push(fs.directory(implied));
                }
                if !recursive {
                    break;
                }
            }
            if depth > 1 && !recursive {
                continue;
            }

            if name.ends_with('/') {
                if seen.insert(name.clone()) {
                    contents.push(fs.directory(name.clone()));
                }
            } else if seen.insert(name.clone()) {
                contents.push(fs.file(i));
            }
        }

        Ok(contents)
    }
}
