//! Archives fetched over HTTP(S).

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::OnceCell;

use super::{FileResolver, Resolver};
use crate::error::{ResolveError, ResolveResult};
use crate::paths::cache_key;
use crate::vfs::Filesystem;

/// Downloads single-file locations into the cache, then opens them locally.
///
/// A location already present in the cache is never fetched again. Locations
/// naming a directory (trailing `/`) cannot be listed over HTTP and are
/// rejected.
pub struct HttpResolver {
    client: Client,
    cache_dir: PathBuf,
    file: Arc<FileResolver>,
    downloads: Mutex<HashMap<String, Arc<OnceCell<PathBuf>>>>,
}

impl std::fmt::Debug for HttpResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResolver")
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}

impl HttpResolver {
    pub fn new(cache_dir: PathBuf, file: Arc<FileResolver>) -> ResolveResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ResolveError::backend("http", "client", e))?;
        Ok(Self {
            client,
            cache_dir,
            file,
            downloads: Mutex::new(HashMap::new()),
        })
    }

    /// Where a location is cached.
    pub fn cached_path(&self, location: &str) -> PathBuf {
        self.cache_dir.join(cache_key(location))
    }

    async fn download(&self, location: &str, target: &Path) -> ResolveResult<()> {
        tracing::debug!(%location, target = %target.display(), "downloading");
        let response = self
            .client
            .get(location)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ResolveError::backend("http", location, e))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ResolveError::backend("http", location, e))?;

        let parent = target.parent().unwrap_or(&self.cache_dir).to_path_buf();
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || store(&parent, &target, &bytes))
            .await
            .map_err(std::io::Error::other)
            .and_then(|stored| stored)
            .map_err(|e| ResolveError::Io {
                location: location.to_string(),
                message: format!("failed to store download: {}", e),
            })
    }

    async fn fetch(&self, location: &str) -> ResolveResult<PathBuf> {
        let cell = {
            let mut downloads = self
                .downloads
                .lock()
                .map_err(|_| ResolveError::backend("http", location, "download table lock poisoned"))?;
            downloads.entry(location.to_string()).or_default().clone()
        };
        let path = cell
            .get_or_try_init(|| async {
                let target = self.cached_path(location);
                if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                    tracing::debug!(%location, "using cached download");
                } else {
                    self.download(location, &target).await?;
                }
                Ok::<_, ResolveError>(target)
            })
            .await?;
        Ok(path.clone())
    }
}

/// Write `bytes` to `target` through a uniquely named sibling, so a partial
/// or concurrent download never lands under another key.
fn store(parent: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(parent)?;
    let mut staged = tempfile::Builder::new()
        .prefix(".download-")
        .tempfile_in(parent)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    staged.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// The path part of a URL ends with `/`.
fn names_directory(location: &str) -> bool {
    let end = location.find(['?', '#']).unwrap_or(location.len());
    location[..end].ends_with('/')
}

#[async_trait]
impl Resolver for HttpResolver {
    async fn resolve(&self, location: &str) -> ResolveResult<Arc<dyn Filesystem>> {
        if names_directory(location) {
            return Err(ResolveError::Unsupported(location.to_string()));
        }
        let path = self.fetch(location).await?;
        self.file.open(&path, location).await
    }
}
