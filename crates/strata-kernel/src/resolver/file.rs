//! Local file locations: directories and zip archives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::OnceCell;

use super::Resolver;
use crate::error::{ResolveError, ResolveResult};
use crate::vfs::{Filesystem, LocalFs, ZipFs};

/// Resolves `file:` locations and bare host paths.
///
/// A directory becomes a [`LocalFs`]. A regular file is opened as a zip
/// archive; each archive path is opened at most once for the lifetime of the
/// resolver.
#[derive(Debug, Default)]
pub struct FileResolver {
    archives: Mutex<HashMap<PathBuf, Arc<OnceCell<ZipFs>>>>,
}

impl FileResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The host path a local location refers to.
    pub fn path_of(location: &str) -> ResolveResult<PathBuf> {
        let Some(rest) = location.strip_prefix("file:") else {
            return Ok(PathBuf::from(location));
        };
        let path = match rest.strip_prefix("//") {
            // file:///abs and file://localhost/abs
            Some(authority_and_path) => match authority_and_path.find('/') {
                Some(0) => authority_and_path,
                Some(i) if &authority_and_path[..i] == "localhost" => &authority_and_path[i..],
                _ => {
                    return Err(ResolveError::Unsupported(location.to_string()));
                }
            },
            None => rest,
        };
        if !path.starts_with('/') {
            return Err(ResolveError::InvalidLocation {
                location: location.to_string(),
                reason: "file locations must be absolute".to_string(),
            });
        }
        Ok(PathBuf::from(path))
    }

    /// Open a host path as a filesystem.
    pub async fn open(&self, path: &Path, location: &str) -> ResolveResult<Arc<dyn Filesystem>> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| ResolveError::io(location, e))?;

        if meta.is_dir() {
            return Ok(Arc::new(LocalFs::new(path)));
        }
        if !meta.is_file() {
            return Err(ResolveError::Unsupported(location.to_string()));
        }

        let cell = {
            let mut archives = self
                .archives
                .lock()
                .map_err(|_| ResolveError::backend("file", location, "archive table lock poisoned"))?;
            archives.entry(path.to_path_buf()).or_default().clone()
        };
        let archive = cell
            .get_or_try_init(|| async {
                tracing::debug!(path = %path.display(), "opening archive");
                ZipFs::open(path).await.map_err(|e| ResolveError::io(location, e))
            })
            .await?;
        Ok(Arc::new(archive.clone()))
    }

    /// Number of archives opened so far.
    pub fn open_archives(&self) -> usize {
        self.archives
            .lock()
            .map(|a| a.values().filter(|c| c.initialized()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Resolver for FileResolver {
    async fn resolve(&self, location: &str) -> ResolveResult<Arc<dyn Filesystem>> {
        let path = Self::path_of(location)?;
        self.open(&path, location).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path) {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("lib/core.txt", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"core").unwrap();
        std::fs::write(path, writer.finish().unwrap().into_inner()).unwrap();
    }

    #[rstest]
    #[case("file:///srv/lib/", "/srv/lib/")]
    #[case("file:/srv/lib.zip", "/srv/lib.zip")]
    #[case("file://localhost/srv/x", "/srv/x")]
    #[case("relative/dir", "relative/dir")]
    fn paths(#[case] location: &str, #[case] expected: &str) {
        assert_eq!(FileResolver::path_of(location).unwrap(), PathBuf::from(expected));
    }

    #[test]
    fn test_remote_host_unsupported() {
        let err = FileResolver::path_of("file://server/share").unwrap_err();
        assert_eq!(err, ResolveError::Unsupported("file://server/share".into()));
    }

    #[tokio::test]
    async fn test_directory_and_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("lib.zip");
        write_zip(&archive);

        let resolver = FileResolver::new();
        let fs = resolver
            .resolve(&format!("file://{}/", dir.path().display()))
            .await
            .unwrap();
        assert!(fs.fingerprint().await.unwrap().is_none());
        assert!(fs.get("lib.zip").await.unwrap().unwrap().is_file());

        let fs = resolver
            .resolve(&format!("file://{}", archive.display()))
            .await
            .unwrap();
        assert!(fs.fingerprint().await.unwrap().is_some());
        let entry = fs.get("lib/core.txt").await.unwrap().unwrap();
        assert_eq!(entry.read().await.unwrap(), b"core");
    }

    #[tokio::test]
    async fn test_archive_opened_once() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("lib.zip");
        write_zip(&archive);
        let location = format!("file://{}", archive.display());

        let resolver = FileResolver::new();
        let first = resolver.resolve(&location).await.unwrap();
        // later changes on disk are not seen: the archive is already open
        std::fs::write(&archive, b"garbage").unwrap();
        let second = resolver.resolve(&location).await.unwrap();
        assert_eq!(
            first.fingerprint().await.unwrap(),
            second.fingerprint().await.unwrap()
        );
        assert_eq!(resolver.open_archives(), 1);
    }

    #[tokio::test]
    async fn test_missing_location() {
        let resolver = FileResolver::new();
        let err = resolver
            .resolve("file:///definitely/not/here")
            .await
            .err()
            .unwrap();
        assert_eq!(err, ResolveError::NotFound("file:///definitely/not/here".into()));
    }
}
