//! Git repositories mirrored into the cache.
//!
//! Locations look like `git+<repository url>.git/<revision>/<path>/`. The
//! revision may itself contain slashes (`feature/x`); the shortest prefix of
//! `<revision>/<path>` that names a commit is taken as the revision.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use git2::{FetchOptions, FetchPrune, ObjectType, Oid, Repository};
use tokio::sync::OnceCell;

use super::Resolver;
use crate::error::{ResolveError, ResolveResult};
use crate::paths::cache_key;
use crate::vfs::{Filesystem, GitFs};

const SCHEME: &str = "git+";
const REPOSITORY_SUFFIX: &str = ".git/";

/// Split a git location into repository url and `<revision>/<path>`.
fn split_location(location: &str) -> ResolveResult<(&str, &str)> {
    let invalid = |reason: &str| ResolveError::InvalidLocation {
        location: location.to_string(),
        reason: reason.to_string(),
    };
    let rest = location
        .strip_prefix(SCHEME)
        .ok_or_else(|| invalid("missing git+ prefix"))?;
    let split = rest
        .find(REPOSITORY_SUFFIX)
        .ok_or_else(|| invalid("repository url must end in .git"))?;
    let (url, tail) = rest.split_at(split + REPOSITORY_SUFFIX.len() - 1);
    let tail = &tail[1..];
    if tail.is_empty() {
        return Err(invalid("missing revision"));
    }
    Ok((url, tail))
}

/// A bare mirror of one remote repository.
pub struct CachedRepository {
    url: String,
    path: PathBuf,
    repo: Arc<Mutex<Repository>>,
    /// `"<revision>/"` to the root tree of that revision.
    revisions: Mutex<BTreeMap<String, Oid>>,
}

impl std::fmt::Debug for CachedRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedRepository")
            .field("url", &self.url)
            .field("path", &self.path)
            .finish()
    }
}

impl CachedRepository {
    /// Open or create the mirror at `path` and fetch from `url`.
    ///
    /// Blocks; call from a blocking thread.
    pub fn open(url: &str, path: &Path) -> Result<Self, git2::Error> {
        let repo = if path.exists() {
            Repository::open_bare(path)?
        } else {
            tracing::info!(%url, path = %path.display(), "creating repository mirror");
            let repo = Repository::init_bare(path)?;
            repo.remote_with_fetch("origin", url, "+refs/*:refs/*")?;
            repo.config()?.set_bool("remote.origin.mirror", true)?;
            repo
        };

        {
            let mut remote = repo.find_remote("origin")?;
            let mut options = FetchOptions::new();
            options.prune(FetchPrune::On);
            tracing::debug!(%url, "fetching");
            remote.fetch::<&str>(&[], Some(&mut options), None)?;
        }

        Ok(Self {
            url: url.to_string(),
            path: path.to_path_buf(),
            repo: Arc::new(Mutex::new(repo)),
            revisions: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Revisions resolved so far, each with its trailing `/`.
    pub fn cached_revisions(&self) -> Vec<String> {
        self.revisions
            .lock()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Repository>, git2::Error> {
        self.repo
            .lock()
            .map_err(|_| git2::Error::from_str("failed to acquire repository lock"))
    }

    fn cached_revision(&self, rev_and_path: &str) -> Option<(usize, Oid)> {
        let revisions = self.revisions.lock().ok()?;
        // Cached revisions are shortest prefixes, so no other key can sort
        // between a matching revision and the location.
        let (key, tree) = revisions
            .range::<str, _>((Bound::Unbounded, Bound::Included(rev_and_path)))
            .next_back()?;
        rev_and_path
            .starts_with(key.as_str())
            .then(|| (key.len(), *tree))
    }

    /// The tree `<revision>/<path>` names, if any. Blocks.
    pub fn lookup_tree(&self, rev_and_path: &str) -> Result<Option<Oid>, git2::Error> {
        let repo = self.lock()?;

        let (split, root) = match self.cached_revision(rev_and_path) {
            Some(hit) => hit,
            None => {
                let mut found = None;
                for (i, _) in rev_and_path.match_indices('/') {
                    let candidate = &rev_and_path[..i];
                    if let Ok(commit) = repo
                        .revparse_single(candidate)
                        .and_then(|o| o.peel_to_commit())
                    {
                        found = Some((i + 1, commit.tree_id()));
                        break;
                    }
                }
                let Some((split, root)) = found else {
                    return Ok(None);
                };
                let revision = &rev_and_path[..split - 1];
                tracing::debug!(url = %self.url, %revision, tree = %root, "resolved revision");
                if let Ok(mut revisions) = self.revisions.lock() {
                    revisions.insert(rev_and_path[..split].to_string(), root);
                }
                (split, root)
            }
        };

        let path = rev_and_path[split..].trim_end_matches('/');
        if path.is_empty() {
            return Ok(Some(root));
        }
        let tree = repo.find_tree(root)?;
        match tree.get_path(Path::new(path)) {
            Ok(entry) if entry.kind() == Some(ObjectType::Tree) => Ok(Some(entry.id())),
            Ok(_) => Ok(None),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Resolves `git+` locations against mirrors kept under `<cache>/git/`.
///
/// Each repository url is mirrored and fetched at most once per resolver.
#[derive(Debug)]
pub struct GitResolver {
    cache_dir: PathBuf,
    repositories: Mutex<HashMap<String, Arc<OnceCell<Arc<CachedRepository>>>>>,
}

impl GitResolver {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            repositories: Mutex::new(HashMap::new()),
        }
    }

    /// Where the mirror of `url` lives.
    pub fn mirror_path(&self, url: &str) -> PathBuf {
        self.cache_dir.join("git").join(cache_key(url))
    }

    /// The mirror of `url`, created and fetched on first use.
    pub async fn repository(&self, url: &str) -> ResolveResult<Arc<CachedRepository>> {
        let cell = {
            let mut repositories = self
                .repositories
                .lock()
                .map_err(|_| ResolveError::backend("git", url, "repository table lock poisoned"))?;
            repositories.entry(url.to_string()).or_default().clone()
        };
        let repo = cell
            .get_or_try_init(|| async {
                let owned_url = url.to_string();
                let path = self.mirror_path(url);
                let repo = tokio::task::spawn_blocking(move || {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)
                            .map_err(|e| git2::Error::from_str(&e.to_string()))?;
                    }
                    CachedRepository::open(&owned_url, &path)
                })
                .await
                .map_err(|e| ResolveError::backend("git", url, e))?
                .map_err(|e| ResolveError::backend("git", url, e))?;
                Ok::<_, ResolveError>(Arc::new(repo))
            })
            .await?;
        Ok(repo.clone())
    }
}

#[async_trait]
impl Resolver for GitResolver {
    async fn resolve(&self, location: &str) -> ResolveResult<Arc<dyn Filesystem>> {
        let (url, rev_and_path) = split_location(location)?;
        let repo = self.repository(url).await?;

        let lookup = repo.clone();
        let key = rev_and_path.to_string();
        let tree = tokio::task::spawn_blocking(move || lookup.lookup_tree(&key))
            .await
            .map_err(|e| ResolveError::backend("git", location, e))?
            .map_err(|e| ResolveError::backend("git", location, e))?;

        match tree {
            Some(tree) => Ok(Arc::new(GitFs::new(repo.repo.clone(), tree))),
            None => Err(ResolveError::NotFound(location.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::git_fixtures::{commit_files, init};
    use rstest::rstest;

    #[rstest]
    #[case("git+https://host/repo.git/main/", "https://host/repo.git", "main/")]
    #[case("git+file:///srv/r.git/feature/x/lib/", "file:///srv/r.git", "feature/x/lib/")]
    fn split(#[case] location: &str, #[case] url: &str, #[case] rest: &str) {
        assert_eq!(split_location(location).unwrap(), (url, rest));
    }

    #[rstest]
    #[case("https://host/repo.git/main/")]
    #[case("git+https://host/repo/main/")]
    #[case("git+https://host/repo.git/")]
    fn invalid_locations(#[case] location: &str) {
        assert!(matches!(
            split_location(location),
            Err(ResolveError::InvalidLocation { .. })
        ));
    }

    struct Upstream {
        _dir: tempfile::TempDir,
        cache: tempfile::TempDir,
        url: String,
    }

    fn upstream() -> Upstream {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upstream.git");
        let repo = init(&path);
        let commit = commit_files(
            &repo,
            &[("README", "readme"), ("lib/a.txt", "a"), ("lib/sub/b.txt", "b")],
            "initial",
        );
        let commit = repo.find_commit(commit).unwrap();
        repo.branch("release", &commit, false).unwrap();
        repo.branch("feature/x", &commit, false).unwrap();
        Upstream {
            url: format!("file://{}", path.display()),
            _dir: dir,
            cache: tempfile::tempdir().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_resolve_branch_subdirectory() {
        let up = upstream();
        let resolver = GitResolver::new(up.cache.path().to_path_buf());
        let fs = resolver
            .resolve(&format!("git+{}/release/lib/", up.url))
            .await
            .unwrap();
        let entry = fs.get("a.txt").await.unwrap().unwrap();
        assert_eq!(entry.read().await.unwrap(), b"a");
        assert!(fs.get("README").await.unwrap().is_none());
        assert!(fs.fingerprint().await.unwrap().is_some());
        assert!(resolver.mirror_path(&up.url).exists());
    }

    #[tokio::test]
    async fn test_revision_with_slash() {
        let up = upstream();
        let resolver = GitResolver::new(up.cache.path().to_path_buf());
        let fs = resolver
            .resolve(&format!("git+{}/feature/x/lib/sub/", up.url))
            .await
            .unwrap();
        assert!(fs.get("b.txt").await.unwrap().is_some());
        let repo = resolver.repository(&up.url).await.unwrap();
        assert_eq!(repo.cached_revisions(), vec!["feature/x/"]);
    }

    #[tokio::test]
    async fn test_revision_cached_across_paths() {
        let up = upstream();
        let resolver = GitResolver::new(up.cache.path().to_path_buf());
        let whole = resolver
            .resolve(&format!("git+{}/release/", up.url))
            .await
            .unwrap();
        let lib = resolver
            .resolve(&format!("git+{}/release/lib/", up.url))
            .await
            .unwrap();
        assert_ne!(
            whole.fingerprint().await.unwrap(),
            lib.fingerprint().await.unwrap()
        );
        let repo = resolver.repository(&up.url).await.unwrap();
        assert_eq!(repo.cached_revisions(), vec!["release/"]);

        // floor lookup: only locations under a cached revision hit
        assert_eq!(repo.cached_revision("release/lib/").map(|(len, _)| len), Some(8));
        assert!(repo.cached_revision("releases/").is_none());
        assert!(repo.cached_revision("main/").is_none());
    }

    #[tokio::test]
    async fn test_missing_revision_or_path() {
        let up = upstream();
        let resolver = GitResolver::new(up.cache.path().to_path_buf());
        for location in [
            format!("git+{}/nope/lib/", up.url),
            format!("git+{}/release/missing/", up.url),
            format!("git+{}/release/README/", up.url),
        ] {
            let err = resolver.resolve(&location).await.err().unwrap();
            assert_eq!(err, ResolveError::NotFound(location));
        }
    }

    #[tokio::test]
    async fn test_existing_mirror_is_reused() {
        let up = upstream();
        let location = format!("git+{}/release/lib/", up.url);
        GitResolver::new(up.cache.path().to_path_buf())
            .resolve(&location)
            .await
            .unwrap();
        // a fresh resolver over the same cache opens the existing mirror
        let fs = GitResolver::new(up.cache.path().to_path_buf())
            .resolve(&location)
            .await
            .unwrap();
        assert!(fs.get("a.txt").await.unwrap().is_some());
    }
}
