//! Location resolution.
//!
//! A [`ResolverRegistry`] turns a location string into a [`Filesystem`].
//! `file:` locations (and bare paths) are handled directly. Everything else
//! goes through the configured resolver entries: each entry pairs a regex
//! with a backend name, entries are tried in order and the first pattern
//! matching the whole location wins.
//!
//! Backends are created from a [`BackendFactories`] map the first time their
//! entry matches, and at most once per entry. Built-in backends:
//!
//! | Name | Locations |
//! |------|-----------|
//! | `file` | directories and zip archives on the host |
//! | `http` | a zip archive downloaded once into the cache |
//! | `git` | `git+<repo>.git/<revision>/<path>/` from a cached mirror |

mod file;
mod git;
mod http;

pub use file::FileResolver;
pub use git::{CachedRepository, GitResolver};
pub use http::HttpResolver;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::OnceCell;

use crate::config::{has_scheme, ResolverDef};
use crate::error::{ConfigError, ConfigResult, ResolveError, ResolveResult};
use crate::vfs::{Filesystem, UnionFs};

/// Turns a location into a filesystem.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, location: &str) -> ResolveResult<Arc<dyn Filesystem>>;
}

/// What a backend factory gets to work with.
#[derive(Clone)]
pub struct BackendContext {
    /// Root of the on-disk cache for fetched content.
    pub cache_dir: PathBuf,
    /// The session's local file resolver, shared so archives open once.
    pub file: Arc<FileResolver>,
}

impl BackendContext {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            file: Arc::new(FileResolver::new()),
        }
    }
}

/// Creates a backend instance.
pub type BackendFactory =
    Arc<dyn Fn(&BackendContext) -> ResolveResult<Arc<dyn Resolver>> + Send + Sync>;

/// Backend constructors keyed by backend name.
#[derive(Clone, Default)]
pub struct BackendFactories {
    factories: HashMap<String, BackendFactory>,
}

impl BackendFactories {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in `file`, `http` and `git` backends.
    pub fn with_defaults() -> Self {
        let mut factories = Self::new();
        factories.register("file", |ctx| Ok(ctx.file.clone() as Arc<dyn Resolver>));
        factories.register("http", |ctx| {
            Ok(Arc::new(HttpResolver::new(ctx.cache_dir.clone(), ctx.file.clone())?)
                as Arc<dyn Resolver>)
        });
        factories.register("git", |ctx| {
            Ok(Arc::new(GitResolver::new(ctx.cache_dir.clone())) as Arc<dyn Resolver>)
        });
        factories
    }

    /// Register (or replace) a backend.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&BackendContext) -> ResolveResult<Arc<dyn Resolver>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn get(&self, name: &str) -> Option<&BackendFactory> {
        self.factories.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl std::fmt::Debug for BackendFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("BackendFactories").field("names", &names).finish()
    }
}

struct RegistryEntry {
    pattern: String,
    regex: Regex,
    backend: String,
    factory: BackendFactory,
    instance: OnceCell<Arc<dyn Resolver>>,
}

/// Ordered resolver entries plus the local fast path.
pub struct ResolverRegistry {
    entries: Vec<RegistryEntry>,
    context: BackendContext,
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field(
                "entries",
                &self
                    .entries
                    .iter()
                    .map(|e| (&e.pattern, &e.backend))
                    .collect::<Vec<_>>(),
            )
            .field("cache_dir", &self.context.cache_dir)
            .finish()
    }
}

/// `file:` locations and bare paths skip the entry table.
pub fn is_local(location: &str) -> bool {
    location.starts_with("file:") || !has_scheme(location)
}

impl ResolverRegistry {
    /// Build the registry, checking every pattern and backend name up front.
    pub fn new<'a>(
        defs: impl IntoIterator<Item = &'a ResolverDef>,
        factories: &BackendFactories,
        context: BackendContext,
    ) -> ConfigResult<Self> {
        let mut entries = Vec::new();
        for def in defs {
            let regex = Regex::new(&format!("^(?:{})$", def.pattern)).map_err(|e| {
                ConfigError::InvalidPattern {
                    pattern: def.pattern.clone(),
                    reason: e.to_string(),
                }
            })?;
            let factory = factories
                .get(&def.backend)
                .ok_or_else(|| ConfigError::UnknownBackend(def.backend.clone()))?
                .clone();
            entries.push(RegistryEntry {
                pattern: def.pattern.clone(),
                regex,
                backend: def.backend.clone(),
                factory,
                instance: OnceCell::new(),
            });
        }
        Ok(Self { entries, context })
    }

    /// The shared local file resolver.
    pub fn file(&self) -> &Arc<FileResolver> {
        &self.context.file
    }

    pub fn context(&self) -> &BackendContext {
        &self.context
    }

    /// Resolve one location.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn resolve(&self, location: &str) -> ResolveResult<Arc<dyn Filesystem>> {
        if is_local(location) {
            return self.context.file.resolve(location).await;
        }

        let entry = self
            .entries
            .iter()
            .find(|e| e.regex.is_match(location))
            .ok_or_else(|| ResolveError::NoResolver(location.to_string()))?;

        let backend = entry
            .instance
            .get_or_try_init(|| async {
                tracing::debug!(backend = %entry.backend, pattern = %entry.pattern, "creating resolver backend");
                (entry.factory)(&self.context)
            })
            .await?;
        backend.resolve(location).await
    }

    /// Resolve every location of one category; several become a union.
    pub async fn resolve_all(&self, locations: &[String]) -> ResolveResult<Arc<dyn Filesystem>> {
        if let [single] = locations {
            return self.resolve(single).await;
        }
        let mut members = Vec::with_capacity(locations.len());
        for location in locations {
            members.push(self.resolve(location).await?);
        }
        Ok(Arc::new(UnionFs::new(members)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryFs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Resolves every location to an empty filesystem tagged by backend name.
    struct Tagged {
        tag: &'static str,
    }

    #[async_trait]
    impl Resolver for Tagged {
        async fn resolve(&self, _location: &str) -> ResolveResult<Arc<dyn Filesystem>> {
            let fs = MemoryFs::new().with_file("backend", self.tag).unwrap();
            Ok(Arc::new(fs))
        }
    }

    fn def(pattern: &str, backend: &str) -> ResolverDef {
        ResolverDef {
            pattern: pattern.into(),
            backend: backend.into(),
        }
    }

    fn factories(counter: Arc<AtomicUsize>) -> BackendFactories {
        let mut f = BackendFactories::new();
        let git_counter = counter.clone();
        f.register("git", move |_| {
            git_counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Tagged { tag: "git" }) as Arc<dyn Resolver>)
        });
        f.register("http", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Tagged { tag: "http" }) as Arc<dyn Resolver>)
        });
        f
    }

    async fn tag_of(fs: Arc<dyn Filesystem>) -> String {
        let entry = fs.get("backend").await.unwrap().unwrap();
        String::from_utf8(entry.read().await.unwrap()).unwrap()
    }

    fn registry(defs: &[ResolverDef], counter: Arc<AtomicUsize>) -> ResolverRegistry {
        let dir = std::env::temp_dir();
        ResolverRegistry::new(defs, &factories(counter), BackendContext::new(dir)).unwrap()
    }

    #[tokio::test]
    async fn test_first_matching_entry_wins() {
        let reg = registry(
            &[def(r"^git\+.*", "git"), def(r"^https?://.*", "http")],
            Arc::default(),
        );
        let fs = reg.resolve("git+https://host/repo.git/main/").await.unwrap();
        assert_eq!(tag_of(fs).await, "git");
        let fs = reg.resolve("https://host/lib.zip").await.unwrap();
        assert_eq!(tag_of(fs).await, "http");
    }

    #[tokio::test]
    async fn test_pattern_must_match_whole_location() {
        let reg = registry(&[def("https://host", "http")], Arc::default());
        let err = reg.resolve("https://host/lib.zip").await.err().unwrap();
        assert_eq!(err, ResolveError::NoResolver("https://host/lib.zip".into()));
    }

    #[tokio::test]
    async fn test_backend_created_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let reg = Arc::new(registry(&[def(r"https?://.*", "http")], counter.clone()));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let reg = reg.clone();
            tasks.push(tokio::spawn(async move {
                reg.resolve(&format!("https://host/{}.zip", i)).await.map(|_| ())
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_backend_rejected_up_front() {
        let err = ResolverRegistry::new(
            &[def(".*", "ftp")],
            &BackendFactories::new(),
            BackendContext::new(std::env::temp_dir()),
        )
        .err()
        .unwrap();
        assert_eq!(err, ConfigError::UnknownBackend("ftp".into()));
    }

    #[tokio::test]
    async fn test_invalid_pattern_rejected() {
        let err = ResolverRegistry::new(
            &[def("(", "http")],
            &factories(Arc::default()),
            BackendContext::new(std::env::temp_dir()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[tokio::test]
    async fn test_local_fast_path_ignores_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        // a catch-all entry must not shadow local files
        let reg = registry(&[def(".*", "http")], Arc::default());
        let location = format!("file://{}/", dir.path().display());
        let fs = reg.resolve(&location).await.unwrap();
        assert!(fs.get("a.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_several_locations_union() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("one.txt"), "1").unwrap();
        std::fs::write(b.path().join("two.txt"), "2").unwrap();
        let reg = registry(&[], Arc::default());
        let fs = reg
            .resolve_all(&[
                format!("file://{}/", a.path().display()),
                format!("file://{}/", b.path().display()),
            ])
            .await
            .unwrap();
        assert!(fs.get("one.txt").await.unwrap().is_some());
        assert!(fs.get("two.txt").await.unwrap().is_some());
    }

    #[test]
    fn test_default_factories() {
        let f = BackendFactories::with_defaults();
        assert!(f.contains("file"));
        assert!(f.contains("http"));
        assert!(f.contains("git"));
    }
}
