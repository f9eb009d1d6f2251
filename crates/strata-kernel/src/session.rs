//! Sessions: the module graph of one effective configuration.
//!
//! A [`Session`] owns the resolver registry, the loader strategies and the
//! units built so far. Each module id is in one of three states:
//!
//! - absent: never requested, or its last build failed
//! - in progress: its build is on the current stack
//! - built: a [`LoadingUnit`] exists and is returned as is
//!
//! Builds are serialized per session, so two concurrent requests for the same
//! id never both resolve it. Requesting an in-progress id is a cycle.
//!
//! ```text
//! unit("app")
//!   ├── unit("lib")            depth first, in declared order
//!   │     └── resolve locations
//!   ├── check baselines
//!   └── resolve locations → LoadingUnit { deps: [.., "lib"] }
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use indexmap::{IndexMap, IndexSet};
use tokio::sync::{Mutex, MutexGuard};

use crate::config::{MergedConfig, ModuleDescriptor};
use crate::error::{BuildError, BuildResult, ConfigError, ConfigResult};
use crate::loader::{CodeSource, LoaderRegistry, LoaderStrategy, DEFAULT_LOADER, SOURCE_LOADER};
use crate::registry::UnitRegistry;
use crate::resolver::{BackendContext, BackendFactories, Resolver, ResolverRegistry};
use crate::unit::{Baseline, LoadingUnit, LocationCategory, Resource, UnitClosure, UnitSource};

/// Options for a session, independent of the module configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name of this session (for logs).
    pub name: String,

    /// Baseline every unit of the session is built on.
    pub baseline: Arc<Baseline>,

    /// Root of the download and mirror cache.
    pub cache_dir: PathBuf,

    /// Registry to publish built units to. A private one when `None`.
    pub registry: Option<Arc<UnitRegistry>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            baseline: Baseline::new("system"),
            cache_dir: crate::paths::cache_dir(),
            registry: None,
        }
    }
}

impl SessionConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_baseline(mut self, baseline: Arc<Baseline>) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    pub fn with_registry(mut self, registry: Arc<UnitRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }
}

/// Assembles a [`Session`] with extra backends or loader strategies.
pub struct SessionBuilder {
    config: MergedConfig,
    options: SessionConfig,
    factories: BackendFactories,
    loaders: LoaderRegistry,
}

impl SessionBuilder {
    pub fn new(config: MergedConfig) -> Self {
        Self {
            config,
            options: SessionConfig::default(),
            factories: BackendFactories::with_defaults(),
            loaders: LoaderRegistry::with_defaults(),
        }
    }

    pub fn options(mut self, options: SessionConfig) -> Self {
        self.options = options;
        self
    }

    /// Register a resolver backend under `name`.
    pub fn backend<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&BackendContext) -> crate::error::ResolveResult<Arc<dyn Resolver>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.register(name, factory);
        self
    }

    /// Replace the whole backend map.
    pub fn backends(mut self, factories: BackendFactories) -> Self {
        self.factories = factories;
        self
    }

    /// Register a loader strategy kind.
    pub fn loader(mut self, kind: impl Into<String>, strategy: impl LoaderStrategy + 'static) -> Self {
        self.loaders.register(kind, strategy);
        self
    }

    /// Check the configuration's resolver entries and create the session.
    pub fn build(self) -> ConfigResult<Session> {
        let context = BackendContext::new(self.options.cache_dir.clone());
        let resolver =
            ResolverRegistry::new(self.config.resolvers.values(), &self.factories, context)?;
        let registry = self.options.registry.unwrap_or_default();
        tracing::debug!(
            session = %self.options.name,
            modules = self.config.modules.len(),
            "session created"
        );
        Ok(Session {
            name: self.options.name,
            baseline: self.options.baseline,
            config: self.config,
            resolver,
            loaders: self.loaders,
            registry,
            in_progress: Mutex::new(HashSet::new()),
            units: RwLock::new(IndexMap::new()),
        })
    }
}

type BuildFuture<'a> = Pin<Box<dyn Future<Output = BuildResult<Arc<LoadingUnit>>> + Send + 'a>>;

/// The held build lock. Markers left behind when a build is dropped part
/// way through (a caller-side timeout) are cleared on release.
struct BuildGuard<'a>(MutexGuard<'a, HashSet<String>>);

impl std::ops::Deref for BuildGuard<'_> {
    type Target = HashSet<String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for BuildGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        // only one top-level build holds the lock, so every marker is ours
        self.0.clear();
    }
}

/// The module graph of one configuration.
///
/// Units built by a session are registered in its [`UnitRegistry`] and
/// unregistered when the session is dropped.
pub struct Session {
    name: String,
    baseline: Arc<Baseline>,
    config: MergedConfig,
    resolver: ResolverRegistry,
    loaders: LoaderRegistry,
    registry: Arc<UnitRegistry>,
    /// Ids whose build is on the stack. Held for the whole of a build.
    in_progress: Mutex<HashSet<String>>,
    /// Built units, in build order.
    units: RwLock<IndexMap<String, Arc<LoadingUnit>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("baseline", &self.baseline.name())
            .field("built", &self.built_ids())
            .finish()
    }
}

impl Session {
    /// A session with the default backends and loaders.
    pub fn new(config: MergedConfig, options: SessionConfig) -> ConfigResult<Self> {
        SessionBuilder::new(config).options(options).build()
    }

    pub fn builder(config: MergedConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &MergedConfig {
        &self.config
    }

    pub fn baseline(&self) -> &Arc<Baseline> {
        &self.baseline
    }

    pub fn resolver(&self) -> &ResolverRegistry {
        &self.resolver
    }

    pub fn loaders(&self) -> &LoaderRegistry {
        &self.loaders
    }

    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }

    /// The unit for `id` if this session already built it.
    pub fn built(&self, id: &str) -> Option<Arc<LoadingUnit>> {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Ids built so far, in build order.
    pub fn built_ids(&self) -> Vec<String> {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Ids currently being built. Waits for a running build to finish.
    pub async fn in_progress(&self) -> Vec<String> {
        self.in_progress.lock().await.iter().cloned().collect()
    }

    /// Build (or return) the unit for a module id.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.name))]
    pub async fn unit(&self, id: &str) -> BuildResult<Arc<LoadingUnit>> {
        if let Some(unit) = self.built(id) {
            return Ok(unit);
        }
        let mut in_progress = BuildGuard(self.in_progress.lock().await);
        self.build_locked(&mut in_progress, id).await
    }

    fn build_locked<'a>(
        &'a self,
        in_progress: &'a mut HashSet<String>,
        id: &'a str,
    ) -> BuildFuture<'a> {
        Box::pin(async move {
            if let Some(unit) = self.built(id) {
                return Ok(unit);
            }
            if in_progress.contains(id) {
                return Err(BuildError::CyclicDependency {
                    module: id.to_string(),
                });
            }
            let Some(descriptor) = self.config.module(id) else {
                // not ours: a unit some other session published
                return self
                    .registry
                    .get(id)
                    .ok_or_else(|| ConfigError::UnknownModule(id.to_string()).into());
            };

            in_progress.insert(id.to_string());
            let result = self.construct(in_progress, descriptor).await;
            in_progress.remove(id);
            let unit = Arc::new(result?);

            self.units
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id.to_string(), unit.clone());
            self.registry.register(unit.clone());
            tracing::info!(
                module = id,
                category = %unit.category(),
                dependencies = unit.dependencies().len(),
                "built unit"
            );
            Ok(unit)
        })
    }

    async fn construct(
        &self,
        in_progress: &mut HashSet<String>,
        descriptor: &ModuleDescriptor,
    ) -> BuildResult<LoadingUnit> {
        let id = descriptor.id.as_str();

        let mut dependencies = IndexSet::new();
        for dependency_id in &descriptor.dependencies {
            let dependency = self.build_locked(in_progress, dependency_id).await?;
            if !Arc::ptr_eq(dependency.baseline(), &self.baseline) {
                return Err(ConfigError::BaselineMismatch {
                    module: id.to_string(),
                    dependency: dependency_id.clone(),
                }
                .into());
            }
            dependencies.extend(dependency.dependencies().iter().cloned());
            dependencies.insert(dependency.id().to_string());
        }

        let (locations, category, implied_loader) = if !descriptor.locations.is_empty() {
            (&descriptor.locations, LocationCategory::Artifacts, DEFAULT_LOADER)
        } else if !descriptor.source_locations.is_empty() {
            (&descriptor.source_locations, LocationCategory::Sources, SOURCE_LOADER)
        } else {
            return Err(ConfigError::NoLocations(id.to_string()).into());
        };

        let loader = match &descriptor.loader {
            Some(explicit) => {
                self.loaders.strategy_for(explicit, &self.config.loaders)?;
                explicit.clone()
            }
            None => implied_loader.to_string(),
        };

        let fs = self
            .resolver
            .resolve_all(locations)
            .await
            .map_err(|source| BuildError::Resolution {
                module: id.to_string(),
                source,
            })?;

        Ok(LoadingUnit::new(
            id,
            fs,
            category,
            loader,
            dependencies.into_iter().collect(),
            self.baseline.clone(),
        ))
    }

    /// Build `id` and pair it with its dependency units.
    pub async fn closure(&self, id: &str) -> BuildResult<UnitClosure> {
        let unit = self.unit(id).await?;
        UnitClosure::resolve(unit, self)
            .map_err(|missing| ConfigError::UnknownModule(missing).into())
    }

    /// A code source for `id` from its loader strategy.
    pub async fn code_source(&self, id: &str) -> anyhow::Result<Arc<dyn CodeSource>> {
        let closure = self.closure(id).await?;
        let loader = closure.unit().loader().to_string();
        let strategy = self.loaders.strategy_for(&loader, &self.config.loaders)?;
        strategy
            .code_source(closure)
            .with_context(|| format!("loader {} failed for module {}", loader, id))
    }

    /// The first file named `path` visible to module `id`.
    pub async fn find_resource(&self, id: &str, path: &str) -> anyhow::Result<Option<Resource>> {
        let closure = self.closure(id).await?;
        Ok(closure.find_resource(path).await?)
    }

    /// Every file named `path` visible to module `id`, in lookup order.
    pub async fn find_resources(&self, id: &str, path: &str) -> anyhow::Result<Vec<Resource>> {
        let closure = self.closure(id).await?;
        Ok(closure.find_resources(path).await?)
    }
}

impl UnitSource for Session {
    fn lookup(&self, id: &str) -> Option<Arc<LoadingUnit>> {
        self.built(id).or_else(|| self.registry.get(id))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let units = self.units.get_mut().unwrap_or_else(PoisonError::into_inner);
        for unit in units.values() {
            self.registry.unregister(unit);
        }
    }
}
