//! Loader strategies.
//!
//! A loader strategy turns a built unit (with its dependencies) into a
//! [`CodeSource`] the execution host can pull artifacts from. Strategies are
//! registered by kind; configuration maps loader ids to kinds with
//! `[[loader]]` entries. Without an entry, an id names the kind directly.
//!
//! | Loader id | Kind | Registered by |
//! |-----------|------|---------------|
//! | `default` | `artifact` | built in |
//! | `source` | `source` | the embedder (compilation is external) |

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::config::LoaderDef;
use crate::error::{ConfigError, ConfigResult};
use crate::unit::{Resource, UnitClosure};

/// Loader id of units resolved from artifact locations.
pub const DEFAULT_LOADER: &str = "default";

/// Loader id implied by units resolved from source locations.
pub const SOURCE_LOADER: &str = "source";

/// Kind of the built-in artifact strategy.
pub const ARTIFACT_KIND: &str = "artifact";

/// Where the execution host gets executable artifacts from.
#[async_trait]
pub trait CodeSource: Send + Sync {
    /// The unit and dependencies this source serves.
    fn closure(&self) -> &UnitClosure;

    /// Bytes of the named artifact, if any unit in the closure has it.
    async fn artifact(&self, name: &str) -> io::Result<Option<Vec<u8>>>;

    /// Find a resource by path in the closure's lookup order.
    async fn resource(&self, path: &str) -> io::Result<Option<Resource>> {
        self.closure().find_resource(path).await
    }
}

/// Produces code sources for units.
pub trait LoaderStrategy: Send + Sync {
    fn code_source(&self, closure: UnitClosure) -> anyhow::Result<Arc<dyn CodeSource>>;
}

/// Serves artifacts straight from the units' filesystems.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArtifactLoader;

impl LoaderStrategy for ArtifactLoader {
    fn code_source(&self, closure: UnitClosure) -> anyhow::Result<Arc<dyn CodeSource>> {
        Ok(Arc::new(ArtifactSource { closure }))
    }
}

struct ArtifactSource {
    closure: UnitClosure,
}

#[async_trait]
impl CodeSource for ArtifactSource {
    fn closure(&self) -> &UnitClosure {
        &self.closure
    }

    async fn artifact(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        match self.closure.find_resource(name).await? {
            Some(resource) => resource.read().await.map(Some),
            None => Ok(None),
        }
    }
}

/// Strategies keyed by kind.
#[derive(Clone, Default)]
pub struct LoaderRegistry {
    strategies: HashMap<String, Arc<dyn LoaderStrategy>>,
}

impl std::fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.strategies.keys().collect();
        kinds.sort();
        f.debug_struct("LoaderRegistry").field("kinds", &kinds).finish()
    }
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `artifact` strategy.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ARTIFACT_KIND, ArtifactLoader);
        registry
    }

    /// Register (or replace) the strategy for a kind.
    pub fn register(&mut self, kind: impl Into<String>, strategy: impl LoaderStrategy + 'static) {
        self.strategies.insert(kind.into(), Arc::new(strategy));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.strategies.contains_key(kind)
    }

    /// The strategy a loader id refers to.
    pub fn strategy_for(
        &self,
        id: &str,
        defs: &IndexMap<String, LoaderDef>,
    ) -> ConfigResult<Arc<dyn LoaderStrategy>> {
        let kind = match defs.get(id) {
            Some(def) => def.kind.as_str(),
            None if id == DEFAULT_LOADER => ARTIFACT_KIND,
            None => id,
        };
        self.strategies
            .get(kind)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownLoader(id.to_string()))
    }
}
