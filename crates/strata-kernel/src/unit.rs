//! Loading units and resource lookup.
//!
//! A [`LoadingUnit`] is the built form of a module: its filesystem, the ids of
//! every module it can see (flattened, in first-discovery order), and the
//! [`Baseline`] it shares with all of them. Units refer to their dependencies
//! by id only; a [`UnitSource`] turns ids back into units.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::vfs::{Entry, Filesystem};

/// Scheme of resource locators handed out by units.
pub const LOCATOR_SCHEME: &str = "strata:";

/// The foundation every unit of a session is built on.
///
/// Baselines are compared by identity: two units share a baseline only when
/// they hold the same `Arc<Baseline>`.
pub struct Baseline {
    name: String,
    fs: Option<Arc<dyn Filesystem>>,
}

impl fmt::Debug for Baseline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Baseline")
            .field("name", &self.name)
            .field("has_fs", &self.fs.is_some())
            .finish()
    }
}

impl Baseline {
    /// A baseline without resources of its own.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            fs: None,
        })
    }

    /// A baseline whose resources are consulted before any unit's.
    pub fn with_fs(name: impl Into<String>, fs: Arc<dyn Filesystem>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            fs: Some(fs),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fs(&self) -> Option<&Arc<dyn Filesystem>> {
        self.fs.as_ref()
    }
}

/// Which location category a unit was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationCategory {
    /// Built artifacts.
    Artifacts,
    /// Sources, to be compiled by a loader.
    Sources,
}

impl LocationCategory {
    /// Name used in reports; matches the configuration key.
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationCategory::Artifacts => "locations",
            LocationCategory::Sources => "source_locations",
        }
    }
}

impl fmt::Display for LocationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A built module. Immutable once constructed.
pub struct LoadingUnit {
    id: String,
    fs: Arc<dyn Filesystem>,
    category: LocationCategory,
    loader: String,
    dependencies: Vec<String>,
    baseline: Arc<Baseline>,
}

impl fmt::Debug for LoadingUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadingUnit")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("loader", &self.loader)
            .field("dependencies", &self.dependencies)
            .field("baseline", &self.baseline.name)
            .finish()
    }
}

impl LoadingUnit {
    pub fn new(
        id: impl Into<String>,
        fs: Arc<dyn Filesystem>,
        category: LocationCategory,
        loader: impl Into<String>,
        dependencies: Vec<String>,
        baseline: Arc<Baseline>,
    ) -> Self {
        Self {
            id: id.into(),
            fs,
            category,
            loader: loader.into(),
            dependencies,
            baseline,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fs(&self) -> &Arc<dyn Filesystem> {
        &self.fs
    }

    pub fn category(&self) -> LocationCategory {
        self.category
    }

    /// Loader id, explicit or implied by the category.
    pub fn loader(&self) -> &str {
        &self.loader
    }

    /// Transitive dependency ids, duplicate-free, in first-discovery order.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn baseline(&self) -> &Arc<Baseline> {
        &self.baseline
    }

    /// Whether `other` was built on the same baseline.
    pub fn shares_baseline(&self, other: &LoadingUnit) -> bool {
        Arc::ptr_eq(&self.baseline, &other.baseline)
    }

    /// Locator for a path inside this unit.
    pub fn locator(&self, path: &str) -> String {
        format!("{}/{}/{}", LOCATOR_SCHEME, self.id, path)
    }
}

/// Looks up live units by id.
pub trait UnitSource: Send + Sync {
    fn lookup(&self, id: &str) -> Option<Arc<LoadingUnit>>;
}

/// Split a `strata:/<module>/<path>` locator.
pub fn parse_locator(locator: &str) -> Option<(&str, &str)> {
    let rest = locator.strip_prefix(LOCATOR_SCHEME)?.strip_prefix('/')?;
    let (module, path) = rest.split_once('/')?;
    (!module.is_empty()).then_some((module, path))
}

/// Where a resource was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceOrigin {
    Baseline,
    Module(String),
}

/// A file found through a unit's lookup order.
#[derive(Debug, Clone)]
pub struct Resource {
    pub origin: ResourceOrigin,
    pub path: String,
    pub entry: Entry,
}

impl Resource {
    /// The `strata:` locator, for resources that came from a module.
    pub fn locator(&self) -> Option<String> {
        match &self.origin {
            ResourceOrigin::Baseline => None,
            ResourceOrigin::Module(id) => Some(format!("{}/{}/{}", LOCATOR_SCHEME, id, self.path)),
        }
    }

    pub async fn read(&self) -> io::Result<Vec<u8>> {
        self.entry.read().await
    }
}

/// A unit together with its dependency units, resolved.
#[derive(Debug, Clone)]
pub struct UnitClosure {
    unit: Arc<LoadingUnit>,
    dependencies: Vec<Arc<LoadingUnit>>,
}

impl UnitClosure {
    pub fn new(unit: Arc<LoadingUnit>, dependencies: Vec<Arc<LoadingUnit>>) -> Self {
        Self { unit, dependencies }
    }

    /// Resolve the unit's dependency ids through `units`.
    ///
    /// Returns the first id `units` does not know as the error.
    pub fn resolve(unit: Arc<LoadingUnit>, units: &dyn UnitSource) -> Result<Self, String> {
        let dependencies = unit
            .dependencies()
            .iter()
            .map(|id| units.lookup(id).ok_or_else(|| id.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(unit, dependencies))
    }

    pub fn unit(&self) -> &Arc<LoadingUnit> {
        &self.unit
    }

    pub fn dependencies(&self) -> &[Arc<LoadingUnit>] {
        &self.dependencies
    }

    fn search_order(&self) -> impl Iterator<Item = (ResourceOrigin, &Arc<dyn Filesystem>)> {
        let baseline = self
            .unit
            .baseline()
            .fs()
            .map(|fs| (ResourceOrigin::Baseline, fs));
        let modules = self
            .dependencies
            .iter()
            .chain(std::iter::once(&self.unit))
            .map(|u| (ResourceOrigin::Module(u.id().to_string()), u.fs()));
        baseline.into_iter().chain(modules)
    }

    /// The first file named `path`: baseline, then dependencies, then the unit.
    pub async fn find_resource(&self, path: &str) -> io::Result<Option<Resource>> {
        for (origin, fs) in self.search_order() {
            if let Some(entry) = fs.get(path).await?
                && entry.is_file()
            {
                return Ok(Some(Resource {
                    origin,
                    path: path.to_string(),
                    entry,
                }));
            }
        }
        Ok(None)
    }

    /// Every file named `path`, in lookup order.
    pub async fn find_resources(&self, path: &str) -> io::Result<Vec<Resource>> {
        let mut found = Vec::new();
        for (origin, fs) in self.search_order() {
            if let Some(entry) = fs.get(path).await?
                && entry.is_file()
            {
                found.push(Resource {
                    origin,
                    path: path.to_string(),
                    entry,
                });
            }
        }
        Ok(found)
    }
}
