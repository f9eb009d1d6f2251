//! Registry of live loading units.
//!
//! Sessions register each unit they build and unregister them when dropped.
//! A registry is an ordinary value: pass the same `Arc<UnitRegistry>` to
//! several sessions to let them see each other's units, or give each session
//! its own.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, PoisonError, RwLock};

use crate::unit::{parse_locator, LoadingUnit, UnitSource};
use crate::vfs::Entry;

/// Live units keyed by module id.
#[derive(Default)]
pub struct UnitRegistry {
    units: RwLock<BTreeMap<String, Arc<LoadingUnit>>>,
}

impl std::fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitRegistry")
            .field("units", &self.ids())
            .finish()
    }
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit under its id, returning the unit it replaced.
    pub fn register(&self, unit: Arc<LoadingUnit>) -> Option<Arc<LoadingUnit>> {
        let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
        let previous = units.insert(unit.id().to_string(), unit);
        if let Some(previous) = &previous {
            tracing::warn!(module = previous.id(), "replacing registered unit");
        }
        previous
    }

    /// Remove `unit` if it is still the one registered under its id.
    pub fn unregister(&self, unit: &Arc<LoadingUnit>) -> bool {
        let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
        match units.get(unit.id()) {
            Some(current) if Arc::ptr_eq(current, unit) => {
                units.remove(unit.id());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<LoadingUnit>> {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.units.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the entry a `strata:/<module>/<path>` locator points at.
    ///
    /// Unknown modules and missing paths are `Ok(None)`; a string that is not
    /// a locator is `InvalidInput`.
    pub async fn locate(&self, locator: &str) -> io::Result<Option<Entry>> {
        let (module, path) = parse_locator(locator).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a unit locator: {}", locator),
            )
        })?;
        let Some(unit) = self.get(module) else {
            return Ok(None);
        };
        unit.fs().get(path).await
    }
}

impl UnitSource for UnitRegistry {
    fn lookup(&self, id: &str) -> Option<Arc<LoadingUnit>> {
        self.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Baseline, LocationCategory};
    use crate::vfs::MemoryFs;

    fn unit(id: &str) -> Arc<LoadingUnit> {
        let fs = MemoryFs::new().with_file("res/data.txt", id).unwrap();
        Arc::new(LoadingUnit::new(
            id,
            Arc::new(fs),
            LocationCategory::Artifacts,
            "default",
            Vec::new(),
            Baseline::new("system"),
        ))
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = UnitRegistry::new();
        let lib = unit("lib");
        assert!(registry.register(lib.clone()).is_none());
        assert_eq!(registry.ids(), vec!["lib"]);
        assert!(Arc::ptr_eq(&registry.get("lib").unwrap(), &lib));
        assert!(registry.unregister(&lib));
        assert!(registry.is_empty());
        assert!(!registry.unregister(&lib));
    }

    #[test]
    fn test_stale_unregister_keeps_replacement() {
        let registry = UnitRegistry::new();
        let old = unit("lib");
        let new = unit("lib");
        registry.register(old.clone());
        let replaced = registry.register(new.clone()).unwrap();
        assert!(Arc::ptr_eq(&replaced, &old));
        assert!(!registry.unregister(&old));
        assert!(Arc::ptr_eq(&registry.get("lib").unwrap(), &new));
    }

    #[tokio::test]
    async fn test_locate() {
        let registry = UnitRegistry::new();
        registry.register(unit("lib"));

        let entry = registry.locate("strata:/lib/res/data.txt").await.unwrap().unwrap();
        assert_eq!(entry.read().await.unwrap(), b"lib");
        assert!(registry.locate("strata:/lib/missing").await.unwrap().is_none());
        assert!(registry.locate("strata:/other/res/data.txt").await.unwrap().is_none());

        let err = registry.locate("file:///lib").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_separate_registries_do_not_leak() {
        let a = UnitRegistry::new();
        let b = UnitRegistry::new();
        a.register(unit("lib"));
        assert!(b.get("lib").is_none());
    }
}
