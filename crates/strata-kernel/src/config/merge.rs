//! Layer merging.
//!
//! Layers are given highest priority first. Within each category the first
//! layer to define an identity keeps it: modules, loaders and actions are
//! keyed by id, resolvers and rewrite rules by pattern. A lower layer never
//! patches individual fields of a higher layer's entry.

use std::path::PathBuf;

use anyhow::{Context, Result};
use indexmap::IndexMap;

use super::{ActionDef, ConfigLayer, EntryPoint, LoaderDef, ModuleDescriptor, ResolverDef, RewriteDef};
use crate::error::ConfigResult;
use crate::rewrite::RewriteEngine;

/// The effective configuration of a session.
#[derive(Debug, Clone, Default)]
pub struct MergedConfig {
    pub entry_point: Option<EntryPoint>,
    pub modules: IndexMap<String, ModuleDescriptor>,
    pub loaders: IndexMap<String, LoaderDef>,
    pub resolvers: IndexMap<String, ResolverDef>,
    pub rewrites: IndexMap<String, RewriteDef>,
    pub actions: IndexMap<String, ActionDef>,
}

impl MergedConfig {
    /// Merge layers, highest priority first.
    pub fn merge<'a>(layers: impl IntoIterator<Item = &'a ConfigLayer>) -> Self {
        let mut merged = Self::default();
        for layer in layers {
            for module in &layer.modules {
                merged
                    .modules
                    .entry(module.id.clone())
                    .or_insert_with(|| module.clone());
            }
            for loader in &layer.loaders {
                merged
                    .loaders
                    .entry(loader.id.clone())
                    .or_insert_with(|| loader.clone());
            }
            for resolver in &layer.resolvers {
                merged
                    .resolvers
                    .entry(resolver.pattern.clone())
                    .or_insert_with(|| resolver.clone());
            }
            for rewrite in &layer.rewrites {
                merged
                    .rewrites
                    .entry(rewrite.pattern.clone())
                    .or_insert_with(|| rewrite.clone());
            }
            for action in &layer.actions {
                merged
                    .actions
                    .entry(action.id.clone())
                    .or_insert_with(|| action.clone());
            }
            if merged.entry_point.is_none() {
                merged.entry_point = layer.entry_point.clone();
            }
        }
        merged
    }

    /// Load layer files (highest priority first), merge and rewrite them.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let layers = paths
            .iter()
            .map(|path| ConfigLayer::load_from(path))
            .collect::<Result<Vec<_>>>()?;
        let mut merged = Self::merge(&layers);
        merged
            .apply_rewrites()
            .context("Failed to rewrite module locations")?;
        Ok(merged)
    }

    /// Compile the merged rewrite rules in order.
    pub fn rewrite_engine(&self) -> ConfigResult<RewriteEngine> {
        RewriteEngine::compile(
            self.rewrites
                .values()
                .map(|r| (r.pattern.as_str(), r.replacement.as_str())),
        )
    }

    /// Pass every module location through the rewrite rules.
    pub fn apply_rewrites(&mut self) -> ConfigResult<()> {
        let engine = self.rewrite_engine()?;
        if engine.is_empty() {
            return Ok(());
        }
        for module in self.modules.values_mut() {
            for location in module
                .locations
                .iter_mut()
                .chain(module.source_locations.iter_mut())
            {
                let rewritten = engine.rewrite(location)?;
                if rewritten != *location {
                    tracing::debug!(module = %module.id, from = %location, to = %rewritten, "rewrote location");
                    *location = rewritten;
                }
            }
        }
        Ok(())
    }

    pub fn module(&self, id: &str) -> Option<&ModuleDescriptor> {
        self.modules.get(id)
    }

    /// Add a module unless one with the same id exists. Returns whether it was added.
    pub fn add_module(&mut self, module: ModuleDescriptor) -> bool {
        if self.modules.contains_key(&module.id) {
            return false;
        }
        self.modules.insert(module.id.clone(), module);
        true
    }
}

impl From<ConfigLayer> for MergedConfig {
    fn from(layer: ConfigLayer) -> Self {
        Self::merge(std::iter::once(&layer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    fn layer(toml_text: &str) -> ConfigLayer {
        toml::from_str(toml_text).unwrap()
    }

    #[test]
    fn test_higher_layer_keeps_whole_module() {
        let high = layer(
            r#"
[[module]]
id = "app"
locations = ["file:///high/"]
"#,
        );
        let low = layer(
            r#"
[[module]]
id = "app"
locations = ["file:///low/"]
dependencies = ["lib"]
loader = "custom"

[[module]]
id = "lib"
locations = ["file:///lib.zip"]
"#,
        );
        let merged = MergedConfig::merge([&high, &low]);
        let app = merged.module("app").unwrap();
        assert_eq!(app.locations, vec!["file:///high/"]);
        assert!(app.dependencies.is_empty());
        assert!(app.loader.is_none());
        assert!(merged.module("lib").is_some());
        assert_eq!(merged.modules.keys().collect::<Vec<_>>(), vec!["app", "lib"]);
    }

    #[test]
    fn test_first_entry_point_wins() {
        let high = layer("[[module]]\nid = \"x\"\n");
        let mid = layer("[entry_point]\nmodule = \"app\"\nartifact = \"main\"\n");
        let low = layer("[entry_point]\nmodule = \"other\"\nartifact = \"start\"\n");
        let merged = MergedConfig::merge([&high, &mid, &low]);
        assert_eq!(merged.entry_point.unwrap().module, "app");
    }

    #[test]
    fn test_resolvers_keyed_by_pattern() {
        let high = layer("[[resolver]]\npattern = \"https?://.*\"\nbackend = \"http\"\n");
        let low = layer(
            "[[resolver]]\npattern = \"https?://.*\"\nbackend = \"other\"\n\n[[resolver]]\npattern = \"git\\\\+.*\"\nbackend = \"git\"\n",
        );
        let merged = MergedConfig::merge([&high, &low]);
        let backends: Vec<_> = merged.resolvers.values().map(|r| r.backend.as_str()).collect();
        assert_eq!(backends, vec!["http", "git"]);
    }

    #[test]
    fn test_rewrites_apply_to_both_categories() {
        let mut merged: MergedConfig = layer(
            r#"
[[module]]
id = "lib"
locations = ["http://old/lib.zip"]
source_locations = ["http://old/src/"]

[[rewrite]]
pattern = "http://old/"
replacement = "file:///mirror/"
"#,
        )
        .into();
        merged.apply_rewrites().unwrap();
        let lib = merged.module("lib").unwrap();
        assert_eq!(lib.locations, vec!["file:///mirror/lib.zip"]);
        assert_eq!(lib.source_locations, vec!["file:///mirror/src/"]);
    }

    #[test]
    fn test_rewrite_cycle_fails_merge() {
        let mut merged: MergedConfig = layer(
            r#"
[[module]]
id = "lib"
locations = ["a"]

[[rewrite]]
pattern = "a"
replacement = "b"

[[rewrite]]
pattern = "b"
replacement = "a"
"#,
        )
        .into();
        let err = merged.apply_rewrites().unwrap_err();
        assert!(matches!(err, ConfigError::RewriteLoop { .. }));
    }

    #[test]
    fn test_load_merges_files_in_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app.toml");
        let base = dir.path().join("base.toml");
        std::fs::write(&app, "[entry_point]\nmodule = \"app\"\nartifact = \"main\"\n\n[[module]]\nid = \"app\"\nsource_locations = [\"src/\"]\n").unwrap();
        std::fs::write(&base, "[[module]]\nid = \"app\"\nlocations = [\"other/\"]\n\n[[module]]\nid = \"lib\"\nlocations = [\"lib.zip\"]\n").unwrap();

        let merged = MergedConfig::load(&[app, base]).unwrap();
        let app = merged.module("app").unwrap();
        assert!(app.locations.is_empty());
        assert!(app.source_locations[0].ends_with("/src/"));
        assert!(merged.module("lib").unwrap().locations[0].starts_with("file://"));
    }
}
