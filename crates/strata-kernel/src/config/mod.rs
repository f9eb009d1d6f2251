//! Declarative configuration layers.
//!
//! A layer is one TOML file. Several layers are merged by priority into a
//! [`MergedConfig`]; see the `merge` module for the rules.
//!
//! ```toml
//! [entry_point]
//! module = "app"
//! artifact = "main"
//!
//! [[module]]
//! id = "app"
//! source_locations = ["src/"]
//! dependencies = ["lib"]
//!
//! [[module]]
//! id = "lib"
//! locations = ["${LIB_HOME:https://example.com}/lib.zip"]
//!
//! [[resolver]]
//! pattern = "https?://.*"
//! backend = "http"
//!
//! [[rewrite]]
//! pattern = "https://example.com/{path:.*}"
//! replacement = "https://mirror.local/{path}"
//! ```
//!
//! `${NAME}` and `${NAME:default}` are replaced from the environment before
//! parsing. Module locations without a scheme are relative to the directory
//! holding the layer file.

mod merge;

pub use merge::MergedConfig;

use std::path::Path;

use anyhow::{Context, Result};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

/// Which module and artifact the `run` action starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub module: String,
    pub artifact: String,
}

/// One declared module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub id: String,

    /// Built-artifact locations, preferred when present.
    #[serde(default)]
    pub locations: Vec<String>,

    /// Source locations, used when there are no artifact locations.
    #[serde(default)]
    pub source_locations: Vec<String>,

    /// Loader strategy id; defaults depend on which locations are used.
    #[serde(default)]
    pub loader: Option<String>,

    /// Ids of the modules this one depends on, in order.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl ModuleDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            locations: Vec::new(),
            source_locations: Vec::new(),
            loader: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.locations.push(location.into());
        self
    }

    pub fn with_source_location(mut self, location: impl Into<String>) -> Self {
        self.source_locations.push(location.into());
        self
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_loader(mut self, id: impl Into<String>) -> Self {
        self.loader = Some(id.into());
        self
    }
}

/// Maps a loader id to a registered loader strategy kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderDef {
    pub id: String,
    pub kind: String,
}

/// Routes locations matching `pattern` to the named resolver backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverDef {
    pub pattern: String,
    pub backend: String,
}

/// A location rewrite rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteDef {
    pub pattern: String,
    pub replacement: String,
}

/// Maps an action name to an action kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDef {
    pub id: String,
    pub kind: String,
}

/// One configuration source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigLayer {
    #[serde(default)]
    pub entry_point: Option<EntryPoint>,

    #[serde(default, rename = "module")]
    pub modules: Vec<ModuleDescriptor>,

    #[serde(default, rename = "loader")]
    pub loaders: Vec<LoaderDef>,

    #[serde(default, rename = "resolver")]
    pub resolvers: Vec<ResolverDef>,

    #[serde(default, rename = "rewrite")]
    pub rewrites: Vec<RewriteDef>,

    #[serde(default, rename = "action")]
    pub actions: Vec<ActionDef>,
}

impl ConfigLayer {
    /// Parse a layer, substituting variables from the process environment.
    pub fn parse(text: &str) -> Result<Self> {
        let text = substitute_variables(text, |name| std::env::var(name).ok())?;
        toml::from_str(&text).context("Failed to parse config layer")
    }

    /// Load a layer file and anchor its relative locations at its directory.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let content = substitute_variables(&content, |name| std::env::var(name).ok())?;
        let mut layer: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        let path = std::path::absolute(path)
            .with_context(|| format!("Failed to resolve {}", path.display()))?;
        if let Some(dir) = path.parent() {
            layer.resolve_relative(dir);
        }
        tracing::debug!(
            "Loaded config layer {} ({} modules)",
            path.display(),
            layer.modules.len()
        );
        Ok(layer)
    }

    /// Turn scheme-less module locations into `file://` locations below `dir`.
    pub fn resolve_relative(&mut self, dir: &Path) {
        for module in &mut self.modules {
            for location in module
                .locations
                .iter_mut()
                .chain(module.source_locations.iter_mut())
            {
                if !has_scheme(location) {
                    *location = file_location(&dir.join(location.as_str()), location.ends_with('/'));
                }
            }
        }
    }
}

/// Whether a location starts with a URI scheme such as `file:` or `git+https:`.
pub fn has_scheme(location: &str) -> bool {
    let Some((scheme, _)) = location.split_once(':') else {
        return false;
    };
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// A `file://` location for a host path.
pub fn file_location(path: &Path, directory: bool) -> String {
    let mut location = format!("file://{}", path.display());
    if directory && !location.ends_with('/') {
        location.push('/');
    }
    location
}

/// Replace `${NAME}` and `${NAME:default}` using `lookup`.
///
/// A variable that `lookup` does not know and that has no default is left
/// as written.
pub fn substitute_variables(
    text: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String> {
    let variable = Regex::new(r"\$\{(.+?)(?::(.*?))?\}").context("Invalid variable pattern")?;
    let replaced = variable.replace_all(text, |caps: &Captures<'_>| {
        let name = &caps[1];
        match lookup(name) {
            Some(value) => value,
            None => caps
                .get(2)
                .map(|default| default.as_str().to_string())
                .unwrap_or_else(|| caps[0].to_string()),
        }
    });
    Ok(replaced.into_owned())
}
