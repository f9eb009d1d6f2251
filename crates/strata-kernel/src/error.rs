//! Error types for configuration, resolution and module builds.

use thiserror::Error;

/// Result type for configuration checks.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type for resolver operations.
pub type ResolveResult<T> = Result<T, ResolveError>;

/// Result type for module builds.
pub type BuildResult<T> = Result<T, BuildError>;

/// The configuration names something that does not exist or cannot work.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown module: {0}")]
    UnknownModule(String),
    #[error("unknown loader: {0}")]
    UnknownLoader(String),
    #[error("unknown resolver backend: {0}")]
    UnknownBackend(String),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("rewrite of {location:?} did not settle after {passes} passes")]
    RewriteLoop { location: String, passes: usize },
    #[error("module {module} depends on {dependency}, which has a different baseline")]
    BaselineMismatch { module: String, dependency: String },
    #[error("module {0} has no locations")]
    NoLocations(String),
    #[error("no entry point configured")]
    NoEntryPoint,
}

/// A location could not be turned into a filesystem.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no resolver found for {0}")]
    NoResolver(String),
    #[error("location not found: {0}")]
    NotFound(String),
    #[error("unsupported location: {0}")]
    Unsupported(String),
    #[error("invalid location {location}: {reason}")]
    InvalidLocation { location: String, reason: String },
    #[error("io error at {location}: {message}")]
    Io { location: String, message: String },
    #[error("{backend} backend failed for {location}: {message}")]
    Backend {
        backend: &'static str,
        location: String,
        message: String,
    },
}

impl ResolveError {
    pub(crate) fn io(location: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return ResolveError::NotFound(location.to_string());
        }
        ResolveError::Io {
            location: location.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn backend(backend: &'static str, location: &str, err: impl std::fmt::Display) -> Self {
        ResolveError::Backend {
            backend,
            location: location.to_string(),
            message: err.to_string(),
        }
    }
}

/// Building a loading unit failed.
///
/// A failed build leaves no trace in the session; the same id may be
/// requested again.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cyclic dependency involving module {module}")]
    CyclicDependency { module: String },
    #[error("cannot resolve module {module}: {source}")]
    Resolution {
        module: String,
        #[source]
        source: ResolveError,
    },
}

impl BuildError {
    /// The module the error is about, when there is one.
    pub fn module(&self) -> Option<&str> {
        match self {
            BuildError::CyclicDependency { module } | BuildError::Resolution { module, .. } => {
                Some(module)
            }
            BuildError::Config(ConfigError::UnknownModule(module))
            | BuildError::Config(ConfigError::NoLocations(module))
            | BuildError::Config(ConfigError::BaselineMismatch { module, .. }) => Some(module),
            BuildError::Config(_) => None,
        }
    }
}
