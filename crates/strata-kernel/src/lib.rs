//! strata-kernel: module graphs over virtual filesystems.
//!
//! This crate provides:
//!
//! - **VFS**: one read-only filesystem contract over directories, zip
//!   archives, git trees and in-memory trees, plus a union of several
//! - **Resolver**: turns location strings into filesystems through a
//!   pattern-keyed registry of backends (`file`, `http`, `git`)
//! - **Rewrite**: `{name:pattern}` rules that rewrite locations before use
//! - **Config**: TOML layers merged by priority
//! - **Session**: builds loading units from module declarations, depth first,
//!   with cycle and baseline checks
//! - **Loader / Actions**: code sources for the execution host, and the
//!   `run` and `modules` actions
//! - **Paths**: XDG cache location and cache keys

pub mod actions;
pub mod config;
pub mod error;
pub mod loader;
pub mod paths;
pub mod registry;
pub mod resolver;
pub mod rewrite;
pub mod session;
pub mod unit;
pub mod vfs;

pub use actions::{Action, Actions, ExecutionHost, Invocation, ModulesAction, RunAction};
pub use config::{ConfigLayer, MergedConfig, ModuleDescriptor};
pub use error::{BuildError, BuildResult, ConfigError, ConfigResult, ResolveError, ResolveResult};
pub use loader::{ArtifactLoader, CodeSource, LoaderRegistry, LoaderStrategy};
pub use registry::UnitRegistry;
pub use resolver::{BackendContext, BackendFactories, Resolver, ResolverRegistry};
pub use rewrite::{RewriteEngine, RewriteRule};
pub use session::{Session, SessionBuilder, SessionConfig};
pub use unit::{Baseline, LoadingUnit, LocationCategory, Resource, UnitClosure};
pub use vfs::{Entry, Filesystem};

// Cache path primitives (embedders pick their own cache root)
pub use paths::{cache_dir, cache_key};
