//! Named actions and argument splitting.
//!
//! A command line is split into leading options, an action name and the
//! action's own arguments:
//!
//! ```text
//! strata -v --offline modules --output-file report.txt
//!        └── options ───┘ └─ action ┘ └─── action args ───┘
//! ```
//!
//! The action name defaults to `run`. `[[action]]` entries map names to
//! action kinds; `run` and `modules` are always available.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use indexmap::IndexMap;

use crate::config::ActionDef;
use crate::error::{ConfigError, ConfigResult};
use crate::loader::CodeSource;
use crate::session::Session;
use crate::unit::LocationCategory;

/// Kind of the action that starts the entry point.
pub const RUN_ACTION: &str = "run";

/// Kind of the action that reports module fingerprints.
pub const MODULES_ACTION: &str = "modules";

/// A split command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Arguments starting with `-` before the action name.
    pub options: Vec<String>,
    pub action: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = args.into_iter().map(Into::into).peekable();
        let mut options = Vec::new();
        while let Some(option) = args.next_if(|a: &String| a.starts_with('-')) {
            options.push(option);
        }
        let action = args.next().unwrap_or_else(|| RUN_ACTION.to_string());
        Self {
            options,
            action,
            args: args.collect(),
        }
    }
}

/// Runs an artifact obtained from a code source.
#[async_trait]
pub trait ExecutionHost: Send + Sync {
    async fn execute(&self, source: Arc<dyn CodeSource>, artifact: &str, args: &[String]) -> Result<()>;
}

/// Something a command line can ask a session to do.
#[async_trait]
pub trait Action: Send + Sync {
    async fn execute(&self, session: &Session, args: &[String]) -> Result<()>;
}

/// Builds the entry point's module and hands its artifact to the host.
pub struct RunAction {
    host: Arc<dyn ExecutionHost>,
}

impl RunAction {
    pub fn new(host: Arc<dyn ExecutionHost>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Action for RunAction {
    async fn execute(&self, session: &Session, args: &[String]) -> Result<()> {
        let entry = session
            .config()
            .entry_point
            .clone()
            .ok_or(ConfigError::NoEntryPoint)?;
        let source = session
            .code_source(&entry.module)
            .await
            .with_context(|| format!("Failed to load module {}", entry.module))?;
        tracing::info!(module = %entry.module, artifact = %entry.artifact, "running entry point");
        self.host.execute(source, &entry.artifact, args).await
    }
}

/// Prints `<id> <category> [<locations>] -> <fingerprint>` for every
/// fingerprintable module location category.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModulesAction;

impl ModulesAction {
    /// Report lines in configuration order.
    pub async fn report(session: &Session) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for module in session.config().modules.values() {
            for (category, locations) in [
                (LocationCategory::Artifacts, &module.locations),
                (LocationCategory::Sources, &module.source_locations),
            ] {
                if locations.is_empty() {
                    continue;
                }
                let fs = session
                    .resolver()
                    .resolve_all(locations)
                    .await
                    .with_context(|| format!("Failed to resolve {} of {}", category, module.id))?;
                if let Some(fingerprint) = fs.fingerprint().await? {
                    lines.push(format!(
                        "{} {} [{}] -> {}",
                        module.id,
                        category,
                        locations.join(", "),
                        fingerprint
                    ));
                }
            }
        }
        Ok(lines)
    }

    fn output_file(args: &[String]) -> Result<Option<PathBuf>> {
        let mut output = None;
        let mut args = args.iter();
        while let Some(arg) = args.next() {
            if let Some(path) = arg.strip_prefix("--output-file=") {
                output = Some(PathBuf::from(path));
            } else if arg == "--output-file" {
                let path = args.next().context("--output-file needs a path")?;
                output = Some(PathBuf::from(path));
            } else {
                bail!("unsupported argument for modules: {}", arg);
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl Action for ModulesAction {
    async fn execute(&self, session: &Session, args: &[String]) -> Result<()> {
        let output = Self::output_file(args)?;
        let mut report = Self::report(session).await?.join("\n");
        if !report.is_empty() {
            report.push('\n');
        }
        match output {
            Some(path) => tokio::fs::write(&path, report)
                .await
                .with_context(|| format!("Failed to write {}", path.display())),
            None => {
                print!("{}", report);
                Ok(())
            }
        }
    }
}

/// Actions keyed by kind.
#[derive(Clone, Default)]
pub struct Actions {
    kinds: HashMap<String, Arc<dyn Action>>,
}

impl std::fmt::Debug for Actions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.kinds.keys().collect();
        kinds.sort();
        f.debug_struct("Actions").field("kinds", &kinds).finish()
    }
}

impl Actions {
    pub fn new() -> Self {
        Self::default()
    }

    /// `run` (through `host`) and `modules`.
    pub fn with_defaults(host: Arc<dyn ExecutionHost>) -> Self {
        let mut actions = Self::new();
        actions.register(RUN_ACTION, RunAction::new(host));
        actions.register(MODULES_ACTION, ModulesAction);
        actions
    }

    pub fn register(&mut self, kind: impl Into<String>, action: impl Action + 'static) {
        self.kinds.insert(kind.into(), Arc::new(action));
    }

    /// The action an action name refers to.
    pub fn resolve(&self, name: &str, defs: &IndexMap<String, ActionDef>) -> ConfigResult<Arc<dyn Action>> {
        let kind = defs.get(name).map(|d| d.kind.as_str()).unwrap_or(name);
        self.kinds
            .get(kind)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownAction(name.to_string()))
    }

    /// Run the action an invocation names.
    pub async fn dispatch(&self, session: &Session, invocation: &Invocation) -> Result<()> {
        let action = self.resolve(&invocation.action, &session.config().actions)?;
        tracing::debug!(action = %invocation.action, args = invocation.args.len(), "dispatching");
        action.execute(session, &invocation.args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(&[], &[], "run", &[])]
    #[case::options_only(&["-v", "--offline"], &["-v", "--offline"], "run", &[])]
    #[case::action(&["modules"], &[], "modules", &[])]
    #[case::everything(&["-v", "run", "-x", "a"], &["-v"], "run", &["-x", "a"])]
    #[case::args_keep_dashes(&["start", "--", "b"], &[], "start", &["--", "b"])]
    fn split_arguments(
        #[case] input: &[&str],
        #[case] options: &[&str],
        #[case] action: &str,
        #[case] args: &[&str],
    ) {
        let invocation = Invocation::parse(input.iter().copied());
        assert_eq!(invocation.options, options);
        assert_eq!(invocation.action, action);
        assert_eq!(invocation.args, args);
    }

    #[rstest]
    #[case(&[], None)]
    #[case(&["--output-file", "out.txt"], Some("out.txt"))]
    #[case(&["--output-file=r.txt"], Some("r.txt"))]
    fn output_file_option(#[case] args: &[&str], #[case] expected: Option<&str>) {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        assert_eq!(
            ModulesAction::output_file(&args).unwrap(),
            expected.map(PathBuf::from)
        );
    }

    #[test]
    fn test_modules_rejects_unknown_arguments() {
        let err = ModulesAction::output_file(&["--verbose".to_string()]).unwrap_err();
        assert!(err.to_string().contains("--verbose"));
        assert!(ModulesAction::output_file(&["--output-file".to_string()]).is_err());
    }

    #[test]
    fn test_action_names_map_to_kinds() {
        let mut actions = Actions::new();
        actions.register(MODULES_ACTION, ModulesAction);
        let defs: IndexMap<String, ActionDef> = [(
            "report".to_string(),
            ActionDef {
                id: "report".into(),
                kind: MODULES_ACTION.into(),
            },
        )]
        .into_iter()
        .collect();
        assert!(actions.resolve("report", &defs).is_ok());
        assert!(actions.resolve(MODULES_ACTION, &defs).is_ok());
        assert_eq!(
            actions.resolve("deploy", &defs).err(),
            Some(ConfigError::UnknownAction("deploy".into()))
        );
    }
}
