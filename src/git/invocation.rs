//! One logical request to run a git command.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio_util::sync::CancellationToken;

use super::command::{GitCommand, OperationClass};
use super::retry::GitLayout;

/// Repository identity: the canonical work-tree top level (or git directory
/// of a bare repository) containing a path. Paths outside any repository
/// are identified by their canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoId(Arc<Path>);

impl RepoId {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let root = match std::fs::canonicalize(path) {
            Ok(canonical) => GitLayout::locate(&canonical)
                .map(|(root, _)| root)
                .unwrap_or(canonical),
            Err(_) => path.to_path_buf(),
        };
        Self(Arc::from(root.as_path()))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl Serialize for RepoId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0.display())
    }
}

/// Immutable description of a single git invocation.
///
/// Built once at the call site; the command type fixes pool safety,
/// mutation class and cache invalidation, never the argument text.
#[derive(Debug)]
pub struct Invocation {
    working_dir: PathBuf,
    command: GitCommand,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cancel: Option<CancellationToken>,
    timeout: Option<Duration>,
    interactive_credentials: bool,
    invalidated_by: Option<Vec<OperationClass>>,
    /// Repository and the working directory relative to its root, resolved
    /// on first use.
    location: OnceLock<(RepoId, PathBuf)>,
}

impl Invocation {
    pub fn new<P: Into<PathBuf>>(working_dir: P, command: GitCommand) -> Self {
        Self {
            working_dir: working_dir.into(),
            command,
            args: Vec::new(),
            env: Vec::new(),
            cancel: None,
            timeout: None,
            interactive_credentials: command.needs_interactive_credentials(),
            invalidated_by: None,
            location: OnceLock::new(),
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Queries only. Mutations must not be cancelled once started.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Allow git to prompt for credentials. Push always does.
    pub fn interactive_credentials(mut self, interactive: bool) -> Self {
        self.interactive_credentials = interactive || self.command.needs_interactive_credentials();
        self
    }

    /// Override the command's default invalidating classes.
    pub fn invalidated_by<I: IntoIterator<Item = OperationClass>>(mut self, classes: I) -> Self {
        self.invalidated_by = Some(classes.into_iter().collect());
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn command(&self) -> GitCommand {
        self.command
    }

    pub fn caller_args(&self) -> &[String] {
        &self.args
    }

    pub fn env_overrides(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    pub fn timeout_limit(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn wants_interactive_credentials(&self) -> bool {
        self.interactive_credentials
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    pub fn repo_id(&self) -> RepoId {
        self.location().0.clone()
    }

    /// Working directory relative to the repository root; empty at the root.
    pub fn subdirectory(&self) -> &Path {
        &self.location().1
    }

    fn location(&self) -> &(RepoId, PathBuf) {
        self.location.get_or_init(|| {
            let repo = RepoId::new(&self.working_dir);
            let subdirectory = std::fs::canonicalize(&self.working_dir)
                .ok()
                .and_then(|dir| dir.strip_prefix(repo.path()).ok().map(Path::to_path_buf))
                .unwrap_or_default();
            (repo, subdirectory)
        })
    }

    /// Subcommand tokens followed by the caller's arguments.
    pub fn full_args(&self) -> Vec<String> {
        self.command
            .leading_args()
            .iter()
            .map(|s| s.to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Normalized cache signature. Environment overrides and the working
    /// directory below the repository root are part of it because they can
    /// change git's output.
    pub fn signature(&self) -> String {
        let mut parts: Vec<String> = self
            .full_args()
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();

        let mut env = self.env.clone();
        env.sort();
        parts.extend(env.into_iter().map(|(k, v)| format!("{k}={v}")));
        let subdirectory = self.subdirectory();
        if !subdirectory.as_os_str().is_empty() {
            parts.push(format!("cwd={}", subdirectory.display()));
        }
        parts.join("\u{1f}")
    }

    pub fn invalidating_classes(&self) -> Vec<OperationClass> {
        match &self.invalidated_by {
            Some(classes) => classes.clone(),
            None => self.command.invalidated_by().to_vec(),
        }
    }

    /// Human readable `git <args>` for logs and error messages.
    pub fn display(&self) -> String {
        format!("git {}", self.full_args().join(" "))
    }
}
