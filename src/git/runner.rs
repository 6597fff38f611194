//! Spawns one git subprocess per invocation.
//!
//! Arguments are always passed as a list, never through a shell. The runner
//! owns executable resolution, the environment contract, timeouts and
//! cancellation. Cancelling kills the child and no output callback fires
//! afterwards.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, trace, warn};

use super::classify::{self, FailureKind};
use super::environment;
use super::invocation::Invocation;
use crate::error::{GitError, Result};

/// Receives every stderr line, including progress noise filtered from errors.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Explicit git executable; searched for on PATH when absent or missing.
    pub executable: Option<PathBuf>,
    /// Applied to invocations that do not set their own timeout.
    pub default_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stderr without progress chatter and hints.
    pub fn error_text(&self) -> String {
        classify::error_text(&self.stderr)
    }

    /// Maps a non-zero exit to a classified error.
    pub fn into_result(self, invocation: &Invocation) -> Result<CommandOutput> {
        if self.success() {
            return Ok(self);
        }
        let text = self.error_text();
        let err = match classify::classify_failure(&text) {
            FailureKind::Contention => GitError::LockContention { message: text },
            FailureKind::Credentials => {
                debug!(command = %invocation.display(), stderr = %text, "credential failure");
                GitError::CredentialsRequired {
                    operation: invocation.display(),
                    hint: classify::credential_hint(&text),
                }
            }
            FailureKind::Other => GitError::CommandFailure {
                command: invocation.display(),
                exit_code: self.exit_code,
                stderr: text,
            },
        };
        Err(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Pre-discovered repository layout a pooled handle lends to an execution.
/// Setting `GIT_DIR`/`GIT_WORK_TREE` skips git's repository discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecContext {
    pub git_dir: PathBuf,
    pub work_tree: Option<PathBuf>,
}

pub struct ProcessRunner {
    program: PathBuf,
    default_timeout: Option<Duration>,
    log_sink: Option<LogSink>,
}

impl ProcessRunner {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            program: resolve_executable(config.executable.as_deref()),
            default_timeout: config.default_timeout_ms.map(Duration::from_millis),
            log_sink: None,
        }
    }

    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Runs to completion. Any exit code is a successful execution here.
    pub async fn execute(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.execute_in(invocation, None, None)
            .await?
            .ok_or_else(|| GitError::Internal("git output ended without a liveness limit".to_string()))
    }

    /// Like `execute`, but a non-zero exit becomes a classified error.
    pub async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.execute(invocation).await?.into_result(invocation)
    }

    /// Runs with a lent pooled context. `Ok(None)` when git wrote nothing
    /// and did not exit within `liveness`; the child has been killed.
    pub(crate) async fn run_in(
        &self,
        invocation: &Invocation,
        context: Option<&ExecContext>,
        liveness: Option<Duration>,
    ) -> Result<Option<CommandOutput>> {
        match self.execute_in(invocation, context, liveness).await? {
            Some(output) => output.into_result(invocation).map(Some),
            None => Ok(None),
        }
    }

    async fn execute_in(
        &self,
        invocation: &Invocation,
        context: Option<&ExecContext>,
        liveness: Option<Duration>,
    ) -> Result<Option<CommandOutput>> {
        let mut cmd = self.command_for(invocation, context)?;
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let started = Instant::now();
        debug!(command = %invocation.display(), cwd = %invocation.working_dir().display(), "spawning git");
        let mut child = cmd.spawn().map_err(|e| self.start_failure(e))?;

        let cancel = invocation.cancellation().cloned().unwrap_or_default();
        let limit = self.timeout_for(invocation);

        // kill_on_drop: returning early kills the child
        let collected = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(command = %invocation.display(), "cancelled, killing git");
                return Err(GitError::Cancelled);
            }
            _ = deadline(limit) => {
                warn!(command = %invocation.display(), "timed out, killing git");
                return Err(GitError::Timeout {
                    command: invocation.display(),
                    elapsed: started.elapsed(),
                });
            }
            collected = collect_output(&mut child, liveness) => collected?,
        };
        let Some((stdout, stderr, status)) = collected else {
            debug!(command = %invocation.display(), "no output within liveness window, killing git");
            return Ok(None);
        };

        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        self.forward_stderr(&stderr);

        debug!(
            command = %invocation.display(),
            exit_code = ?status.code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "git finished"
        );

        Ok(Some(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr,
            exit_code: status.code(),
        }))
    }

    /// Delivers lines as they arrive. The returned output carries the
    /// collected stderr and exit code; stdout is only delivered to `on_line`.
    pub async fn execute_streaming<F>(
        &self,
        invocation: &Invocation,
        mut on_line: F,
    ) -> Result<CommandOutput>
    where
        F: FnMut(OutputLine) + Send,
    {
        let mut cmd = self.command_for(invocation, None)?;
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| self.start_failure(e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GitError::Internal("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GitError::Internal("stderr was not captured".to_string()))?;

        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut collected = String::new();
        let (mut out_done, mut err_done) = (false, false);

        let cancel = invocation.cancellation().cloned().unwrap_or_default();
        let timer = deadline(self.timeout_for(invocation));
        tokio::pin!(timer);

        while !(out_done && err_done) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(GitError::Cancelled);
                }
                _ = &mut timer => {
                    let _ = child.kill().await;
                    return Err(GitError::Timeout {
                        command: invocation.display(),
                        elapsed: started.elapsed(),
                    });
                }
                line = out_lines.next_line(), if !out_done => match line? {
                    Some(line) => on_line(OutputLine::Stdout(line)),
                    None => out_done = true,
                },
                line = err_lines.next_line(), if !err_done => match line? {
                    Some(line) => {
                        self.forward_stderr(&line);
                        collected.push_str(&line);
                        collected.push('\n');
                        on_line(OutputLine::Stderr(line));
                    }
                    None => err_done = true,
                },
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(GitError::Cancelled);
            }
            status = child.wait() => status?,
        };

        Ok(CommandOutput {
            stdout: String::new(),
            stderr: collected,
            exit_code: status.code(),
        })
    }

    fn command_for(&self, invocation: &Invocation, context: Option<&ExecContext>) -> Result<Command> {
        if invocation.is_cancelled() {
            return Err(GitError::Cancelled);
        }
        let cwd = invocation.working_dir();
        if !cwd.is_dir() {
            return Err(GitError::InvalidPath(cwd.display().to_string()));
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(invocation.full_args())
            .current_dir(cwd)
            .kill_on_drop(true);

        if invocation.wants_interactive_credentials() {
            cmd.stdin(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null());
        }

        let read_only = !invocation.command().is_mutating();
        for (key, value) in
            environment::base_environment(invocation.wants_interactive_credentials(), read_only)
        {
            cmd.env(key, value);
        }
        if let Some(context) = context {
            cmd.env("GIT_DIR", &context.git_dir);
            if let Some(work_tree) = &context.work_tree {
                cmd.env("GIT_WORK_TREE", work_tree);
            }
        }
        for (key, value) in invocation.env_overrides() {
            cmd.env(key, value);
        }
        Ok(cmd)
    }

    fn timeout_for(&self, invocation: &Invocation) -> Option<Duration> {
        invocation.timeout_limit().or(self.default_timeout)
    }

    fn start_failure(&self, err: std::io::Error) -> GitError {
        GitError::StartFailure {
            program: self.program.display().to_string(),
            message: err.to_string(),
        }
    }

    fn forward_stderr(&self, stderr: &str) {
        for line in stderr.split(['\n', '\r']).filter(|l| !l.trim().is_empty()) {
            if classify::is_noise_line(line) {
                trace!(target: "git_broker::git::progress", "{line}");
            }
            if let Some(sink) = &self.log_sink {
                sink(line);
            }
        }
    }
}

/// Reads both pipes to the end and reaps the child. `None` when `liveness`
/// elapses before git writes anything or closes its output.
async fn collect_output(
    child: &mut Child,
    liveness: Option<Duration>,
) -> std::io::Result<Option<(Vec<u8>, Vec<u8>, ExitStatus)>> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("stderr was not captured"))?;
    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);

    if let Some(liveness) = liveness {
        let first_output = async {
            tokio::select! {
                read = stdout.fill_buf() => read.map(|_| ()),
                read = stderr.fill_buf() => read.map(|_| ()),
            }
        };
        match tokio::time::timeout(liveness, first_output).await {
            Ok(read) => read?,
            Err(_) => return Ok(None),
        }
    }

    let (mut out, mut err) = (Vec::new(), Vec::new());
    tokio::try_join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err))?;
    let status = child.wait().await?;
    Ok(Some((out, err, status)))
}

async fn deadline(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(unix)]
const PLATFORM_CANDIDATES: &[&str] = &[
    "/usr/bin/git",
    "/usr/local/bin/git",
    "/opt/homebrew/bin/git",
    "/opt/local/bin/git",
];

#[cfg(windows)]
const PLATFORM_CANDIDATES: &[&str] = &[
    r"C:\Program Files\Git\cmd\git.exe",
    r"C:\Program Files (x86)\Git\cmd\git.exe",
];

#[cfg(not(any(unix, windows)))]
const PLATFORM_CANDIDATES: &[&str] = &[];

/// Configured path, then `PATH`, then well-known install locations. Falls
/// back to the bare name so a missing git surfaces as a `StartFailure`.
pub fn resolve_executable(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        if path.is_file() {
            return path.to_path_buf();
        }
        warn!(path = %path.display(), "configured git executable not found, searching PATH");
    }

    let name = if cfg!(windows) { "git.exe" } else { "git" };
    if let Some(paths) = std::env::var_os("PATH") {
        if let Some(found) = std::env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
        {
            return found;
        }
    }

    PLATFORM_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(name))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::git::command::GitCommand;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Writes an executable shell script standing in for git.
    fn fake_git(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("fake-git");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn runner_for(script: PathBuf) -> ProcessRunner {
        ProcessRunner::new(&RunnerConfig {
            executable: Some(script),
            default_timeout_ms: None,
        })
    }

    #[tokio::test]
    async fn test_execute_captures_output_and_args() {
        let dir = TempDir::new().unwrap();
        let runner = runner_for(fake_git(&dir, "echo \"args:$*\"; echo oops >&2; exit 3"));
        let inv = Invocation::new(dir.path(), GitCommand::Log).args(["-n", "1"]);

        let output = runner.execute(&inv).await.unwrap();
        assert_eq!(output.stdout.trim(), "args:log -n 1");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(output.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_run_classifies_failures() {
        let dir = TempDir::new().unwrap();
        let runner = runner_for(fake_git(
            &dir,
            "echo 'Counting objects: 100% (3/3), done.' >&2; \
             echo \"fatal: Unable to create '/x/.git/index.lock': File exists.\" >&2; exit 128",
        ));
        let inv = Invocation::new(dir.path(), GitCommand::Commit).args(["-m", "x"]);

        match runner.run(&inv).await {
            Err(GitError::LockContention { message }) => {
                assert!(message.contains("index.lock"));
                assert!(!message.contains("Counting objects"));
            }
            other => panic!("expected contention, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_noise_reaches_log_sink() {
        let dir = TempDir::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let runner = runner_for(fake_git(
            &dir,
            "echo 'Receiving objects:  50% (1/2)' >&2; echo 'fatal: boom' >&2; exit 1",
        ))
        .with_log_sink(Arc::new(move |line: &str| {
            sink_seen.lock().unwrap().push(line.to_string());
        }));
        let inv = Invocation::new(dir.path(), GitCommand::Fetch);

        let err = runner.run(&inv).await.unwrap_err();
        assert!(matches!(&err, GitError::CommandFailure { stderr, .. } if stderr == "fatal: boom"));
        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|l| l.contains("Receiving objects")));
    }

    #[tokio::test]
    async fn test_missing_executable_is_start_failure() {
        let dir = TempDir::new().unwrap();
        let runner = ProcessRunner {
            program: dir.path().join("does-not-exist"),
            default_timeout: None,
            log_sink: None,
        };
        let inv = Invocation::new(dir.path(), GitCommand::Status);
        assert!(matches!(
            runner.execute(&inv).await,
            Err(GitError::StartFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_working_dir_rejected() {
        let dir = TempDir::new().unwrap();
        let runner = runner_for(fake_git(&dir, "exit 0"));
        let inv = Invocation::new(dir.path().join("gone"), GitCommand::Status);
        assert!(matches!(
            runner.execute(&inv).await,
            Err(GitError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let dir = TempDir::new().unwrap();
        let runner = runner_for(fake_git(&dir, "sleep 5"));
        let token = CancellationToken::new();
        let inv = Invocation::new(dir.path(), GitCommand::Log).cancel_on(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });
        let started = Instant::now();
        let result = runner.execute(&inv).await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(GitError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = TempDir::new().unwrap();
        let runner = runner_for(fake_git(&dir, "sleep 5"));
        let inv =
            Invocation::new(dir.path(), GitCommand::Log).timeout(Duration::from_millis(100));
        assert!(matches!(
            runner.execute(&inv).await,
            Err(GitError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_streaming_stops_after_cancel() {
        let dir = TempDir::new().unwrap();
        let runner = runner_for(fake_git(
            &dir,
            "i=0; while [ $i -lt 100 ]; do echo line$i; i=$((i+1)); sleep 0.02; done",
        ));
        let token = CancellationToken::new();
        let inv = Invocation::new(dir.path(), GitCommand::Log).cancel_on(token.clone());

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let cancel_after = token.clone();
        let result = runner
            .execute_streaming(&inv, move |line| {
                let mut lines = sink.lock().unwrap();
                lines.push(line);
                if lines.len() == 3 {
                    cancel_after.cancel();
                }
            })
            .await;

        assert!(matches!(result, Err(GitError::Cancelled)));
        let count = lines.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(lines.lock().unwrap().len(), count);
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_streaming_delivers_lines() {
        let dir = TempDir::new().unwrap();
        let runner = runner_for(fake_git(&dir, "echo one; echo two; echo warn >&2"));
        let inv = Invocation::new(dir.path(), GitCommand::Log);

        let mut lines = Vec::new();
        let output = runner
            .execute_streaming(&inv, |line| lines.push(line))
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stderr, "warn\n");
        assert!(lines.contains(&OutputLine::Stdout("one".to_string())));
        assert!(lines.contains(&OutputLine::Stdout("two".to_string())));
        assert!(lines.contains(&OutputLine::Stderr("warn".to_string())));
    }

    #[tokio::test]
    async fn test_environment_contract_applied() {
        let dir = TempDir::new().unwrap();
        let runner = runner_for(fake_git(
            &dir,
            "echo \"$LC_ALL|$GIT_TERMINAL_PROMPT|$GIT_OPTIONAL_LOCKS|$CUSTOM\"",
        ));
        let read = Invocation::new(dir.path(), GitCommand::Status).env("CUSTOM", "x");
        let output = runner.execute(&read).await.unwrap();
        assert_eq!(output.stdout.trim(), "C|0|0|x");

        let push = Invocation::new(dir.path(), GitCommand::Push);
        let output = runner.execute(&push).await.unwrap();
        assert_eq!(output.stdout.trim(), "C|||");
    }

    #[test]
    fn test_resolve_prefers_configured_path() {
        let dir = TempDir::new().unwrap();
        let script = fake_git(&dir, "exit 0");
        assert_eq!(resolve_executable(Some(&script)), script);
    }
}
