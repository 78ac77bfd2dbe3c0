//! External command execution.
//!
//! Every helper tool the runner invokes (downloads, notifications,
//! telemetry, summaries, `git`, `ssh-keygen`, `cargo`) is described by a
//! [`CommandSpec`] and executed through a [`CommandRunner`]. The trait is
//! the seam tests use to observe and script those invocations.
//!
//! Commands are either *advisory* ([`run_advisory`]: a non-zero exit is
//! logged and the run continues) or *mandatory* ([`run_mandatory`]: a
//! non-zero exit is an error).

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;

use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Where the child's stdout goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdoutTarget {
    /// Share the runner's stdout.
    #[default]
    Inherit,
    /// Redirect into the runner's stderr so CI log viewers show it inline.
    Stderr,
}

/// A fully described external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Complete replacement environment. `None` inherits the runner's.
    pub env: Option<HashMap<String, String>>,
    pub stdout: StdoutTarget,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Build from an argv-style list; the first element is the program.
    /// Returns `None` for an empty list.
    pub fn from_argv<I, S>(argv: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut iter = argv.into_iter().map(Into::into);
        let program = iter.next()?;
        Some(Self::new(program).args(iter))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
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

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn stdout_to_stderr(mut self) -> Self {
        self.stdout = StdoutTarget::Stderr;
        self
    }

    /// Build the matching [`tokio::process::Command`]. The child is killed
    /// if the future awaiting it is dropped.
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        if let Some(env) = &self.env {
            cmd.env_clear().envs(env);
        }
        if self.stdout == StdoutTarget::Stderr {
            cmd.stdout(Stdio::from(std::io::stderr()));
        }
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a command run with [`CommandRunner::output`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed with exit code {code}")]
    Failed { command: String, code: i32 },
}

// ---------------------------------------------------------------------------
// Runner trait
// ---------------------------------------------------------------------------

/// Executes external commands to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run with inherited stdio and return the exit code.
    async fn status(&self, spec: &CommandSpec) -> Result<i32, CommandError>;

    /// Run with captured stdout/stderr.
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;
}

/// [`CommandRunner`] that spawns real processes.
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn status(&self, spec: &CommandSpec) -> Result<i32, CommandError> {
        tracing::debug!(command = %spec, "Running command");
        let status = spec
            .to_command()
            .status()
            .await
            .map_err(|source| CommandError::Spawn {
                program: spec.program.clone(),
                source,
            })?;
        Ok(exit_code(status))
    }

    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        tracing::debug!(command = %spec, "Running command");
        let output = spec
            .to_command()
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                program: spec.program.clone(),
                source,
            })?;
        Ok(CommandOutput {
            code: exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Exit code of a finished process. Signal deaths map to `128 + signo`
/// like a POSIX shell reports them.
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

// ---------------------------------------------------------------------------
// Advisory / mandatory helpers
// ---------------------------------------------------------------------------

/// Run a command whose failure must not abort the run.
///
/// Spawn errors and non-zero exits are logged. Returns whether the
/// command succeeded.
pub async fn run_advisory(runner: &dyn CommandRunner, spec: &CommandSpec, what: &str) -> bool {
    match runner.status(spec).await {
        Ok(0) => {
            tracing::info!("{what}: succeeded");
            true
        }
        Ok(code) => {
            tracing::error!(code, command = %spec, "{what}: failed");
            false
        }
        Err(e) => {
            tracing::error!(error = %e, "{what}: could not run");
            false
        }
    }
}

/// Run a command whose failure aborts the run.
pub async fn run_mandatory(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
) -> Result<(), CommandError> {
    match runner.status(spec).await? {
        0 => Ok(()),
        code => Err(CommandError::Failed {
            command: spec.to_string(),
            code,
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn display_joins_program_and_args() {
        let spec = CommandSpec::new("git").args(["rev-parse", "HEAD"]);
        assert_eq!(spec.to_string(), "git rev-parse HEAD");
    }

    #[test]
    fn from_argv_splits_program() {
        let spec = CommandSpec::from_argv(["cargo", "build"]).unwrap();
        assert_eq!(spec.program, "cargo");
        assert_eq!(spec.args, vec!["build".to_string()]);
        assert!(CommandSpec::from_argv(Vec::<String>::new()).is_none());
    }

    #[tokio::test]
    async fn system_runner_reports_exit_code() {
        let spec = CommandSpec::new("sh").args(["-c", "exit 3"]);
        assert_eq!(SystemCommandRunner.status(&spec).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn system_runner_captures_output() {
        let spec = CommandSpec::new("sh").args(["-c", "echo hello; echo oops >&2"]);
        let out = SystemCommandRunner.output(&spec).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn replacement_env_is_applied() {
        let env = HashMap::from([("ONLY_VAR".to_string(), "42".to_string())]);
        let spec = CommandSpec::new("/bin/sh")
            .args(["-c", "echo \"$ONLY_VAR:${HOME:-none}\""])
            .env(env);
        let out = SystemCommandRunner.output(&spec).await.unwrap();
        assert_eq!(out.stdout.trim(), "42:none");
    }

    #[tokio::test]
    async fn signal_death_maps_to_128_plus_signo() {
        let spec = CommandSpec::new("sh").args(["-c", "kill -TERM $$"]);
        assert_eq!(SystemCommandRunner.status(&spec).await.unwrap(), 128 + 15);
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let spec = CommandSpec::new("/nonexistent/tool");
        let err = SystemCommandRunner.status(&spec).await.unwrap_err();
        assert_matches!(err, CommandError::Spawn { .. });
    }

    #[tokio::test]
    async fn mandatory_failure_carries_code() {
        let spec = CommandSpec::new("sh").args(["-c", "exit 2"]);
        let err = run_mandatory(&SystemCommandRunner, &spec).await.unwrap_err();
        assert_matches!(err, CommandError::Failed { code: 2, .. });
    }

    #[tokio::test]
    async fn advisory_failure_is_swallowed() {
        let spec = CommandSpec::new("/nonexistent/tool");
        assert!(!run_advisory(&SystemCommandRunner, &spec, "probe").await);
        let ok = CommandSpec::new("true");
        assert!(run_advisory(&SystemCommandRunner, &ok, "probe").await);
    }
}
