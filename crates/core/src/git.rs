//! Commit metadata read from the local git checkout.

use crate::command::{CommandError, CommandRunner, CommandSpec};

/// Reported instead of a date when `git show` cannot resolve a commit.
pub const UNRESOLVED_COMMIT_DATE: &str = "unresolved commit datetime";

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Couldn't get the current commit hash: {stderr}")]
    RevParse { stderr: String },
}

pub fn rev_parse_head_command() -> CommandSpec {
    CommandSpec::new("git").args(["rev-parse", "HEAD"])
}

pub fn commit_date_command(sha: &str) -> CommandSpec {
    CommandSpec::new("git").args(["show", "-s", "--format=%cD", sha])
}

/// Sha of the checked-out commit.
pub async fn current_commit_sha(runner: &dyn CommandRunner) -> Result<String, GitError> {
    let output = runner.output(&rev_parse_head_command()).await?;
    if !output.success() {
        return Err(GitError::RevParse {
            stderr: output.stderr.trim().to_string(),
        });
    }
    let sha = output.stdout.trim().to_string();
    tracing::info!(commit = %sha, "Resolved current commit");
    Ok(sha)
}

/// RFC 2822 commit date of `sha`, or [`UNRESOLVED_COMMIT_DATE`].
pub async fn commit_date(runner: &dyn CommandRunner, sha: &str) -> String {
    match runner.output(&commit_date_command(sha)).await {
        Ok(output) if output.success() => {
            let date = output.stdout.trim().to_string();
            tracing::info!(commit = %sha, date = %date, "Resolved commit date");
            date
        }
        Ok(output) => {
            tracing::error!(
                commit = %sha,
                stderr = %output.stderr.trim(),
                "Couldn't get datetime of the commit",
            );
            UNRESOLVED_COMMIT_DATE.to_string()
        }
        Err(e) => {
            tracing::error!(commit = %sha, error = %e, "Couldn't get datetime of the commit");
            UNRESOLVED_COMMIT_DATE.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::command::CommandOutput;

    /// Replays one canned output and records the commands it saw.
    struct Canned {
        output: Option<CommandOutput>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for Canned {
        async fn status(&self, _spec: &CommandSpec) -> Result<i32, CommandError> {
            unreachable!("git helpers capture output")
        }

        async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
            self.seen.lock().unwrap().push(spec.to_string());
            self.output.clone().ok_or_else(|| CommandError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        }
    }

    fn canned(output: Option<CommandOutput>) -> Canned {
        Canned {
            output,
            seen: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn head_sha_is_trimmed() {
        let runner = canned(Some(CommandOutput {
            code: 0,
            stdout: "abc123\n".into(),
            stderr: String::new(),
        }));
        assert_eq!(current_commit_sha(&runner).await.unwrap(), "abc123");
        assert_eq!(runner.seen.lock().unwrap()[0], "git rev-parse HEAD");
    }

    #[tokio::test]
    async fn failed_rev_parse_is_an_error() {
        let runner = canned(Some(CommandOutput {
            code: 128,
            stdout: String::new(),
            stderr: "fatal: not a git repository\n".into(),
        }));
        let err = current_commit_sha(&runner).await.unwrap_err();
        assert!(matches!(err, GitError::RevParse { ref stderr } if stderr == "fatal: not a git repository"));
    }

    #[tokio::test]
    async fn commit_date_falls_back() {
        let failing = canned(Some(CommandOutput {
            code: 128,
            ..Default::default()
        }));
        assert_eq!(commit_date(&failing, "abc").await, UNRESOLVED_COMMIT_DATE);

        let missing_git = canned(None);
        assert_eq!(commit_date(&missing_git, "abc").await, UNRESOLVED_COMMIT_DATE);
    }

    #[tokio::test]
    async fn commit_date_is_read_from_git_show() {
        let runner = canned(Some(CommandOutput {
            code: 0,
            stdout: "Tue, 1 Mar 2022 10:00:00 +0100\n".into(),
            stderr: String::new(),
        }));
        assert_eq!(commit_date(&runner, "abc").await, "Tue, 1 Mar 2022 10:00:00 +0100");
        assert_eq!(runner.seen.lock().unwrap()[0], "git show -s --format=%cD abc");
    }
}
