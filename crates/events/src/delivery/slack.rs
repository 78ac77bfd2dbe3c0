//! Chat notifications via `notify_slack.py`.

use std::path::{Path, PathBuf};

use systest_core::command::{CommandError, CommandRunner, CommandSpec};
use systest_core::config::CiMetadata;

/// Notifier script, relative to the project directory.
const NOTIFY_SCRIPT: &str = "gitlab-ci/src/notify_slack/notify_slack.py";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SlackError {
    #[error(transparent)]
    Command(#[from] CommandError),

    /// The notifier ran but reported a failure.
    #[error("notify_slack.py exited with code {0}")]
    ExitCode(i32),
}

// ---------------------------------------------------------------------------
// SlackNotifier
// ---------------------------------------------------------------------------

/// Posts messages to chat channels through the project's notifier.
pub struct SlackNotifier<'a> {
    project_dir: PathBuf,
    runner: &'a dyn CommandRunner,
}

impl<'a> SlackNotifier<'a> {
    pub fn new(project_dir: &Path, runner: &'a dyn CommandRunner) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            runner,
        }
    }

    /// `python3 notify_slack.py <message> --channel=<channel>`.
    pub fn command(&self, message: &str, channel: &str) -> CommandSpec {
        CommandSpec::new("python3").args([
            self.project_dir.join(NOTIFY_SCRIPT).display().to_string(),
            message.to_string(),
            format!("--channel={channel}"),
        ])
    }

    /// Send one message. A single attempt is made.
    pub async fn notify(&self, message: &str, channel: &str) -> Result<(), SlackError> {
        match self.runner.status(&self.command(message, channel)).await? {
            0 => Ok(()),
            code => Err(SlackError::ExitCode(code)),
        }
    }
}

// ---------------------------------------------------------------------------
// Timeout notice
// ---------------------------------------------------------------------------

/// Message announcing that a scheduled job hit the suite timeout.
#[derive(Debug, Clone)]
pub struct TimeoutNotice<'a> {
    pub ci: &'a CiMetadata,
    pub ic_version_id: &'a str,
}

impl TimeoutNotice<'_> {
    /// Chat markup with job, commit and version lines.
    pub fn message(&self) -> String {
        let ci = self.ci;
        [
            format!("Scheduled job `{}` *timed out*. <{}|log>.", ci.job_name, ci.job_url),
            format!(
                "Commit: <{}/-/commit/{}|{}>.",
                ci.project_url, ci.commit_sha, ci.commit_short_sha
            ),
            format!("IC_VERSION_ID: `{}`.", self.ic_version_id),
        ]
        .join("\n")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
