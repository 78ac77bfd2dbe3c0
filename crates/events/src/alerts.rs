//! Replay of failure alerts queued by the test-driver.
//!
//! The driver writes `slack_alerts.json` into the working directory as an
//! object keyed by alert id:
//!
//! ```json
//! { "alert-1": { "message": "...", "channel": "..." } }
//! ```
//!
//! Each alert is sent on its own; one failed delivery never stops the rest.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::delivery::slack::SlackNotifier;

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("Failed to read alerts file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed alerts file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One queued chat alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAlert {
    pub message: String,
    pub channel: String,
}

/// Delivery counts of a replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub sent: usize,
    pub failed: usize,
}

/// Read the alerts file, ordered by alert id.
pub async fn load_alerts(path: &Path) -> Result<BTreeMap<String, PendingAlert>, AlertError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| AlertError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&raw).map_err(|source| AlertError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Send every alert once, logging each failure.
pub async fn replay_alerts(
    alerts: &BTreeMap<String, PendingAlert>,
    notifier: &SlackNotifier<'_>,
) -> ReplayReport {
    let mut report = ReplayReport::default();
    for (id, alert) in alerts {
        match notifier.notify(&alert.message, &alert.channel).await {
            Ok(()) => report.sent += 1,
            Err(e) => {
                tracing::error!(
                    alert_id = %id,
                    channel = %alert.channel,
                    error = %e,
                    "Failed to send slack alert",
                );
                report.failed += 1;
            }
        }
    }
    tracing::info!(sent = report.sent, failed = report.failed, "Replayed slack alerts");
    report
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use systest_core::command::{CommandError, CommandOutput, CommandRunner, CommandSpec};

    use super::*;

    /// Fails every delivery to `broken-channel`.
    struct ChannelRunner {
        calls: Mutex<Vec<CommandSpec>>,
    }

    #[async_trait]
    impl CommandRunner for ChannelRunner {
        async fn status(&self, spec: &CommandSpec) -> Result<i32, CommandError> {
            self.calls.lock().unwrap().push(spec.clone());
            let broken = spec.args.iter().any(|a| a == "--channel=broken-channel");
            Ok(if broken { 1 } else { 0 })
        }

        async fn output(&self, _spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
            unreachable!("alerts are sent with inherited stdio")
        }
    }

    #[tokio::test]
    async fn loads_alerts_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slack_alerts.json");
        std::fs::write(
            &path,
            r#"{"b": {"message": "second", "channel": "c2"},
                "a": {"message": "first", "channel": "c1"}}"#,
        )
        .unwrap();

        let alerts = load_alerts(&path).await.unwrap();
        let ids: Vec<&str> = alerts.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(alerts["a"].message, "first");
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let err = load_alerts(Path::new("/nonexistent/slack_alerts.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, AlertError::Read { .. }));
    }

    #[tokio::test]
    async fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slack_alerts.json");
        std::fs::write(&path, r#"{"a": {"message": "no channel"}}"#).unwrap();
        let err = load_alerts(&path).await.unwrap_err();
        assert!(matches!(err, AlertError::Parse { .. }));
    }

    #[tokio::test]
    async fn one_failed_alert_does_not_stop_the_rest() {
        let runner = ChannelRunner {
            calls: Mutex::new(Vec::new()),
        };
        let notifier = SlackNotifier::new(Path::new("/ic"), &runner);
        let alerts: BTreeMap<String, PendingAlert> = [
            ("1", "ok-channel"),
            ("2", "broken-channel"),
            ("3", "ok-channel"),
        ]
        .into_iter()
        .map(|(id, channel)| {
            (
                id.to_string(),
                PendingAlert {
                    message: format!("alert {id}"),
                    channel: channel.to_string(),
                },
            )
        })
        .collect();

        let report = replay_alerts(&alerts, &notifier).await;

        assert_eq!(report, ReplayReport { sent: 2, failed: 1 });
        assert_eq!(runner.calls.lock().unwrap().len(), 3);
    }
}
