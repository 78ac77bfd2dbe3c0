//! Notification delivery for system-test runs.
//!
//! - [`delivery::slack`]: chat notifications through the project's
//!   `notify_slack.py`.
//! - [`delivery::honeycomb`]: test result telemetry push.
//! - [`alerts`]: replay of the failure alerts the driver leaves in the
//!   working directory.

pub mod alerts;
pub mod delivery;

pub use alerts::{load_alerts, replay_alerts, AlertError, PendingAlert, ReplayReport};
pub use delivery::honeycomb::{HoneycombPush, ResultsTrace};
pub use delivery::slack::{SlackNotifier, TimeoutNotice};
