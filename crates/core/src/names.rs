//! Fixed names shared between the runner and the test-driver.
//!
//! The test-driver and the reporting scripts look for these exact file
//! names and subcommands, so they are kept in one place.

/// Exit code reported when the suite exceeds its timeout.
///
/// Matches the convention of coreutils `timeout(1)`.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Name of the test-driver binary, both as a cargo target and on disk.
pub const TEST_DRIVER_BIN: &str = "prod-test-driver";

/// Driver subcommand that executes the suite.
pub const RUN_TESTS_SUBCOMMAND: &str = "run-tests";

/// Driver subcommand that aggregates result files into a suite verdict.
pub const PROCESS_TEST_RESULTS_SUBCOMMAND: &str = "process-test-results";

// ---------------------------------------------------------------------------
// Files under the working directory
// ---------------------------------------------------------------------------

pub const TEST_RESULT_FILE: &str = "test-results.json";
pub const POT_SETUP_FILE: &str = "group_setup.json";
pub const POT_SETUP_RESULT_FILE: &str = "pot_setup_result.json";
pub const SLACK_FAILURE_ALERTS_FILE: &str = "slack_alerts.json";

/// Dependency tree consumed by the driver, relative to the working directory.
pub const DEPENDENCIES_DIR: &str = "system_env/dependencies";

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// Chat channel for timeout notifications of scheduled jobs.
pub const SLACK_CHANNEL_NOTIFY: &str = "test-failure-alerts";

/// Appended to the driver arguments on CI to keep the job log readable.
pub const NO_PROPAGATE_TEST_LOGS_FLAG: &str = "--no-propagate-test-logs";

// ---------------------------------------------------------------------------
// Temp directory prefixes
// ---------------------------------------------------------------------------

pub const TMP_WORKING_DIR_PREFIX: &str = "tmp_working_dir_";
pub const TMP_ARTIFACTS_PREFIX: &str = "tmp_artifacts_";
pub const TMP_SSH_KEYS_PREFIX: &str = "tmp_ssh_keys_";
pub const TMP_TEST_DRIVER_PREFIX: &str = "tmp_test_driver_";
