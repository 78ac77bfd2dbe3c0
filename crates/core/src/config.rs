//! Run configuration resolved from environment variables and CLI flags.
//!
//! [`RunConfig::resolve`] reads every variable listed in [`SCHEMA`] through
//! a lookup function, validates the result centrally and derives the
//! feature flags. Nothing is written to disk and no command is run before
//! validation succeeds.
//!
//! [`RunnerArgs`] separates the runner's private flags from the arguments
//! forwarded to the test-driver.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::CoreError;

/// Default suite timeout. Must stay below the CI job timeout so the runner
/// can still report before the job is killed.
pub const DEFAULT_SUITE_TIMEOUT_SECS: u64 = 50 * 60;

pub const DEFAULT_SHELL_WRAPPER: &str = "/usr/bin/time";
pub const DEFAULT_FARM_BASE_URL: &str = "https://farm.dfinity.systems";
pub const DEFAULT_IMAGE_DOWNLOAD_BASE_URL: &str =
    "http://download.proxy-global.dfinity.network:8080/ic";
pub const DEFAULT_EXTERNAL_IP_LOOKUP_URL: &str = "http://ifconfig.co";

/// Journalbeat hosts used when `TEST_ES_HOSTNAMES` is unset.
pub const DEFAULT_ES_HOSTNAMES: &[&str] = &[
    "elasticsearch-node-0.testnet.dfinity.systems:443",
    "elasticsearch-node-1.testnet.dfinity.systems:443",
    "elasticsearch-node-2.testnet.dfinity.systems:443",
];

/// `CI_PARENT_PIPELINE_SOURCE` value of merge-request pipelines.
const MERGE_REQUEST_EVENT: &str = "merge_request_event";

/// `CI_PIPELINE_SOURCE` value of scheduled pipelines.
const SCHEDULE_SOURCE: &str = "schedule";

const VERSION_HINT: &str = "to obtain a GuestOS image version for your commit, push your branch \
     to origin and create an MR; to use the latest image of origin/master run \
     gitlab-ci/src/artifacts/newest_sha_with_disk_image.sh origin/master \
     (not guaranteed to be deterministic)";

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Declaration of one environment variable read by the runner.
#[derive(Debug, Clone, Copy)]
pub struct EnvVar {
    pub name: &'static str,
    /// Value used when the variable is unset. `None` means "absent".
    pub default: Option<&'static str>,
    /// Required variables must be set to a non-empty value.
    pub required: bool,
    pub description: &'static str,
}

const fn optional(name: &'static str, description: &'static str) -> EnvVar {
    EnvVar {
        name,
        default: None,
        required: false,
        description,
    }
}

const fn with_default(
    name: &'static str,
    default: &'static str,
    description: &'static str,
) -> EnvVar {
    EnvVar {
        name,
        default: Some(default),
        required: false,
        description,
    }
}

pub const CI_JOB_ID: EnvVar = optional("CI_JOB_ID", "CI job id; its presence selects CI mode");
pub const IC_VERSION_ID: EnvVar = EnvVar {
    name: "IC_VERSION_ID",
    default: None,
    required: true,
    description: "Version whose images and artifacts are tested",
};
pub const GUESTOS_VERSION_OVERRIDE: EnvVar = optional(
    "GUESTOS_VERSION_OVERRIDE",
    "Version of the guest-os disk image (defaults to IC_VERSION_ID)",
);
pub const CI_PROJECT_DIR: EnvVar =
    optional("CI_PROJECT_DIR", "Repository root (defaults to the current directory)");
pub const ARTIFACT_DIR: EnvVar =
    with_default("ARTIFACT_DIR", "", "Locally prebuilt artifacts, local runs only");
pub const SSH_KEY_DIR: EnvVar =
    optional("SSH_KEY_DIR", "Authorized SSH keys; generated when unset");
pub const SYSTEM_TESTS_TIMEOUT: EnvVar = with_default(
    "SYSTEM_TESTS_TIMEOUT",
    "3000",
    "Suite timeout in seconds",
);
pub const TEST_ES_HOSTNAMES: EnvVar =
    optional("TEST_ES_HOSTNAMES", "Comma-separated elasticsearch hosts for journalbeat");
pub const SHELL_WRAPPER: EnvVar = with_default(
    "SHELL_WRAPPER",
    DEFAULT_SHELL_WRAPPER,
    "Prefix for build and run commands; empty disables it",
);
pub const CI_PARENT_PIPELINE_SOURCE: EnvVar =
    with_default("CI_PARENT_PIPELINE_SOURCE", "", "Source of the parent pipeline");
pub const CI_PIPELINE_SOURCE: EnvVar =
    with_default("CI_PIPELINE_SOURCE", "", "Source of the current pipeline");
pub const ROOT_PIPELINE_ID: EnvVar =
    with_default("ROOT_PIPELINE_ID", "", "Trace id for telemetry");
pub const CI_JOB_URL: EnvVar = with_default("CI_JOB_URL", "", "Job log URL");
pub const CI_PROJECT_URL: EnvVar = with_default("CI_PROJECT_URL", "", "Project URL");
pub const CI_COMMIT_SHA: EnvVar = with_default("CI_COMMIT_SHA", "", "Commit under test");
pub const CI_COMMIT_SHORT_SHA: EnvVar =
    with_default("CI_COMMIT_SHORT_SHA", "", "Abbreviated commit under test");
pub const CI_JOB_NAME: EnvVar = with_default("CI_JOB_NAME", "", "Job name");
pub const ROSETTA_CLI_DIR: EnvVar =
    optional("ROSETTA_CLI_DIR", "Directory holding a rosetta-cli binary to expose");
pub const IMAGE_DOWNLOAD_BASE_URL: EnvVar = with_default(
    "IMAGE_DOWNLOAD_BASE_URL",
    DEFAULT_IMAGE_DOWNLOAD_BASE_URL,
    "Root URL of the disk image proxy",
);
pub const FARM_BASE_URL: EnvVar =
    with_default("FARM_BASE_URL", DEFAULT_FARM_BASE_URL, "Farm service URL");
pub const EXTERNAL_IP_LOOKUP_URL: EnvVar = with_default(
    "EXTERNAL_IP_LOOKUP_URL",
    DEFAULT_EXTERNAL_IP_LOOKUP_URL,
    "Service echoing the caller's IPv6 address; empty disables the lookup",
);
pub const IN_NIX_SHELL: EnvVar = optional("IN_NIX_SHELL", "Set inside a nix shell");

/// Every variable the runner reads, in resolution order.
pub const SCHEMA: &[EnvVar] = &[
    CI_JOB_ID,
    IC_VERSION_ID,
    GUESTOS_VERSION_OVERRIDE,
    CI_PROJECT_DIR,
    ARTIFACT_DIR,
    SSH_KEY_DIR,
    SYSTEM_TESTS_TIMEOUT,
    TEST_ES_HOSTNAMES,
    SHELL_WRAPPER,
    CI_PARENT_PIPELINE_SOURCE,
    CI_PIPELINE_SOURCE,
    ROOT_PIPELINE_ID,
    CI_JOB_URL,
    CI_PROJECT_URL,
    CI_COMMIT_SHA,
    CI_COMMIT_SHORT_SHA,
    CI_JOB_NAME,
    ROSETTA_CLI_DIR,
    IMAGE_DOWNLOAD_BASE_URL,
    FARM_BASE_URL,
    EXTERNAL_IP_LOOKUP_URL,
    IN_NIX_SHELL,
];

/// Reads schema variables through a caller-supplied lookup.
struct EnvSource<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvSource<'_> {
    /// Raw value, falling back to the declared default.
    fn get(&self, var: EnvVar) -> Option<String> {
        (self.lookup)(var.name).or_else(|| var.default.map(str::to_string))
    }

    /// Value or empty string.
    fn string(&self, var: EnvVar) -> String {
        self.get(var).unwrap_or_default()
    }

    /// Value that must be present and non-empty.
    fn required(&self, var: EnvVar, hint: &'static str) -> Result<String, CoreError> {
        match self.get(var) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(CoreError::MissingEnv {
                name: var.name,
                hint,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// RunConfig
// ---------------------------------------------------------------------------

/// Whether the runner executes on a developer machine or inside a CI job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Local,
    Ci { job_id: String },
}

impl RunMode {
    /// Mode selected by `CI_JOB_ID`. Local runs must come from the
    /// nix-shell.
    pub fn detect(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let env = EnvSource { lookup };
        let mode = match env.get(CI_JOB_ID) {
            Some(job_id) => Self::Ci { job_id },
            None => Self::Local,
        };
        if mode == Self::Local && env.get(IN_NIX_SHELL).is_none() {
            return Err(CoreError::Validation(
                "This runner must be started from the nix-shell".to_string(),
            ));
        }
        Ok(mode)
    }
}

/// CI metadata passed through to reporting commands.
#[derive(Debug, Clone, Default)]
pub struct CiMetadata {
    pub pipeline_source: String,
    pub parent_pipeline_source: String,
    pub root_pipeline_id: String,
    pub job_url: String,
    pub project_url: String,
    pub commit_sha: String,
    pub commit_short_sha: String,
    pub job_name: String,
}

/// Feature flags derived from the run mode and pipeline metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    pub is_merge_request: bool,
    pub is_scheduled_run: bool,
    pub honeycomb_push: bool,
    pub slack_test_failure_notify: bool,
    pub slack_timeout_notify: bool,
}

impl FeatureFlags {
    fn derive(is_local_run: bool, ci: &CiMetadata) -> Self {
        let is_scheduled_run = ci.pipeline_source == SCHEDULE_SOURCE;
        let notify = !is_local_run && is_scheduled_run;
        Self {
            is_merge_request: ci.parent_pipeline_source == MERGE_REQUEST_EVENT,
            is_scheduled_run,
            honeycomb_push: !is_local_run,
            slack_test_failure_notify: notify,
            slack_timeout_notify: notify,
        }
    }
}

/// Fully resolved, immutable configuration of one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: RunMode,
    pub ic_version_id: String,
    /// Version of the guest-os disk image; equals `ic_version_id` unless overridden.
    pub guestos_version: String,
    pub project_dir: PathBuf,
    /// Absolute path of locally prebuilt artifacts, local runs only.
    pub prebuilt_artifact_dir: Option<PathBuf>,
    pub ssh_key_dir: Option<PathBuf>,
    pub suite_timeout: Duration,
    /// Comma-separated host list with quoting characters stripped.
    pub es_hostnames: String,
    pub shell_wrapper: Option<String>,
    pub image_base_url: String,
    pub farm_base_url: String,
    pub external_ip_lookup_url: Option<String>,
    pub rosetta_cli_dir: Option<PathBuf>,
    pub ci: CiMetadata,
    pub flags: FeatureFlags,
}

impl RunConfig {
    /// Resolve the configuration from `lookup`, interpreting relative
    /// paths against `cwd`.
    pub fn resolve(
        lookup: &dyn Fn(&str) -> Option<String>,
        cwd: &Path,
    ) -> Result<Self, CoreError> {
        let env = EnvSource { lookup };
        let mode = RunMode::detect(lookup)?;
        let is_local_run = mode == RunMode::Local;

        let ic_version_id = env.required(IC_VERSION_ID, VERSION_HINT)?;
        let guestos_version = env
            .get(GUESTOS_VERSION_OVERRIDE)
            .unwrap_or_else(|| ic_version_id.clone());

        let artifact_dir = env.string(ARTIFACT_DIR);
        let prebuilt_artifact_dir = if artifact_dir.is_empty() {
            None
        } else if !is_local_run {
            return Err(CoreError::Validation(
                "One can't use locally prebuilt artifacts on the CI".to_string(),
            ));
        } else {
            Some(cwd.join(artifact_dir))
        };

        let timeout_raw = env.string(SYSTEM_TESTS_TIMEOUT);
        let timeout_secs: u64 = timeout_raw.trim().parse().map_err(|_| CoreError::InvalidEnv {
            name: SYSTEM_TESTS_TIMEOUT.name,
            reason: format!("expected a number of seconds, got '{timeout_raw}'"),
        })?;

        let es_hostnames = sanitize_hostnames(
            &env.get(TEST_ES_HOSTNAMES)
                .unwrap_or_else(|| DEFAULT_ES_HOSTNAMES.join(",")),
        );

        let ci = CiMetadata {
            pipeline_source: env.string(CI_PIPELINE_SOURCE),
            parent_pipeline_source: env.string(CI_PARENT_PIPELINE_SOURCE),
            root_pipeline_id: env.string(ROOT_PIPELINE_ID),
            job_url: env.string(CI_JOB_URL),
            project_url: env.string(CI_PROJECT_URL),
            commit_sha: env.string(CI_COMMIT_SHA),
            commit_short_sha: env.string(CI_COMMIT_SHORT_SHA),
            job_name: env.string(CI_JOB_NAME),
        };
        let flags = FeatureFlags::derive(is_local_run, &ci);

        Ok(Self {
            mode,
            ic_version_id,
            guestos_version,
            project_dir: env
                .get(CI_PROJECT_DIR)
                .map(|p| cwd.join(p))
                .unwrap_or_else(|| cwd.to_path_buf()),
            prebuilt_artifact_dir,
            ssh_key_dir: env.get(SSH_KEY_DIR).map(PathBuf::from),
            suite_timeout: Duration::from_secs(timeout_secs),
            es_hostnames,
            shell_wrapper: non_empty(env.string(SHELL_WRAPPER)),
            image_base_url: env.string(IMAGE_DOWNLOAD_BASE_URL),
            farm_base_url: env.string(FARM_BASE_URL),
            external_ip_lookup_url: non_empty(env.string(EXTERNAL_IP_LOOKUP_URL)),
            rosetta_cli_dir: env.get(ROSETTA_CLI_DIR).map(PathBuf::from),
            ci,
            flags,
        })
    }

    pub fn is_local_run(&self) -> bool {
        self.mode == RunMode::Local
    }

    /// CI job id, if this is a CI run.
    pub fn job_id(&self) -> Option<&str> {
        match &self.mode {
            RunMode::Ci { job_id } => Some(job_id),
            RunMode::Local => None,
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

/// Strip characters that commonly sneak into CI variables through quoting.
pub fn sanitize_hostnames(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '`' | '\'' | ' '))
        .collect()
}

/// Job id for local runs: `<user>-<hostname>-<unix seconds>`.
pub fn generate_local_job_id() -> String {
    let user = ["LOGNAME", "USER", "LNAME", "USERNAME"]
        .iter()
        .find_map(|name| std::env::var(name).ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{user}-{}-{}", hostname(), chrono::Utc::now().timestamp())
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes and gethostname
    // writes at most that many.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

const KEEP_ARTIFACTS_FLAG: &str = "--keep_artifacts";
const KEEP_TMP_DIRS_FLAG: &str = "--keep_tmp_dirs";
const WORKING_DIR_FLAG: &str = "--working-dir";
pub const REPLICA_LOG_DEBUG_OVERRIDES_FLAG: &str = "--replica-log-debug-overrides";

/// Command-line arguments split into runner flags and driver passthrough.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerArgs {
    /// Arguments forwarded verbatim to `prod-test-driver run-tests`.
    pub driver_args: Vec<String>,
    /// Value of `--working-dir=`, if given. The flag itself stays in
    /// `driver_args` because the driver reads it too.
    pub working_dir: Option<PathBuf>,
    /// Do not delete the downloaded artifact tree.
    pub keep_artifacts: bool,
    /// Do not delete any temp directory.
    pub keep_tmp_dirs: bool,
    /// `-h` or `--help` was given.
    pub help: bool,
}

impl RunnerArgs {
    /// Split raw arguments (without the program name).
    pub fn parse<I>(args: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        for arg in args {
            match arg.as_str() {
                KEEP_ARTIFACTS_FLAG => parsed.keep_artifacts = true,
                KEEP_TMP_DIRS_FLAG => parsed.keep_tmp_dirs = true,
                "-h" | "--help" => {
                    parsed.help = true;
                    parsed.driver_args.push(arg);
                }
                _ => parsed.driver_args.push(arg),
            }
        }
        parsed.working_dir = parsed.flag_value(WORKING_DIR_FLAG).map(PathBuf::from);
        parsed
    }

    /// Value of the first `--name=value` driver argument.
    pub fn flag_value(&self, name: &str) -> Option<&str> {
        self.driver_args.iter().find_map(|arg| {
            arg.strip_prefix(name)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }

    /// Record a generated working directory and forward it to the driver.
    pub fn set_working_dir(&mut self, dir: &Path) {
        self.driver_args
            .push(format!("{WORKING_DIR_FLAG}={}", dir.display()));
        self.working_dir = Some(dir.to_path_buf());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
