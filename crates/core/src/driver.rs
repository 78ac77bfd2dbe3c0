//! Test-driver command lines and environment.
//!
//! Local runs build and run the driver through cargo; CI runs execute the
//! binary staged in the artifact directory. Build and run commands are
//! prefixed with the optional shell wrapper (`/usr/bin/time` by default).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::command::CommandSpec;
use crate::config::{CiMetadata, RunConfig};
use crate::names::{PROCESS_TEST_RESULTS_SUBCOMMAND, RUN_TESTS_SUBCOMMAND, TEST_DRIVER_BIN};

/// Directory of the chat notifier, relative to the project directory.
pub const NOTIFY_SLACK_DIR: &str = "gitlab-ci/src/notify_slack";

/// Driver command line, shared by every driver invocation of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestDriver {
    wrapper: Option<String>,
    /// Argv that starts the driver, before any subcommand.
    run_cmd: Vec<String>,
    local: bool,
}

impl TestDriver {
    /// Driver run through `cargo run`.
    pub fn local(wrapper: Option<String>) -> Self {
        Self {
            wrapper,
            run_cmd: local_run_cmd(),
            local: true,
        }
    }

    /// Driver binary staged in `artifact_dir`.
    pub fn staged(wrapper: Option<String>, artifact_dir: &Path) -> Self {
        Self {
            wrapper,
            run_cmd: vec![artifact_dir.join(TEST_DRIVER_BIN).display().to_string()],
            local: false,
        }
    }

    pub fn for_config(config: &RunConfig, artifact_dir: &Path) -> Self {
        if config.is_local_run() {
            Self::local(config.shell_wrapper.clone())
        } else {
            Self::staged(config.shell_wrapper.clone(), artifact_dir)
        }
    }

    /// `cargo build` of the driver; `None` when the driver is prebuilt.
    pub fn build_command(&self) -> Option<CommandSpec> {
        self.local.then(|| {
            self.wrapped(
                ["cargo", "build", "--bin", TEST_DRIVER_BIN]
                    .into_iter()
                    .map(String::from),
            )
        })
    }

    /// Driver help, for `-h`/`--help`. Only meaningful for local checkouts.
    pub fn help_command(wrapper: Option<String>) -> CommandSpec {
        let driver = Self::local(wrapper);
        driver.wrapped(
            driver
                .run_cmd
                .iter()
                .cloned()
                .chain(std::iter::once("--help".to_string())),
        )
    }

    /// `run-tests` invocation of the suite.
    pub fn run_tests_command(
        &self,
        driver_args: &[String],
        job_id: &str,
        ssh_key_dir: &Path,
        env: HashMap<String, String>,
    ) -> CommandSpec {
        let argv = self
            .run_cmd
            .iter()
            .cloned()
            .chain(std::iter::once(RUN_TESTS_SUBCOMMAND.to_string()))
            .chain(driver_args.iter().cloned())
            .chain([
                format!("--job-id={job_id}"),
                format!("--authorized-ssh-accounts={}", ssh_key_dir.display()),
            ]);
        self.wrapped(argv).env(env)
    }

    /// `process-test-results` invocation, which exits 0 when every test
    /// passed and 1 when some failed.
    pub fn process_results_command(&self, report: &ResultsReport<'_>) -> CommandSpec {
        let ci = report.ci;
        let mut argv = self
            .run_cmd
            .iter()
            .cloned()
            .chain(std::iter::once(PROCESS_TEST_RESULTS_SUBCOMMAND.to_string()))
            .chain([
                format!("--working-dir={}", report.working_dir.display()),
                format!("--ci-job-url={}", ci.job_url),
                format!("--ci-project-url={}", ci.project_url),
                format!("--ci-commit-sha={}", ci.commit_sha),
                format!("--ci-commit-short-sha={}", ci.commit_short_sha),
                format!("--ci-commit-date={}", report.commit_date),
                format!("--ic-version-id={}", report.ic_version_id),
                format!("--ic-version-id-date={}", report.ic_version_id_date),
            ]);
        // Result processing is quick; it is not wrapped.
        let program = argv.next().unwrap_or_default();
        CommandSpec::new(program).args(argv)
    }

    fn wrapped<I>(&self, argv: I) -> CommandSpec
    where
        I: IntoIterator<Item = String>,
    {
        let mut argv = argv.into_iter();
        match &self.wrapper {
            Some(wrapper) => CommandSpec::new(wrapper.clone()).args(argv),
            None => {
                let program = argv.next().unwrap_or_default();
                CommandSpec::new(program).args(argv)
            }
        }
    }
}

fn local_run_cmd() -> Vec<String> {
    ["cargo", "run", "--bin", TEST_DRIVER_BIN, "--"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Inputs of the `process-test-results` subcommand.
#[derive(Debug, Clone)]
pub struct ResultsReport<'a> {
    pub working_dir: &'a Path,
    pub ci: &'a CiMetadata,
    pub commit_date: &'a str,
    pub ic_version_id: &'a str,
    pub ic_version_id_date: &'a str,
}

/// Environment for the driver, derived from the runner's own.
///
/// `TMPDIR` points at a dedicated directory so everything the driver
/// leaves behind is removed with it.
pub fn driver_env<I>(
    base: I,
    is_local_run: bool,
    artifact_dir: &Path,
    project_dir: &Path,
    tmp_dir: &Path,
) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: HashMap<String, String> = base.into_iter().collect();
    env.insert("TMPDIR".to_string(), tmp_dir.display().to_string());

    let path = env.remove("PATH").unwrap_or_default();
    let tests_dir = project_dir.join("rs/tests");
    env.insert(
        "PATH".to_string(),
        prepend_path(&[tests_dir.as_path(), artifact_dir], &path),
    );

    if !is_local_run {
        env.insert(
            "XNET_TEST_CANISTER_WASM_PATH".to_string(),
            artifact_dir.join("xnet-test-canister.wasm").display().to_string(),
        );
    }

    let notify_dir: PathBuf = project_dir.join(NOTIFY_SLACK_DIR);
    let python_path = env.remove("PYTHONPATH").unwrap_or_default();
    env.insert(
        "PYTHONPATH".to_string(),
        prepend_path(&[notify_dir.as_path()], &python_path),
    );
    env
}

/// `a:b:existing`, omitting the trailing separator when `existing` is empty.
fn prepend_path(dirs: &[&Path], existing: &str) -> String {
    let mut parts: Vec<String> = dirs.iter().map(|d| d.display().to_string()).collect();
    if !existing.is_empty() {
        parts.push(existing.to_string());
    }
    parts.join(":")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_build_is_wrapped() {
        let driver = TestDriver::local(Some("/usr/bin/time".into()));
        let build = driver.build_command().unwrap();
        assert_eq!(build.program, "/usr/bin/time");
        assert_eq!(build.args, vec!["cargo", "build", "--bin", "prod-test-driver"]);
    }

    #[test]
    fn staged_driver_has_no_build() {
        let driver = TestDriver::staged(None, Path::new("/a"));
        assert!(driver.build_command().is_none());
    }

    #[test]
    fn help_runs_through_cargo() {
        let help = TestDriver::help_command(None);
        assert_eq!(help.program, "cargo");
        assert_eq!(help.args.last().map(String::as_str), Some("--help"));
    }

    #[test]
    fn run_tests_appends_job_and_keys() {
        let driver = TestDriver::staged(None, Path::new("/a"));
        let spec = driver.run_tests_command(
            &["--suite=hourly".to_string()],
            "77",
            Path::new("/keys"),
            HashMap::new(),
        );
        assert_eq!(spec.program, "/a/prod-test-driver");
        assert_eq!(
            spec.args,
            vec![
                "run-tests",
                "--suite=hourly",
                "--job-id=77",
                "--authorized-ssh-accounts=/keys",
            ]
        );
        assert_eq!(spec.env, Some(HashMap::new()));
    }

    #[test]
    fn process_results_is_not_wrapped() {
        let driver = TestDriver::staged(Some("/usr/bin/time".into()), Path::new("/a"));
        let ci = CiMetadata {
            commit_sha: "deadbeef".into(),
            ..Default::default()
        };
        let spec = driver.process_results_command(&ResultsReport {
            working_dir: Path::new("/wd"),
            ci: &ci,
            commit_date: "today",
            ic_version_id: "abc",
            ic_version_id_date: "yesterday",
        });
        assert_eq!(spec.program, "/a/prod-test-driver");
        assert_eq!(spec.args[0], "process-test-results");
        assert!(spec.args.contains(&"--working-dir=/wd".to_string()));
        assert!(spec.args.contains(&"--ci-commit-sha=deadbeef".to_string()));
        assert!(spec.args.contains(&"--ic-version-id-date=yesterday".to_string()));
    }

    #[test]
    fn driver_env_prefixes_paths() {
        let base = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let env = driver_env(base, false, Path::new("/art"), Path::new("/ic"), Path::new("/tmpd"));
        assert_eq!(env["PATH"], "/ic/rs/tests:/art:/usr/bin");
        assert_eq!(env["TMPDIR"], "/tmpd");
        assert_eq!(env["HOME"], "/root");
        assert_eq!(env["PYTHONPATH"], "/ic/gitlab-ci/src/notify_slack");
        assert_eq!(env["XNET_TEST_CANISTER_WASM_PATH"], "/art/xnet-test-canister.wasm");
    }

    #[test]
    fn local_env_has_no_xnet_path() {
        let base = vec![("PYTHONPATH".to_string(), "/lib".to_string())];
        let env = driver_env(base, true, Path::new("/art"), Path::new("/ic"), Path::new("/t"));
        assert!(!env.contains_key("XNET_TEST_CANISTER_WASM_PATH"));
        assert_eq!(env["PYTHONPATH"], "/ic/gitlab-ci/src/notify_slack:/lib");
    }
}
