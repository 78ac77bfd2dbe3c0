//! End-to-end run of a system test suite.
//!
//! [`Orchestrator::run`] resolves the configuration, prepares every input
//! of the test-driver, supervises the suite and reports on it. All temp
//! directories go through one [`TempDirRegistry`], drained when the run
//! returns or unwinds.

use std::collections::HashMap;
use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use systest_core::artifacts::{acquire, log_tree, AcquisitionStrategy, ArtifactSet};
use systest_core::checksum::ChecksumResolver;
use systest_core::cleanup::{make_temp_dir, TempDirRegistry};
use systest_core::command::{run_advisory, run_mandatory, CommandRunner, SystemCommandRunner};
use systest_core::config::{
    generate_local_job_id, RunConfig, RunMode, RunnerArgs, DEFAULT_SHELL_WRAPPER,
    REPLICA_LOG_DEBUG_OVERRIDES_FLAG,
};
use systest_core::dependencies::{system_env_manifest, DependencyInputs};
use systest_core::driver::{driver_env, TestDriver};
use systest_core::names::{
    DEPENDENCIES_DIR, NO_PROPAGATE_TEST_LOGS_FLAG, TIMEOUT_EXIT_CODE, TMP_ARTIFACTS_PREFIX,
    TMP_TEST_DRIVER_PREFIX, TMP_WORKING_DIR_PREFIX,
};
use systest_core::supervisor::{ProcessSupervisor, SupervisedExit};
use systest_core::{git, net, ssh};

use crate::report::{self, ReportContext, ReportPipeline};

/// Exit code of a run that failed before or outside the suite.
pub const FAILURE_EXIT_CODE: i32 = 1;

/// One system test run.
pub struct Orchestrator {
    runner: Arc<dyn CommandRunner>,
    /// Snapshot of the environment the runner was started with.
    env: HashMap<String, String>,
    cwd: PathBuf,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        env: HashMap<String, String>,
        cwd: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            env,
            cwd,
            cancel,
        }
    }

    /// Orchestrator over the real process environment.
    pub fn from_process(cancel: CancellationToken) -> std::io::Result<Self> {
        Ok(Self::new(
            Arc::new(SystemCommandRunner),
            utf8_env(std::env::vars_os()),
            std::env::current_dir()?,
            cancel,
        ))
    }

    fn resolve_config(&self) -> Result<RunConfig, systest_core::CoreError> {
        let lookup = |name: &str| self.env.get(name).cloned();
        RunConfig::resolve(&lookup, &self.cwd)
    }

    /// Print the driver's help and return the exit code.
    ///
    /// Help always goes through the default shell wrapper and, like a run,
    /// is refused outside the nix-shell on local machines.
    pub async fn help(&self) -> i32 {
        let lookup = |name: &str| self.env.get(name).cloned();
        if let Err(e) = RunMode::detect(&lookup) {
            tracing::error!(error = %e, "Invalid configuration");
            return FAILURE_EXIT_CODE;
        }
        let help = TestDriver::help_command(Some(DEFAULT_SHELL_WRAPPER.to_string()));
        run_advisory(self.runner.as_ref(), &help, "prod-test-driver --help").await;
        0
    }

    /// Await `fut` unless the run is interrupted first.
    async fn interruptible<T>(&self, fut: impl Future<Output = T>) -> anyhow::Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => anyhow::bail!("Interrupted before the test suite started"),
            value = fut => Ok(value),
        }
    }

    fn ensure_not_interrupted(&self) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            anyhow::bail!("Interrupted before the test suite started");
        }
        Ok(())
    }

    /// Run the suite and return the process exit code.
    ///
    /// Configuration errors return before anything is created or run.
    pub async fn run(&self, args: RunnerArgs) -> i32 {
        let config = match self.resolve_config() {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "Invalid configuration");
                return FAILURE_EXIT_CODE;
            }
        };

        let keep_artifacts = args.keep_artifacts;
        let mut registry = TempDirRegistry::new(args.keep_tmp_dirs);
        let code = match self.execute(&config, args, &mut registry).await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "System test run failed");
                FAILURE_EXIT_CODE
            }
        };

        let cleanup = registry.drain();
        tracing::debug!(
            removed = cleanup.removed,
            failed = cleanup.failed,
            retained = cleanup.retained,
            "Cleaned up temp directories",
        );
        if keep_artifacts {
            tracing::info!("Artifacts folder is not deleted, `--keep_artifacts` was set");
        }
        code
    }

    async fn execute(
        &self,
        config: &RunConfig,
        mut args: RunnerArgs,
        registry: &mut TempDirRegistry,
    ) -> anyhow::Result<i32> {
        let runner = self.runner.as_ref();
        tracing::info!(
            timeout_secs = config.suite_timeout.as_secs(),
            "Test suite execution timeout",
        );
        tracing::debug!(
            is_local_run = config.is_local_run(),
            is_merge_request = config.flags.is_merge_request,
            use_prebuilt_artifacts = config.prebuilt_artifact_dir.is_some(),
            honeycomb_push = config.flags.honeycomb_push,
            slack_test_failure_notify = config.flags.slack_test_failure_notify,
            slack_timeout_notify = config.flags.slack_timeout_notify,
            "Resolved run configuration",
        );

        if !config.is_local_run() {
            args.driver_args.push(NO_PROPAGATE_TEST_LOGS_FLAG.to_string());
        }
        let working_dir = match args.working_dir.clone() {
            Some(dir) => self.cwd.join(dir),
            None => {
                let dir = registry.create(TMP_WORKING_DIR_PREFIX)?;
                args.set_working_dir(&dir);
                dir
            }
        };
        tracing::debug!(args = ?args.driver_args, "Driver arguments");

        // Commit metadata
        let ic_version_id_date = self
            .interruptible(git::commit_date(runner, &config.ic_version_id))
            .await?;
        let current_commit = if config.is_local_run() {
            self.interruptible(git::current_commit_sha(runner)).await??
        } else {
            config.ci.commit_sha.clone()
        };
        let commit_date = self
            .interruptible(git::commit_date(runner, &current_commit))
            .await?;

        if config.is_local_run() {
            if let Some(build) = TestDriver::local(config.shell_wrapper.clone()).build_command() {
                tracing::info!("Building prod-test-driver binary");
                self.interruptible(run_mandatory(runner, &build))
                    .await?
                    .context("Failed to build prod-test-driver bin")?;
            }
        }

        if let Some(url) = &config.external_ip_lookup_url {
            self.interruptible(net::log_external_ipv6_address(url)).await?;
        }

        let resolver = ChecksumResolver::new()?;
        let images = self
            .interruptible(resolver.resolve_disk_images(
                &config.image_base_url,
                &config.ic_version_id,
                &config.guestos_version,
            ))
            .await?
            .context("Failed to resolve disk image checksums")?;

        let ssh_key_dir = self
            .interruptible(ssh::ensure_ssh_keys(
                config.ssh_key_dir.as_deref(),
                runner,
                registry,
            ))
            .await??;

        let job_id = config
            .job_id()
            .map(str::to_string)
            .unwrap_or_else(generate_local_job_id);

        let artifact_dir = if config.is_local_run() {
            let root = make_temp_dir(TMP_ARTIFACTS_PREFIX)?;
            if !args.keep_artifacts {
                registry.register(root.clone());
            }
            root.join("artifacts")
        } else {
            config.project_dir.join("artifacts")
        };
        tracing::info!(dir = %artifact_dir.display(), "Artifacts will be stored here");
        let artifacts = ArtifactSet {
            dir: artifact_dir,
            images,
        };

        let driver = TestDriver::for_config(config, &artifacts.dir);
        let driver_tmp_dir = registry.create(TMP_TEST_DRIVER_PREFIX)?;
        let env = driver_env(
            self.env.clone(),
            config.is_local_run(),
            &artifacts.dir,
            &config.project_dir,
            &driver_tmp_dir,
        );

        let strategy = AcquisitionStrategy::select(config);
        self.interruptible(acquire(
            &strategy,
            &artifacts.dir,
            &config.project_dir,
            runner,
            registry,
            args.keep_artifacts,
        ))
        .await?
        .context("Failed to acquire artifacts")?;
        log_tree(&artifacts.dir);
        self.ensure_not_interrupted()?;

        let dependencies_dir = working_dir.join(DEPENDENCIES_DIR);
        tracing::info!(dir = %dependencies_dir.display(), "Populating dependencies dir");
        let manifest = system_env_manifest(&DependencyInputs {
            project_dir: &config.project_dir,
            artifact_dir: &artifacts.dir,
            farm_base_url: &config.farm_base_url,
            journalbeat_hosts: &config.es_hostnames,
            replica_log_debug_overrides: args
                .flag_value(REPLICA_LOG_DEBUG_OVERRIDES_FLAG)
                .unwrap_or_default(),
            ic_version_id: &config.ic_version_id,
            images: &artifacts.images,
            rosetta_cli_dir: config.rosetta_cli_dir.as_deref(),
        });
        manifest.materialize(&dependencies_dir)?;
        log_tree(&dependencies_dir);
        self.ensure_not_interrupted()?;

        let run_spec =
            driver.run_tests_command(&args.driver_args, &job_id, &ssh_key_dir, env.clone());
        tracing::debug!(command = %run_spec, "Running test suite");
        let outcome = ProcessSupervisor::new(config.suite_timeout, self.cancel.clone())
            .run(&run_spec)
            .await?;
        match outcome {
            SupervisedExit::Exited(0) => {
                tracing::info!("Execution of the prod-test-driver succeeded");
            }
            SupervisedExit::Exited(code) => {
                tracing::error!(code, "Execution of the prod-test-driver failed");
            }
            SupervisedExit::TimedOut => {
                tracing::error!(code = TIMEOUT_EXIT_CODE, "Execution of the prod-test-driver timed out");
            }
            SupervisedExit::Cancelled => {
                anyhow::bail!("Interrupted before the test suite finished");
            }
        }

        let ctx = ReportContext {
            config,
            runner,
            driver: &driver,
            working_dir: &working_dir,
            job_id: &job_id,
            driver_env: &env,
            commit_date: &commit_date,
            ic_version_id_date: &ic_version_id_date,
        };
        if outcome == SupervisedExit::TimedOut && config.flags.slack_timeout_notify {
            report::notify_timeout(&ctx).await;
        }
        let suite_code = report::process_results(&ctx).await?;
        let steps = ReportPipeline::standard().run(&ctx).await;
        if steps.failed() > 0 {
            tracing::warn!(failed = steps.failed(), "Some report steps failed");
        }

        if outcome == SupervisedExit::TimedOut {
            report::log_timeout_hint(config);
            return Ok(TIMEOUT_EXIT_CODE);
        }
        Ok(suite_code)
    }
}

/// Environment snapshot holding only valid UTF-8 entries. Others are
/// logged and left out.
fn utf8_env<I>(vars: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(name, value)| match (name.into_string(), value.into_string()) {
            (Ok(name), Ok(value)) => Some((name, value)),
            (name, _) => {
                tracing::warn!(name = ?name, "Skipping environment variable that is not UTF-8");
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::os::unix::ffi::OsStringExt;

    use super::*;

    #[test]
    fn non_utf8_variables_are_skipped() {
        let env = utf8_env([
            (OsString::from("HOME"), OsString::from("/root")),
            (OsString::from("BYTES"), OsString::from_vec(b"f\xffo".to_vec())),
            (OsString::from_vec(b"K\xfe".to_vec()), OsString::from("v")),
        ]);
        assert_eq!(env.len(), 1);
        assert_eq!(env["HOME"], "/root");
    }
}
