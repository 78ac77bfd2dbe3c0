//! Post-run reporting.
//!
//! Once the suite has finished, three things happen in order:
//!
//! 1. [`notify_timeout`]: an advisory chat message when a scheduled job
//!    timed out.
//! 2. [`process_results`]: the driver classifies the run. Exit 0 is full
//!    success, exit 1 a partial failure; anything else aborts the run.
//! 3. [`ReportPipeline`]: best-effort steps (telemetry push, alert replay,
//!    summary). Every step runs, and a failing step is only logged.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context};
use async_trait::async_trait;
use systest_core::command::{CommandRunner, CommandSpec};
use systest_core::config::RunConfig;
use systest_core::driver::{ResultsReport, TestDriver};
use systest_core::names::{
    POT_SETUP_FILE, POT_SETUP_RESULT_FILE, SLACK_CHANNEL_NOTIFY, SLACK_FAILURE_ALERTS_FILE,
    TEST_RESULT_FILE,
};
use systest_events::{
    load_alerts, replay_alerts, HoneycombPush, ResultsTrace, SlackNotifier, TimeoutNotice,
};

/// Summary generator, relative to the project directory.
const SUMMARY_SCRIPT: &str = "gitlab-ci/src/test_results/summary.py";

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything the reporting steps read. Nothing in it changes after the
/// suite has run.
pub struct ReportContext<'a> {
    pub config: &'a RunConfig,
    pub runner: &'a dyn CommandRunner,
    pub driver: &'a TestDriver,
    pub working_dir: &'a Path,
    pub job_id: &'a str,
    /// Environment the driver ran with; the summary reuses it.
    pub driver_env: &'a HashMap<String, String>,
    pub commit_date: &'a str,
    pub ic_version_id_date: &'a str,
}

impl ReportContext<'_> {
    fn results_file(&self) -> std::path::PathBuf {
        self.working_dir.join(TEST_RESULT_FILE)
    }
}

// ---------------------------------------------------------------------------
// Timeout notification and result classification
// ---------------------------------------------------------------------------

/// Send the timeout notice once. Failures are logged.
pub async fn notify_timeout(ctx: &ReportContext<'_>) -> bool {
    let message = TimeoutNotice {
        ci: &ctx.config.ci,
        ic_version_id: &ctx.config.ic_version_id,
    }
    .message();
    let notifier = SlackNotifier::new(&ctx.config.project_dir, ctx.runner);
    match notifier.notify(&message, SLACK_CHANNEL_NOTIFY).await {
        Ok(()) => {
            tracing::info!("Sent timeout slack notification");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to send timeout slack notification");
            false
        }
    }
}

/// Map the result processor's exit code to the suite verdict.
pub fn classify_suite(code: i32) -> anyhow::Result<i32> {
    match code {
        0 | 1 => Ok(code),
        other => bail!("Processing of the test results failed unexpectedly with code={other}"),
    }
}

/// Run `process-test-results` and return the suite code (0 or 1).
pub async fn process_results(ctx: &ReportContext<'_>) -> anyhow::Result<i32> {
    let ci = &ctx.config.ci;
    let spec = ctx.driver.process_results_command(&ResultsReport {
        working_dir: ctx.working_dir,
        ci,
        commit_date: ctx.commit_date,
        ic_version_id: &ctx.config.ic_version_id,
        ic_version_id_date: ctx.ic_version_id_date,
    });
    tracing::debug!(command = %spec, "Processing test results");
    let code = ctx
        .runner
        .status(&spec)
        .await
        .context("Failed to run the test result processor")?;
    classify_suite(code)
}

// ---------------------------------------------------------------------------
// Best-effort steps
// ---------------------------------------------------------------------------

/// Result of one pipeline step that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    /// Disabled for this run.
    Skipped,
}

#[async_trait]
pub trait ReportStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &ReportContext<'_>) -> anyhow::Result<StepOutcome>;
}

/// Push the results file to telemetry. CI runs only.
pub struct HoneycombStep;

#[async_trait]
impl ReportStep for HoneycombStep {
    fn name(&self) -> &'static str {
        "honeycomb-push"
    }

    async fn run(&self, ctx: &ReportContext<'_>) -> anyhow::Result<StepOutcome> {
        if !ctx.config.flags.honeycomb_push {
            return Ok(StepOutcome::Skipped);
        }
        let ci = &ctx.config.ci;
        let trace = ResultsTrace {
            job_url: ci.job_url.clone(),
            trace_id: ci.root_pipeline_id.clone(),
            parent_id: ctx.job_id.to_string(),
            job_name: ci.job_name.clone(),
            pipeline_source: ci.pipeline_source.clone(),
        };
        let spec = HoneycombPush::new(&ctx.config.project_dir).command(&ctx.results_file(), &trace);
        expect_success(ctx.runner, &spec).await
    }
}

/// Replay the failure alerts queued by the driver. Scheduled CI runs only.
pub struct AlertReplayStep;

#[async_trait]
impl ReportStep for AlertReplayStep {
    fn name(&self) -> &'static str {
        "slack-alert-replay"
    }

    async fn run(&self, ctx: &ReportContext<'_>) -> anyhow::Result<StepOutcome> {
        if !ctx.config.flags.slack_test_failure_notify {
            return Ok(StepOutcome::Skipped);
        }
        let alerts = load_alerts(&ctx.working_dir.join(SLACK_FAILURE_ALERTS_FILE)).await?;
        let notifier = SlackNotifier::new(&ctx.config.project_dir, ctx.runner);
        let report = replay_alerts(&alerts, &notifier).await;
        if report.failed > 0 {
            bail!("{} of {} alerts could not be sent", report.failed, alerts.len());
        }
        Ok(StepOutcome::Done)
    }
}

/// Human-readable summary, printed to stderr so CI log viewers show it.
pub struct SummaryStep;

impl SummaryStep {
    pub fn command(ctx: &ReportContext<'_>) -> CommandSpec {
        let mut spec = CommandSpec::new("python3")
            .args([
                ctx.config.project_dir.join(SUMMARY_SCRIPT).display().to_string(),
                format!("--test_results={}", ctx.results_file().display()),
                format!("--working_dir={}", ctx.working_dir.display()),
                format!("--pot_setup_file={POT_SETUP_FILE}"),
                format!("--pot_setup_result_file={POT_SETUP_RESULT_FILE}"),
            ])
            .env(ctx.driver_env.clone())
            .stdout_to_stderr();
        if ctx.config.is_local_run() {
            spec = spec.arg("--verbose");
        }
        spec
    }
}

#[async_trait]
impl ReportStep for SummaryStep {
    fn name(&self) -> &'static str {
        "summary"
    }

    async fn run(&self, ctx: &ReportContext<'_>) -> anyhow::Result<StepOutcome> {
        expect_success(ctx.runner, &Self::command(ctx)).await
    }
}

async fn expect_success(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
) -> anyhow::Result<StepOutcome> {
    match runner.status(spec).await? {
        0 => Ok(StepOutcome::Done),
        code => bail!("`{spec}` exited with code {code}"),
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Per-step results of a pipeline run, in step order.
#[derive(Debug, Default)]
pub struct PipelineReport {
    pub steps: Vec<(&'static str, Result<StepOutcome, String>)>,
}

impl PipelineReport {
    pub fn failed(&self) -> usize {
        self.steps.iter().filter(|(_, r)| r.is_err()).count()
    }
}

/// Fixed sequence of best-effort reporting steps.
pub struct ReportPipeline {
    steps: Vec<Box<dyn ReportStep>>,
}

impl ReportPipeline {
    pub fn new(steps: Vec<Box<dyn ReportStep>>) -> Self {
        Self { steps }
    }

    /// Telemetry push, alert replay, then summary.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(HoneycombStep),
            Box::new(AlertReplayStep),
            Box::new(SummaryStep),
        ])
    }

    /// Run every step in order. A failing step is logged and the next one
    /// still runs.
    pub async fn run(&self, ctx: &ReportContext<'_>) -> PipelineReport {
        let mut report = PipelineReport::default();
        for step in &self.steps {
            let name = step.name();
            let result = match step.run(ctx).await {
                Ok(outcome) => {
                    tracing::info!(step = name, outcome = ?outcome, "Report step finished");
                    Ok(outcome)
                }
                Err(e) => {
                    tracing::error!(step = name, error = %format!("{e:#}"), "Report step failed");
                    Err(format!("{e:#}"))
                }
            };
            report.steps.push((name, result));
        }
        report
    }
}

/// Logged near the end of a timed-out run so it is easy to spot.
pub fn log_timeout_hint(config: &RunConfig) {
    tracing::warn!(
        timeout_secs = config.suite_timeout.as_secs(),
        "Test suite execution has timed out. Consider raising SYSTEM_TESTS_TIMEOUT",
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use systest_core::command::{CommandError, CommandOutput};

    use super::*;

    #[test]
    fn only_zero_and_one_are_verdicts() {
        assert_eq!(classify_suite(0).unwrap(), 0);
        assert_eq!(classify_suite(1).unwrap(), 1);
        assert!(classify_suite(2).is_err());
        assert!(classify_suite(124).is_err());
    }

    struct Step {
        name: &'static str,
        fail: bool,
        ran: Mutex<bool>,
    }

    #[async_trait]
    impl ReportStep for Step {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, _ctx: &ReportContext<'_>) -> anyhow::Result<StepOutcome> {
            *self.ran.lock().unwrap() = true;
            if self.fail {
                bail!("{} broke", self.name);
            }
            Ok(StepOutcome::Done)
        }
    }

    struct NoopRunner;

    #[async_trait]
    impl CommandRunner for NoopRunner {
        async fn status(&self, _spec: &CommandSpec) -> Result<i32, CommandError> {
            Ok(0)
        }

        async fn output(&self, _spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
            Ok(CommandOutput::default())
        }
    }

    fn local_config() -> RunConfig {
        let env: HashMap<&str, &str> = [("IC_VERSION_ID", "abc"), ("IN_NIX_SHELL", "pure")]
            .into_iter()
            .collect();
        RunConfig::resolve(&|name: &str| env.get(name).map(|v| v.to_string()), Path::new("/ic"))
            .unwrap()
    }

    #[tokio::test]
    async fn failing_step_does_not_stop_the_pipeline() {
        let config = local_config();
        let driver = TestDriver::local(None);
        let env = HashMap::new();
        let ctx = ReportContext {
            config: &config,
            runner: &NoopRunner,
            driver: &driver,
            working_dir: Path::new("/wd"),
            job_id: "job",
            driver_env: &env,
            commit_date: "",
            ic_version_id_date: "",
        };
        let pipeline = ReportPipeline::new(vec![
            Box::new(Step { name: "first", fail: false, ran: Mutex::new(false) }),
            Box::new(Step { name: "second", fail: true, ran: Mutex::new(false) }),
            Box::new(Step { name: "third", fail: false, ran: Mutex::new(false) }),
        ]);

        let report = pipeline.run(&ctx).await;

        let names: Vec<&str> = report.steps.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.steps[1].1, Err("second broke".to_string()));
        assert_eq!(report.steps[2].1, Ok(StepOutcome::Done));
    }

    #[tokio::test]
    async fn local_runs_skip_ci_only_steps() {
        let config = local_config();
        let driver = TestDriver::local(None);
        let env = HashMap::new();
        let ctx = ReportContext {
            config: &config,
            runner: &NoopRunner,
            driver: &driver,
            working_dir: Path::new("/wd"),
            job_id: "job",
            driver_env: &env,
            commit_date: "",
            ic_version_id_date: "",
        };

        assert_eq!(HoneycombStep.run(&ctx).await.unwrap(), StepOutcome::Skipped);
        assert_eq!(AlertReplayStep.run(&ctx).await.unwrap(), StepOutcome::Skipped);

        let summary = SummaryStep::command(&ctx);
        assert_eq!(summary.program, "python3");
        assert_eq!(
            summary.args,
            vec![
                "/ic/gitlab-ci/src/test_results/summary.py",
                "--test_results=/wd/test-results.json",
                "--working_dir=/wd",
                "--pot_setup_file=group_setup.json",
                "--pot_setup_result_file=pot_setup_result.json",
                "--verbose",
            ]
        );
        assert_eq!(summary.stdout, systest_core::command::StdoutTarget::Stderr);
    }
}
