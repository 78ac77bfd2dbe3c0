//! Test result telemetry push via `honeycomb.py`.

use std::path::{Path, PathBuf};

use systest_core::command::CommandSpec;

/// Push script, relative to the project directory.
const HONEYCOMB_SCRIPT: &str = "gitlab-ci/src/test_results/honeycomb.py";

/// Trace coordinates the results are attached to.
#[derive(Debug, Clone, Default)]
pub struct ResultsTrace {
    pub job_url: String,
    /// Root pipeline id.
    pub trace_id: String,
    /// Job id of this run.
    pub parent_id: String,
    pub job_name: String,
    pub pipeline_source: String,
}

/// Builds the telemetry push of one results file.
#[derive(Debug, Clone)]
pub struct HoneycombPush {
    project_dir: PathBuf,
}

impl HoneycombPush {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
        }
    }

    pub fn command(&self, results_file: &Path, trace: &ResultsTrace) -> CommandSpec {
        CommandSpec::new("python3").args([
            self.project_dir.join(HONEYCOMB_SCRIPT).display().to_string(),
            format!("--test_results={}", results_file.display()),
            format!("--job_url={}", trace.job_url),
            format!("--trace_id={}", trace.trace_id),
            format!("--parent_id={}", trace.parent_id),
            format!("--job_name={}", trace.job_name),
            format!("--ci_pipeline_source={}", trace.pipeline_source),
            "--type=system-tests".to_string(),
        ])
    }
}
