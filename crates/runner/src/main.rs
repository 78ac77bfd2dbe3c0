//! `run-system-tests` -- prepares and runs a system test suite.
//!
//! Resolves images and artifacts, materializes the dependency tree the
//! test-driver expects, runs `prod-test-driver run-tests` under a timeout
//! and reports the results.
//!
//! Runner flags (`--keep_artifacts`, `--keep_tmp_dirs`) are consumed here;
//! every other argument is forwarded to the driver. See
//! `systest_core::config` for the environment variables.
//!
//! Exit codes: `0` all tests passed, `1` some tests failed or the run
//! itself failed, `124` the suite timed out.

use systest_core::config::RunnerArgs;
use systest_runner::orchestrator::FAILURE_EXIT_CODE;
use systest_runner::Orchestrator;
use tokio_util::sync::CancellationToken;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str =
    "run_system_tests=debug,systest_runner=debug,systest_core=debug,systest_events=debug";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = RunnerArgs::parse(
        std::env::args_os()
            .skip(1)
            .map(|arg| arg.to_string_lossy().into_owned()),
    );
    tracing::debug!(args = ?args.driver_args, "Input arguments");

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping the test suite");
            interrupt.cancel();
        }
    });

    let orchestrator = match Orchestrator::from_process(cancel) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            tracing::error!(error = %e, "Failed to read the working directory");
            std::process::exit(FAILURE_EXIT_CODE);
        }
    };

    if args.help {
        std::process::exit(orchestrator.help().await);
    }

    // A panic inside the run unwinds through its temp dir registry, which
    // removes the directories; it then surfaces here as a join error.
    let code = match tokio::spawn(async move { orchestrator.run(args).await }).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "System test run aborted unexpectedly");
            FAILURE_EXIT_CODE
        }
    };
    std::process::exit(code);
}
