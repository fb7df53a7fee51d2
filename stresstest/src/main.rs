//! Runs publish and subscribe scenarios against a broker cluster and reports whether all checks
//! and thresholds held.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use argh::FromArgs;
use stresstest::TestPlan;
use stresstest::config::Config;
use stresstest::observability::init_tracing;
use tokio_util::sync::CancellationToken;

/// Exit code when a check or threshold failed.
const THRESHOLDS_FAILED: u8 = 99;

/// Stresstester for the message broker
#[derive(Debug, FromArgs)]
pub struct Args {
    /// path to the yaml configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    /// run only this scenario, can be given multiple times
    #[argh(option, short = 's')]
    pub scenario: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args: Args = argh::from_env();

    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.logging);
    tracing::debug!(?config);

    let plan = TestPlan::from_config(&config, &args.scenario).context("invalid configuration")?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, stopping all scenarios");
                cancel.cancel();
            }
        }
    });

    let summary = stresstest::run(plan, cancel).await;
    summary.print();

    if summary.passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(THRESHOLDS_FAILED))
    }
}
