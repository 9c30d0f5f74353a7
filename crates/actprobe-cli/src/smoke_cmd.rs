//! `actprobe smoke`: launch the target and run the basic liveness checks.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use actprobe_core::session::{SessionPlan, run_session};

use crate::config::ProbeConfig;
use crate::run_cmd::print_outcome;

pub async fn run_smoke(config: ProbeConfig, json: bool, cancel: CancellationToken) -> Result<bool> {
    tracing::info!(target_cmd = %config.session.launch.program, "starting smoke session");
    let outcome = run_session(&config.session, &SessionPlan::Smoke, cancel).await;
    print_outcome(&outcome, json)?;
    Ok(outcome.passed())
}
