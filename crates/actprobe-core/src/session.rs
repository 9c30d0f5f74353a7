//! One harness session: start the target, wait for readiness, drive the
//! plan, and stop the target exactly once on every exit path.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::HarnessError;
use crate::readiness::{self, ReadinessPolicy, ReadinessReport};
use crate::report::RunReport;
use crate::smoke::run_smoke;
use crate::supervisor::{self, LaunchSpec, ProcessError, ProcessHandle, StopOutcome};
use crate::transport::RpcClient;
use crate::workflow::{ConflictClassifier, Step, WorkflowParams, run_workflow};

/// How long to wait for the child to be reaped when a stream failure
/// might be explained by it exiting.
const EXIT_PROBE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub launch: LaunchSpec,
    pub readiness: ReadinessPolicy,
    /// Per-call receive timeout. `None` waits forever.
    pub call_timeout: Option<Duration>,
    pub stop_grace: Duration,
}

impl SessionConfig {
    pub fn new(launch: LaunchSpec) -> Self {
        Self {
            launch,
            readiness: ReadinessPolicy::default(),
            call_timeout: Some(Duration::from_secs(30)),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// What to do once the target is ready.
#[derive(Debug, Clone)]
pub enum SessionPlan {
    /// Run the workflow `runs` times back to back against the same process.
    Workflow {
        params: WorkflowParams,
        classifier: ConflictClassifier,
        runs: u32,
    },
    Smoke,
}

#[derive(Debug, Default)]
pub struct SessionOutcome {
    pub pid: Option<u32>,
    pub readiness: Option<ReadinessReport>,
    pub reports: Vec<RunReport>,
    pub stop: Option<StopOutcome>,
    pub error: Option<HarnessError>,
}

impl SessionOutcome {
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.reports.iter().all(RunReport::passed)
    }
}

/// Run a full session. Never returns with the target still running.
pub async fn run_session(
    config: &SessionConfig,
    plan: &SessionPlan,
    cancel: CancellationToken,
) -> SessionOutcome {
    let mut outcome = SessionOutcome::default();

    let mut handle = match supervisor::start(&config.launch) {
        Ok(handle) => handle,
        Err(e) => {
            outcome.error = Some(HarnessError::process(e));
            return outcome;
        }
    };
    outcome.pid = Some(handle.pid());

    if let Err(err) = drive(&mut handle, config, plan, &cancel, &mut outcome).await {
        if matches!(err, HarnessError::Interrupted { .. }) {
            warn!(error = %err, "session cancelled, stopping target");
        }
        outcome.error = Some(attribute_exit(&mut handle, err).await);
    }

    match supervisor::stop(handle, config.stop_grace).await {
        Ok(stop) => outcome.stop = Some(stop),
        Err(e) => {
            warn!(error = %e, "failed to stop target process");
            if outcome.error.is_none() {
                outcome.error = Some(HarnessError::process(e));
            }
        }
    }

    info!(
        runs = outcome.reports.len(),
        passed = outcome.passed(),
        stop = ?outcome.stop,
        "session finished"
    );
    outcome
}

/// Cancellation during readiness abandons the probe. Once a run has started,
/// the client surfaces it as a failed call, so the run still finishes and its
/// partial report is kept.
async fn drive(
    handle: &mut ProcessHandle,
    config: &SessionConfig,
    plan: &SessionPlan,
    cancel: &CancellationToken,
    outcome: &mut SessionOutcome,
) -> Result<(), HarnessError> {
    let transport = handle.take_transport().map_err(HarnessError::process)?;
    let mut client = RpcClient::new(transport)
        .with_call_timeout(config.call_timeout)
        .with_cancel(cancel.clone());

    let ready = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(HarnessError::Interrupted {
                step: Some(Step::Readiness),
                request: None,
            });
        }
        r = readiness::await_ready(&mut client, &config.readiness) => r?,
    };
    outcome.readiness = Some(ready);

    match plan {
        SessionPlan::Smoke => {
            let run = run_smoke(&mut client, 1).await;
            outcome.reports.push(run.report);
            run.outcome
        }
        SessionPlan::Workflow {
            params,
            classifier,
            runs,
        } => {
            for index in 1..=(*runs).max(1) {
                if cancel.is_cancelled() {
                    return Err(HarnessError::Interrupted {
                        step: None,
                        request: None,
                    });
                }
                let run = run_workflow(&mut client, params, classifier, index).await;
                outcome.reports.push(run.report);
                run.outcome?;
            }
            Ok(())
        }
    }
}

/// Replace an EOF or write failure with a process error when the target has
/// in fact exited.
async fn attribute_exit(handle: &mut ProcessHandle, err: HarnessError) -> HarnessError {
    if !err.suggests_exit() {
        return err;
    }
    match handle.wait_for_exit(EXIT_PROBE).await {
        Ok(Some(status)) => {
            debug!(%status, original = %err, "stream failure explained by target exit");
            HarnessError::Process {
                step: err.step(),
                request: err.request().cloned(),
                source: ProcessError::Exited(status),
            }
        }
        _ => err,
    }
}
