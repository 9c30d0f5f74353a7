//! `actprobe run`: launch the target and drive the workflow one or more
//! times, then print the reports.

use std::fmt::Write as _;

use anyhow::Result;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use actprobe_core::session::{SessionOutcome, SessionPlan, run_session};
use actprobe_core::supervisor::StopOutcome;
use actprobe_core::workflow::WorkflowParams;

use crate::config::ProbeConfig;

/// Per-invocation workflow overrides from the command line.
#[derive(Debug, Default)]
pub struct WorkflowOverrides {
    pub tenant: Option<String>,
    pub provider: Option<String>,
    pub action_name: Option<String>,
    pub config_path: Option<String>,
    pub user_id: Option<String>,
    pub fresh: bool,
}

impl WorkflowOverrides {
    pub fn apply(self, params: &mut WorkflowParams) {
        if let Some(v) = self.tenant {
            params.tenant = v;
        }
        if let Some(v) = self.provider {
            params.provider = v;
        }
        if let Some(v) = self.action_name {
            params.action_name = v;
        }
        if let Some(v) = self.config_path {
            params.config_path = v;
        }
        if let Some(v) = self.user_id {
            params.user_id = v;
        }
        params.reset_action |= self.fresh;
    }
}

/// Run the workflow `runs` times against one target process. Returns
/// whether every run passed.
pub async fn run_workflow(
    config: ProbeConfig,
    overrides: WorkflowOverrides,
    runs: u32,
    json: bool,
    cancel: CancellationToken,
) -> Result<bool> {
    let ProbeConfig {
        session,
        mut params,
        classifier,
    } = config;
    overrides.apply(&mut params);
    tracing::info!(
        target_cmd = %session.launch.program,
        tenant = %params.tenant,
        action = %params.action_name,
        runs,
        "starting workflow session"
    );

    let plan = SessionPlan::Workflow {
        params,
        classifier,
        runs,
    };
    let outcome = run_session(&session, &plan, cancel).await;
    print_outcome(&outcome, json)?;
    Ok(outcome.passed())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

pub fn print_outcome(outcome: &SessionOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome_json(outcome))?);
    } else {
        print!("{}", render_outcome(outcome));
    }
    Ok(())
}

/// Text rendering: target summary, each run's table, then the verdict.
pub fn render_outcome(outcome: &SessionOutcome) -> String {
    let mut out = String::new();

    match outcome.pid {
        Some(pid) => {
            let _ = write!(out, "Target pid: {pid}");
            if let Some(ready) = &outcome.readiness {
                let _ = write!(
                    out,
                    " (ready after {} probe(s), {}ms)",
                    ready.attempts,
                    ready.waited.as_millis()
                );
            }
            let _ = writeln!(out);
        }
        None => {
            let _ = writeln!(out, "Target did not start");
        }
    }
    let _ = writeln!(out);

    for report in &outcome.reports {
        let _ = writeln!(out, "{}", report.render_text());
    }

    if let Some(stop) = &outcome.stop {
        let _ = writeln!(out, "Target stopped: {}", describe_stop(stop));
    }
    match &outcome.error {
        Some(err) => {
            let _ = writeln!(out, "Session: FAILED: {err}");
        }
        None if outcome.passed() => {
            let _ = writeln!(out, "Session: PASSED ({} run(s))", outcome.reports.len());
        }
        None => {
            let _ = writeln!(out, "Session: FAILED");
        }
    }
    out
}

fn outcome_json(outcome: &SessionOutcome) -> Value {
    let error = outcome.error.as_ref().map(|err| {
        json!({
            "message": err.to_string(),
            "step": err.step().map(|s| s.as_str()),
            "request": err.request(),
            "response": err.response(),
        })
    });
    json!({
        "passed": outcome.passed(),
        "pid": outcome.pid,
        "readiness": outcome.readiness.as_ref().map(|r| json!({
            "attempts": r.attempts,
            "waited_ms": r.waited.as_millis() as u64,
        })),
        "reports": outcome.reports,
        "stop": outcome.stop.as_ref().map(describe_stop),
        "error": error,
    })
}

fn describe_stop(stop: &StopOutcome) -> String {
    match stop {
        StopOutcome::AlreadyExited(status) => format!("already exited ({status})"),
        StopOutcome::Exited(status) => format!("exited ({status})"),
        StopOutcome::Killed => "killed after grace period".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use actprobe_core::HarnessError;
    use actprobe_core::report::{RunKind, RunReport};
    use actprobe_core::workflow::WorkflowPhase;

    #[test]
    fn overrides_replace_only_what_was_given() {
        let mut params = WorkflowParams::default();
        WorkflowOverrides {
            tenant: Some("acme".into()),
            fresh: true,
            ..WorkflowOverrides::default()
        }
        .apply(&mut params);

        assert_eq!(params.tenant, "acme");
        assert_eq!(params.provider, WorkflowParams::default().provider);
        assert!(params.reset_action);
    }

    #[test]
    fn render_lists_every_run_and_the_verdict() {
        let mut first = RunReport::new(RunKind::Workflow, 1);
        first.finish(Some(WorkflowPhase::Done), None);
        let mut second = RunReport::new(RunKind::Workflow, 2);
        second.finish(Some(WorkflowPhase::Done), None);
        let outcome = SessionOutcome {
            pid: Some(42),
            reports: vec![first, second],
            stop: Some(StopOutcome::Killed),
            ..SessionOutcome::default()
        };

        let text = render_outcome(&outcome);
        assert!(text.contains("Target pid: 42"));
        assert!(text.contains("Workflow run #1"));
        assert!(text.contains("Workflow run #2"));
        assert!(text.contains("Target stopped: killed"));
        assert!(text.contains("Session: PASSED (2 run(s))"));
    }

    #[test]
    fn json_carries_the_session_error() {
        let outcome = SessionOutcome {
            error: Some(HarnessError::Interrupted {
                step: None,
                request: None,
            }),
            ..SessionOutcome::default()
        };

        let value = outcome_json(&outcome);
        assert_eq!(value["passed"], false);
        assert!(value["pid"].is_null());
        assert_eq!(value["reports"], json!([]));
        assert!(!value["error"]["message"].as_str().unwrap().is_empty());
        assert!(render_outcome(&outcome).contains("Target did not start"));
    }
}
