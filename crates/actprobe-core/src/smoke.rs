//! Basic liveness checks: health twice, status, doctor, and one method the
//! target must reject.
//!
//! Unlike the workflow, a failed check does not stop the remaining checks;
//! only a transport failure does, since the stream is no longer usable.

use serde_json::Value;
use tracing::{info, warn};

use crate::error::HarnessError;
use crate::report::{RunKind, RunReport, StepRecord, StepStatus};
use crate::transport::client::CallError;
use crate::transport::{Exchange, RpcClient, RpcTransport};
use crate::verify;
use crate::workflow::Step;

/// A method name no action service registers.
pub const UNKNOWN_METHOD: &str = "invalid_method";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Success,
    Error,
}

const CHECKS: &[(Step, &str, Expect)] = &[
    (Step::Health, "health", Expect::Success),
    (Step::Health, "health", Expect::Success),
    (Step::Status, "status", Expect::Success),
    (Step::Doctor, "doctor", Expect::Success),
    (Step::UnknownMethod, UNKNOWN_METHOD, Expect::Error),
];

#[derive(Debug)]
pub struct SmokeRun {
    pub report: RunReport,
    /// The first failed check, if any.
    pub outcome: Result<(), HarnessError>,
}

pub async fn run_smoke<T: RpcTransport>(client: &mut RpcClient<T>, run_index: u32) -> SmokeRun {
    let mut report = RunReport::new(RunKind::Smoke, run_index);
    let mut first_error: Option<HarnessError> = None;

    for &(step, method, expect) in CHECKS {
        let exchange = match client.call(method, None).await {
            Ok(ex) => ex,
            Err(CallError { request, source }) => {
                report.record(StepRecord {
                    step,
                    method: request.method.clone(),
                    id: Some(request.id),
                    params: request.params_value(),
                    response: None,
                    status: StepStatus::Failed,
                    detail: Some(source.to_string()),
                    duration_ms: 0,
                });
                first_error.get_or_insert(HarnessError::from_call(step, request, source));
                break;
            }
        };

        match check(step, &exchange, expect) {
            Ok(detail) => {
                let mut rec = StepRecord::from_exchange(step, &exchange, StepStatus::Passed);
                rec.detail = detail;
                report.record(rec);
            }
            Err(err) => {
                warn!(step = %step, method, error = %err, "smoke check failed");
                report.record(
                    StepRecord::from_exchange(step, &exchange, StepStatus::Failed)
                        .with_detail(err.to_string()),
                );
                first_error.get_or_insert(err);
            }
        }
    }

    report.finish(None, first_error.as_ref().map(ToString::to_string));
    info!(
        run_id = %report.run_id,
        passed = report.count(StepStatus::Passed),
        failed = report.count(StepStatus::Failed),
        "smoke checks finished"
    );
    SmokeRun {
        report,
        outcome: first_error.map_or(Ok(()), Err),
    }
}

fn check(step: Step, exchange: &Exchange, expect: Expect) -> Result<Option<String>, HarnessError> {
    match expect {
        Expect::Success => {
            let result = verify::require_success(step, exchange)?;
            Ok(summarize(result))
        }
        Expect::Error => match exchange.response.error() {
            Some(err) => Ok(Some(format!("rejected with {err}"))),
            None => Err(HarnessError::Assertion {
                step,
                field: "error".to_string(),
                expectation: "an error object".to_string(),
                request: exchange.request.clone(),
                response: exchange.response.to_value(),
            }),
        },
    }
}

/// `status` plus the issue count `doctor` reports.
fn summarize(result: &Value) -> Option<String> {
    let status = verify::field(result, "status").and_then(Value::as_str)?;
    match verify::field(result, "issues").and_then(Value::as_array) {
        Some(issues) if !issues.is_empty() => Some(format!("{status}, {} issue(s)", issues.len())),
        _ => Some(status.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn summary_includes_doctor_issues() {
        let doctor = json!({"status": "issues_found", "issues": ["OPENACT_MASTER_KEY not set"]});
        assert_eq!(summarize(&doctor).as_deref(), Some("issues_found, 1 issue(s)"));
        assert_eq!(summarize(&json!({"status": "healthy"})).as_deref(), Some("healthy"));
        assert_eq!(summarize(&json!(null)), None);
    }
}
