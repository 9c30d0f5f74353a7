//! Drives one workflow run against a ready target.
//!
//! Steps run strictly in order, one call in flight at a time. Each step
//! that creates a resource tolerates the resource already existing, so the
//! whole run can be repeated against the same backing state and still end
//! in DONE with equivalent handles.

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::HarnessError;
use crate::report::{RunKind, RunReport, StepRecord, StepStatus};
use crate::rpc::{self, Params, ResponseOutcome, RpcError};
use crate::transport::client::CallError;
use crate::transport::{Exchange, RpcClient, RpcTransport};
use crate::verify;

use super::classify::{ConflictClassifier, StepOutcome};
use super::phase::{PhaseTracker, Step, WorkflowPhase};
use super::state::{
    ActionTrn, ConnectionTrn, ExecutionTrn, WorkflowParams, WorkflowState, WorkflowSummary,
};
use super::trn;

/// Everything a finished run produced, whether or not it succeeded.
#[derive(Debug)]
pub struct WorkflowRun {
    pub report: RunReport,
    pub state: WorkflowState,
    pub phases: Vec<WorkflowPhase>,
    pub outcome: Result<WorkflowSummary, HarnessError>,
}

impl WorkflowRun {
    pub fn final_phase(&self) -> WorkflowPhase {
        self.phases.last().copied().unwrap_or(WorkflowPhase::Start)
    }
}

/// Run the full workflow once. See [`WorkflowOrchestrator`].
pub async fn run_workflow<T: RpcTransport>(
    client: &mut RpcClient<T>,
    params: &WorkflowParams,
    classifier: &ConflictClassifier,
    run_index: u32,
) -> WorkflowRun {
    WorkflowOrchestrator::new(client, params, classifier, run_index)
        .run()
        .await
}

pub struct WorkflowOrchestrator<'a, T> {
    client: &'a mut RpcClient<T>,
    params: &'a WorkflowParams,
    classifier: &'a ConflictClassifier,
    state: WorkflowState,
    phases: PhaseTracker,
    report: RunReport,
}

impl<'a, T: RpcTransport> WorkflowOrchestrator<'a, T> {
    pub fn new(
        client: &'a mut RpcClient<T>,
        params: &'a WorkflowParams,
        classifier: &'a ConflictClassifier,
        run_index: u32,
    ) -> Self {
        Self {
            client,
            params,
            classifier,
            state: WorkflowState::default(),
            phases: PhaseTracker::new(),
            report: RunReport::new(RunKind::Workflow, run_index),
        }
    }

    pub async fn run(mut self) -> WorkflowRun {
        info!(
            run_id = %self.report.run_id,
            run_index = self.report.run_index,
            tenant = %self.params.tenant,
            provider = %self.params.provider,
            action = %self.params.action_name,
            "starting workflow run"
        );

        let outcome = self.drive().await;
        match &outcome {
            Ok(summary) => info!(
                run_id = %self.report.run_id,
                execution_trn = %summary.execution,
                "workflow run reached DONE"
            ),
            Err(e) => {
                warn!(
                    run_id = %self.report.run_id,
                    phase = %self.phases.current(),
                    error = %e,
                    "workflow run failed"
                );
                self.phases.fail();
            }
        }

        self.report.finish(
            Some(self.phases.current()),
            outcome.as_ref().err().map(ToString::to_string),
        );
        WorkflowRun {
            report: self.report,
            state: self.state,
            phases: self.phases.history().to_vec(),
            outcome,
        }
    }

    async fn drive(&mut self) -> Result<WorkflowSummary, HarnessError> {
        self.health().await?;
        self.phases.advance(WorkflowPhase::HealthOk)?;

        if self.params.reset_action {
            self.reset_action().await?;
        }

        let action = self.register_action().await?;
        self.state.action = Some(action.clone());
        self.phases.advance(WorkflowPhase::ActionRegistered)?;

        self.sync_action_content(&action).await?;
        self.phases.advance(WorkflowPhase::ActionContentSynced)?;

        let auth = self.establish_auth().await?;
        self.state.auth = Some(auth.clone());
        self.phases.advance(WorkflowPhase::AuthReady)?;

        self.bind(&action, &auth).await?;
        self.phases.advance(WorkflowPhase::Bound)?;

        let execution = self.run_action(&action).await?;
        self.state.execution = Some(execution.clone());
        self.phases.advance(WorkflowPhase::Executed)?;

        self.verify_execution(&execution).await?;
        self.list_executions(&execution).await?;
        self.phases.advance(WorkflowPhase::Verified)?;
        self.phases.advance(WorkflowPhase::Done)?;

        Ok(WorkflowSummary {
            action,
            auth,
            execution,
        })
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    async fn health(&mut self) -> Result<(), HarnessError> {
        let step = Step::Health;
        let ex = self.call(step, "health", None).await?;
        verify::require_success(step, &ex).map_err(|e| self.failed(step, &ex, e))?;
        self.record(step, &ex, StepStatus::Passed, None);
        Ok(())
    }

    /// Best-effort removal of the action so registration starts clean.
    async fn reset_action(&mut self) -> Result<(), HarnessError> {
        let step = Step::ResetAction;
        let p = self.params;
        let handle = trn::action_trn(&p.tenant, &p.provider, &p.action_name);
        let ex = self
            .call(step, "action.delete", Some(rpc::params(json!({ "trn": handle }))))
            .await?;

        match ex.response.error() {
            None => {
                self.record(step, &ex, StepStatus::Passed, Some(format!("deleted {handle}")));
            }
            Some(err) => {
                warn!(step = %step, action_trn = %handle, error = %err, "action delete failed, continuing");
                let detail = format!("ignored: {err}");
                self.record(step, &ex, StepStatus::Skipped, Some(detail));
            }
        }
        Ok(())
    }

    async fn register_action(&mut self) -> Result<ActionTrn, HarnessError> {
        let step = Step::RegisterAction;
        let p = self.params;
        let ex = self
            .call(
                step,
                "action.register",
                Some(rpc::params(json!({
                    "config_path": p.config_path,
                    "tenant": p.tenant,
                    "provider": p.provider,
                    "name": p.action_name,
                }))),
            )
            .await?;

        match self.classifier.classify(&ex.response) {
            StepOutcome::Success(_) => {
                let handle = verify::require_handle(step, &ex, "action_trn")
                    .map_err(|e| self.failed(step, &ex, e))?;
                self.record(step, &ex, StepStatus::Passed, None);
                Ok(ActionTrn(handle))
            }
            StepOutcome::KnownConflict { reason, error } => {
                let handle = trn::action_trn(&p.tenant, &p.provider, &p.action_name);
                warn!(
                    step = %step,
                    %reason,
                    error = %error,
                    action_trn = %handle,
                    "action already registered, using its deterministic handle"
                );
                let detail = format!("conflict ({reason}), using {handle}");
                self.record(step, &ex, StepStatus::Recovered, Some(detail));
                Ok(ActionTrn(handle))
            }
            StepOutcome::Fatal(error) => {
                let err = protocol_error(step, &ex, error);
                Err(self.failed(step, &ex, err))
            }
        }
    }

    /// Push the definition again so a re-registered action matches the file.
    async fn sync_action_content(&mut self, action: &ActionTrn) -> Result<(), HarnessError> {
        let step = Step::SyncActionContent;
        let ex = self
            .call(
                step,
                "action.update",
                Some(rpc::params(json!({
                    "trn": action.as_str(),
                    "config_path": self.params.config_path,
                }))),
            )
            .await?;
        verify::require_success(step, &ex).map_err(|e| self.failed(step, &ex, e))?;
        self.record(step, &ex, StepStatus::Passed, None);
        Ok(())
    }

    async fn establish_auth(&mut self) -> Result<ConnectionTrn, HarnessError> {
        let step = Step::EstablishAuth;
        let p = self.params;
        let ex = self
            .call(
                step,
                "auth.pat",
                Some(rpc::params(json!({
                    "tenant": p.tenant,
                    "provider": p.provider,
                    "user_id": p.user_id,
                    "access_token": p.access_token,
                }))),
            )
            .await?;

        let original = match &ex.response.outcome {
            ResponseOutcome::Result(_) => {
                let handle = verify::require_handle(step, &ex, "connection_trn")
                    .map_err(|e| self.failed(step, &ex, e))?;
                self.record(step, &ex, StepStatus::Passed, None);
                return Ok(ConnectionTrn(handle));
            }
            ResponseOutcome::Error(error) => error.clone(),
        };

        let classified = self
            .classifier
            .conflict_reason(&original)
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unclassified".to_string());
        warn!(step = %step, error = %original, classified = %classified, "auth.pat failed, falling back to auth.list");
        self.record(
            step,
            &ex,
            StepStatus::Skipped,
            Some(format!("{original} ({classified}), falling back to auth.list")),
        );

        let list = self.call(step, "auth.list", None).await?;
        let connections = verify::require_array(step, &list, "connections")
            .map_err(|e| self.failed(step, &list, e))?;
        let found = connections
            .iter()
            .filter_map(Value::as_str)
            .find(|h| trn::connection_matches(h, &p.tenant, &p.provider))
            .map(str::to_string);

        match found {
            Some(handle) => {
                let detail = format!("reusing {handle}");
                self.record(step, &list, StepStatus::Recovered, Some(detail));
                Ok(ConnectionTrn(handle))
            }
            None => {
                let err = HarnessError::Unrecovered {
                    step,
                    original,
                    reason: format!(
                        "none of {} connection(s) mention tenant `{}` and provider `{}`",
                        connections.len(),
                        p.tenant,
                        p.provider
                    ),
                    request: list.request.clone(),
                    response: list.response.to_value(),
                };
                Err(self.failed(step, &list, err))
            }
        }
    }

    async fn bind(&mut self, action: &ActionTrn, auth: &ConnectionTrn) -> Result<(), HarnessError> {
        let step = Step::Bind;
        let p = self.params;
        let tenant = p.tenant.as_str();
        let ex = self
            .call(
                step,
                "binding.create",
                Some(rpc::params(json!({
                    "tenant": tenant,
                    "action_trn": action.as_str(),
                    "auth_trn": auth.as_str(),
                }))),
            )
            .await?;

        let original = match ex.response.error() {
            None => {
                self.record(step, &ex, StepStatus::Passed, None);
                return Ok(());
            }
            Some(error) => error.clone(),
        };

        warn!(step = %step, error = %original, "binding.create failed, checking for an existing binding");
        self.record(
            step,
            &ex,
            StepStatus::Skipped,
            Some(format!("{original}, falling back to binding.get")),
        );

        let get = self
            .call(
                step,
                "binding.get",
                Some(rpc::params(json!({
                    "tenant": tenant,
                    "action_trn": action.as_str(),
                }))),
            )
            .await?;

        let result = match &get.response.outcome {
            ResponseOutcome::Result(value) => value,
            ResponseOutcome::Error(error) => {
                let err = HarnessError::Unrecovered {
                    step,
                    original,
                    reason: format!("binding.get returned {error}"),
                    request: get.request.clone(),
                    response: get.response.to_value(),
                };
                return Err(self.failed(step, &get, err));
            }
        };

        let bound_auth = verify::field(result, "binding")
            .and_then(|b| b.get("auth_trn"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let detail = match bound_auth {
            Some(ref existing) if existing != auth.as_str() => {
                warn!(
                    step = %step,
                    existing = %existing,
                    wanted = %auth,
                    "action is bound to a different connection"
                );
                format!("existing binding uses {existing}")
            }
            _ => "existing binding".to_string(),
        };
        self.record(step, &get, StepStatus::Recovered, Some(detail));
        Ok(())
    }

    async fn run_action(&mut self, action: &ActionTrn) -> Result<ExecutionTrn, HarnessError> {
        let step = Step::Run;
        let ex = self
            .call(
                step,
                "run",
                Some(rpc::params(json!({
                    "tenant": self.params.tenant,
                    "action_trn": action.as_str(),
                }))),
            )
            .await?;

        let handle = verify::require_handle(step, &ex, "execution_trn")
            .map_err(|e| self.failed(step, &ex, e))?;
        let status = ex
            .response
            .result()
            .and_then(|r| verify::field(r, "status"))
            .and_then(Value::as_str)
            .map(|s| format!(" ({s})"))
            .unwrap_or_default();
        self.record(step, &ex, StepStatus::Passed, Some(format!("{handle}{status}")));
        Ok(ExecutionTrn(handle))
    }

    async fn verify_execution(&mut self, execution: &ExecutionTrn) -> Result<(), HarnessError> {
        let step = Step::VerifyExecution;
        let ex = self
            .call(
                step,
                "execution.get",
                Some(rpc::params(json!({ "execution_trn": execution.as_str() }))),
            )
            .await?;
        verify::require_object(step, &ex, "execution").map_err(|e| self.failed(step, &ex, e))?;
        self.record(step, &ex, StepStatus::Passed, None);
        Ok(())
    }

    async fn list_executions(&mut self, execution: &ExecutionTrn) -> Result<(), HarnessError> {
        let step = Step::ListExecutions;
        let limit = self.params.execution_limit;
        let offset = self.params.execution_offset;
        let ex = self
            .call(
                step,
                "execution.list",
                Some(rpc::params(json!({
                    "tenant": self.params.tenant,
                    "limit": limit,
                    "offset": offset,
                }))),
            )
            .await?;

        let items = verify::require_array(step, &ex, "executions")
            .map_err(|e| self.failed(step, &ex, e))?;

        let detail = if verify::contains_handle(items, "execution_trn", execution.as_str()) {
            format!("{} execution(s), includes {execution}", items.len())
        } else if offset > 0 || (limit > 0 && items.len() >= limit as usize) {
            // Ordering is up to the service; a full or offset page may
            // legitimately omit the newest execution.
            warn!(
                step = %step,
                execution_trn = %execution,
                returned = items.len(),
                limit,
                offset,
                "execution not on the listed page"
            );
            format!("{} execution(s), {execution} not on this page", items.len())
        } else {
            let err = HarnessError::Assertion {
                step,
                field: "executions".to_string(),
                expectation: format!("an entry for {execution}"),
                request: ex.request.clone(),
                response: ex.response.to_value(),
            };
            return Err(self.failed(step, &ex, err));
        };
        self.record(step, &ex, StepStatus::Passed, Some(detail));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn call(
        &mut self,
        step: Step,
        method: &str,
        params: Option<Params>,
    ) -> Result<Exchange, HarnessError> {
        debug!(step = %step, method, "step call");
        match self.client.call(method, params).await {
            Ok(exchange) => Ok(exchange),
            Err(CallError { request, source }) => {
                self.report.record(StepRecord {
                    step,
                    method: request.method.clone(),
                    id: Some(request.id),
                    params: request.params_value(),
                    response: None,
                    status: StepStatus::Failed,
                    detail: Some(source.to_string()),
                    duration_ms: 0,
                });
                Err(HarnessError::from_call(step, request, source))
            }
        }
    }

    fn record(&mut self, step: Step, exchange: &Exchange, status: StepStatus, detail: Option<String>) {
        let mut rec = StepRecord::from_exchange(step, exchange, status);
        rec.detail = detail;
        self.report.record(rec);
    }

    fn failed(&mut self, step: Step, exchange: &Exchange, err: HarnessError) -> HarnessError {
        self.report
            .record(StepRecord::from_exchange(step, exchange, StepStatus::Failed).with_detail(err.to_string()));
        err
    }
}

fn protocol_error(step: Step, exchange: &Exchange, error: RpcError) -> HarnessError {
    HarnessError::Protocol {
        step,
        request: exchange.request.clone(),
        response: exchange.response.to_value(),
        error,
    }
}
