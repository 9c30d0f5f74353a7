//! Workflow phases, the allowed transition graph, and step names.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Where a workflow run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Start,
    HealthOk,
    ActionRegistered,
    ActionContentSynced,
    AuthReady,
    Bound,
    Executed,
    Verified,
    Done,
    Failed,
}

impl WorkflowPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Start => "START",
            Self::HealthOk => "HEALTH_OK",
            Self::ActionRegistered => "ACTION_REGISTERED",
            Self::ActionContentSynced => "ACTION_CONTENT_SYNCED",
            Self::AuthReady => "AUTH_READY",
            Self::Bound => "BOUND",
            Self::Executed => "EXECUTED",
            Self::Verified => "VERIFIED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid workflow transition: {from} -> {to}")]
pub struct PhaseError {
    pub from: WorkflowPhase,
    pub to: WorkflowPhase,
}

/// Enforces the linear phase graph:
///
/// ```text
/// START -> HEALTH_OK -> ACTION_REGISTERED -> ACTION_CONTENT_SYNCED
///       -> AUTH_READY -> BOUND -> EXECUTED -> VERIFIED -> DONE
///
/// any non-terminal phase -> FAILED
/// ```
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    current: WorkflowPhase,
    history: Vec<WorkflowPhase>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            current: WorkflowPhase::Start,
            history: vec![WorkflowPhase::Start],
        }
    }

    pub fn current(&self) -> WorkflowPhase {
        self.current
    }

    pub fn history(&self) -> &[WorkflowPhase] {
        &self.history
    }

    pub fn is_valid_transition(from: WorkflowPhase, to: WorkflowPhase) -> bool {
        use WorkflowPhase::*;
        if to == Failed {
            return !from.is_terminal();
        }
        matches!(
            (from, to),
            (Start, HealthOk)
                | (HealthOk, ActionRegistered)
                | (ActionRegistered, ActionContentSynced)
                | (ActionContentSynced, AuthReady)
                | (AuthReady, Bound)
                | (Bound, Executed)
                | (Executed, Verified)
                | (Verified, Done)
        )
    }

    pub fn advance(&mut self, to: WorkflowPhase) -> Result<(), PhaseError> {
        if !Self::is_valid_transition(self.current, to) {
            return Err(PhaseError {
                from: self.current,
                to,
            });
        }
        tracing::info!(from = %self.current, to = %to, "workflow phase");
        self.current = to;
        self.history.push(to);
        Ok(())
    }

    /// Move to FAILED unless already terminal.
    pub fn fail(&mut self) {
        if !self.current.is_terminal() {
            self.current = WorkflowPhase::Failed;
            self.history.push(WorkflowPhase::Failed);
        }
    }
}

/// A named unit of work, used in reports and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Readiness,
    Health,
    ResetAction,
    RegisterAction,
    SyncActionContent,
    EstablishAuth,
    Bind,
    Run,
    VerifyExecution,
    ListExecutions,
    Status,
    Doctor,
    UnknownMethod,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Readiness => "readiness",
            Self::Health => "health",
            Self::ResetAction => "reset_action",
            Self::RegisterAction => "register_action",
            Self::SyncActionContent => "sync_action_content",
            Self::EstablishAuth => "establish_auth",
            Self::Bind => "bind",
            Self::Run => "run",
            Self::VerifyExecution => "verify_execution",
            Self::ListExecutions => "list_executions",
            Self::Status => "status",
            Self::Doctor => "doctor",
            Self::UnknownMethod => "unknown_method",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
