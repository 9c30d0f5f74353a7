//! Inputs of a workflow run and the resource handles it produces.

use std::fmt;

use serde::Serialize;

/// Handle of a registered action, e.g. `trn:openact:test:action/github/get-user@v1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ActionTrn(pub String);

/// Handle of an auth connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionTrn(pub String);

/// Handle of one execution produced by `run`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ExecutionTrn(pub String);

macro_rules! handle_common {
    ($($ty:ident),*) => {$(
        impl $ty {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    )*};
}

handle_common!(ActionTrn, ConnectionTrn, ExecutionTrn);

/// Fixed inputs of a workflow run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowParams {
    pub tenant: String,
    pub provider: String,
    pub action_name: String,
    /// Path to the action definition, as the target process sees it.
    pub config_path: String,
    pub user_id: String,
    pub access_token: String,
    /// Delete the action before registering it.
    pub reset_action: bool,
    pub execution_limit: u32,
    pub execution_offset: u32,
}

impl Default for WorkflowParams {
    fn default() -> Self {
        Self {
            tenant: "test".to_string(),
            provider: "github".to_string(),
            action_name: "get-user".to_string(),
            config_path: "./providers/github/actions/get-user.openapi.yaml".to_string(),
            user_id: "user1".to_string(),
            access_token: "dummy-token-for-test".to_string(),
            reset_action: false,
            execution_limit: 10,
            execution_offset: 0,
        }
    }
}

/// Mutable record carried across the steps of one run.
///
/// Owned by a single orchestrator for the duration of the run. Each handle
/// is filled by the step that produces it and read only by later steps.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowState {
    pub action: Option<ActionTrn>,
    pub auth: Option<ConnectionTrn>,
    pub execution: Option<ExecutionTrn>,
}

/// Handles produced by a run that reached DONE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowSummary {
    pub action: ActionTrn,
    pub auth: ConnectionTrn,
    pub execution: ExecutionTrn,
}
