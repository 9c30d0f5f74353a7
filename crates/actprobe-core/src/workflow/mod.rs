//! The idempotent multi-step workflow.
//!
//! ```text
//! health -> [action.delete] -> action.register -> action.update
//!        -> auth.pat | auth.list -> binding.create | binding.get
//!        -> run -> execution.get -> execution.list
//! ```

pub mod classify;
pub mod orchestrator;
pub mod phase;
pub mod state;
pub mod trn;

pub use classify::{ConflictClassifier, ConflictReason, StepOutcome};
pub use orchestrator::{WorkflowOrchestrator, WorkflowRun, run_workflow};
pub use phase::{PhaseError, PhaseTracker, Step, WorkflowPhase};
pub use state::{
    ActionTrn, ConnectionTrn, ExecutionTrn, WorkflowParams, WorkflowState, WorkflowSummary,
};
