//! Run-level error taxonomy.
//!
//! Every variant that originates from a call carries the step, the request
//! as sent and, where one arrived, the response as received, so a failing
//! run can be diagnosed from the error alone.

use serde_json::Value;
use thiserror::Error;

use crate::readiness::ReadinessError;
use crate::rpc::{Request, RpcError};
use crate::supervisor::ProcessError;
use crate::transport::TransportError;
use crate::workflow::{PhaseError, Step};

#[derive(Debug, Error)]
pub enum HarnessError {
    /// The stream broke, timed out, or produced an undecodable line.
    #[error("{step}: {} (id {}) failed: {source}", .request.method, .request.id)]
    Transport {
        step: Step,
        request: Request,
        #[source]
        source: TransportError,
    },

    /// The target answered with an error that no recovery path accepts.
    #[error("{step}: {} returned {error}", .request.method)]
    Protocol {
        step: Step,
        request: Request,
        response: Value,
        error: RpcError,
    },

    /// The response succeeded but lacks what the step requires.
    #[error("{step}: expected {expectation} at `{field}` in {} response", .request.method)]
    Assertion {
        step: Step,
        field: String,
        expectation: String,
        request: Request,
        response: Value,
    },

    /// The primary call failed and the fallback lookup found nothing usable.
    #[error("{step}: {original} and fallback {} found no match: {reason}", .request.method)]
    Unrecovered {
        step: Step,
        original: RpcError,
        reason: String,
        request: Request,
        response: Value,
    },

    /// The target process could not be started or stopped, or exited mid-run.
    #[error("target process: {source}")]
    Process {
        step: Option<Step>,
        request: Option<Request>,
        #[source]
        source: ProcessError,
    },

    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    /// Cancelled from outside. `step` and `request` name the call that was
    /// in flight, if any.
    #[error("run interrupted{}", .step.map(|s| format!(" at {s}")).unwrap_or_default())]
    Interrupted {
        step: Option<Step>,
        request: Option<Request>,
    },
}

impl HarnessError {
    pub fn process(source: ProcessError) -> Self {
        Self::Process {
            step: None,
            request: None,
            source,
        }
    }

    /// Classify a failed call: cancellation interrupts the run, anything
    /// else is a transport failure.
    pub fn from_call(step: Step, request: Request, source: TransportError) -> Self {
        match source {
            TransportError::Cancelled => Self::Interrupted {
                step: Some(step),
                request: Some(request),
            },
            source => Self::Transport {
                step,
                request,
                source,
            },
        }
    }

    pub fn step(&self) -> Option<Step> {
        match self {
            Self::Transport { step, .. }
            | Self::Protocol { step, .. }
            | Self::Assertion { step, .. }
            | Self::Unrecovered { step, .. } => Some(*step),
            Self::Process { step, .. } | Self::Interrupted { step, .. } => *step,
            Self::Readiness(_) => Some(Step::Readiness),
            Self::Phase(_) => None,
        }
    }

    pub fn request(&self) -> Option<&Request> {
        match self {
            Self::Transport { request, .. }
            | Self::Protocol { request, .. }
            | Self::Assertion { request, .. }
            | Self::Unrecovered { request, .. } => Some(request),
            Self::Process { request, .. } | Self::Interrupted { request, .. } => request.as_ref(),
            _ => None,
        }
    }

    pub fn response(&self) -> Option<&Value> {
        match self {
            Self::Protocol { response, .. }
            | Self::Assertion { response, .. }
            | Self::Unrecovered { response, .. } => Some(response),
            _ => None,
        }
    }

    /// True when the stream failure may be explained by the target exiting.
    pub fn suggests_exit(&self) -> bool {
        match self {
            Self::Transport { source, .. } => source.suggests_exit(),
            Self::Readiness(ReadinessError::Transport(source)) => source.suggests_exit(),
            _ => false,
        }
    }
}
