//! Classification of a call's response into a [`StepOutcome`].
//!
//! Structured signals are checked first (`error.data.kind`, then the error
//! code); message substrings are the last resort for services that only
//! report conflicts in prose.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rpc::{Response, ResponseOutcome, RpcError};

/// Message fragments that mean "the resource already exists".
pub const DEFAULT_CONFLICT_MARKERS: &[&str] =
    &["UNIQUE constraint failed", "already exists", "Invalid input"];

/// Values of `error.data.kind` that mean "the resource already exists".
pub const DEFAULT_CONFLICT_KINDS: &[&str] = &["already_exists", "conflict"];

/// Why an error was treated as a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "via", content = "value", rename_all = "snake_case")]
pub enum ConflictReason {
    Kind(String),
    Code(i64),
    Marker(String),
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kind(kind) => write!(f, "error kind `{kind}`"),
            Self::Code(code) => write!(f, "error code {code}"),
            Self::Marker(marker) => write!(f, "message contains `{marker}`"),
        }
    }
}

/// Result of one call, as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(Value),
    KnownConflict {
        reason: ConflictReason,
        error: RpcError,
    },
    Fatal(RpcError),
}

/// Configurable conflict detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictClassifier {
    pub kinds: Vec<String>,
    pub codes: Vec<i64>,
    pub markers: Vec<String>,
}

impl Default for ConflictClassifier {
    fn default() -> Self {
        Self {
            kinds: DEFAULT_CONFLICT_KINDS.iter().map(|s| (*s).to_string()).collect(),
            codes: Vec::new(),
            markers: DEFAULT_CONFLICT_MARKERS.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl ConflictClassifier {
    pub fn classify(&self, response: &Response) -> StepOutcome {
        match &response.outcome {
            ResponseOutcome::Result(value) => StepOutcome::Success(value.clone()),
            ResponseOutcome::Error(error) => match self.conflict_reason(error) {
                Some(reason) => StepOutcome::KnownConflict {
                    reason,
                    error: error.clone(),
                },
                None => StepOutcome::Fatal(error.clone()),
            },
        }
    }

    pub fn conflict_reason(&self, error: &RpcError) -> Option<ConflictReason> {
        let kind = error
            .data
            .as_ref()
            .and_then(|d| d.get("kind"))
            .and_then(Value::as_str);
        if let Some(kind) = kind {
            if self.kinds.iter().any(|k| k == kind) {
                return Some(ConflictReason::Kind(kind.to_string()));
            }
        }

        if self.codes.contains(&error.code) {
            return Some(ConflictReason::Code(error.code));
        }

        self.markers
            .iter()
            .find(|m| error.message.contains(m.as_str()))
            .map(|m| ConflictReason::Marker(m.clone()))
    }
}
