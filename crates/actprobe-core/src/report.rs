//! Per-run report: one record per call, plus the run's final phase.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::transport::Exchange;
use crate::workflow::{Step, WorkflowPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    /// Succeeded through a conflict path or fallback lookup.
    Recovered,
    Failed,
    /// Attempted but not required to succeed, or a primary call whose
    /// failure is handled by a fallback.
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Passed => "passed",
            Self::Recovered => "recovered",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: Step,
    pub method: String,
    pub id: Option<u64>,
    pub params: Value,
    /// The response as received, `None` if none arrived.
    pub response: Option<Value>,
    pub status: StepStatus,
    pub detail: Option<String>,
    pub duration_ms: u64,
}

impl StepRecord {
    pub fn from_exchange(step: Step, exchange: &Exchange, status: StepStatus) -> Self {
        Self {
            step,
            method: exchange.request.method.clone(),
            id: Some(exchange.request.id),
            params: exchange.request.params_value(),
            response: Some(exchange.response.to_value()),
            status,
            detail: None,
            duration_ms: millis(exchange.elapsed),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    /// 1-based position within the session.
    pub run_index: u32,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub final_phase: Option<WorkflowPhase>,
    pub steps: Vec<StepRecord>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Workflow,
    Smoke,
}

impl RunReport {
    pub fn new(kind: RunKind, run_index: u32) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            run_index,
            kind,
            started_at: Utc::now(),
            finished_at: None,
            final_phase: None,
            steps: Vec::new(),
            error: None,
        }
    }

    pub fn record(&mut self, record: StepRecord) {
        self.steps.push(record);
    }

    pub fn finish(&mut self, final_phase: Option<WorkflowPhase>, error: Option<String>) {
        self.finished_at = Some(Utc::now());
        self.final_phase = final_phase;
        self.error = error;
    }

    pub fn passed(&self) -> bool {
        self.error.is_none() && !self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Human-readable table.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let kind = match self.kind {
            RunKind::Workflow => "Workflow",
            RunKind::Smoke => "Smoke",
        };
        let _ = writeln!(out, "{kind} run #{} ({})", self.run_index, self.run_id);
        if let Some(phase) = self.final_phase {
            let _ = writeln!(out, "Final phase: {phase}");
        }
        if let Some(finished) = self.finished_at {
            let ms = (finished - self.started_at).num_milliseconds();
            let _ = writeln!(out, "Duration: {ms}ms");
        }
        let _ = writeln!(out);

        let _ = writeln!(
            out,
            "{:<20} {:<16} {:>4} {:<10} {:>8}  DETAIL",
            "STEP", "METHOD", "ID", "STATUS", "TIME"
        );
        let _ = writeln!(out, "{}", "-".repeat(72));
        for rec in &self.steps {
            let id = rec.id.map(|i| i.to_string()).unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "{:<20} {:<16} {:>4} {:<10} {:>6}ms  {}",
                rec.step.as_str(),
                rec.method,
                id,
                rec.status,
                rec.duration_ms,
                rec.detail.as_deref().unwrap_or("")
            );
        }

        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Steps: {} passed, {} recovered, {} skipped, {} failed",
            self.count(StepStatus::Passed),
            self.count(StepStatus::Recovered),
            self.count(StepStatus::Skipped),
            self.count(StepStatus::Failed),
        );
        match &self.error {
            Some(err) => {
                let _ = writeln!(out, "Result: FAILED: {err}");
                if let Some(failed) = self.steps.iter().rev().find(|s| s.status == StepStatus::Failed) {
                    if let Some(ref resp) = failed.response {
                        let _ = writeln!(out, "Response: {resp}");
                    }
                }
            }
            None => {
                let _ = writeln!(out, "Result: PASSED");
            }
        }
        out
    }
}
