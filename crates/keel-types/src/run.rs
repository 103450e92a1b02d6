//! Execution records: runs, persisted step outcomes and the audit trail.
//!
//! These are the three record families owned by the durable store. The
//! executor only ever holds a transient copy of the context; the store is
//! the source of truth for whether a step has already happened.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Context;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// `completed` and `failed` end a run; only a resume may leave `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a run in `self` may be moved to `next`.
    ///
    /// `running` may be re-written (context snapshots) or finished,
    /// `failed` may only go back to `running` through a resume, and
    /// `completed` is final.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match self {
            Self::Running => true,
            Self::Failed => next == Self::Running,
            Self::Completed => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Status of a single persisted step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Opaque run id (UUIDv7 string when generated by the executor).
    pub id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    /// Caller-supplied initial context. Never rewritten after creation.
    pub input: Context,
    /// Accumulated context as of the last run checkpoint.
    pub context: Context,
    /// Error message from the last failure, if the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// A freshly started run whose context is a copy of its input.
    pub fn new(id: impl Into<String>, workflow_name: impl Into<String>, input: Context) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            workflow_name: workflow_name.into(),
            status: RunStatus::Running,
            context: input.clone(),
            input,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The persisted outcome of one step within one run, keyed by `(run_id, step_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: String,
    pub step_id: String,
    /// Set for fan-out sub-steps (`parent:index`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_id: Option<String>,
    pub status: StepStatus,
    /// Handler output. Non-null exactly when the step is `completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Context>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Cumulative attempt count across every execute/resume of the run.
    pub attempts: u32,
    /// Attempt count at which the current retry budget window opened.
    pub retry_floor: u32,
    pub updated_at: DateTime<Utc>,
}

impl StepRecord {
    /// Attempts consumed in the current retry window.
    pub fn attempts_in_window(&self) -> u32 {
        self.attempts.saturating_sub(self.retry_floor)
    }
}

/// A run joined with every step row recorded for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run: WorkflowRun,
    pub steps: Vec<StepRecord>,
}

impl RunState {
    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

/// Append-only audit record. `seq` is assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: i64,
    pub run_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Event types written by the engine. Handlers may add their own.
pub mod event_types {
    pub const WORKFLOW_STARTED: &str = "workflow_started";
    pub const WORKFLOW_RESUMED: &str = "workflow_resumed";
    pub const WORKFLOW_COMPLETED: &str = "workflow_completed";
    pub const WORKFLOW_FAILED: &str = "workflow_failed";
    pub const STEP_STARTED: &str = "step_started";
    pub const STEP_COMPLETED: &str = "step_completed";
    pub const STEP_FAILED: &str = "step_failed";
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
