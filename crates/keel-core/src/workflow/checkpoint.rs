//! Durable checkpoint manager for workflow execution state.
//!
//! Wraps `WorkflowStore` with the vocabulary of run and step transitions.
//! Every transition writes its status change and its audit event in a single
//! store transaction, so an observer never sees one without the other.

use chrono::Utc;
use keel_types::Context;
use keel_types::error::StoreError;
use keel_types::run::{RunState, RunStatus, StepRecord, StepStatus, WorkflowRun, event_types};
use serde_json::json;

use crate::repository::workflow::{NewEvent, WorkflowStore};

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable execution checkpoints for workflow runs.
///
/// Generic over `S: WorkflowStore` so it works with any storage backend
/// (SQLite, in-memory, etc.). Every state transition is persisted before the
/// executor moves forward.
pub struct CheckpointManager<S: WorkflowStore> {
    store: S,
}

impl<S: WorkflowStore> CheckpointManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Step-level checkpoints
    // -----------------------------------------------------------------------

    /// Checkpoint a step as `running` for attempt number `attempts`.
    ///
    /// Clears any result or error left by a previous attempt.
    pub async fn checkpoint_step_running(
        &self,
        run_id: &str,
        step_id: &str,
        parent_step_id: Option<&str>,
        attempts: u32,
        retry_floor: u32,
    ) -> Result<StepRecord, CheckpointError> {
        let record = StepRecord {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            parent_step_id: parent_step_id.map(str::to_string),
            status: StepStatus::Running,
            result: None,
            error: None,
            attempts,
            retry_floor,
            updated_at: Utc::now(),
        };
        let event = NewEvent::new(
            event_types::STEP_STARTED,
            json!({ "step_id": step_id, "attempt": attempts }),
        );

        self.store.checkpoint_step(&record, &[event]).await?;

        tracing::debug!(run_id, step_id, attempt = attempts, "checkpointed step running");
        Ok(record)
    }

    /// Checkpoint a running step as `completed` with its result.
    ///
    /// Handler-emitted events are appended after `step_completed` in the
    /// same transaction.
    pub async fn checkpoint_step_completed(
        &self,
        running: &StepRecord,
        result: Context,
        handler_events: Vec<NewEvent>,
    ) -> Result<StepRecord, CheckpointError> {
        let record = StepRecord {
            status: StepStatus::Completed,
            result: Some(result),
            error: None,
            updated_at: Utc::now(),
            ..running.clone()
        };

        let mut events = Vec::with_capacity(handler_events.len() + 1);
        events.push(NewEvent::new(
            event_types::STEP_COMPLETED,
            json!({ "step_id": record.step_id, "attempt": record.attempts }),
        ));
        events.extend(handler_events);

        self.store.checkpoint_step(&record, &events).await?;

        tracing::debug!(
            run_id = %record.run_id,
            step_id = %record.step_id,
            "checkpointed step completed"
        );
        Ok(record)
    }

    /// Checkpoint a running step as `failed`.
    pub async fn checkpoint_step_failed(
        &self,
        running: &StepRecord,
        error: &str,
    ) -> Result<StepRecord, CheckpointError> {
        let record = StepRecord {
            status: StepStatus::Failed,
            result: None,
            error: Some(error.to_string()),
            updated_at: Utc::now(),
            ..running.clone()
        };
        let event = NewEvent::new(
            event_types::STEP_FAILED,
            json!({
                "step_id": record.step_id,
                "attempt": record.attempts,
                "error": error,
            }),
        );

        self.store.checkpoint_step(&record, &[event]).await?;

        tracing::debug!(
            run_id = %record.run_id,
            step_id = %record.step_id,
            error,
            "checkpointed step failed"
        );
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Run-level checkpoints
    // -----------------------------------------------------------------------

    /// Persist a new run as `running` and log `workflow_started`.
    pub async fn checkpoint_run_started(&self, run: &WorkflowRun) -> Result<(), CheckpointError> {
        let event = NewEvent::new(
            event_types::WORKFLOW_STARTED,
            json!({ "workflow_name": run.workflow_name, "input": run.input }),
        );
        self.store.start_run(run, &event).await?;

        tracing::debug!(run_id = %run.id, workflow = %run.workflow_name, "checkpointed run started");
        Ok(())
    }

    /// Flip a stored run back to `running` for a resume and log `workflow_resumed`.
    pub async fn checkpoint_run_resumed(
        &self,
        run_id: &str,
        previous: RunStatus,
        context: &Context,
    ) -> Result<(), CheckpointError> {
        let event = NewEvent::new(
            event_types::WORKFLOW_RESUMED,
            json!({ "previous_status": previous }),
        );
        self.store
            .checkpoint_run(run_id, RunStatus::Running, None, Some(context), Some(&event))
            .await?;

        tracing::debug!(run_id, previous = %previous, "checkpointed run resumed");
        Ok(())
    }

    /// Snapshot the accumulated context of a running run. No audit event.
    pub async fn checkpoint_run_context(
        &self,
        run_id: &str,
        context: &Context,
    ) -> Result<(), CheckpointError> {
        self.store
            .checkpoint_run(run_id, RunStatus::Running, None, Some(context), None)
            .await?;
        Ok(())
    }

    /// Mark a run `completed` with its final context and log `workflow_completed`.
    pub async fn checkpoint_run_completed(
        &self,
        run_id: &str,
        context: &Context,
    ) -> Result<(), CheckpointError> {
        let event = NewEvent::new(event_types::WORKFLOW_COMPLETED, json!({}));
        self.store
            .checkpoint_run(run_id, RunStatus::Completed, None, Some(context), Some(&event))
            .await?;

        tracing::debug!(run_id, "checkpointed run completed");
        Ok(())
    }

    /// Mark a run `failed` and log `workflow_failed`.
    pub async fn checkpoint_run_failed(
        &self,
        run_id: &str,
        error: &str,
        context: &Context,
    ) -> Result<(), CheckpointError> {
        let event = NewEvent::new(event_types::WORKFLOW_FAILED, json!({ "error": error }));
        self.store
            .checkpoint_run(
                run_id,
                RunStatus::Failed,
                Some(error),
                Some(context),
                Some(&event),
            )
            .await?;

        tracing::debug!(run_id, error, "checkpointed run failed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery helpers
    // -----------------------------------------------------------------------

    pub async fn load_step(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<StepRecord>, CheckpointError> {
        Ok(self.store.get_step(run_id, step_id).await?)
    }

    /// Load a run with all of its steps, failing if the run is unknown.
    pub async fn load_run_state(&self, run_id: &str) -> Result<RunState, CheckpointError> {
        self.store
            .get_run_state(run_id)
            .await?
            .ok_or_else(|| CheckpointError::RunNotFound(run_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying store operation failed.
    #[error("checkpoint store error: {0}")]
    Store(#[from] StoreError),

    #[error("workflow run not found: {0}")]
    RunNotFound(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
