//! Workflow store trait definition.
//!
//! Defines the storage interface for runs, step records and the audit log.
//! The infrastructure layer (keel-infra) implements this trait with SQLite
//! persistence.

use keel_types::Context;
use keel_types::error::StoreError;
use keel_types::run::{AuditEvent, RunState, RunStatus, StepRecord, WorkflowRun};

/// An audit event waiting to be appended; the store assigns `seq` and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Store trait for durable workflow execution state.
///
/// Covers three record families:
/// - **Runs:** one row per run id, status transitions validated by the store.
/// - **Steps:** one row per `(run_id, step_id)`, upserted on every attempt.
/// - **Events:** append-only audit log, ordered by `(created_at, seq)`.
///
/// The `checkpoint_*` methods are the only paths the executor uses to mutate
/// state. Each must commit all of its writes or none of them.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a new run row. Fails with `Conflict` if the id already exists.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Insert a new run row together with its opening audit event, atomically.
    fn start_run(
        &self,
        run: &WorkflowRun,
        event: &NewEvent,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Move a run to `status`, recording `error` (`None` clears it) and,
    /// when given, a context snapshot.
    ///
    /// Fails with `InvalidTransition` when the current status forbids the move
    /// and with `NotFound` for unknown run ids.
    fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
        context: Option<&Context>,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn get_run(
        &self,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, StoreError>> + Send;

    /// The run joined with every step row recorded for it.
    fn get_run_state(
        &self,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<RunState>, StoreError>> + Send;

    /// Runs still in `running` status, oldest first.
    fn list_unfinished_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    fn get_step(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<StepRecord>, StoreError>> + Send;

    /// All step rows for a run. Top-level steps are ordered by id, each
    /// followed by its sub-steps in index order.
    fn list_steps(
        &self,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<StepRecord>, StoreError>> + Send;

    /// Insert or overwrite the row for `(record.run_id, record.step_id)`.
    fn upsert_step(
        &self,
        record: &StepRecord,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Audit log
    // -----------------------------------------------------------------------

    /// Append one event and return its sequence number.
    fn log_event(
        &self,
        run_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> impl std::future::Future<Output = Result<i64, StoreError>> + Send;

    /// Every event for a run, ordered by timestamp then sequence number.
    fn list_events(
        &self,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<AuditEvent>, StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Atomic checkpoints
    // -----------------------------------------------------------------------

    /// Upsert a step row and append its events in one transaction.
    fn checkpoint_step(
        &self,
        record: &StepRecord,
        events: &[NewEvent],
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Transition a run and append its event in one transaction.
    fn checkpoint_run(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
        context: Option<&Context>,
        event: Option<&NewEvent>,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}
