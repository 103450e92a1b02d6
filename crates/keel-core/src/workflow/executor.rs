//! Workflow executor: sequential step execution with durable checkpointing.
//!
//! `WorkflowExecutor` drives one run through its step list in declaration
//! order. Before running a step it asks the store whether the step already
//! completed; if so the stored result is merged and the handler is skipped.
//! Otherwise the step is checkpointed `running`, its handler invoked, and the
//! outcome checkpointed, with a bounded retry loop around the whole attempt.
//!
//! # Execution flow
//!
//! 1. Create the run record and log `workflow_started` (or reload and flip
//!    back to `running` on resume).
//! 2. For each step: skip-or-execute, merge the result, snapshot the context.
//! 3. `parallel-for` steps are handed to the fan-out coordinator.
//! 4. On success mark the run `completed`; on an unrecoverable step failure
//!    mark it `failed` and return an error carrying the run id.
//!
//! Shutdown (via the cancellation token) interrupts handler awaits and
//! backoff sleeps and leaves the run `running`, so a later `resume` picks it up.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use keel_types::Context;
use keel_types::config::{EngineConfig, RetryPolicy};
use keel_types::run::{RunStatus, StepRecord, StepStatus, WorkflowRun};
use keel_types::workflow::{SUB_STEP_SEPARATOR, StepDefinition, StepKind, TaskStep, WorkflowDefinition};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::workflow::WorkflowStore;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::{merge_into, rehydrate};
use super::definition::{WorkflowError, validate_definition};
use super::fan_out::run_parallel_for;
use super::handler::{HandlerError, HandlerRegistry};
use super::retry::RetryHandler;

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// Outcome of `execute` or `resume`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub run_id: String,
    pub status: RunStatus,
    /// Accumulated context at the end of the run.
    pub context: Context,
}

// ---------------------------------------------------------------------------
// StepEngine
// ---------------------------------------------------------------------------

/// The cloneable half of the executor, shared with fan-out tasks.
pub(crate) struct StepEngine<S: WorkflowStore> {
    pub(crate) checkpoint: Arc<CheckpointManager<S>>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) shutdown: CancellationToken,
}

impl<S: WorkflowStore> Clone for StepEngine<S> {
    fn clone(&self) -> Self {
        Self {
            checkpoint: Arc::clone(&self.checkpoint),
            registry: Arc::clone(&self.registry),
            config: Arc::clone(&self.config),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// How an attempt treats a step row left behind by an earlier execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reentry {
    /// Fresh run or an in-loop retry: stored counts stand.
    Continue,
    /// Resuming an interrupted run: an attempt left `running` is not charged.
    Interrupted,
    /// Resuming a failed run: unfinished steps get a fresh retry window.
    Reopen,
}

impl Reentry {
    /// First attempt number of the retry window the next attempt runs in.
    pub(crate) fn window_floor(self, record: &StepRecord) -> u32 {
        match (self, record.status) {
            (Reentry::Reopen, StepStatus::Failed | StepStatus::Running) => record.attempts,
            (Reentry::Interrupted, StepStatus::Running) => {
                (record.retry_floor + 1).min(record.attempts)
            }
            _ => record.retry_floor,
        }
    }
}

/// Why a single attempt did not produce a result.
enum AttemptError {
    /// The handler failed; the step row is now `failed`.
    Handler { error: HandlerError, record: StepRecord },
    /// The step's retry window was already used up before this attempt;
    /// the step row is now `failed`.
    Exhausted { attempts: u32, last_error: Option<String> },
    /// A checkpoint write or read failed.
    Checkpoint(CheckpointError),
    Cancelled,
}

impl From<CheckpointError> for AttemptError {
    fn from(e: CheckpointError) -> Self {
        AttemptError::Checkpoint(e)
    }
}

impl<S: WorkflowStore> StepEngine<S> {
    pub(crate) fn retry_policy(&self, step: &StepDefinition) -> RetryPolicy {
        step.retry.unwrap_or(self.config.retry)
    }

    pub(crate) fn step_timeout(&self, step: Option<&StepDefinition>) -> Option<Duration> {
        step.and_then(|s| s.timeout_secs)
            .or(self.config.step_timeout_secs)
            .map(Duration::from_secs)
    }

    /// One idempotent attempt at `task`. Returns the step's result.
    ///
    /// A `completed` row short-circuits to its stored result without touching
    /// the handler. `reentry` decides the retry window for a row left by an
    /// earlier execution. `budget`, when given, refuses to start an attempt
    /// beyond the window's ceiling and marks the step `failed` instead.
    async fn attempt(
        &self,
        run_id: &str,
        task: &TaskStep,
        budget: Option<&RetryPolicy>,
        reentry: Reentry,
        timeout: Option<Duration>,
        context: Context,
    ) -> Result<Context, AttemptError> {
        let prior = self.checkpoint.load_step(run_id, &task.id).await?;

        let (attempts, retry_floor) = match &prior {
            Some(record) if record.status == StepStatus::Completed => {
                tracing::debug!(run_id, step_id = %task.id, "skipping completed step");
                return Ok(record.result.clone().unwrap_or_default());
            }
            Some(record) => (record.attempts, reentry.window_floor(record)),
            None => (0, 0),
        };

        if let Some(policy) = budget {
            if !RetryHandler::has_budget(policy, attempts.saturating_sub(retry_floor)) {
                let mut last_error = prior.as_ref().and_then(|r| r.error.clone());
                if let Some(record) = prior.filter(|r| r.status != StepStatus::Failed) {
                    let message = format!(
                        "retry budget exhausted after {attempts} attempt(s); the last attempt did not finish"
                    );
                    let record = StepRecord {
                        retry_floor,
                        ..record
                    };
                    self.checkpoint
                        .checkpoint_step_failed(&record, &message)
                        .await?;
                    last_error.get_or_insert(message);
                }
                return Err(AttemptError::Exhausted {
                    attempts,
                    last_error,
                });
            }
        }

        let parent = task
            .id
            .rsplit_once(SUB_STEP_SEPARATOR)
            .map(|(parent, _)| parent);
        let running = self
            .checkpoint
            .checkpoint_step_running(run_id, &task.id, parent, attempts + 1, retry_floor)
            .await?;

        let outcome = match self.registry.get(&task.step_type) {
            None => Err(HandlerError::permanent(format!(
                "no handler registered for step type '{}'",
                task.step_type
            ))),
            Some(handler) => {
                let call = handler.handle(task, context);
                let timed = async {
                    match timeout {
                        Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                            Err(HandlerError::transient(format!(
                                "step timed out after {}s",
                                limit.as_secs()
                            )))
                        }),
                        None => call.await,
                    }
                };
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return Err(AttemptError::Cancelled),
                    result = timed => result,
                }
            }
        };

        match outcome {
            Ok(output) => {
                let record = self
                    .checkpoint
                    .checkpoint_step_completed(&running, output.update, output.events)
                    .await?;
                Ok(record.result.unwrap_or_default())
            }
            Err(error) => {
                let record = self
                    .checkpoint
                    .checkpoint_step_failed(&running, &error.to_string())
                    .await?;
                Err(AttemptError::Handler { error, record })
            }
        }
    }

    /// Run `task` to a terminal state under `policy`, retrying transient failures.
    ///
    /// Checkpoint failures count as transient too, bounded by the same ceiling.
    pub(crate) async fn execute_task(
        &self,
        run_id: &str,
        task: &TaskStep,
        policy: &RetryPolicy,
        timeout: Option<Duration>,
        reentry: Reentry,
        context: Context,
    ) -> Result<Context, ExecutorError> {
        let mut reentry = reentry;
        let mut checkpoint_failures = 0u32;

        loop {
            let delay = match self
                .attempt(run_id, task, Some(policy), reentry, timeout, context.clone())
                .await
            {
                Ok(result) => return Ok(result),
                Err(AttemptError::Cancelled) => return Err(ExecutorError::Cancelled),
                Err(AttemptError::Exhausted { attempts, last_error }) => {
                    return Err(ExecutorError::StepFailed {
                        step_id: task.id.clone(),
                        attempts,
                        error: HandlerError::permanent(format!(
                            "retry budget exhausted: {}",
                            last_error.as_deref().unwrap_or("no error recorded")
                        )),
                    });
                }
                Err(AttemptError::Handler { error, record }) => {
                    let in_window = record.attempts_in_window();
                    if !RetryHandler::should_retry(policy, &error, in_window) {
                        return Err(ExecutorError::StepFailed {
                            step_id: task.id.clone(),
                            attempts: record.attempts,
                            error,
                        });
                    }
                    let delay = RetryHandler::backoff_delay(policy, in_window);
                    tracing::warn!(
                        run_id,
                        step_id = %task.id,
                        attempt = record.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "step failed, retrying"
                    );
                    delay
                }
                Err(AttemptError::Checkpoint(e)) => {
                    checkpoint_failures += 1;
                    if !RetryHandler::has_budget(policy, checkpoint_failures) {
                        return Err(ExecutorError::Checkpoint(e));
                    }
                    let delay = RetryHandler::backoff_delay(policy, checkpoint_failures);
                    tracing::warn!(
                        run_id,
                        step_id = %task.id,
                        failures = checkpoint_failures,
                        error = %e,
                        "checkpoint failed, retrying step"
                    );
                    delay
                }
            };

            reentry = Reentry::Continue;
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(ExecutorError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Durable, resumable workflow executor.
///
/// Generic over `S: WorkflowStore` for storage flexibility. The handler
/// registry is injected, so executors with different handler sets can
/// coexist in one process.
pub struct WorkflowExecutor<S: WorkflowStore> {
    engine: StepEngine<S>,
    /// Run ids currently driven by this executor.
    active_runs: Arc<DashSet<String>>,
}

/// Removes a run id from the active set when dropped.
struct ActiveRunGuard {
    runs: Arc<DashSet<String>>,
    run_id: String,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.runs.remove(&self.run_id);
    }
}

impl<S: WorkflowStore + 'static> WorkflowExecutor<S> {
    pub fn new(store: S, registry: Arc<HandlerRegistry>, config: EngineConfig) -> Self {
        Self {
            engine: StepEngine {
                checkpoint: Arc::new(CheckpointManager::new(store)),
                registry,
                config: Arc::new(config),
                shutdown: CancellationToken::new(),
            },
            active_runs: Arc::new(DashSet::new()),
        }
    }

    /// Use `token` to interrupt in-flight handlers and backoff sleeps.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.engine.shutdown = token;
        self
    }

    pub fn checkpoint(&self) -> &CheckpointManager<S> {
        &self.engine.checkpoint
    }

    pub fn store(&self) -> &S {
        self.engine.checkpoint.store()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.engine.config
    }

    fn validate_config(&self) -> Result<(), ExecutorError> {
        self.engine
            .config
            .validate()
            .map_err(ExecutorError::InvalidConfig)
    }

    fn claim(&self, run_id: &str) -> Result<ActiveRunGuard, ExecutorError> {
        if !self.active_runs.insert(run_id.to_string()) {
            return Err(ExecutorError::RunActive(run_id.to_string()));
        }
        Ok(ActiveRunGuard {
            runs: Arc::clone(&self.active_runs),
            run_id: run_id.to_string(),
        })
    }

    /// Start a new run of `definition` with a freshly generated run id.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        input: Context,
    ) -> Result<ExecutionResult, ExecutorError> {
        let run_id = Uuid::now_v7().to_string();
        self.execute_with_run_id(&run_id, definition, input).await
    }

    /// Start a new run under a caller-chosen id. Fails if the id exists.
    pub async fn execute_with_run_id(
        &self,
        run_id: &str,
        definition: &WorkflowDefinition,
        input: Context,
    ) -> Result<ExecutionResult, ExecutorError> {
        self.validate_config()?;
        validate_definition(definition, &self.engine.registry)?;
        let _guard = self.claim(run_id)?;

        let run = WorkflowRun::new(run_id, &definition.name, input);
        self.engine.checkpoint.checkpoint_run_started(&run).await?;

        tracing::info!(
            run_id,
            workflow = definition.name.as_str(),
            steps = definition.steps.len(),
            "starting workflow execution"
        );

        self.drive(run_id, definition, run.context, Reentry::Continue)
            .await
    }

    /// Continue a stored run from its last durable checkpoint.
    ///
    /// A `completed` run is returned as-is without invoking any handler.
    pub async fn resume(
        &self,
        run_id: &str,
        definition: &WorkflowDefinition,
    ) -> Result<ExecutionResult, ExecutorError> {
        self.validate_config()?;
        let _guard = self.claim(run_id)?;

        let state = match self.engine.checkpoint.load_run_state(run_id).await {
            Ok(state) => state,
            Err(CheckpointError::RunNotFound(id)) => return Err(ExecutorError::RunNotFound(id)),
            Err(e) => return Err(e.into()),
        };
        let run = state.run;

        if run.workflow_name != definition.name {
            return Err(ExecutorError::WorkflowMismatch {
                run_id: run_id.to_string(),
                expected: definition.name.clone(),
                found: run.workflow_name,
            });
        }

        if run.status == RunStatus::Completed {
            tracing::info!(run_id, "run already completed, nothing to resume");
            return Ok(ExecutionResult {
                run_id: run.id,
                status: RunStatus::Completed,
                context: run.context,
            });
        }

        validate_definition(definition, &self.engine.registry)?;

        let previous = run.status;
        let context = rehydrate(&run.input, &run.context);
        self.engine
            .checkpoint
            .checkpoint_run_resumed(run_id, previous, &context)
            .await?;

        let completed = state
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        tracing::info!(
            run_id,
            workflow = definition.name.as_str(),
            previous = %previous,
            completed_steps = completed,
            "resuming workflow execution"
        );

        let reentry = match previous {
            RunStatus::Failed => Reentry::Reopen,
            _ => Reentry::Interrupted,
        };
        self.drive(run_id, definition, context, reentry).await
    }

    /// Resume every unfinished run of `definition` found in the store.
    ///
    /// Returns one outcome per run; a failing run does not stop the others.
    pub async fn recover(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<Vec<(String, Result<ExecutionResult, ExecutorError>)>, ExecutorError> {
        let runs = self
            .engine
            .checkpoint
            .store()
            .list_unfinished_runs()
            .await
            .map_err(CheckpointError::from)?;

        let mut outcomes = Vec::new();
        for run in runs.into_iter().filter(|r| r.workflow_name == definition.name) {
            if self.engine.shutdown.is_cancelled() {
                break;
            }
            let outcome = self.resume(&run.id, definition).await;
            outcomes.push((run.id, outcome));
        }
        Ok(outcomes)
    }

    /// Single idempotent attempt at `step` within `run_id`.
    ///
    /// A step already `completed` in the store is not re-run: its stored
    /// result is merged into `context` and returned. Otherwise the step is
    /// checkpointed `running`, its handler invoked with a copy of `context`,
    /// and the outcome checkpointed. On success the result is merged into
    /// `context`. No retry is applied here.
    pub async fn execute_step_with_checkpoint(
        &self,
        run_id: &str,
        step: &TaskStep,
        context: &mut Context,
    ) -> Result<Context, ExecutorError> {
        let timeout = self.engine.step_timeout(None);
        match self
            .engine
            .attempt(run_id, step, None, Reentry::Continue, timeout, context.clone())
            .await
        {
            Ok(result) => {
                merge_into(context, &result);
                Ok(result)
            }
            Err(AttemptError::Handler { error, record }) => Err(ExecutorError::StepFailed {
                step_id: step.id.clone(),
                attempts: record.attempts,
                error,
            }),
            Err(AttemptError::Exhausted { attempts, .. }) => Err(ExecutorError::StepFailed {
                step_id: step.id.clone(),
                attempts,
                error: HandlerError::permanent("retry budget exhausted"),
            }),
            Err(AttemptError::Checkpoint(e)) => Err(e.into()),
            Err(AttemptError::Cancelled) => Err(ExecutorError::Cancelled),
        }
    }

    /// The step loop shared by `execute` and `resume`.
    async fn drive(
        &self,
        run_id: &str,
        definition: &WorkflowDefinition,
        mut context: Context,
        reentry: Reentry,
    ) -> Result<ExecutionResult, ExecutorError> {
        for step in &definition.steps {
            if self.engine.shutdown.is_cancelled() {
                tracing::info!(run_id, "shutdown requested, leaving run resumable");
                return Err(ExecutorError::Cancelled);
            }

            let outcome = match &step.kind {
                StepKind::Task(task) => {
                    let policy = self.engine.retry_policy(step);
                    let timeout = self.engine.step_timeout(Some(step));
                    self.engine
                        .execute_task(run_id, task, &policy, timeout, reentry, context.clone())
                        .await
                }
                StepKind::ParallelFor(parallel) => {
                    run_parallel_for(&self.engine, run_id, step, parallel, reentry, &context)
                        .await
                }
            };

            let result = match outcome {
                Ok(result) => result,
                Err(ExecutorError::Cancelled) => {
                    tracing::info!(run_id, step_id = %step.id, "step interrupted by shutdown");
                    return Err(ExecutorError::Cancelled);
                }
                Err(e) => return self.fail_run(run_id, &context, e).await,
            };

            merge_into(&mut context, &result);
            if let Err(e) = self
                .engine
                .checkpoint
                .checkpoint_run_context(run_id, &context)
                .await
            {
                return self.fail_run(run_id, &context, e.into()).await;
            }
        }

        if let Err(e) = self
            .engine
            .checkpoint
            .checkpoint_run_completed(run_id, &context)
            .await
        {
            return Err(ExecutorError::RunFailed {
                run_id: run_id.to_string(),
                source: Box::new(e.into()),
            });
        }

        tracing::info!(run_id, workflow = definition.name.as_str(), "workflow completed");
        Ok(ExecutionResult {
            run_id: run_id.to_string(),
            status: RunStatus::Completed,
            context,
        })
    }

    /// Mark the run failed and wrap `error` with the run id.
    async fn fail_run(
        &self,
        run_id: &str,
        context: &Context,
        error: ExecutorError,
    ) -> Result<ExecutionResult, ExecutorError> {
        let message = error.to_string();
        if let Err(e) = self
            .engine
            .checkpoint
            .checkpoint_run_failed(run_id, &message, context)
            .await
        {
            tracing::error!(run_id, error = %e, "failed to record run failure");
        }

        tracing::warn!(run_id, error = %message, "workflow failed");
        Err(ExecutorError::RunFailed {
            run_id: run_id.to_string(),
            source: Box::new(error),
        })
    }
}

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors from workflow execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("step '{step_id}' failed after {attempts} attempt(s): {error}")]
    StepFailed {
        step_id: String,
        attempts: u32,
        error: HandlerError,
    },

    #[error("parallel step '{step_id}': {} of {total} sub-steps failed", .failed.len())]
    FanOutFailed {
        step_id: String,
        failed: Vec<String>,
        total: usize,
    },

    /// Run-level failure; `resume(run_id, ..)` may be called later.
    #[error("workflow run '{run_id}' failed: {source}")]
    RunFailed {
        run_id: String,
        source: Box<ExecutorError>,
    },

    #[error("invalid engine config: {0}")]
    InvalidConfig(String),

    #[error("workflow run not found: {0}")]
    RunNotFound(String),

    #[error("workflow run '{0}' is already executing")]
    RunActive(String),

    #[error("run '{run_id}' belongs to workflow '{found}', not '{expected}'")]
    WorkflowMismatch {
        run_id: String,
        expected: String,
        found: String,
    },

    #[error("workflow cancelled")]
    Cancelled,
}

impl ExecutorError {
    /// The run id a run-level failure is tagged with.
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::RunFailed { run_id, .. } | Self::WorkflowMismatch { run_id, .. } => Some(run_id),
            Self::RunNotFound(run_id) | Self::RunActive(run_id) => Some(run_id),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
