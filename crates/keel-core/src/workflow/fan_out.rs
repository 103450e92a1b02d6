//! `parallel-for` coordinator: bounded fan-out with a full fan-in barrier.
//!
//! Each iteration item becomes a sub-step `parent:index` with its own step
//! row, so partial fan-out progress is individually resumable. Sub-steps run
//! on a `JoinSet` under a `Semaphore`, each with its own retry loop and a
//! by-value snapshot of the context taken before the block started.
//!
//! Partial failure policy: complete-all-then-report. Every sub-step reaches a
//! terminal state before the parent transitions. If any failed, the parent is
//! marked `failed` listing the failed sub-step ids; completed sub-step rows
//! stay in place for a later resume. The parent step itself is not retried.

use std::collections::HashMap;
use std::sync::Arc;

use keel_types::Context;
use keel_types::run::StepStatus;
use keel_types::workflow::{Iteration, ParallelFor, StepDefinition};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::repository::workflow::WorkflowStore;

use super::executor::{ExecutorError, Reentry, StepEngine};
use super::handler::HandlerError;

/// Resolve the iteration items for a block against the current context.
pub fn resolve_items(over: &Iteration, context: &Context) -> Result<Vec<Value>, String> {
    match over {
        Iteration::Count(n) => Ok((0..*n).map(Value::from).collect()),
        Iteration::ContextKey(key) => match context.get(key) {
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(other) => Err(format!(
                "context key '{key}' must hold an array, found {}",
                json_type(other)
            )),
            None => Err(format!("context key '{key}' is missing")),
        },
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Run a `parallel-for` step and return its result.
///
/// The result is `{output_key: [sub-step results in index order]}`, where
/// `output_key` defaults to the parent step id.
pub(crate) async fn run_parallel_for<S: WorkflowStore + 'static>(
    engine: &StepEngine<S>,
    run_id: &str,
    step: &StepDefinition,
    parallel: &ParallelFor,
    reentry: Reentry,
    context: &Context,
) -> Result<Context, ExecutorError> {
    let prior = engine.checkpoint.load_step(run_id, &step.id).await?;
    if let Some(record) = &prior {
        if record.status == StepStatus::Completed {
            tracing::debug!(run_id, step_id = %step.id, "skipping completed parallel step");
            return Ok(record.result.clone().unwrap_or_default());
        }
    }

    let (attempts, retry_floor) = prior
        .map(|r| (r.attempts, reentry.window_floor(&r)))
        .unwrap_or((0, 0));
    let running = engine
        .checkpoint
        .checkpoint_step_running(run_id, &step.id, None, attempts + 1, retry_floor)
        .await?;

    let items = match resolve_items(&parallel.over, context) {
        Ok(items) => items,
        Err(message) => {
            let message = format!("step '{}': {message}", step.id);
            engine
                .checkpoint
                .checkpoint_step_failed(&running, &message)
                .await?;
            return Err(ExecutorError::StepFailed {
                step_id: step.id.clone(),
                attempts: running.attempts,
                error: HandlerError::permanent(message),
            });
        }
    };

    let width = items.len();
    let limit = parallel
        .concurrency
        .unwrap_or(engine.config.fan_out_concurrency)
        .max(1);
    let policy = engine.retry_policy(step);
    let timeout = engine.step_timeout(Some(step));
    let semaphore = Arc::new(Semaphore::new(limit));

    tracing::info!(run_id, step_id = %step.id, width, limit, "fanning out");

    let mut join_set = JoinSet::new();
    let mut task_ids = HashMap::with_capacity(width);
    for (index, item) in items.into_iter().enumerate() {
        let sub = parallel.sub_step(&step.id, index, item);
        let sub_id = sub.id.clone();
        let engine = engine.clone();
        let semaphore = Arc::clone(&semaphore);
        let run_id = run_id.to_string();
        let snapshot = context.clone();

        let handle = join_set.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (index, Err(ExecutorError::Cancelled)),
            };
            let outcome = engine
                .execute_task(&run_id, &sub, &policy, timeout, reentry, snapshot)
                .await;
            (index, outcome)
        });
        task_ids.insert(handle.id(), (index, sub_id));
    }

    // Fan-in barrier: drain every task before deciding anything.
    let mut results: Vec<Option<Context>> = vec![None; width];
    let mut failed: Vec<(usize, String)> = Vec::new();
    let mut cancelled = false;
    while let Some(joined) = join_set.join_next_with_id().await {
        match joined {
            Ok((_, (index, Ok(result)))) => results[index] = Some(result),
            Ok((_, (_, Err(ExecutorError::Cancelled)))) => cancelled = true,
            Ok((task_id, (index, Err(e)))) => {
                let sub_id = task_ids
                    .get(&task_id)
                    .map(|(_, id)| id.clone())
                    .unwrap_or_default();
                tracing::warn!(run_id, step_id = %sub_id, error = %e, "sub-step failed");
                failed.push((index, sub_id));
            }
            Err(join_err) => {
                if let Some((index, sub_id)) = task_ids.get(&join_err.id()) {
                    tracing::error!(run_id, step_id = %sub_id, error = %join_err, "sub-step task aborted");
                    failed.push((*index, sub_id.clone()));
                }
            }
        }
    }

    if cancelled {
        return Err(ExecutorError::Cancelled);
    }

    if !failed.is_empty() {
        failed.sort_by_key(|(index, _)| *index);
        let failed: Vec<String> = failed.into_iter().map(|(_, id)| id).collect();
        let message = format!(
            "{} of {width} sub-steps failed: {}",
            failed.len(),
            failed.join(", ")
        );
        engine
            .checkpoint
            .checkpoint_step_failed(&running, &message)
            .await?;
        return Err(ExecutorError::FanOutFailed {
            step_id: step.id.clone(),
            failed,
            total: width,
        });
    }

    let collected: Vec<Value> = results
        .into_iter()
        .map(|r| Value::Object(r.unwrap_or_default()))
        .collect();
    let key = parallel.output_key.clone().unwrap_or_else(|| step.id.clone());
    let mut result = Context::new();
    result.insert(key, Value::Array(collected));

    let record = engine
        .checkpoint
        .checkpoint_step_completed(&running, result, Vec::new())
        .await?;

    tracing::info!(run_id, step_id = %step.id, width, "fan-in complete");
    Ok(record.result.unwrap_or_default())
}
