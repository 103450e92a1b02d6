//! In-memory `WorkflowStore` for executor unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use keel_types::Context;
use keel_types::error::StoreError;
use keel_types::run::{AuditEvent, RunState, RunStatus, StepRecord, WorkflowRun};

use crate::repository::workflow::{NewEvent, WorkflowStore};

#[derive(Default)]
struct Inner {
    runs: HashMap<String, WorkflowRun>,
    steps: BTreeMap<(String, String), StepRecord>,
    events: Vec<AuditEvent>,
    next_seq: i64,
}

impl Inner {
    fn append(&mut self, run_id: &str, event: &NewEvent) -> i64 {
        self.next_seq += 1;
        self.events.push(AuditEvent {
            seq: self.next_seq,
            run_id: run_id.to_string(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            created_at: Utc::now(),
        });
        self.next_seq
    }

    fn transition(
        &mut self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
        context: Option<&Context>,
    ) -> Result<(), StoreError> {
        let run = self.runs.get_mut(run_id).ok_or(StoreError::NotFound)?;
        if !run.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: run.status,
                to: status,
            });
        }
        run.status = status;
        run.error = error.map(str::to_string);
        if let Some(ctx) = context {
            run.context = ctx.clone();
        }
        run.updated_at = Utc::now();
        Ok(())
    }
}

/// Cloneable handle; clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    failing_step_writes: Arc<AtomicU32>,
}

impl MemoryStore {
    /// Make the next `n` step checkpoints fail with a query error.
    pub fn fail_next_step_writes(&self, n: u32) {
        self.failing_step_writes.store(n, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_failure(&self) -> bool {
        self.failing_step_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl WorkflowStore for MemoryStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.runs.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("run '{}' already exists", run.id)));
        }
        inner.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn start_run(&self, run: &WorkflowRun, event: &NewEvent) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.runs.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("run '{}' already exists", run.id)));
        }
        inner.runs.insert(run.id.clone(), run.clone());
        inner.append(&run.id, event);
        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
        context: Option<&Context>,
    ) -> Result<(), StoreError> {
        self.lock().transition(run_id, status, error, context)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        Ok(self.lock().runs.get(run_id).cloned())
    }

    async fn get_run_state(&self, run_id: &str) -> Result<Option<RunState>, StoreError> {
        let inner = self.lock();
        Ok(inner.runs.get(run_id).map(|run| RunState {
            run: run.clone(),
            steps: inner
                .steps
                .values()
                .filter(|s| s.run_id == run_id)
                .cloned()
                .collect(),
        }))
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        let inner = self.lock();
        let mut runs: Vec<WorkflowRun> = inner
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn get_step(&self, run_id: &str, step_id: &str) -> Result<Option<StepRecord>, StoreError> {
        Ok(self
            .lock()
            .steps
            .get(&(run_id.to_string(), step_id.to_string()))
            .cloned())
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        let mut steps: Vec<StepRecord> = self
            .lock()
            .steps
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| {
            let key = |s: &StepRecord| {
                (
                    s.parent_step_id.clone().unwrap_or_else(|| s.step_id.clone()),
                    s.parent_step_id.is_some(),
                    s.step_id.len(),
                    s.step_id.clone(),
                )
            };
            key(a).cmp(&key(b))
        });
        Ok(steps)
    }

    async fn upsert_step(&self, record: &StepRecord) -> Result<(), StoreError> {
        self.lock().steps.insert(
            (record.run_id.clone(), record.step_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn log_event(
        &self,
        run_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<i64, StoreError> {
        let event = NewEvent::new(event_type, payload.clone());
        Ok(self.lock().append(run_id, &event))
    }

    async fn list_events(&self, run_id: &str) -> Result<Vec<AuditEvent>, StoreError> {
        Ok(self
            .lock()
            .events
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn checkpoint_step(&self, record: &StepRecord, events: &[NewEvent]) -> Result<(), StoreError> {
        if self.take_failure() {
            return Err(StoreError::Query("injected write failure".to_string()));
        }
        let mut inner = self.lock();
        if !inner.runs.contains_key(&record.run_id) {
            return Err(StoreError::NotFound);
        }
        inner.steps.insert(
            (record.run_id.clone(), record.step_id.clone()),
            record.clone(),
        );
        for event in events {
            inner.append(&record.run_id, event);
        }
        Ok(())
    }

    async fn checkpoint_run(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
        context: Option<&Context>,
        event: Option<&NewEvent>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.transition(run_id, status, error, context)?;
        if let Some(event) = event {
            inner.append(run_id, event);
        }
        Ok(())
    }
}
