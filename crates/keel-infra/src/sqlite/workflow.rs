//! SQLite workflow store implementation.
//!
//! Implements `WorkflowStore` from keel-core with WAL-mode SQLite. Every
//! `checkpoint_*` call runs in a single writer transaction so a step's status,
//! its result and its audit events become visible together or not at all.

use chrono::{DateTime, SecondsFormat, Utc};
use keel_core::repository::workflow::{NewEvent, WorkflowStore};
use keel_types::Context;
use keel_types::error::StoreError;
use keel_types::run::{AuditEvent, RunState, RunStatus, StepRecord, StepStatus, WorkflowRun};
use sqlx::Row;
use sqlx::sqlite::SqliteConnection;

use super::pool::DatabasePool;

/// SQLite-backed workflow store.
#[derive(Clone)]
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    workflow_name: String,
    status: String,
    input: String,
    context: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_name: row.try_get("workflow_name")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            context: row.try_get("context")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, StoreError> {
        Ok(WorkflowRun {
            status: self.status.parse().map_err(StoreError::Query)?,
            input: parse_context(&self.input)?,
            context: parse_context(&self.context)?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            id: self.id,
            workflow_name: self.workflow_name,
            error: self.error,
        })
    }
}

struct StepRow {
    run_id: String,
    step_id: String,
    parent_step_id: Option<String>,
    status: String,
    result: Option<String>,
    error: Option<String>,
    attempts: i64,
    retry_floor: i64,
    updated_at: String,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step_id: row.try_get("step_id")?,
            parent_step_id: row.try_get("parent_step_id")?,
            status: row.try_get("status")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            attempts: row.try_get("attempts")?,
            retry_floor: row.try_get("retry_floor")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<StepRecord, StoreError> {
        let status: StepStatus = self.status.parse().map_err(StoreError::Query)?;
        let result = self.result.as_deref().map(parse_context).transpose()?;
        Ok(StepRecord {
            status,
            result,
            attempts: to_u32(self.attempts, "attempts")?,
            retry_floor: to_u32(self.retry_floor, "retry_floor")?,
            updated_at: parse_datetime(&self.updated_at)?,
            run_id: self.run_id,
            step_id: self.step_id,
            parent_step_id: self.parent_step_id,
            error: self.error,
        })
    }
}

struct EventRow {
    seq: i64,
    run_id: String,
    event_type: String,
    payload: String,
    created_at: String,
}

impl EventRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            seq: row.try_get("seq")?,
            run_id: row.try_get("run_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_event(self) -> Result<AuditEvent, StoreError> {
        Ok(AuditEvent {
            payload: serde_json::from_str(&self.payload)
                .map_err(|e| StoreError::Query(format!("invalid event payload: {e}")))?,
            created_at: parse_datetime(&self.created_at)?,
            seq: self.seq,
            run_id: self.run_id,
            event_type: self.event_type,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Query(format!("invalid datetime '{s}': {e}")))
}

/// Fixed precision keeps lexical and chronological order identical.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_context(s: &str) -> Result<Context, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::Query(format!("invalid context JSON: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Query(e.to_string()))
}

fn to_u32(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Query(format!("{column} out of range: {value}")))
}

fn store_err(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Connection
        }
        sqlx::Error::Database(ref db_err) if db_err.message().contains("FOREIGN KEY") => {
            StoreError::NotFound
        }
        other => StoreError::Query(other.to_string()),
    }
}

async fn insert_event(
    conn: &mut SqliteConnection,
    run_id: &str,
    event: &NewEvent,
) -> Result<i64, StoreError> {
    let payload = to_json(&event.payload)?;
    let result = sqlx::query(
        "INSERT INTO workflow_events (run_id, event_type, payload, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(run_id)
    .bind(&event.event_type)
    .bind(&payload)
    .bind(format_datetime(&Utc::now()))
    .execute(&mut *conn)
    .await
    .map_err(store_err)?;

    Ok(result.last_insert_rowid())
}

async fn insert_run(conn: &mut SqliteConnection, run: &WorkflowRun) -> Result<(), StoreError> {
    let input = to_json(&run.input)?;
    let context = to_json(&run.context)?;

    sqlx::query(
        r#"INSERT INTO workflow_runs (id, workflow_name, status, input, context, error, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&run.id)
    .bind(&run.workflow_name)
    .bind(run.status.as_str())
    .bind(&input)
    .bind(&context)
    .bind(&run.error)
    .bind(format_datetime(&run.created_at))
    .bind(format_datetime(&run.updated_at))
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if let sqlx::Error::Database(ref db_err) = e {
            if db_err.message().contains("UNIQUE") {
                return StoreError::Conflict(format!("run '{}' already exists", run.id));
            }
        }
        store_err(e)
    })?;

    Ok(())
}

/// Read the current status, validate the move, then write it.
async fn transition_run(
    conn: &mut SqliteConnection,
    run_id: &str,
    status: RunStatus,
    error: Option<&str>,
    context: Option<&Context>,
) -> Result<(), StoreError> {
    let current: Option<String> =
        sqlx::query_scalar("SELECT status FROM workflow_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(store_err)?;

    let current: RunStatus = current
        .ok_or(StoreError::NotFound)?
        .parse()
        .map_err(StoreError::Query)?;

    if !current.can_transition_to(status) {
        return Err(StoreError::InvalidTransition {
            from: current,
            to: status,
        });
    }

    let context = context.map(to_json).transpose()?;

    sqlx::query(
        r#"UPDATE workflow_runs
           SET status = ?, error = ?, context = COALESCE(?, context), updated_at = ?
           WHERE id = ?"#,
    )
    .bind(status.as_str())
    .bind(error)
    .bind(&context)
    .bind(format_datetime(&Utc::now()))
    .bind(run_id)
    .execute(&mut *conn)
    .await
    .map_err(store_err)?;

    Ok(())
}

async fn write_step(conn: &mut SqliteConnection, record: &StepRecord) -> Result<(), StoreError> {
    let result = record.result.as_ref().map(to_json).transpose()?;

    sqlx::query(
        r#"INSERT INTO workflow_steps
               (run_id, step_id, parent_step_id, status, result, error, attempts, retry_floor, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT (run_id, step_id) DO UPDATE SET
               parent_step_id = excluded.parent_step_id,
               status = excluded.status,
               result = excluded.result,
               error = excluded.error,
               attempts = excluded.attempts,
               retry_floor = excluded.retry_floor,
               updated_at = excluded.updated_at"#,
    )
    .bind(&record.run_id)
    .bind(&record.step_id)
    .bind(&record.parent_step_id)
    .bind(record.status.as_str())
    .bind(&result)
    .bind(&record.error)
    .bind(i64::from(record.attempts))
    .bind(i64::from(record.retry_floor))
    .bind(format_datetime(&record.updated_at))
    .execute(&mut *conn)
    .await
    .map_err(store_err)?;

    Ok(())
}

async fn fetch_steps(
    conn: &mut SqliteConnection,
    run_id: &str,
) -> Result<Vec<StepRecord>, StoreError> {
    // Sub-steps follow their parent; equal-prefix ids sort numerically by length first.
    let rows = sqlx::query(
        "SELECT * FROM workflow_steps WHERE run_id = ? \
         ORDER BY COALESCE(parent_step_id, step_id), parent_step_id IS NOT NULL, \
         length(step_id), step_id",
    )
    .bind(run_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(store_err)?;

    rows.iter()
        .map(|row| {
            StepRow::from_row(row)
                .map_err(|e| StoreError::Query(e.to_string()))?
                .into_record()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// WorkflowStore implementation
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteWorkflowStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let mut conn = self.pool.writer.acquire().await.map_err(store_err)?;
        insert_run(&mut conn, run).await
    }

    async fn start_run(&self, run: &WorkflowRun, event: &NewEvent) -> Result<(), StoreError> {
        let mut tx = self.pool.writer.begin().await.map_err(store_err)?;
        insert_run(&mut tx, run).await?;
        insert_event(&mut tx, &run.id, event).await?;
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
        context: Option<&Context>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.writer.begin().await.map_err(store_err)?;
        transition_run(&mut tx, run_id, status, error, context).await?;
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(store_err)?;

        match row {
            Some(row) => {
                let run_row = RunRow::from_row(&row).map_err(|e| StoreError::Query(e.to_string()))?;
                Ok(Some(run_row.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn get_run_state(&self, run_id: &str) -> Result<Option<RunState>, StoreError> {
        // One read transaction so the run and its steps come from the same snapshot.
        let mut tx = self.pool.reader.begin().await.map_err(store_err)?;

        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let run = RunRow::from_row(&row)
            .map_err(|e| StoreError::Query(e.to_string()))?
            .into_run()?;
        let steps = fetch_steps(&mut tx, run_id).await?;

        tx.commit().await.map_err(store_err)?;
        Ok(Some(RunState { run, steps }))
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE status = 'running' ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|row| {
                RunRow::from_row(row)
                    .map_err(|e| StoreError::Query(e.to_string()))?
                    .into_run()
            })
            .collect()
    }

    async fn get_step(&self, run_id: &str, step_id: &str) -> Result<Option<StepRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_steps WHERE run_id = ? AND step_id = ?")
            .bind(run_id)
            .bind(step_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(store_err)?;

        match row {
            Some(row) => {
                let step_row =
                    StepRow::from_row(&row).map_err(|e| StoreError::Query(e.to_string()))?;
                Ok(Some(step_row.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        let mut conn = self.pool.reader.acquire().await.map_err(store_err)?;
        fetch_steps(&mut conn, run_id).await
    }

    async fn upsert_step(&self, record: &StepRecord) -> Result<(), StoreError> {
        let mut conn = self.pool.writer.acquire().await.map_err(store_err)?;
        write_step(&mut conn, record).await
    }

    async fn log_event(
        &self,
        run_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<i64, StoreError> {
        let mut conn = self.pool.writer.acquire().await.map_err(store_err)?;
        let event = NewEvent::new(event_type, payload.clone());
        insert_event(&mut conn, run_id, &event).await
    }

    async fn list_events(&self, run_id: &str) -> Result<Vec<AuditEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_events WHERE run_id = ? ORDER BY created_at ASC, seq ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|row| {
                EventRow::from_row(row)
                    .map_err(|e| StoreError::Query(e.to_string()))?
                    .into_event()
            })
            .collect()
    }

    async fn checkpoint_step(&self, record: &StepRecord, events: &[NewEvent]) -> Result<(), StoreError> {
        let mut tx = self.pool.writer.begin().await.map_err(store_err)?;
        write_step(&mut tx, record).await?;
        for event in events {
            insert_event(&mut tx, &record.run_id, event).await?;
        }
        tx.commit().await.map_err(store_err)?;

        tracing::trace!(
            run_id = %record.run_id,
            step_id = %record.step_id,
            status = %record.status,
            events = events.len(),
            "step checkpoint committed"
        );
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
        let mut tx = self.pool.writer.begin().await.map_err(store_err)?;
        transition_run(&mut tx, run_id, status, error, context).await?;
        if let Some(event) = event {
            insert_event(&mut tx, run_id, event).await?;
        }
        tx.commit().await.map_err(store_err)?;

        tracing::trace!(run_id, status = %status, "run checkpoint committed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
