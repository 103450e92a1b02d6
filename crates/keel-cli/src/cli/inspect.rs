//! Read-only views of stored runs: status, steps, events, unfinished.
//!
//! These go through the reader pool only, so they are safe to run while
//! another process is executing the same database.

use anyhow::{Result, anyhow};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use keel_core::repository::workflow::WorkflowStore;
use keel_infra::sqlite::workflow::SqliteWorkflowStore;
use keel_types::run::{StepRecord, StepStatus};

use super::run::Output;
use super::{run_status_cell, step_status_cell};

const ERROR_PREVIEW_CHARS: usize = 60;

fn preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(max).collect();
        cut.push_str("...");
        cut
    }
}

fn step_json(step: &StepRecord) -> serde_json::Value {
    serde_json::json!({
        "step_id": step.step_id,
        "parent_step_id": step.parent_step_id,
        "status": step.status,
        "attempts": step.attempts,
        "retry_floor": step.retry_floor,
        "result": step.result,
        "error": step.error,
        "updated_at": step.updated_at.to_rfc3339(),
    })
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn handle_status(store: &SqliteWorkflowStore, run_id: &str, out: Output) -> Result<()> {
    let state = store
        .get_run_state(run_id)
        .await
        .map_err(|e| anyhow!("failed to load run: {e}"))?
        .ok_or_else(|| anyhow!("run '{run_id}' not found"))?;
    let run = &state.run;

    let count = |status: StepStatus| state.steps.iter().filter(|s| s.status == status).count();

    if out.json {
        let json = serde_json::json!({
            "run_id": run.id,
            "workflow_name": run.workflow_name,
            "status": run.status,
            "error": run.error,
            "input": run.input,
            "context": run.context,
            "created_at": run.created_at.to_rfc3339(),
            "updated_at": run.updated_at.to_rfc3339(),
            "steps": {
                "completed": count(StepStatus::Completed),
                "running": count(StepStatus::Running),
                "failed": count(StepStatus::Failed),
                "total": state.steps.len(),
            },
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    if out.quiet {
        println!("{}", run.status);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![Cell::new("Field").fg(Color::Cyan), Cell::new("Value")]);
    table.add_row(vec![Cell::new("Run ID"), Cell::new(&run.id)]);
    table.add_row(vec![Cell::new("Workflow"), Cell::new(&run.workflow_name)]);
    table.add_row(vec![Cell::new("Status"), run_status_cell(run.status)]);
    table.add_row(vec![
        Cell::new("Started"),
        Cell::new(run.created_at.format("%Y-%m-%d %H:%M:%S")),
    ]);
    table.add_row(vec![
        Cell::new("Updated"),
        Cell::new(run.updated_at.format("%Y-%m-%d %H:%M:%S")),
    ]);
    table.add_row(vec![
        Cell::new("Steps"),
        Cell::new(format!(
            "{} completed, {} running, {} failed",
            count(StepStatus::Completed),
            count(StepStatus::Running),
            count(StepStatus::Failed)
        )),
    ]);
    if let Some(err) = &run.error {
        table.add_row(vec![Cell::new("Error"), Cell::new(err).fg(Color::Red)]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

pub async fn handle_steps(store: &SqliteWorkflowStore, run_id: &str, out: Output) -> Result<()> {
    if store
        .get_run(run_id)
        .await
        .map_err(|e| anyhow!("failed to load run: {e}"))?
        .is_none()
    {
        return Err(anyhow!("run '{run_id}' not found"));
    }

    let steps = store
        .list_steps(run_id)
        .await
        .map_err(|e| anyhow!("failed to list steps: {e}"))?;

    if out.json {
        let json: Vec<_> = steps.iter().map(step_json).collect();
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    if steps.is_empty() {
        if !out.quiet {
            println!();
            println!("  No steps recorded for run '{}'.", style(run_id).cyan());
            println!();
        }
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Parent"),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Updated"),
            Cell::new("Error"),
        ]);

    for s in &steps {
        table.add_row(vec![
            Cell::new(&s.step_id),
            Cell::new(s.parent_step_id.as_deref().unwrap_or("-")),
            step_status_cell(s.status),
            Cell::new(s.attempts),
            Cell::new(s.updated_at.format("%H:%M:%S")),
            Cell::new(
                s.error
                    .as_deref()
                    .map(|e| preview(e, ERROR_PREVIEW_CHARS))
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ]);
    }

    println!();
    println!("  Steps for run '{}'", style(run_id).cyan());
    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub async fn handle_events(store: &SqliteWorkflowStore, run_id: &str, out: Output) -> Result<()> {
    let events = store
        .list_events(run_id)
        .await
        .map_err(|e| anyhow!("failed to list events: {e}"))?;

    if events.is_empty()
        && store
            .get_run(run_id)
            .await
            .map_err(|e| anyhow!("failed to load run: {e}"))?
            .is_none()
    {
        return Err(anyhow!("run '{run_id}' not found"));
    }

    if out.json {
        let json: Vec<_> = events
            .iter()
            .map(|e| {
                serde_json::json!({
                    "seq": e.seq,
                    "event_type": e.event_type,
                    "payload": e.payload,
                    "created_at": e.created_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    if out.quiet {
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Seq").fg(Color::Cyan),
            Cell::new("Time"),
            Cell::new("Event"),
            Cell::new("Payload"),
        ]);

    for e in &events {
        let color = match e.event_type.as_str() {
            t if t.ends_with("_failed") => Color::Red,
            t if t.ends_with("_completed") => Color::Green,
            _ => Color::Reset,
        };
        table.add_row(vec![
            Cell::new(e.seq),
            Cell::new(e.created_at.format("%H:%M:%S%.3f")),
            Cell::new(&e.event_type).fg(color),
            Cell::new(preview(&e.payload.to_string(), 80)),
        ]);
    }

    println!();
    println!("  Audit log for run '{}'", style(run_id).cyan());
    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Unfinished
// ---------------------------------------------------------------------------

pub async fn handle_unfinished(store: &SqliteWorkflowStore, out: Output) -> Result<()> {
    let runs = store
        .list_unfinished_runs()
        .await
        .map_err(|e| anyhow!("failed to list runs: {e}"))?;

    if out.json {
        let json: Vec<_> = runs
            .iter()
            .map(|r| {
                serde_json::json!({
                    "run_id": r.id,
                    "workflow_name": r.workflow_name,
                    "created_at": r.created_at.to_rfc3339(),
                    "updated_at": r.updated_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    if out.quiet {
        for r in &runs {
            println!("{}", r.id);
        }
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No unfinished runs.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Started"),
            Cell::new("Last checkpoint"),
        ]);
    for r in &runs {
        table.add_row(vec![
            Cell::new(&r.id),
            Cell::new(&r.workflow_name),
            Cell::new(r.created_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(r.updated_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!();
    println!("{table}");
    println!(
        "  Resume them with {}",
        style("keel recover <workflow>").dim()
    );
    println!();
    Ok(())
}
