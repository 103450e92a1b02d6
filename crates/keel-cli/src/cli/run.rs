//! Commands that drive the executor: run, resume, recover, validate.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use keel_core::workflow::definition::{WorkflowError, load_workflow_file, validate_definition};
use keel_core::workflow::executor::{ExecutionResult, ExecutorError, WorkflowExecutor};
use keel_infra::sqlite::workflow::SqliteWorkflowStore;
use keel_types::Context;
use keel_types::workflow::{StepKind, WorkflowDefinition};
use tokio_util::sync::CancellationToken;

use super::handlers::builtin_registry;
use super::run_status_cell;
use crate::state::AppState;

/// Output switches shared by every command.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

fn load_definition(path: &Path) -> Result<WorkflowDefinition> {
    load_workflow_file(path).map_err(|e| match e {
        WorkflowError::ParseError(msg) => {
            anyhow!("failed to parse workflow {}: {msg}", path.display())
        }
        WorkflowError::ValidationError(msg) => {
            anyhow!("workflow {} is invalid: {msg}", path.display())
        }
        other => anyhow!("failed to load workflow {}: {other}", path.display()),
    })
}

fn parse_input(raw: Option<&str>) -> Result<Context> {
    let Some(raw) = raw else {
        return Ok(Context::new());
    };
    match serde_json::from_str::<serde_json::Value>(raw).context("invalid JSON input")? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("input must be a JSON object, got {other}"),
    }
}

async fn build_executor(
    state: &AppState,
    shutdown: CancellationToken,
) -> Result<WorkflowExecutor<SqliteWorkflowStore>> {
    let config = state.engine_config().await?;
    let store = state.open_store(&config.database_path).await?;
    Ok(WorkflowExecutor::new(store, Arc::new(builtin_registry()), config).with_shutdown(shutdown))
}

// ---------------------------------------------------------------------------
// Run / Resume
// ---------------------------------------------------------------------------

pub async fn handle_run(
    state: &AppState,
    workflow: &Path,
    input: Option<&str>,
    run_id: Option<&str>,
    shutdown: CancellationToken,
    out: Output,
) -> Result<()> {
    let def = load_definition(workflow)?;
    let input = parse_input(input)?;
    let executor = build_executor(state, shutdown).await?;

    let outcome = match run_id {
        Some(id) => executor.execute_with_run_id(id, &def, input).await,
        None => executor.execute(&def, input).await,
    };
    report_outcome(&def, workflow, outcome, out)
}

pub async fn handle_resume(
    state: &AppState,
    run_id: &str,
    workflow: &Path,
    shutdown: CancellationToken,
    out: Output,
) -> Result<()> {
    let def = load_definition(workflow)?;
    let executor = build_executor(state, shutdown).await?;
    let outcome = executor.resume(run_id, &def).await;
    report_outcome(&def, workflow, outcome, out)
}

fn report_outcome(
    def: &WorkflowDefinition,
    workflow: &Path,
    outcome: Result<ExecutionResult, ExecutorError>,
    out: Output,
) -> Result<()> {
    match outcome {
        Ok(result) => {
            if out.json {
                let json = serde_json::json!({
                    "run_id": result.run_id,
                    "status": result.status,
                    "context": result.context,
                });
                println!("{}", serde_json::to_string_pretty(&json)?);
            } else if !out.quiet {
                println!();
                println!(
                    "  {} Workflow '{}' {}",
                    style("*").green().bold(),
                    style(&def.name).cyan(),
                    style(result.status).green()
                );
                println!("  Run ID: {}", result.run_id);
                println!(
                    "  Context: {}",
                    serde_json::to_string(&result.context).unwrap_or_default()
                );
                println!();
            }
            Ok(())
        }
        Err(ExecutorError::Cancelled) => {
            if !out.quiet {
                eprintln!(
                    "  {} Interrupted; the run stays resumable ({}).",
                    style("!").yellow().bold(),
                    style(format!("keel recover {}", workflow.display())).dim()
                );
            }
            bail!("workflow interrupted by shutdown")
        }
        Err(err) => {
            if let (Some(run_id), false) = (err.run_id(), out.quiet) {
                eprintln!();
                eprintln!(
                    "  {} Run {} failed",
                    style("x").red().bold(),
                    style(run_id).cyan()
                );
                eprintln!(
                    "  Resume after fixing the cause: {}",
                    style(format!("keel resume {run_id} {}", workflow.display())).dim()
                );
                eprintln!();
            }
            Err(err.into())
        }
    }
}

// ---------------------------------------------------------------------------
// Recover
// ---------------------------------------------------------------------------

pub async fn handle_recover(
    state: &AppState,
    workflow: &Path,
    shutdown: CancellationToken,
    out: Output,
) -> Result<()> {
    let def = load_definition(workflow)?;
    let executor = build_executor(state, shutdown).await?;
    let outcomes = executor
        .recover(&def)
        .await
        .context("failed to scan for unfinished runs")?;

    let failures = outcomes.iter().filter(|(_, o)| o.is_err()).count();

    if out.json {
        let json: Vec<_> = outcomes
            .iter()
            .map(|(run_id, outcome)| match outcome {
                Ok(result) => serde_json::json!({
                    "run_id": run_id,
                    "status": result.status,
                }),
                Err(e) => serde_json::json!({
                    "run_id": run_id,
                    "status": "failed",
                    "error": e.to_string(),
                }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else if !out.quiet {
        if outcomes.is_empty() {
            println!();
            println!("  No unfinished runs for workflow '{}'.", def.name);
            println!();
        } else {
            let mut table = Table::new();
            table
                .load_preset(presets::UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    Cell::new("Run ID").fg(Color::Cyan),
                    Cell::new("Outcome"),
                    Cell::new("Error"),
                ]);
            for (run_id, outcome) in &outcomes {
                match outcome {
                    Ok(result) => table.add_row(vec![
                        Cell::new(run_id),
                        run_status_cell(result.status),
                        Cell::new("-"),
                    ]),
                    Err(e) => table.add_row(vec![
                        Cell::new(run_id),
                        Cell::new("failed").fg(Color::Red),
                        Cell::new(e.to_string()),
                    ]),
                };
            }
            println!();
            println!("  Recovered runs of '{}'", style(&def.name).cyan());
            println!();
            println!("{table}");
            println!();
        }
    }

    if failures > 0 {
        bail!("{failures} of {} recovered run(s) did not complete", outcomes.len());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn handle_validate(workflow: &Path, out: Output) -> Result<()> {
    let def = load_definition(workflow)?;
    validate_definition(&def, &builtin_registry())
        .with_context(|| format!("workflow '{}' cannot run with the built-in handlers", def.name))?;

    if out.json {
        let steps: Vec<_> = def
            .steps
            .iter()
            .map(|s| serde_json::json!({ "id": s.id, "type": s.type_name() }))
            .collect();
        let json = serde_json::json!({ "name": def.name, "valid": true, "steps": steps });
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    if out.quiet {
        return Ok(());
    }

    println!();
    println!(
        "  {} Workflow '{}' is valid",
        style("*").green().bold(),
        style(&def.name).cyan()
    );
    for step in &def.steps {
        let detail = match &step.kind {
            StepKind::Task(task) => task.step_type.clone(),
            StepKind::ParallelFor(parallel) => {
                format!("parallel-for -> {}", parallel.template.step_type)
            }
        };
        println!("    {} {}", style(&step.id).bold(), style(detail).dim());
    }
    println!();
    Ok(())
}
