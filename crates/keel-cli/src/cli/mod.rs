//! CLI command definitions for the `keel` binary.
//!
//! Uses clap derive macros for argument parsing. Workflow definitions are
//! passed as file paths (YAML, or JSON by `.json` extension); runs are
//! addressed by the run id printed when they start.

pub mod handlers;
pub mod inspect;
pub mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use comfy_table::{Cell, Color};
use keel_types::run::{RunStatus, StepStatus};

/// Run durable, resumable workflows.
#[derive(Parser)]
#[command(name = "keel", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Data directory holding `keel.toml`.
    #[arg(long, global = true, env = "KEEL_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Config file path (default: `<data-dir>/keel.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overriding `database_path` from the config.
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new run of a workflow.
    Run {
        /// Path to the workflow definition.
        workflow: PathBuf,

        /// Initial context as a JSON object.
        #[arg(long)]
        input: Option<String>,

        /// Use this run id instead of generating one.
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Continue a run from its last checkpoint.
    Resume {
        /// Run id to resume.
        run_id: String,

        /// Path to the workflow definition the run was started with.
        workflow: PathBuf,
    },

    /// Resume every unfinished run of a workflow.
    Recover {
        /// Path to the workflow definition.
        workflow: PathBuf,
    },

    /// Show a run's status and step summary.
    Status {
        /// Run id.
        run_id: String,
    },

    /// List a run's step records.
    Steps {
        /// Run id.
        run_id: String,
    },

    /// Show a run's audit log.
    Events {
        /// Run id.
        run_id: String,
    },

    /// List runs still marked running.
    Unfinished,

    /// Validate a workflow definition against the built-in handlers.
    Validate {
        /// Path to the workflow definition.
        workflow: PathBuf,
    },
}

/// Colored table cell for a run status.
pub fn run_status_cell(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Running => Color::Yellow,
        RunStatus::Completed => Color::Green,
        RunStatus::Failed => Color::Red,
    };
    Cell::new(status).fg(color)
}

/// Colored table cell for a step status.
pub fn step_status_cell(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Pending => Color::DarkGrey,
        StepStatus::Running => Color::Yellow,
        StepStatus::Completed => Color::Green,
        StepStatus::Failed => Color::Red,
    };
    Cell::new(status).fg(color)
}
