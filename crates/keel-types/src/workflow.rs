//! Workflow definition types.
//!
//! A workflow is an ordered list of steps. Each step is either a plain task,
//! resolved against the handler registry by its type name, or a
//! `parallel-for` block that expands into indexed sub-steps at run time.
//!
//! On the wire (YAML or JSON) steps are flat objects keyed by `type`; the
//! conversion into [`StepKind`] is fallible so that malformed parallel blocks
//! are rejected while parsing rather than half-way through a run.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::Context;
use crate::config::RetryPolicy;

/// Step type name that selects the fan-out primitive.
pub const PARALLEL_FOR: &str = "parallel-for";

/// Separator between a parent step id and a sub-step index.
pub const SUB_STEP_SEPARATOR: char = ':';

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
}

/// A single step. Steps run in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub struct StepDefinition {
    /// Stable id, unique within the workflow.
    pub id: String,
    pub kind: StepKind,
    /// Overrides the engine-wide retry policy for this step.
    pub retry: Option<RetryPolicy>,
    /// Overrides the engine-wide handler timeout for this step.
    pub timeout_secs: Option<u64>,
}

impl StepDefinition {
    pub fn task(id: impl Into<String>, step_type: impl Into<String>, input: Context) -> Self {
        let id = id.into();
        Self {
            kind: StepKind::Task(TaskStep {
                id: id.clone(),
                step_type: step_type.into(),
                input,
            }),
            id,
            retry: None,
            timeout_secs: None,
        }
    }

    pub fn parallel_for(id: impl Into<String>, parallel: ParallelFor) -> Self {
        Self {
            id: id.into(),
            kind: StepKind::ParallelFor(parallel),
            retry: None,
            timeout_secs: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// The wire-level type name of this step.
    pub fn type_name(&self) -> &str {
        match &self.kind {
            StepKind::Task(task) => &task.step_type,
            StepKind::ParallelFor(_) => PARALLEL_FOR,
        }
    }
}

/// What a step does, keyed by its type.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Task(TaskStep),
    ParallelFor(ParallelFor),
}

/// A unit of work handed to a step handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    /// Step id; `parent:index` for fan-out sub-steps.
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub input: Context,
}

/// Fan-out block: one sub-step per iteration item, all run concurrently.
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelFor {
    pub template: StepTemplate,
    pub over: Iteration,
    /// Maximum sub-steps in flight (engine default when absent).
    pub concurrency: Option<usize>,
    /// Context key receiving the ordered sub-step results (parent id when absent).
    pub output_key: Option<String>,
}

impl ParallelFor {
    pub fn new(template: StepTemplate, over: Iteration) -> Self {
        Self {
            template,
            over,
            concurrency: None,
            output_key: None,
        }
    }

    /// Builds sub-step `index` of the block rooted at `parent_id`.
    ///
    /// The sub-step input is the template input plus `item` and `index`.
    pub fn sub_step(&self, parent_id: &str, index: usize, item: Value) -> TaskStep {
        let mut input = self.template.input.clone();
        input.insert("item".to_string(), item);
        input.insert("index".to_string(), json!(index));
        TaskStep {
            id: sub_step_id(parent_id, index),
            step_type: self.template.step_type.clone(),
            input,
        }
    }
}

/// Shape shared by every sub-step of a `parallel-for` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub input: Context,
}

/// Iteration source for a `parallel-for` block.
#[derive(Debug, Clone, PartialEq)]
pub enum Iteration {
    /// Items `0..n`.
    Count(u32),
    /// Elements of the JSON array stored under this context key.
    ContextKey(String),
}

/// Derived id of a fan-out sub-step.
pub fn sub_step_id(parent_id: &str, index: usize) -> String {
    format!("{parent_id}{SUB_STEP_SEPARATOR}{index}")
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStep {
    id: String,
    #[serde(rename = "type")]
    step_type: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    input: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    template: Option<StepTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    over: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_secs: Option<u64>,
}

impl TryFrom<RawStep> for StepDefinition {
    type Error = String;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let kind = if raw.step_type == PARALLEL_FOR {
            let template = raw
                .template
                .ok_or_else(|| format!("step '{}': parallel-for requires a template", raw.id))?;
            let over = match (raw.count, raw.over) {
                (Some(n), None) => Iteration::Count(n),
                (None, Some(key)) => Iteration::ContextKey(key),
                _ => {
                    return Err(format!(
                        "step '{}': parallel-for requires exactly one of 'count' or 'over'",
                        raw.id
                    ));
                }
            };
            if !raw.input.is_empty() {
                return Err(format!(
                    "step '{}': parallel-for takes its input from the template",
                    raw.id
                ));
            }
            StepKind::ParallelFor(ParallelFor {
                template,
                over,
                concurrency: raw.concurrency,
                output_key: raw.output_key,
            })
        } else {
            if raw.template.is_some()
                || raw.count.is_some()
                || raw.over.is_some()
                || raw.concurrency.is_some()
                || raw.output_key.is_some()
            {
                return Err(format!(
                    "step '{}': fan-out fields are only valid on parallel-for steps",
                    raw.id
                ));
            }
            StepKind::Task(TaskStep {
                id: raw.id.clone(),
                step_type: raw.step_type,
                input: raw.input,
            })
        };

        Ok(StepDefinition {
            id: raw.id,
            kind,
            retry: raw.retry,
            timeout_secs: raw.timeout_secs,
        })
    }
}

impl From<StepDefinition> for RawStep {
    fn from(step: StepDefinition) -> Self {
        let mut raw = RawStep {
            id: step.id,
            step_type: String::new(),
            input: Context::new(),
            template: None,
            count: None,
            over: None,
            concurrency: None,
            output_key: None,
            retry: step.retry,
            timeout_secs: step.timeout_secs,
        };
        match step.kind {
            StepKind::Task(task) => {
                raw.step_type = task.step_type;
                raw.input = task.input;
            }
            StepKind::ParallelFor(parallel) => {
                raw.step_type = PARALLEL_FOR.to_string();
                raw.template = Some(parallel.template);
                match parallel.over {
                    Iteration::Count(n) => raw.count = Some(n),
                    Iteration::ContextKey(key) => raw.over = Some(key),
                }
                raw.concurrency = parallel.concurrency;
                raw.output_key = parallel.output_key;
            }
        }
        raw
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
