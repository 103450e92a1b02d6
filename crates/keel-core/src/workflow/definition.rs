//! Workflow definition parsing, validation, and file loading.
//!
//! Converts YAML or JSON into `WorkflowDefinition`, checks structural
//! constraints at parse time, and checks handler coverage against a
//! registry before a run starts.

use std::collections::HashSet;
use std::path::Path;

use keel_types::workflow::{
    Iteration, PARALLEL_FOR, SUB_STEP_SEPARATOR, StepKind, WorkflowDefinition,
};
use thiserror::Error;

use super::handler::HandlerRegistry;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A step type has no registered handler.
    #[error("no handler registered for step type '{step_type}' (step '{step_id}')")]
    UnknownStepType { step_id: String, step_type: String },

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a structurally valid `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_structure(&def)?;
    Ok(def)
}

/// Parse a JSON string into a structurally valid `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_structure(&def)?;
    Ok(def)
}

/// Load a workflow file, choosing the format by extension (`.json`, else YAML).
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition against the handlers an executor can dispatch to.
///
/// Runs the structural checks, then requires a handler for every task type
/// and every `parallel-for` template type.
pub fn validate_definition(
    def: &WorkflowDefinition,
    registry: &HandlerRegistry,
) -> Result<(), WorkflowError> {
    validate_structure(def)?;

    for step in &def.steps {
        let step_type = match &step.kind {
            StepKind::Task(task) => &task.step_type,
            StepKind::ParallelFor(parallel) => &parallel.template.step_type,
        };
        if !registry.contains(step_type) {
            return Err(WorkflowError::UnknownStepType {
                step_id: step.id.clone(),
                step_type: step_type.clone(),
            });
        }
    }

    Ok(())
}

/// Registry-independent checks.
///
/// - Name is non-empty and at least one step exists
/// - Step IDs are non-empty, unique, and free of the sub-step separator
/// - Templates do not nest `parallel-for`
/// - Fan-out width and concurrency are >= 1
/// - Retry `max_attempts` >= 1 and timeouts > 0 when set
fn validate_structure(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.is_empty() {
            return Err(WorkflowError::ValidationError(
                "step ID must not be empty".to_string(),
            ));
        }
        if step.id.contains(SUB_STEP_SEPARATOR) {
            return Err(WorkflowError::ValidationError(format!(
                "step ID '{}' must not contain '{SUB_STEP_SEPARATOR}'",
                step.id
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }

        if let Some(retry) = &step.retry {
            retry.validate().map_err(|e| {
                WorkflowError::ValidationError(format!("step '{}': {e}", step.id))
            })?;
        }
        if step.timeout_secs == Some(0) {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}': timeout must be > 0",
                step.id
            )));
        }

        if let StepKind::ParallelFor(parallel) = &step.kind {
            if parallel.template.step_type == PARALLEL_FOR {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}': parallel-for blocks cannot be nested",
                    step.id
                )));
            }
            match &parallel.over {
                Iteration::Count(0) => {
                    return Err(WorkflowError::ValidationError(format!(
                        "step '{}': count must be >= 1",
                        step.id
                    )));
                }
                Iteration::ContextKey(key) if key.is_empty() => {
                    return Err(WorkflowError::ValidationError(format!(
                        "step '{}': 'over' must name a context key",
                        step.id
                    )));
                }
                _ => {}
            }
            if parallel.concurrency == Some(0) {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}': concurrency must be >= 1",
                    step.id
                )));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::handler::NoopHandler;

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new()
            .register("noop", NoopHandler)
            .register("summarize", NoopHandler)
    }

    #[test]
    fn test_parse_two_step_yaml() {
        let yaml = r#"
name: two-step
steps:
  - id: a
    type: noop
    input: { v: 1 }
  - id: b
    type: noop
    input: { v: 2 }
"#;
        let def = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(def.name, "two-step");
        assert_eq!(def.steps.len(), 2);
        validate_definition(&def, &registry()).unwrap();
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{"name": "fan", "steps": [
            {"id": "f", "type": "parallel-for", "count": 3, "template": {"type": "summarize"}}
        ]}"#;
        let def = parse_workflow_json(json).unwrap();
        validate_definition(&def, &registry()).unwrap();
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let err = parse_workflow_yaml("name: [unterminated").unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)));
    }

    #[test]
    fn test_empty_steps_rejected() {
        let err = parse_workflow_yaml("name: empty\nsteps: []\n").unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let yaml = r#"
name: dup
steps:
  - { id: a, type: noop }
  - { id: a, type: noop }
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate step ID"));
    }

    #[test]
    fn test_separator_in_id_rejected() {
        let yaml = "name: x\nsteps:\n  - { id: 'a:1', type: noop }\n";
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::ValidationError(_)));
    }

    #[test]
    fn test_zero_count_rejected() {
        let yaml = r#"
name: fan
steps:
  - id: f
    type: parallel-for
    count: 0
    template: { type: summarize }
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("count must be >= 1"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let yaml = r#"
name: fan
steps:
  - id: f
    type: parallel-for
    over: items
    concurrency: 0
    template: { type: summarize }
"#;
        assert!(parse_workflow_yaml(yaml).is_err());
    }

    #[test]
    fn test_zero_retry_attempts_rejected() {
        let yaml = r#"
name: r
steps:
  - id: a
    type: noop
    retry: { max_attempts: 0, base_delay_ms: 10, max_delay_ms: 10 }
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_unregistered_type_rejected() {
        let yaml = "name: x\nsteps:\n  - { id: a, type: model-select }\n";
        let def = parse_workflow_yaml(yaml).unwrap();
        let err = validate_definition(&def, &registry()).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::UnknownStepType { ref step_type, .. } if step_type == "model-select"
        ));
    }

    #[test]
    fn test_unregistered_template_type_rejected() {
        let yaml = r#"
name: fan
steps:
  - id: f
    type: parallel-for
    count: 2
    template: { type: evidence-capture }
"#;
        let def = parse_workflow_yaml(yaml).unwrap();
        assert!(validate_definition(&def, &registry()).is_err());
    }

    #[test]
    fn test_load_workflow_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let yaml_path = dir.path().join("wf.yaml");
        std::fs::write(&yaml_path, "name: y\nsteps:\n  - { id: a, type: noop }\n").unwrap();
        assert_eq!(load_workflow_file(&yaml_path).unwrap().name, "y");

        let json_path = dir.path().join("wf.json");
        std::fs::write(
            &json_path,
            r#"{"name": "j", "steps": [{"id": "a", "type": "noop"}]}"#,
        )
        .unwrap();
        assert_eq!(load_workflow_file(&json_path).unwrap().name, "j");

        let err = load_workflow_file(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, WorkflowError::IoError(_)));
    }
}
