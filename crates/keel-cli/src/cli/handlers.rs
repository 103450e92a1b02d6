//! Built-in step handlers available to workflows run from the CLI.
//!
//! | type    | behaviour                                                   |
//! |---------|-------------------------------------------------------------|
//! | `noop`  | returns its input as the context update                     |
//! | `sleep` | waits `ms` milliseconds, then reports `{slept_ms}`          |
//! | `fail`  | always fails with `message`, transient when `transient`     |
//! | `log`   | appends its input to the audit log as a `step_log` event    |

use std::time::Duration;

use keel_core::workflow::handler::{
    FnHandler, HandlerError, HandlerOutput, HandlerRegistry, NoopHandler, TypedHandler,
};
use keel_types::Context;
use keel_types::workflow::TaskStep;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Deserialize)]
struct SleepInput {
    ms: u64,
}

#[derive(Serialize)]
struct SleepOutput {
    slept_ms: u64,
}

#[derive(Deserialize)]
struct FailInput {
    #[serde(default = "default_fail_message")]
    message: String,
    #[serde(default)]
    transient: bool,
}

fn default_fail_message() -> String {
    "failed by request".to_string()
}

/// Registry holding every built-in handler.
pub fn builtin_registry() -> HandlerRegistry {
    HandlerRegistry::new()
        .register("noop", NoopHandler)
        .register(
            "sleep",
            TypedHandler::new(|input: SleepInput, _ctx: Context| async move {
                tokio::time::sleep(Duration::from_millis(input.ms)).await;
                Ok::<_, HandlerError>(SleepOutput { slept_ms: input.ms })
            }),
        )
        .register(
            "fail",
            TypedHandler::new(|input: FailInput, _ctx: Context| async move {
                let error = if input.transient {
                    HandlerError::transient(input.message)
                } else {
                    HandlerError::permanent(input.message)
                };
                Err::<Context, _>(error)
            }),
        )
        .register(
            "log",
            FnHandler::new(|step: TaskStep, _ctx: Context| async move {
                tracing::info!(step_id = %step.id, "log step");
                Ok::<_, HandlerError>(
                    HandlerOutput::new(Context::new())
                        .with_event("step_log", Value::Object(step.input)),
                )
            }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(step_type: &str, input: Value) -> TaskStep {
        TaskStep {
            id: "t".to_string(),
            step_type: step_type.to_string(),
            input: input.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn registry_lists_builtins() {
        let registry = builtin_registry();
        assert_eq!(registry.step_types(), vec!["fail", "log", "noop", "sleep"]);
    }

    #[tokio::test]
    async fn sleep_reports_duration() {
        let registry = builtin_registry();
        let out = registry
            .get("sleep")
            .unwrap()
            .handle(&task("sleep", json!({"ms": 1})), Context::new())
            .await
            .unwrap();
        assert_eq!(out.update["slept_ms"], 1);
    }

    #[tokio::test]
    async fn fail_honours_transient_flag() {
        let registry = builtin_registry();
        let handler = registry.get("fail").unwrap();

        let err = handler
            .handle(&task("fail", json!({"transient": true})), Context::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let err = handler
            .handle(&task("fail", json!({"message": "nope"})), Context::new())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn log_emits_event_without_update() {
        let registry = builtin_registry();
        let out = registry
            .get("log")
            .unwrap()
            .handle(&task("log", json!({"note": "hi"})), Context::new())
            .await
            .unwrap();
        assert!(out.update.is_empty());
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].event_type, "step_log");
        assert_eq!(out.events[0].payload["note"], "hi");
    }
}
