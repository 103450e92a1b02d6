//! Step handler contract, adapters and the handler registry.
//!
//! A handler maps `(task step, context snapshot)` to a partial context update.
//! External collaborators (budget checks, model selection, evidence capture,
//! ...) all plug in through this one contract.
//!
//! `StepHandler` uses RPITIT and therefore cannot be a trait object. Dynamic
//! dispatch goes through the usual three pieces:
//! 1. An object-safe `StepHandlerDyn` trait with boxed futures
//! 2. A blanket impl of `StepHandlerDyn` for every `T: StepHandler`
//! 3. `BoxStepHandler`, which wraps `Box<dyn StepHandlerDyn>` and delegates

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use keel_types::Context;
use keel_types::workflow::TaskStep;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::repository::workflow::NewEvent;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

/// A classified handler failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// What a successful handler returns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutput {
    /// Partial context update, merged last-writer-wins.
    pub update: Context,
    /// Handler-defined audit events, committed with the `step_completed` checkpoint.
    pub events: Vec<NewEvent>,
}

impl HandlerOutput {
    pub fn new(update: Context) -> Self {
        Self {
            update,
            events: Vec::new(),
        }
    }

    pub fn with_event(mut self, event_type: impl Into<String>, payload: Value) -> Self {
        self.events.push(NewEvent::new(event_type, payload));
        self
    }
}

// ---------------------------------------------------------------------------
// StepHandler
// ---------------------------------------------------------------------------

/// A step implementation, selected by step type.
///
/// Handlers receive the context by value; mutations they make to it are
/// discarded. Only the returned update is merged.
pub trait StepHandler: Send + Sync {
    fn handle(
        &self,
        step: &TaskStep,
        context: Context,
    ) -> impl Future<Output = Result<HandlerOutput, HandlerError>> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn handle_boxed<'a>(
        &'a self,
        step: &'a TaskStep,
        context: Context,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'a>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn handle_boxed<'a>(
        &'a self,
        step: &'a TaskStep,
        context: Context,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'a>> {
        Box::pin(self.handle(step, context))
    }
}

/// Type-erased step handler stored in the registry.
pub struct BoxStepHandler {
    inner: Box<dyn StepHandlerDyn + Send + Sync>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub async fn handle(
        &self,
        step: &TaskStep,
        context: Context,
    ) -> Result<HandlerOutput, HandlerError> {
        self.inner.handle_boxed(step, context).await
    }
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

/// Adapts an async closure into a handler.
///
/// The closure receives owned copies of the step and context so its future
/// can be `'static`.
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(TaskStep, Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutput, HandlerError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(TaskStep, Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutput, HandlerError>> + Send,
{
    fn handle(
        &self,
        step: &TaskStep,
        context: Context,
    ) -> impl Future<Output = Result<HandlerOutput, HandlerError>> + Send {
        (self.f)(step.clone(), context)
    }
}

/// Adapts a strongly typed async function into a handler.
///
/// The step input is deserialized into `I` and the returned `O` must
/// serialize to a JSON object, which becomes the context update. A shape
/// mismatch on either side is a permanent error: retrying cannot fix it.
pub struct TypedHandler<I, O, F> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O, F, Fut> TypedHandler<I, O, F>
where
    I: DeserializeOwned + Send,
    O: Serialize,
    F: Fn(I, Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, HandlerError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _types: PhantomData,
        }
    }
}

impl<I, O, F, Fut> StepHandler for TypedHandler<I, O, F>
where
    I: DeserializeOwned + Send,
    O: Serialize,
    F: Fn(I, Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, HandlerError>> + Send,
{
    async fn handle(&self, step: &TaskStep, context: Context) -> Result<HandlerOutput, HandlerError> {
        let input: I = serde_json::from_value(Value::Object(step.input.clone())).map_err(|e| {
            HandlerError::permanent(format!("step '{}': invalid input: {e}", step.id))
        })?;

        let output = (self.f)(input, context).await?;

        match serde_json::to_value(output) {
            Ok(Value::Object(update)) => Ok(HandlerOutput::new(update)),
            Ok(other) => Err(HandlerError::permanent(format!(
                "step '{}': handler output must be an object, got {other}",
                step.id
            ))),
            Err(e) => Err(HandlerError::permanent(format!(
                "step '{}': unserializable output: {e}",
                step.id
            ))),
        }
    }
}

/// Returns the step input unchanged as the context update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl StepHandler for NoopHandler {
    async fn handle(&self, step: &TaskStep, _context: Context) -> Result<HandlerOutput, HandlerError> {
        Ok(HandlerOutput::new(step.input.clone()))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable step-type -> handler mapping, injected into the executor.
///
/// Several registries (and executors) can coexist in one process; nothing
/// here is global. `parallel-for` is built into the executor and never
/// dispatched through the registry.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BoxStepHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `step_type`, replacing any previous one.
    pub fn register<H: StepHandler + 'static>(self, step_type: impl Into<String>, handler: H) -> Self {
        self.register_boxed(step_type, BoxStepHandler::new(handler))
    }

    pub fn register_boxed(mut self, step_type: impl Into<String>, handler: BoxStepHandler) -> Self {
        self.handlers.insert(step_type.into(), handler);
        self
    }

    pub fn get(&self, step_type: &str) -> Option<&BoxStepHandler> {
        self.handlers.get(step_type)
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.handlers.contains_key(step_type)
    }

    /// Registered step types, sorted.
    pub fn step_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("step_types", &self.step_types())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn task(step_type: &str, input: Value) -> TaskStep {
        TaskStep {
            id: "s1".to_string(),
            step_type: step_type.to_string(),
            input: input.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_handler_error_display() {
        let err = HandlerError::transient("rate limited");
        assert_eq!(err.to_string(), "transient error: rate limited");
        assert!(err.is_transient());
        assert!(!HandlerError::permanent("bad").is_transient());
    }

    #[tokio::test]
    async fn test_noop_returns_input() {
        let handler = BoxStepHandler::new(NoopHandler);
        let out = handler
            .handle(&task("noop", json!({"v": 1})), Context::new())
            .await
            .unwrap();
        assert_eq!(Value::Object(out.update), json!({"v": 1}));
        assert!(out.events.is_empty());
    }

    #[tokio::test]
    async fn test_fn_handler_sees_context() {
        let handler = FnHandler::new(|_step: TaskStep, ctx: Context| async move {
            let seen = ctx.get("n").and_then(Value::as_i64).unwrap_or(0);
            let mut update = Context::new();
            update.insert("n".into(), json!(seen + 1));
            Ok::<_, HandlerError>(
                HandlerOutput::new(update).with_event("counter_bumped", json!({"from": seen})),
            )
        });
        let mut ctx = Context::new();
        ctx.insert("n".into(), json!(41));

        let out = handler.handle(&task("inc", json!({})), ctx).await.unwrap();
        assert_eq!(out.update["n"], json!(42));
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].event_type, "counter_bumped");
    }

    #[derive(Deserialize)]
    struct BudgetInput {
        limit: u64,
    }

    #[derive(Serialize)]
    struct BudgetOutput {
        approved: bool,
    }

    fn budget_handler() -> BoxStepHandler {
        BoxStepHandler::new(TypedHandler::new(
            |input: BudgetInput, _ctx: Context| async move {
                Ok::<_, HandlerError>(BudgetOutput {
                    approved: input.limit <= 10,
                })
            },
        ))
    }

    #[tokio::test]
    async fn test_typed_handler_roundtrip() {
        let out = budget_handler()
            .handle(&task("budget", json!({"limit": 5})), Context::new())
            .await
            .unwrap();
        assert_eq!(out.update["approved"], json!(true));
    }

    #[tokio::test]
    async fn test_typed_handler_schema_mismatch_is_permanent() {
        let err = budget_handler()
            .handle(&task("budget", json!({"limit": "lots"})), Context::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Permanent);
        assert!(err.message.contains("invalid input"));
    }

    #[tokio::test]
    async fn test_typed_handler_non_object_output_is_permanent() {
        let handler = TypedHandler::new(|_: Value, _ctx: Context| async move { Ok::<_, HandlerError>(7u32) });
        let err = handler
            .handle(&task("seven", json!({})), Context::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Permanent);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = HandlerRegistry::new()
            .register("noop", NoopHandler)
            .register("echo", NoopHandler);
        assert!(registry.contains("noop"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.step_types(), vec!["echo", "noop"]);
    }
}
