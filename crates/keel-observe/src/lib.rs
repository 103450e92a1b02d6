//! Observability setup for keel: structured logging with an optional
//! OpenTelemetry bridge.

pub mod tracing_setup;
