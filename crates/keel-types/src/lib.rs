//! Shared domain types for keel.
//!
//! Runs, step records, audit events, workflow definitions, retry policy and
//! engine configuration, together with the store error type used by the
//! repository port in keel-core.
//!
//! Zero infrastructure dependencies -- only serde, serde_json, chrono, thiserror.

pub mod config;
pub mod error;
pub mod run;
pub mod workflow;

/// Accumulated workflow state: a JSON object keyed by context field.
pub type Context = serde_json::Map<String, serde_json::Value>;
