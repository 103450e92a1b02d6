//! Durable workflow engine: definitions, checkpointing, handlers and execution.
//!
//! - `definition` -- YAML/JSON parsing and validation against a handler registry
//! - `context` -- context accumulator (merge and rehydrate)
//! - `handler` -- step handler contract, adapters and the registry
//! - `retry` -- retry decision and exponential backoff
//! - `checkpoint` -- atomic step/run transitions over the store
//! - `executor` -- the per-run state machine (`execute` / `resume`)
//! - `fan_out` -- `parallel-for` expansion with a fan-in barrier

pub mod checkpoint;
pub mod context;
pub mod definition;
pub mod executor;
pub mod fan_out;
pub mod handler;
pub mod retry;
