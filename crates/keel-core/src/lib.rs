//! Durable workflow engine logic and store port definitions for keel.
//!
//! This crate defines the "port" (the `WorkflowStore` trait) that the
//! infrastructure layer implements, plus the executor that drives runs
//! against it. It depends only on `keel-types` -- never on `keel-infra`
//! or any database/IO crate.

pub mod repository;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
