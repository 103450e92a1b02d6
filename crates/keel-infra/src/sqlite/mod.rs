//! SQLite persistence for workflow runs, steps and the audit log.

pub mod pool;
pub mod workflow;
