//! Local SQLite store for refresh run history

pub mod runs;

pub use runs::{RunCounts, RunRecord, RunRepository, RunStatus};
