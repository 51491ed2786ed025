//! lovestats engine library
//!
//! Statistics for the Wiki Loves photo campaigns, pulled from the Commons
//! replica in small bounded queries, kept in a local catalog and served
//! through a TTL cache. Used by both the binary and integration tests.

/// Configuration management module
pub mod config;

/// Time source abstraction
pub mod clock;

/// Replica query capability and its MySQL implementation
pub mod upstream;

/// Query decomposition into per-country partitions
pub mod planner;

/// Partition rows to validated YearRecords
pub mod aggregator;

/// TTL cache with deduplicated background rebuild
pub mod cache;

/// Persisted catalog and its merge rule
pub mod catalog;

/// Full and incremental refresh orchestration
pub mod refresh;

/// Run history persistence module
pub mod db;

/// HTTP read API
pub mod api;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
