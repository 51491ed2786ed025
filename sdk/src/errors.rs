//! Error types and handling
//!
//! This module provides the error types used throughout the lovestats engine.
//! All errors implement the `ErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! # Propagation
//!
//! Partition-level and campaign-year-level failures are isolated by the
//! caller and never abort a refresh batch. Only catalog and filesystem
//! failures are fatal to the job that hit them.

use thiserror::Error;

/// Trait for engine error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait ErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to API clients and does not contain
    /// credentials, hostnames, or file paths.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors are retried on the next cycle or skipped for the
    /// unit that produced them. Non-recoverable errors stop the invoking job.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Upstream**: statement timeouts and unreachable replicas
/// - **Aggregation**: invariant or structural problems in produced records
/// - **Cache**: background rebuild failures
/// - **Refresh**: overlapping refresh triggers
/// - **Catalog**: malformed persisted catalog
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, ErrorExt};
///
/// let error = EngineError::UpstreamTimeout {
///     lane: "bounded".to_string(),
///     budget_secs: 300,
/// };
/// assert!(error.is_recoverable());
///
/// let fatal = EngineError::CatalogMerge("expected object".to_string());
/// assert!(!fatal.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Local run history
    #[error("Database error: {0}")]
    Database(String),

    // Upstream query source
    #[error("Upstream query exceeded the {lane} lane budget of {budget_secs}s")]
    UpstreamTimeout { lane: String, budget_secs: u64 },

    #[error("Upstream connection error: {0}")]
    UpstreamConnection(String),

    #[error("Upstream returned an unexpected row: {0}")]
    UpstreamRow(String),

    // Aggregation
    #[error("Aggregation validation failed for {campaign} {year}: {reason}")]
    AggregationValidation {
        campaign: String,
        year: i32,
        reason: String,
    },

    // Cache
    #[error("Cache build failed for {key}: {reason}")]
    CacheBuild { key: String, reason: String },

    // Refresh
    #[error("A {running} refresh is already running")]
    ConcurrentRefreshRejected { running: String },

    // Catalog
    #[error("Catalog merge aborted: {0}")]
    CatalogMerge(String),

    #[error("Campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True for errors the planner treats as a skipped partition
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::UpstreamTimeout { .. })
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl ErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Database(_) => "Run history is unavailable. Check the data directory",

            Self::UpstreamTimeout { .. } => {
                "The statistics replica took too long. Partial results were kept"
            }
            Self::UpstreamConnection(_) => {
                "The statistics replica is unreachable. Check credentials and network"
            }
            Self::UpstreamRow(_) => "The statistics replica returned unexpected data",

            Self::AggregationValidation { .. } => {
                "Some statistics failed validation. See the refresh log"
            }
            Self::CacheBuild { .. } => "Data is being prepared. Please retry shortly",
            Self::ConcurrentRefreshRejected { .. } => {
                "A refresh is already running. Check the status endpoint"
            }
            Self::CatalogMerge(_) => "The stored catalog is damaged and was left untouched",
            Self::CampaignNotFound(_) => "The requested campaign does not exist",
            Self::Serialization(_) => "Stored data could not be decoded",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Fatal to the invoking job
            Self::CatalogMerge(_) | Self::Config(_) | Self::Io(_) => false,

            // All other errors are retried or skipped
            _ => true,
        }
    }
}
