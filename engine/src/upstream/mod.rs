//! Upstream query source
//!
//! The statistics come from a read-only replica that enforces a hard
//! statement time limit. Two connection profiles ("lanes") differ only in
//! that limit: the bounded lane for short interactive work and the
//! extended lane for the nightly full refresh.
//!
//! The rest of the engine sees the replica through [`QueryExecutor`]:
//! `execute(query, lane) -> rows`, failing with
//! [`EngineError::UpstreamTimeout`] or [`EngineError::UpstreamConnection`].

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::Campaign;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

pub mod replica;
pub mod sql;

pub use replica::ReplicaExecutor;

/// Connection profile, distinguished by statement ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Bounded,
    Extended,
}

impl Lane {
    pub fn as_str(&self) -> &str {
        match self {
            Lane::Bounded => "bounded",
            Lane::Extended => "extended",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A query the engine knows how to ask the replica
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Enumerate the country categories of one campaign-year
    Discovery { campaign: Campaign, year: i32 },

    /// Aggregate one country category
    ///
    /// `category` is the exact title discovery returned, which may sit
    /// under an alternate prefix.
    Partition {
        campaign: Campaign,
        year: i32,
        country: String,
        category: String,
    },

    /// Aggregate every country category of a year at once
    YearTotals { campaign: Campaign, year: i32 },

    /// Per-uploader breakdown of one country category
    Uploaders {
        campaign: Campaign,
        year: i32,
        country: String,
        category: String,
    },

    /// Per-day upload counts of one country category
    DailyUploads {
        campaign: Campaign,
        year: i32,
        country: String,
        category: String,
    },
}

impl Query {
    pub fn campaign(&self) -> &Campaign {
        match self {
            Query::Discovery { campaign, .. }
            | Query::Partition { campaign, .. }
            | Query::YearTotals { campaign, .. }
            | Query::Uploaders { campaign, .. }
            | Query::DailyUploads { campaign, .. } => campaign,
        }
    }

    pub fn year(&self) -> i32 {
        match self {
            Query::Discovery { year, .. }
            | Query::Partition { year, .. }
            | Query::YearTotals { year, .. }
            | Query::Uploaders { year, .. }
            | Query::DailyUploads { year, .. } => *year,
        }
    }

    /// Exact category a country-level query reads
    pub fn category(&self) -> Option<&str> {
        match self {
            Query::Partition { category, .. }
            | Query::Uploaders { category, .. }
            | Query::DailyUploads { category, .. } => Some(category),
            Query::Discovery { .. } | Query::YearTotals { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Query::Discovery { .. } => "discovery",
            Query::Partition { .. } => "partition",
            Query::YearTotals { .. } => "year_totals",
            Query::Uploaders { .. } => "uploaders",
            Query::DailyUploads { .. } => "daily",
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Partition { country, .. }
            | Query::Uploaders { country, .. }
            | Query::DailyUploads { country, .. } => write!(
                f,
                "{} {}/{}/{}",
                self.kind(),
                self.campaign().id,
                self.year(),
                country
            ),
            _ => write!(f, "{} {}/{}", self.kind(), self.campaign().id, self.year()),
        }
    }
}

/// One result row, keyed by column name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    columns: HashMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column value
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.insert(column.into(), value.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.columns.insert(column.into(), value);
    }

    /// Get a required string column
    pub fn get_str(&self, column: &str) -> Result<String, EngineError> {
        self.get_str_opt(column)
            .ok_or_else(|| EngineError::UpstreamRow(format!("missing text column '{}'", column)))
    }

    /// Get an optional string column; NULL and absent are both `None`
    pub fn get_str_opt(&self, column: &str) -> Option<String> {
        match self.columns.get(column)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Get a required non-negative count column
    ///
    /// Numeric strings are accepted since some drivers return DECIMAL
    /// aggregates as text.
    pub fn get_u64(&self, column: &str) -> Result<u64, EngineError> {
        let value = self
            .columns
            .get(column)
            .ok_or_else(|| EngineError::UpstreamRow(format!("missing count column '{}'", column)))?;

        let parsed = match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            Value::Null => Some(0),
            _ => None,
        };

        parsed.ok_or_else(|| {
            EngineError::UpstreamRow(format!(
                "column '{}' is not a non-negative count: {}",
                column, value
            ))
        })
    }
}

/// Capability to run a query on one lane
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run `query` against the replica behind `lane`
    async fn execute(&self, query: &Query, lane: Lane) -> Result<Vec<Row>, EngineError>;
}
