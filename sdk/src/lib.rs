//! Lovestats SDK
//!
//! Shared error and domain types for the lovestats engine.

/// Error types and handling
pub mod errors;

/// Campaign, record, and row types
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, ErrorExt};
pub use types::{
    pct, Campaign, CountryStat, StatRow, UploaderRecord, YearCountry, YearRecord, GLOBAL_COUNTRY,
    INTERNATIONAL_COUNTRY,
};
