//! Per-key TTL cache with deduplicated background rebuild
//!
//! Reads never wait on the replica. A fresh entry is returned as is; an
//! expired one is still returned (stale) while a single rebuild runs in
//! the background; a missing one yields [`CacheRead::Pending`] and the
//! caller retries later.
//!
//! Lifecycle of a key:
//!
//! ```text
//! Empty -> Building -> Populated -> (age > ttl) Stale, served -> Building -> Populated
//! ```
//!
//! Entries carry their own `created_at`; file modification times are never
//! used as the freshness clock.

mod builder;
mod layer;
mod store;

pub use builder::{
    daily_stats, uploader_breakdown, CacheBuilder, CountryDetail, DailyStat, UploaderBreakdown,
    UpstreamCacheBuilder,
};
pub use layer::{BuildHandle, BuildOutcome, CacheLayer, CacheStats};
pub use store::FileCacheStore;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Longest file stem derived from a country name
const MAX_SAFE_LEN: usize = 120;

/// What a cache entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    CountryDetail,
    Uploaders,
}

impl CacheKind {
    pub fn as_str(&self) -> &str {
        match self {
            CacheKind::CountryDetail => "country_detail",
            CacheKind::Uploaders => "uploaders",
        }
    }
}

/// Identity of one cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub kind: CacheKind,
    pub campaign: String,
    pub year: i32,
    pub country: String,
}

impl CacheKey {
    pub fn new(
        kind: CacheKind,
        campaign: impl Into<String>,
        year: i32,
        country: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            campaign: campaign.into(),
            year,
            country: country.into(),
        }
    }

    pub fn country_detail(campaign: impl Into<String>, year: i32, country: impl Into<String>) -> Self {
        Self::new(CacheKind::CountryDetail, campaign, year, country)
    }

    pub fn uploaders(campaign: impl Into<String>, year: i32, country: impl Into<String>) -> Self {
        Self::new(CacheKind::Uploaders, campaign, year, country)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.kind.as_str(),
            self.campaign,
            self.year,
            self.country
        )
    }
}

/// Replace anything outside word characters and `-` with `_`
pub fn safe_component(raw: &str) -> String {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    let re = UNSAFE.get_or_init(|| Regex::new(r"[^\w\-]").expect("Invalid cache key pattern"));
    re.replace_all(raw, "_").chars().take(MAX_SAFE_LEN).collect()
}

/// A stored payload and the time it was built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl CacheEntry {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    /// Fresh while `age <= ttl`
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.age(now) <= ttl
    }
}

/// Result of [`CacheLayer::get`]
#[derive(Debug, Clone, PartialEq)]
pub enum CacheRead {
    /// Within the TTL
    Fresh(CacheEntry),

    /// Past the TTL; a rebuild is scheduled or running
    Stale(CacheEntry),

    /// Nothing stored yet; a build is scheduled or running
    Pending,
}

impl CacheRead {
    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            CacheRead::Fresh(e) | CacheRead::Stale(e) => Some(e),
            CacheRead::Pending => None,
        }
    }

    pub fn status(&self) -> &str {
        match self {
            CacheRead::Fresh(_) => "ready",
            CacheRead::Stale(_) => "stale",
            CacheRead::Pending => "pending",
        }
    }
}
