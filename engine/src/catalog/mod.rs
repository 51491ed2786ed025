//! Persisted catalog of campaign statistics
//!
//! The document holds one [`Competition`] per campaign and a derived
//! per-country index. Incremental updates go through [`merge`], which
//! replaces data at YearRecord granularity and never drops years it was not
//! given. A full refresh uses [`replace`] to swap a campaign's years as a
//! whole.

mod merge;
mod store;
mod summary;

pub use merge::{merge, replace};
pub use store::{upsert, CatalogStore, JsonCatalogStore};
pub use summary::{competition, competition_summaries, CompetitionSummary};

use sdk::types::{Campaign, YearRecord};
use serde::{Deserialize, Serialize};

/// The persisted catalog document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub competitions: Vec<Competition>,

    /// Rebuilt from `competitions` after every merge
    #[serde(default)]
    pub countries: Vec<CountryIndexEntry>,
}

impl Catalog {
    /// Look a competition up by campaign id or slug
    pub fn find(&self, id_or_slug: &str) -> Option<&Competition> {
        self.competitions
            .iter()
            .find(|c| c.path_segment == id_or_slug || c.slug == id_or_slug)
    }

    pub fn year(&self, campaign: &str, year: i32) -> Option<&YearRecord> {
        self.find(campaign)?.year(year)
    }

    pub fn is_empty(&self) -> bool {
        self.competitions.is_empty()
    }
}

/// All stored years of one campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competition {
    pub slug: String,
    pub name: String,

    /// Campaign id; the merge key
    pub path_segment: String,

    /// Newest first
    #[serde(default)]
    pub years: Vec<YearRecord>,
}

impl Competition {
    pub fn new(campaign: &Campaign, years: Vec<YearRecord>) -> Self {
        Self {
            slug: slugify(&campaign.name),
            name: campaign.name.clone(),
            path_segment: campaign.id.clone(),
            years,
        }
    }

    pub fn year(&self, year: i32) -> Option<&YearRecord> {
        self.years.iter().find(|y| y.year == year)
    }

    /// The `n` most recent years with at least one country
    pub fn recent_years(&self, n: usize) -> impl Iterator<Item = &YearRecord> {
        self.years
            .iter()
            .filter(|y| !y.country_stats.is_empty())
            .take(n)
    }
}

/// One country and every campaign-year it took part in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryIndexEntry {
    pub country: String,
    pub participations: Vec<Participation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participation {
    pub campaign: String,
    pub year: i32,
    pub uploads: u64,
    pub rank: u32,
}

fn slugify(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
