//! Read model over the catalog for the listing and detail views

use super::{Catalog, Competition};
use serde::Serialize;

/// Years shown in the trend sparkline
const TREND_YEARS: usize = 6;

/// One row of the competitions listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompetitionSummary {
    pub slug: String,
    pub name: String,
    pub path_segment: String,
    pub latest_year: Option<i32>,
    pub latest_uploads: u64,

    /// Change against the previous stored year; 0 when there is none
    pub uploads_delta_pct: f64,
    pub countries: usize,
    pub lifetime_uploads: u64,
    pub year_count: usize,

    /// Uploads of the most recent years, oldest first
    pub trend: Vec<u64>,
    pub has_data: bool,
}

fn delta_pct(current: u64, previous: Option<u64>) -> f64 {
    match previous {
        Some(prev) if prev > 0 => {
            let raw = (current as f64 - prev as f64) / prev as f64 * 100.0;
            (raw * 100.0).round() / 100.0
        }
        _ => 0.0,
    }
}

fn summarize(competition: &Competition) -> CompetitionSummary {
    let mut years: Vec<_> = competition.years.iter().collect();
    years.sort_by(|a, b| b.year.cmp(&a.year));

    let latest = years.first();
    let previous = years.get(1).map(|y| y.uploads);
    let mut trend: Vec<u64> = years.iter().take(TREND_YEARS).map(|y| y.uploads).collect();
    trend.reverse();

    CompetitionSummary {
        slug: competition.slug.clone(),
        name: competition.name.clone(),
        path_segment: competition.path_segment.clone(),
        latest_year: latest.map(|y| y.year),
        latest_uploads: latest.map(|y| y.uploads).unwrap_or(0),
        uploads_delta_pct: latest
            .map(|y| delta_pct(y.uploads, previous))
            .unwrap_or(0.0),
        countries: latest.map(|y| y.countries).unwrap_or(0),
        lifetime_uploads: years.iter().map(|y| y.uploads).sum(),
        year_count: years.len(),
        trend,
        has_data: latest.is_some(),
    }
}

/// Summaries of every competition in catalog order
pub fn competition_summaries(catalog: &Catalog) -> Vec<CompetitionSummary> {
    catalog.competitions.iter().map(summarize).collect()
}

/// Full detail of one competition by campaign id or slug
pub fn competition<'a>(catalog: &'a Catalog, id_or_slug: &str) -> Option<&'a Competition> {
    catalog.find(id_or_slug)
}
