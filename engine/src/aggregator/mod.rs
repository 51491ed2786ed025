//! Aggregation of partition rows into YearRecords
//!
//! Rules:
//! - A `Global` row supplies the year totals directly.
//! - Without one, uploads, images_used and new_uploaders are summed across
//!   countries and uploaders is the max across countries. The same person
//!   may upload under several countries, so uploader counts never add up.
//! - Several rows for one country in the same year are folded with the
//!   same policy: counts of files add, counts of people take the max.
//! - Countries are ranked 1..N by uploads, descending; ties keep input order.
//! - `images_used` and `new_uploaders` are clamped to their parent count
//!   and each clamp is reported.

mod compare;
mod validate;

pub use compare::{compare_with_existing, Comparison, FieldDiff};
pub use validate::{validate, Validation};

use sdk::types::{pct, CountryStat, StatRow, YearRecord};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// A non-fatal problem found while building or checking a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub campaign: String,
    pub year: i32,
    pub country: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    pub(crate) fn new(
        campaign: &str,
        year: i32,
        country: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            campaign: campaign.to_string(),
            year,
            country: country.map(str::to_string),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.country {
            Some(country) => write!(
                f,
                "{} {} {}: {}",
                self.campaign, self.year, country, self.message
            ),
            None => write!(f, "{} {}: {}", self.campaign, self.year, self.message),
        }
    }
}

/// Records plus the issues raised while building them
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    /// Ordered by year, newest first
    pub records: Vec<YearRecord>,
    pub warnings: Vec<ValidationIssue>,
}

/// Totals across every year of a campaign
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CampaignTotals {
    pub total_uploads: u64,
    pub total_images_used: u64,
    pub total_new_uploaders: u64,

    /// Largest single-year uploader count
    pub peak_uploaders: u64,

    pub unique_countries: usize,
    pub first_year: Option<i32>,
    pub last_year: Option<i32>,
    pub year_count: usize,
}

#[derive(Default)]
struct YearBucket {
    global: Option<StatRow>,
    countries: Vec<StatRow>,
    index: HashMap<String, usize>,
}

fn fold(into: &mut StatRow, row: &StatRow) {
    into.uploads += row.uploads;
    into.images_used += row.images_used;
    into.uploaders = into.uploaders.max(row.uploaders);
    into.new_uploaders = into.new_uploaders.max(row.new_uploaders);
}

/// Aggregate rows into one YearRecord per year
pub fn aggregate(campaign: &str, rows: &[StatRow]) -> Vec<YearRecord> {
    aggregate_with_report(campaign, rows).records
}

/// Aggregate rows and keep the clamp warnings
pub fn aggregate_with_report(campaign: &str, rows: &[StatRow]) -> Aggregation {
    let mut years: BTreeMap<i32, YearBucket> = BTreeMap::new();

    for row in rows {
        let bucket = years.entry(row.year).or_default();
        if row.is_global() {
            match bucket.global.as_mut() {
                Some(global) => fold(global, row),
                None => bucket.global = Some(row.clone()),
            }
            continue;
        }
        match bucket.index.get(&row.country) {
            Some(&i) => fold(&mut bucket.countries[i], row),
            None => {
                bucket
                    .index
                    .insert(row.country.clone(), bucket.countries.len());
                bucket.countries.push(row.clone());
            }
        }
    }

    let mut aggregation = Aggregation::default();
    for (year, bucket) in years.into_iter().rev() {
        let record = build_year(campaign, year, bucket, &mut aggregation.warnings);
        aggregation.records.push(record);
    }
    aggregation
}

fn build_year(
    campaign: &str,
    year: i32,
    bucket: YearBucket,
    warnings: &mut Vec<ValidationIssue>,
) -> YearRecord {
    let mut countries = bucket.countries;
    for row in countries.iter_mut() {
        let country = row.country.clone();
        clamp(campaign, year, Some(&country), row, warnings);
    }

    // Stable sort keeps input order among equal upload counts.
    countries.sort_by(|a, b| b.uploads.cmp(&a.uploads));

    let mut totals = match bucket.global {
        Some(global) => global,
        None => {
            let mut derived = StatRow::new(year, sdk::GLOBAL_COUNTRY, 0, 0, 0, 0);
            for row in &countries {
                derived.uploads += row.uploads;
                derived.images_used += row.images_used;
                derived.new_uploaders += row.new_uploaders;
                derived.uploaders = derived.uploaders.max(row.uploaders);
            }
            derived
        }
    };
    clamp(campaign, year, None, &mut totals, warnings);

    let country_stats: Vec<CountryStat> = countries
        .into_iter()
        .enumerate()
        .map(|(i, row)| CountryStat {
            rank: i as u32 + 1,
            images_used_pct: pct(row.images_used, row.uploads),
            new_uploaders_pct: pct(row.new_uploaders, row.uploaders),
            uploads_share_pct: pct(row.uploads, totals.uploads),
            name: row.country,
            uploads: row.uploads,
            uploaders: row.uploaders,
            images_used: row.images_used,
            new_uploaders: row.new_uploaders,
        })
        .collect();

    YearRecord {
        campaign: campaign.to_string(),
        year,
        uploads: totals.uploads,
        uploaders: totals.uploaders,
        images_used: totals.images_used,
        new_uploaders: totals.new_uploaders,
        countries: country_stats.len(),
        images_used_pct: pct(totals.images_used, totals.uploads),
        new_uploaders_pct: pct(totals.new_uploaders, totals.uploaders),
        country_stats,
    }
}

fn clamp(
    campaign: &str,
    year: i32,
    country: Option<&str>,
    row: &mut StatRow,
    warnings: &mut Vec<ValidationIssue>,
) {
    if row.images_used > row.uploads {
        warnings.push(ValidationIssue::new(
            campaign,
            year,
            country,
            format!(
                "images_used {} exceeds uploads {}, clamped",
                row.images_used, row.uploads
            ),
        ));
        row.images_used = row.uploads;
    }
    if row.new_uploaders > row.uploaders {
        warnings.push(ValidationIssue::new(
            campaign,
            year,
            country,
            format!(
                "new_uploaders {} exceeds uploaders {}, clamped",
                row.new_uploaders, row.uploaders
            ),
        ));
        row.new_uploaders = row.uploaders;
    }
}

/// Expected years that have no record or no countries
pub fn missing_years(records: &[YearRecord], expected: impl IntoIterator<Item = i32>) -> Vec<i32> {
    expected
        .into_iter()
        .filter(|year| {
            !records
                .iter()
                .any(|r| r.year == *year && !r.country_stats.is_empty())
        })
        .collect()
}

/// Totals across all years of one campaign
pub fn campaign_totals(records: &[YearRecord]) -> CampaignTotals {
    let mut countries = BTreeSet::new();
    let mut totals = CampaignTotals {
        year_count: records.len(),
        ..Default::default()
    };

    for record in records {
        totals.total_uploads += record.uploads;
        totals.total_images_used += record.images_used;
        totals.total_new_uploaders += record.new_uploaders;
        totals.peak_uploaders = totals.peak_uploaders.max(record.uploaders);
        totals.first_year = Some(totals.first_year.map_or(record.year, |y| y.min(record.year)));
        totals.last_year = Some(totals.last_year.map_or(record.year, |y| y.max(record.year)));
        for stat in &record.country_stats {
            countries.insert(stat.name.as_str());
        }
    }

    totals.unique_countries = countries.len();
    totals
}
