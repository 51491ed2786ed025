//! YearRecord validation
//!
//! Warnings never stop a record from being stored. `fatal` is reserved for
//! structurally missing required fields and drops that campaign-year only.

use super::ValidationIssue;
use sdk::types::YearRecord;
use serde::Serialize;

/// Tolerance for country uploads summing above the year total
const SUM_TOLERANCE: f64 = 0.10;

/// Outcome of [`validate`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct Validation {
    pub warnings: Vec<ValidationIssue>,
    pub fatal: Option<String>,
}

impl Validation {
    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn is_clean(&self) -> bool {
        self.fatal.is_none() && self.warnings.is_empty()
    }
}

fn pct_in_range(value: f64) -> bool {
    (0.0..=100.0).contains(&value)
}

/// Check a record's invariants
pub fn validate(record: &YearRecord) -> Validation {
    let mut v = Validation::default();
    let campaign = record.campaign.as_str();
    let year = record.year;

    if campaign.trim().is_empty() {
        v.fatal = Some("missing campaign id".to_string());
        return v;
    }
    if year <= 0 {
        v.fatal = Some(format!("invalid year {}", year));
        return v;
    }
    if record.country_stats.iter().any(|s| s.name.trim().is_empty()) {
        v.fatal = Some("country without a name".to_string());
        return v;
    }

    let mut warn = |country: Option<&str>, message: String| {
        v.warnings
            .push(ValidationIssue::new(campaign, year, country, message));
    };

    if record.images_used > record.uploads {
        warn(
            None,
            format!(
                "images_used {} exceeds uploads {}",
                record.images_used, record.uploads
            ),
        );
    }
    if record.new_uploaders > record.uploaders {
        warn(
            None,
            format!(
                "new_uploaders {} exceeds uploaders {}",
                record.new_uploaders, record.uploaders
            ),
        );
    }
    if record.countries != record.country_stats.len() {
        warn(
            None,
            format!(
                "reports {} countries but lists {}",
                record.countries,
                record.country_stats.len()
            ),
        );
    }
    if !pct_in_range(record.images_used_pct) || !pct_in_range(record.new_uploaders_pct) {
        warn(None, "percentage outside 0..100".to_string());
    }

    let mut previous_uploads = u64::MAX;
    let mut country_sum: u64 = 0;
    for (i, stat) in record.country_stats.iter().enumerate() {
        let country = Some(stat.name.as_str());
        country_sum += stat.uploads;

        if stat.rank as usize != i + 1 {
            warn(
                country,
                format!("rank {} at position {}", stat.rank, i + 1),
            );
        }
        if stat.uploads > previous_uploads {
            warn(country, "not ordered by uploads".to_string());
        }
        previous_uploads = stat.uploads;

        if stat.images_used > stat.uploads {
            warn(
                country,
                format!(
                    "images_used {} exceeds uploads {}",
                    stat.images_used, stat.uploads
                ),
            );
        }
        if stat.new_uploaders > stat.uploaders {
            warn(
                country,
                format!(
                    "new_uploaders {} exceeds uploaders {}",
                    stat.new_uploaders, stat.uploaders
                ),
            );
        }
        if stat.uploaders > record.uploaders {
            warn(
                country,
                format!(
                    "uploaders {} exceeds the year total {}",
                    stat.uploaders, record.uploaders
                ),
            );
        }
        if !pct_in_range(stat.images_used_pct)
            || !pct_in_range(stat.new_uploaders_pct)
            || !pct_in_range(stat.uploads_share_pct)
        {
            warn(country, "percentage outside 0..100".to_string());
        }
    }

    if country_sum as f64 > record.uploads as f64 * (1.0 + SUM_TOLERANCE) {
        warn(
            None,
            format!(
                "country uploads sum to {} against a total of {}",
                country_sum, record.uploads
            ),
        );
    }

    v
}
