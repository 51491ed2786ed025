//! Comparison of freshly aggregated records with the stored ones

use sdk::types::YearRecord;
use serde::Serialize;

/// Uploads dropping by more than this share is flagged
const DROP_WARNING_PCT: f64 = 20.0;

/// One changed total
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDiff {
    pub year: i32,
    pub field: &'static str,
    pub old: u64,
    pub new: u64,

    /// `None` when the old value was 0
    pub diff_pct: Option<f64>,
}

/// Differences between stored and new records, for years present in both
#[derive(Debug, Clone, Default, Serialize)]
pub struct Comparison {
    pub differences: Vec<FieldDiff>,
    pub warnings: Vec<String>,
}

impl Comparison {
    pub fn is_unchanged(&self) -> bool {
        self.differences.is_empty() && self.warnings.is_empty()
    }
}

fn diff_pct(old: u64, new: u64) -> Option<f64> {
    if old == 0 {
        return None;
    }
    let raw = (new as f64 - old as f64) / old as f64 * 100.0;
    Some((raw * 100.0).round() / 100.0)
}

/// Compare `new` against `existing`, year by year
pub fn compare_with_existing(existing: &[YearRecord], new: &[YearRecord]) -> Comparison {
    let mut comparison = Comparison::default();

    for record in new {
        let Some(old) = existing.iter().find(|r| r.year == record.year) else {
            continue;
        };

        let fields = [
            ("uploads", old.uploads, record.uploads),
            ("uploaders", old.uploaders, record.uploaders),
            ("images_used", old.images_used, record.images_used),
            ("new_uploaders", old.new_uploaders, record.new_uploaders),
        ];
        for (field, old_value, new_value) in fields {
            if old_value != new_value {
                comparison.differences.push(FieldDiff {
                    year: record.year,
                    field,
                    old: old_value,
                    new: new_value,
                    diff_pct: diff_pct(old_value, new_value),
                });
            }
        }

        if old.countries != record.countries {
            comparison.warnings.push(format!(
                "{} {}: country count changed from {} to {}",
                record.campaign, record.year, old.countries, record.countries
            ));
        }

        if let Some(change) = diff_pct(old.uploads, record.uploads) {
            if change < -DROP_WARNING_PCT {
                comparison.warnings.push(format!(
                    "{} {}: uploads dropped {:.2}% ({} -> {})",
                    record.campaign, record.year, -change, old.uploads, record.uploads
                ));
            }
        }
    }

    comparison
}
