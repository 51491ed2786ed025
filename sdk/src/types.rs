//! Campaign statistics types shared across the engine

use serde::{Deserialize, Serialize};

/// Sentinel country carried by rows that hold campaign-year totals
pub const GLOBAL_COUNTRY: &str = "Global";

/// Country used for files categorised directly under the year category
pub const INTERNATIONAL_COUNTRY: &str = "International";

/// A photo campaign and its competition window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Campaign {
    /// Stable identifier, e.g. "earth"
    pub id: String,

    /// Display name, e.g. "Wiki Loves Earth"
    pub name: String,

    /// Commons category prefix, e.g. "Images_from_Wiki_Loves_Earth"
    pub category_prefix: String,

    /// Historical prefixes the campaign has also used
    #[serde(default)]
    pub alt_prefixes: Vec<String>,

    /// Years whose bare year category belongs to one country
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub no_in_country: Vec<YearCountry>,

    pub start_month: u32,
    pub end_month: u32,

    /// First year the campaign ran
    pub first_year: i32,
}

impl Campaign {
    /// Create a campaign with a single-month window
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        category_prefix: impl Into<String>,
        month: u32,
        first_year: i32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category_prefix: category_prefix.into(),
            alt_prefixes: Vec::new(),
            no_in_country: Vec::new(),
            start_month: month,
            end_month: month,
            first_year,
        }
    }

    /// Add an alternate category prefix
    pub fn with_alt_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.alt_prefixes.push(prefix.into());
        self
    }

    /// Attribute the bare `<prefix>_<year>` category to `country`
    pub fn with_no_in_country(mut self, year: i32, country: impl Into<String>) -> Self {
        self.no_in_country.push(YearCountry {
            year,
            country: country.into(),
        });
        self
    }

    /// Country owning the bare year category, `International` by default
    pub fn bare_category_country(&self, year: i32) -> &str {
        self.no_in_country
            .iter()
            .find(|n| n.year == year)
            .map_or(INTERNATIONAL_COUNTRY, |n| n.country.as_str())
    }

    /// Primary prefix followed by any alternates
    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.category_prefix.as_str())
            .chain(self.alt_prefixes.iter().map(String::as_str))
    }

    /// Category holding one country's files for a year, under the primary prefix
    ///
    /// `International`, and the country owning the bare year category, map
    /// to `<prefix>_<year>`. Countries discovered under an alternate prefix
    /// carry their discovered category instead.
    pub fn category_for(&self, year: i32, country: &str) -> String {
        if country == INTERNATIONAL_COUNTRY || country == self.bare_category_country(year) {
            format!("{}_{}", self.category_prefix, year)
        } else {
            format!(
                "{}_{}_in_{}",
                self.category_prefix,
                year,
                country.replace(' ', "_")
            )
        }
    }

    /// Competition window as MediaWiki timestamps `(start, end)`
    pub fn window(&self, year: i32) -> (String, String) {
        (
            format!("{}{:02}01000000", year, self.start_month),
            format!("{}{:02}31235959", year, self.end_month),
        )
    }

    /// Whether a registration timestamp falls inside the year's window
    ///
    /// Accepts `YYYYMMDDHHMMSS` as well as ISO-like forms; separators are
    /// ignored. Missing or short timestamps are never new.
    pub fn is_within_window(&self, year: i32, registration: Option<&str>) -> bool {
        let Some(raw) = registration else {
            return false;
        };
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() < 14 {
            return false;
        }
        let (start, end) = self.window(year);
        let ts = &digits[..14];
        ts >= start.as_str() && ts <= end.as_str()
    }
}

/// A year whose bare category is attributed to one country
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct YearCountry {
    pub year: i32,
    pub country: String,
}

/// One aggregated upstream row for a partition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatRow {
    pub year: i32,
    pub country: String,
    pub uploads: u64,
    pub uploaders: u64,
    pub images_used: u64,
    pub new_uploaders: u64,
}

impl StatRow {
    pub fn new(
        year: i32,
        country: impl Into<String>,
        uploads: u64,
        uploaders: u64,
        images_used: u64,
        new_uploaders: u64,
    ) -> Self {
        Self {
            year,
            country: country.into(),
            uploads,
            uploaders,
            images_used,
            new_uploaders,
        }
    }

    /// Whether this row carries year-level totals
    pub fn is_global(&self) -> bool {
        self.country == GLOBAL_COUNTRY
    }
}

/// Statistics for one campaign in one year
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct YearRecord {
    pub campaign: String,
    pub year: i32,
    pub uploads: u64,
    pub uploaders: u64,
    pub images_used: u64,
    pub new_uploaders: u64,

    /// Number of entries in `country_stats`
    pub countries: usize,

    pub images_used_pct: f64,
    pub new_uploaders_pct: f64,

    /// Ranked by uploads, rank 1 first
    pub country_stats: Vec<CountryStat>,
}

/// Statistics for one country within a YearRecord
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CountryStat {
    pub name: String,
    pub uploads: u64,
    pub uploaders: u64,
    pub images_used: u64,
    pub new_uploaders: u64,
    pub rank: u32,
    pub images_used_pct: f64,
    pub new_uploaders_pct: f64,

    /// Share of the year's uploads
    pub uploads_share_pct: f64,
}

/// A single uploader within one partition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploaderRecord {
    pub username: String,
    pub upload_count: u64,
    pub images_used_count: u64,
    pub registration_timestamp: Option<String>,
    pub is_new: bool,

    /// Share of the partition's uploads
    pub percentage: f64,
}

/// `round(part / total * 100, 2)`, or 0 when `total` is 0
pub fn pct(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let raw = part as f64 / total as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}
