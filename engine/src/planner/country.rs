//! Country names from discovered category titles

use sdk::types::{Campaign, INTERNATIONAL_COUNTRY};
use std::collections::HashSet;

/// Longest plausible country name
const MAX_COUNTRY_LEN: usize = 50;

/// Extract the country from a category title
///
/// `Images_from_Wiki_Loves_Earth_2025_in_Germany` yields `Germany`; the
/// bare year category yields the campaign's country for that year, or
/// `International`. Sub-categories such as
/// `..._in_Germany_by_user` or `..._in_France_at_Paris` yield `None`.
pub fn extract_country(category: &str, campaign: &Campaign, year: i32) -> Option<String> {
    for prefix in campaign.prefixes() {
        if category == format!("{}_{}", prefix, year) {
            return Some(campaign.bare_category_country(year).to_string());
        }

        let marker = format!("{}_{}_in_", prefix, year);
        if let Some(raw) = category.strip_prefix(marker.as_str()) {
            let country = raw.replace('_', " ");
            return is_plausible_country(&country).then_some(country);
        }
    }
    None
}

/// Optional whitelist of country names, compared case-insensitively
///
/// An empty filter accepts every plausible name. `International` always
/// passes.
#[derive(Debug, Clone, Default)]
pub struct CountryFilter {
    allowed: HashSet<String>,
}

impl CountryFilter {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: names
                .into_iter()
                .map(|n| n.as_ref().trim().to_lowercase())
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn accepts(&self, country: &str) -> bool {
        self.allowed.is_empty()
            || country == INTERNATIONAL_COUNTRY
            || self.allowed.contains(&country.to_lowercase())
    }
}

fn is_plausible_country(country: &str) -> bool {
    if country.is_empty() || country.chars().count() > MAX_COUNTRY_LEN {
        return false;
    }
    if [" by ", " at ", " - "].iter().any(|s| country.contains(s)) {
        return false;
    }
    if country.contains("Wiki") || country.chars().any(|c| c.is_ascii_digit()) {
        return false;
    }
    country.starts_with("the ") || country.chars().next().is_some_and(char::is_uppercase)
}
