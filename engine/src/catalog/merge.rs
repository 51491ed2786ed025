use super::{Catalog, Competition, CountryIndexEntry, Participation};
use sdk::types::YearRecord;
use std::collections::BTreeMap;

/// Merge one campaign's new years into `catalog`
///
/// An existing campaign keeps every year not present in `incoming`; the
/// years present are replaced in place and new years are inserted at their
/// newest-first position, so untouched years never move. A new campaign is
/// inserted whole. Other campaigns are untouched. When `incoming` lists a
/// year twice, the last occurrence wins.
pub fn merge(mut catalog: Catalog, incoming: Competition) -> Catalog {
    let years = dedup_years(incoming.years);

    match catalog
        .competitions
        .iter_mut()
        .find(|c| c.path_segment == incoming.path_segment)
    {
        Some(existing) => {
            for record in years {
                match existing.years.iter_mut().find(|y| y.year == record.year) {
                    Some(slot) => *slot = record,
                    None => {
                        let at = existing
                            .years
                            .iter()
                            .position(|y| y.year < record.year)
                            .unwrap_or(existing.years.len());
                        existing.years.insert(at, record);
                    }
                }
            }
        }
        None => {
            let mut years = years;
            years.sort_by(|a, b| b.year.cmp(&a.year));
            catalog.competitions.push(Competition {
                years,
                ..incoming
            });
        }
    }

    catalog.countries = country_index(&catalog.competitions);
    catalog
}

/// Replace one campaign's years wholesale
///
/// Years of that campaign missing from `incoming` are dropped. Other
/// campaigns are untouched and keep their position in the document.
pub fn replace(mut catalog: Catalog, incoming: Competition) -> Catalog {
    let mut years = dedup_years(incoming.years);
    years.sort_by(|a, b| b.year.cmp(&a.year));
    let competition = Competition { years, ..incoming };

    match catalog
        .competitions
        .iter_mut()
        .find(|c| c.path_segment == competition.path_segment)
    {
        Some(existing) => *existing = competition,
        None => catalog.competitions.push(competition),
    }

    catalog.countries = country_index(&catalog.competitions);
    catalog
}

fn dedup_years(years: Vec<YearRecord>) -> Vec<YearRecord> {
    let mut out: Vec<YearRecord> = Vec::with_capacity(years.len());
    for record in years {
        match out.iter_mut().find(|y| y.year == record.year) {
            Some(slot) => *slot = record,
            None => out.push(record),
        }
    }
    out
}

fn country_index(competitions: &[Competition]) -> Vec<CountryIndexEntry> {
    let mut index: BTreeMap<&str, Vec<Participation>> = BTreeMap::new();

    for competition in competitions {
        for record in &competition.years {
            for stat in &record.country_stats {
                index.entry(stat.name.as_str()).or_default().push(Participation {
                    campaign: competition.path_segment.clone(),
                    year: record.year,
                    uploads: stat.uploads,
                    rank: stat.rank,
                });
            }
        }
    }

    index
        .into_iter()
        .map(|(country, participations)| CountryIndexEntry {
            country: country.to_string(),
            participations,
        })
        .collect()
}
