//! Query planner
//!
//! A single aggregate spanning every year and country of a campaign
//! reliably exceeds the replica's statement ceiling. The planner instead
//! issues, per year, one cheap discovery query that lists the country
//! categories, then one exact-match aggregation per country ("partition").
//!
//! A partition that times out or fails is dropped and reported as a
//! warning. Partial results are valid output.

mod country;

pub use country::{extract_country, CountryFilter};

use crate::upstream::{Lane, Query, QueryExecutor, Row};
use futures::stream::{self, StreamExt};
use sdk::errors::EngineError;
use sdk::types::{Campaign, StatRow, GLOBAL_COUNTRY};
use serde::Serialize;
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One campaign-year-country aggregation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionQuery {
    pub campaign: String,
    pub year: i32,
    pub country: String,
    pub category: String,
}

impl PartitionQuery {
    fn to_query(&self, campaign: &Campaign) -> Query {
        Query::Partition {
            campaign: campaign.clone(),
            year: self.year,
            country: self.country.clone(),
            category: self.category.clone(),
        }
    }
}

/// Discovered partitions for a campaign and year range
#[derive(Debug, Clone)]
pub struct Plan {
    pub campaign: Campaign,

    /// Years whose discovery query succeeded
    pub years: Vec<i32>,

    pub partitions: Vec<PartitionQuery>,
    pub warnings: Vec<String>,
}

/// Rows gathered for a plan
#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub rows: Vec<StatRow>,
    pub warnings: Vec<String>,
    pub skipped: Vec<PartitionQuery>,
}

/// Splits campaign requests into partition queries and runs them
#[derive(Clone)]
pub struct Planner {
    executor: Arc<dyn QueryExecutor>,
    concurrency: usize,
    countries: CountryFilter,
}

impl Planner {
    /// `concurrency` caps partition queries in flight at once
    pub fn new(executor: Arc<dyn QueryExecutor>, concurrency: usize) -> Self {
        Self {
            executor,
            concurrency: concurrency.max(1),
            countries: CountryFilter::default(),
        }
    }

    /// Only plan partitions for countries `filter` accepts
    pub fn with_country_filter(mut self, filter: CountryFilter) -> Self {
        self.countries = filter;
        self
    }

    pub fn executor(&self) -> &Arc<dyn QueryExecutor> {
        &self.executor
    }

    /// Discover the partitions of `campaign` over `years`
    ///
    /// A discovery timeout skips that year with a warning. Any other
    /// upstream failure is returned, since it means the replica itself is
    /// unusable for this cycle.
    pub async fn decompose(
        &self,
        campaign: &Campaign,
        years: RangeInclusive<i32>,
        lane: Lane,
    ) -> Result<Plan, EngineError> {
        let mut plan = Plan {
            campaign: campaign.clone(),
            years: Vec::new(),
            partitions: Vec::new(),
            warnings: Vec::new(),
        };

        for year in years {
            let query = Query::Discovery {
                campaign: campaign.clone(),
                year,
            };
            let rows = match self.executor.execute(&query, lane).await {
                Ok(rows) => rows,
                Err(e) if e.is_timeout() => {
                    let message = format!("{} {}: discovery skipped ({})", campaign.id, year, e);
                    warn!("{}", message);
                    plan.warnings.push(message);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let partitions = partitions_from_discovery(campaign, year, &rows, &self.countries)?;
            debug!(
                "{} {}: discovered {} partitions",
                campaign.id,
                year,
                partitions.len()
            );
            plan.years.push(year);
            plan.partitions.extend(partitions);
        }

        Ok(plan)
    }

    /// Run every partition of `plan`
    ///
    /// Results keep plan order. With `include_totals`, one year-totals
    /// query per year is also attempted; its row becomes the `Global` row.
    pub async fn fetch(&self, plan: &Plan, lane: Lane, include_totals: bool) -> FetchReport {
        let campaign = &plan.campaign;

        // Owned futures keep the fetch future Send for tokio::spawn
        let pending: Vec<_> = plan
            .partitions
            .iter()
            .cloned()
            .map(|partition| {
                let planner = self.clone();
                let campaign = campaign.clone();
                async move {
                    let outcome = planner.run_partition(&campaign, &partition, lane).await;
                    (partition, outcome)
                }
            })
            .collect();
        let outcomes: Vec<(PartitionQuery, Result<Option<StatRow>, EngineError>)> =
            stream::iter(pending)
                .buffered(self.concurrency)
                .collect()
                .await;

        let mut report = FetchReport::default();
        for (partition, outcome) in outcomes {
            match outcome {
                Ok(Some(row)) => report.rows.push(row),
                Ok(None) => debug!(
                    "{} {} {}: empty partition",
                    partition.campaign, partition.year, partition.country
                ),
                Err(e) => {
                    let message = format!(
                        "{} {} {}: partition skipped ({})",
                        partition.campaign, partition.year, partition.country, e
                    );
                    warn!("{}", message);
                    report.warnings.push(message);
                    report.skipped.push(partition);
                }
            }
        }

        if include_totals {
            for &year in &plan.years {
                match self.run_year_totals(campaign, year).await {
                    Ok(Some(row)) => report.rows.push(row),
                    Ok(None) => {}
                    Err(e) => {
                        let message = format!(
                            "{} {}: year totals unavailable, deriving from countries ({})",
                            campaign.id, year, e
                        );
                        warn!("{}", message);
                        report.warnings.push(message);
                    }
                }
            }
        }

        info!(
            "{}: fetched {} rows, skipped {} partitions",
            campaign.id,
            report.rows.len(),
            report.skipped.len()
        );

        report
    }

    /// Aggregate one partition; `None` when it holds no uploads
    pub async fn run_partition(
        &self,
        campaign: &Campaign,
        partition: &PartitionQuery,
        lane: Lane,
    ) -> Result<Option<StatRow>, EngineError> {
        let rows = self
            .executor
            .execute(&partition.to_query(campaign), lane)
            .await?;
        stat_row(rows.first(), partition.year, &partition.country)
    }

    // Totals always go to the extended lane; they span every country.
    async fn run_year_totals(
        &self,
        campaign: &Campaign,
        year: i32,
    ) -> Result<Option<StatRow>, EngineError> {
        let query = Query::YearTotals {
            campaign: campaign.clone(),
            year,
        };
        let rows = self.executor.execute(&query, Lane::Extended).await?;
        stat_row(rows.first(), year, GLOBAL_COUNTRY)
    }
}

/// Find the exact category discovery reports for one country
///
/// Every prefix of the campaign is searched. Falls back to the
/// primary-prefix name when discovery does not list the country.
pub async fn find_category(
    executor: &dyn QueryExecutor,
    campaign: &Campaign,
    year: i32,
    country: &str,
    lane: Lane,
) -> Result<String, EngineError> {
    let query = Query::Discovery {
        campaign: campaign.clone(),
        year,
    };
    for row in executor.execute(&query, lane).await? {
        let category = row.get_str("category")?;
        if extract_country(&category, campaign, year).as_deref() == Some(country) {
            return Ok(category);
        }
    }
    Ok(campaign.category_for(year, country))
}

fn partitions_from_discovery(
    campaign: &Campaign,
    year: i32,
    rows: &[Row],
    filter: &CountryFilter,
) -> Result<Vec<PartitionQuery>, EngineError> {
    let mut seen = HashSet::new();
    let mut rejected = Vec::new();
    let mut partitions = Vec::new();
    for row in rows {
        let category = row.get_str("category")?;
        let Some(country) = extract_country(&category, campaign, year) else {
            continue;
        };
        if !filter.accepts(&country) && country != campaign.bare_category_country(year) {
            rejected.push(country);
            continue;
        }
        if !seen.insert(country.clone()) {
            continue;
        }
        partitions.push(PartitionQuery {
            campaign: campaign.id.clone(),
            year,
            country,
            category,
        });
    }
    if !rejected.is_empty() {
        debug!(
            "{} {}: skipped {} non-country categories: {:?}",
            campaign.id,
            year,
            rejected.len(),
            rejected
        );
    }
    Ok(partitions)
}

fn stat_row(row: Option<&Row>, year: i32, country: &str) -> Result<Option<StatRow>, EngineError> {
    let Some(row) = row else {
        return Ok(None);
    };
    let stat = StatRow::new(
        year,
        country,
        row.get_u64("uploads")?,
        row.get_u64("uploaders")?,
        row.get_u64("images_used")?,
        row.get_u64("new_uploaders")?,
    );
    Ok((stat.uploads > 0).then_some(stat))
}
