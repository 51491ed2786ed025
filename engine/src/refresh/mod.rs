//! Refresh orchestration
//!
//! A run walks every configured campaign, and for each year in scope goes
//! through planner, aggregator and validation before merging the resulting
//! YearRecords into the catalog. Failures are contained at the
//! campaign-year level. Only an unreachable replica (a connection error at
//! discovery) or a catalog that cannot be read or written ends the run, and
//! in that case nothing from the run is saved.
//!
//! | mode        | lane     | years                                 | catalog update      |
//! |-------------|----------|---------------------------------------|---------------------|
//! | full        | extended | every year from the campaign's first  | replace per campaign |
//! | incremental | bounded  | the most recent `recent_years` years  | merge per year      |
//!
//! A full refresh drops stored years that no longer have data upstream.
//! Years it failed to produce keep their stored record.

mod job;

pub use job::{JobGuard, JobSlot, RefreshStatus};

use crate::aggregator::{aggregate_with_report, compare_with_existing, validate};
use crate::cache::{BuildHandle, CacheKey, CacheLayer};
use crate::catalog::{merge, replace, Catalog, CatalogStore, Competition};
use crate::clock::Clock;
use crate::config::RefreshConfig;
use crate::db::{RunCounts, RunRepository};
use crate::planner::Planner;
use crate::upstream::Lane;
use chrono::Datelike;
use futures::future::join_all;
use sdk::errors::EngineError;
use sdk::types::{Campaign, YearRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Which refresh to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMode {
    Full,
    Incremental,
}

impl RefreshMode {
    pub fn as_str(&self) -> &str {
        match self {
            RefreshMode::Full => "full",
            RefreshMode::Incremental => "incremental",
        }
    }

    pub fn lane(&self) -> Lane {
        match self {
            RefreshMode::Full => Lane::Extended,
            RefreshMode::Incremental => Lane::Bounded,
        }
    }
}

impl fmt::Display for RefreshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Knobs taken from `[refresh]`
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub recent_years: u32,
    pub prebuild_years: u32,
    pub year_totals_on_full: bool,

    /// Run the prebuild pass after a successful refresh
    pub prebuild: bool,
}

impl From<&RefreshConfig> for RefreshSettings {
    fn from(config: &RefreshConfig) -> Self {
        Self {
            recent_years: config.recent_years,
            prebuild_years: config.prebuild_years,
            year_totals_on_full: config.year_totals_on_full,
            prebuild: true,
        }
    }
}

/// Outcome of a prebuild pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrebuildReport {
    pub keys: usize,
    pub built: usize,
    pub failed: usize,
}

/// Outcome of one refresh run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub mode: RefreshMode,
    pub run_id: String,
    pub campaigns: usize,
    pub years_stored: usize,

    /// `"<campaign> <year>: <reason>"` per campaign-year that was dropped
    pub years_failed: Vec<String>,

    /// `"<campaign> <year>"` per stored year a full refresh found empty and removed
    #[serde(default)]
    pub years_removed: Vec<String>,
    pub partitions_skipped: usize,
    pub warnings: Vec<String>,
    pub prebuild: Option<PrebuildReport>,
}

impl RefreshReport {
    pub fn new(mode: RefreshMode, run_id: impl Into<String>) -> Self {
        Self {
            mode,
            run_id: run_id.into(),
            campaigns: 0,
            years_stored: 0,
            years_failed: Vec::new(),
            years_removed: Vec::new(),
            partitions_skipped: 0,
            warnings: Vec::new(),
            prebuild: None,
        }
    }

    fn counts(&self) -> RunCounts {
        RunCounts {
            campaigns: self.campaigns as i64,
            years_stored: self.years_stored as i64,
            years_failed: self.years_failed.len() as i64,
            partitions_skipped: self.partitions_skipped as i64,
            warnings: self.warnings.len() as i64,
        }
    }
}

/// What one campaign-year produced
enum YearOutcome {
    Stored(YearRecord),

    /// Discovered fine but holds no uploads
    Empty,

    /// Could not be read this cycle; any stored record is kept
    Unavailable(String),
}

/// Returned by [`RefreshOrchestrator::trigger`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerAccepted {
    pub run_id: String,
    pub mode: RefreshMode,
}

/// Drives full and incremental refreshes
pub struct RefreshOrchestrator {
    planner: Planner,
    catalog: Arc<dyn CatalogStore>,
    cache: Option<CacheLayer>,
    campaigns: Vec<Campaign>,
    settings: RefreshSettings,
    clock: Arc<dyn Clock>,
    jobs: JobSlot,
    history: Option<RunRepository>,
}

impl RefreshOrchestrator {
    pub fn new(
        planner: Planner,
        catalog: Arc<dyn CatalogStore>,
        campaigns: Vec<Campaign>,
        settings: RefreshSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            planner,
            catalog,
            cache: None,
            campaigns,
            settings,
            jobs: JobSlot::new(clock.clone()),
            clock,
            history: None,
        }
    }

    /// Warm this cache after each run and on [`prebuild`](Self::prebuild)
    pub fn with_cache(mut self, cache: CacheLayer) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Record runs in the local history table
    pub fn with_history(mut self, history: RunRepository) -> Self {
        self.history = Some(history);
        self
    }

    pub fn status(&self) -> RefreshStatus {
        self.jobs.snapshot()
    }

    pub fn campaigns(&self) -> &[Campaign] {
        &self.campaigns
    }

    /// Run a refresh and wait for it
    ///
    /// Fails with [`EngineError::ConcurrentRefreshRejected`] if a run is
    /// already in progress.
    pub async fn run(&self, mode: RefreshMode) -> Result<RefreshReport, EngineError> {
        let guard = self.jobs.try_acquire(mode)?;
        self.execute(guard).await
    }

    /// Start a refresh in the background and return at once
    pub fn trigger(self: &Arc<Self>, mode: RefreshMode) -> Result<TriggerAccepted, EngineError> {
        let guard = self.jobs.try_acquire(mode)?;
        let accepted = TriggerAccepted {
            run_id: guard.run_id().to_string(),
            mode,
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            // Failures are already logged and recorded by execute
            let _ = this.execute(guard).await;
        });

        info!("Accepted {} refresh {}", mode, accepted.run_id);
        Ok(accepted)
    }

    /// Rebuild cache entries for the recent years stored in the catalog
    pub async fn prebuild(&self) -> Result<PrebuildReport, EngineError> {
        let catalog = self.catalog.load().await?;
        Ok(self.prebuild_catalog(&catalog).await)
    }

    async fn execute(&self, guard: JobGuard) -> Result<RefreshReport, EngineError> {
        let span = info_span!("refresh", mode = %guard.mode(), run_id = %guard.run_id());

        async move {
            self.record_start(&guard).await;

            match self.refresh_all(&guard).await {
                Ok(report) => {
                    info!(
                        "Refresh finished: {} years stored, {} failed, {} partitions skipped, {} warnings",
                        report.years_stored,
                        report.years_failed.len(),
                        report.partitions_skipped,
                        report.warnings.len()
                    );
                    self.record_finish(&report).await;
                    guard.finish(report.clone());
                    Ok(report)
                }
                Err(e) => {
                    error!("Refresh aborted: {}", e);
                    self.record_failure(guard.run_id(), &e).await;
                    guard.fail(&e);
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn refresh_all(&self, guard: &JobGuard) -> Result<RefreshReport, EngineError> {
        let mode = guard.mode();
        let mut report = RefreshReport::new(mode, guard.run_id());
        let current_year = self.clock.now().year();

        info!(
            "Starting {} refresh of {} campaigns on the {} lane",
            mode,
            self.campaigns.len(),
            mode.lane()
        );

        guard.set_task("loading catalog");
        let mut catalog = self.catalog.load().await?;

        for campaign in &self.campaigns {
            let years = self.years_for(campaign, mode, current_year);
            if years.is_empty() {
                debug!("{}: no years in scope", campaign.id);
                continue;
            }
            report.campaigns += 1;

            let mut records = Vec::new();
            let mut unavailable = Vec::new();
            let mut empty = Vec::new();
            for year in years {
                guard.set_task(format!("{} {}", campaign.id, year));
                match self.refresh_year(campaign, year, mode, &mut report).await {
                    Ok(YearOutcome::Stored(record)) => records.push(record),
                    Ok(YearOutcome::Empty) => empty.push(year),
                    Ok(YearOutcome::Unavailable(reason)) => {
                        warn!("{} {}: year unavailable ({})", campaign.id, year, reason);
                        report
                            .years_failed
                            .push(format!("{} {}: {}", campaign.id, year, reason));
                        unavailable.push(year);
                    }
                    Err(e @ EngineError::UpstreamConnection(_)) => return Err(e),
                    Err(e) => {
                        warn!("{} {}: year dropped ({})", campaign.id, year, e);
                        report
                            .years_failed
                            .push(format!("{} {}: {}", campaign.id, year, e));
                        unavailable.push(year);
                    }
                }
            }

            let existing = catalog.find(&campaign.id).cloned();
            if let Some(existing) = &existing {
                let comparison = compare_with_existing(&existing.years, &records);
                for warning in comparison.warnings {
                    warn!("{}", warning);
                    report.warnings.push(warning);
                }
                debug!(
                    "{}: {} totals changed",
                    campaign.id,
                    comparison.differences.len()
                );
            }
            report.years_stored += records.len();

            catalog = match mode {
                RefreshMode::Incremental => {
                    if records.is_empty() {
                        continue;
                    }
                    merge(catalog, Competition::new(campaign, records))
                }
                RefreshMode::Full => {
                    let kept = existing
                        .iter()
                        .flat_map(|c| c.years.iter())
                        .filter(|y| unavailable.contains(&y.year))
                        .cloned();
                    let removed = existing
                        .iter()
                        .flat_map(|c| c.years.iter())
                        .filter(|y| !unavailable.contains(&y.year))
                        .filter(|y| !records.iter().any(|r| r.year == y.year))
                        .map(|y| y.year);
                    for year in removed {
                        info!("{} {}: no longer upstream, removing", campaign.id, year);
                        report.years_removed.push(format!("{} {}", campaign.id, year));
                    }
                    debug!("{}: {} years without data", campaign.id, empty.len());

                    let years: Vec<YearRecord> = kept.chain(records).collect();
                    if years.is_empty() && existing.is_none() {
                        continue;
                    }
                    replace(catalog, Competition::new(campaign, years))
                }
            };
        }

        guard.set_task("saving catalog");
        self.catalog.save(&catalog).await?;

        if self.settings.prebuild && self.cache.is_some() {
            guard.set_task("prebuilding cache");
            report.prebuild = Some(self.prebuild_catalog(&catalog).await);
        }

        Ok(report)
    }

    /// Years a run of `mode` covers for `campaign`
    fn years_for(&self, campaign: &Campaign, mode: RefreshMode, current_year: i32) -> RangeInclusive<i32> {
        let start = match mode {
            RefreshMode::Full => campaign.first_year,
            RefreshMode::Incremental => {
                let window = self.settings.recent_years.max(1) as i32;
                campaign.first_year.max(current_year - window + 1)
            }
        };
        start..=current_year
    }

    /// Produce the YearRecord for one campaign-year
    async fn refresh_year(
        &self,
        campaign: &Campaign,
        year: i32,
        mode: RefreshMode,
        report: &mut RefreshReport,
    ) -> Result<YearOutcome, EngineError> {
        let lane = mode.lane();

        let plan = self.planner.decompose(campaign, year..=year, lane).await?;
        report.warnings.extend(plan.warnings.iter().cloned());
        if plan.years.is_empty() {
            return Ok(YearOutcome::Unavailable("discovery skipped".to_string()));
        }

        let include_totals = mode == RefreshMode::Full && self.settings.year_totals_on_full;
        let fetched = self.planner.fetch(&plan, lane, include_totals).await;
        report.partitions_skipped += fetched.skipped.len();
        report.warnings.extend(fetched.warnings);

        if fetched.rows.is_empty() && !fetched.skipped.is_empty() {
            return Ok(YearOutcome::Unavailable(format!(
                "all {} partitions skipped",
                fetched.skipped.len()
            )));
        }

        let aggregation = aggregate_with_report(&campaign.id, &fetched.rows);
        for issue in aggregation.warnings {
            warn!("{}", issue);
            report.warnings.push(issue.to_string());
        }

        let Some(record) = aggregation.records.into_iter().next() else {
            debug!("{} {}: no data", campaign.id, year);
            return Ok(YearOutcome::Empty);
        };

        let validation = validate(&record);
        for issue in validation.warnings {
            warn!("{}", issue);
            report.warnings.push(issue.to_string());
        }
        if let Some(reason) = validation.fatal {
            error!("{} {}: {}", campaign.id, year, reason);
            return Err(EngineError::AggregationValidation {
                campaign: campaign.id.clone(),
                year,
                reason,
            });
        }

        Ok(YearOutcome::Stored(record))
    }

    async fn prebuild_catalog(&self, catalog: &Catalog) -> PrebuildReport {
        let Some(cache) = &self.cache else {
            return PrebuildReport::default();
        };

        let mut handles: Vec<BuildHandle> = Vec::new();
        for competition in &catalog.competitions {
            if !self.campaigns.iter().any(|c| c.id == competition.path_segment) {
                continue;
            }
            for record in competition.recent_years(self.settings.prebuild_years as usize) {
                for stat in &record.country_stats {
                    let detail = CacheKey::country_detail(&competition.path_segment, record.year, &stat.name);
                    let uploaders = CacheKey::uploaders(&competition.path_segment, record.year, &stat.name);
                    handles.push(cache.refresh(&detail));
                    handles.push(cache.refresh(&uploaders));
                }
            }
        }

        let keys = handles.len();
        info!("Prebuilding {} cache entries", keys);

        let outcomes = join_all(handles.into_iter().map(BuildHandle::wait)).await;
        let failed = outcomes.iter().filter(|o| o.is_err()).count();
        if failed > 0 {
            warn!("Prebuild: {} of {} cache entries failed", failed, keys);
        }

        PrebuildReport {
            keys,
            built: keys - failed,
            failed,
        }
    }

    async fn record_start(&self, guard: &JobGuard) {
        if let Some(history) = &self.history {
            if let Err(e) = history.start_run(guard.run_id(), guard.mode().as_str()).await {
                warn!("Failed to record run start: {:#}", e);
            }
        }
    }

    async fn record_finish(&self, report: &RefreshReport) {
        if let Some(history) = &self.history {
            if let Err(e) = history.finish_run(&report.run_id, &report.counts()).await {
                warn!("Failed to record run completion: {:#}", e);
            }
        }
    }

    async fn record_failure(&self, run_id: &str, err: &EngineError) {
        if let Some(history) = &self.history {
            if let Err(e) = history.fail_run(run_id, &err.to_string()).await {
                warn!("Failed to record run failure: {:#}", e);
            }
        }
    }
}
