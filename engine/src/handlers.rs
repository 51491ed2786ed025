//! Command handlers for CLI operations
//!
//! Each handler wires the components it needs from [`Config`] and prints
//! its result as text or JSON.

use anyhow::{Context, Result};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::api::{self, AppState};
use crate::cache::{CacheLayer, FileCacheStore, UpstreamCacheBuilder};
use crate::catalog::{competition_summaries, CatalogStore, JsonCatalogStore};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, Credentials};
use crate::db::RunRepository;
use crate::planner::{CountryFilter, Planner};
use crate::refresh::{RefreshMode, RefreshOrchestrator, RefreshReport, RefreshSettings};
use crate::upstream::{Lane, QueryExecutor, ReplicaExecutor};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// The components a refresh or the server runs on
pub struct Services {
    pub catalog: Arc<dyn CatalogStore>,
    pub cache: CacheLayer,
    pub orchestrator: Arc<RefreshOrchestrator>,
}

impl Services {
    /// Assemble catalog, cache and orchestrator around `executor`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(
        config: &Config,
        executor: Arc<dyn QueryExecutor>,
        clock: Arc<dyn Clock>,
        history: Option<RunRepository>,
        prebuild: bool,
    ) -> Self {
        let catalog: Arc<dyn CatalogStore> = Arc::new(JsonCatalogStore::new(config.catalog_path()));

        let builder = UpstreamCacheBuilder::new(executor.clone(), &config.campaigns, Lane::Bounded);
        let cache = CacheLayer::new(
            FileCacheStore::new(config.cache_dir()),
            Arc::new(builder),
            clock.clone(),
            chrono::Duration::seconds(config.cache.ttl_secs as i64),
            config.cache.workers,
        );

        let mut settings = RefreshSettings::from(&config.refresh);
        settings.prebuild = prebuild;

        let planner = Planner::new(executor, config.refresh.partition_concurrency)
            .with_country_filter(CountryFilter::new(&config.refresh.country_whitelist));
        let mut orchestrator = RefreshOrchestrator::new(
            planner,
            catalog.clone(),
            config.campaigns.clone(),
            settings,
            clock,
        )
        .with_cache(cache.clone());
        if let Some(history) = history {
            orchestrator = orchestrator.with_history(history);
        }

        Self {
            catalog,
            cache,
            orchestrator: Arc::new(orchestrator),
        }
    }
}

/// Connect (lazily) to the replica using the configured credentials
pub fn connect_replica(config: &Config) -> Result<Arc<ReplicaExecutor>> {
    let credentials = Credentials::resolve(&config.upstream.credentials_file)
        .context("Failed to load replica credentials")?;
    Ok(Arc::new(ReplicaExecutor::connect_lazy(&config.upstream, &credentials)))
}

async fn open_history(config: &Config) -> Result<RunRepository> {
    RunRepository::open(&config.db_path())
        .await
        .context("Failed to open run history")
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Serve the read API until Ctrl-C
pub async fn handle_serve(config: &Config, bind: Option<String>) -> Result<()> {
    let replica = connect_replica(config)?;
    let history = open_history(config).await?;
    let services = Services::build(
        config,
        replica.clone(),
        Arc::new(SystemClock),
        Some(history.clone()),
        true,
    );

    let state = AppState {
        catalog: services.catalog.clone(),
        cache: services.cache.clone(),
        orchestrator: services.orchestrator.clone(),
        runs: Some(history.clone()),
        retry_after_secs: config.server.retry_after_secs,
        started_at: Instant::now(),
    };

    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("Serving on http://{}", addr);
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
            tracing::info!("Shutdown requested");
        })
        .await
        .context("Server error")?;

    replica.close().await;
    history.close().await?;
    Ok(())
}

fn print_report(report: &RefreshReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("✓ {} refresh {} completed", report.mode, report.run_id);
            println!("  Campaigns:          {}", report.campaigns);
            println!("  Years stored:       {}", report.years_stored);
            println!("  Years failed:       {}", report.years_failed.len());
            println!("  Years removed:      {}", report.years_removed.len());
            println!("  Partitions skipped: {}", report.partitions_skipped);
            println!("  Warnings:           {}", report.warnings.len());
            for failure in &report.years_failed {
                println!("    ✗ {}", failure);
            }
            if let Some(prebuild) = &report.prebuild {
                println!(
                    "  Prebuild:           {}/{} entries built",
                    prebuild.built, prebuild.keys
                );
            }
        }
        OutputFormat::Json => print_json(&serde_json::to_value(report)?)?,
    }
    Ok(())
}

/// Run one refresh in the foreground
pub async fn handle_refresh(
    config: &Config,
    mode: RefreshMode,
    no_prebuild: bool,
    format: OutputFormat,
) -> Result<()> {
    let replica = connect_replica(config)?;
    let history = open_history(config).await?;
    let services = Services::build(
        config,
        replica.clone(),
        Arc::new(SystemClock),
        Some(history.clone()),
        !no_prebuild,
    );

    let result = services.orchestrator.run(mode).await;

    replica.close().await;
    history.close().await?;

    let report = result.with_context(|| format!("{} refresh failed", mode))?;
    print_report(&report, format)
}

/// Warm the cache from the current catalog
pub async fn handle_prebuild(config: &Config, format: OutputFormat) -> Result<()> {
    let replica = connect_replica(config)?;
    let services = Services::build(config, replica.clone(), Arc::new(SystemClock), None, true);

    let report = services
        .orchestrator
        .prebuild()
        .await
        .context("Prebuild failed")?;
    replica.close().await;

    match format {
        OutputFormat::Text => {
            println!(
                "✓ Prebuilt {} of {} cache entries ({} failed)",
                report.built, report.keys, report.failed
            );
        }
        OutputFormat::Json => print_json(&serde_json::to_value(&report)?)?,
    }
    Ok(())
}

/// Show recent refresh runs
pub async fn handle_status(config: &Config, limit: i64, format: OutputFormat) -> Result<()> {
    let history = open_history(config).await?;
    let runs = history.recent_runs(limit).await?;
    history.close().await?;

    match format {
        OutputFormat::Text => {
            if runs.is_empty() {
                println!("No refresh runs recorded yet.");
                return Ok(());
            }
            println!("Recent refresh runs:");
            println!();
            for run in &runs {
                let started = chrono::DateTime::from_timestamp(run.started_at, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| run.started_at.to_string());
                println!(
                    "  {} {:<11} {:<9} {}  stored {} failed {} skipped {}",
                    started,
                    run.mode,
                    run.status.as_str(),
                    run.id,
                    run.counts.years_stored,
                    run.counts.years_failed,
                    run.counts.partitions_skipped
                );
                if let Some(error) = &run.error {
                    println!("      error: {}", error);
                }
            }
        }
        OutputFormat::Json => print_json(&serde_json::to_value(&runs)?)?,
    }
    Ok(())
}

/// Print stored data for one campaign
pub async fn handle_show(
    config: &Config,
    campaign: &str,
    year: Option<i32>,
    format: OutputFormat,
) -> Result<()> {
    let campaign = config
        .campaign(campaign)
        .with_context(|| format!("Unknown campaign '{}'", campaign))?;
    let catalog = JsonCatalogStore::new(config.catalog_path())
        .load()
        .await
        .context("Failed to load catalog")?;

    let Some(competition) = catalog.find(&campaign.id) else {
        match format {
            OutputFormat::Text => println!("No data stored for {} yet.", campaign.name),
            OutputFormat::Json => print_json(&json!(null))?,
        }
        return Ok(());
    };

    if let Some(year) = year {
        let record = competition
            .year(year)
            .with_context(|| format!("No data for {} {}", campaign.id, year))?;
        match format {
            OutputFormat::Text => {
                println!("{} {}", campaign.name, year);
                println!(
                    "  Uploads {}  Uploaders {}  Images used {} ({}%)  New uploaders {} ({}%)",
                    record.uploads,
                    record.uploaders,
                    record.images_used,
                    record.images_used_pct,
                    record.new_uploaders,
                    record.new_uploaders_pct
                );
                println!();
                for stat in &record.country_stats {
                    println!(
                        "  {:>3}. {:<32} {:>8} uploads {:>6} uploaders",
                        stat.rank, stat.name, stat.uploads, stat.uploaders
                    );
                }
            }
            OutputFormat::Json => print_json(&serde_json::to_value(record)?)?,
        }
        return Ok(());
    }

    match format {
        OutputFormat::Text => {
            let summary = competition_summaries(&catalog)
                .into_iter()
                .find(|s| s.path_segment == campaign.id);
            println!("{}", campaign.name);
            if let Some(s) = summary {
                println!(
                    "  Lifetime uploads {} over {} years, latest change {}%",
                    s.lifetime_uploads, s.year_count, s.uploads_delta_pct
                );
            }
            println!();
            for record in &competition.years {
                println!(
                    "  {}  {:>8} uploads {:>6} uploaders {:>4} countries",
                    record.year, record.uploads, record.uploaders, record.countries
                );
            }
        }
        OutputFormat::Json => print_json(&serde_json::to_value(competition)?)?,
    }
    Ok(())
}

/// Report configuration and test both upstream lanes
pub async fn handle_check(config: &Config, format: OutputFormat) -> Result<()> {
    let replica = connect_replica(config)?;
    let lanes = replica.check_lanes().await;
    replica.close().await;

    let healthy = lanes.iter().all(|(_, r)| r.is_ok());

    match format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("  Data dir:   {}", config.core.data_dir.display());
            println!("  Campaigns:  {}", config.campaigns.len());
            println!("  Cache TTL:  {}s", config.cache.ttl_secs);
            println!();
            println!("Upstream lanes");
            for (lane, result) in &lanes {
                match result {
                    Ok(elapsed) => println!("  ✓ {:<9} {}ms", lane, elapsed.as_millis()),
                    Err(e) => println!("  ✗ {:<9} {}", lane, e),
                }
            }
        }
        OutputFormat::Json => {
            let lanes: Vec<_> = lanes
                .iter()
                .map(|(lane, result)| match result {
                    Ok(elapsed) => json!({ "lane": lane, "ok": true, "elapsed_ms": elapsed.as_millis() as u64 }),
                    Err(e) => json!({ "lane": lane, "ok": false, "error": e.to_string() }),
                })
                .collect();
            print_json(&json!({
                "data_dir": config.core.data_dir,
                "campaigns": config.campaigns.len(),
                "lanes": lanes,
            }))?;
        }
    }

    if !healthy {
        anyhow::bail!("One or more upstream lanes are unreachable");
    }
    Ok(())
}
