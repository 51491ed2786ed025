//! Refresh orchestration end to end against a scripted replica

mod common;

use chrono::{Duration as TtlDuration, TimeZone, Utc};
use common::{earth, monuments, MockExecutor, Scripted};
use lovestats_engine::aggregator::aggregate;
use lovestats_engine::cache::{CacheKey, CacheLayer, CacheRead, FileCacheStore, UpstreamCacheBuilder};
use lovestats_engine::catalog::{merge, Catalog, CatalogStore, Competition, JsonCatalogStore};
use lovestats_engine::clock::{Clock, ManualClock};
use lovestats_engine::db::{RunRepository, RunStatus};
use lovestats_engine::planner::Planner;
use lovestats_engine::refresh::{RefreshMode, RefreshOrchestrator, RefreshSettings};
use lovestats_engine::upstream::Lane;
use sdk::errors::EngineError;
use sdk::types::{Campaign, StatRow};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn settings(prebuild: bool) -> RefreshSettings {
    RefreshSettings {
        recent_years: 2,
        prebuild_years: 3,
        year_totals_on_full: false,
        prebuild,
    }
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 9, 15, 8, 0, 0).unwrap(),
    ))
}

fn orchestrator(
    mock: Arc<MockExecutor>,
    store: Arc<JsonCatalogStore>,
    campaigns: Vec<Campaign>,
    settings: RefreshSettings,
) -> RefreshOrchestrator {
    let clock: Arc<dyn Clock> = clock();
    RefreshOrchestrator::new(Planner::new(mock, 2), store, campaigns, settings, clock)
}

/// Catalog holding earth 2020 and an outdated earth 2024
async fn seed(store: &JsonCatalogStore) -> Catalog {
    let records = aggregate(
        "earth",
        &[
            StatRow::new(2020, "Germany", 500, 90, 200, 20),
            StatRow::new(2024, "Germany", 10, 2, 1, 1),
        ],
    );
    let catalog = merge(Catalog::default(), Competition::new(&earth(), records));
    store.save(&catalog).await.unwrap();
    catalog
}

#[tokio::test]
async fn test_incremental_refresh_keeps_older_years() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonCatalogStore::new(temp.path().join("catalog.json")));
    seed(&store).await;

    let mock = Arc::new(MockExecutor::new());
    mock.discovery(&earth(), 2024, &["Germany", "France"]);
    mock.partition(&earth(), 2024, "Germany", (100, 40, 60, 5));
    mock.partition(&earth(), 2024, "France", (80, 30, 50, 3));

    let orch = orchestrator(mock.clone(), store.clone(), vec![earth()], settings(false));
    let report = orch.run(RefreshMode::Incremental).await.unwrap();

    assert_eq!(report.years_stored, 1);
    assert!(report.years_failed.is_empty());
    assert_eq!(mock.call_count("discovery"), 2);
    assert!(mock.calls().iter().all(|(_, lane)| *lane == Lane::Bounded));

    let catalog = store.load().await.unwrap();
    let competition = catalog.find("earth").unwrap();
    let years: Vec<i32> = competition.years.iter().map(|y| y.year).collect();
    assert_eq!(years, vec![2024, 2020]);
    assert_eq!(competition.year(2024).unwrap().uploads, 180);
    assert_eq!(competition.year(2020).unwrap().uploads, 500);

    // The stored 2024 record had one country, the new one has two
    assert!(!report.warnings.is_empty());
}

#[tokio::test]
async fn test_full_refresh_uses_extended_lane_for_every_year() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonCatalogStore::new(temp.path().join("catalog.json")));

    let mock = Arc::new(MockExecutor::new());
    mock.discovery(&earth(), 2013, &["Ukraine"]);
    mock.partition(&earth(), 2013, "Ukraine", (900, 100, 300, 90));
    mock.discovery(&earth(), 2024, &["Germany"]);
    mock.partition(&earth(), 2024, "Germany", (100, 40, 60, 5));

    let orch = orchestrator(mock.clone(), store.clone(), vec![earth()], settings(false));
    let report = orch.run(RefreshMode::Full).await.unwrap();

    assert_eq!(report.mode, RefreshMode::Full);
    assert_eq!(report.years_stored, 2);
    assert_eq!(mock.call_count("discovery"), 12);
    assert_eq!(mock.call_count("year_totals"), 0);
    assert!(mock.calls().iter().all(|(_, lane)| *lane == Lane::Extended));

    let catalog = store.load().await.unwrap();
    assert_eq!(catalog.find("earth").unwrap().years.len(), 2);
    assert_eq!(catalog.countries.len(), 2);
}

#[tokio::test]
async fn test_full_refresh_replaces_stale_years() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonCatalogStore::new(temp.path().join("catalog.json")));
    let stale = aggregate("earth", &[StatRow::new(2014, "Germany", 300, 50, 80, 10)]);
    store
        .save(&merge(Catalog::default(), Competition::new(&earth(), stale)))
        .await
        .unwrap();

    let mock = Arc::new(MockExecutor::new());
    mock.discovery(&earth(), 2024, &["Germany"]);
    mock.partition(&earth(), 2024, "Germany", (100, 40, 60, 5));

    let orch = orchestrator(mock, store.clone(), vec![earth()], settings(false));
    let report = orch.run(RefreshMode::Full).await.unwrap();

    assert_eq!(report.years_stored, 1);
    assert_eq!(report.years_removed, vec!["earth 2014".to_string()]);

    let catalog = store.load().await.unwrap();
    let years: Vec<i32> = catalog
        .find("earth")
        .unwrap()
        .years
        .iter()
        .map(|y| y.year)
        .collect();
    assert_eq!(years, vec![2024]);
}

#[tokio::test]
async fn test_full_refresh_keeps_unavailable_year() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonCatalogStore::new(temp.path().join("catalog.json")));
    seed(&store).await;

    let mock = Arc::new(MockExecutor::new());
    mock.script("discovery earth/2020", Scripted::Timeout);
    mock.discovery(&earth(), 2024, &["Germany"]);
    mock.partition(&earth(), 2024, "Germany", (100, 40, 60, 5));

    let orch = orchestrator(mock, store.clone(), vec![earth()], settings(false));
    let report = orch.run(RefreshMode::Full).await.unwrap();

    assert_eq!(report.years_failed.len(), 1);
    assert!(report.years_removed.is_empty());

    let catalog = store.load().await.unwrap();
    let competition = catalog.find("earth").unwrap();
    let years: Vec<i32> = competition.years.iter().map(|y| y.year).collect();
    assert_eq!(years, vec![2024, 2020]);
    assert_eq!(competition.year(2020).unwrap().uploads, 500);
    assert_eq!(competition.year(2024).unwrap().uploads, 100);
}

#[tokio::test]
async fn test_failed_year_keeps_its_previous_record() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonCatalogStore::new(temp.path().join("catalog.json")));
    seed(&store).await;

    let mock = Arc::new(MockExecutor::new());
    mock.discovery(&earth(), 2023, &["Germany"]);
    mock.partition(&earth(), 2023, "Germany", (70, 20, 30, 4));
    mock.script("discovery earth/2024", Scripted::Timeout);

    let orch = orchestrator(mock, store.clone(), vec![earth()], settings(false));
    let report = orch.run(RefreshMode::Incremental).await.unwrap();

    assert_eq!(report.years_stored, 1);
    assert_eq!(report.years_failed.len(), 1);
    assert!(report.years_failed[0].starts_with("earth 2024"));

    let catalog = store.load().await.unwrap();
    let competition = catalog.find("earth").unwrap();
    assert_eq!(competition.year(2024).unwrap().uploads, 10);
    assert_eq!(competition.year(2023).unwrap().uploads, 70);
    assert_eq!(competition.year(2020).unwrap().uploads, 500);
}

#[tokio::test]
async fn test_one_campaign_failing_does_not_affect_another() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonCatalogStore::new(temp.path().join("catalog.json")));

    let mock = Arc::new(MockExecutor::new());
    mock.script("discovery earth/2024", Scripted::Timeout);
    mock.discovery(&monuments(), 2024, &["Poland"]);
    mock.partition(&monuments(), 2024, "Poland", (300, 60, 90, 10));

    let orch = orchestrator(
        mock,
        store.clone(),
        vec![earth(), monuments()],
        settings(false),
    );
    let report = orch.run(RefreshMode::Incremental).await.unwrap();

    assert_eq!(report.campaigns, 2);
    assert_eq!(report.years_stored, 1);

    let catalog = store.load().await.unwrap();
    assert!(catalog.find("earth").is_none());
    assert_eq!(catalog.find("monuments").unwrap().year(2024).unwrap().uploads, 300);
}

#[tokio::test]
async fn test_unreachable_replica_aborts_without_saving() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("catalog.json");
    let store = Arc::new(JsonCatalogStore::new(&path));
    seed(&store).await;
    let before = std::fs::read(&path).unwrap();

    let mock = Arc::new(MockExecutor::new());
    mock.discovery(&earth(), 2023, &["Germany"]);
    mock.partition(&earth(), 2023, "Germany", (70, 20, 30, 4));
    mock.script("discovery earth/2024", Scripted::Connection);

    let orch = orchestrator(mock, store, vec![earth()], settings(false));
    let err = orch.run(RefreshMode::Incremental).await.unwrap_err();

    assert!(matches!(err, EngineError::UpstreamConnection(_)));
    assert_eq!(std::fs::read(&path).unwrap(), before);

    let status = orch.status();
    assert!(!status.is_processing);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn test_second_trigger_is_rejected_while_running() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonCatalogStore::new(temp.path().join("catalog.json")));

    let mock = Arc::new(MockExecutor::new().with_delay(Duration::from_millis(100)));
    mock.discovery(&earth(), 2024, &["Germany"]);
    mock.partition(&earth(), 2024, "Germany", (100, 40, 60, 5));

    let orch = Arc::new(orchestrator(mock, store.clone(), vec![earth()], settings(false)));
    let accepted = orch.trigger(RefreshMode::Full).unwrap();
    assert_eq!(accepted.mode, RefreshMode::Full);
    assert!(orch.status().is_processing);

    let err = orch.trigger(RefreshMode::Incremental).unwrap_err();
    assert!(matches!(
        err,
        EngineError::ConcurrentRefreshRejected { ref running } if running == "full"
    ));
    assert!(orch.run(RefreshMode::Incremental).await.is_err());

    for _ in 0..200 {
        if !orch.status().is_processing {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let status = orch.status();
    assert!(!status.is_processing);
    let report = status.last_report.unwrap();
    assert_eq!(report.run_id, accepted.run_id);
    assert_eq!(report.years_stored, 1);

    // The slot is free again
    assert!(orch.trigger(RefreshMode::Incremental).is_ok());
}

#[tokio::test]
async fn test_refresh_prebuilds_recent_countries() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonCatalogStore::new(temp.path().join("catalog.json")));

    let mock = Arc::new(MockExecutor::new());
    mock.discovery(&earth(), 2024, &["Germany"]);
    mock.partition(&earth(), 2024, "Germany", (100, 40, 60, 5));
    mock.uploaders(&earth(), 2024, "Germany", &[("Anna", 100, 60)]);

    let clock = clock();
    let cache = CacheLayer::new(
        FileCacheStore::new(temp.path().join("cache")),
        Arc::new(UpstreamCacheBuilder::new(mock.clone(), &[earth()], Lane::Bounded)),
        clock.clone(),
        TtlDuration::hours(24),
        2,
    );
    let orch = RefreshOrchestrator::new(
        Planner::new(mock, 2),
        store,
        vec![earth()],
        settings(true),
        clock,
    )
    .with_cache(cache.clone());

    let report = orch.run(RefreshMode::Incremental).await.unwrap();
    let prebuild = report.prebuild.unwrap();
    assert_eq!(prebuild.keys, 2);
    assert_eq!(prebuild.built, 2);
    assert_eq!(prebuild.failed, 0);

    assert!(matches!(
        cache.get(&CacheKey::country_detail("earth", 2024, "Germany")),
        CacheRead::Fresh(_)
    ));
    assert!(matches!(
        cache.get(&CacheKey::uploaders("earth", 2024, "Germany")),
        CacheRead::Fresh(_)
    ));
}

#[tokio::test]
async fn test_runs_are_recorded_in_history() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonCatalogStore::new(temp.path().join("catalog.json")));
    let history = RunRepository::open(&temp.path().join("lovestats.db")).await.unwrap();

    let mock = Arc::new(MockExecutor::new());
    mock.discovery(&earth(), 2024, &["Germany"]);
    mock.partition(&earth(), 2024, "Germany", (100, 40, 60, 5));

    let orch = orchestrator(mock.clone(), store, vec![earth()], settings(false))
        .with_history(history.clone());

    let report = orch.run(RefreshMode::Incremental).await.unwrap();
    let run = history.get_run(&report.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.mode, "incremental");
    assert_eq!(run.counts.years_stored, 1);
    assert!(run.finished_at.is_some());

    mock.script("discovery earth/2024", Scripted::Connection);
    assert!(orch.run(RefreshMode::Incremental).await.is_err());

    let runs = history.recent_runs(10).await.unwrap();
    assert_eq!(runs.len(), 2);
    let failed = runs.iter().find(|r| r.status == RunStatus::Failed).unwrap();
    assert!(failed.error.as_deref().unwrap().contains("replica unreachable"));
}
