//! Cache layer behaviour: deduplicated rebuilds, TTL and failure recovery

mod common;

use async_trait::async_trait;
use chrono::{Duration as TtlDuration, TimeZone, Utc};
use common::{earth, science, MockExecutor, Scripted};
use lovestats_engine::cache::{
    CacheBuilder, CacheKey, CacheLayer, CacheRead, CountryDetail, FileCacheStore,
    UploaderBreakdown, UpstreamCacheBuilder,
};
use lovestats_engine::clock::{ManualClock, SystemClock};
use lovestats_engine::upstream::{Lane, Row};
use sdk::errors::EngineError;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct CountingBuilder {
    builds: AtomicUsize,
    fail_next: AtomicBool,
    delay: Duration,
}

impl CountingBuilder {
    fn new(delay: Duration) -> Self {
        Self {
            builds: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
            delay,
        }
    }

    fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheBuilder for CountingBuilder {
    async fn build(&self, key: &CacheKey) -> Result<Value, EngineError> {
        let n = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(EngineError::UpstreamTimeout {
                lane: "bounded".to_string(),
                budget_secs: 300,
            });
        }
        Ok(json!({ "country": key.country, "build": n }))
    }
}

fn key() -> CacheKey {
    CacheKey::country_detail("earth", 2024, "Germany")
}

#[tokio::test]
async fn test_two_cold_gets_trigger_one_build() {
    let temp = TempDir::new().unwrap();
    let builder = Arc::new(CountingBuilder::new(Duration::from_millis(50)));
    let layer = CacheLayer::new(
        FileCacheStore::new(temp.path()),
        builder.clone(),
        Arc::new(SystemClock),
        TtlDuration::hours(24),
        4,
    );

    assert_eq!(layer.get(&key()), CacheRead::Pending);
    assert_eq!(layer.get(&key()), CacheRead::Pending);
    assert_eq!(layer.in_flight_count(), 1);

    layer.completion(&key()).unwrap().wait().await.unwrap();
    assert_eq!(builder.builds(), 1);
    assert!(!layer.is_building(&key()));
}

#[tokio::test]
async fn test_fresh_get_never_builds() {
    let temp = TempDir::new().unwrap();
    let builder = Arc::new(CountingBuilder::new(Duration::from_millis(1)));
    let layer = CacheLayer::new(
        FileCacheStore::new(temp.path()),
        builder.clone(),
        Arc::new(SystemClock),
        TtlDuration::hours(24),
        2,
    );

    layer.refresh(&key()).wait().await.unwrap();
    for _ in 0..10 {
        assert!(matches!(layer.get(&key()), CacheRead::Fresh(_)));
    }

    assert_eq!(builder.builds(), 1);
    assert!(!layer.is_building(&key()));
    assert_eq!(layer.stats().fresh_hits, 10);
}

#[tokio::test]
async fn test_expired_entry_is_served_while_one_rebuild_runs() {
    let temp = TempDir::new().unwrap();
    let t = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(t));
    let builder = Arc::new(CountingBuilder::new(Duration::from_millis(50)));
    let layer = CacheLayer::new(
        FileCacheStore::new(temp.path()),
        builder.clone(),
        clock.clone(),
        TtlDuration::hours(24),
        4,
    );

    layer.refresh(&key()).wait().await.unwrap();

    clock.set(t + TtlDuration::hours(23));
    match layer.get(&key()) {
        CacheRead::Fresh(entry) => assert_eq!(entry.payload["build"], 1),
        other => panic!("expected fresh, got {:?}", other),
    }
    assert!(!layer.is_building(&key()));

    clock.set(t + TtlDuration::hours(25));
    for _ in 0..3 {
        match layer.get(&key()) {
            CacheRead::Stale(entry) => {
                assert_eq!(entry.payload["build"], 1);
                assert_eq!(entry.created_at, t);
            }
            other => panic!("expected stale, got {:?}", other),
        }
    }
    assert_eq!(layer.in_flight_count(), 1);

    layer.completion(&key()).unwrap().wait().await.unwrap();
    assert_eq!(builder.builds(), 2);
    match layer.get(&key()) {
        CacheRead::Fresh(entry) => assert_eq!(entry.payload["build"], 2),
        other => panic!("expected fresh, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_build_clears_marker_and_allows_retry() {
    let temp = TempDir::new().unwrap();
    let builder = Arc::new(CountingBuilder::new(Duration::from_millis(1)));
    builder.fail_next.store(true, Ordering::SeqCst);
    let layer = CacheLayer::new(
        FileCacheStore::new(temp.path()),
        builder.clone(),
        Arc::new(SystemClock),
        TtlDuration::hours(24),
        1,
    );

    let outcome = layer.refresh(&key()).wait().await;
    assert!(outcome.is_err());
    assert!(!layer.is_building(&key()));
    assert_eq!(layer.stats().builds_failed, 1);

    assert_eq!(layer.get(&key()), CacheRead::Pending);
    layer.completion(&key()).unwrap().wait().await.unwrap();
    assert!(matches!(layer.get(&key()), CacheRead::Fresh(_)));
    assert_eq!(builder.builds(), 2);
}

#[tokio::test]
async fn test_entries_survive_restart_with_their_timestamp() {
    let temp = TempDir::new().unwrap();
    let t = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(t));

    {
        let layer = CacheLayer::new(
            FileCacheStore::new(temp.path()),
            Arc::new(CountingBuilder::new(Duration::from_millis(1))),
            clock.clone(),
            TtlDuration::hours(24),
            1,
        );
        layer.refresh(&key()).wait().await.unwrap();
    }

    clock.set(t + TtlDuration::hours(2));
    let builder = Arc::new(CountingBuilder::new(Duration::from_millis(1)));
    let layer = CacheLayer::new(
        FileCacheStore::new(temp.path()),
        builder.clone(),
        clock,
        TtlDuration::hours(24),
        1,
    );

    match layer.get(&key()) {
        CacheRead::Fresh(entry) => assert_eq!(entry.created_at, t),
        other => panic!("expected fresh, got {:?}", other),
    }
    assert_eq!(builder.builds(), 0);
}

#[tokio::test]
async fn test_upstream_builder_payloads() {
    let temp = TempDir::new().unwrap();
    let mock = Arc::new(MockExecutor::new());
    mock.partition(&earth(), 2024, "Germany", (100, 40, 60, 5));
    mock.uploaders(&earth(), 2024, "Germany", &[("Anna", 70, 50), ("Ben", 30, 10)]);

    let builder = UpstreamCacheBuilder::new(mock.clone(), &[earth()], Lane::Bounded);
    let layer = CacheLayer::new(
        FileCacheStore::new(temp.path()),
        Arc::new(builder),
        Arc::new(SystemClock),
        TtlDuration::hours(24),
        2,
    );

    let detail_key = key();
    let uploaders_key = CacheKey::uploaders("earth", 2024, "Germany");
    layer.refresh(&detail_key).wait().await.unwrap();
    layer.refresh(&uploaders_key).wait().await.unwrap();

    let detail: CountryDetail =
        serde_json::from_value(layer.get(&detail_key).entry().unwrap().payload.clone()).unwrap();
    assert_eq!(detail.total_uploads, 100);
    assert_eq!(detail.images_used_pct, 60.0);
    assert_eq!(detail.category_name, "Images_from_Wiki_Loves_Earth_2024_in_Germany");

    let breakdown: UploaderBreakdown =
        serde_json::from_value(layer.get(&uploaders_key).entry().unwrap().payload.clone())
            .unwrap();
    assert_eq!(breakdown.total_uploads, 100);
    assert_eq!(breakdown.uploaders[0].username, "Anna");
    assert_eq!(breakdown.uploaders[0].percentage, 70.0);
    assert!(!breakdown.uploaders[1].is_new);

    assert!(mock.calls().iter().all(|(_, lane)| *lane == Lane::Bounded));
}

#[tokio::test]
async fn test_detail_reads_discovered_category_and_daily_series() {
    let temp = TempDir::new().unwrap();
    let category = "Images_from_European_Science_Photo_Competition_2015_in_Spain";
    let mock = Arc::new(MockExecutor::new());
    mock.script(
        "discovery science/2015",
        Scripted::Rows(vec![Row::new().with("category", category).with("files", 12)]),
    );
    mock.partition_category(category, (40, 12, 9, 6));
    mock.daily(
        category,
        &[
            ("2015-11-03", 25, 8, 2),
            ("2015-11-01", 15, 4, 4),
            ("2019-02-10", 1, 1, 0),
        ],
    );

    let builder = UpstreamCacheBuilder::new(mock, &[science()], Lane::Bounded);
    let layer = CacheLayer::new(
        FileCacheStore::new(temp.path()),
        Arc::new(builder),
        Arc::new(SystemClock),
        TtlDuration::hours(24),
        2,
    );

    let key = CacheKey::country_detail("science", 2015, "Spain");
    layer.refresh(&key).wait().await.unwrap();

    let detail: CountryDetail =
        serde_json::from_value(layer.get(&key).entry().unwrap().payload.clone()).unwrap();
    assert_eq!(detail.total_uploads, 40);
    assert_eq!(detail.category_name, category);

    let dates: Vec<&str> = detail.daily_stats.iter().map(|d| d.date.as_str()).collect();
    assert_eq!(dates, vec!["2015-11-01", "2015-11-03"]);
    assert_eq!(detail.daily_stats[1].new_uploaders_pct, 25.0);
}

#[tokio::test]
async fn test_unknown_campaign_build_fails() {
    let temp = TempDir::new().unwrap();
    let builder = UpstreamCacheBuilder::new(Arc::new(MockExecutor::new()), &[earth()], Lane::Bounded);
    let layer = CacheLayer::new(
        FileCacheStore::new(temp.path()),
        Arc::new(builder),
        Arc::new(SystemClock),
        TtlDuration::hours(24),
        1,
    );

    let outcome = layer
        .refresh(&CacheKey::country_detail("mars", 2024, "Germany"))
        .wait()
        .await;
    assert!(outcome.unwrap_err().contains("mars"));
}
