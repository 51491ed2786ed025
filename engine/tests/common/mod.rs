//! Shared fixtures for integration tests
//!
//! `MockExecutor` answers queries from a script and records every call.
//! Country-level queries are keyed by kind and the exact category they
//! read (`"partition Images_from_Wiki_Loves_Earth_2024_in_Germany"`), the
//! rest by display form (`"discovery earth/2024"`). Unscripted queries
//! return no rows.

#![allow(dead_code)]

use async_trait::async_trait;
use lovestats_engine::upstream::{Lane, Query, QueryExecutor, Row};
use sdk::errors::EngineError;
use sdk::types::Campaign;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Scripted {
    Rows(Vec<Row>),
    Timeout,
    Connection,
}

#[derive(Default)]
pub struct MockExecutor {
    script: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<Vec<(String, Lane)>>,
    delay: Option<Duration>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before answering any query
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn script(&self, key: impl Into<String>, response: Scripted) {
        self.script.lock().unwrap().insert(key.into(), response);
    }

    /// Script a discovery answer listing `countries`
    pub fn discovery(&self, campaign: &Campaign, year: i32, countries: &[&str]) {
        let rows = countries
            .iter()
            .map(|country| {
                Row::new()
                    .with("category", campaign.category_for(year, country))
                    .with("files", json!(10))
            })
            .collect();
        self.script(
            format!("discovery {}/{}", campaign.id, year),
            Scripted::Rows(rows),
        );
    }

    /// Script key of a country-level query reading `category`
    pub fn category_key(kind: &str, category: &str) -> String {
        format!("{} {}", kind, category)
    }

    /// Script key of a country-level query under the primary prefix
    pub fn country_key(kind: &str, campaign: &Campaign, year: i32, country: &str) -> String {
        Self::category_key(kind, &campaign.category_for(year, country))
    }

    /// Script a partition answer of `(uploads, uploaders, images_used, new_uploaders)`
    pub fn partition(&self, campaign: &Campaign, year: i32, country: &str, counts: (u64, u64, u64, u64)) {
        self.partition_category(&campaign.category_for(year, country), counts);
    }

    /// Script a partition answer for an exact category title
    pub fn partition_category(&self, category: &str, counts: (u64, u64, u64, u64)) {
        let (uploads, uploaders, images_used, new_uploaders) = counts;
        self.script(
            Self::category_key("partition", category),
            Scripted::Rows(vec![Row::new()
                .with("uploads", json!(uploads))
                .with("uploaders", json!(uploaders))
                .with("images_used", json!(images_used))
                .with("new_uploaders", json!(new_uploaders))]),
        );
    }

    /// Script an uploader breakdown of `(username, uploads, images_used)`
    pub fn uploaders(&self, campaign: &Campaign, year: i32, country: &str, users: &[(&str, u64, u64)]) {
        let rows = users
            .iter()
            .map(|(name, uploads, used)| {
                Row::new()
                    .with("username", *name)
                    .with("uploads", json!(uploads))
                    .with("images_used", json!(used))
                    .with("registration", json!(null))
            })
            .collect();
        self.script(
            Self::country_key("uploaders", campaign, year, country),
            Scripted::Rows(rows),
        );
    }

    /// Script a daily series of `(day, uploads, uploaders, new_uploaders)`
    pub fn daily(&self, category: &str, days: &[(&str, u64, u64, u64)]) {
        let rows = days
            .iter()
            .map(|(day, uploads, uploaders, new_uploaders)| {
                Row::new()
                    .with("day", *day)
                    .with("uploads", json!(uploads))
                    .with("uploaders", json!(uploaders))
                    .with("new_uploaders", json!(new_uploaders))
            })
            .collect();
        self.script(Self::category_key("daily", category), Scripted::Rows(rows));
    }

    pub fn calls(&self) -> Vec<(String, Lane)> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls whose key starts with `prefix`
    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl QueryExecutor for MockExecutor {
    async fn execute(&self, query: &Query, lane: Lane) -> Result<Vec<Row>, EngineError> {
        let key = match query.category() {
            Some(category) => Self::category_key(query.kind(), category),
            None => query.to_string(),
        };
        self.calls.lock().unwrap().push((key.clone(), lane));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().unwrap().get(&key).cloned();
        match scripted {
            Some(Scripted::Rows(rows)) => Ok(rows),
            Some(Scripted::Timeout) => Err(EngineError::UpstreamTimeout {
                lane: lane.to_string(),
                budget_secs: 300,
            }),
            Some(Scripted::Connection) => Err(EngineError::UpstreamConnection(
                "replica unreachable".to_string(),
            )),
            None => Ok(Vec::new()),
        }
    }
}

pub fn earth() -> Campaign {
    Campaign::new("earth", "Wiki Loves Earth", "Images_from_Wiki_Loves_Earth", 5, 2013)
}

pub fn monuments() -> Campaign {
    Campaign::new(
        "monuments",
        "Wiki Loves Monuments",
        "Images_from_Wiki_Loves_Monuments",
        9,
        2010,
    )
}

pub fn science() -> Campaign {
    Campaign::new(
        "science",
        "Wiki Science Competition",
        "Images_from_Wiki_Science_Competition",
        11,
        2011,
    )
    .with_alt_prefix("Images_from_European_Science_Photo_Competition")
}
