use super::{CacheKey, CacheKind};
use crate::planner::find_category;
use crate::upstream::{Lane, Query, QueryExecutor, Row};
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::{pct, Campaign, UploaderRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Produces the payload for a cache key
#[async_trait]
pub trait CacheBuilder: Send + Sync {
    async fn build(&self, key: &CacheKey) -> Result<Value, EngineError>;
}

/// Totals for one country of one campaign-year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryDetail {
    pub campaign: String,
    pub campaign_name: String,
    pub year: i32,
    pub country: String,
    pub category_name: String,
    pub total_uploads: u64,
    pub total_uploaders: u64,
    pub total_images_used: u64,
    pub total_new_uploaders: u64,
    pub images_used_pct: f64,
    pub new_uploaders_pct: f64,

    /// Uploads per day, oldest first
    #[serde(default)]
    pub daily_stats: Vec<DailyStat>,
}

/// One day of uploads in a country category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStat {
    /// `YYYY-MM-DD`
    pub date: String,
    pub uploads: u64,
    pub uploaders: u64,
    pub new_uploaders: u64,
    pub new_uploaders_pct: f64,
}

/// Daily rows of `year`, sorted by date
///
/// Days outside `year` are dropped; they come from files re-categorised
/// long after the campaign.
pub fn daily_stats(year: i32, rows: &[Row]) -> Result<Vec<DailyStat>, EngineError> {
    let prefix = year.to_string();
    let mut days = Vec::with_capacity(rows.len());
    for row in rows {
        let date = row.get_str("day")?;
        if !date.starts_with(&prefix) {
            continue;
        }
        let uploaders = row.get_u64("uploaders")?;
        let new_uploaders = row.get_u64("new_uploaders")?.min(uploaders);
        days.push(DailyStat {
            date,
            uploads: row.get_u64("uploads")?,
            uploaders,
            new_uploaders,
            new_uploaders_pct: pct(new_uploaders, uploaders),
        });
    }
    days.sort_by(|a, b| a.date.cmp(&b.date));
    Ok(days)
}

/// Per-uploader rows for one country of one campaign-year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploaderBreakdown {
    pub campaign: String,
    pub year: i32,
    pub country: String,
    pub total_uploads: u64,
    pub uploaders: Vec<UploaderRecord>,
}

/// Fold uploader rows into a breakdown
///
/// Rows for the same username are merged. An uploader is new when their
/// registration falls inside the campaign window for `year`.
pub fn uploader_breakdown(
    campaign: &Campaign,
    year: i32,
    country: &str,
    rows: &[Row],
) -> Result<UploaderBreakdown, EngineError> {
    let mut by_name: HashMap<String, UploaderRecord> = HashMap::new();

    for row in rows {
        let username = row.get_str("username")?;
        let uploads = row.get_u64("uploads")?;
        let images_used = row.get_u64("images_used")?;
        let registration = row.get_str_opt("registration");

        let record = by_name
            .entry(username.clone())
            .or_insert_with(|| UploaderRecord {
                username,
                upload_count: 0,
                images_used_count: 0,
                registration_timestamp: None,
                is_new: false,
                percentage: 0.0,
            });
        record.upload_count += uploads;
        record.images_used_count += images_used;
        if record.registration_timestamp.is_none() {
            record.registration_timestamp = registration;
        }
    }

    let total_uploads: u64 = by_name.values().map(|r| r.upload_count).sum();
    let mut uploaders: Vec<UploaderRecord> = by_name
        .into_values()
        .map(|mut r| {
            r.is_new = campaign.is_within_window(year, r.registration_timestamp.as_deref());
            r.percentage = pct(r.upload_count, total_uploads);
            r
        })
        .collect();
    uploaders.sort_by(|a, b| {
        b.upload_count
            .cmp(&a.upload_count)
            .then_with(|| a.username.cmp(&b.username))
    });

    Ok(UploaderBreakdown {
        campaign: campaign.id.clone(),
        year,
        country: country.to_string(),
        total_uploads,
        uploaders,
    })
}

/// Builds cache payloads by querying the replica
pub struct UpstreamCacheBuilder {
    executor: Arc<dyn QueryExecutor>,
    campaigns: HashMap<String, Campaign>,
    lane: Lane,
}

impl UpstreamCacheBuilder {
    pub fn new(executor: Arc<dyn QueryExecutor>, campaigns: &[Campaign], lane: Lane) -> Self {
        Self {
            executor,
            campaigns: campaigns
                .iter()
                .map(|c| (c.id.clone(), c.clone()))
                .collect(),
            lane,
        }
    }

    fn campaign(&self, id: &str) -> Result<&Campaign, EngineError> {
        self.campaigns
            .get(id)
            .ok_or_else(|| EngineError::CampaignNotFound(id.to_string()))
    }

    async fn category(&self, campaign: &Campaign, key: &CacheKey) -> Result<String, EngineError> {
        find_category(
            self.executor.as_ref(),
            campaign,
            key.year,
            &key.country,
            self.lane,
        )
        .await
    }

    async fn country_detail(&self, key: &CacheKey) -> Result<CountryDetail, EngineError> {
        let campaign = self.campaign(&key.campaign)?;
        let category = self.category(campaign, key).await?;
        let query = Query::Partition {
            campaign: campaign.clone(),
            year: key.year,
            country: key.country.clone(),
            category: category.clone(),
        };
        let rows = self.executor.execute(&query, self.lane).await?;

        let daily = Query::DailyUploads {
            campaign: campaign.clone(),
            year: key.year,
            country: key.country.clone(),
            category: category.clone(),
        };
        let daily_stats = daily_stats(key.year, &self.executor.execute(&daily, self.lane).await?)?;

        let (uploads, uploaders, images_used, new_uploaders) = match rows.first() {
            Some(row) => (
                row.get_u64("uploads")?,
                row.get_u64("uploaders")?,
                row.get_u64("images_used")?,
                row.get_u64("new_uploaders")?,
            ),
            None => (0, 0, 0, 0),
        };

        Ok(CountryDetail {
            campaign: campaign.id.clone(),
            campaign_name: campaign.name.clone(),
            year: key.year,
            country: key.country.clone(),
            category_name: category,
            total_uploads: uploads,
            total_uploaders: uploaders,
            total_images_used: images_used.min(uploads),
            total_new_uploaders: new_uploaders.min(uploaders),
            images_used_pct: pct(images_used.min(uploads), uploads),
            new_uploaders_pct: pct(new_uploaders.min(uploaders), uploaders),
            daily_stats,
        })
    }

    async fn uploaders(&self, key: &CacheKey) -> Result<UploaderBreakdown, EngineError> {
        let campaign = self.campaign(&key.campaign)?;
        let query = Query::Uploaders {
            campaign: campaign.clone(),
            year: key.year,
            country: key.country.clone(),
            category: self.category(campaign, key).await?,
        };
        let rows = self.executor.execute(&query, self.lane).await?;
        uploader_breakdown(campaign, key.year, &key.country, &rows)
    }
}

#[async_trait]
impl CacheBuilder for UpstreamCacheBuilder {
    async fn build(&self, key: &CacheKey) -> Result<Value, EngineError> {
        let payload = match key.kind {
            CacheKind::CountryDetail => serde_json::to_value(self.country_detail(key).await?)?,
            CacheKind::Uploaders => serde_json::to_value(self.uploaders(key).await?)?,
        };
        Ok(payload)
    }
}
