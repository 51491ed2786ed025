//! Configuration management
//!
//! This module handles loading, validation, and management of the lovestats
//! configuration. Configuration is stored in TOML format at
//! ~/.lovestats/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Data directory and log level
//! - **upstream**: Replica database, credentials and the two query lanes
//! - **cache**: TTL and rebuild worker count
//! - **refresh**: Incremental window, prebuild window, partition concurrency
//! - **server**: Bind address for the read API
//! - **campaigns**: The campaign table
//!
//! # Examples
//!
//! ```no_run
//! use lovestats_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("Catalog: {:?}", config.catalog_path());
//! println!("Campaigns: {}", config.campaigns.len());
//! # Ok(())
//! # }
//! ```

mod credentials;

pub use credentials::Credentials;

use sdk::errors::EngineError;
use sdk::types::Campaign;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    pub core: CoreConfig,

    /// Upstream replica settings
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Refresh job settings
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Read API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Campaigns to collect
    #[serde(default = "default_campaigns")]
    pub campaigns: Vec<Campaign>,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Upstream replica configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Database name on the replica
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// my.cnf-style file with a `[client]` user and password
    #[serde(default = "default_credentials_file")]
    pub credentials_file: PathBuf,

    /// Web replica, short statement ceiling
    #[serde(default = "default_bounded_lane")]
    pub bounded: LaneConfig,

    /// Analytics replica, long statement ceiling
    #[serde(default = "default_extended_lane")]
    pub extended: LaneConfig,
}

/// Connection profile for one lane
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaneConfig {
    pub host: String,

    /// Server-side statement ceiling
    pub statement_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entry freshness window in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Background rebuild workers
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// Refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Years covered by an incremental refresh, counting the current one
    #[serde(default = "default_recent_years")]
    pub recent_years: u32,

    /// Years of country lists warmed by the prebuild pass
    #[serde(default = "default_prebuild_years")]
    pub prebuild_years: u32,

    /// Partition queries in flight at once
    #[serde(default = "default_partition_concurrency")]
    pub partition_concurrency: usize,

    /// Ask the extended lane for year totals during a full refresh
    #[serde(default = "default_true")]
    pub year_totals_on_full: bool,

    /// Country names accepted from discovery, case-insensitive; empty accepts all
    #[serde(default)]
    pub country_whitelist: Vec<String>,
}

/// Read API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Seconds a client should wait before retrying a pending read
    #[serde(default = "default_retry_after")]
    pub retry_after_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            port: default_port(),
            credentials_file: default_credentials_file(),
            bounded: default_bounded_lane(),
            extended: default_extended_lane(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            workers: default_workers(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            recent_years: default_recent_years(),
            prebuild_years: default_prebuild_years(),
            partition_concurrency: default_partition_concurrency(),
            year_totals_on_full: true,
            country_whitelist: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            retry_after_secs: default_retry_after(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.lovestats/data")
}

fn default_database() -> String {
    "commonswiki_p".to_string()
}

fn default_port() -> u16 {
    3306
}

fn default_credentials_file() -> PathBuf {
    PathBuf::from("~/replica.my.cnf")
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_bounded_lane() -> LaneConfig {
    LaneConfig {
        host: "commonswiki.web.db.svc.wikimedia.cloud".to_string(),
        statement_timeout_secs: 300,
        connect_timeout_secs: default_connect_timeout(),
    }
}

fn default_extended_lane() -> LaneConfig {
    LaneConfig {
        host: "commonswiki.analytics.db.svc.wikimedia.cloud".to_string(),
        statement_timeout_secs: 3 * 60 * 60,
        connect_timeout_secs: default_connect_timeout(),
    }
}

fn default_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_workers() -> usize {
    4
}

fn default_recent_years() -> u32 {
    2
}

fn default_prebuild_years() -> u32 {
    3
}

fn default_partition_concurrency() -> usize {
    2
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_retry_after() -> u64 {
    5
}

/// Built-in campaign table
pub fn default_campaigns() -> Vec<Campaign> {
    vec![
        Campaign::new(
            "earth",
            "Wiki Loves Earth",
            "Images_from_Wiki_Loves_Earth",
            5,
            2013,
        ),
        Campaign::new(
            "monuments",
            "Wiki Loves Monuments",
            "Images_from_Wiki_Loves_Monuments",
            9,
            2010,
        )
        .with_no_in_country(2010, "Netherlands"),
        Campaign::new(
            "science",
            "Wiki Science Competition",
            "Images_from_Wiki_Science_Competition",
            11,
            2011,
        )
        .with_alt_prefix("Images_from_European_Science_Photo_Competition"),
        Campaign::new(
            "folklore",
            "Wiki Loves Folklore",
            "Images_from_Wiki_Loves_Folklore",
            2,
            2019,
        ),
        Campaign::new(
            "africa",
            "Wiki Loves Africa",
            "Images_from_Wiki_Loves_Africa",
            3,
            2014,
        ),
        Campaign::new(
            "food",
            "Wiki Loves Food",
            "Images_from_Wiki_Loves_Food",
            7,
            2023,
        ),
        Campaign::new(
            "public_art",
            "Wiki Loves Public Art",
            "Images_from_Wiki_Loves_Public_Art",
            5,
            2013,
        ),
        Campaign::new(
            "andes",
            "Wiki Loves Andes",
            "Images_from_Wiki_Loves_Andes",
            10,
            2023,
        ),
    ]
}

impl Config {
    /// Load configuration from the default location (~/.lovestats/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, TOML parsing fails,
    /// or validation fails.
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&contents)
    }

    /// Parse and validate configuration text
    pub fn from_toml(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default_config();

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.lovestats/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".lovestats").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig {
                data_dir: default_data_dir(),
                log_level: default_log_level(),
            },
            upstream: UpstreamConfig::default(),
            cache: CacheConfig::default(),
            refresh: RefreshConfig::default(),
            server: ServerConfig::default(),
            campaigns: default_campaigns(),
        }
    }

    /// Default configuration rooted at `data_dir`, validated
    pub fn with_data_dir(data_dir: &Path) -> Result<Self, EngineError> {
        let mut config = Self::default_config();
        config.core.data_dir = data_dir.to_path_buf();
        config.validate_and_process()?;
        Ok(config)
    }

    /// Persisted catalog document
    pub fn catalog_path(&self) -> PathBuf {
        self.core.data_dir.join("catalog.json")
    }

    /// Root of the per-key cache files
    pub fn cache_dir(&self) -> PathBuf {
        self.core.data_dir.join("cache")
    }

    /// Refresh run history database
    pub fn db_path(&self) -> PathBuf {
        self.core.data_dir.join("lovestats.db")
    }

    /// Look up a configured campaign by id
    pub fn campaign(&self, id: &str) -> Option<&Campaign> {
        self.campaigns.iter().find(|c| c.id == id)
    }

    /// Validate and process configuration
    ///
    /// This method validates ranges and the campaign table, expands ~ in
    /// paths, and creates the data directory if it doesn't exist.
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.cache.ttl_secs == 0 {
            return Err(EngineError::Config(
                "cache.ttl_secs must be greater than 0".to_string(),
            ));
        }
        if self.cache.workers == 0 {
            return Err(EngineError::Config(
                "cache.workers must be at least 1".to_string(),
            ));
        }
        if self.refresh.recent_years == 0 {
            return Err(EngineError::Config(
                "refresh.recent_years must be at least 1".to_string(),
            ));
        }
        if self.refresh.partition_concurrency == 0 {
            return Err(EngineError::Config(
                "refresh.partition_concurrency must be at least 1".to_string(),
            ));
        }

        for (name, lane) in [
            ("bounded", &self.upstream.bounded),
            ("extended", &self.upstream.extended),
        ] {
            if lane.statement_timeout_secs == 0 {
                return Err(EngineError::Config(format!(
                    "upstream.{}.statement_timeout_secs must be greater than 0",
                    name
                )));
            }
        }

        self.validate_campaigns()?;

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        self.upstream.credentials_file = expand_path(&self.upstream.credentials_file)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }

    fn validate_campaigns(&self) -> Result<(), EngineError> {
        if self.campaigns.is_empty() {
            return Err(EngineError::Config(
                "At least one campaign must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for campaign in &self.campaigns {
            if campaign.id.is_empty() || campaign.category_prefix.is_empty() {
                return Err(EngineError::Config(
                    "Campaign id and category_prefix must not be empty".to_string(),
                ));
            }
            if !seen.insert(campaign.id.as_str()) {
                return Err(EngineError::Config(format!(
                    "Duplicate campaign id '{}'",
                    campaign.id
                )));
            }
            let months = 1..=12;
            if !months.contains(&campaign.start_month) || !months.contains(&campaign.end_month) {
                return Err(EngineError::Config(format!(
                    "Campaign '{}' months must be between 1 and 12",
                    campaign.id
                )));
            }
            if campaign.start_month > campaign.end_month {
                return Err(EngineError::Config(format!(
                    "Campaign '{}' start_month is after end_month",
                    campaign.id
                )));
            }
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_creation() {
        let config = Config::default_config();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.cache.ttl_secs, 86_400);
        assert_eq!(config.refresh.recent_years, 2);
        assert_eq!(config.upstream.bounded.statement_timeout_secs, 300);
        assert_eq!(config.upstream.extended.statement_timeout_secs, 10_800);
        assert_eq!(config.campaigns.len(), 8);
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_path(&path).unwrap();

        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        let expanded = expand_path(&path).unwrap();

        assert_eq!(expanded, path);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default_config();
        let toml_string = toml::to_string_pretty(&config).unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config.core.log_level, deserialized.core.log_level);
        assert_eq!(config.campaigns, deserialized.campaigns);
        assert_eq!(config.upstream.extended, deserialized.upstream.extended);
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let toml = format!(
            "[core]\ndata_dir = {:?}\n",
            temp.path().join("data").display().to_string()
        );
        let config = Config::from_toml(&toml).unwrap();

        assert!(config.core.data_dir.exists());
        assert_eq!(config.server.bind, "127.0.0.1:8000");
        assert!(config.campaign("earth").is_some());
        assert!(config.campaign("nope").is_none());
    }

    #[test]
    fn test_country_rules_parse() {
        let temp = TempDir::new().unwrap();
        let toml = format!(
            r#"[core]
data_dir = {:?}

[refresh]
country_whitelist = ["Germany", "the Netherlands"]

[[campaigns]]
id = "monuments"
name = "Wiki Loves Monuments"
category_prefix = "Images_from_Wiki_Loves_Monuments"
start_month = 9
end_month = 9
first_year = 2010
no_in_country = [{{ year = 2010, country = "Netherlands" }}]
"#,
            temp.path().join("data").display().to_string()
        );
        let config = Config::from_toml(&toml).unwrap();

        assert_eq!(config.refresh.country_whitelist.len(), 2);
        let monuments = config.campaign("monuments").unwrap();
        assert_eq!(monuments.bare_category_country(2010), "Netherlands");
        assert_eq!(monuments.bare_category_country(2012), "International");
    }

    #[test]
    fn test_default_monuments_owns_2010_bare_category() {
        let config = Config::default_config();
        let monuments = config.campaign("monuments").unwrap();
        assert_eq!(monuments.bare_category_country(2010), "Netherlands");
        assert!(config.refresh.country_whitelist.is_empty());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let result = Config::from_toml("[core]\nlog_level = \"loud\"\n");
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default_config();
        config.core.data_dir = temp.path().to_path_buf();
        config.cache.ttl_secs = 0;
        assert!(config.validate_and_process().is_err());
    }

    #[test]
    fn test_duplicate_campaign_rejected() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default_config();
        config.core.data_dir = temp.path().to_path_buf();
        config.campaigns.push(config.campaigns[0].clone());
        let err = config.validate_and_process().unwrap_err();
        assert!(err.to_string().contains("Duplicate campaign id"));
    }

    #[test]
    fn test_bad_month_rejected() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default_config();
        config.core.data_dir = temp.path().to_path_buf();
        config.campaigns[0].end_month = 13;
        assert!(config.validate_and_process().is_err());
    }

    #[test]
    fn test_derived_paths() {
        let temp = TempDir::new().unwrap();
        let config = Config::with_data_dir(temp.path()).unwrap();
        assert_eq!(config.catalog_path(), temp.path().join("catalog.json"));
        assert_eq!(config.cache_dir(), temp.path().join("cache"));
        assert_eq!(config.db_path(), temp.path().join("lovestats.db"));
    }
}
