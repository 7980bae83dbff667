//! Configuration management for the flow tracer.
//!
//! Supports loading from environment variables, config files, and CLI arguments.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main tracer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerConfig {
    /// BscScan API key (may be empty; the API then applies its anonymous quota)
    #[serde(default)]
    pub bscscan_api_key: String,

    /// Base URL of the explorer account API
    #[serde(default = "default_bscscan_url")]
    pub bscscan_base_url: String,

    /// Traversal depth settings
    #[serde(default)]
    pub traversal: TraversalConfig,

    /// Edge classification thresholds
    #[serde(default)]
    pub classification: ClassificationConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// Output directory paths
    #[serde(default)]
    pub paths: PathConfig,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            bscscan_api_key: String::new(),
            bscscan_base_url: default_bscscan_url(),
            traversal: TraversalConfig::default(),
            classification: ClassificationConfig::default(),
            rate_limits: RateLimitConfig::default(),
            paths: PathConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalConfig {
    /// Hop budget; 1 classifies only the seed's own transfers
    #[serde(default = "default_max_hop")]
    pub max_hop: u32,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            max_hop: default_max_hop(),
        }
    }
}

/// Thresholds for the edge heuristics. All comparisons are strict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationConfig {
    /// `laundering` requires `value_total` above this
    #[serde(default = "default_laundering_min_value")]
    pub laundering_min_value: f64,

    /// `laundering` requires `tx_count` above this
    #[serde(default = "default_laundering_min_tx_count")]
    pub laundering_min_tx_count: u64,

    /// `poisoning` requires `value_total` below this
    #[serde(default = "default_poisoning_max_value")]
    pub poisoning_max_value: f64,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            laundering_min_value: default_laundering_min_value(),
            laundering_min_tx_count: default_laundering_min_tx_count(),
            poisoning_max_value: default_poisoning_max_value(),
        }
    }
}

impl ClassificationConfig {
    /// Returns `(laundering, poisoning)` for an aggregated edge
    pub fn classify(&self, value_total: f64, tx_count: u64) -> (bool, bool) {
        let laundering =
            value_total > self.laundering_min_value && tx_count > self.laundering_min_tx_count;
        let poisoning = value_total < self.poisoning_max_value;
        (laundering, poisoning)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per second
    #[serde(default = "default_rps")]
    pub requests_per_second: u32,

    /// Maximum retry attempts for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (ms)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Pagination safety limit per address and action
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Per-request HTTP timeout (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rps(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_pages: default_max_pages(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_raw_dir")]
    pub raw_dir: PathBuf,

    #[serde(default = "default_processed_dir")]
    pub processed_dir: PathBuf,

    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            raw_dir: default_raw_dir(),
            processed_dir: default_processed_dir(),
            metadata_dir: default_metadata_dir(),
        }
    }
}

impl PathConfig {
    /// Re-root every directory under `data_dir`
    pub fn rooted_at(data_dir: PathBuf) -> Self {
        Self {
            raw_dir: data_dir.join("raw"),
            processed_dir: data_dir.join("processed"),
            metadata_dir: data_dir.join("metadata"),
            data_dir,
        }
    }

    pub fn transfers_file(&self) -> PathBuf {
        self.raw_dir.join("transfers_raw.parquet")
    }

    pub fn edges_file(&self) -> PathBuf {
        self.processed_dir.join("edges.parquet")
    }
}

// Default value functions
fn default_bscscan_url() -> String {
    "https://api.bscscan.com/api".to_string()
}

fn default_max_hop() -> u32 {
    2
}

fn default_laundering_min_value() -> f64 {
    1.0
}

fn default_laundering_min_tx_count() -> u64 {
    5
}

fn default_poisoning_max_value() -> f64 {
    1e-8
}

fn default_rps() -> u32 {
    4 // API cap is 5 req/s
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_pages() -> u32 {
    100
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_raw_dir() -> PathBuf {
    PathBuf::from("data/raw")
}

fn default_processed_dir() -> PathBuf {
    PathBuf::from("data/processed")
}

fn default_metadata_dir() -> PathBuf {
    PathBuf::from("data/metadata")
}

impl TracerConfig {
    /// Load configuration from environment
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        config.apply_env();
        config.validate()?;

        Ok(config)
    }

    /// Load from a TOML config file with environment overrides
    pub fn load_from_file(path: &PathBuf) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = ::toml::from_str(&contents)?;

        // Environment variables override file settings
        config.apply_env();
        config.validate()?;

        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("BSCSCAN_KEY") {
            self.bscscan_api_key = key;
        }
        if let Ok(url) = std::env::var("BSCSCAN_BASE_URL") {
            self.bscscan_base_url = url;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.traversal.max_hop < 1 {
            anyhow::bail!("traversal.max_hop must be >= 1");
        }
        if self.rate_limits.requests_per_second == 0 {
            anyhow::bail!("rate_limits.requests_per_second must be > 0");
        }
        if self.rate_limits.max_pages == 0 {
            anyhow::bail!("rate_limits.max_pages must be > 0");
        }
        let thresholds = [
            self.classification.laundering_min_value,
            self.classification.poisoning_max_value,
        ];
        if thresholds.iter().any(|t| !t.is_finite()) {
            anyhow::bail!("classification thresholds must be finite numbers");
        }
        if self.bscscan_base_url.is_empty() {
            anyhow::bail!("bscscan_base_url must not be empty");
        }
        Ok(())
    }

    /// Ensure all output directories exist
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.paths.raw_dir)?;
        std::fs::create_dir_all(&self.paths.processed_dir)?;
        std::fs::create_dir_all(&self.paths.metadata_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let rules = ClassificationConfig::default();
        assert_eq!(rules.laundering_min_value, 1.0);
        assert_eq!(rules.laundering_min_tx_count, 5);
        assert_eq!(rules.poisoning_max_value, 1e-8);
        assert_eq!(TraversalConfig::default().max_hop, 2);
    }

    #[test]
    fn test_classify_is_strict_on_boundaries() {
        let rules = ClassificationConfig::default();
        assert_eq!(rules.classify(1.0, 6), (false, false));
        assert_eq!(rules.classify(3.0, 5), (false, false));
        assert_eq!(rules.classify(3.0, 6), (true, false));
        assert_eq!(rules.classify(1e-8, 1), (false, false));
        assert_eq!(rules.classify(1e-9, 1), (false, true));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TracerConfig = toml::from_str(
            r#"
            bscscan_api_key = "abc"

            [traversal]
            max_hop = 3

            [classification]
            laundering_min_tx_count = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.bscscan_api_key, "abc");
        assert_eq!(config.bscscan_base_url, "https://api.bscscan.com/api");
        assert_eq!(config.traversal.max_hop, 3);
        assert_eq!(config.classification.laundering_min_tx_count, 10);
        assert_eq!(config.classification.laundering_min_value, 1.0);
        assert_eq!(config.rate_limits.requests_per_second, 4);
    }

    #[test]
    fn test_validate_rejects_zero_hop() {
        let mut config = TracerConfig::default();
        config.traversal.max_hop = 0;
        assert!(config.validate().is_err());

        config.traversal.max_hop = 1;
        assert!(config.validate().is_ok());

        config.classification.poisoning_max_value = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_pages() {
        let mut config = TracerConfig::default();
        config.rate_limits.max_pages = 0;
        assert!(config.validate().is_err());

        config.rate_limits.max_pages = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_paths_rooted_at() {
        let paths = PathConfig::rooted_at(PathBuf::from("out"));
        assert_eq!(paths.raw_dir, PathBuf::from("out/raw"));
        assert_eq!(paths.edges_file(), PathBuf::from("out/processed/edges.parquet"));
    }
}
