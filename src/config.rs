//! Configuration management for the chunk cache
//!
//! This module provides configuration file support with TOML format,
//! environment variable overrides, and sensible defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::services::compactor::CompactionConfig;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Cache storage configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Background compaction configuration
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Monitoring and observability
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Cache storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Data directory path
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Duration of chunks produced by the ingester, in seconds
    #[serde(default = "default_base_chunk_duration")]
    pub base_chunk_duration_seconds: i64,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/data/promcache")
}
fn default_base_chunk_duration() -> i64 {
    3600
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            compaction: CompactionConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            base_chunk_duration_seconds: default_base_chunk_duration(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file {}: {}", path, e))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(data_dir) = std::env::var("PROMCACHE_DATA_DIR") {
            self.cache.data_dir = PathBuf::from(data_dir);
        }
        if let Ok(interval) = std::env::var("PROMCACHE_COMPACTION_INTERVAL_SECONDS") {
            if let Ok(v) = interval.parse() {
                self.compaction.interval_seconds = v;
            }
        }
        if let Ok(workers) = std::env::var("PROMCACHE_COMPACTION_WORKERS") {
            if let Ok(v) = workers.parse() {
                self.compaction.workers_num = v;
            }
        }
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.monitoring.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.cache.data_dir.as_os_str().is_empty() {
            return Err("Data directory cannot be empty".to_string());
        }
        if self.cache.base_chunk_duration_seconds <= 0 {
            return Err("Base chunk duration must be > 0".to_string());
        }
        self.compaction.validate()?;

        // The first compaction rung must consume what the ingester produces
        if let Some(first) = self.compaction.compactors.first() {
            if first.src_chunk_duration_seconds != self.cache.base_chunk_duration_seconds {
                return Err(format!(
                    "First compactor src duration {} does not match base chunk duration {}",
                    first.src_chunk_duration_seconds, self.cache.base_chunk_duration_seconds
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cache.base_chunk_duration_seconds, 3600);
        assert_eq!(config.compaction.interval_seconds, 600);
        assert_eq!(config.compaction.workers_num, 1);
        assert!(config.monitoring.metrics_enabled);
    }

    #[test]
    fn test_default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_base_duration() {
        let mut config = Config::default();
        config.cache.base_chunk_duration_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ladder_must_start_at_base() {
        let mut config = Config::default();
        config.cache.base_chunk_duration_seconds = 1800;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("PROMCACHE_COMPACTION_WORKERS", "3");
        let config = Config::from_env();
        assert_eq!(config.compaction.workers_num, 3);
        std::env::remove_var("PROMCACHE_COMPACTION_WORKERS");
    }

    #[test]
    fn test_parse_toml() {
        let toml_src = r#"
            [cache]
            data_dir = "/tmp/pc"

            [compaction]
            interval_seconds = 60
            workers_num = 2

            [[compaction.compactors]]
            src_chunk_duration_seconds = 3600
            dst_chunk_duration_seconds = 14400
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.cache.data_dir, PathBuf::from("/tmp/pc"));
        assert_eq!(config.compaction.interval_seconds, 60);
        assert_eq!(config.compaction.workers_num, 2);
        assert_eq!(config.compaction.compactors.len(), 1);
        assert!(config.validate().is_ok());
    }
}
