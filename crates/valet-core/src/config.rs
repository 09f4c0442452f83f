//! valet.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors reported by [`ValetConfig::validate`].
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name}: low watermark {min} exceeds high watermark {max}")]
    Watermarks { name: &'static str, min: usize, max: usize },

    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("standby_ratio must be in [0, 1), got {0}")]
    StandbyRatio(f64),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValetConfig {
    pub engine: EngineConfig,
    pub overcommit: OvercommitConfig,
    pub store: StoreConfig,
    pub inventory: InventoryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name of the datacenter root in the resource topology.
    pub datacenter: String,
    pub max_cache: usize,
    pub min_cache: usize,
    pub max_app_cache: usize,
    pub min_app_cache: usize,
    pub max_decision_cache: usize,
    pub min_decision_cache: usize,
    /// Maximum number of events applied per batch.
    pub event_batch_size: usize,
    pub event_interval_secs: u64,
    pub refresh_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            datacenter: "dc1".to_string(),
            max_cache: 5000,
            min_cache: 1000,
            max_app_cache: 500,
            min_app_cache: 100,
            max_decision_cache: 500,
            min_decision_cache: 100,
            event_batch_size: 100,
            event_interval_secs: 5,
            refresh_interval_secs: 300,
        }
    }
}

/// Overcommit ratios applied to raw host capacity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct OvercommitConfig {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    /// Fraction of every host held back from placement.
    pub standby_ratio: f64,
}

impl Default for OvercommitConfig {
    fn default() -> Self {
        Self {
            cpu: 16.0,
            memory: 1.5,
            disk: 1.0,
            standby_ratio: 0.0,
        }
    }
}

impl OvercommitConfig {
    /// No overcommit and no standby reserve.
    pub fn none() -> Self {
        Self {
            cpu: 1.0,
            memory: 1.0,
            disk: 1.0,
            standby_ratio: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/valet/valet.redb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub path: PathBuf,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/etc/valet/inventory.toml"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,valet=debug".to_string(),
            json: false,
        }
    }
}

impl ValetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ValetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let e = &self.engine;
        check_watermarks("cache", e.min_cache, e.max_cache)?;
        check_watermarks("app cache", e.min_app_cache, e.max_app_cache)?;
        check_watermarks("decision cache", e.min_decision_cache, e.max_decision_cache)?;
        if e.event_batch_size == 0 {
            return Err(ConfigError::NotPositive("event_batch_size"));
        }

        let o = &self.overcommit;
        if o.cpu <= 0.0 {
            return Err(ConfigError::NotPositive("overcommit.cpu"));
        }
        if o.memory <= 0.0 {
            return Err(ConfigError::NotPositive("overcommit.memory"));
        }
        if o.disk <= 0.0 {
            return Err(ConfigError::NotPositive("overcommit.disk"));
        }
        if !(0.0..1.0).contains(&o.standby_ratio) {
            return Err(ConfigError::StandbyRatio(o.standby_ratio));
        }
        Ok(())
    }
}

fn check_watermarks(name: &'static str, min: usize, max: usize) -> Result<(), ConfigError> {
    if max == 0 {
        return Err(ConfigError::NotPositive(name));
    }
    if min > max {
        return Err(ConfigError::Watermarks { name, min, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ValetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.max_cache, 5000);
        assert_eq!(config.engine.min_cache, 1000);
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
[engine]
datacenter = "lab"
max_cache = 10
min_cache = 2

[overcommit]
cpu = 4.0
"#;
        let config = ValetConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.engine.datacenter, "lab");
        assert_eq!(config.engine.max_cache, 10);
        assert_eq!(config.overcommit.cpu, 4.0);
        // Untouched fields keep their defaults.
        assert_eq!(config.overcommit.memory, 1.5);
        assert_eq!(config.engine.event_batch_size, 100);
    }

    #[test]
    fn test_rejects_inverted_watermarks() {
        let mut config = ValetConfig::default();
        config.engine.min_cache = 10;
        config.engine.max_cache = 5;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Watermarks {
                name: "cache",
                min: 10,
                max: 5
            })
        );
    }

    #[test]
    fn test_rejects_bad_standby_ratio() {
        let mut config = ValetConfig::default();
        config.overcommit.standby_ratio = 1.0;
        assert!(matches!(config.validate(), Err(ConfigError::StandbyRatio(_))));
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = ValetConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("datacenter"));
        let parsed = ValetConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed.engine.datacenter, "dc1");
    }
}
