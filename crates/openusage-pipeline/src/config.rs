use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use openusage_spool::CleanupPolicy;

/// Spool retention limits, all optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolCleanupConfig {
    pub max_age_secs: Option<u64>,
    pub max_files: Option<usize>,
    pub max_bytes: Option<u64>,
}

impl SpoolCleanupConfig {
    pub fn policy(&self) -> CleanupPolicy {
        CleanupPolicy {
            max_age: self.max_age_secs.map(Duration::from_secs),
            max_files: self.max_files,
            max_total_bytes: self.max_bytes,
        }
    }
}

/// Runtime configuration of the telemetry daemon's collection loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Seconds between collection cycles.
    pub collect_interval_secs: u64,
    /// Cap on spool records drained per cycle.
    pub max_flush: usize,
    /// Cap on spool records per flush batch.
    pub flush_batch: usize,
    /// Canonical events older than this many days are pruned. Zero keeps
    /// everything.
    pub retention_days: i64,
    /// Overrides the default state directory when set.
    pub state_dir: Option<PathBuf>,
    /// source provider -> target provider links for the read model.
    pub provider_links: BTreeMap<String, String>,
    pub spool_cleanup: SpoolCleanupConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            collect_interval_secs: 30,
            max_flush: crate::runtime::DEFAULT_MAX_FLUSH,
            flush_batch: crate::runtime::DEFAULT_FLUSH_BATCH,
            retention_days: 0,
            state_dir: None,
            provider_links: BTreeMap::new(),
            spool_cleanup: SpoolCleanupConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load() -> Result<Self> {
        let config_path = Self::default_path()?;
        Self::load_from(&config_path)
    }

    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let config: PipelineConfig =
            toml::from_str(&content).with_context(|| format!("parse config: {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("write config: {}", path.display()))?;
        Ok(())
    }

    pub fn default_path() -> Result<PathBuf> {
        let state_dir = openusage_core::resolve_state_dir(None)
            .map_err(|err| anyhow::anyhow!("resolve state directory: {}", err))?;
        Ok(state_dir.join("config.toml"))
    }

    pub fn collect_interval(&self) -> Duration {
        Duration::from_secs(self.collect_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.collect_interval_secs, 30);
        assert_eq!(config.max_flush, 50_000);
        assert_eq!(config.flush_batch, 10_000);
        assert_eq!(config.retention_days, 0);
        assert!(config.provider_links.is_empty());
    }

    #[test]
    fn test_load_nonexistent_returns_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.toml");
        let config = PipelineConfig::load_from(&path).unwrap();
        assert_eq!(config.collect_interval_secs, 30);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = PipelineConfig::default();
        config.collect_interval_secs = 10;
        config.retention_days = 90;
        config
            .provider_links
            .insert("anthropic".to_string(), "claude_code".to_string());
        config.spool_cleanup.max_files = Some(5000);

        config.save_to(&path).unwrap();
        let loaded = PipelineConfig::load_from(&path).unwrap();
        assert_eq!(loaded.collect_interval_secs, 10);
        assert_eq!(loaded.retention_days, 90);
        assert_eq!(
            loaded.provider_links.get("anthropic").map(String::as_str),
            Some("claude_code")
        );
        assert_eq!(loaded.spool_cleanup.max_files, Some(5000));
    }

    #[test]
    fn test_cleanup_policy_conversion() {
        let cleanup = SpoolCleanupConfig {
            max_age_secs: Some(3600),
            max_files: Some(100),
            max_bytes: Some(1 << 20),
        };
        let policy = cleanup.policy();
        assert_eq!(policy.max_age, Some(Duration::from_secs(3600)));
        assert_eq!(policy.max_files, Some(100));
        assert_eq!(policy.max_total_bytes, Some(1 << 20));
    }

    #[test]
    fn test_interval_floor() {
        let mut config = PipelineConfig::default();
        config.collect_interval_secs = 0;
        assert_eq!(config.collect_interval(), Duration::from_secs(1));
    }
}
