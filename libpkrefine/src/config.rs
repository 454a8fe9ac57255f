use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RefineConfig {
    /// Management plugin name a record must carry, or leave unset, to be
    /// refined here.
    pub namespace: String,
    pub idle_timeout_secs: u64,
    pub history_timeout_secs: u64,
    pub worker_threads: usize,
    /// Root for desktop files and metainfo lookups.
    pub data_dir: PathBuf,
    pub prepared_update_path: PathBuf,
    pub upgrade_cache_age_secs: u64,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            namespace: "packagekit".to_string(),
            idle_timeout_secs: 60,
            history_timeout_secs: 5,
            worker_threads: 2,
            data_dir: PathBuf::from("/usr/share"),
            prepared_update_path: PathBuf::from("/var/lib/PackageKit/prepared-update"),
            upgrade_cache_age_secs: 60 * 60 * 24 * 7,
        }
    }
}

impl RefineConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_secs(self.history_timeout_secs)
    }

    pub fn upgrade_cache_age(&self) -> Duration {
        Duration::from_secs(self.upgrade_cache_age_secs)
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<RefineConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: RefineConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    if cfg.worker_threads == 0 {
        anyhow::bail!("worker_threads must be at least 1");
    }
    Ok(cfg)
}
