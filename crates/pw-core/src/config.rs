//! Configuration management for patchwork
//!
//! Settings live in `.patchwork/config.toml`. Every field has a default so
//! a missing file or a partial file both load.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::TriggerMode;
use crate::Result;

/// Name of the per-repository state directory
pub const STATE_DIR: &str = ".patchwork";

/// Repository-level patchwork configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchworkConfig {
    /// Database file, relative to the directory containing `.patchwork/`
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// How hierarchy writes dispatch reconciliation
    #[serde(default)]
    pub trigger_mode: TriggerMode,

    /// Reconciliation worker settings
    #[serde(default)]
    pub worker: WorkerSettings,

    /// Monitoring endpoint settings
    #[serde(default)]
    pub dashboard: DashboardSettings,
}

/// Reconciliation worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Number of worker tasks draining the queue
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// How often an idle worker polls for jobs
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Jobs claimed per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts before a job is parked as failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay; attempt N waits N times this
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Full sweep period (0 disables the periodic sweep)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// How long finished jobs are kept before the sweep prunes them
    /// (0 keeps them forever)
    #[serde(default = "default_done_retention_secs")]
    pub done_retention_secs: u64,
}

/// Dashboard bind settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_database_path() -> PathBuf {
    PathBuf::from(STATE_DIR).join("patchwork.db")
}

fn default_worker_count() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_batch_size() -> usize {
    16
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_done_retention_secs() -> u64 {
    86_400
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

impl PatchworkConfig {
    /// Load configuration from `.patchwork/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(STATE_DIR).join("config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content).map_err(|e| {
                crate::Error::Config(format!("Failed to parse {}: {}", config_path.display(), e))
            })
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `.patchwork/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<()> {
        let config_dir = repo_root.join(STATE_DIR);
        std::fs::create_dir_all(&config_dir)?;

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(config_dir.join("config.toml"), content)?;
        Ok(())
    }

    /// Absolute database path for a repository root
    pub fn database_path_in(&self, repo_root: &Path) -> PathBuf {
        if self.database_path.is_absolute() {
            self.database_path.clone()
        } else {
            repo_root.join(&self.database_path)
        }
    }
}

impl Default for PatchworkConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            trigger_mode: TriggerMode::default(),
            worker: WorkerSettings::default(),
            dashboard: DashboardSettings::default(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            done_retention_secs: default_done_retention_secs(),
        }
    }
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = PatchworkConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.trigger_mode, TriggerMode::Inline);
        assert_eq!(config.worker.worker_count, 2);
        assert_eq!(config.worker.done_retention_secs, 86_400);
        assert_eq!(
            config.database_path_in(dir.path()),
            dir.path().join(".patchwork").join("patchwork.db")
        );
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(STATE_DIR)).unwrap();
        std::fs::write(
            dir.path().join(STATE_DIR).join("config.toml"),
            "trigger_mode = \"queued\"\n\n[worker]\nmax_attempts = 9\n",
        )
        .unwrap();

        let config = PatchworkConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.trigger_mode, TriggerMode::Queued);
        assert_eq!(config.worker.max_attempts, 9);
        assert_eq!(config.worker.batch_size, 16);
        assert_eq!(config.dashboard.bind_addr, "127.0.0.1:8787");
    }

    #[test]
    fn test_write_default_round_trips() {
        let dir = TempDir::new().unwrap();
        PatchworkConfig::write_default(dir.path()).unwrap();
        let config = PatchworkConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.worker.sweep_interval_secs, 3600);
    }

    #[test]
    fn test_invalid_file_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(STATE_DIR)).unwrap();
        std::fs::write(
            dir.path().join(STATE_DIR).join("config.toml"),
            "trigger_mode = \"sometimes\"\n",
        )
        .unwrap();

        let err = PatchworkConfig::load_or_default(dir.path()).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}
