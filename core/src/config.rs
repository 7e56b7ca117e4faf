use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Engine configuration, loaded from `atelier.toml` in the data dir.
/// Every field has a default; a missing file means all defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Container engine binary (docker-compatible CLI).
    pub container_bin: String,
    /// Image used for project workspaces.
    pub image: String,
    /// Workspace root inside the container; the project volume mounts here.
    pub workspace_root: String,
    /// Container memory ceiling, docker syntax ("1g", "512m").
    pub memory_limit: String,
    /// Relative CPU weight for the container.
    pub cpu_shares: u32,
    /// Bounded wait for any single container exec, in seconds.
    pub exec_timeout_secs: u64,
    /// Watcher scan interval, in milliseconds.
    pub poll_interval_ms: u64,
    /// Delay before a change-triggered sync runs, coalescing bursts.
    pub debounce_ms: u64,
    /// Consecutive scan failures before a watcher stops itself.
    pub max_scan_failures: u32,
    /// Commands run once inside a freshly created workspace
    /// (toolchain bootstrap; empty by default).
    pub setup_commands: Vec<String>,
    /// Interval between daemon maintenance passes, in seconds.
    pub maintenance_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            container_bin: "docker".into(),
            image: "atelier-workspace:latest".into(),
            workspace_root: "/workspace".into(),
            memory_limit: "1g".into(),
            cpu_shares: 512,
            exec_timeout_secs: 30,
            poll_interval_ms: 2500,
            debounce_ms: 1200,
            max_scan_failures: 3,
            setup_commands: Vec::new(),
            maintenance_interval_secs: 600,
        }
    }
}

impl EngineConfig {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }
}

/// ~/.local/share/atelier/atelier.toml (platform equivalent via dirs),
/// overridable with ATELIER_CONFIG.
pub fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("ATELIER_CONFIG") {
        return PathBuf::from(p);
    }
    data_dir().join("atelier.toml")
}

/// Data directory for the embedded database and logs.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("atelier")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_missing() {
        let cfg = EngineConfig::load_from(&PathBuf::from("/tmp/atelier_no_such_config.toml")).unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("atelier.toml");
        std::fs::write(&path, "poll_interval_ms = 500\nimage = \"custom:dev\"\n").unwrap();

        let cfg = EngineConfig::load_from(&path).unwrap();
        assert_eq!(cfg.poll_interval_ms, 500);
        assert_eq!(cfg.image, "custom:dev");
        assert_eq!(cfg.debounce_ms, EngineConfig::default().debounce_ms);
    }

    #[test]
    fn rejects_malformed_toml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("atelier.toml");
        std::fs::write(&path, "poll_interval_ms = \"not a number").unwrap();

        assert!(matches!(
            EngineConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
