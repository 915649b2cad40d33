//! Configuration loading from procbox.json

use crate::config::types::{ControlError, LimitSettings, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default file looked up in the working directory by [`ControlConfig::load_default`].
pub const DEFAULT_CONFIG_FILE: &str = "procbox.json";

/// Which backend a handle is created against
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendKind {
    /// Real child process supervised by a watchdog thread
    #[serde(rename = "native")]
    Native,
    /// In-memory echo program; useful to check a deployment's plumbing
    #[serde(rename = "scripted-echo")]
    ScriptedEcho,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Native
    }
}

/// Backend default limits. Applied at spawn unless the caller overrides them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitDefaults {
    pub timeout_ms: Option<u64>,
    pub time_limit_ms: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub output_limit_bytes: Option<u64>,
}

impl Default for LimitDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: Some(20_000),
            time_limit_ms: Some(10_000),
            memory_limit_bytes: Some(128 * 1024 * 1024), // 128MB
            output_limit_bytes: Some(64 * 1024 * 1024),  // 64MB
        }
    }
}

impl LimitDefaults {
    /// No limits at all.
    pub fn unlimited() -> Self {
        Self {
            timeout_ms: None,
            time_limit_ms: None,
            memory_limit_bytes: None,
            output_limit_bytes: None,
        }
    }

    pub fn to_settings(&self) -> LimitSettings {
        LimitSettings {
            timeout: self.timeout_ms.map(Duration::from_millis),
            time_limit: self.time_limit_ms.map(Duration::from_millis),
            memory_limit: self.memory_limit_bytes,
            output_limit: self.output_limit_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CgroupConfig {
    /// Account and enforce through a per-process cgroup v2 when available
    pub enabled: bool,
    pub base_path: PathBuf,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_path: PathBuf::from("/sys/fs/cgroup/procbox"),
        }
    }
}

/// Full procbox.json structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    pub backend: BackendKind,
    pub limits: LimitDefaults,
    /// Watchdog polling interval
    pub poll_interval_ms: u64,
    /// Output pump read size
    pub io_chunk_size: usize,
    /// Close the process's input once the first read starts waiting on output
    pub seal_input_on_read: bool,
    pub cgroup: CgroupConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Native,
            limits: LimitDefaults::default(),
            poll_interval_ms: 10,
            io_chunk_size: 8192, // 8KB
            seal_input_on_read: true,
            cgroup: CgroupConfig::default(),
        }
    }
}

impl ControlConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ControlError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: ControlConfig = serde_json::from_str(&config_content)
            .map_err(|e| ControlError::Config(format!("Failed to parse config JSON: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load ./procbox.json when present, built-in defaults otherwise
    pub fn load_default() -> Result<Self> {
        let config_path = std::env::current_dir()
            .map_err(|e| ControlError::Config(format!("Failed to get current directory: {}", e)))?
            .join(DEFAULT_CONFIG_FILE);

        if !config_path.exists() {
            log::debug!("{} not found, using built-in defaults", config_path.display());
            return Ok(Self::default());
        }

        log::info!("Loading configuration from {}", config_path.display());
        Self::load_from_file(config_path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(ControlError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.io_chunk_size == 0 {
            return Err(ControlError::Config(
                "io_chunk_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_defaults() {
        let config = ControlConfig::default();
        let settings = config.limits.to_settings();
        assert_eq!(settings.timeout, Some(Duration::from_secs(20)));
        assert_eq!(settings.time_limit, Some(Duration::from_secs(10)));
        assert_eq!(settings.memory_limit, Some(128 * 1024 * 1024));
        assert_eq!(settings.output_limit, Some(64 * 1024 * 1024));
        assert!(config.seal_input_on_read);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"backend": "scripted-echo", "limits": {{"timeout_ms": 500}}}}"#
        )
        .unwrap();

        let config = ControlConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.backend, BackendKind::ScriptedEcho);
        assert_eq!(config.limits.timeout_ms, Some(500));
        assert_eq!(config.limits.time_limit_ms, Some(10_000));
        assert_eq!(config.poll_interval_ms, 10);
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"poll_interval_ms": 0}}"#).unwrap();

        let err = ControlConfig::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, ControlError::Config(_)));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = ControlConfig::load_from_file("/nonexistent/procbox.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
