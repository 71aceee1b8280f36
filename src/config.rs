//! Sandbox configuration loading.
//!
//! Configuration is discovered through a hierarchy:
//! 1. Current directory: ./cellbox.toml
//! 2. User config: ~/.cellbox/config.toml
//! 3. System config: /etc/cellbox/config.toml
//! 4. Built-in defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Process-wide sandbox configuration, immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Whether the sandbox subsystem is enabled at all.
    pub enabled: bool,
    /// Image the worker containers run.
    pub worker_image: String,
    /// Port the worker HTTP server listens on inside the container.
    pub worker_port: u16,
    /// Memory cap per container, human form ("2g", "512m").
    pub memory_limit: String,
    /// CPU cores per container (1.0 = one full core).
    pub cpu_limit: f64,
    /// Bridge network the workers attach to.
    pub network_name: String,
    /// Name prefix for worker containers; orphan reaping keys off this.
    pub container_prefix: String,
    /// Seconds to wait for a new worker to report healthy.
    pub health_check_timeout: u64,
    /// Seconds between health poll attempts.
    pub health_check_interval: f64,
    /// Idle read timeout for one execution, in seconds.
    pub execution_timeout: u64,
    /// Where caller data volumes land inside the worker.
    pub data_mount_path: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_image: "cellbox/worker:latest".to_string(),
            worker_port: 9000,
            memory_limit: "2g".to_string(),
            cpu_limit: 1.0,
            network_name: "cellbox-network".to_string(),
            container_prefix: "cellbox-worker".to_string(),
            health_check_timeout: 30,
            health_check_interval: 1.0,
            execution_timeout: 300,
            data_mount_path: "/data".to_string(),
        }
    }
}

impl SandboxConfig {
    /// Load from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;
        let config: SandboxConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a TOML file.
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))
    }

    /// Discover and load configuration using the hierarchy, falling back to
    /// defaults when no file is found.
    pub fn discover() -> Result<Self, ConfigError> {
        for candidate in Self::config_candidates() {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                info!("Loading configuration from: {:?}", candidate);
                return Self::from_toml_file(candidate);
            }
        }

        info!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    fn config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(current_dir) = std::env::current_dir() {
            candidates.push(current_dir.join("cellbox.toml"));
        }

        if let Some(home) = std::env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(".cellbox").join("config.toml"));
        }

        #[cfg(unix)]
        candidates.push(PathBuf::from("/etc/cellbox/config.toml"));

        candidates
    }

    fn validate(&self) -> Result<(), ConfigError> {
        parse_memory_limit(&self.memory_limit)
            .ok_or_else(|| ConfigError::Invalid(format!("bad memory_limit: {}", self.memory_limit)))?;
        if self.cpu_limit <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "cpu_limit must be positive, got {}",
                self.cpu_limit
            )));
        }
        Ok(())
    }

    /// Memory cap in bytes, for the container engine.
    pub fn memory_limit_bytes(&self) -> i64 {
        // validate() guarantees the string parses
        parse_memory_limit(&self.memory_limit).unwrap_or(2 * 1024 * 1024 * 1024)
    }

    /// CPU quota in microseconds per 100ms period, the engine's unit.
    pub fn cpu_quota_us(&self) -> i64 {
        (self.cpu_limit * 100_000.0) as i64
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.health_check_interval)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout)
    }
}

/// Parse a docker-style memory string ("2g", "512m", "100k", "1048576") into bytes.
pub fn parse_memory_limit(limit: &str) -> Option<i64> {
    let trimmed = limit.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (digits, multiplier) = match trimmed.chars().last() {
        Some(c) if c.is_ascii_digit() => (trimmed, 1i64),
        Some('b' | 'B') => (&trimmed[..trimmed.len() - 1], 1i64),
        Some('k' | 'K') => (&trimmed[..trimmed.len() - 1], 1024i64),
        Some('m' | 'M') => (&trimmed[..trimmed.len() - 1], 1024i64 * 1024),
        Some('g' | 'G') => (&trimmed[..trimmed.len() - 1], 1024i64 * 1024 * 1024),
        _ => return None,
    };

    let value: i64 = digits.trim().parse().ok()?;
    if value <= 0 {
        return None;
    }
    value.checked_mul(multiplier)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_worker_contract() {
        let config = SandboxConfig::default();
        assert_eq!(config.worker_port, 9000);
        assert_eq!(config.memory_limit, "2g");
        assert_eq!(config.cpu_limit, 1.0);
        assert_eq!(config.container_prefix, "cellbox-worker");
        assert_eq!(config.execution_timeout, 300);
        assert!(config.enabled);
    }

    #[test]
    fn memory_limit_parsing() {
        assert_eq!(parse_memory_limit("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_limit("100k"), Some(100 * 1024));
        assert_eq!(parse_memory_limit("1048576"), Some(1_048_576));
        assert_eq!(parse_memory_limit("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit(""), None);
        assert_eq!(parse_memory_limit("abc"), None);
        assert_eq!(parse_memory_limit("-5m"), None);
    }

    #[test]
    fn cpu_quota_conversion() {
        let mut config = SandboxConfig::default();
        config.cpu_limit = 1.5;
        assert_eq!(config.cpu_quota_us(), 150_000);
    }

    #[test]
    fn toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cellbox.toml");

        let mut config = SandboxConfig::default();
        config.worker_image = "cellbox/worker:dev".to_string();
        config.health_check_timeout = 5;
        config.to_toml_file(&path).unwrap();

        let loaded = SandboxConfig::from_toml_file(&path).unwrap();
        assert_eq!(loaded.worker_image, "cellbox/worker:dev");
        assert_eq!(loaded.health_check_timeout, 5);
        assert_eq!(loaded.worker_port, 9000);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "worker_port = 9100\nmemory_limit = \"1g\"\n").unwrap();

        let loaded = SandboxConfig::from_toml_file(&path).unwrap();
        assert_eq!(loaded.worker_port, 9100);
        assert_eq!(loaded.memory_limit_bytes(), 1024 * 1024 * 1024);
        assert_eq!(loaded.network_name, "cellbox-network");
    }

    #[test]
    fn invalid_memory_limit_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "memory_limit = \"lots\"\n").unwrap();

        assert!(matches!(
            SandboxConfig::from_toml_file(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
