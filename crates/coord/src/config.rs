use std::path::{Path, PathBuf};

use sentinel_common::config::SystemConfig;

use crate::balancer::Strategy;

/// Complete coordination configuration loaded from the config directory.
#[derive(Clone, Debug)]
pub struct CoordConfig {
    /// Parsed system.toml.
    pub system: SystemConfig,
    #[allow(dead_code)]
    pub config_dir: PathBuf,
}

/// Load configuration from `<dir>/system.toml`.
///
/// A missing file yields the documented defaults; a file that exists but
/// fails to parse or validate refuses to load — the daemon will not start
/// on a misconfiguration.
pub fn load_config(config_dir: &Path) -> Result<CoordConfig, ConfigError> {
    tracing::info!(config_dir = %config_dir.display(), "Loading configuration");

    let system_path = config_dir.join("system.toml");
    let system = if system_path.exists() {
        let content = std::fs::read_to_string(&system_path).map_err(|e| ConfigError::FileRead {
            path: system_path.clone(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: system_path.clone(),
            detail: e.to_string(),
        })?
    } else {
        tracing::warn!(
            path = %system_path.display(),
            "system.toml not found, using defaults"
        );
        SystemConfig::default()
    };

    validate(&system)?;

    Ok(CoordConfig {
        system,
        config_dir: config_dir.to_path_buf(),
    })
}

fn validate(config: &SystemConfig) -> Result<(), ConfigError> {
    let mut problems = Vec::new();

    if config.lock.initial_backoff_ms == 0 {
        problems.push("lock.initial_backoff_ms must be positive".to_string());
    }
    if config.lock.max_backoff_ms < config.lock.initial_backoff_ms {
        problems.push("lock.max_backoff_ms must be >= lock.initial_backoff_ms".to_string());
    }
    if config.lock.lock_timeout_ms == 0 {
        problems.push("lock.lock_timeout_ms must be positive".to_string());
    }

    if config.registry.degraded_threshold_seconds < config.registry.healthy_threshold_seconds {
        problems.push(
            "registry.degraded_threshold_seconds must be >= registry.healthy_threshold_seconds"
                .to_string(),
        );
    }

    if config.heartbeat.heartbeat_interval_seconds == 0 {
        problems.push("heartbeat.heartbeat_interval_seconds must be positive".to_string());
    }
    if config.heartbeat.detection_interval_seconds == 0 {
        problems.push("heartbeat.detection_interval_seconds must be positive".to_string());
    }

    if config.memory.batch_interval_ms == 0 {
        problems.push("memory.batch_interval_ms must be positive".to_string());
    }
    if let Err(e) = sentinel_common::keys::validate(&config.memory.namespace) {
        problems.push(format!("memory.namespace invalid: {}", e));
    }

    if Strategy::parse(&config.balancer.strategy).is_none() {
        problems.push(format!(
            "balancer.strategy {:?} is not a known strategy",
            config.balancer.strategy
        ));
    }
    if !(0.0..=1.0).contains(&config.balancer.load_threshold) {
        problems.push("balancer.load_threshold must be within [0, 1]".to_string());
    }
    if config.balancer.underutilized_threshold >= config.balancer.load_threshold {
        problems.push(
            "balancer.underutilized_threshold must be below balancer.load_threshold".to_string(),
        );
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation {
            problems: problems.join("; "),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("Configuration invalid: {problems}")]
    Validation { problems: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        validate(&SystemConfig::default()).unwrap();
    }

    #[test]
    fn test_bad_strategy_rejected() {
        let mut config = SystemConfig::default();
        config.balancer.strategy = "force-acquire".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        let mut config = SystemConfig::default();
        config.lock.initial_backoff_ms = 30_000;
        config.lock.max_backoff_ms = 1_000;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_shell_metacharacter_namespace_rejected() {
        let mut config = SystemConfig::default();
        config.memory.namespace = "ns;rm".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_missing_config_dir_uses_defaults() {
        let loaded = load_config(Path::new("/nonexistent/sentinel-config")).unwrap();
        assert_eq!(loaded.system.lock.max_retries, 5);
    }
}
