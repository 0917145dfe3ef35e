//! Runtime configuration.
//!
//! `Config` is a plain value owned by [`crate::core::Core`] and passed by
//! reference, rather than an ad-hoc `get_X()` module-level singleton.
//!
//! ## Loading order
//!
//! 1. `DISPATCH_CORE_CONFIG` environment variable (path to a TOML file)
//! 2. `dispatch-core.toml` in the current working directory
//! 3. Built-in defaults

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CoreError, ErrorKind};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub secret: Option<String>,
    pub default_deadline_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig { secret: None, default_deadline_ms: 60_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    pub workers: usize,
    pub thread_workers: usize,
    pub process_workers: usize,
    pub queue_capacity: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        TasksConfig { workers: 5, thread_workers: 2, process_workers: 0, queue_capacity: 1000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub quick_refresh_min: u64,
    pub normal_refresh_min: u64,
    pub background_refresh_min: u64,
    pub max_concurrent_refreshes: usize,
    pub change_threshold_pct: f64,
    pub alert_threshold_pct: f64,
    /// Net new subscribers in a week at or above which a milestone alert
    /// fires, independent of `change_threshold_pct`/`alert_threshold_pct`.
    pub milestone_subscriber_threshold: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            quick_refresh_min: 15,
            normal_refresh_min: 30,
            background_refresh_min: 60,
            max_concurrent_refreshes: 5,
            change_threshold_pct: 20.0,
            alert_threshold_pct: 50.0,
            milestone_subscriber_threshold: 100.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub remote_url: Option<String>,
    pub local_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig { remote_url: None, local_capacity: 10_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_s: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig { failure_threshold: 5, recovery_timeout_s: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    pub ttl_s: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        CredentialConfig { ttl_s: 3600 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dispatcher: DispatcherConfig,
    pub tasks: TasksConfig,
    pub pipeline: PipelineConfig,
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub credential: CredentialConfig,
}

impl Config {
    /// Load following the order documented on the module, then validate.
    pub fn load() -> Result<Self, CoreError> {
        let mut config = if let Ok(path) = std::env::var("DISPATCH_CORE_CONFIG") {
            Self::from_file(&path)?
        } else if Path::new("dispatch-core.toml").exists() {
            Self::from_file("dispatch-core.toml")?
        } else {
            Config::default()
        };

        if config.dispatcher.secret.is_none() {
            if let Ok(secret) = std::env::var("DISPATCH_CORE_SECRET") {
                config.dispatcher.secret = Some(secret);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ErrorKind::Configuration(format!("could not read {}: {e}", path.as_ref().display()))
        })?;
        toml::from_str(&raw)
            .map_err(|e| ErrorKind::Configuration(format!("invalid config TOML: {e}")).into())
    }

    /// Fatal at startup if anything here is wrong.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.dispatcher.secret.as_deref().unwrap_or("").is_empty() {
            return Err(ErrorKind::Configuration(
                "dispatcher.secret is required".into(),
            )
            .into());
        }
        if self.tasks.workers == 0 {
            return Err(ErrorKind::Configuration("tasks.workers must be > 0".into()).into());
        }
        if self.credential.ttl_s == 0 || self.credential.ttl_s > 3600 {
            return Err(ErrorKind::Configuration(
                "credential.ttl_s must be in (0, 3600]".into(),
            )
            .into());
        }
        Ok(())
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.dispatcher.default_deadline_ms)
    }

    pub fn credential_ttl(&self) -> Duration {
        Duration::from_secs(self.credential.ttl_s)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.breaker.recovery_timeout_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fails_validation_without_secret() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_with_secret_validates() {
        let mut config = Config::default();
        config.dispatcher.secret = Some("top-secret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ttl_above_one_hour_is_rejected() {
        let mut config = Config::default();
        config.dispatcher.secret = Some("s".to_string());
        config.credential.ttl_s = 7200;
        assert!(config.validate().is_err());
    }
}
