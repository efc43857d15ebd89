//! Service configuration
//!
//! Layered loading: built-in defaults, then a YAML file, then environment
//! variables prefixed with `GATEWAYSRV_` (nested keys joined with `__`).

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{GatewaySrvError, Result};
use crate::pipeline::StageKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub log_level: String,
    /// When set, logs additionally go to a daily-rotated file in this directory
    pub log_dir: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "gatewaysrv".into(),
            log_level: "info".into(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file holding configuration and history tables
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "gateway.db".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PollConfig {
    /// Sleep between poll cycles, bounding the read rate
    pub quantum_ms: u64,
    /// Ceiling on simultaneous connect attempts across all devices
    pub connect_limit: usize,
    /// Per-attempt connect timeout, independent of the shutdown signal
    pub connect_timeout_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            quantum_ms: 50,
            connect_limit: 10,
            connect_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Ceiling on simultaneous broker connect attempts
    pub connect_limit: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { connect_limit: 10 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Queue length that forces an immediate flush
    pub batch_size: usize,
    /// Timer-driven flush cadence
    pub flush_interval_secs: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Ordered stage list. The conversion stage must run before any stage
    /// whose side effect should be suppressed for unchanged values.
    pub stages: Vec<StageKind>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: StageKind::default_order().to_vec(),
        }
    }
}

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    /// Load configuration from an optional YAML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed("GATEWAYSRV_").split("__"))
            .extract()
            .map_err(|e| GatewaySrvError::ConfigError(e.to_string()))
    }

    /// Validate cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.poll.connect_limit == 0 {
            return Err(GatewaySrvError::config("poll.connect_limit must be > 0"));
        }
        if self.broker.connect_limit == 0 {
            return Err(GatewaySrvError::config("broker.connect_limit must be > 0"));
        }
        if self.history.batch_size == 0 {
            return Err(GatewaySrvError::config("history.batch_size must be > 0"));
        }
        if self.pipeline.stages.is_empty() {
            return Err(GatewaySrvError::config("pipeline.stages must not be empty"));
        }
        Ok(())
    }

    pub fn poll_quantum(&self) -> Duration {
        Duration::from_millis(self.poll.quantum_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.poll.connect_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.history.flush_interval_secs)
    }
}
