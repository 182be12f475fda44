//! Configuration Loader
//!
//! Layered configuration loading: built-in defaults, then an optional TOML
//! file, then `PIPELINE_`-prefixed environment variables. The file path
//! resolves from an explicit argument, the `PIPELINE_CONFIG` variable, or
//! `config/pipeline.toml` — in that order. Worker processes receive
//! `PIPELINE_CONFIG` from their parent so both sides load identical
//! settings.

use std::path::PathBuf;
use std::sync::Arc;

use config::{Config, Environment, File, FileFormat};
use tracing::debug;

use super::EngineConfig;
use crate::error::{EngineError, Result};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "PIPELINE_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";

/// Loaded configuration plus the path it came from, so the scheduler can
/// hand the same file to spawned worker processes.
pub struct ConfigManager {
    config: EngineConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with path auto-detection.
    pub fn load() -> Result<Arc<ConfigManager>> {
        let path = std::env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from_path(Some(path))
    }

    /// Load configuration from an explicit file path. A `None` or missing
    /// file yields defaults plus environment overrides.
    pub fn load_from_path(config_path: Option<PathBuf>) -> Result<Arc<ConfigManager>> {
        let mut builder = Config::builder();

        if let Some(path) = &config_path {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(
                File::from(path.clone())
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        let raw = builder
            .add_source(Environment::with_prefix("PIPELINE").separator("__"))
            .build()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;

        let config: EngineConfig = raw
            .try_deserialize()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;

        config.validate()?;

        debug!(
            base_path = %config.pipeline.base_path.display(),
            throttle_limit = config.pipeline.throttle_limit,
            "configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            config_path,
        }))
    }

    /// The loaded configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Path of the file this configuration came from, if any.
    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config_path.as_ref()
    }
}
