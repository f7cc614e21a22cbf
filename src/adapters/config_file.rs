//! JSON file [`ConfigPort`].
//!
//! Missing fields fall back to their defaults (`#[serde(default)]` on
//! [`LoopConfig`]), so a file only needs the values it overrides.  Both
//! load and save run [`LoopConfig::validate`].

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use log::{info, warn};

use crate::app::ports::ConfigPort;
use crate::config::LoopConfig;
use crate::error::ConfigError;

pub struct JsonConfigFile {
    path: PathBuf,
}

impl JsonConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load, or fall back to defaults when the file does not exist.
    pub fn load_or_default(&self) -> Result<LoopConfig, ConfigError> {
        match self.load() {
            Err(ConfigError::NotFound) => {
                info!("config: {} not found, using defaults", self.path.display());
                Ok(LoopConfig::default())
            }
            other => other,
        }
    }
}

impl ConfigPort for JsonConfigFile {
    fn load(&self) -> Result<LoopConfig, ConfigError> {
        let bytes = fs::read(&self.path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ConfigError::NotFound,
            _ => ConfigError::IoError,
        })?;
        let config: LoopConfig = serde_json::from_slice(&bytes).map_err(|e| {
            warn!("config: {} is not valid JSON: {e}", self.path.display());
            ConfigError::Corrupted
        })?;
        config.validate()?;
        info!("config: loaded {}", self.path.display());
        Ok(config)
    }

    fn save(&self, config: &LoopConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let json = serde_json::to_vec_pretty(config).map_err(|_| ConfigError::IoError)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json).map_err(|_| ConfigError::IoError)?;
        fs::rename(&tmp, &self.path).map_err(|_| ConfigError::IoError)?;
        info!("config: saved {} ({} bytes)", self.path.display(), json.len());
        Ok(())
    }
}
