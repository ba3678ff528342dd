//! Shard configuration.
//!
//! Provides configuration via a `skipshard.toml` file, `SKSH_*`
//! environment variables, and runtime overrides.
//!
//! # Priority (highest to lowest)
//!
//! 1. Runtime overrides (constructed directly)
//! 2. Environment variables (`SKSH_*`)
//! 3. Configuration file (`skipshard.toml`)
//! 4. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to parse configuration from its source.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// A configuration value failed validation.
    #[error("invalid configuration value for '{key}': {message}")]
    InvalidValue {
        /// Configuration key that failed validation.
        key: String,
        /// Validation error message.
        message: String,
    },
}

/// Tunables for a shard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Number of skiplist levels. Compile-time in the original; exposed
    /// here as a runtime tunable bounded at `MAX_LEVEL_CEILING`.
    pub max_level: usize,
    /// Maximum key length in bytes.
    pub max_key_len: usize,
    /// Initial meta-file mapped capacity.
    pub default_meta_size: u64,
    /// Initial data-file mapped capacity.
    pub default_data_size: u64,
    /// Probability `p` used by `random_level`.
    pub p: f32,
    /// Capacity below which growth doubles; above it, growth is linear
    /// (see `growth_linear_step`).
    pub growth_doubling_ceiling: u64,
    /// Linear growth increment once `growth_doubling_ceiling` is passed.
    pub growth_linear_step: u64,
}

/// Absolute ceiling on `max_level`; node forward arrays are sized to
/// this at the type level so a configured `max_level` can never exceed
/// it without a rebuild.
pub const MAX_LEVEL_CEILING: usize = 32;

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            max_level: 32,
            max_key_len: 1024,
            default_meta_size: 1024 * 1024,
            default_data_size: 16 * 1024 * 1024,
            p: 0.25,
            growth_doubling_ceiling: 1024 * 1024 * 1024,
            growth_linear_step: 1024 * 1024 * 1024,
        }
    }
}

impl ShardConfig {
    /// Loads configuration from `skipshard.toml` in the current
    /// directory, layered over defaults and `SKSH_*` environment
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but fails to parse, or if
    /// validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("skipshard.toml")
    }

    /// Loads configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file fails to parse, or if validation
    /// fails.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SKSH_").split("_").lowercase(false));

        let cfg: Self = figment
            .extract()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_level == 0 || self.max_level > MAX_LEVEL_CEILING {
            return Err(ConfigError::InvalidValue {
                key: "max_level".to_string(),
                message: format!("must be in [1, {MAX_LEVEL_CEILING}]"),
            });
        }
        if !(0.0..1.0).contains(&self.p) {
            return Err(ConfigError::InvalidValue {
                key: "p".to_string(),
                message: "must be in [0.0, 1.0)".to_string(),
            });
        }
        if self.max_key_len == 0 || self.max_key_len > 64 * 1024 {
            return Err(ConfigError::InvalidValue {
                key: "max_key_len".to_string(),
                message: "must be in (0, 65536]".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ShardConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_p() {
        let mut cfg = ShardConfig::default();
        cfg.p = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_max_level() {
        let mut cfg = ShardConfig::default();
        cfg.max_level = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn from_toml_overrides_defaults() {
        let toml_str = "p = 0.5\nmax_key_len = 2048\n";
        let figment = Figment::new()
            .merge(Serialized::defaults(ShardConfig::default()))
            .merge(Toml::string(toml_str));
        let cfg: ShardConfig = figment.extract().unwrap();
        assert!((cfg.p - 0.5).abs() < f32::EPSILON);
        assert_eq!(cfg.max_key_len, 2048);
    }
}
