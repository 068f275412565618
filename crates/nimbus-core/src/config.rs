use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a summary of all errors joined by "; "
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Request coalescing settings
    #[serde(default)]
    pub batch: BatchSettings,

    /// Retry policy for temperature sources
    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Window during which requests for the same location share one fetch
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Participant count that settles a batch before its window elapses
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,

    /// Settled batch records are kept for `window_ms * retention_multiplier`
    #[serde(default = "default_retention_multiplier")]
    pub retention_multiplier: u32,

    /// Upper bound on a batch's fetch, counted from when the batch opens (unbounded if unset)
    #[serde(default)]
    pub settle_timeout_ms: Option<u64>,
}

fn default_window_ms() -> u64 {
    5000
}

fn default_max_batch_size() -> u32 {
    10
}

fn default_retention_multiplier() -> u32 {
    5
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_batch_size: default_max_batch_size(),
            retention_multiplier: default_retention_multiplier(),
            settle_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        if !path.exists() {
            let config = Self::default();
            config.save_to(&path)?;
            return Ok(config);
        }
        Self::load_from(&path)
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration and reject it if validation reports errors.
    ///
    /// Warnings are logged and returned alongside the config.
    pub fn load_validated(path: &Path) -> Result<(Self, ValidationResult), ConfigError> {
        let config = Self::load_from(path)?;
        let validation = config.validate();

        if !validation.is_valid() {
            return Err(ConfigError::Invalid(validation.error_summary()));
        }

        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        Ok((config, validation))
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.batch.window_ms == 0 {
            result.add_error("batch.window_ms", "Batch window must be greater than 0");
        } else if self.batch.window_ms > 60_000 {
            result.add_warning(
                "batch.window_ms",
                "Batch window is longer than a minute; callers will wait that long",
            );
        }

        match self.batch.max_batch_size {
            0 => result.add_error("batch.max_batch_size", "Max batch size must be at least 1"),
            1 => result.add_warning(
                "batch.max_batch_size",
                "Max batch size of 1 disables request coalescing",
            ),
            _ => {}
        }

        if self.batch.retention_multiplier == 0 {
            result.add_error(
                "batch.retention_multiplier",
                "Retention multiplier must be at least 1",
            );
        }

        if let Some(timeout) = self.batch.settle_timeout_ms {
            if timeout == 0 {
                result.add_error(
                    "batch.settle_timeout_ms",
                    "Settle timeout must be greater than 0 when set",
                );
            } else if timeout < self.batch.window_ms {
                result.add_warning(
                    "batch.settle_timeout_ms",
                    "Settle timeout is shorter than the batch window; slow fetches fail before the window closes",
                );
            }
        }

        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            result.add_error(
                "retry.initial_delay_ms",
                "Initial retry delay exceeds the maximum delay",
            );
        }

        result
    }

    /// Save configuration to an explicit file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("nimbus");

        Ok(config_dir.join("config.toml"))
    }
}
