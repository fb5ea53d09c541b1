//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Where to find the external encoder tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EncoderConfig {
    /// Explicit path to the encoder executable (searched for if None)
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Directory searched first when locating the encoder
    #[serde(default)]
    pub resource_dir: Option<PathBuf>,
}

/// Queue supervisor tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Grace period between SIGTERM and SIGKILL when cancelling (default 2500)
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// How long a warning stays on screen before progress resumes (default 3000)
    #[serde(default = "default_warning_debounce_ms")]
    pub warning_debounce_ms: u64,
    /// Maximum display label length before it gets truncated (default 25)
    #[serde(default = "default_label_max_chars")]
    pub label_max_chars: usize,
}

fn default_cancel_grace_ms() -> u64 {
    2500
}

fn default_warning_debounce_ms() -> u64 {
    3000
}

fn default_label_max_chars() -> usize {
    25
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            cancel_grace_ms: default_cancel_grace_ms(),
            warning_debounce_ms: default_warning_debounce_ms(),
            label_max_chars: default_label_max_chars(),
        }
    }
}

impl QueueConfig {
    /// Grace period as a Duration
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Warning debounce window as a Duration
    pub fn warning_debounce(&self) -> Duration {
        Duration::from_millis(self.warning_debounce_ms)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - THEORA_QUEUE_ENCODER -> encoder.path
    /// - THEORA_QUEUE_RESOURCE_DIR -> encoder.resource_dir
    /// - THEORA_QUEUE_CANCEL_GRACE_MS -> queue.cancel_grace_ms
    /// - THEORA_QUEUE_WARNING_DEBOUNCE_MS -> queue.warning_debounce_ms
    /// - THEORA_QUEUE_LABEL_MAX_CHARS -> queue.label_max_chars
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("THEORA_QUEUE_ENCODER") {
            if !val.is_empty() {
                self.encoder.path = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("THEORA_QUEUE_RESOURCE_DIR") {
            if !val.is_empty() {
                self.encoder.resource_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("THEORA_QUEUE_CANCEL_GRACE_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.queue.cancel_grace_ms = ms;
            }
        }

        if let Ok(val) = env::var("THEORA_QUEUE_WARNING_DEBOUNCE_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.queue.warning_debounce_ms = ms;
            }
        }

        if let Ok(val) = env::var("THEORA_QUEUE_LABEL_MAX_CHARS") {
            if let Ok(chars) = val.parse::<usize>() {
                self.queue.label_max_chars = chars;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if !path.as_ref().exists() {
            let mut config = Self::default();
            config.apply_env_overrides();
            return Ok(config);
        }
        Self::load(path)
    }
}
