//! Stream configuration file support.
//!
//! Layers, later wins: built-in defaults, `~/.tessera/config.toml`,
//! `./.tesserarc`, `TESSERA_*` environment variables, then command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_abstraction::StreamOptions;
use thiserror::Error;

use crate::cancel::DEFAULT_BUDGET;
use crate::typewriter::TypewriterConfig;

const DEFAULT_WATCHDOG_GRACE_MS: u64 = 1500;

/// Environment variable for the endpoint base URL.
pub const ENV_ENDPOINT: &str = "TESSERA_ENDPOINT";
/// Environment variable for the bearer token.
pub const ENV_TOKEN: &str = "TESSERA_TOKEN";
/// Environment variable for the default model.
pub const ENV_MODEL: &str = "TESSERA_MODEL";

/// Stream configuration. Unset values fall back to defaults when resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Base URL of the conversation API.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Bearer token sent with streaming requests.
    #[serde(default)]
    pub api_token: Option<String>,

    /// Session budget in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// How long the end-of-input watchdog waits before force-clearing flags.
    #[serde(default)]
    pub watchdog_grace_ms: Option<u64>,

    #[serde(default)]
    pub typewriter: TypewriterSection,

    #[serde(default)]
    pub model: ModelSection,
}

/// `[typewriter]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypewriterSection {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub min_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

/// `[model]` table: defaults for each turn's generation options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read or write a configuration file.
    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    /// Failed to parse configuration file.
    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl StreamConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize: {}", e)))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::ReadError(format!("Failed to create directory: {}", e)))?;
        }

        std::fs::write(path, content).map_err(|e| ConfigError::ReadError(format!("Failed to write file: {}", e)))
    }

    /// Default global configuration file path.
    pub fn default_global_path() -> PathBuf {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".tessera")
            .join("config.toml")
    }

    /// Default local configuration file path.
    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".tesserarc")
    }

    /// Discover and load the global and local configuration files.
    ///
    /// Missing files are skipped. Local config overrides global config.
    pub fn discover_and_load() -> ConfigResult<Self> {
        Self::load_layers(&[Self::default_global_path(), Self::default_local_path()])
    }

    /// Loads and merges `paths` in order, skipping the ones that do not exist.
    pub fn load_layers(paths: &[PathBuf]) -> ConfigResult<Self> {
        let mut config = Self::default();
        for path in paths {
            match Self::load_from_file(path) {
                Ok(layer) => config.merge(&layer),
                Err(ConfigError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(config)
    }

    /// Merge another configuration into this one.
    ///
    /// Values from `other` override values in `self` if they are Some.
    pub fn merge(&mut self, other: &Self) {
        fn take<T: Clone>(slot: &mut Option<T>, value: Option<&T>) {
            if let Some(value) = value {
                *slot = Some(value.clone());
            }
        }
        take(&mut self.endpoint, other.endpoint.as_ref());
        take(&mut self.api_token, other.api_token.as_ref());
        take(&mut self.timeout_secs, other.timeout_secs.as_ref());
        take(&mut self.watchdog_grace_ms, other.watchdog_grace_ms.as_ref());
        take(&mut self.typewriter.enabled, other.typewriter.enabled.as_ref());
        take(&mut self.typewriter.min_delay_ms, other.typewriter.min_delay_ms.as_ref());
        take(&mut self.typewriter.max_delay_ms, other.typewriter.max_delay_ms.as_ref());
        take(&mut self.model.model_id, other.model.model_id.as_ref());
        take(&mut self.model.temperature, other.model.temperature.as_ref());
        take(&mut self.model.max_tokens, other.model.max_tokens.as_ref());
        take(&mut self.model.system_prompt, other.model.system_prompt.as_ref());
    }

    /// Applies `TESSERA_*` variables as read by `lookup`.
    ///
    /// Empty values are ignored. Pass `|key| std::env::var(key).ok()` for
    /// the process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(endpoint) = get(ENV_ENDPOINT) {
            self.endpoint = Some(endpoint);
        }
        if let Some(token) = get(ENV_TOKEN) {
            self.api_token = Some(token);
        }
        if let Some(model) = get(ENV_MODEL) {
            self.model.model_id = Some(model);
        }
    }

    /// Rejects values the session cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::InvalidValue("timeout_secs must be greater than 0".to_string()));
        }
        let typewriter = self.typewriter_config();
        if typewriter.min_delay > typewriter.max_delay {
            return Err(ConfigError::InvalidValue(format!(
                "typewriter min_delay_ms ({}) exceeds max_delay_ms ({})",
                typewriter.min_delay.as_millis(),
                typewriter.max_delay.as_millis()
            )));
        }
        if let Some(temperature) = self.model.temperature
            && !(0.0..=2.0).contains(&temperature)
        {
            return Err(ConfigError::InvalidValue(format!(
                "temperature must be between 0 and 2, got {temperature}"
            )));
        }
        if let Some(endpoint) = &self.endpoint
            && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            return Err(ConfigError::InvalidValue(format!("endpoint must be an http(s) URL: {endpoint}")));
        }
        Ok(())
    }

    /// Session budget.
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.timeout_secs.map_or(DEFAULT_BUDGET, Duration::from_secs)
    }

    /// Grace period of the end-of-input watchdog.
    #[must_use]
    pub fn watchdog_grace(&self) -> Duration {
        Duration::from_millis(self.watchdog_grace_ms.unwrap_or(DEFAULT_WATCHDOG_GRACE_MS))
    }

    /// Resolved typewriter timing.
    #[must_use]
    pub fn typewriter_config(&self) -> TypewriterConfig {
        let defaults = TypewriterConfig::default();
        TypewriterConfig {
            enabled: self.typewriter.enabled.unwrap_or(defaults.enabled),
            min_delay: self.typewriter.min_delay_ms.map_or(defaults.min_delay, Duration::from_millis),
            max_delay: self.typewriter.max_delay_ms.map_or(defaults.max_delay, Duration::from_millis),
        }
    }

    /// Generation options filled from the `[model]` table.
    #[must_use]
    pub fn stream_options(&self) -> StreamOptions {
        let defaults = StreamOptions::default();
        StreamOptions {
            model_id: self.model.model_id.clone().unwrap_or(defaults.model_id),
            temperature: self.model.temperature.unwrap_or(defaults.temperature),
            max_tokens: self.model.max_tokens.unwrap_or(defaults.max_tokens),
            system_prompt: self.model.system_prompt.clone(),
            attachments: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let config_content = r#"
endpoint = "https://chat.example.com/api"
api_token = "secret"
timeout_secs = 120

[typewriter]
enabled = false
max_delay_ms = 25

[model]
model_id = "analyst-large"
temperature = 0.2
"#;
        std::fs::write(&config_path, config_content).unwrap();

        let config = StreamConfig::load_from_file(&config_path).unwrap();
        assert_eq!(config.endpoint.as_deref(), Some("https://chat.example.com/api"));
        assert_eq!(config.budget(), Duration::from_secs(120));
        assert_eq!(config.watchdog_grace(), Duration::from_millis(1500));

        let typewriter = config.typewriter_config();
        assert!(!typewriter.enabled);
        assert_eq!(typewriter.min_delay, Duration::from_millis(10));
        assert_eq!(typewriter.max_delay, Duration::from_millis(25));

        let options = config.stream_options();
        assert_eq!(options.model_id, "analyst-large");
        assert!((options.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(options.max_tokens, 4096);
    }

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.budget(), DEFAULT_BUDGET);
        assert_eq!(config.typewriter_config(), TypewriterConfig::default());
        assert_eq!(config.stream_options(), StreamOptions::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_layers_merge_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let global = temp_dir.path().join("global.toml");
        let local = temp_dir.path().join(".tesserarc");
        std::fs::write(&global, "endpoint = \"https://global\"\n[model]\nmodel_id = \"g\"\n").unwrap();
        std::fs::write(&local, "[model]\nmodel_id = \"l\"\n").unwrap();

        let missing = temp_dir.path().join("missing.toml");
        let config = StreamConfig::load_layers(&[global, missing, local]).unwrap();
        assert_eq!(config.endpoint.as_deref(), Some("https://global"));
        assert_eq!(config.model.model_id.as_deref(), Some("l"));
    }

    #[test]
    fn test_bad_layer_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.toml");
        std::fs::write(&path, "timeout_secs = \"soon\"").unwrap();
        assert!(matches!(StreamConfig::load_layers(&[path]), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_env_overrides_files() {
        let mut config = StreamConfig { endpoint: Some("https://file".to_string()), ..Default::default() };
        config.apply_env(|key| match key {
            ENV_ENDPOINT => Some("https://env".to_string()),
            ENV_MODEL => Some("env-model".to_string()),
            ENV_TOKEN => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.endpoint.as_deref(), Some("https://env"));
        assert_eq!(config.model.model_id.as_deref(), Some("env-model"));
        assert_eq!(config.api_token, None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_timeout = StreamConfig { timeout_secs: Some(0), ..Default::default() };
        assert!(matches!(zero_timeout.validate(), Err(ConfigError::InvalidValue(_))));

        let inverted = StreamConfig {
            typewriter: TypewriterSection { min_delay_ms: Some(50), max_delay_ms: Some(20), ..Default::default() },
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let hot = StreamConfig {
            model: ModelSection { temperature: Some(2.5), ..Default::default() },
            ..Default::default()
        };
        assert!(hot.validate().is_err());

        let not_http = StreamConfig { endpoint: Some("ftp://x".to_string()), ..Default::default() };
        assert!(not_http.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");
        let config = StreamConfig {
            endpoint: Some("https://chat.example.com".to_string()),
            watchdog_grace_ms: Some(250),
            ..Default::default()
        };
        config.save_to_file(&config_path).unwrap();
        assert_eq!(StreamConfig::load_from_file(&config_path).unwrap(), config);
    }
}
