// TOML config adapter - Layered configuration from defaults, file and environment

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::errors::*;
use crate::domain::model::OutputSpec;
use crate::engine::PipelineTuning;

/// File looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "transcodex.toml";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(DomainError::BadArgs(format!("Unknown log format: {}", other))),
        }
    }
}

/// Logging section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `transcodex_cli=debug`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub pipeline: PipelineTuning,
    /// Output defaults applied before presets and command-line flags
    pub output: OutputSpec,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), DomainError> {
        self.pipeline
            .validate()
            .map_err(|e| DomainError::BadArgs(e.to_string()))?;
        self.output.validate()
    }
}

/// Environment variables and the settings they override
const ENV_MAPPINGS: &[(&str, &str)] = &[
    ("TRANSCODEX_LOG_LEVEL", "logging.level"),
    ("TRANSCODEX_LOG_FORMAT", "logging.format"),
    ("TRANSCODEX_STALL_TIMEOUT_MS", "pipeline.stall_timeout_ms"),
    ("TRANSCODEX_IDLE_WINDOW_MS", "pipeline.idle_window_ms"),
    ("TRANSCODEX_MAX_DECODE_QUEUE", "pipeline.max_decode_queue"),
];

/// TOML configuration adapter
pub struct TomlConfigAdapter {
    config: AppConfig,
    source: Option<PathBuf>,
}

impl TomlConfigAdapter {
    /// Start from built-in defaults
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
            source: None,
        }
    }

    /// Load the explicit file, or `transcodex.toml` if present
    pub fn load(path: Option<&Path>) -> Result<Self, DomainError> {
        let mut adapter = Self::new();
        match path {
            Some(path) => adapter.load_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    adapter.load_file(default_path)?;
                }
            }
        }
        Ok(adapter)
    }

    /// Replace the configuration with the contents of a TOML file
    pub fn load_file(&mut self, path: &Path) -> Result<(), DomainError> {
        if !path.exists() {
            return Err(DomainError::Io(format!(
                "Config file does not exist: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| DomainError::Io(format!("Failed to read config file: {}", e)))?;
        self.config = Self::parse(&content)?;
        self.source = Some(path.to_path_buf());
        info!("Loaded configuration from {}", path.display());
        Ok(())
    }

    /// Parse TOML content into a configuration
    pub fn parse(content: &str) -> Result<AppConfig, DomainError> {
        toml::from_str(content)
            .map_err(|e| DomainError::BadArgs(format!("Failed to parse TOML config: {}", e)))
    }

    /// Apply overrides from the process environment
    pub fn apply_environment(&mut self) -> Result<usize, DomainError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<usize, DomainError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut applied = 0;
        for (var, key) in ENV_MAPPINGS {
            let Some(value) = lookup(var) else { continue };
            self.set(key, &value)
                .map_err(|e| DomainError::BadArgs(format!("{}: {}", var, e)))?;
            info!("Found environment override: {} = {}", var, value);
            applied += 1;
        }
        Ok(applied)
    }

    /// Set one dotted key from a string value
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), DomainError> {
        let parse_u64 = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|e| DomainError::BadArgs(format!("Invalid number '{}': {}", v, e)))
        };
        match key {
            "logging.level" => self.config.logging.level = value.trim().to_string(),
            "logging.format" => self.config.logging.format = LogFormat::parse(value)?,
            "pipeline.stall_timeout_ms" => self.config.pipeline.stall_timeout_ms = parse_u64(value)?,
            "pipeline.idle_window_ms" => self.config.pipeline.idle_window_ms = parse_u64(value)?,
            "pipeline.max_decode_queue" => self.config.pipeline.max_decode_queue = parse_u64(value)? as usize,
            other => return Err(DomainError::BadArgs(format!("Unknown config key: {}", other))),
        }
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut AppConfig {
        &mut self.config
    }

    pub fn into_config(self) -> AppConfig {
        self.config
    }

    /// File the configuration was loaded from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String, DomainError> {
        toml::to_string_pretty(&self.config)
            .map_err(|e| DomainError::Internal(format!("Failed to serialize config: {}", e)))
    }
}

impl Default for TomlConfigAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::RateControl;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_parse_sections() {
        let config = TomlConfigAdapter::parse(
            r#"
            [logging]
            level = "debug"
            format = "json"

            [pipeline]
            stall_timeout_ms = 1000

            [output]
            video_codec = "vp09.00.31.08"
            rate_control = { mode = "variable", value = 3000000 }
            "#,
        )
        .unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.pipeline.stall_timeout_ms, 1000);
        assert_eq!(config.pipeline.poll_interval_ms, 100);
        assert_eq!(config.output.rate_control, RateControl::Variable(3_000_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(TomlConfigAdapter::parse("pipeline = [").is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TRANSCODEX_LOG_LEVEL", "warn"),
            ("TRANSCODEX_STALL_TIMEOUT_MS", "2500"),
        ]
        .into_iter()
        .collect();
        let mut adapter = TomlConfigAdapter::new();
        let applied = adapter
            .apply_env_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(applied, 2);
        assert_eq!(adapter.config().logging.level, "warn");
        assert_eq!(adapter.config().pipeline.stall_timeout_ms, 2500);
    }

    #[test]
    fn test_environment_rejects_bad_numbers() {
        let mut adapter = TomlConfigAdapter::new();
        let result = adapter.apply_env_from(|k| {
            (k == "TRANSCODEX_MAX_DECODE_QUEUE").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(DomainError::BadArgs(_))));
    }

    #[test]
    fn test_load_file_and_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pipeline]\nreorder_window = 8").unwrap();
        let adapter = TomlConfigAdapter::load(Some(file.path())).unwrap();
        assert_eq!(adapter.config().pipeline.reorder_window, 8);
        assert_eq!(adapter.source(), Some(file.path()));

        let rendered = adapter.to_toml().unwrap();
        let reparsed = TomlConfigAdapter::parse(&rendered).unwrap();
        assert_eq!(&reparsed, adapter.config());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = TomlConfigAdapter::load(Some(Path::new("/nonexistent/transcodex.toml")));
        assert!(matches!(result, Err(DomainError::Io(_))));
    }
}
