//! Configuration system for the sqlgate server
//!
//! Loads configuration from:
//! 1. config.yaml - operational settings (port, database, catalog files, routing)
//! 2. .env file - secrets (API keys)
//!
//! Environment variables always override config.yaml values.

use serde::{Deserialize, Serialize};
use sqlgate_orchestrator::OrchestratorConfig;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// DuckDB database file; in-memory when unset
    pub database: Option<String>,
    pub max_rows: Option<usize>,
    pub max_time_ms: Option<u64>,
    pub max_memory_mb: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            database: Some("data/demo.duckdb".to_string()),
            max_rows: Some(10_000),
            max_time_ms: Some(30_000),
            max_memory_mb: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or module-specific
    pub level: String,

    /// Output format: pretty, json, compact
    pub format: String,

    /// Output destination: stdout, file, both
    pub output: String,

    /// Directory for log files
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            directory: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// YAML or JSON file of templates and snippets
    pub templates: Option<String>,
    /// YAML file of composition chains; built-in chains when unset
    pub chains: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            templates: Some("templates.yaml".to_string()),
            chains: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub model: String,
    pub temperature: f32,
    pub max_retries: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub execution: ExecutionConfig,
    pub logging: LoggingConfig,
    pub catalog: CatalogConfig,
    pub generation: GenerationConfig,
    pub routing: OrchestratorConfig,
}

impl Config {
    /// Load configuration from YAML file with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&contents)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(host) = var("SQLGATE_SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("SQLGATE_SERVER_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                name: "SQLGATE_SERVER_PORT".to_string(),
                value: port.clone(),
            })?;
        }

        if let Some(database) = var("SQLGATE_DATABASE") {
            self.execution.database = (!database.is_empty()).then_some(database);
        }
        if let Some(templates) = var("SQLGATE_TEMPLATES") {
            self.catalog.templates = Some(templates);
        }
        if let Some(chains) = var("SQLGATE_CHAINS") {
            self.catalog.chains = Some(chains);
        }
        if let Some(model) = var("SQLGATE_MODEL") {
            self.generation.model = model;
        }

        if let Some(level) = var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Some(format) = var("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(output) = var("LOG_OUTPUT") {
            self.logging.output = output;
        }
        if let Some(dir) = var("LOG_DIR") {
            self.logging.directory = dir;
        }

        Ok(())
    }

    /// Get OpenAI API key from environment (must be in .env)
    pub fn openai_api_key() -> Result<String, ConfigError> {
        std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENAI_API_KEY".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.logging.output, "stdout");
        assert_eq!(config.routing.template_threshold, 0.35);
        assert_eq!(config.generation.model, "gpt-4o-mini");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r#"
server:
  port: 9000
routing:
  template_threshold: 0.5
  allowed_intents: [temporal_proximity_query]
"#
        )
        .unwrap();

        let config = Config::from_yaml_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.routing.template_threshold, 0.5);
        assert_eq!(config.routing.snippet_threshold, 0.30);
        assert!(!config.routing.allows_intent("operational_metrics"));
        assert_eq!(config.execution.max_rows, Some(10_000));
    }

    #[test]
    fn test_env_var_override() {
        let env = HashMap::from([
            ("SQLGATE_SERVER_PORT", "9090"),
            ("SQLGATE_DATABASE", "/tmp/clinic.duckdb"),
            ("LOG_FORMAT", "json"),
        ]);
        let mut config = Config::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.execution.database.as_deref(), Some("/tmp/clinic.duckdb"));
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.output, "stdout");
    }

    #[test]
    fn test_sample_files_parse() {
        let config = Config::from_yaml_str(include_str!("../../../config.yaml")).unwrap();
        assert_eq!(config.catalog.templates.as_deref(), Some("templates.yaml"));
        assert_eq!(config.routing.max_snippets, 5);

        let (catalog, report) =
            sqlgate_catalog::TemplateCatalog::from_yaml_str(include_str!("../../../templates.yaml")).unwrap();
        assert!(report.skipped.is_empty(), "skipped: {:?}", report.skipped);
        assert_eq!(catalog.snippets_for_intent("temporal_proximity_query").len(), 4);
    }

    #[test]
    fn test_bad_port_is_reported() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|name| (name == "SQLGATE_SERVER_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
