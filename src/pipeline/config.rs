//! Pipeline configuration.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `PEACH_*` environment variables. CLI flags are applied last by the caller
//! through the `with_*` builders.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The YAML configuration file could not be parsed.
    #[error("Invalid configuration file {path}: {message}")]
    InvalidFile { path: String, message: String },

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for one peach instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Transformation loop
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Sample rows shown to the model.
    pub sample_rows: usize,
    /// Wall-clock limit for one sandboxed run.
    pub sandbox_timeout: Duration,
    /// Interpreter used by the sandbox.
    pub python_bin: String,

    // Oracle
    /// Model name; empty means the client's default.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Limit for a single oracle call.
    pub oracle_timeout: Duration,
    /// Whether the router may consult the model.
    pub use_llm_fallback: bool,

    // Data
    /// Directory receiving output artifacts.
    pub output_dir: PathBuf,
    /// Workbook edited when no file is supplied.
    pub default_workbook: Option<PathBuf>,
    /// JSON passage index used for sheet resolution and answers.
    pub passages_path: Option<PathBuf>,
    /// Marker preceding the sheet name in passages.
    pub sheet_marker: String,
    /// Passages retrieved for knowledge answers.
    pub retrieval_k: usize,

    // History
    /// SQLite database holding conversation history.
    pub history_db: PathBuf,
    /// Attempts made when the history database is locked.
    pub store_retry_attempts: u32,
    /// Pause between those attempts.
    pub store_retry_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            sample_rows: 5,
            sandbox_timeout: Duration::from_secs(60),
            python_bin: "python3".to_string(),

            model: String::new(),
            temperature: 0.0,
            oracle_timeout: Duration::from_secs(120),
            use_llm_fallback: true,

            output_dir: PathBuf::from("data/outputs"),
            default_workbook: None,
            passages_path: None,
            sheet_marker: "Sheet: ".to_string(),
            retrieval_k: 10,

            history_db: PathBuf::from("data/history/conv_history.db"),
            store_retry_attempts: 5,
            store_retry_backoff: Duration::from_millis(200),
        }
    }
}

/// Optional overrides read from a YAML file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    max_retries: Option<u32>,
    sample_rows: Option<usize>,
    sandbox_timeout_secs: Option<u64>,
    python_bin: Option<String>,
    model: Option<String>,
    temperature: Option<f64>,
    oracle_timeout_secs: Option<u64>,
    use_llm_fallback: Option<bool>,
    output_dir: Option<PathBuf>,
    default_workbook: Option<PathBuf>,
    passages_path: Option<PathBuf>,
    sheet_marker: Option<String>,
    retrieval_k: Option<usize>,
    history_db: Option<PathBuf>,
    store_retry_attempts: Option<u32>,
    store_retry_backoff_ms: Option<u64>,
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, then `file` (if given), then the environment; validated.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match file {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PEACH_MAX_RETRIES`: Retries after the first attempt (default: 3)
    /// - `PEACH_SAMPLE_ROWS`: Sample rows in the prompt (default: 5)
    /// - `PEACH_SANDBOX_TIMEOUT_SECS`: Sandbox timeout (default: 60)
    /// - `PEACH_PYTHON_BIN`: Interpreter (default: python3)
    /// - `PEACH_MODEL`: Model name (default: client default)
    /// - `PEACH_TEMPERATURE`: Sampling temperature (default: 0.0)
    /// - `PEACH_ORACLE_TIMEOUT_SECS`: Oracle call timeout (default: 120)
    /// - `PEACH_USE_LLM_FALLBACK`: Routing fallback (default: true)
    /// - `PEACH_OUTPUT_DIR`: Output directory (default: data/outputs)
    /// - `PEACH_DEFAULT_WORKBOOK`: Workbook edited when no file is supplied
    /// - `PEACH_PASSAGES_PATH`: JSON passage index
    /// - `PEACH_SHEET_MARKER`: Sheet marker in passages (default: "Sheet: ")
    /// - `PEACH_RETRIEVAL_K`: Passages per knowledge answer (default: 10)
    /// - `PEACH_HISTORY_DB`: SQLite history path
    /// - `PEACH_STORE_RETRY_ATTEMPTS`: Attempts on a locked database (default: 5)
    /// - `PEACH_STORE_RETRY_BACKOFF_MS`: Pause between them (default: 200)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads defaults overridden by a YAML file. Unknown keys are rejected.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let file: ConfigFile =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::InvalidFile {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        let mut config = Self::default();
        config.apply_file(file);
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = file.sample_rows {
            self.sample_rows = v;
        }
        if let Some(v) = file.sandbox_timeout_secs {
            self.sandbox_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.python_bin {
            self.python_bin = v;
        }
        if let Some(v) = file.model {
            self.model = v;
        }
        if let Some(v) = file.temperature {
            self.temperature = v;
        }
        if let Some(v) = file.oracle_timeout_secs {
            self.oracle_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.use_llm_fallback {
            self.use_llm_fallback = v;
        }
        if let Some(v) = file.output_dir {
            self.output_dir = v;
        }
        if file.default_workbook.is_some() {
            self.default_workbook = file.default_workbook;
        }
        if file.passages_path.is_some() {
            self.passages_path = file.passages_path;
        }
        if let Some(v) = file.sheet_marker {
            self.sheet_marker = v;
        }
        if let Some(v) = file.retrieval_k {
            self.retrieval_k = v;
        }
        if let Some(v) = file.history_db {
            self.history_db = v;
        }
        if let Some(v) = file.store_retry_attempts {
            self.store_retry_attempts = v;
        }
        if let Some(v) = file.store_retry_backoff_ms {
            self.store_retry_backoff = Duration::from_millis(v);
        }
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("PEACH_MAX_RETRIES") {
            self.max_retries = parse_env_value(&val, "PEACH_MAX_RETRIES")?;
        }
        if let Ok(val) = std::env::var("PEACH_SAMPLE_ROWS") {
            self.sample_rows = parse_env_value(&val, "PEACH_SAMPLE_ROWS")?;
        }
        if let Ok(val) = std::env::var("PEACH_SANDBOX_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PEACH_SANDBOX_TIMEOUT_SECS")?;
            self.sandbox_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("PEACH_PYTHON_BIN") {
            self.python_bin = val;
        }

        if let Ok(val) = std::env::var("PEACH_MODEL") {
            self.model = val;
        }
        if let Ok(val) = std::env::var("PEACH_TEMPERATURE") {
            self.temperature = parse_env_value(&val, "PEACH_TEMPERATURE")?;
        }
        if let Ok(val) = std::env::var("PEACH_ORACLE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PEACH_ORACLE_TIMEOUT_SECS")?;
            self.oracle_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("PEACH_USE_LLM_FALLBACK") {
            self.use_llm_fallback = parse_env_bool(&val, "PEACH_USE_LLM_FALLBACK")?;
        }

        if let Ok(val) = std::env::var("PEACH_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("PEACH_DEFAULT_WORKBOOK") {
            self.default_workbook = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("PEACH_PASSAGES_PATH") {
            self.passages_path = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("PEACH_SHEET_MARKER") {
            self.sheet_marker = val;
        }
        if let Ok(val) = std::env::var("PEACH_RETRIEVAL_K") {
            self.retrieval_k = parse_env_value(&val, "PEACH_RETRIEVAL_K")?;
        }

        if let Ok(val) = std::env::var("PEACH_HISTORY_DB") {
            self.history_db = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("PEACH_STORE_RETRY_ATTEMPTS") {
            self.store_retry_attempts = parse_env_value(&val, "PEACH_STORE_RETRY_ATTEMPTS")?;
        }
        if let Ok(val) = std::env::var("PEACH_STORE_RETRY_BACKOFF_MS") {
            let ms: u64 = parse_env_value(&val, "PEACH_STORE_RETRY_BACKOFF_MS")?;
            self.store_retry_backoff = Duration::from_millis(ms);
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rows == 0 {
            return Err(ConfigError::ValidationFailed(
                "sample_rows must be greater than 0".to_string(),
            ));
        }

        if self.sandbox_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "sandbox_timeout must be greater than 0".to_string(),
            ));
        }

        if self.oracle_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "oracle_timeout must be greater than 0".to_string(),
            ));
        }

        if self.python_bin.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "python_bin cannot be empty".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationFailed(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if self.retrieval_k == 0 {
            return Err(ConfigError::ValidationFailed(
                "retrieval_k must be greater than 0".to_string(),
            ));
        }

        if self.store_retry_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "store_retry_attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builder method to set the sample row count.
    pub fn with_sample_rows(mut self, rows: usize) -> Self {
        self.sample_rows = rows;
        self
    }

    /// Builder method to set the sandbox timeout.
    pub fn with_sandbox_timeout(mut self, timeout: Duration) -> Self {
        self.sandbox_timeout = timeout;
        self
    }

    /// Builder method to set the interpreter.
    pub fn with_python_bin(mut self, python_bin: impl Into<String>) -> Self {
        self.python_bin = python_bin.into();
        self
    }

    /// Builder method to set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Builder method to set temperature.
    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    /// Builder method to set the oracle timeout.
    pub fn with_oracle_timeout(mut self, timeout: Duration) -> Self {
        self.oracle_timeout = timeout;
        self
    }

    /// Builder method to enable or disable the routing fallback.
    pub fn with_llm_fallback(mut self, enabled: bool) -> Self {
        self.use_llm_fallback = enabled;
        self
    }

    /// Builder method to set the output directory.
    pub fn with_output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = path.into();
        self
    }

    /// Builder method to set the default workbook.
    pub fn with_default_workbook(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_workbook = Some(path.into());
        self
    }

    /// Builder method to set the passage index.
    pub fn with_passages_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.passages_path = Some(path.into());
        self
    }

    /// Builder method to set the sheet marker.
    pub fn with_sheet_marker(mut self, marker: impl Into<String>) -> Self {
        self.sheet_marker = marker.into();
        self
    }

    /// Builder method to set the knowledge retrieval depth.
    pub fn with_retrieval_k(mut self, k: usize) -> Self {
        self.retrieval_k = k;
        self
    }

    /// Builder method to set the history database path.
    pub fn with_history_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.history_db = path.into();
        self
    }

    /// Builder method to set the store retry policy.
    pub fn with_store_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.store_retry_attempts = attempts;
        self.store_retry_backoff = backoff;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.sample_rows, 5);
        assert_eq!(config.oracle_timeout, Duration::from_secs(120));
        assert_eq!(config.sandbox_timeout, Duration::from_secs(60));
        assert_eq!(config.python_bin, "python3");
        assert!(config.use_llm_fallback);
        assert_eq!(config.sheet_marker, "Sheet: ");
        assert_eq!(config.retrieval_k, 10);
        assert_eq!(config.store_retry_attempts, 5);
        assert_eq!(config.store_retry_backoff, Duration::from_millis(200));
        assert!(config.default_workbook.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::new()
            .with_max_retries(1)
            .with_sample_rows(3)
            .with_model("gpt-4o")
            .with_temperature(0.2)
            .with_llm_fallback(false)
            .with_default_workbook("scenario.json")
            .with_store_retry(2, Duration::from_millis(10));

        assert_eq!(config.max_retries, 1);
        assert_eq!(config.sample_rows, 3);
        assert_eq!(config.model, "gpt-4o");
        assert!((config.temperature - 0.2).abs() < f64::EPSILON);
        assert!(!config.use_llm_fallback);
        assert_eq!(config.default_workbook, Some(PathBuf::from("scenario.json")));
        assert_eq!(config.store_retry_attempts, 2);
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(PipelineConfig::default().validate().is_ok());
        // Zero retries is a valid budget: a single attempt.
        assert!(PipelineConfig::default().with_max_retries(0).validate().is_ok());
    }

    #[test]
    fn test_validation_errors_name_the_field() {
        let cases = [
            (PipelineConfig::default().with_sample_rows(0), "sample_rows"),
            (
                PipelineConfig::default().with_sandbox_timeout(Duration::ZERO),
                "sandbox_timeout",
            ),
            (
                PipelineConfig::default().with_oracle_timeout(Duration::ZERO),
                "oracle_timeout",
            ),
            (PipelineConfig::default().with_python_bin(" "), "python_bin"),
            (PipelineConfig::default().with_temperature(3.0), "temperature"),
            (PipelineConfig::default().with_retrieval_k(0), "retrieval_k"),
            (
                PipelineConfig::default().with_store_retry(0, Duration::ZERO),
                "store_retry_attempts",
            ),
        ];
        for (config, field) in cases {
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains(field), "{} not in {}", field, err);
        }
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("peach.yaml");
        std::fs::write(
            &path,
            "max_retries: 1\noracle_timeout_secs: 30\ndefault_workbook: data/scenario.json\nuse_llm_fallback: false\n",
        )
        .expect("write");

        let config = PipelineConfig::from_yaml_file(&path).expect("loads");
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.oracle_timeout, Duration::from_secs(30));
        assert_eq!(
            config.default_workbook,
            Some(PathBuf::from("data/scenario.json"))
        );
        assert!(!config.use_llm_fallback);
        assert_eq!(config.sample_rows, 5);
    }

    #[test]
    fn test_yaml_unknown_key_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("peach.yaml");
        std::fs::write(&path, "max_retry: 2\n").expect("write");

        assert!(matches!(
            PipelineConfig::from_yaml_file(&path),
            Err(ConfigError::InvalidFile { .. })
        ));
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_env_value::<u32>(" 4 ", "K").expect("parses"), 4);
        assert!(parse_env_value::<u32>("four", "K").is_err());
        assert!(parse_env_bool("YES", "K").expect("parses"));
        assert!(!parse_env_bool("off", "K").expect("parses"));
        assert!(parse_env_bool("maybe", "K").is_err());
    }
}
