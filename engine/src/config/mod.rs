//! Configuration management
//!
//! This module handles loading, validation, and management of the Sift configuration.
//! Configuration is stored in TOML format at ~/.sift/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **llm**: LLM provider settings and per-call timeouts
//! - **pipeline**: Retry budget, sandbox deadline, prompt sizing, worker command
//! - **cache**: Result cache backend and TTL
//! - **limits**: Request validation and rate limits
//!
//! # Path Expansion
//!
//! The configuration system automatically:
//! - Expands ~ to the user's home directory
//! - Creates the data directory if it doesn't exist
//!
//! # Examples
//!
//! ```no_run
//! use sift_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("Data dir: {:?}", config.core.data_dir);
//! println!("Default provider: {}", config.llm.default_provider);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
///
/// Only `core` and `llm` are required in the file; the remaining sections
/// fall back to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// LLM provider configuration
    pub llm: LLMConfig,

    /// Pipeline behaviour
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Result cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Request validation and rate limiting
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Default LLM provider (ollama, openai, anthropic)
    pub default_provider: String,

    /// Per-call timeout for local providers (seconds)
    #[serde(default = "default_local_timeout")]
    pub local_timeout_secs: u64,

    /// Per-call timeout for cloud providers (seconds)
    #[serde(default = "default_cloud_timeout")]
    pub cloud_timeout_secs: u64,

    /// Ollama provider settings
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// OpenAI provider settings
    #[serde(default)]
    pub openai: OpenAIConfig,

    /// Anthropic provider settings
    #[serde(default)]
    pub anthropic: AnthropicConfig,
}

/// Ollama provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL for Ollama API
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_ollama_model")]
    pub model: String,
}

/// OpenAI provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    /// Base URL for OpenAI API
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_openai_model")]
    pub model: String,
    // Note: API key comes from the environment or OS keychain, not from config
}

/// Anthropic provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    /// Base URL for Anthropic API
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_anthropic_model")]
    pub model: String,
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of code regenerations after a rejection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wall-clock budget for one sandbox execution (seconds)
    #[serde(default = "default_sandbox_timeout")]
    pub sandbox_timeout_secs: u64,

    /// Sample rows per dataset included in prompts
    #[serde(default = "default_sample_rows")]
    pub sample_rows: usize,

    /// Characters of the serialized result shown to the explainer
    #[serde(default = "default_preview_chars")]
    pub result_preview_chars: usize,

    /// Program used to launch the sandbox worker. Defaults to the running
    /// executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_program: Option<PathBuf>,

    /// Arguments passed to the worker program
    #[serde(default = "default_worker_args")]
    pub worker_args: Vec<String>,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable the result cache
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Backend: "memory" or "sqlite"
    #[serde(default = "default_cache_backend")]
    pub backend: String,

    /// Time-to-live for cached results (seconds)
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// Maximum number of entries held by the memory backend
    #[serde(default = "default_cache_capacity")]
    pub max_entries: u64,
}

/// Request limits configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests allowed per session per minute
    #[serde(default = "default_per_minute")]
    pub requests_per_minute: i64,

    /// Requests allowed per session per hour
    #[serde(default = "default_per_hour")]
    pub requests_per_hour: i64,

    /// Maximum question length in characters
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.sift")
}

fn default_local_timeout() -> u64 {
    120
}

fn default_cloud_timeout() -> u64 {
    60
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}

fn default_ollama_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_anthropic_model() -> String {
    "claude-3-5-sonnet-20241022".to_string()
}

fn default_max_retries() -> u32 {
    2
}

fn default_sandbox_timeout() -> u64 {
    30
}

fn default_sample_rows() -> usize {
    5
}

fn default_preview_chars() -> usize {
    3000
}

fn default_worker_args() -> Vec<String> {
    vec!["sandbox-worker".to_string()]
}

fn default_cache_backend() -> String {
    "sqlite".to_string()
}

fn default_cache_ttl() -> u64 {
    1800
}

fn default_cache_capacity() -> u64 {
    10_000
}

fn default_per_minute() -> i64 {
    10
}

fn default_per_hour() -> i64 {
    200
}

fn default_max_query_chars() -> usize {
    2000
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            default_provider: "ollama".to_string(),
            local_timeout_secs: default_local_timeout(),
            cloud_timeout_secs: default_cloud_timeout(),
            ollama: OllamaConfig::default(),
            openai: OpenAIConfig::default(),
            anthropic: AnthropicConfig::default(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
        }
    }
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_openai_model(),
        }
    }
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            base_url: default_anthropic_base_url(),
            model: default_anthropic_model(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            sandbox_timeout_secs: default_sandbox_timeout(),
            sample_rows: default_sample_rows(),
            result_preview_chars: default_preview_chars(),
            worker_program: None,
            worker_args: default_worker_args(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: default_cache_backend(),
            ttl_secs: default_cache_ttl(),
            max_entries: default_cache_capacity(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_per_minute(),
            requests_per_hour: default_per_hour(),
            max_query_chars: default_max_query_chars(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            llm: LLMConfig::default(),
            pipeline: PipelineConfig::default(),
            cache: CacheConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn sandbox_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox_timeout_secs)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Config {
    /// Load configuration from the default location (~/.sift/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from an explicit path, or the default location
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load_or_create(),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        // Serialize before processing so the file keeps the portable ~ path
        let config = Self::default();
        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = config;
        config.validate_and_process()?;
        Ok(config)
    }

    /// Get the default configuration file path (~/.sift/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".sift").join("config.toml"))
    }

    /// Path of the SQLite database inside the data directory
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join("sift.db")
    }

    /// Validate and process configuration
    ///
    /// Validates enumerated fields and numeric ranges, expands ~ in the data
    /// directory and creates it if needed.
    pub fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let valid_providers = ["ollama", "openai", "anthropic"];
        if !valid_providers.contains(&self.llm.default_provider.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid default provider '{}'. Must be one of: {}",
                self.llm.default_provider,
                valid_providers.join(", ")
            )));
        }

        if self.llm.local_timeout_secs == 0 || self.llm.cloud_timeout_secs == 0 {
            return Err(EngineError::Config(
                "LLM timeouts must be greater than zero".to_string(),
            ));
        }

        if self.pipeline.sandbox_timeout_secs == 0 {
            return Err(EngineError::Config(
                "sandbox_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.pipeline.max_retries > 10 {
            return Err(EngineError::Config(
                "max_retries must be between 0 and 10".to_string(),
            ));
        }

        let valid_backends = ["memory", "sqlite"];
        if !valid_backends.contains(&self.cache.backend.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid cache backend '{}'. Must be one of: {}",
                self.cache.backend,
                valid_backends.join(", ")
            )));
        }

        if self.limits.requests_per_minute <= 0 || self.limits.requests_per_hour <= 0 {
            return Err(EngineError::Config(
                "Rate limits must be greater than zero".to_string(),
            ));
        }

        if self.limits.max_query_chars == 0 {
            return Err(EngineError::Config(
                "max_query_chars must be greater than zero".to_string(),
            ));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        if let Some(program) = &self.pipeline.worker_program {
            self.pipeline.worker_program = Some(expand_path(program)?);
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
pub(crate) fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_creation() {
        let config = Config::default();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.llm.default_provider, "ollama");
        assert_eq!(config.pipeline.max_retries, 2);
        assert_eq!(config.pipeline.sandbox_timeout_secs, 30);
        assert_eq!(config.cache.ttl_secs, 1800);
        assert_eq!(config.limits.requests_per_minute, 10);
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_path(&path).unwrap();

        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        let expanded = expand_path(&path).unwrap();

        assert_eq!(expanded, path);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_string = toml::to_string(&config).unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config.core.log_level, deserialized.core.log_level);
        assert_eq!(config.cache.backend, deserialized.cache.backend);
        assert_eq!(
            config.pipeline.worker_args,
            deserialized.pipeline.worker_args
        );
    }

    #[test]
    fn test_optional_sections_default() {
        let toml_string = r#"
            [core]
            log_level = "debug"

            [llm]
            default_provider = "openai"
        "#;
        let config: Config = toml::from_str(toml_string).unwrap();
        assert_eq!(config.pipeline.max_retries, 2);
        assert_eq!(config.cache.backend, "sqlite");
        assert_eq!(config.llm.openai.model, "gpt-4o-mini");
    }
}
