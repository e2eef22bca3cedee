//! Integration tests for configuration management
//!
//! These tests verify that the Config struct can be properly loaded,
//! validated, and processed with path expansion.

use sift_engine::config::Config;
use std::time::Duration;
use tempfile::TempDir;

fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_config_toml_parsing() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("data");
    let path = write_config(
        &dir,
        &format!(
            r#"
[core]
log_level = "debug"
data_dir = "{}"

[llm]
default_provider = "ollama"
local_timeout_secs = 90

[llm.ollama]
base_url = "http://localhost:11434"
model = "llama3.1:8b"

[llm.openai]
model = "gpt-4o-mini"

[pipeline]
max_retries = 3
sandbox_timeout_secs = 10
sample_rows = 3

[cache]
backend = "memory"
ttl_secs = 60

[limits]
requests_per_minute = 5
"#,
            data_dir.display()
        ),
    );

    let config = Config::load_from_path(&path).unwrap();
    assert_eq!(config.core.log_level, "debug");
    assert_eq!(config.llm.local_timeout_secs, 90);
    assert_eq!(config.llm.cloud_timeout_secs, 60);
    assert_eq!(config.pipeline.max_retries, 3);
    assert_eq!(config.pipeline.sandbox_timeout(), Duration::from_secs(10));
    assert_eq!(config.pipeline.sample_rows, 3);
    assert_eq!(config.cache.backend, "memory");
    assert_eq!(config.cache.ttl(), Duration::from_secs(60));
    assert_eq!(config.limits.requests_per_minute, 5);
    assert_eq!(config.limits.requests_per_hour, 200);
    assert_eq!(config.database_path(), data_dir.join("sift.db"));
    // The data directory is created on load
    assert!(data_dir.is_dir());
}

#[test]
fn test_minimal_config_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        &format!(
            "[core]\ndata_dir = \"{}\"\n\n[llm]\ndefault_provider = \"anthropic\"\n",
            dir.path().join("data").display()
        ),
    );

    let config = Config::load_from_path(&path).unwrap();
    assert_eq!(config.core.log_level, "info");
    assert_eq!(config.pipeline.max_retries, 2);
    assert_eq!(config.pipeline.sandbox_timeout_secs, 30);
    assert_eq!(config.pipeline.worker_args, vec!["sandbox-worker"]);
    assert!(config.pipeline.worker_program.is_none());
    assert!(config.cache.enabled);
    assert_eq!(config.cache.backend, "sqlite");
    assert_eq!(config.llm.ollama.base_url, "http://localhost:11434");
}

#[test]
fn test_invalid_values_are_rejected() {
    let cases = [
        ("[core]\nlog_level = \"loud\"\n\n[llm]\ndefault_provider = \"ollama\"\n", "log level"),
        ("[core]\n\n[llm]\ndefault_provider = \"gemini\"\n", "provider"),
        (
            "[core]\n\n[llm]\ndefault_provider = \"ollama\"\n\n[cache]\nbackend = \"redis\"\n",
            "cache backend",
        ),
        (
            "[core]\n\n[llm]\ndefault_provider = \"ollama\"\n\n[pipeline]\nsandbox_timeout_secs = 0\n",
            "sandbox_timeout_secs",
        ),
        (
            "[core]\n\n[llm]\ndefault_provider = \"ollama\"\n\n[limits]\nrequests_per_hour = 0\n",
            "Rate limits",
        ),
    ];

    for (contents, expected) in cases {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, contents);
        let err = Config::load_from_path(&path).unwrap_err();
        assert!(
            err.to_string().contains(expected),
            "expected {:?} in {}",
            expected,
            err
        );
    }
}

#[test]
fn test_missing_llm_section_fails_to_parse() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[core]\nlog_level = \"info\"\n");
    let err = Config::load_from_path(&path).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config"));
}

#[test]
fn test_default_config_round_trips_through_toml() {
    let config = Config::default();
    let text = toml::to_string_pretty(&config).unwrap();
    let parsed: Config = toml::from_str(&text).unwrap();
    assert_eq!(parsed.llm.default_provider, config.llm.default_provider);
    assert_eq!(parsed.cache.ttl_secs, config.cache.ttl_secs);
    assert_eq!(parsed.limits.max_query_chars, config.limits.max_query_chars);
}
