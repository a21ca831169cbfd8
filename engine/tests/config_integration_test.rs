//! Integration tests for configuration management
//!
//! These tests verify that configuration files are loaded, validated and
//! path-expanded, and that the loaded values reach the session settings.

use sdk::types::ThermalLevel;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

use vitalis_engine::config::Config;
use vitalis_engine::pressure::PressureSettings;
use vitalis_engine::session::GenerationSettings;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write config");
    file
}

#[test]
fn test_load_full_config_from_path() {
    let file = write_config(
        r#"
[core]
log_level = "debug"

[backend]
kind = "ollama"

[backend.ollama]
base_url = "http://192.168.1.20:11434/"
model = "llama3.2:3b"
keep_alive = "10m"
request_timeout_secs = 120

[generation]
flush_interval_secs = 0.25
flush_min_chars = 64
max_messages = 20
max_assistant_chars = 8000

[pressure]
thermal_poll_interval_secs = 3
thermal_cancel_level = "critical"
memory_poll_interval_secs = 1
memory_warning_ratio = 0.85

[prompt]
preamble = "You are a sleep coach."
max_record_chars = 1000
"#,
    );

    let config = Config::load_from_path(file.path()).unwrap();

    assert_eq!(config.core.log_level, "debug");
    assert_eq!(config.backend.ollama.model, "llama3.2:3b");
    assert_eq!(config.backend.ollama.keep_alive, "10m");
    assert_eq!(config.pressure.thermal_cancel_level, ThermalLevel::Critical);
    assert_eq!(config.prompt.preamble, "You are a sleep coach.");

    let generation = GenerationSettings::from_config(&config.generation);
    assert_eq!(generation.flush_interval, Duration::from_millis(250));
    assert_eq!(generation.flush_min_chars, 64);
    assert_eq!(generation.trim.max_messages, 20);
    assert_eq!(generation.trim.max_assistant_chars, 8000);

    let pressure = PressureSettings::from_config(&config.pressure);
    assert_eq!(pressure.thermal_poll_interval, Duration::from_secs(3));
    assert_eq!(pressure.cancel_at, ThermalLevel::Critical);
}

#[test]
fn test_minimal_config_uses_defaults() {
    let file = write_config("[core]\n");

    let config = Config::load_from_path(file.path()).unwrap();

    assert_eq!(config.core.log_level, "info");
    assert_eq!(config.backend.kind, "ollama");
    assert_eq!(config.backend.ollama.base_url, "http://localhost:11434");
    assert_eq!(config.generation.flush_min_chars, 32);
    assert_eq!(config.generation.max_messages, 12);
    assert_eq!(config.generation.max_assistant_chars, 16_000);
    assert_eq!(config.pressure.thermal_poll_interval_secs, 5);
    assert_eq!(config.pressure.thermal_cancel_level, ThermalLevel::Serious);
    assert!(config.prompt.metrics_path.is_none());
}

#[test]
fn test_prompt_paths_expand_tilde() {
    let file = write_config(
        r#"
[core]

[prompt]
metrics_path = "~/health/metrics.json"
records_path = "/var/lib/vitalis/records.txt"
"#,
    );

    let config = Config::load_from_path(file.path()).unwrap();
    let home = dirs::home_dir().unwrap();

    assert_eq!(
        config.prompt.metrics_path.unwrap(),
        home.join("health").join("metrics.json")
    );
    assert_eq!(
        config.prompt.records_path.unwrap(),
        std::path::PathBuf::from("/var/lib/vitalis/records.txt")
    );
}

#[test]
fn test_invalid_values_are_rejected() {
    let cases = [
        "[core]\nlog_level = \"verbose\"\n",
        "[core]\n[backend]\nkind = \"openai\"\n",
        "[core]\n[generation]\nflush_interval_secs = 0.0\n",
        "[core]\n[generation]\nflush_min_chars = 0\n",
        "[core]\n[generation]\nmax_messages = 0\n",
        "[core]\n[pressure]\nthermal_poll_interval_secs = 0\n",
        "[core]\n[pressure]\nmemory_warning_ratio = 1.5\n",
        "[core]\n[pressure]\nthermal_cancel_level = \"scorching\"\n",
        "[core]\n[prompt]\npreamble = \"   \"\n",
    ];

    for case in cases {
        let file = write_config(case);
        let result = Config::load_from_path(file.path());
        assert!(result.is_err(), "expected rejection of: {}", case);
    }
}

#[test]
fn test_malformed_toml_is_rejected() {
    let file = write_config("[core\nlog_level = ");
    let err = Config::load_from_path(file.path()).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config"));
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load_from_path(&dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_default_config_round_trips_through_toml() {
    let config = Config::default_config();
    let text = toml::to_string_pretty(&config).unwrap();

    let file = write_config(&text);
    let loaded = Config::load_from_path(file.path()).unwrap();

    assert_eq!(loaded.backend.ollama.model, config.backend.ollama.model);
    assert_eq!(loaded.prompt.preamble, config.prompt.preamble);
}
