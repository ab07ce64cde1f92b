use super::*;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

#[derive(Debug, Deserialize, PartialEq)]
struct Sampling {
    interval_ms: u64,
    device: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq)]
struct TestConfig {
    name: String,
    sampling: Sampling,
}

fn create_test_file(dir: &TempDir, filename: &str, content: &str) -> PathBuf {
    let path = dir.path().join(filename);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_detect_format() {
    assert_eq!(detect_format("config.yaml").unwrap(), FileFormat::Yaml);
    assert_eq!(detect_format("config.yml").unwrap(), FileFormat::Yaml);
    assert_eq!(detect_format("config.toml").unwrap(), FileFormat::Toml);
    assert_eq!(detect_format("config.json").unwrap(), FileFormat::Json);
    assert_eq!(detect_format("config.ini").unwrap(), FileFormat::Ini);
    assert_eq!(detect_format("config.ron").unwrap(), FileFormat::Ron);
    assert_eq!(detect_format("config.json5").unwrap(), FileFormat::Json5);
    assert!(matches!(
        detect_format("config.txt"),
        Err(ConfigError::UnsupportedFormat(_))
    ));
    assert!(detect_format("config").is_err());
}

#[test]
fn test_substitute_braced_and_bare() {
    unsafe {
        std::env::set_var("EZIO_KT_SUB_HOST", "gpu-box");
        std::env::set_var("EZIO_KT_SUB_PORT", "9100");
    }
    let out = substitute_env_vars("host=${EZIO_KT_SUB_HOST} port=$EZIO_KT_SUB_PORT").unwrap();
    assert_eq!(out, "host=gpu-box port=9100");
}

#[test]
fn test_substitute_leaves_unknown_vars() {
    let out = substitute_env_vars("x=${EZIO_KT_DEFINITELY_UNSET}").unwrap();
    assert_eq!(out, "x=${EZIO_KT_DEFINITELY_UNSET}");
}

#[test]
fn test_from_str_toml_and_json() {
    let toml = r#"
name = "toml"

[sampling]
interval_ms = 500
"#;
    let cfg: TestConfig = from_str(toml, FileFormat::Toml).unwrap();
    assert_eq!(cfg.name, "toml");
    assert_eq!(cfg.sampling.interval_ms, 500);
    assert!(cfg.sampling.device.is_none());

    let json = r#"{ "name": "json", "sampling": { "interval_ms": 250, "device": "mock" } }"#;
    let cfg: TestConfig = from_str(json, FileFormat::Json).unwrap();
    assert_eq!(cfg.sampling.device.as_deref(), Some("mock"));
}

#[test]
fn test_load_config_yaml_file() {
    let dir = TempDir::new().unwrap();
    let path = create_test_file(
        &dir,
        "plane.yml",
        "name: yaml\nsampling:\n  interval_ms: 1000\n",
    );
    let cfg: TestConfig = load_config(path.to_str().unwrap()).unwrap();
    assert_eq!(cfg.name, "yaml");
    assert_eq!(cfg.sampling.interval_ms, 1000);
}

#[test]
fn test_load_config_missing_file_is_io_error() {
    let result: ConfigResult<TestConfig> = load_config("/nonexistent/ezio/plane.toml");
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

#[test]
fn test_load_config_type_mismatch() {
    let dir = TempDir::new().unwrap();
    let path = create_test_file(
        &dir,
        "bad.toml",
        "name = \"bad\"\n[sampling]\ninterval_ms = \"soon\"\n",
    );
    let result: ConfigResult<TestConfig> = load_config(path.to_str().unwrap());
    assert!(matches!(result, Err(ConfigError::Serialization(_))));
}

#[test]
fn test_load_merged_later_file_wins() {
    let dir = TempDir::new().unwrap();
    let base = create_test_file(
        &dir,
        "base.toml",
        "name = \"base\"\n[sampling]\ninterval_ms = 5000\n",
    );
    let local = create_test_file(&dir, "local.json", r#"{ "sampling": { "interval_ms": 100 } }"#);

    let cfg: TestConfig =
        load_merged(&[base.to_str().unwrap(), local.to_str().unwrap()]).unwrap();
    assert_eq!(cfg.name, "base");
    assert_eq!(cfg.sampling.interval_ms, 100);
}

#[test]
fn test_load_with_env_override() {
    let dir = TempDir::new().unwrap();
    let path = create_test_file(
        &dir,
        "plane.toml",
        "name = \"file\"\n[sampling]\ninterval_ms = 5000\n",
    );
    unsafe {
        std::env::set_var("EZIOKT_SAMPLING__INTERVAL_MS", "42");
    }
    let cfg: TestConfig = load_with_env(path.to_str().unwrap(), "EZIOKT").unwrap();
    assert_eq!(cfg.name, "file");
    assert_eq!(cfg.sampling.interval_ms, 42);
}
