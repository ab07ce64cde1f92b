//! Configuration loading
//!
//! Loads typed configuration from YAML, TOML, JSON, INI, RON or JSON5 files.
//!
//! - the format is picked from the file extension
//! - `${VAR}` and `$VAR` references are substituted from the environment
//!   before parsing
//! - files can be layered, and environment variables with a prefix can
//!   override individual keys (`EZIO_CACHE__CAPACITY=64`)

use config::{Config as Cfg, Environment, File};
use regex::Regex;
use serde::de::DeserializeOwned;
use std::path::Path;

pub use config::FileFormat;

#[cfg(test)]
mod tests;

/// Errors raised while loading configuration
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Detect configuration format from file extension
///
/// Recognised extensions: `yaml`, `yml`, `toml`, `json`, `ini`, `ron`, `json5`.
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        "ini" => Ok(FileFormat::Ini),
        "ron" => Ok(FileFormat::Ron),
        "json5" => Ok(FileFormat::Json5),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Substitute environment variables in a string
///
/// `${VAR_NAME}` is resolved first, then bare `$VAR_NAME`. References to
/// unset variables are left untouched.
pub fn substitute_env_vars(content: &str) -> ConfigResult<String> {
    let braced = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    let bare = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let resolve = |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    };

    let result = braced.replace_all(content, resolve).to_string();
    Ok(bare.replace_all(&result, resolve).to_string())
}

fn read_source(path: &str) -> ConfigResult<File<config::FileSourceString, FileFormat>> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    let substituted = substitute_env_vars(&content)?;
    Ok(File::from_str(&substituted, format))
}

fn finish<T>(builder: config::ConfigBuilder<config::builder::DefaultState>) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let config = builder
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    config
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

/// Load configuration from a single file
pub fn load_config<T>(path: &str) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    tracing::debug!(path, "loading configuration");
    finish(Cfg::builder().add_source(read_source(path)?))
}

/// Load configuration from a string with an explicit format
pub fn from_str<T>(content: &str, format: FileFormat) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let substituted = substitute_env_vars(content)?;
    finish(Cfg::builder().add_source(File::from_str(&substituted, format)))
}

/// Load several files, later files overriding earlier ones
pub fn load_merged<T>(paths: &[&str]) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let mut builder = Cfg::builder();
    for path in paths {
        builder = builder.add_source(read_source(path)?);
    }
    finish(builder)
}

/// Load a file and let prefixed environment variables override it
///
/// Nesting uses a double underscore: with prefix `EZIO`, the key
/// `cache.capacity` is overridden by `EZIO_CACHE__CAPACITY`.
pub fn load_with_env<T>(path: &str, env_prefix: &str) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let builder = Cfg::builder()
        .add_source(read_source(path)?)
        .add_source(env_source(env_prefix));
    finish(builder)
}

/// Build configuration purely from prefixed environment variables
///
/// Used when no file is given: defaults come from `#[serde(default)]` on the
/// target type.
pub fn from_env<T>(env_prefix: &str) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    finish(Cfg::builder().add_source(env_source(env_prefix)))
}

fn env_source(env_prefix: &str) -> Environment {
    Environment::with_prefix(env_prefix)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
