use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::cleanup::DEFAULT_BATCH_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub cleanup_batch_size: usize,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            cleanup_batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    cleanup_batch_size: Option<usize>,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    InvalidBatchSize,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{err}"),
            Self::Yaml(err) => write!(f, "{err}"),
            Self::InvalidBatchSize => write!(f, "cleanup_batch_size must be at least 1"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Yaml(value)
    }
}

/// Loads the optional store config; a missing file means defaults.
pub fn load_config(path: &Path) -> Result<EffectiveConfig, ConfigError> {
    if !path.exists() {
        return Ok(EffectiveConfig::default());
    }
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

fn parse_config(content: &str) -> Result<EffectiveConfig, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(content)?;
    let cleanup_batch_size = raw.cleanup_batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
    if cleanup_batch_size == 0 {
        return Err(ConfigError::InvalidBatchSize);
    }
    Ok(EffectiveConfig { cleanup_batch_size })
}

pub fn default_config_yaml() -> String {
    format!("cleanup_batch_size: {DEFAULT_BATCH_SIZE}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config(&dir.path().join("config.yml")).expect("load");
        assert_eq!(config, EffectiveConfig::default());
    }

    #[test]
    fn parses_batch_size() {
        let config = parse_config("cleanup_batch_size: 25\n").expect("parse");
        assert_eq!(config.cleanup_batch_size, 25);
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = parse_config("{}\n").expect("parse");
        assert_eq!(config.cleanup_batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(matches!(
            parse_config("cleanup_batch_size: 0\n"),
            Err(ConfigError::InvalidBatchSize)
        ));
    }

    #[test]
    fn default_yaml_round_trips() {
        let config = parse_config(&default_config_yaml()).expect("parse default");
        assert_eq!(config, EffectiveConfig::default());
    }
}
