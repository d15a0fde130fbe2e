//! Configuration management for knowsync
//!
//! Handles the ~/.knowsync/ directory and config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Overrides the home directory (mostly for tests)
pub const HOME_ENV: &str = "KNOWSYNC_HOME";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Local participant, written by `init` and `join`
    pub identity: Option<Identity>,
    #[serde(default)]
    pub review: ReviewConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_name: String,
    pub user_id: String,
}

/// Where review requests go
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub api_base: String,
    /// `owner/name`; derived from the `origin` remote when unset
    pub repository: Option<String>,
    /// Environment variable holding the API token
    pub token_env: String,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            repository: None,
            token_env: "GITHUB_TOKEN".to_string(),
        }
    }
}

/// Returns the path to the knowsync home directory (~/.knowsync)
pub fn knowsync_home() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV) {
        return Ok(PathBuf::from(home));
    }
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".knowsync"))
}

/// Returns paths to knowsync files
pub struct KnowsyncPaths {
    pub root: PathBuf,
    pub config: PathBuf,
}

impl KnowsyncPaths {
    pub fn new() -> Result<Self> {
        Ok(Self::at(knowsync_home()?))
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config: root.join("config.toml"),
            root,
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.root).context("Failed to create knowsync root")
    }
}

/// Load configuration from disk; a missing file yields the defaults
pub fn load_config() -> Result<Config> {
    load_config_from(&KnowsyncPaths::new()?.config)
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path).context("Failed to read config.toml")?;
    toml::from_str(&content).context("Failed to parse config.toml")
}

/// Save configuration to disk
pub fn save_config(config: &Config) -> Result<()> {
    let paths = KnowsyncPaths::new()?;
    paths.ensure_dirs()?;
    save_config_to(&paths.config, config)
}

pub fn save_config_to(path: &Path, config: &Config) -> Result<()> {
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(path, content).context("Failed to write config.toml")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_is_default() -> Result<()> {
        let dir = TempDir::new()?;
        let config = load_config_from(&dir.path().join("config.toml"))?;
        assert_eq!(config, Config::default());
        assert_eq!(config.review.token_env, "GITHUB_TOKEN");
        Ok(())
    }

    #[test]
    fn test_config_roundtrip() -> Result<()> {
        let dir = TempDir::new()?;
        let paths = KnowsyncPaths::at(dir.path());
        let config = Config {
            identity: Some(Identity {
                user_name: "alice".to_string(),
                user_id: "id-1".to_string(),
            }),
            review: ReviewConfig {
                repository: Some("acme/knowledge".to_string()),
                ..ReviewConfig::default()
            },
        };

        save_config_to(&paths.config, &config)?;
        assert_eq!(load_config_from(&paths.config)?, config);
        Ok(())
    }

    #[test]
    fn test_partial_review_section() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.toml");
        fs::write(&path, "[review]\ntoken_env = \"KNOWSYNC_TOKEN\"\n")?;

        let config = load_config_from(&path)?;
        assert!(config.identity.is_none());
        assert_eq!(config.review.token_env, "KNOWSYNC_TOKEN");
        assert_eq!(config.review.api_base, "https://api.github.com");
        Ok(())
    }
}
