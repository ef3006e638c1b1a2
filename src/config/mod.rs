//! Configuration storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ProbeResult;
use crate::probe::ServerUri;

/// Application configuration
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Servers probed when none are given on the command line
    pub servers: Vec<String>,
    /// Credential endpoint (e.g. http://127.0.0.1:3000/giveMeCredentials)
    pub credentials_url: Option<String>,
    /// Identity embedded in locally minted usernames
    pub identity: Option<String>,
    /// Per-server gathering timeout
    pub timeout_secs: Option<u64>,
    /// Whole-batch timeout, unbounded when unset
    pub batch_timeout_secs: Option<u64>,
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "turn-probe", "turn-probe")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // The credentials URL may carry a token in its query string
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// Add a server after validating it. Returns false if already present.
    pub fn add_server(&mut self, uri: &str) -> ProbeResult<bool> {
        let server: ServerUri = uri.trim().parse()?;
        if self.servers.iter().any(|s| s == server.as_str()) {
            return Ok(false);
        }
        self.servers.push(server.as_str().to_string());
        Ok(true)
    }

    /// Remove a server. Returns false if it was not configured.
    pub fn remove_server(&mut self, uri: &str) -> bool {
        let before = self.servers.len();
        self.servers.retain(|s| s != uri.trim());
        self.servers.len() != before
    }

    /// Zero is treated as unset.
    pub fn server_timeout(&self) -> Option<Duration> {
        self.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    /// Zero is treated as unset.
    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("turn-probe-{}", uuid::Uuid::new_v4()))
            .join("config.toml")
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = Config::load_from(&scratch_path()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server_timeout(), None);
    }

    #[test]
    fn test_save_and_reload() {
        let path = scratch_path();
        let mut config = Config {
            credentials_url: Some("http://127.0.0.1:3000/giveMeCredentials".into()),
            timeout_secs: Some(5),
            ..Default::default()
        };
        config.add_server("turn:1.2.3.4:443").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.server_timeout(), Some(Duration::from_secs(5)));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str("servers = [\"stun:1.2.3.4\"]\n").unwrap();
        assert_eq!(config.servers, vec!["stun:1.2.3.4"]);
        assert!(config.credentials_url.is_none());
        assert!(config.batch_timeout().is_none());
    }

    #[test]
    fn test_zero_timeouts_are_unset() {
        let config: Config = toml::from_str("timeout_secs = 0\nbatch_timeout_secs = 0\n").unwrap();
        assert_eq!(config.server_timeout(), None);
        assert_eq!(config.batch_timeout(), None);
    }

    #[test]
    fn test_add_remove_server() {
        let mut config = Config::default();
        assert!(config.add_server("turn:1.2.3.4:443").unwrap());
        assert!(!config.add_server(" turn:1.2.3.4:443 ").unwrap());
        assert!(config.add_server("http://nope").is_err());
        assert_eq!(config.servers.len(), 1);

        assert!(config.remove_server("turn:1.2.3.4:443"));
        assert!(!config.remove_server("turn:1.2.3.4:443"));
        assert!(config.servers.is_empty());
    }
}
