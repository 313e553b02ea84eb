use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::notify::NotificationsConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Failed to create config directory")]
    CreateDirError,
}

/// Which prompt the automatic pipeline uses: write the article with the LLM
/// or only lay out the text that arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoMode {
    Llm,
    FormatOnly,
}

impl Default for AutoMode {
    fn default() -> Self {
        AutoMode::Llm
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// "openai", "anthropic" or "ollama".
    pub provider: String,
    /// Falls back to the provider's environment variable when empty.
    #[serde(default)]
    pub api_key: String,
    /// Provider default model when empty.
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub ollama_url: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            api_key: String::new(),
            model: String::new(),
            ollama_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmsConfig {
    pub base_url: String,
    #[serde(default)]
    pub username: String,
    /// Falls back to the keyring, then CMS_PASSWORD, when empty.
    #[serde(default)]
    pub password: String,
}

impl Default for CmsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.voce.it".to_string(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_path: String,
    pub attachments_dir: String,
    /// Seconds between sync passes.
    pub poll_interval_secs: u64,
    /// Bare addresses whose messages are processed automatically.
    #[serde(default)]
    pub monitored_senders: Vec<String>,
    #[serde(default)]
    pub auto_mode: AutoMode,
    /// Fetch only unseen messages during incremental sync.
    #[serde(default)]
    pub only_unseen: bool,
    /// Default IMAP server offered when adding a mailbox.
    #[serde(default = "default_imap_server")]
    pub default_imap_server: String,
    #[serde(default = "default_imap_port")]
    pub default_imap_port: u16,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub cms: CmsConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

fn default_imap_server() -> String {
    "imap.register.it".to_string()
}

fn default_imap_port() -> u16 {
    993
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "~/.config/newsdesk/newsdesk.db".to_string(),
            attachments_dir: "~/.config/newsdesk/attachments".to_string(),
            poll_interval_secs: 60,
            monitored_senders: Vec::new(),
            auto_mode: AutoMode::default(),
            only_unseen: false,
            default_imap_server: default_imap_server(),
            default_imap_port: default_imap_port(),
            generator: GeneratorConfig::default(),
            cms: CmsConfig::default(),
            notifications: NotificationsConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let path = Path::new(path);

        // A missing file is a fresh install, not an error.
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| ConfigError::CreateDirError)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database_path).to_string())
    }

    /// Attachments directory with `~` expanded.
    pub fn attachments_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.attachments_dir).to_string())
    }
}

/// Default location of the config file.
pub fn default_config_path() -> String {
    dirs::config_dir()
        .map(|dir| dir.join("newsdesk").join("config.json"))
        .map(|path| path.to_string_lossy().to_string())
        .unwrap_or_else(|| "~/.config/newsdesk/config.json".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::load("/nonexistent/newsdesk/config.json").unwrap();
        assert_eq!(config.poll_interval_secs, 60);
        assert_eq!(config.auto_mode, AutoMode::Llm);
        assert!(config.monitored_senders.is_empty());
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let path = path.to_string_lossy();

        let mut config = Config::default();
        config.poll_interval_secs = 120;
        config.monitored_senders = vec!["stampa@comune.carpi.mo.it".to_string()];
        config.auto_mode = AutoMode::FormatOnly;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.poll_interval_secs, 120);
        assert_eq!(loaded.monitored_senders.len(), 1);
        assert_eq!(loaded.auto_mode, AutoMode::FormatOnly);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"database_path": "/tmp/n.db", "attachments_dir": "/tmp/a", "poll_interval_secs": 30}"#,
        )
        .unwrap();

        let loaded = Config::load(&path.to_string_lossy()).unwrap();
        assert_eq!(loaded.poll_interval_secs, 30);
        assert_eq!(loaded.default_imap_port, 993);
        assert_eq!(loaded.generator.provider, "openai");
        assert!(!loaded.notifications.email.enabled);
    }
}
