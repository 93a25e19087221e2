use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Result, TransferError};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub gmail: GmailConfig,
    pub imap: ImapConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailConfig {
    #[serde(default = "default_credentials_file")]
    pub credentials_file: String,
    #[serde(default = "default_token_cache_file")]
    pub token_cache_file: String,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            credentials_file: default_credentials_file(),
            token_cache_file: default_token_cache_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    #[serde(default)]
    pub server: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_use_ssl")]
    pub use_ssl: bool,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: default_imap_port(),
            username: String::new(),
            password: String::new(),
            use_ssl: default_use_ssl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Explicit Gmail label name -> destination IMAP folder name overrides.
    /// Labels not present here fall back to the folder mapper's cleaning rules.
    #[serde(default)]
    pub label_mappings: HashMap<String, String>,
    /// Number of messages handed to the uploader per fetch round.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Chunk size for Gmail message fetch requests (<= 25 per the Gmail Source contract).
    #[serde(default = "default_gmail_batch_size")]
    pub gmail_batch_size: usize,
    /// How many uploads between forced progress-file flushes.
    #[serde(default = "default_progress_save_interval")]
    pub progress_save_interval: usize,
    /// Progress file path (JSON, atomically written).
    #[serde(default = "default_progress_file")]
    pub progress_file: String,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            label_mappings: HashMap::new(),
            batch_size: default_batch_size(),
            gmail_batch_size: default_gmail_batch_size(),
            progress_save_interval: default_progress_save_interval(),
            progress_file: default_progress_file(),
        }
    }
}

fn default_credentials_file() -> String {
    "credentials.json".to_string()
}

fn default_token_cache_file() -> String {
    ".gmail-imap-transfer/token.json".to_string()
}

fn default_imap_port() -> u16 {
    993
}

fn default_use_ssl() -> bool {
    true
}

fn default_batch_size() -> usize {
    50
}

fn default_gmail_batch_size() -> usize {
    50
}

fn default_progress_save_interval() -> usize {
    50
}

fn default_progress_file() -> String {
    "progress.json".to_string()
}

impl Config {
    /// Load `path`, or fall back to a default-shaped config if it does not
    /// exist -- this is what lets `init-config`-style bootstrapping work
    /// without a chicken-and-egg config file requirement. The default is
    /// returned unvalidated (required fields like `imap.server` are empty
    /// placeholders); only a config actually read from disk is validated.
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(
                "No config file found at {:?}, using a default-shaped configuration",
                path
            );
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            TransferError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            TransferError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    TransferError::ConfigError(format!(
                        "Failed to create config directory: {}",
                        e
                    ))
                })?;
            }
        }

        let content = toml::to_string_pretty(self).map_err(|e| {
            TransferError::ConfigError(format!("Failed to serialize config: {}", e))
        })?;

        tokio::fs::write(path, content).await.map_err(|e| {
            TransferError::ConfigError(format!("Failed to write config file: {}", e))
        })?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate required fields and numeric ranges, mirroring the recognized
    /// options the transfer engine actually depends on (gmail/imap/settings).
    pub fn validate(&self) -> Result<()> {
        if self.gmail.credentials_file.is_empty() {
            return Err(TransferError::ConfigError(
                "gmail.credentials_file is required".to_string(),
            ));
        }

        if self.imap.server.is_empty() {
            return Err(TransferError::ConfigError(
                "imap.server is required".to_string(),
            ));
        }
        if self.imap.port == 0 {
            return Err(TransferError::ConfigError(
                "imap.port must be between 1 and 65535".to_string(),
            ));
        }
        if self.imap.username.is_empty() {
            return Err(TransferError::ConfigError(
                "imap.username is required".to_string(),
            ));
        }
        if self.imap.password.is_empty() {
            return Err(TransferError::ConfigError(
                "imap.password is required".to_string(),
            ));
        }

        if self.settings.batch_size == 0 {
            return Err(TransferError::ConfigError(
                "settings.batch_size must be at least 1".to_string(),
            ));
        }
        if self.settings.gmail_batch_size == 0 {
            return Err(TransferError::ConfigError(
                "settings.gmail_batch_size must be at least 1".to_string(),
            ));
        }
        if self.settings.progress_save_interval == 0 {
            return Err(TransferError::ConfigError(
                "settings.progress_save_interval must be at least 1".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file with placeholder IMAP credentials.
    pub async fn create_example(path: &Path) -> Result<()> {
        let mut config = Self {
            gmail: GmailConfig {
                credentials_file: default_credentials_file(),
                token_cache_file: default_token_cache_file(),
            },
            imap: ImapConfig {
                server: "imap.example.com".to_string(),
                port: default_imap_port(),
                username: "user@example.com".to_string(),
                password: "CHANGE_ME".to_string(),
                use_ssl: default_use_ssl(),
            },
            settings: SettingsConfig::default(),
        };
        config
            .settings
            .label_mappings
            .insert("[Gmail]/Sent Mail".to_string(), "Sent".to_string());
        config.save(path).await
    }
}
