//! Layered configuration: built-in defaults, overridden by a TOML config
//! file, overridden by environment variables.

use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::codec::EncryptionKey;
use crate::error::{Error, Result};

pub const DEFAULT_MAX_ATTACHMENT_SIZE: u64 = 8 * 1024 * 1024;
pub const DEFAULT_RESYNC_PERIOD_SECS: u64 = 180;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatFsConfig {
    pub guild_id: String,
    #[serde(default = "default_db_channel_name")]
    pub db_channel_name: String,
    #[serde(default = "default_data_channel_name")]
    pub data_channel_name: String,
    pub local_path: PathBuf,
    #[serde(default)]
    pub encryption_key_base64: Option<String>,
    #[serde(default = "default_max_attachment_size")]
    pub max_attachment_size: u64,
    #[serde(default = "default_resync_period_secs")]
    pub resync_period_secs: u64,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// The chat identity this process authenticates as. Used to recognize
    /// bootstrap/index messages it authored itself when the cache holding
    /// the pinned index message id is empty.
    pub bot_id: String,
}

fn default_db_channel_name() -> String {
    "chatfs-index".to_string()
}

fn default_data_channel_name() -> String {
    "chatfs-data".to_string()
}

fn default_max_attachment_size() -> u64 {
    DEFAULT_MAX_ATTACHMENT_SIZE
}

fn default_resync_period_secs() -> u64 {
    DEFAULT_RESYNC_PERIOD_SECS
}

impl ChatFsConfig {
    /// Loads configuration by layering defaults, an optional TOML file, then
    /// environment variable overrides, in that order.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut value = toml::Value::Table(toml::map::Map::new());

        if let Some(path) = config_path {
            let text = std::fs::read_to_string(path)?;
            value = toml::from_str(&text).map_err(|e| Error::InvalidConfig {
                message: format!("failed to parse config file {}: {e}", path.display()),
            })?;
        }

        let mut config: ChatFsConfig = value.try_into().map_err(|e: toml::de::Error| {
            Error::InvalidConfig {
                message: format!("invalid configuration: {e}"),
            }
        })?;

        apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.guild_id.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "guild_id must not be empty".to_string(),
            });
        }
        if self.bot_id.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "bot_id must not be empty".to_string(),
            });
        }
        if self.max_attachment_size == 0 {
            return Err(Error::InvalidConfig {
                message: "max_attachment_size must be greater than zero".to_string(),
            });
        }
        if let Some(key) = &self.encryption_key_base64 {
            self.decode_encryption_key_from(key)?;
        }
        Ok(())
    }

    pub fn encryption_key(&self) -> Result<Option<EncryptionKey>> {
        match &self.encryption_key_base64 {
            Some(key) => Ok(Some(self.decode_encryption_key_from(key)?)),
            None => Ok(None),
        }
    }

    fn decode_encryption_key_from(&self, encoded: &str) -> Result<EncryptionKey> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::InvalidConfig {
                message: format!("encryption_key is not valid base64: {e}"),
            })?;
        bytes.try_into().map_err(|bytes: Vec<u8>| Error::InvalidConfig {
            message: format!(
                "encryption_key must decode to exactly 32 bytes, got {}",
                bytes.len()
            ),
        })
    }
}

fn apply_env_overrides(config: &mut ChatFsConfig) {
    if let Ok(v) = std::env::var("CHATFS_GUILD_ID") {
        config.guild_id = v;
    }
    if let Ok(v) = std::env::var("CHATFS_DB_CHANNEL") {
        config.db_channel_name = v;
    }
    if let Ok(v) = std::env::var("CHATFS_DATA_CHANNEL") {
        config.data_channel_name = v;
    }
    if let Ok(v) = std::env::var("CHATFS_LOCAL_PATH") {
        config.local_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("CHATFS_ENCRYPTION_KEY") {
        config.encryption_key_base64 = Some(v);
    }
    if let Ok(v) = std::env::var("CHATFS_MAX_ATTACHMENT_SIZE") {
        if let Ok(n) = v.parse() {
            config.max_attachment_size = n;
        }
    }
    if let Ok(v) = std::env::var("CHATFS_RESYNC_PERIOD_SECS") {
        if let Ok(n) = v.parse() {
            config.resync_period_secs = n;
        }
    }
    if let Ok(v) = std::env::var("CHATFS_BOT_TOKEN") {
        config.bot_token = Some(v);
    }
    if let Ok(v) = std::env::var("CHATFS_API_BASE_URL") {
        config.api_base_url = Some(v);
    }
    if let Ok(v) = std::env::var("CHATFS_BOT_ID") {
        config.bot_id = v;
    }
}
