//! Session configuration, read once when a session is opened.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Sentinel folder path meaning "no parent folder".
pub const ROOT_FOLDER: &str = "/";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Relay base URL, e.g. `https://relay.example.net`
    pub base_url: String,
    /// Static key sent with every request
    pub api_key: String,
    /// Id of the remote session the relay forwards calls to
    pub client_id: String,
    pub timeout_secs: u64,
    /// Default destination folder path (`A/B/C`), or [`ROOT_FOLDER`]
    pub folder: String,
    /// Default collection name; the document title is used when unset
    pub collection: Option<String>,
    /// Remote directory receiving uploaded assets
    pub asset_dir: String,
    /// Absolute vault location, stripped from local resource locators
    pub vault_root: Option<String>,
    /// Metadata field holding the document's stable identifier
    pub identity_field: String,
    /// Write resolved destination ids back into document metadata
    pub write_back: bool,
    /// Overwrite destination ids that are already set
    pub refresh_destination: bool,
    /// Run the link resolution pass after each batch
    pub resolve_links: bool,
    /// Keep going after a document fails
    pub continue_on_error: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            client_id: String::new(),
            timeout_secs: 30,
            folder: ROOT_FOLDER.to_string(),
            collection: None,
            asset_dir: "pagebridge-assets".to_string(),
            vault_root: None,
            identity_field: "pagebridge-id".to_string(),
            write_back: true,
            refresh_destination: false,
            resolve_links: true,
            continue_on_error: true,
        }
    }
}

impl SyncConfig {
    /// Load from a JSON file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("PAGEBRIDGE_URL") {
            config.base_url = url;
        }
        if let Ok(key) = std::env::var("PAGEBRIDGE_API_KEY") {
            config.api_key = key;
        }
        if let Ok(id) = std::env::var("PAGEBRIDGE_CLIENT_ID") {
            config.client_id = id;
        }
        if let Ok(folder) = std::env::var("PAGEBRIDGE_FOLDER") {
            config.folder = folder;
        }
        if let Ok(collection) = std::env::var("PAGEBRIDGE_COLLECTION") {
            config.collection = Some(collection).filter(|c| !c.is_empty());
        }
        if let Ok(dir) = std::env::var("PAGEBRIDGE_ASSET_DIR") {
            config.asset_dir = dir;
        }
        config
    }

    /// Overlay environment variables on top of a file-loaded config.
    pub fn with_env_overrides(mut self) -> Self {
        let env = Self::from_env();
        let defaults = Self::default();
        if env.base_url != defaults.base_url {
            self.base_url = env.base_url;
        }
        if env.api_key != defaults.api_key {
            self.api_key = env.api_key;
        }
        if env.client_id != defaults.client_id {
            self.client_id = env.client_id;
        }
        if env.folder != defaults.folder {
            self.folder = env.folder;
        }
        if env.collection.is_some() {
            self.collection = env.collection;
        }
        if env.asset_dir != defaults.asset_dir {
            self.asset_dir = env.asset_dir;
        }
        self
    }

    /// First missing credential or endpoint, if any.
    pub fn missing_setting(&self) -> Option<&'static str> {
        if self.base_url.trim().is_empty() {
            Some("base_url")
        } else if self.api_key.trim().is_empty() {
            Some("api_key")
        } else if self.client_id.trim().is_empty() {
            Some("client_id")
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity_field.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "identity_field",
                reason: "must not be empty".to_string(),
            });
        }
        if self.asset_dir.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "asset_dir",
                reason: "must not be empty".to_string(),
            });
        }
        if self.collection.as_deref().is_some_and(|c| c.contains('/')) {
            return Err(ConfigError::Invalid {
                field: "collection",
                reason: "collection names cannot contain '/'".to_string(),
            });
        }
        Ok(())
    }
}
