//! Daemon configuration: the core runtime settings plus process wiring.

use blockwatch_core::{config, BlockwatchConfig, BlockwatchError, MasterKey, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration of `blockwatchd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Runtime settings, read from the top level of the file.
    #[serde(flatten)]
    pub core: BlockwatchConfig,
    /// JSON file holding jobs, blocks and the exception log.
    pub store_path: PathBuf,
    /// Base URL of the remote API.
    pub api_base_url: String,
    /// Application bearer token used for list lookups.
    pub app_bearer_token: Option<String>,
    /// Hex-encoded 32-byte key sealing persisted credentials.
    pub sealing_key_hex: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            core: BlockwatchConfig::default(),
            store_path: PathBuf::from("/var/lib/blockwatch/store.json"),
            api_base_url: String::from("https://api.twitter.com/1.1"),
            app_bearer_token: None,
            sealing_key_hex: None,
        }
    }
}

fn invalid(reason: impl Into<String>) -> BlockwatchError {
    BlockwatchError::InvalidConfig {
        reason: reason.into(),
    }
}

impl DaemonConfig {
    /// Loads a `.toml` or `.json` config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: DaemonConfig = config::load_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the core settings, the API URL and the sealing key.
    pub fn validate(&self) -> Result<()> {
        self.core.validate()?;
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://") {
            return Err(invalid(format!(
                "api_base_url must be an http(s) URL, got {:?}",
                self.api_base_url
            )));
        }
        self.sealing_key()?;
        Ok(())
    }

    /// The decoded sealing key, if one is configured.
    pub fn sealing_key(&self) -> Result<Option<MasterKey>> {
        let Some(encoded) = self.sealing_key_hex.as_deref() else {
            return Ok(None);
        };
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| invalid(format!("sealing_key_hex is not valid hex: {}", e)))?;
        MasterKey::from_slice(&bytes).map(Some)
    }
}
