use serde::{Deserialize, Serialize};

use super::BucketConfig;
use crate::common::errors::ConfigError;
use crate::voice::constants::ENCRYPTION_MODES;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct VoiceConfig {
    pub api_version: u8,
    /// Crypto providers in order of preference.
    pub crypto_providers: Vec<String>,
    pub timeout_ms: u64,
    pub force_mode: Option<String>,
    pub receive: bool,
    pub video: bool,
    pub bucket: BucketConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            api_version: 5,
            crypto_providers: vec!["xsalsa20poly1305".to_string()],
            timeout_ms: 30_000,
            force_mode: None,
            receive: true,
            video: false,
            bucket: BucketConfig::default(),
        }
    }
}

impl VoiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(mode) = &self.force_mode {
            if !ENCRYPTION_MODES.contains(&mode.as_str()) {
                return Err(ConfigError::UnknownEncryptionMode(mode.clone()));
            }
        }
        Ok(())
    }
}
