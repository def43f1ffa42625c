use serde::{Deserialize, Serialize};

use crate::common::types::AnyResult;
use crate::configs::*;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn load() -> AnyResult<Self> {
        let config_path = if std::path::Path::new("config.toml").exists() {
            "config.toml"
        } else if std::path::Path::new("config.default.toml").exists() {
            "config.default.toml"
        } else {
            return Err("config.toml or config.default.toml not found".into());
        };

        println!("Loading configuration from: {}", config_path);

        let config_str = std::fs::read_to_string(config_path)?;
        if config_str.is_empty() {
            return Err(format!("{} is empty", config_path).into());
        }

        Self::parse(&config_str)
    }

    pub fn parse(raw: &str) -> AnyResult<Self> {
        let config: Config = toml::from_str(raw)?;
        config.gateway.validate()?;
        config.voice.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.gateway.api_version, 6);
        assert_eq!(config.voice.api_version, 5);
        assert_eq!(config.voice.timeout_ms, 30_000);
        assert!(config.logging.is_none());
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = Config::parse(
            r#"
            [gateway]
            compress = "none"
            shard_id = 1
            shard_count = 4

            [gateway.bucket]
            limit = 2
            window_ms = 1000

            [voice]
            force_mode = "xsalsa20_poly1305_suffix"
            video = true

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.gateway.compress().unwrap(), CompressMode::None);
        assert_eq!(config.gateway.shard_count, 4);
        assert_eq!(config.gateway.bucket.limit, 2);
        assert_eq!(config.gateway.reconnect_delay_ms, 5_000);
        assert!(config.voice.video);
        assert_eq!(
            config.logging.and_then(|l| l.level).as_deref(),
            Some("debug")
        );
    }

    #[test]
    fn unknown_force_mode_is_rejected() {
        let err = Config::parse("[voice]\nforce_mode = \"aead_aes256_gcm\"\n").unwrap_err();
        assert!(err.to_string().contains("aead_aes256_gcm"));
    }
}
