use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::errors::ConfigError;

/// Wire encoding of gateway frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Etf,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Etf => "etf",
        }
    }
}

impl FromStr for Encoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "etf" => Ok(Self::Etf),
            _ => Err(ConfigError::InvalidEncoding(s.to_string())),
        }
    }
}

/// Transport compression negotiated through the `compress` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressMode {
    None,
    ZlibStream,
}

impl CompressMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ZlibStream => "zlib-stream",
        }
    }
}

impl FromStr for CompressMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" | "false" => Ok(Self::None),
            "zlib-stream" | "zlib" | "true" => Ok(Self::ZlibStream),
            _ => Err(ConfigError::InvalidCompress(s.to_string())),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BucketConfig {
    pub limit: usize,
    pub window_ms: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            limit: 120,
            window_ms: 60_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IdentifyProperties {
    #[serde(rename = "$os")]
    pub os: String,
    #[serde(rename = "$browser")]
    pub browser: String,
    #[serde(rename = "$device")]
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            browser: concat!("relaylink/", env!("CARGO_PKG_VERSION")).to_string(),
            device: concat!("relaylink v", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub url: String,
    pub api_version: u8,
    pub encoding: String,
    pub compress: String,
    pub shard_id: u32,
    pub shard_count: u32,
    pub large_threshold: u32,
    pub guild_subscriptions: bool,
    pub intents: Option<u64>,
    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub reconnect_max: u32,
    pub ping_timeout_ms: u64,
    pub bucket: BucketConfig,
    /// Sent verbatim as the identify presence.
    pub presence: Option<serde_json::Value>,
    pub properties: IdentifyProperties,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "wss://gateway.discord.gg".to_string(),
            api_version: 6,
            encoding: "json".to_string(),
            compress: "zlib-stream".to_string(),
            shard_id: 0,
            shard_count: 1,
            large_threshold: 250,
            guild_subscriptions: true,
            intents: None,
            auto_reconnect: true,
            reconnect_delay_ms: 5_000,
            reconnect_max: 5,
            ping_timeout_ms: 1_000,
            bucket: BucketConfig::default(),
            presence: None,
            properties: IdentifyProperties::default(),
        }
    }
}

impl GatewayConfig {
    pub fn encoding(&self) -> Result<Encoding, ConfigError> {
        self.encoding.parse()
    }

    pub fn compress(&self) -> Result<CompressMode, ConfigError> {
        self.compress.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.encoding()?;
        self.compress()?;
        if self.shard_count <= self.shard_id {
            return Err(ConfigError::InvalidShard {
                id: self.shard_id,
                count: self.shard_count,
            });
        }
        if self.url.is_empty() {
            return Err(ConfigError::MissingUrl);
        }
        url::Url::parse(&self.url).map_err(|_| ConfigError::InvalidUrl(self.url.clone()))?;
        Ok(())
    }
}
