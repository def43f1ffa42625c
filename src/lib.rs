//! Client for a real-time chat gateway and its voice servers.
//!
//! [`GatewaySocket`] owns the control-plane WebSocket and spawns one
//! [`VoiceSocket`] per joined voice server. Media travels as encrypted RTP
//! over UDP through [`voice::MediaTransport`].

pub mod common;
pub mod configs;
pub mod gateway;
pub mod transport;
pub mod voice;

pub use common::errors::{ConfigError, GatewayError, VoiceError};
pub use configs::Config;
pub use gateway::{GatewayEvent, GatewaySocket, VoiceConnectOptions, VoiceStateOptions};
pub use voice::{EncryptionMode, FrameOptions, MediaKind, VoiceEvent, VoiceSocket};
