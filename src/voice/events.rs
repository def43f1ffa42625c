use std::net::SocketAddr;

use crate::{
    common::errors::VoiceError,
    gateway::session::types::SocketState,
    transport::GatewayPacket,
    voice::{
        rtp::{EncryptionMode, MediaCodec},
        udp_link::TransportPacket,
    },
};

#[derive(Debug)]
pub enum VoiceEvent {
    Open,
    Close { code: u16, reason: String },
    Warn(VoiceError),
    Packet(GatewayPacket),
    Ready,
    Killed,
    State(SocketState),
    /// The media transport was created and is running IP discovery.
    Transport {
        mode: EncryptionMode,
        ssrc: u32,
        remote: SocketAddr,
    },
    /// The session description arrived; frames can flow.
    TransportReady {
        audio_codec: Option<MediaCodec>,
        video_codec: Option<MediaCodec>,
        mode: EncryptionMode,
        transport_id: Option<String>,
    },
    MediaPacket(TransportPacket),
}

impl VoiceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close { .. } => "close",
            Self::Warn(_) => "warn",
            Self::Packet(_) | Self::MediaPacket(_) => "packet",
            Self::Ready => "ready",
            Self::Killed => "killed",
            Self::State(_) => "state",
            Self::Transport { .. } => "transport",
            Self::TransportReady { .. } => "transportReady",
        }
    }
}
