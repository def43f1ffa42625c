use serde_json::Value;

use crate::{
    common::{errors::GatewayError, types::ServerId},
    gateway::session::types::SocketState,
    transport::GatewayPacket,
    voice::events::VoiceEvent,
};

/// Everything a [`crate::gateway::GatewaySocket`] and its voice sockets report.
#[derive(Debug)]
pub enum GatewayEvent {
    Open,
    Close { code: u16, reason: String },
    Warn(GatewayError),
    Packet(GatewayPacket),
    /// Routed dispatch, `t` and `d` of the frame.
    Dispatch { name: String, data: Value },
    Ready,
    State(SocketState),
    Killed,
    Voice { server_id: ServerId, event: VoiceEvent },
}

impl GatewayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close { .. } => "close",
            Self::Warn(_) => "warn",
            Self::Packet(_) => "packet",
            Self::Dispatch { .. } => "dispatch",
            Self::Ready => "ready",
            Self::State(_) => "state",
            Self::Killed => "killed",
            Self::Voice { event, .. } => event.name(),
        }
    }
}
