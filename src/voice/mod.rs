pub mod constants;
pub mod encryption;
pub mod events;
pub mod rtp;
pub mod session;
pub mod udp_link;

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc::UnboundedSender, oneshot};

use crate::{
    common::{errors::VoiceError, types::ServerId},
    gateway::VoiceStateOptions,
    transport::ping::PingReply,
};

pub use encryption::{CryptoProvider, PacketCipher, XSalsaProvider, resolve_provider};
pub use events::VoiceEvent;
pub use rtp::{EncryptionMode, FrameOptions, MediaCodec, MediaKind, RtpHeader, RtpNonce};
pub use session::{VoiceContext, spawn};
pub use udp_link::{MediaTransport, TransportPacket};

/// Resolves a caller waiting for a voice session to become ready.
pub type WaiterReply = oneshot::Sender<Result<VoiceSocket, VoiceError>>;

pub enum VoiceCommand {
    /// VOICE_SERVER_UPDATE for this server.
    ServerUpdate {
        endpoint: Option<String>,
        token: String,
    },
    /// VOICE_STATE_UPDATE for our own user in this server.
    StateUpdate {
        session_id: Option<String>,
        channel_id: Option<String>,
    },
    /// The gateway session changed, e.g. after a fresh READY.
    SessionId(String),
    Wait {
        reply: WaiterReply,
        timeout: Option<Duration>,
    },
    SendFrame {
        kind: MediaKind,
        payload: Bytes,
        options: FrameOptions,
        reply: oneshot::Sender<Result<usize, VoiceError>>,
    },
    SendSilence {
        reply: oneshot::Sender<Result<usize, VoiceError>>,
    },
    Speaking {
        flags: u8,
        delay: u32,
        done: Option<oneshot::Sender<()>>,
    },
    UpdateState {
        options: VoiceStateOptions,
        done: Option<oneshot::Sender<()>>,
    },
    SsrcToUser {
        ssrc: u32,
        kind: MediaKind,
        reply: oneshot::Sender<Option<String>>,
    },
    UserToSsrc {
        user_id: String,
        kind: MediaKind,
        reply: oneshot::Sender<Option<u32>>,
    },
    Ping {
        timeout: Duration,
        reply: PingReply,
    },
    Kill(Option<VoiceError>),
}

/// Cloneable handle to a running voice session.
#[derive(Clone, Debug)]
pub struct VoiceSocket {
    id: u64,
    server_id: ServerId,
    tx: UnboundedSender<VoiceCommand>,
}

impl std::fmt::Debug for VoiceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ServerUpdate { .. } => "ServerUpdate",
            Self::StateUpdate { .. } => "StateUpdate",
            Self::SessionId(_) => "SessionId",
            Self::Wait { .. } => "Wait",
            Self::SendFrame { .. } => "SendFrame",
            Self::SendSilence { .. } => "SendSilence",
            Self::Speaking { .. } => "Speaking",
            Self::UpdateState { .. } => "UpdateState",
            Self::SsrcToUser { .. } => "SsrcToUser",
            Self::UserToSsrc { .. } => "UserToSsrc",
            Self::Ping { .. } => "Ping",
            Self::Kill(_) => "Kill",
        };
        f.write_str(name)
    }
}

impl VoiceSocket {
    pub(crate) fn new(id: u64, server_id: ServerId, tx: UnboundedSender<VoiceCommand>) -> Self {
        Self { id, server_id, tx }
    }

    /// Unique per voice session, also across sessions of the same server.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// True once the session was killed or its actor exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn command(&self, cmd: VoiceCommand) -> Result<(), VoiceError> {
        self.tx.send(cmd).map_err(|_| VoiceError::VoiceClosed)
    }

    async fn frame(&self, kind: MediaKind, payload: Bytes, options: FrameOptions) -> Result<usize, VoiceError> {
        let (reply, rx) = oneshot::channel();
        self.command(VoiceCommand::SendFrame {
            kind,
            payload,
            options,
            reply,
        })?;
        rx.await.map_err(|_| VoiceError::VoiceClosed)?
    }

    pub async fn send_audio_frame(
        &self,
        payload: impl Into<Bytes>,
        options: FrameOptions,
    ) -> Result<usize, VoiceError> {
        self.frame(MediaKind::Audio, payload.into(), options).await
    }

    pub async fn send_video_frame(
        &self,
        payload: impl Into<Bytes>,
        options: FrameOptions,
    ) -> Result<usize, VoiceError> {
        self.frame(MediaKind::Video, payload.into(), options).await
    }

    pub async fn send_audio_silence_frame(&self) -> Result<usize, VoiceError> {
        let (reply, rx) = oneshot::channel();
        self.command(VoiceCommand::SendSilence { reply })?;
        rx.await.map_err(|_| VoiceError::VoiceClosed)?
    }

    /// Queues a SPEAKING update; `flags` combines the `SPEAKING_*` constants.
    /// Resolves once the frame is written.
    pub async fn send_speaking(&self, flags: u8, delay: u32) -> Result<(), VoiceError> {
        let (done, rx) = oneshot::channel();
        self.command(VoiceCommand::Speaking {
            flags,
            delay,
            done: Some(done),
        })?;
        rx.await.map_err(|_| VoiceError::VoiceClosed)
    }

    /// Updates our mute/deaf/video flags in this channel through the gateway.
    pub async fn send_state_update(&self, options: VoiceStateOptions) -> Result<(), VoiceError> {
        let (done, rx) = oneshot::channel();
        self.command(VoiceCommand::UpdateState {
            options,
            done: Some(done),
        })?;
        rx.await.map_err(|_| VoiceError::GatewayClosed)
    }

    pub async fn ssrc_to_user_id(&self, ssrc: u32, kind: MediaKind) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.command(VoiceCommand::SsrcToUser { ssrc, kind, reply })
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn user_id_to_ssrc(&self, user_id: &str, kind: MediaKind) -> Option<u32> {
        let (reply, rx) = oneshot::channel();
        self.command(VoiceCommand::UserToSsrc {
            user_id: user_id.to_string(),
            kind,
            reply,
        })
        .ok()?;
        rx.await.ok().flatten()
    }

    /// Round trip of a WebSocket ping on the voice connection.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration, VoiceError> {
        let (reply, rx) = oneshot::channel();
        self.command(VoiceCommand::Ping { timeout, reply })?;
        Ok(rx.await.map_err(|_| VoiceError::VoiceClosed)??)
    }

    pub fn kill(&self) {
        let _ = self.command(VoiceCommand::Kill(None));
    }
}
