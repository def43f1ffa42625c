pub mod constants;
pub mod events;
pub mod payloads;
pub mod session;

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender},
    oneshot,
};

use crate::{
    common::{
        errors::{ConfigError, GatewayError, VoiceError},
        types::ServerId,
    },
    configs::Config,
    transport::{PayloadCodec, ping::PingReply},
    voice::{EncryptionMode, VoiceSocket},
};

use self::constants::op;
pub use events::GatewayEvent;
pub use payloads::{GuildMembersRequest, GuildSubscriptions, LobbyVoiceState, VoiceStateOptions};
pub use session::{GatewayEngine, GatewaySettings};

/// Options of a voice join.
#[derive(Debug, Clone, Default)]
pub struct VoiceConnectOptions {
    /// `None` uses the configured default; zero waits forever.
    pub timeout: Option<Duration>,
    pub receive: Option<bool>,
    /// Defaults to `state.self_video`.
    pub video: Option<bool>,
    pub force_mode: Option<EncryptionMode>,
    pub state: VoiceStateOptions,
}

/// Outcome of a voice join as seen by the gateway actor.
pub enum VoiceJoin {
    Done(Result<Option<VoiceSocket>, VoiceError>),
    Pending(oneshot::Receiver<Result<VoiceSocket, VoiceError>>),
}

pub enum GatewayCommand {
    Connect,
    Send {
        op: u8,
        d: Value,
        urgent: bool,
        done: Option<oneshot::Sender<()>>,
    },
    VoiceStateUpdate {
        guild_id: Option<String>,
        channel_id: Option<String>,
        options: VoiceStateOptions,
        done: Option<oneshot::Sender<()>>,
    },
    VoiceConnect {
        guild_id: Option<String>,
        channel_id: Option<String>,
        options: VoiceConnectOptions,
        reply: oneshot::Sender<VoiceJoin>,
    },
    /// A voice session unregistering itself after a kill.
    RemoveVoice { server_id: ServerId, id: u64 },
    Ping { timeout: Duration, reply: PingReply },
    Disconnect { code: u16 },
    Kill,
}

impl std::fmt::Debug for GatewayCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => f.write_str("Connect"),
            Self::Send { op, urgent, .. } => write!(f, "Send(op={op}, urgent={urgent})"),
            Self::VoiceStateUpdate { guild_id, channel_id, .. } => {
                write!(f, "VoiceStateUpdate({guild_id:?}, {channel_id:?})")
            }
            Self::VoiceConnect { guild_id, channel_id, .. } => {
                write!(f, "VoiceConnect({guild_id:?}, {channel_id:?})")
            }
            Self::RemoveVoice { server_id, id } => write!(f, "RemoveVoice({server_id}, {id})"),
            Self::Ping { timeout, .. } => write!(f, "Ping({timeout:?})"),
            Self::Disconnect { code } => write!(f, "Disconnect({code})"),
            Self::Kill => f.write_str("Kill"),
        }
    }
}

/// Handle to the gateway actor. Cloning is cheap; the actor kills itself once
/// every handle is gone.
#[derive(Clone)]
pub struct GatewaySocket {
    tx: UnboundedSender<GatewayCommand>,
}

impl GatewaySocket {
    /// Validates `config` and starts the actor. Nothing is dialed until
    /// [`GatewaySocket::connect`].
    pub fn new(
        token: impl Into<String>,
        config: &Config,
    ) -> Result<(Self, UnboundedReceiver<GatewayEvent>), ConfigError> {
        Self::with_codec(token, config, None)
    }

    /// Like [`GatewaySocket::new`], with a caller supplied payload codec. The
    /// `etf` encoding is only available this way.
    pub fn with_codec(
        token: impl Into<String>,
        config: &Config,
        codec: Option<Arc<dyn PayloadCodec>>,
    ) -> Result<(Self, UnboundedReceiver<GatewayEvent>), ConfigError> {
        let settings = GatewaySettings::resolve(token.into(), config, codec)?;
        let (tx, events) = session::spawn(settings);
        Ok((Self { tx }, events))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn command(&self, cmd: GatewayCommand) -> Result<(), GatewayError> {
        self.tx.send(cmd).map_err(|_| GatewayError::Shutdown)
    }

    pub fn connect(&self) -> Result<(), GatewayError> {
        self.command(GatewayCommand::Connect)
    }

    /// Closes the connection without reconnecting. [`GatewaySocket::connect`]
    /// starts over, resuming when the code kept the session.
    pub fn disconnect(&self, code: u16) -> Result<(), GatewayError> {
        self.command(GatewayCommand::Disconnect { code })
    }

    pub fn kill(&self) {
        let _ = self.command(GatewayCommand::Kill);
    }

    /// Queues a frame on the send bucket. Resolves once it was written; fails
    /// when the queue was dropped by a disconnect.
    pub async fn send(&self, op: u8, d: Value, urgent: bool) -> Result<(), GatewayError> {
        let (done, rx) = oneshot::channel();
        self.command(GatewayCommand::Send {
            op,
            d,
            urgent,
            done: Some(done),
        })?;
        rx.await.map_err(|_| GatewayError::SocketClosed)
    }

    pub async fn voice_state_update(
        &self,
        guild_id: Option<&str>,
        channel_id: Option<&str>,
        options: VoiceStateOptions,
    ) -> Result<(), GatewayError> {
        let (done, rx) = oneshot::channel();
        self.command(GatewayCommand::VoiceStateUpdate {
            guild_id: guild_id.map(str::to_string),
            channel_id: channel_id.map(str::to_string),
            options,
            done: Some(done),
        })?;
        rx.await.map_err(|_| GatewayError::SocketClosed)
    }

    /// Joins, moves or leaves a voice channel.
    ///
    /// Resolves with the session once it is ready, `None` when leaving, or the
    /// error that killed the session (including the join timeout).
    pub async fn voice_connect(
        &self,
        guild_id: Option<&str>,
        channel_id: Option<&str>,
        options: VoiceConnectOptions,
    ) -> Result<Option<VoiceSocket>, VoiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(GatewayCommand::VoiceConnect {
                guild_id: guild_id.map(str::to_string),
                channel_id: channel_id.map(str::to_string),
                options,
                reply,
            })
            .map_err(|_| VoiceError::GatewayClosed)?;

        match rx.await.map_err(|_| VoiceError::GatewayClosed)? {
            VoiceJoin::Done(result) => result,
            VoiceJoin::Pending(wait) => wait.await.map_err(|_| VoiceError::VoiceClosed)?.map(Some),
        }
    }

    /// Round trip of a WebSocket ping.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.command(GatewayCommand::Ping { timeout, reply })?;
        Ok(rx.await.map_err(|_| GatewayError::Shutdown)??)
    }

    pub async fn request_guild_members(
        &self,
        guild_ids: &[String],
        request: &GuildMembersRequest,
    ) -> Result<(), GatewayError> {
        let d = payloads::request_guild_members(guild_ids, request);
        self.send(op::REQUEST_GUILD_MEMBERS, d, false).await
    }

    /// Sends `presence` as is.
    pub async fn set_presence(&self, presence: Value) -> Result<(), GatewayError> {
        self.send(op::PRESENCE_UPDATE, presence, false).await
    }

    pub async fn update_guild_subscriptions(
        &self,
        guild_id: &str,
        subscriptions: &GuildSubscriptions,
    ) -> Result<(), GatewayError> {
        let d = payloads::guild_subscriptions(guild_id, subscriptions);
        self.send(op::GUILD_SUBSCRIPTIONS, d, false).await
    }

    pub async fn call_connect(&self, channel_id: &str) -> Result<(), GatewayError> {
        self.send(op::CALL_CONNECT, payloads::call_connect(channel_id), false)
            .await
    }

    pub async fn lobby_connect(&self, lobby_id: &str, lobby_secret: &str) -> Result<(), GatewayError> {
        let d = payloads::lobby_connect(lobby_id, lobby_secret);
        self.send(op::LOBBY_CONNECT, d, false).await
    }

    pub async fn lobby_disconnect(&self, lobby_id: &str) -> Result<(), GatewayError> {
        let d = payloads::lobby_disconnect(lobby_id);
        self.send(op::LOBBY_DISCONNECT, d, false).await
    }

    pub async fn lobby_voice_states_update(
        &self,
        states: &[LobbyVoiceState],
    ) -> Result<(), GatewayError> {
        let d = payloads::lobby_voice_states(states);
        self.send(op::LOBBY_VOICE_STATES_UPDATE, d, false).await
    }

    pub async fn stream_create(&self, guild_id: &str, channel_id: &str) -> Result<(), GatewayError> {
        let d = payloads::stream_create(guild_id, channel_id);
        self.send(op::STREAM_CREATE, d, false).await
    }

    pub async fn stream_delete(&self, stream_key: &str) -> Result<(), GatewayError> {
        self.send(op::STREAM_DELETE, payloads::stream_key(stream_key), false)
            .await
    }

    pub async fn stream_watch(&self, stream_key: &str) -> Result<(), GatewayError> {
        self.send(op::STREAM_WATCH, payloads::stream_key(stream_key), false)
            .await
    }

    pub async fn stream_ping(&self, stream_key: &str) -> Result<(), GatewayError> {
        self.send(op::STREAM_PING, payloads::stream_key(stream_key), false)
            .await
    }

    pub async fn stream_set_paused(&self, stream_key: &str, paused: bool) -> Result<(), GatewayError> {
        let d = payloads::stream_set_paused(stream_key, paused);
        self.send(op::STREAM_SET_PAUSED, d, false).await
    }

    pub async fn voice_server_ping(&self) -> Result<(), GatewayError> {
        self.send(op::VOICE_SERVER_PING, Value::Null, false).await
    }
}
