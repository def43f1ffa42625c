use std::net::SocketAddr;

use thiserror::Error;

/// Unrecoverable problems with the options a socket was constructed with.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid encoding type `{0}`, valid: [\"etf\", \"json\"]")]
    InvalidEncoding(String),

    #[error("the `etf` encoding needs an injected ETF payload codec")]
    MissingEtfCodec,

    #[error("compress type must be of: none or zlib-stream (got `{0}`)")]
    InvalidCompress(String),

    #[error("shard count ({count}) cannot be less than or equal to the shard id ({id})")]
    InvalidShard { id: u32, count: u32 },

    #[error("unknown encryption mode `{0}`")]
    UnknownEncryptionMode(String),

    #[error("for media packing/unpacking, enable one of: {options:?}")]
    MissingCrypto { options: Vec<&'static str> },

    #[error("socket requires a url to connect to")]
    MissingUrl,

    #[error("invalid url `{0}`")]
    InvalidUrl(String),
}

/// Serialization failures of the payload codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Unsupported(String),
}

/// The streaming inflate context rejected its input.
#[derive(Debug, Error)]
#[error("inflate failed: {0}")]
pub struct InflateError(#[from] pub flate2::DecompressError);

/// A WebSocket ping that never got its pong.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PingError {
    #[error("pong took longer than {0}ms")]
    Timeout(u64),

    #[error("socket closed before the pong arrived")]
    Closed,
}

/// Errors surfaced by the control-plane socket.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Inflate(#[from] InflateError),

    #[error(transparent)]
    Ping(#[from] PingError),

    #[error("packet dropped, reason: ({0})")]
    DroppedPacket(String),

    #[error("socket closed with {code} ({reason}), killing")]
    Killed { code: u16, reason: String },

    #[error("websocket error: {0}")]
    Socket(String),

    #[error("socket isn't connected")]
    NotConnected,

    #[error("socket has closed")]
    SocketClosed,

    #[error("gateway socket has shut down")]
    Shutdown,
}

/// Authenticated encryption failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("secret key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("payload encryption failed")]
    Encrypt,

    #[error("payload failed to decrypt")]
    Decrypt,
}

/// Reasons an inbound datagram was dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaPacketError {
    #[error("received a packet from an unknown ip/port ({0})")]
    UnknownPeer(SocketAddr),

    #[error("received a packet before the session description")]
    NoSessionDescription,

    #[error("received an rtp packet that's way too small to be valid ({0} bytes)")]
    TooSmall(usize),

    #[error("invalid rtp packet (version {0})")]
    InvalidVersion(u8),

    #[error("unknown rtp packet payload type {0}")]
    UnknownPayloadType(u8),

    #[error("dropping video packet due to video not being enabled")]
    VideoDisabled,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("rtp padding length {pad} exceeds payload of {len} bytes")]
    InvalidPadding { pad: usize, len: usize },

    #[error("malformed rtp header extension")]
    MalformedExtension,

    #[error("received a two-byte rtp header extension, ignoring")]
    UnsupportedExtension,
}

impl MediaPacketError {
    /// Drops that are expected in normal operation and only worth a debug line.
    pub fn is_noise(&self) -> bool {
        matches!(self, Self::VideoDisabled | Self::UnsupportedExtension)
    }
}

/// Errors of the voice signaling socket and its media transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VoiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Media(#[from] MediaPacketError),

    #[error(transparent)]
    Ping(#[from] PingError),

    #[error("a guild id or a channel id is required")]
    MissingServer,

    #[error("voice gateway took longer than {0}ms")]
    Timeout(u64),

    #[error("media gateway was killed")]
    Killed,

    #[error("left the guild this voice was connected to")]
    LeftGuild,

    #[error("the guild this voice was connected to became unavailable")]
    GuildUnavailable,

    #[error("connected to this server from a different session")]
    ForeignSession,

    #[error("no supported voice mode found in {0:?}")]
    NoEncryptionMode(Vec<String>),

    #[error("unsupported {kind} codec received: {codec}")]
    UnsupportedCodec { kind: &'static str, codec: String },

    #[error("media endpoint is null")]
    MissingEndpoint,

    #[error("udp is not connected yet")]
    NotConnected,

    #[error("haven't received the session description yet")]
    NoSessionDescription,

    #[error("cannot send video frames when video is disabled")]
    VideoDisabled,

    #[error("ssrc mismatch in ip discovery packet")]
    DiscoveryMismatch,

    #[error("malformed ip discovery response")]
    MalformedDiscovery,

    #[error("udp error: {0}")]
    Udp(String),

    #[error("websocket error: {0}")]
    Socket(String),

    #[error("voice socket closed with {code} ({reason})")]
    Closed { code: u16, reason: String },

    #[error("failed to decode voice payload: {0}")]
    Decode(String),

    #[error("gateway socket has shut down")]
    GatewayClosed,

    #[error("gateway session isn't ready yet")]
    GatewayNotReady,

    #[error("voice socket has shut down")]
    VoiceClosed,
}
