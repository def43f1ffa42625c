pub mod bucket;
pub mod close;
pub mod codec;
pub mod decompressor;
pub mod ping;
pub mod websocket;

pub use bucket::Bucket;
pub use codec::{GatewayPacket, JsonCodec, OutboundPacket, PayloadCodec, resolve_codec};
pub use decompressor::{Decompressor, ZLIB_SUFFIX};
pub use ping::PingTracker;
pub use websocket::{
    Connection, Dialer, PendingSend, SocketEvent, SocketEventKind, WsDialer, flush_bucket,
};
