/// Gateway opcodes.
pub mod op {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const PRESENCE_UPDATE: u8 = 3;
    pub const VOICE_STATE_UPDATE: u8 = 4;
    pub const VOICE_SERVER_PING: u8 = 5;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const REQUEST_GUILD_MEMBERS: u8 = 8;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
    pub const CALL_CONNECT: u8 = 13;
    pub const GUILD_SUBSCRIPTIONS: u8 = 14;
    pub const LOBBY_CONNECT: u8 = 15;
    pub const LOBBY_DISCONNECT: u8 = 16;
    pub const LOBBY_VOICE_STATES_UPDATE: u8 = 17;
    pub const STREAM_CREATE: u8 = 18;
    pub const STREAM_DELETE: u8 = 19;
    pub const STREAM_WATCH: u8 = 20;
    pub const STREAM_PING: u8 = 21;
    pub const STREAM_SET_PAUSED: u8 = 22;
}

/// Dispatch names the socket reacts to itself. Everything else is only routed.
pub mod dispatch {
    pub const READY: &str = "READY";
    pub const RESUMED: &str = "RESUMED";
    pub const GUILD_DELETE: &str = "GUILD_DELETE";
    pub const VOICE_SERVER_UPDATE: &str = "VOICE_SERVER_UPDATE";
    pub const VOICE_STATE_UPDATE: &str = "VOICE_STATE_UPDATE";
}

/// Bounds of the randomized wait before answering INVALID_SESSION.
pub const INVALID_SESSION_DELAY_MIN_SECS: u64 = 1;
pub const INVALID_SESSION_DELAY_MAX_SECS: u64 = 5;

pub const DEFAULT_SHARD_COUNT: u32 = 1;
