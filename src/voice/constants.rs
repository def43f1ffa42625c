/// Voice gateway opcodes.
pub mod op {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    /// Also known as SELECT_PROTOCOL_ACK.
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const RESUME: u8 = 7;
    pub const HELLO: u8 = 8;
    pub const RESUMED: u8 = 9;
    pub const CLIENT_CONNECT: u8 = 12;
    pub const CLIENT_DISCONNECT: u8 = 13;
    pub const SESSION_UPDATE: u8 = 14;
}

/// Voice gateway close codes with special handling.
pub mod close {
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    pub const SESSION_NO_LONGER_VALID: u16 = 4006;
    pub const SESSION_TIMEOUT: u16 = 4009;
    pub const SERVER_NOT_FOUND: u16 = 4011;
    pub const DISCONNECTED: u16 = 4014;
    pub const VOICE_SERVER_CRASHED: u16 = 4015;
}

/// Encryption modes in order of preference.
pub const ENCRYPTION_MODES: [&str; 3] = [
    "xsalsa20_poly1305_lite",
    "xsalsa20_poly1305_suffix",
    "xsalsa20_poly1305",
];

pub const MEDIA_PROTOCOL_UDP: &str = "udp";

pub const SPEAKING_NONE: u8 = 0;
pub const SPEAKING_VOICE: u8 = 1 << 0;
pub const SPEAKING_SOUNDSHARE: u8 = 1 << 1;
pub const SPEAKING_PRIORITY: u8 = 1 << 2;

/// An opus frame of silence.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

pub const RTP_HEADER_LEN: usize = 12;
pub const RTP_VERSION_BYTE: u8 = 0x80;
pub const RTCP_PACKET_TYPES: std::ops::RangeInclusive<u8> = 200..=206;

pub const EXTENSION_ONE_BYTE: [u8; 2] = [0xBE, 0xDE];
pub const EXTENSION_TWO_BYTE: [u8; 2] = [0x10, 0x00];
pub const EXTENSION_LOCAL_ID: u8 = 0x0F;

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const LITE_NONCE_LEN: usize = 4;

/// Timestamp advance per frame: 20ms of 48kHz audio, and the 90kHz video clock
/// at 30fps.
pub const AUDIO_TIMESTAMP_STEP: u32 = 960;
pub const VIDEO_TIMESTAMP_STEP: u32 = 3000;

pub const DISCOVERY_PACKET_SIZE: usize = 70;

/// Outbound scratch buffer per stream.
pub const UDP_PACKET_BUF_CAPACITY: usize = 5 * 1024;
pub const UDP_RECV_BUF_SIZE: usize = 4096;
