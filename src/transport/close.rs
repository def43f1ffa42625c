//! Close codes shared by both sockets, including the 48xx codes used for
//! disconnects this client initiates itself.

pub const NORMAL: u16 = 1000;
pub const GOING_AWAY: u16 = 1001;

pub const INVALID_DATA: u16 = 4800;
pub const RECONNECTING: u16 = 4801;
pub const HEARTBEAT_ACK: u16 = 4802;
pub const HEARTBEAT_ACK_NONCE: u16 = 4803;
pub const OTHER_SOCKET_MESSAGE: u16 = 4804;
pub const OTHER_SOCKET_OPEN: u16 = 4805;

pub fn internal_reason(code: u16) -> Option<&'static str> {
    match code {
        INVALID_DATA => Some("Invalid data received, reconnecting"),
        RECONNECTING => Some("Reconnecting"),
        HEARTBEAT_ACK => Some("Heartbeat ACK never arrived"),
        HEARTBEAT_ACK_NONCE => Some("Invalid nonce received by Heartbeat ACK"),
        OTHER_SOCKET_MESSAGE => Some("Received message from not our current socket"),
        OTHER_SOCKET_OPEN => Some("Received open from not our current socket"),
        _ => None,
    }
}

/// The given reason, or the fixed one for an internal code when none was sent.
pub fn describe(code: u16, reason: &str) -> String {
    if reason.is_empty() {
        internal_reason(code).unwrap_or_default().to_string()
    } else {
        reason.to_string()
    }
}
