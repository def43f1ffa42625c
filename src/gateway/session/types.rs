use std::fmt;

use tracing::warn;

/// Connection lifecycle shared by the gateway and voice sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketState {
    Closed,
    Connecting,
    Open,
    Identifying,
    Resuming,
    Ready,
}

impl SocketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Identifying => "IDENTIFYING",
            Self::Resuming => "RESUMING",
            Self::Ready => "READY",
        }
    }

    pub fn can_transition(&self, to: SocketState) -> bool {
        use SocketState::*;
        match (*self, to) {
            (_, Closed) => true,
            (Closed, Connecting) => true,
            (Connecting, Open) => true,
            (Open | Identifying | Resuming | Ready, Identifying | Resuming) => true,
            (Identifying | Resuming, Ready) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holds the current [`SocketState`] and only accepts legal moves.
#[derive(Debug)]
pub struct StateMachine {
    state: SocketState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: SocketState::Closed,
        }
    }
}

impl StateMachine {
    pub fn get(&self) -> SocketState {
        self.state
    }

    /// Moves to `to`. Returns true when the state actually changed; repeating
    /// the current state is a silent no-op.
    pub fn transition(&mut self, to: SocketState) -> bool {
        if self.state == to {
            return false;
        }
        if !self.state.can_transition(to) {
            warn!("Ignoring illegal state transition {} -> {}", self.state, to);
            return false;
        }
        self.state = to;
        true
    }
}

/// Close codes after which the session can no longer be resumed.
pub fn is_session_reset_close(code: u16) -> bool {
    matches!(code, 1000 | 1001 | 4007 | 4009)
}

/// Gateway close codes that must not be retried.
///
/// - `4004`: Authentication failed
/// - `4010`..`4014`: Invalid shard, sharding required, invalid version,
///   invalid or disallowed intents
pub fn is_fatal_close(code: u16) -> bool {
    matches!(code, 4004 | 4010..=4014)
}
