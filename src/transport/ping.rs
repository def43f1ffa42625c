use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::common::errors::PingError;

pub type PingReply = oneshot::Sender<Result<Duration, PingError>>;

#[derive(Serialize, Deserialize)]
struct PingPayload {
    nonce: String,
}

struct PendingPing {
    sent_at: Instant,
    deadline: Instant,
    timeout_ms: u64,
    reply: PingReply,
}

/// Matches WebSocket pongs to the pings that asked for them.
#[derive(Default)]
pub struct PingTracker {
    next_nonce: u64,
    pending: HashMap<String, PendingPing>,
}

impl PingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Registers a ping and returns the frame to send.
    pub fn start(&mut self, now: Instant, timeout: Duration, reply: PingReply) -> Message {
        self.next_nonce = self.next_nonce.wrapping_add(1);
        let nonce = self.next_nonce.to_string();
        let payload = serde_json::to_vec(&PingPayload {
            nonce: nonce.clone(),
        })
        .unwrap_or_default();

        self.pending.insert(
            nonce,
            PendingPing {
                sent_at: now,
                deadline: now + timeout,
                timeout_ms: timeout.as_millis() as u64,
                reply,
            },
        );
        Message::Ping(Bytes::from(payload))
    }

    /// Resolves the ping a pong answers. Pongs that don't parse or don't match
    /// are ignored.
    pub fn on_pong(&mut self, payload: &[u8], now: Instant) -> bool {
        let Ok(PingPayload { nonce }) = serde_json::from_slice::<PingPayload>(payload) else {
            return false;
        };
        match self.pending.remove(&nonce) {
            Some(ping) => {
                let _ = ping.reply.send(Ok(now.saturating_duration_since(ping.sent_at)));
                true
            }
            None => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Fails every ping whose deadline has passed.
    pub fn expire(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(nonce, _)| nonce.clone())
            .collect();
        for nonce in expired {
            if let Some(ping) = self.pending.remove(&nonce) {
                let _ = ping.reply.send(Err(PingError::Timeout(ping.timeout_ms)));
            }
        }
    }

    pub fn reject_all(&mut self) {
        for (_, ping) in self.pending.drain() {
            let _ = ping.reply.send(Err(PingError::Closed));
        }
    }
}
