use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, WeakUnboundedSender, unbounded_channel},
    time::{Instant, sleep_until},
};
use tracing::debug;

use crate::{
    common::types::ServerId,
    configs::BucketConfig,
    gateway::{GatewayCommand, events::GatewayEvent},
    transport::{SocketEvent, WsDialer},
    voice::{
        VoiceCommand, VoiceSocket, encryption::CryptoProvider, rtp::EncryptionMode,
        udp_link::UdpEvent,
    },
};

pub mod handler;

pub use handler::VoiceEngine;

/// Everything a voice session needs from the gateway that spawns it.
pub struct VoiceContext {
    pub id: u64,
    pub server_id: ServerId,
    pub channel_id: Option<String>,
    pub user_id: String,
    pub session_id: Option<String>,
    pub api_version: u8,
    pub receive: bool,
    pub video: bool,
    pub force_mode: Option<EncryptionMode>,
    pub bucket: BucketConfig,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub reconnect_max: u32,
    pub provider: Arc<dyn CryptoProvider>,
    pub gateway: WeakUnboundedSender<GatewayCommand>,
    pub events: UnboundedSender<GatewayEvent>,
}

/// Starts the actor of one voice session and returns its handle.
pub fn spawn(ctx: VoiceContext) -> VoiceSocket {
    let (tx, commands) = unbounded_channel();
    let (socket_tx, sockets) = unbounded_channel();
    let (udp_tx, udp) = unbounded_channel();

    let handle = VoiceSocket::new(ctx.id, ctx.server_id.clone(), tx.clone());
    let engine = VoiceEngine::new(
        ctx,
        Box::new(WsDialer::new(socket_tx)),
        udp_tx,
        tx.downgrade(),
    );
    tokio::spawn(run(engine, commands, sockets, udp));
    handle
}

async fn run(
    mut engine: VoiceEngine,
    mut commands: UnboundedReceiver<VoiceCommand>,
    mut sockets: UnboundedReceiver<SocketEvent>,
    mut udp: UnboundedReceiver<UdpEvent>,
) {
    while !engine.is_killed() {
        let deadline = engine.next_deadline();
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(cmd) => engine.handle_command(cmd, Instant::now()),
                None => {
                    debug!("[{}] Every voice handle dropped", engine.server_id());
                    engine.kill(None, Instant::now());
                }
            },
            Some(event) = sockets.recv() => engine.handle_socket(event, Instant::now()),
            Some(event) = udp.recv() => engine.handle_udp(event, Instant::now()),
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                engine.poll(Instant::now());
            }
        }
    }
    debug!("[{}] Voice actor stopped", engine.server_id());
}
