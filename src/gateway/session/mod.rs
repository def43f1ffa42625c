use std::sync::Arc;

use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::{Instant, sleep_until},
};
use tracing::debug;

use crate::{
    common::errors::ConfigError,
    configs::{CompressMode, Config, GatewayConfig, VoiceConfig},
    gateway::{GatewayCommand, events::GatewayEvent},
    transport::{PayloadCodec, SocketEvent, WsDialer, resolve_codec},
    voice::{CryptoProvider, EncryptionMode, resolve_provider},
};

pub mod backoff;
pub mod handler;
pub mod heartbeat;
pub mod types;

pub use handler::GatewayEngine;

/// Construction options after validation, with every capability resolved.
pub struct GatewaySettings {
    pub token: String,
    pub config: GatewayConfig,
    pub compress: CompressMode,
    pub codec: Arc<dyn PayloadCodec>,
    pub voice: VoiceConfig,
    pub force_mode: Option<EncryptionMode>,
    pub provider: Arc<dyn CryptoProvider>,
}

impl GatewaySettings {
    /// Fails on anything that can never work: bad encoding or compression,
    /// impossible shard tuple, no usable crypto provider.
    pub fn resolve(
        token: String,
        config: &Config,
        codec: Option<Arc<dyn PayloadCodec>>,
    ) -> Result<Self, ConfigError> {
        config.gateway.validate()?;
        config.voice.validate()?;

        let codec = resolve_codec(config.gateway.encoding()?, codec)?;
        let provider = resolve_provider(&config.voice.crypto_providers)?;
        let force_mode = config
            .voice
            .force_mode
            .as_deref()
            .map(str::parse::<EncryptionMode>)
            .transpose()?;

        Ok(Self {
            token,
            compress: config.gateway.compress()?,
            config: config.gateway.clone(),
            codec,
            voice: config.voice.clone(),
            force_mode,
            provider,
        })
    }
}

/// Starts the gateway actor. Returns its command sender and the event stream
/// of the gateway and every voice session it spawns.
pub fn spawn(
    settings: GatewaySettings,
) -> (
    UnboundedSender<GatewayCommand>,
    UnboundedReceiver<GatewayEvent>,
) {
    let (tx, commands) = unbounded_channel();
    let (events_tx, events) = unbounded_channel();
    let (socket_tx, sockets) = unbounded_channel();

    let engine = GatewayEngine::new(
        settings,
        Box::new(WsDialer::new(socket_tx)),
        tx.downgrade(),
        events_tx,
    );
    tokio::spawn(run(engine, commands, sockets));
    (tx, events)
}

async fn run(
    mut engine: GatewayEngine,
    mut commands: UnboundedReceiver<GatewayCommand>,
    mut sockets: UnboundedReceiver<SocketEvent>,
) {
    while !engine.is_killed() {
        let deadline = engine.next_deadline();
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(cmd) => engine.handle_command(cmd, Instant::now()),
                None => {
                    debug!("Every gateway handle dropped");
                    engine.kill(Instant::now());
                }
            },
            Some(event) = sockets.recv() => engine.handle_socket(event, Instant::now()),
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                engine.poll(Instant::now());
            }
        }
    }
    debug!("Gateway actor stopped");
}
