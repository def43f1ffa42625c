use std::collections::HashMap;

use rand::Rng;
use serde_json::{Value, json};
use tokio::{
    sync::{
        mpsc::{UnboundedSender, WeakUnboundedSender},
        oneshot,
    },
    time::{Duration, Instant},
};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
    GatewaySettings,
    backoff::Backoff,
    heartbeat::HeartbeatState,
    types::{SocketState, StateMachine, is_fatal_close, is_session_reset_close},
};
use crate::{
    common::{
        errors::{ConfigError, GatewayError, PingError, VoiceError},
        types::ServerId,
    },
    configs::CompressMode,
    gateway::{
        GatewayCommand, VoiceConnectOptions, VoiceJoin,
        constants::{INVALID_SESSION_DELAY_MAX_SECS, INVALID_SESSION_DELAY_MIN_SECS, dispatch, op},
        events::GatewayEvent,
        payloads,
    },
    transport::{
        Bucket, Connection, Decompressor, Dialer, OutboundPacket, PendingSend, PingTracker,
        SocketEvent, SocketEventKind, close, flush_bucket,
    },
    voice::{self, VoiceCommand, VoiceContext, VoiceSocket},
};

struct VoiceEntry {
    socket: VoiceSocket,
    channel_id: Option<String>,
}

/// The control socket's protocol state. Sans-IO: the actor feeds it commands,
/// socket events and the current time, and it writes through [`Connection`].
pub struct GatewayEngine {
    settings: GatewaySettings,
    state: StateMachine,
    killed: bool,
    resuming: bool,
    sequence: u64,
    session_id: Option<String>,
    user_id: Option<String>,
    heartbeat: HeartbeatState,
    bucket: Bucket<PendingSend>,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
    /// When to answer a pending INVALID_SESSION, and whether it was resumable.
    invalid_session: Option<(Instant, bool)>,
    decompressor: Option<Decompressor>,
    dialer: Box<dyn Dialer>,
    connection: Option<Connection>,
    generation: u64,
    pings: PingTracker,
    voices: HashMap<ServerId, VoiceEntry>,
    next_voice_id: u64,
    commands: WeakUnboundedSender<GatewayCommand>,
    events: UnboundedSender<GatewayEvent>,
}

impl GatewayEngine {
    pub fn new(
        settings: GatewaySettings,
        dialer: Box<dyn Dialer>,
        commands: WeakUnboundedSender<GatewayCommand>,
        events: UnboundedSender<GatewayEvent>,
    ) -> Self {
        let bucket_config = &settings.config.bucket;
        let mut bucket = Bucket::new(
            bucket_config.limit,
            Duration::from_millis(bucket_config.window_ms),
        );
        bucket.lock(None, Instant::now());

        let backoff = Backoff::new(
            Duration::from_millis(settings.config.reconnect_delay_ms),
            settings.config.reconnect_max,
        );
        let decompressor = (settings.compress == CompressMode::ZlibStream).then(Decompressor::new);

        Self {
            settings,
            state: StateMachine::default(),
            killed: false,
            resuming: false,
            sequence: 0,
            session_id: None,
            user_id: None,
            heartbeat: HeartbeatState::default(),
            bucket,
            backoff,
            reconnect_at: None,
            invalid_session: None,
            decompressor,
            dialer,
            connection: None,
            generation: 0,
            pings: PingTracker::new(),
            voices: HashMap::new(),
            next_voice_id: 0,
            commands,
            events,
        }
    }

    pub fn state(&self) -> SocketState {
        self.state.get()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }

    pub fn voice(&self, server_id: &ServerId) -> Option<&VoiceSocket> {
        self.voices.get(server_id).map(|entry| &entry.socket)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.heartbeat.next_at,
            self.reconnect_at,
            self.invalid_session.map(|(at, _)| at),
            self.pings.next_deadline(),
            self.bucket.unlock_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn emit(&self, event: GatewayEvent) {
        let _ = self.events.send(event);
    }

    fn warn(&self, error: GatewayError) {
        warn!("Gateway: {}", error);
        self.emit(GatewayEvent::Warn(error));
    }

    fn set_state(&mut self, to: SocketState) {
        if self.state.transition(to) {
            self.emit(GatewayEvent::State(to));
        }
    }

    pub fn handle_command(&mut self, cmd: GatewayCommand, now: Instant) {
        match cmd {
            GatewayCommand::Connect => {
                self.backoff.reset();
                self.connect(now);
            }
            GatewayCommand::Send {
                op,
                d,
                urgent,
                done,
            } => self.enqueue(op, d, urgent, done, now),
            GatewayCommand::VoiceStateUpdate {
                guild_id,
                channel_id,
                options,
                done,
            } => {
                let d = payloads::voice_state(guild_id.as_deref(), channel_id.as_deref(), options);
                self.enqueue(op::VOICE_STATE_UPDATE, d, false, done, now);
            }
            GatewayCommand::VoiceConnect {
                guild_id,
                channel_id,
                options,
                reply,
            } => {
                let join = self.voice_connect(guild_id, channel_id, options, now);
                let _ = reply.send(join);
            }
            GatewayCommand::RemoveVoice { server_id, id } => {
                if self
                    .voices
                    .get(&server_id)
                    .is_some_and(|entry| entry.socket.id() == id)
                {
                    debug!("[{}] Voice session {} removed", server_id, id);
                    self.voices.remove(&server_id);
                }
            }
            GatewayCommand::Ping { timeout, reply } => match &self.connection {
                Some(connection) => {
                    let frame = self.pings.start(now, timeout, reply);
                    let _ = connection.send(frame);
                }
                None => {
                    let _ = reply.send(Err(PingError::Closed));
                }
            },
            GatewayCommand::Disconnect { code } => {
                self.reconnect_at = None;
                self.disconnect(code, now);
            }
            GatewayCommand::Kill => self.kill(now),
        }
    }

    /// Opens a new connection, replacing the current one.
    pub fn connect(&mut self, now: Instant) {
        if self.killed {
            return;
        }
        if self.connection.is_some() {
            self.disconnect(close::RECONNECTING, now);
        }

        let mut url = match Url::parse(&self.settings.config.url) {
            Ok(url) => url,
            Err(_) => {
                let error = ConfigError::InvalidUrl(self.settings.config.url.clone());
                self.warn(error.into());
                return;
            }
        };
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("encoding", self.settings.codec.name())
                .append_pair("v", &self.settings.config.api_version.to_string());
            if self.settings.compress == CompressMode::ZlibStream {
                query.append_pair("compress", CompressMode::ZlibStream.as_str());
            }
        }

        if let Some(decompressor) = self.decompressor.as_mut() {
            decompressor.reset();
        }
        self.generation += 1;
        self.reconnect_at = None;
        self.invalid_session = None;
        info!("Connecting to gateway: {}", url);
        self.set_state(SocketState::Connecting);
        self.connection = Some(self.dialer.dial(url, self.generation));
    }

    fn cleanup(&mut self, code: u16, now: Instant) {
        self.bucket.clear();
        self.bucket.lock(None, now);
        if let Some(decompressor) = self.decompressor.as_mut() {
            decompressor.reset();
        }
        if is_session_reset_close(code) {
            self.sequence = 0;
            self.session_id = None;
        }
        self.heartbeat.reset();
        self.invalid_session = None;
        self.resuming = false;
        self.pings.reject_all();
        self.set_state(SocketState::Closed);
    }

    /// Closes the connection ourselves and reports the close right away; the
    /// socket's own close event arrives for a stale generation.
    pub fn disconnect(&mut self, code: u16, now: Instant) {
        self.cleanup(code, now);
        if let Some(connection) = self.connection.take() {
            let reason = close::describe(code, "");
            debug!("Disconnecting from gateway: {} ({})", code, reason);
            connection.close(code, &reason);
            self.emit(GatewayEvent::Close { code, reason });
        }
    }

    /// Drops the connection and dials again at once, counting the attempt.
    fn reconnect_now(&mut self, code: u16, now: Instant) {
        self.disconnect(code, now);
        if self.backoff.is_exhausted() {
            error!("Max gateway reconnect attempts reached");
            self.kill(now);
            return;
        }
        self.backoff.next();
        self.connect(now);
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        if self.backoff.is_exhausted() {
            error!("Max gateway reconnect attempts reached");
            self.kill(now);
            return;
        }
        let delay = self.backoff.next();
        debug!(
            "Reconnecting to gateway in {:?} (attempt {})",
            delay,
            self.backoff.attempts()
        );
        self.reconnect_at = Some(now + delay);
    }

    pub fn kill(&mut self, now: Instant) {
        if self.killed {
            return;
        }
        self.killed = true;
        self.reconnect_at = None;
        self.disconnect(close::NORMAL, now);
        for (_, entry) in self.voices.drain() {
            entry.socket.kill();
        }
        info!("Gateway socket killed");
        self.emit(GatewayEvent::Killed);
    }

    pub fn handle_socket(&mut self, event: SocketEvent, now: Instant) {
        if self.connection.as_ref().map(Connection::generation) != Some(event.generation) {
            debug!("Ignoring event of stale gateway connection {}", event.generation);
            return;
        }

        match event.kind {
            SocketEventKind::Open => {
                info!("Gateway connection open");
                self.emit(GatewayEvent::Open);
                self.set_state(SocketState::Open);
            }
            SocketEventKind::Message(data) => {
                let Some(decompressor) = self.decompressor.as_mut() else {
                    self.handle_payload(&data, now);
                    return;
                };
                match decompressor.feed(&data) {
                    Ok(messages) => {
                        for message in messages {
                            // A frame may have replaced the connection.
                            if self.connection.as_ref().map(Connection::generation)
                                != Some(event.generation)
                            {
                                break;
                            }
                            self.handle_payload(&message, now);
                        }
                    }
                    Err(e) => {
                        self.warn(e.into());
                        self.reconnect_now(close::INVALID_DATA, now);
                    }
                }
            }
            SocketEventKind::Pong(payload) => {
                self.pings.on_pong(&payload, now);
            }
            SocketEventKind::Close { code, reason } => self.on_close(code, &reason, now),
            SocketEventKind::Error(error) => self.warn(GatewayError::Socket(error)),
        }
    }

    fn on_close(&mut self, code: u16, reason: &str, now: Instant) {
        let reason = close::describe(code, reason);
        info!("Gateway closed: code={}, reason='{}'", code, reason);
        self.emit(GatewayEvent::Close {
            code,
            reason: reason.clone(),
        });
        self.connection = None;
        self.cleanup(code, now);
        if self.killed {
            return;
        }

        if is_fatal_close(code) {
            self.warn(GatewayError::Killed { code, reason });
            self.kill(now);
        } else if self.settings.config.auto_reconnect {
            self.schedule_reconnect(now);
        }
    }

    fn encode(&self, op: u8, d: Value) -> Option<Message> {
        match self.settings.codec.encode(&OutboundPacket::new(op, d)) {
            Ok(message) => Some(message),
            Err(e) => {
                self.warn(e.into());
                None
            }
        }
    }

    /// Writes a frame immediately, skipping the bucket.
    fn send_direct(&self, op: u8, d: Value) -> bool {
        let Some(message) = self.encode(op, d) else {
            return false;
        };
        let sent = self
            .connection
            .as_ref()
            .is_some_and(|c| c.send(message).is_ok());
        if !sent {
            self.warn(GatewayError::DroppedPacket(format!(
                "op {op}: socket isn't connected"
            )));
        }
        sent
    }

    fn enqueue(
        &mut self,
        op: u8,
        d: Value,
        urgent: bool,
        done: Option<oneshot::Sender<()>>,
        now: Instant,
    ) {
        let Some(message) = self.encode(op, d) else {
            return;
        };
        self.bucket.add(PendingSend::new(message, done), urgent);
        flush_bucket(&mut self.bucket, self.connection.as_ref(), now);
    }

    fn identify(&mut self) {
        debug!("Identifying gateway session");
        let d = payloads::identify(&self.settings.token, &self.settings.config);
        self.send_direct(op::IDENTIFY, d);
        self.set_state(SocketState::Identifying);
    }

    fn resume(&mut self) {
        debug!("Resuming gateway session at sequence {}", self.sequence);
        self.resuming = true;
        let d = payloads::resume(
            &self.settings.token,
            self.session_id.as_deref(),
            self.sequence,
        );
        self.send_direct(op::RESUME, d);
        self.set_state(SocketState::Resuming);
    }

    fn send_heartbeat(&mut self, now: Instant) {
        let sequence = (self.sequence != 0).then_some(self.sequence);
        if self.send_direct(op::HEARTBEAT, json!(sequence)) {
            self.heartbeat.sent(now, None);
        }
    }

    fn handle_payload(&mut self, data: &[u8], now: Instant) {
        let packet = match self.settings.codec.decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                self.warn(e.into());
                return;
            }
        };

        if let Some(s) = packet.s {
            if self.sequence + 1 < s && !self.resuming {
                debug!("Sequence jumped from {} to {}, resuming", self.sequence, s);
                self.resume();
                return;
            }
            self.sequence = self.sequence.max(s);
        }
        self.emit(GatewayEvent::Packet(packet.clone()));

        match packet.op {
            op::HEARTBEAT => self.send_heartbeat(now),
            op::HEARTBEAT_ACK => self.heartbeat.acked(now),
            op::HELLO => {
                let interval = packet.d["heartbeat_interval"].as_f64().unwrap_or_default();
                if interval > 0.0 {
                    self.heartbeat
                        .start(Duration::from_millis(interval as u64), now);
                }
                if self.session_id.is_some() {
                    self.resume();
                } else {
                    self.identify();
                }
            }
            op::INVALID_SESSION => {
                let resumable = is_truthy(&packet.d);
                let secs = rand::thread_rng()
                    .gen_range(INVALID_SESSION_DELAY_MIN_SECS..=INVALID_SESSION_DELAY_MAX_SECS);
                debug!(
                    "Invalid session (resumable: {}), answering in {}s",
                    resumable, secs
                );
                self.invalid_session = Some((now + Duration::from_secs(secs), resumable));
            }
            op::RECONNECT => {
                info!("Gateway asked us to reconnect");
                self.reconnect_now(close::RECONNECTING, now);
            }
            op::DISPATCH => {
                let Some(name) = packet.t else {
                    return;
                };
                self.handle_dispatch(&name, &packet.d, now);
                self.emit(GatewayEvent::Dispatch {
                    name,
                    data: packet.d,
                });
            }
            other => debug!("Unhandled gateway op {}", other),
        }
    }

    fn handle_dispatch(&mut self, name: &str, d: &Value, now: Instant) {
        match name {
            dispatch::READY => {
                self.session_id = d["session_id"].as_str().map(str::to_string);
                self.user_id = id_string(&d["user"]["id"]);
                self.resuming = false;
                self.backoff.reset();
                self.bucket.unlock();
                self.set_state(SocketState::Ready);
                if let Some(session_id) = &self.session_id {
                    for entry in self.voices.values() {
                        let _ = entry
                            .socket
                            .command(VoiceCommand::SessionId(session_id.clone()));
                    }
                }
                flush_bucket(&mut self.bucket, self.connection.as_ref(), now);
                info!("Gateway session ready");
                self.emit(GatewayEvent::Ready);
            }
            dispatch::RESUMED => {
                self.resuming = false;
                self.backoff.reset();
                self.bucket.unlock();
                self.set_state(SocketState::Ready);
                flush_bucket(&mut self.bucket, self.connection.as_ref(), now);
                info!("Gateway session resumed at sequence {}", self.sequence);
                self.emit(GatewayEvent::Ready);
            }
            dispatch::GUILD_DELETE => {
                let Some(server_id) = id_string(&d["id"]).map(ServerId::from) else {
                    return;
                };
                if let Some(entry) = self.voices.get(&server_id) {
                    let error = if is_truthy(&d["unavailable"]) {
                        VoiceError::GuildUnavailable
                    } else {
                        VoiceError::LeftGuild
                    };
                    let _ = entry.socket.command(VoiceCommand::Kill(Some(error)));
                }
            }
            dispatch::VOICE_SERVER_UPDATE => {
                let Some(entry) = server_id_of(d).and_then(|id| self.voices.get(&id)) else {
                    return;
                };
                let _ = entry.socket.command(VoiceCommand::ServerUpdate {
                    endpoint: d["endpoint"].as_str().map(str::to_string),
                    token: d["token"].as_str().unwrap_or_default().to_string(),
                });
            }
            dispatch::VOICE_STATE_UPDATE => {
                if self.user_id.is_none() || id_string(&d["user_id"]) != self.user_id {
                    return;
                }
                let Some(entry) = server_id_of(d).and_then(|id| self.voices.get_mut(&id)) else {
                    return;
                };
                let channel_id = id_string(&d["channel_id"]);
                if channel_id.is_some() {
                    entry.channel_id = channel_id.clone();
                }
                let _ = entry.socket.command(VoiceCommand::StateUpdate {
                    session_id: d["session_id"].as_str().map(str::to_string),
                    channel_id,
                });
            }
            _ => {}
        }
    }

    fn voice_connect(
        &mut self,
        guild_id: Option<String>,
        channel_id: Option<String>,
        options: VoiceConnectOptions,
        now: Instant,
    ) -> VoiceJoin {
        let Some(server_id) = guild_id.clone().or_else(|| channel_id.clone()).map(ServerId::from)
        else {
            return VoiceJoin::Done(Err(VoiceError::MissingServer));
        };
        if self
            .voices
            .get(&server_id)
            .is_some_and(|entry| entry.socket.is_closed())
        {
            self.voices.remove(&server_id);
        }

        let socket = match (self.voices.get(&server_id), &channel_id) {
            (Some(entry), None) => {
                entry.socket.kill();
                return VoiceJoin::Done(Ok(None));
            }
            (Some(entry), Some(channel)) if entry.channel_id.as_ref() == Some(channel) => {
                return VoiceJoin::Done(Ok(Some(entry.socket.clone())));
            }
            (Some(entry), Some(_)) => entry.socket.clone(),
            (None, None) => {
                let d = payloads::voice_state(guild_id.as_deref(), None, options.state);
                self.enqueue(op::VOICE_STATE_UPDATE, d, false, None, now);
                return VoiceJoin::Done(Ok(None));
            }
            (None, Some(channel)) => {
                let (Some(user_id), Some(session_id)) =
                    (self.user_id.clone(), self.session_id.clone())
                else {
                    return VoiceJoin::Done(Err(VoiceError::GatewayNotReady));
                };
                let ctx = self.voice_context(
                    server_id.clone(),
                    channel.clone(),
                    user_id,
                    session_id,
                    &options,
                );
                let socket = voice::spawn(ctx);
                self.voices.insert(
                    server_id,
                    VoiceEntry {
                        socket: socket.clone(),
                        channel_id: Some(channel.clone()),
                    },
                );
                socket
            }
        };

        let timeout = options
            .timeout
            .unwrap_or(Duration::from_millis(self.settings.voice.timeout_ms));
        let (reply, wait) = oneshot::channel();
        if socket
            .command(VoiceCommand::Wait {
                reply,
                timeout: Some(timeout),
            })
            .is_err()
        {
            return VoiceJoin::Done(Err(VoiceError::VoiceClosed));
        }

        let d = payloads::voice_state(guild_id.as_deref(), channel_id.as_deref(), options.state);
        self.enqueue(op::VOICE_STATE_UPDATE, d, false, None, now);
        VoiceJoin::Pending(wait)
    }

    fn voice_context(
        &mut self,
        server_id: ServerId,
        channel_id: String,
        user_id: String,
        session_id: String,
        options: &VoiceConnectOptions,
    ) -> VoiceContext {
        self.next_voice_id += 1;
        let voice = &self.settings.voice;
        let config = &self.settings.config;
        VoiceContext {
            id: self.next_voice_id,
            server_id,
            channel_id: Some(channel_id),
            user_id,
            session_id: Some(session_id),
            api_version: voice.api_version,
            receive: options.receive.unwrap_or(voice.receive),
            video: options
                .video
                .unwrap_or(options.state.self_video || voice.video),
            force_mode: options.force_mode.or(self.settings.force_mode),
            bucket: voice.bucket.clone(),
            auto_reconnect: config.auto_reconnect,
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            reconnect_max: config.reconnect_max,
            provider: self.settings.provider.clone(),
            gateway: self.commands.clone(),
            events: self.events.clone(),
        }
    }

    /// Runs expired timers.
    pub fn poll(&mut self, now: Instant) {
        if let Some((at, resumable)) = self.invalid_session {
            if at <= now {
                self.invalid_session = None;
                if resumable {
                    self.resume();
                } else {
                    self.sequence = 0;
                    self.session_id = None;
                    self.identify();
                }
            }
        }

        if self.heartbeat.is_due(now) {
            self.heartbeat.rearm(now);
            if self.heartbeat.ack {
                self.send_heartbeat(now);
            } else {
                warn!("Gateway heartbeat ack never arrived");
                self.reconnect_now(close::HEARTBEAT_ACK, now);
            }
        }

        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            self.connect(now);
        }

        self.pings.expire(now);

        if self.bucket.poll_unlock(now) {
            flush_bucket(&mut self.bucket, self.connection.as_ref(), now);
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Snowflakes may arrive as strings or numbers.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Guild voice is keyed by guild, DM calls by channel.
fn server_id_of(d: &Value) -> Option<ServerId> {
    id_string(&d["guild_id"])
        .or_else(|| id_string(&d["channel_id"]))
        .map(ServerId::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configs::Config,
        transport::websocket::{Dialed, RecordingDialer},
    };
    use bytes::Bytes;
    use flate2::{Compress, Compression, FlushCompress};
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    struct Harness {
        engine: GatewayEngine,
        dials: UnboundedReceiver<Dialed>,
        events: UnboundedReceiver<GatewayEvent>,
        commands: UnboundedReceiver<GatewayCommand>,
        _commands_tx: UnboundedSender<GatewayCommand>,
    }

    fn harness(compress: &str) -> Harness {
        let mut config = Config::default();
        config.gateway.compress = compress.into();
        config.gateway.reconnect_delay_ms = 100;
        let settings = GatewaySettings::resolve("tok".into(), &config, None).unwrap();

        let (commands_tx, commands) = unbounded_channel();
        let (events_tx, events) = unbounded_channel();
        let (dialer, dials) = RecordingDialer::new();
        Harness {
            engine: GatewayEngine::new(settings, Box::new(dialer), commands_tx.downgrade(), events_tx),
            dials,
            events,
            commands,
            _commands_tx: commands_tx,
        }
    }

    fn frame(generation: u64, op: u8, d: Value, s: Option<u64>, t: Option<&str>) -> SocketEvent {
        let text = json!({ "op": op, "d": d, "s": s, "t": t }).to_string();
        SocketEvent {
            generation,
            kind: SocketEventKind::Message(Bytes::from(text)),
        }
    }

    fn sent(outgoing: &mut UnboundedReceiver<Message>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(msg) = outgoing.try_recv() {
            if let Message::Text(text) = msg {
                frames.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        frames
    }

    fn open(h: &mut Harness, now: Instant) -> Dialed {
        h.engine.connect(now);
        let dialed = h.dials.try_recv().unwrap();
        h.engine.handle_socket(
            SocketEvent {
                generation: dialed.generation,
                kind: SocketEventKind::Open,
            },
            now,
        );
        dialed
    }

    fn ready(h: &mut Harness, dialed: &mut Dialed, now: Instant) {
        h.engine.handle_socket(
            frame(dialed.generation, op::HELLO, json!({ "heartbeat_interval": 41250 }), None, None),
            now,
        );
        h.engine.handle_socket(
            frame(
                dialed.generation,
                op::DISPATCH,
                json!({ "session_id": "abc", "user": { "id": "me" } }),
                Some(1),
                Some(dispatch::READY),
            ),
            now,
        );
        sent(&mut dialed.outgoing);
    }

    fn close_event(generation: u64, code: u16) -> SocketEvent {
        SocketEvent {
            generation,
            kind: SocketEventKind::Close {
                code,
                reason: String::new(),
            },
        }
    }

    #[tokio::test]
    async fn hello_without_session_identifies_directly() {
        let mut h = harness("none");
        let now = Instant::now();
        let mut dialed = open(&mut h, now);
        assert_eq!(
            dialed.url.as_str(),
            "wss://gateway.discord.gg/?encoding=json&v=6"
        );

        h.engine.handle_socket(
            frame(dialed.generation, op::HELLO, json!({ "heartbeat_interval": 41250 }), None, None),
            now,
        );
        let frames = sent(&mut dialed.outgoing);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["op"], op::IDENTIFY);
        assert_eq!(frames[0]["d"]["token"], "tok");
        assert_eq!(h.engine.state(), SocketState::Identifying);
        assert_eq!(h.engine.next_deadline(), Some(now + Duration::from_millis(41250)));
    }

    #[tokio::test]
    async fn sequence_gap_resumes_exactly_once() {
        let mut h = harness("none");
        let now = Instant::now();
        let mut dialed = open(&mut h, now);
        ready(&mut h, &mut dialed, now);

        for s in 2..=10 {
            h.engine.handle_socket(
                frame(dialed.generation, op::DISPATCH, json!({}), Some(s), Some("TYPING_START")),
                now,
            );
        }
        assert_eq!(h.engine.sequence(), 10);

        h.engine.handle_socket(
            frame(dialed.generation, op::DISPATCH, json!({}), Some(15), Some("TYPING_START")),
            now,
        );
        assert_eq!(h.engine.sequence(), 10);
        let frames = sent(&mut dialed.outgoing);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["op"], op::RESUME);
        assert_eq!(frames[0]["d"]["seq"], 10);
        assert_eq!(frames[0]["d"]["session_id"], "abc");

        h.engine.handle_socket(
            frame(dialed.generation, op::DISPATCH, json!({}), Some(20), Some("TYPING_START")),
            now,
        );
        assert!(sent(&mut dialed.outgoing).is_empty());

        h.engine.handle_socket(
            frame(dialed.generation, op::DISPATCH, json!({}), Some(21), Some(dispatch::RESUMED)),
            now,
        );
        assert_eq!(h.engine.state(), SocketState::Ready);
    }

    #[tokio::test]
    async fn missed_heartbeat_ack_reconnects_once() {
        let mut h = harness("none");
        let now = Instant::now();
        let mut dialed = open(&mut h, now);
        h.engine.handle_socket(
            frame(dialed.generation, op::HELLO, json!({ "heartbeat_interval": 1000 }), None, None),
            now,
        );
        sent(&mut dialed.outgoing);

        h.engine.poll(now + Duration::from_millis(1000));
        let frames = sent(&mut dialed.outgoing);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["op"], op::HEARTBEAT);
        assert_eq!(frames[0]["d"], Value::Null);
        assert!(h.dials.try_recv().is_err());

        h.engine.poll(now + Duration::from_millis(2000));
        let redial = h.dials.try_recv().unwrap();
        assert_eq!(redial.generation, dialed.generation + 1);
        match dialed.outgoing.try_recv().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), close::HEARTBEAT_ACK),
            other => panic!("expected a close frame, got {other:?}"),
        }

        h.engine.poll(now + Duration::from_millis(3000));
        assert!(h.dials.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_session_reidentifies_after_a_delay() {
        let mut h = harness("none");
        let now = Instant::now();
        let mut dialed = open(&mut h, now);
        ready(&mut h, &mut dialed, now);

        h.engine.handle_socket(
            frame(dialed.generation, op::INVALID_SESSION, json!(false), None, None),
            now,
        );
        let at = h.engine.next_deadline().unwrap();
        assert!(at >= now + Duration::from_secs(INVALID_SESSION_DELAY_MIN_SECS));
        assert!(at <= now + Duration::from_secs(INVALID_SESSION_DELAY_MAX_SECS));
        assert!(sent(&mut dialed.outgoing).is_empty());

        h.engine.poll(at);
        let frames = sent(&mut dialed.outgoing);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["op"], op::IDENTIFY);
        assert_eq!(h.engine.session_id(), None);
        assert_eq!(h.engine.sequence(), 0);
    }

    #[tokio::test]
    async fn compressed_chunks_yield_one_message() {
        let mut h = harness("zlib-stream");
        let now = Instant::now();
        let dialed = open(&mut h, now);
        assert!(dialed.url.as_str().ends_with("&compress=zlib-stream"));
        while h.events.try_recv().is_ok() {}

        let mut compress = Compress::new(Compression::default(), true);
        let payload = br#"{"op":11,"d":null}"#;
        let mut stream = Vec::with_capacity(1024);
        compress
            .compress_vec(payload, &mut stream, FlushCompress::Sync)
            .unwrap();
        let (c1, c2) = stream.split_at(stream.len() / 2);

        for chunk in [c1, c2] {
            h.engine.handle_socket(
                SocketEvent {
                    generation: dialed.generation,
                    kind: SocketEventKind::Message(Bytes::copy_from_slice(chunk)),
                },
                now,
            );
        }

        let packets: Vec<_> = std::iter::from_fn(|| h.events.try_recv().ok())
            .filter_map(|event| match event {
                GatewayEvent::Packet(packet) => Some(packet),
                _ => None,
            })
            .collect();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].op, op::HEARTBEAT_ACK);
    }

    #[tokio::test]
    async fn closes_reconnect_with_backoff_until_fatal() {
        let mut h = harness("none");
        let now = Instant::now();
        let mut dialed = open(&mut h, now);
        ready(&mut h, &mut dialed, now);

        h.engine.handle_socket(close_event(dialed.generation + 1, 4000), now);
        assert_eq!(h.engine.state(), SocketState::Ready);

        h.engine.handle_socket(close_event(dialed.generation, 4000), now);
        assert_eq!(h.engine.state(), SocketState::Closed);
        assert_eq!(h.engine.session_id(), Some("abc"));
        assert_eq!(h.engine.next_deadline(), Some(now + Duration::from_millis(100)));

        h.engine.poll(now + Duration::from_millis(100));
        let redial = h.dials.try_recv().unwrap();

        h.engine.handle_socket(close_event(redial.generation, 4004), now);
        assert!(h.engine.is_killed());
        let names: Vec<_> = std::iter::from_fn(|| h.events.try_recv().ok())
            .map(|event| event.name())
            .collect();
        assert_eq!(names.last(), Some(&"killed"));
    }

    #[tokio::test]
    async fn voice_join_needs_a_server_and_a_session() {
        let mut h = harness("none");
        let now = Instant::now();

        let join = h
            .engine
            .voice_connect(None, None, VoiceConnectOptions::default(), now);
        assert!(matches!(join, VoiceJoin::Done(Err(VoiceError::MissingServer))));

        let join = h.engine.voice_connect(
            Some("g".into()),
            Some("c".into()),
            VoiceConnectOptions::default(),
            now,
        );
        assert!(matches!(join, VoiceJoin::Done(Err(VoiceError::GatewayNotReady))));
    }

    #[tokio::test]
    async fn leaving_the_channel_kills_and_unregisters_the_voice() {
        let mut h = harness("none");
        let now = Instant::now();
        let mut dialed = open(&mut h, now);
        ready(&mut h, &mut dialed, now);

        let join = h.engine.voice_connect(
            Some("g".into()),
            Some("c".into()),
            VoiceConnectOptions::default(),
            now,
        );
        let VoiceJoin::Pending(wait) = join else {
            panic!("expected a pending join");
        };
        let frames = sent(&mut dialed.outgoing);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["op"], op::VOICE_STATE_UPDATE);
        assert_eq!(frames[0]["d"]["guild_id"], "g");
        assert_eq!(frames[0]["d"]["channel_id"], "c");
        let server_id = ServerId::from("g");
        assert!(h.engine.voice(&server_id).is_some());

        h.engine.handle_socket(
            frame(
                dialed.generation,
                op::DISPATCH,
                json!({ "user_id": "me", "guild_id": "g", "channel_id": null, "session_id": "abc" }),
                Some(2),
                Some(dispatch::VOICE_STATE_UPDATE),
            ),
            now,
        );

        assert_eq!(wait.await.unwrap().unwrap_err(), VoiceError::Killed);
        for _ in 0..2 {
            let cmd = h.commands.recv().await.unwrap();
            h.engine.handle_command(cmd, now);
        }
        assert!(h.engine.voice(&server_id).is_none());

        let frames = sent(&mut dialed.outgoing);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["d"]["channel_id"], Value::Null);
    }
}
