use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use serde_json::{Value, json};
use tokio::{
    sync::{
        mpsc::{UnboundedSender, WeakUnboundedSender},
        oneshot,
    },
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};
use url::Url;

use super::VoiceContext;
use crate::{
    common::{
        errors::{ConfigError, PingError, VoiceError},
        types::{ServerId, unix_millis},
    },
    gateway::{
        GatewayCommand, VoiceStateOptions,
        events::GatewayEvent,
        session::{
            backoff::Backoff,
            heartbeat::HeartbeatState,
            types::{SocketState, StateMachine},
        },
    },
    transport::{
        Bucket, Connection, Dialer, GatewayPacket, JsonCodec, OutboundPacket, PayloadCodec,
        PendingSend, PingTracker, SocketEvent, SocketEventKind, close, flush_bucket,
    },
    voice::{
        VoiceCommand, VoiceSocket, WaiterReply,
        constants::{MEDIA_PROTOCOL_UDP, close as voice_close, op},
        encryption::CryptoProvider,
        events::VoiceEvent,
        rtp::{AUDIO_CODECS, EncryptionMode, FrameOptions, MediaKind, VIDEO_CODECS},
        udp_link::{MediaTransport, TransportOptions, UdpEvent, UdpEventKind},
    },
};

struct Waiter {
    reply: WaiterReply,
    deadline: Option<Instant>,
    timeout_ms: u64,
}

/// State and protocol handling of one voice signaling connection and its media
/// transport. Owned by a single actor; every entry point takes the current
/// instant so timers stay deterministic.
pub struct VoiceEngine {
    id: u64,
    server_id: ServerId,
    channel_id: Option<String>,
    user_id: String,
    session_id: Option<String>,
    endpoint: Option<String>,
    token: Option<String>,
    api_version: u8,
    receive: bool,
    video: bool,
    force_mode: Option<EncryptionMode>,
    auto_reconnect: bool,
    provider: Arc<dyn CryptoProvider>,
    state: StateMachine,
    identified: bool,
    killed: bool,
    heartbeat: HeartbeatState,
    bucket: Bucket<PendingSend>,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
    dialer: Box<dyn Dialer>,
    connection: Option<Connection>,
    generation: u64,
    transport: Option<MediaTransport>,
    udp_generation: u64,
    udp_tx: UnboundedSender<UdpEvent>,
    audio_ssrcs: HashMap<u32, String>,
    video_ssrcs: HashMap<u32, String>,
    waiters: Vec<Waiter>,
    pings: PingTracker,
    gateway: WeakUnboundedSender<GatewayCommand>,
    events: UnboundedSender<GatewayEvent>,
    handle: WeakUnboundedSender<VoiceCommand>,
}

impl VoiceEngine {
    pub fn new(
        ctx: VoiceContext,
        dialer: Box<dyn Dialer>,
        udp_tx: UnboundedSender<UdpEvent>,
        handle: WeakUnboundedSender<VoiceCommand>,
    ) -> Self {
        let mut bucket = Bucket::new(
            ctx.bucket.limit,
            Duration::from_millis(ctx.bucket.window_ms),
        );
        bucket.lock(None, Instant::now());

        Self {
            id: ctx.id,
            server_id: ctx.server_id,
            channel_id: ctx.channel_id,
            user_id: ctx.user_id,
            session_id: ctx.session_id,
            endpoint: None,
            token: None,
            api_version: ctx.api_version,
            receive: ctx.receive,
            video: ctx.video,
            force_mode: ctx.force_mode,
            auto_reconnect: ctx.auto_reconnect,
            provider: ctx.provider,
            state: StateMachine::default(),
            identified: false,
            killed: false,
            heartbeat: HeartbeatState::default(),
            bucket,
            backoff: Backoff::new(ctx.reconnect_delay, ctx.reconnect_max),
            reconnect_at: None,
            dialer,
            connection: None,
            generation: 0,
            transport: None,
            udp_generation: 0,
            udp_tx,
            audio_ssrcs: HashMap::new(),
            video_ssrcs: HashMap::new(),
            waiters: Vec::new(),
            pings: PingTracker::new(),
            gateway: ctx.gateway,
            events: ctx.events,
            handle,
        }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn state(&self) -> SocketState {
        self.state.get()
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.channel_id.as_deref()
    }

    /// A DM call uses the channel id as its server id.
    pub fn in_dm(&self) -> bool {
        self.channel_id.as_deref() == Some(&*self.server_id)
    }

    fn guild_id(&self) -> Option<String> {
        (!self.in_dm()).then(|| self.server_id.0.clone())
    }

    pub fn ssrc_to_user_id(&self, ssrc: u32, kind: MediaKind) -> Option<&str> {
        self.ssrcs(kind).get(&ssrc).map(String::as_str)
    }

    pub fn user_id_to_ssrc(&self, user_id: &str, kind: MediaKind) -> Option<u32> {
        self.ssrcs(kind)
            .iter()
            .find(|(_, uid)| uid.as_str() == user_id)
            .map(|(ssrc, _)| *ssrc)
    }

    fn ssrcs(&self, kind: MediaKind) -> &HashMap<u32, String> {
        match kind {
            MediaKind::Audio => &self.audio_ssrcs,
            MediaKind::Video => &self.video_ssrcs,
        }
    }

    /// The earliest instant [`VoiceEngine::poll`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.heartbeat.next_at,
            self.reconnect_at,
            self.pings.next_deadline(),
            self.bucket.unlock_deadline(),
            self.waiters.iter().filter_map(|w| w.deadline).min(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn emit(&self, event: VoiceEvent) {
        let _ = self.events.send(GatewayEvent::Voice {
            server_id: self.server_id.clone(),
            event,
        });
    }

    fn warn(&self, error: VoiceError) {
        warn!("[{}] {}", self.server_id, error);
        self.emit(VoiceEvent::Warn(error));
    }

    fn set_state(&mut self, to: SocketState) {
        if self.state.transition(to) {
            self.emit(VoiceEvent::State(to));
        }
    }

    fn send_gateway(&self, cmd: GatewayCommand) -> Result<(), VoiceError> {
        let gateway = self.gateway.upgrade().ok_or(VoiceError::GatewayClosed)?;
        gateway.send(cmd).map_err(|_| VoiceError::GatewayClosed)
    }

    pub fn handle_command(&mut self, cmd: VoiceCommand, now: Instant) {
        match cmd {
            VoiceCommand::ServerUpdate { endpoint, token } => {
                self.set_endpoint(endpoint);
                self.token = Some(token);
                self.connect(now);
            }
            VoiceCommand::StateUpdate {
                session_id,
                channel_id,
            } => match channel_id {
                None => self.kill(None, now),
                Some(_) if session_id != self.session_id => {
                    self.kill(Some(VoiceError::ForeignSession), now)
                }
                Some(channel_id) => {
                    self.channel_id = Some(channel_id);
                    if self.state() == SocketState::Ready {
                        self.resolve_waiters();
                    }
                }
            },
            VoiceCommand::SessionId(session_id) => self.session_id = Some(session_id),
            VoiceCommand::Wait { reply, timeout } => {
                let timeout = timeout.filter(|t| !t.is_zero());
                self.waiters.push(Waiter {
                    reply,
                    deadline: timeout.map(|t| now + t),
                    timeout_ms: timeout.map_or(0, |t| t.as_millis() as u64),
                });
            }
            VoiceCommand::SendFrame {
                kind,
                payload,
                options,
                reply,
            } => {
                let _ = reply.send(self.send_frame(kind, &payload, options));
            }
            VoiceCommand::SendSilence { reply } => {
                let result = match self.transport.as_mut() {
                    Some(transport) => transport.send_audio_silence_frame(),
                    None => Err(VoiceError::NotConnected),
                };
                let _ = reply.send(result);
            }
            VoiceCommand::Speaking { flags, delay, done } => {
                let ssrc = self.transport.as_ref().map_or(0, MediaTransport::ssrc);
                self.enqueue(
                    op::SPEAKING,
                    json!({ "delay": delay, "speaking": flags, "ssrc": ssrc }),
                    done,
                    now,
                );
            }
            VoiceCommand::UpdateState { options, done } => {
                let cmd = GatewayCommand::VoiceStateUpdate {
                    guild_id: self.guild_id(),
                    channel_id: self.channel_id.clone(),
                    options,
                    done,
                };
                if let Err(e) = self.send_gateway(cmd) {
                    self.warn(e);
                }
            }
            VoiceCommand::SsrcToUser { ssrc, kind, reply } => {
                let _ = reply.send(self.ssrc_to_user_id(ssrc, kind).map(str::to_string));
            }
            VoiceCommand::UserToSsrc {
                user_id,
                kind,
                reply,
            } => {
                let _ = reply.send(self.user_id_to_ssrc(&user_id, kind));
            }
            VoiceCommand::Ping { timeout, reply } => match &self.connection {
                Some(connection) => {
                    let frame = self.pings.start(now, timeout, reply);
                    let _ = connection.send(frame);
                }
                None => {
                    let _ = reply.send(Err(PingError::Closed));
                }
            },
            VoiceCommand::Kill(error) => self.kill(error, now),
        }
    }

    pub fn send_frame(
        &mut self,
        kind: MediaKind,
        payload: &[u8],
        options: FrameOptions,
    ) -> Result<usize, VoiceError> {
        let transport = self.transport.as_mut().ok_or(VoiceError::NotConnected)?;
        transport.send_frame(kind, payload, options)
    }

    fn set_endpoint(&mut self, endpoint: Option<String>) {
        self.endpoint = endpoint
            .filter(|e| !e.is_empty())
            .map(|e| format!("wss://{}", e.split(':').next().unwrap_or_default()));
        self.identified = false;
    }

    /// Dials the voice endpoint once the endpoint, token and session id are
    /// all known.
    pub fn connect(&mut self, now: Instant) {
        if self.killed {
            return;
        }
        let (Some(endpoint), Some(_), Some(_)) = (&self.endpoint, &self.token, &self.session_id)
        else {
            debug!(
                "[{}] Waiting for endpoint, token and session before connecting",
                self.server_id
            );
            return;
        };

        let mut url = match Url::parse(endpoint) {
            Ok(url) => url,
            Err(_) => {
                let error = ConfigError::InvalidUrl(endpoint.clone());
                self.warn(error.into());
                return;
            }
        };
        url.query_pairs_mut()
            .append_pair("v", &self.api_version.to_string());

        if self.connection.is_some() {
            self.disconnect(close::NORMAL, now);
        }

        self.generation += 1;
        self.reconnect_at = None;
        debug!("[{}] Connecting to voice gateway: {}", self.server_id, url);
        self.set_state(SocketState::Connecting);
        self.connection = Some(self.dialer.dial(url, self.generation));
    }

    pub fn handle_socket(&mut self, event: SocketEvent, now: Instant) {
        if self.connection.as_ref().map(Connection::generation) != Some(event.generation) {
            debug!(
                "[{}] Ignoring event of stale voice connection {}",
                self.server_id, event.generation
            );
            return;
        }

        match event.kind {
            SocketEventKind::Open => {
                self.emit(VoiceEvent::Open);
                self.set_state(SocketState::Open);
                if self.identified && self.transport.is_some() {
                    self.resume();
                } else {
                    self.identify();
                }
            }
            SocketEventKind::Message(data) => self.handle_message(&data, now),
            SocketEventKind::Pong(payload) => {
                self.pings.on_pong(&payload, now);
            }
            SocketEventKind::Close { code, reason } => self.on_close(code, &reason, now),
            SocketEventKind::Error(error) => self.warn(VoiceError::Socket(error)),
        }
    }

    fn encode(&self, op: u8, d: Value) -> Option<tokio_tungstenite::tungstenite::Message> {
        match JsonCodec.encode(&OutboundPacket::new(op, d)) {
            Ok(message) => Some(message),
            Err(e) => {
                self.warn(VoiceError::Decode(e.to_string()));
                None
            }
        }
    }

    /// Writes a frame immediately, skipping the bucket.
    fn send_direct(&self, op: u8, d: Value) -> bool {
        let Some(message) = self.encode(op, d) else {
            return false;
        };
        self.connection
            .as_ref()
            .is_some_and(|c| c.send(message).is_ok())
    }

    fn enqueue(&mut self, op: u8, d: Value, done: Option<oneshot::Sender<()>>, now: Instant) {
        let Some(message) = self.encode(op, d) else {
            return;
        };
        self.bucket.add(PendingSend::new(message, done), false);
        flush_bucket(&mut self.bucket, self.connection.as_ref(), now);
    }

    fn identify(&mut self) {
        debug!("[{}] Identifying voice session", self.server_id);
        let d = json!({
            "server_id": self.server_id,
            "session_id": self.session_id,
            "token": self.token,
            "user_id": self.user_id,
            "video": self.video,
        });
        self.send_direct(op::IDENTIFY, d);
        self.set_state(SocketState::Identifying);
    }

    fn resume(&mut self) {
        debug!("[{}] Resuming voice session", self.server_id);
        let d = json!({
            "server_id": self.server_id,
            "session_id": self.session_id,
            "token": self.token,
        });
        self.send_direct(op::RESUME, d);
        self.set_state(SocketState::Resuming);
    }

    fn send_heartbeat(&mut self, now: Instant) {
        let nonce = unix_millis();
        if self.send_direct(op::HEARTBEAT, json!(nonce)) {
            self.heartbeat.sent(now, Some(nonce));
        }
    }

    fn handle_message(&mut self, data: &[u8], now: Instant) {
        let packet: GatewayPacket = match JsonCodec.decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                self.warn(VoiceError::Decode(e.to_string()));
                return;
            }
        };
        self.emit(VoiceEvent::Packet(packet.clone()));

        let d = &packet.d;
        match packet.op {
            op::READY => {
                self.backoff.reset();
                self.identified = true;
                self.bucket.unlock();

                let ssrc = d["ssrc"].as_u64().unwrap_or_default() as u32;
                let ip = d["ip"].as_str().unwrap_or_default().to_string();
                let port = d["port"].as_u64().unwrap_or_default() as u16;
                let modes: Vec<String> = d["modes"]
                    .as_array()
                    .map(|modes| {
                        modes
                            .iter()
                            .filter_map(|m| m.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();

                self.audio_ssrcs.insert(ssrc, self.user_id.clone());
                if let Err(e) = self.transport_connect(ssrc, &ip, port, modes) {
                    self.warn(e.clone());
                    self.kill(Some(e), now);
                    return;
                }
                flush_bucket(&mut self.bucket, self.connection.as_ref(), now);
            }
            op::SESSION_DESCRIPTION => {
                let Some(transport) = self.transport.as_mut() else {
                    self.warn(VoiceError::NotConnected);
                    return;
                };
                match apply_session_description(transport, d) {
                    Ok(event) => {
                        info!("[{}] Voice transport ready", self.server_id);
                        self.emit(event);
                    }
                    Err(e @ VoiceError::UnsupportedCodec { .. }) => {
                        self.warn(e.clone());
                        self.kill(Some(e), now);
                    }
                    Err(e) => self.warn(e),
                }
            }
            op::SESSION_UPDATE => {
                if let Some(transport) = self.transport.as_mut() {
                    let codecs =
                        transport.set_codecs(d["audio_codec"].as_str(), d["video_codec"].as_str());
                    transport.set_transport_id(id_string(&d["media_session_id"]));
                    if let Err(e) = codecs {
                        self.warn(e);
                    }
                }
            }
            op::SPEAKING => {
                if let (Some(ssrc), Some(user_id)) = (d["ssrc"].as_u64(), d["user_id"].as_str()) {
                    self.audio_ssrcs.insert(ssrc as u32, user_id.to_string());
                }
            }
            op::CLIENT_CONNECT => {
                let Some(user_id) = d["user_id"].as_str() else {
                    return;
                };
                if let Some(ssrc) = d["audio_ssrc"].as_u64() {
                    self.audio_ssrcs.insert(ssrc as u32, user_id.to_string());
                }
                if let Some(ssrc) = d["video_ssrc"].as_u64().filter(|s| *s != 0) {
                    self.video_ssrcs.insert(ssrc as u32, user_id.to_string());
                }
            }
            op::CLIENT_DISCONNECT => {
                if let Some(user_id) = d["user_id"].as_str() {
                    self.audio_ssrcs.retain(|_, uid| uid != user_id);
                    self.video_ssrcs.retain(|_, uid| uid != user_id);
                }
            }
            op::HELLO => {
                let interval = d["heartbeat_interval"].as_f64().unwrap_or_default();
                if interval > 0.0 {
                    self.heartbeat
                        .start(Duration::from_millis(interval as u64), now);
                    self.send_heartbeat(now);
                }
            }
            op::HEARTBEAT_ACK => {
                if d.as_u64() != self.heartbeat.nonce {
                    debug!(
                        "[{}] Heartbeat ack nonce {} doesn't match {:?}",
                        self.server_id, d, self.heartbeat.nonce
                    );
                    self.disconnect(close::HEARTBEAT_ACK_NONCE, now);
                    self.connect(now);
                    return;
                }
                self.heartbeat.acked(now);
            }
            op::RESUMED => {
                self.backoff.reset();
                self.bucket.unlock();
                self.set_state(SocketState::Ready);
                flush_bucket(&mut self.bucket, self.connection.as_ref(), now);
                self.resolve_waiters();
                self.emit(VoiceEvent::Ready);
            }
            other => debug!("[{}] Unhandled voice op {}", self.server_id, other),
        }
    }

    /// Fails when the session can never carry media: no common encryption
    /// mode or an unusable media address.
    fn transport_connect(
        &mut self,
        ssrc: u32,
        ip: &str,
        port: u16,
        modes: Vec<String>,
    ) -> Result<(), VoiceError> {
        if let Some(mut old) = self.transport.take() {
            old.close();
        }

        let mode = EncryptionMode::select(self.force_mode, &modes)
            .ok_or(VoiceError::NoEncryptionMode(modes))?;
        let ip = ip
            .parse::<IpAddr>()
            .map_err(|_| VoiceError::Udp(format!("invalid media address `{ip}`")))?;
        let remote = SocketAddr::new(ip, port);

        let mut transport = MediaTransport::new(TransportOptions {
            ssrc,
            remote,
            mode,
            video: self.video,
            receive: self.receive,
            provider: self.provider.clone(),
        });
        self.udp_generation += 1;
        let connected = transport.connect(self.udp_generation, self.udp_tx.clone());
        self.transport = Some(transport);

        debug!(
            "[{}] Media transport to {} using {} (ssrc {})",
            self.server_id, remote, mode, ssrc
        );
        self.emit(VoiceEvent::Transport { mode, ssrc, remote });
        if let Err(e) = connected {
            self.warn(e);
        }
        Ok(())
    }

    pub fn handle_udp(&mut self, event: UdpEvent, now: Instant) {
        if event.generation != self.udp_generation || self.transport.is_none() {
            return;
        }

        match event.kind {
            UdpEventKind::Discovered { ip, port } => self.on_discovered(ip, port, now),
            UdpEventKind::Datagram { from, data } => {
                let Some(transport) = self.transport.as_ref() else {
                    return;
                };
                let decoded = transport.decode_packet(from, &data, |ssrc, kind| {
                    self.ssrc_to_user_id(ssrc, kind).map(str::to_string)
                });
                match decoded {
                    Ok(Some(packet)) => self.emit(VoiceEvent::MediaPacket(packet)),
                    Ok(None) => {}
                    Err(e) if e.is_noise() => debug!("[{}] {}", self.server_id, e),
                    Err(e) => self.warn(e.into()),
                }
            }
            UdpEventKind::Error(e) => self.warn(e),
        }
    }

    fn on_discovered(&mut self, ip: String, port: u16, now: Instant) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        transport.set_local(ip.clone(), port);
        let mode = transport.mode();
        let video = transport.video_enabled();
        let (audio_ssrc, video_ssrc, rtx_ssrc) = if video {
            (transport.ssrc(), transport.video_ssrc(), transport.rtx_ssrc())
        } else {
            (transport.ssrc(), 0, 0)
        };
        debug!(
            "[{}] IP discovery finished: {}:{}",
            self.server_id, ip, port
        );

        self.enqueue(
            op::SELECT_PROTOCOL,
            json!({
                "codecs": codec_list(video),
                "data": { "address": ip, "mode": mode.as_str(), "port": port },
                "protocol": MEDIA_PROTOCOL_UDP,
            }),
            None,
            now,
        );
        self.enqueue(
            op::CLIENT_CONNECT,
            json!({
                "audio_ssrc": audio_ssrc,
                "video_ssrc": video_ssrc,
                "rtx_ssrc": rtx_ssrc,
            }),
            None,
            now,
        );

        self.set_state(SocketState::Ready);
        self.resolve_waiters();
        info!("[{}] Voice session ready", self.server_id);
        self.emit(VoiceEvent::Ready);
    }

    /// Runs expired timers.
    pub fn poll(&mut self, now: Instant) {
        if let Some(timeout_ms) = self
            .waiters
            .iter()
            .find(|w| w.deadline.is_some_and(|d| d <= now))
            .map(|w| w.timeout_ms)
        {
            self.kill(Some(VoiceError::Timeout(timeout_ms)), now);
            return;
        }

        if self.heartbeat.is_due(now) {
            self.heartbeat.rearm(now);
            if self.heartbeat.last_sent.is_some() && !self.heartbeat.ack {
                warn!("[{}] Voice heartbeat ack never arrived", self.server_id);
                self.disconnect(close::HEARTBEAT_ACK, now);
                self.connect(now);
            } else {
                self.send_heartbeat(now);
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

    fn cleanup(&mut self, code: u16, now: Instant) {
        self.bucket.clear();
        self.bucket.lock(None, now);
        if matches!(
            code,
            close::NORMAL | voice_close::DISCONNECTED | voice_close::VOICE_SERVER_CRASHED
        ) {
            self.identified = false;
        }
        self.heartbeat.reset();
        self.pings.reject_all();
        self.set_state(SocketState::Closed);
    }

    /// Closes the current connection ourselves. Its close event will be stale
    /// and ignored, so the close is reported here.
    pub fn disconnect(&mut self, code: u16, now: Instant) {
        self.cleanup(code, now);
        if let Some(connection) = self.connection.take() {
            let reason = close::describe(code, "");
            connection.close(code, &reason);
            self.emit(VoiceEvent::Close { code, reason });
        }
    }

    fn on_close(&mut self, code: u16, reason: &str, now: Instant) {
        let reason = close::describe(code, reason);
        info!(
            "[{}] Voice socket closed: code={}, reason='{}'",
            self.server_id, code, reason
        );
        self.emit(VoiceEvent::Close {
            code,
            reason: reason.clone(),
        });
        self.connection = None;
        self.cleanup(code, now);
        if self.killed {
            return;
        }

        match code {
            voice_close::AUTHENTICATION_FAILED | voice_close::DISCONNECTED => {
                self.kill(Some(VoiceError::Closed { code, reason }), now);
            }
            _ if !self.auto_reconnect => {}
            _ if self.backoff.is_exhausted() => {
                warn!("[{}] Max voice reconnect attempts reached", self.server_id);
                self.kill(None, now);
            }
            _ => {
                let delay = self.backoff.next();
                debug!(
                    "[{}] Reconnecting voice in {:?} (attempt {})",
                    self.server_id,
                    delay,
                    self.backoff.attempts()
                );
                self.reconnect_at = Some(now + delay);
            }
        }
    }

    fn resolve_waiters(&mut self) {
        if self.waiters.is_empty() {
            return;
        }
        let socket = self
            .handle
            .upgrade()
            .map(|tx| VoiceSocket::new(self.id, self.server_id.clone(), tx));
        for waiter in self.waiters.drain(..) {
            let _ = waiter
                .reply
                .send(socket.clone().ok_or(VoiceError::VoiceClosed));
        }
    }

    /// Tears the session down for good: leaves the channel, unregisters from
    /// the gateway, closes both transports and fails pending callers.
    pub fn kill(&mut self, error: Option<VoiceError>, now: Instant) {
        if self.killed {
            return;
        }
        self.killed = true;

        let leave = GatewayCommand::VoiceStateUpdate {
            guild_id: self.guild_id(),
            channel_id: None,
            options: VoiceStateOptions::default(),
            done: None,
        };
        let remove = GatewayCommand::RemoveVoice {
            server_id: self.server_id.clone(),
            id: self.id,
        };
        if self.send_gateway(leave).and(self.send_gateway(remove)).is_err() {
            debug!("[{}] Gateway already gone while killing voice", self.server_id);
        }

        self.disconnect(close::NORMAL, now);
        self.reconnect_at = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.audio_ssrcs.clear();
        self.video_ssrcs.clear();

        let error = error.unwrap_or(VoiceError::Killed);
        info!("[{}] Voice session killed: {}", self.server_id, error);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.reply.send(Err(error.clone()));
        }
        self.emit(VoiceEvent::Killed);
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

fn apply_session_description(
    transport: &mut MediaTransport,
    d: &Value,
) -> Result<VoiceEvent, VoiceError> {
    transport.set_codecs(d["audio_codec"].as_str(), d["video_codec"].as_str())?;

    let key: Vec<u8> = d["secret_key"]
        .as_array()
        .map(|bytes| {
            bytes
                .iter()
                .filter_map(|b| b.as_u64().map(|b| b as u8))
                .collect()
        })
        .unwrap_or_default();
    transport.set_key(&key)?;

    if let Some(mode) = d["mode"].as_str() {
        transport.set_mode(mode.parse::<EncryptionMode>()?);
    }
    transport.set_transport_id(id_string(&d["media_session_id"]));

    Ok(VoiceEvent::TransportReady {
        audio_codec: transport.audio_codec(),
        video_codec: transport.video_codec(),
        mode: transport.mode(),
        transport_id: transport.transport_id().map(str::to_string),
    })
}

/// Every codec we can frame, for SELECT_PROTOCOL.
fn codec_list(video: bool) -> Vec<Value> {
    let mut codecs: Vec<Value> = AUDIO_CODECS
        .iter()
        .enumerate()
        .map(|(i, codec)| {
            json!({
                "name": codec.name(),
                "payload_type": codec.payload_type(),
                "priority": (i + 1) * 1000,
                "type": MediaKind::Audio.as_str(),
            })
        })
        .collect();
    if video {
        codecs.extend(VIDEO_CODECS.iter().enumerate().map(|(i, codec)| {
            json!({
                "name": codec.name(),
                "payload_type": codec.payload_type(),
                "priority": (i + 1) * 1000,
                "rtx_payload_type": codec.payload_type() + 1,
                "type": MediaKind::Video.as_str(),
            })
        }));
    }
    codecs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configs::BucketConfig,
        transport::websocket::{Dialed, RecordingDialer},
        voice::encryption::XSalsaProvider,
    };
    use bytes::Bytes;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
    use tokio_tungstenite::tungstenite::Message;

    struct Harness {
        engine: VoiceEngine,
        dials: UnboundedReceiver<Dialed>,
        gateway: UnboundedReceiver<GatewayCommand>,
        events: UnboundedReceiver<GatewayEvent>,
        _gateway_tx: UnboundedSender<GatewayCommand>,
        _handle_tx: UnboundedSender<VoiceCommand>,
    }

    fn harness() -> Harness {
        let (gateway_tx, gateway) = unbounded_channel();
        let (events_tx, events) = unbounded_channel();
        let (handle_tx, _handle_rx) = unbounded_channel();
        let (udp_tx, _udp_rx) = unbounded_channel();
        let (dialer, dials) = RecordingDialer::new();

        let ctx = VoiceContext {
            id: 1,
            server_id: "guild".into(),
            channel_id: Some("channel".into()),
            user_id: "me".into(),
            session_id: Some("session".into()),
            api_version: 5,
            receive: true,
            video: false,
            force_mode: None,
            bucket: BucketConfig::default(),
            auto_reconnect: true,
            reconnect_delay: Duration::from_millis(100),
            reconnect_max: 3,
            provider: Arc::new(XSalsaProvider),
            gateway: gateway_tx.downgrade(),
            events: events_tx,
        };
        Harness {
            engine: VoiceEngine::new(ctx, Box::new(dialer), udp_tx, handle_tx.downgrade()),
            dials,
            gateway,
            events,
            _gateway_tx: gateway_tx,
            _handle_tx: handle_tx,
        }
    }

    fn frame(generation: u64, op: u8, d: Value) -> SocketEvent {
        SocketEvent {
            generation,
            kind: SocketEventKind::Message(Bytes::from(json!({ "op": op, "d": d }).to_string())),
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
        h.engine.handle_command(
            VoiceCommand::ServerUpdate {
                endpoint: Some("voice.example.com:443".into()),
                token: "secret".into(),
            },
            now,
        );
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

    #[tokio::test]
    async fn connects_once_endpoint_token_and_session_are_known() {
        let mut h = harness();
        let now = Instant::now();
        let mut dialed = open(&mut h, now);

        assert_eq!(dialed.url.as_str(), "wss://voice.example.com/?v=5");
        let frames = sent(&mut dialed.outgoing);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["op"], op::IDENTIFY);
        assert_eq!(frames[0]["d"]["server_id"], "guild");
        assert_eq!(frames[0]["d"]["session_id"], "session");
        assert_eq!(frames[0]["d"]["token"], "secret");
        assert_eq!(frames[0]["d"]["user_id"], "me");
        assert_eq!(frames[0]["d"]["video"], false);
        assert_eq!(h.engine.state(), SocketState::Identifying);
    }

    #[tokio::test]
    async fn ready_without_a_common_mode_kills_the_session() {
        let mut h = harness();
        let now = Instant::now();
        let (reply, mut rx) = oneshot::channel();
        h.engine.handle_command(
            VoiceCommand::Wait {
                reply,
                timeout: Some(Duration::ZERO),
            },
            now,
        );
        let dialed = open(&mut h, now);

        h.engine.handle_socket(
            frame(
                dialed.generation,
                op::READY,
                json!({
                    "ssrc": 1,
                    "ip": "127.0.0.1",
                    "port": 5000,
                    "modes": ["aead_aes256_gcm_rtpsize"],
                }),
            ),
            now,
        );

        assert!(h.engine.is_killed());
        assert_eq!(
            rx.try_recv().unwrap().unwrap_err(),
            VoiceError::NoEncryptionMode(vec!["aead_aes256_gcm_rtpsize".into()])
        );
        assert!(
            std::iter::from_fn(|| h.gateway.try_recv().ok())
                .any(|cmd| matches!(cmd, GatewayCommand::RemoveVoice { .. }))
        );
    }

    #[tokio::test]
    async fn ready_with_a_bad_media_address_kills_the_session() {
        let mut h = harness();
        let now = Instant::now();
        let (reply, mut rx) = oneshot::channel();
        h.engine.handle_command(VoiceCommand::Wait { reply, timeout: None }, now);
        let dialed = open(&mut h, now);

        h.engine.handle_socket(
            frame(
                dialed.generation,
                op::READY,
                json!({
                    "ssrc": 1,
                    "ip": "not an ip",
                    "port": 5000,
                    "modes": ["xsalsa20_poly1305_lite"],
                }),
            ),
            now,
        );

        assert!(h.engine.is_killed());
        assert!(matches!(
            rx.try_recv().unwrap().unwrap_err(),
            VoiceError::Udp(_)
        ));
    }

    #[tokio::test]
    async fn waiting_caller_times_out_and_session_is_removed() {
        let mut h = harness();
        let now = Instant::now();
        let (reply, mut rx) = oneshot::channel();
        h.engine.handle_command(
            VoiceCommand::Wait {
                reply,
                timeout: Some(Duration::from_millis(30_000)),
            },
            now,
        );
        assert_eq!(h.engine.next_deadline(), Some(now + Duration::from_millis(30_000)));

        h.engine.poll(now + Duration::from_millis(29_999));
        assert!(rx.try_recv().is_err());
        assert!(!h.engine.is_killed());

        h.engine.poll(now + Duration::from_millis(30_000));
        assert!(h.engine.is_killed());
        assert_eq!(rx.try_recv().unwrap().unwrap_err(), VoiceError::Timeout(30_000));

        let mut saw_leave = false;
        let mut saw_remove = false;
        while let Ok(cmd) = h.gateway.try_recv() {
            match cmd {
                GatewayCommand::VoiceStateUpdate {
                    guild_id,
                    channel_id,
                    ..
                } => {
                    assert_eq!(guild_id.as_deref(), Some("guild"));
                    assert_eq!(channel_id, None);
                    saw_leave = true;
                }
                GatewayCommand::RemoveVoice { server_id, id } => {
                    assert_eq!(server_id, ServerId::from("guild"));
                    assert_eq!(id, 1);
                    saw_remove = true;
                }
                _ => {}
            }
        }
        assert!(saw_leave && saw_remove);

        let mut killed = false;
        while let Ok(event) = h.events.try_recv() {
            killed |= event.name() == "killed";
        }
        assert!(killed);
    }

    #[tokio::test]
    async fn mismatched_heartbeat_ack_reconnects() {
        let mut h = harness();
        let now = Instant::now();
        let mut dialed = open(&mut h, now);

        h.engine
            .handle_socket(frame(dialed.generation, op::HELLO, json!({ "heartbeat_interval": 13750.0 })), now);
        let frames = sent(&mut dialed.outgoing);
        let heartbeat = frames.iter().find(|f| f["op"] == op::HEARTBEAT).unwrap();
        let nonce = heartbeat["d"].as_u64().unwrap();

        h.engine
            .handle_socket(frame(dialed.generation, op::HEARTBEAT_ACK, json!(nonce + 1)), now);

        let redial = h.dials.try_recv().unwrap();
        assert_eq!(redial.generation, dialed.generation + 1);
        let closed = dialed.outgoing.try_recv().unwrap();
        match closed {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4803),
            other => panic!("expected a close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missed_heartbeat_ack_reconnects_once() {
        let mut h = harness();
        let now = Instant::now();
        let dialed = open(&mut h, now);
        h.engine
            .handle_socket(frame(dialed.generation, op::HELLO, json!({ "heartbeat_interval": 1000 })), now);

        h.engine.poll(now + Duration::from_millis(1000));
        let redial = h.dials.try_recv().unwrap();
        assert_eq!(redial.generation, dialed.generation + 1);
        assert!(h.dials.try_recv().is_err());
    }

    #[tokio::test]
    async fn ssrc_maps_follow_connects_and_disconnects() {
        let mut h = harness();
        let now = Instant::now();
        let dialed = open(&mut h, now);
        let generation = dialed.generation;

        h.engine.handle_socket(
            frame(generation, op::CLIENT_CONNECT, json!({ "user_id": "42", "audio_ssrc": 100, "video_ssrc": 101 })),
            now,
        );
        h.engine.handle_socket(
            frame(generation, op::SPEAKING, json!({ "user_id": "43", "ssrc": 200, "speaking": 1 })),
            now,
        );
        assert_eq!(h.engine.ssrc_to_user_id(100, MediaKind::Audio), Some("42"));
        assert_eq!(h.engine.ssrc_to_user_id(101, MediaKind::Video), Some("42"));
        assert_eq!(h.engine.user_id_to_ssrc("43", MediaKind::Audio), Some(200));

        h.engine.handle_socket(frame(generation, op::CLIENT_DISCONNECT, json!({ "user_id": "42" })), now);
        assert_eq!(h.engine.user_id_to_ssrc("42", MediaKind::Audio), None);
        assert_eq!(h.engine.user_id_to_ssrc("42", MediaKind::Video), None);
        assert_eq!(h.engine.ssrc_to_user_id(200, MediaKind::Audio), Some("43"));
    }

    #[tokio::test]
    async fn foreign_session_kills() {
        let mut h = harness();
        let now = Instant::now();
        let (reply, mut rx) = oneshot::channel();
        h.engine
            .handle_command(VoiceCommand::Wait { reply, timeout: None }, now);
        h.engine.handle_command(
            VoiceCommand::StateUpdate {
                session_id: Some("other".into()),
                channel_id: Some("channel".into()),
            },
            now,
        );
        assert!(h.engine.is_killed());
        assert_eq!(rx.try_recv().unwrap().unwrap_err(), VoiceError::ForeignSession);
    }

    #[tokio::test]
    async fn stale_connection_events_are_ignored() {
        let mut h = harness();
        let now = Instant::now();
        let dialed = open(&mut h, now);

        h.engine.handle_socket(
            SocketEvent {
                generation: dialed.generation + 7,
                kind: SocketEventKind::Close {
                    code: 4006,
                    reason: String::new(),
                },
            },
            now,
        );
        assert_eq!(h.engine.state(), SocketState::Identifying);
    }

    #[tokio::test]
    async fn close_schedules_bounded_reconnects() {
        let mut h = harness();
        let mut now = Instant::now();
        let mut dialed = open(&mut h, now);

        for attempt in 0..3 {
            h.engine.handle_socket(
                SocketEvent {
                    generation: dialed.generation,
                    kind: SocketEventKind::Close {
                        code: 4006,
                        reason: String::new(),
                    },
                },
                now,
            );
            assert_eq!(h.engine.state(), SocketState::Closed);
            let at = h.engine.next_deadline().unwrap();
            assert_eq!(at - now, Duration::from_millis(100 << attempt));
            now = at;
            h.engine.poll(now);
            dialed = h.dials.try_recv().unwrap();
        }

        h.engine.handle_socket(
            SocketEvent {
                generation: dialed.generation,
                kind: SocketEventKind::Close {
                    code: 4006,
                    reason: String::new(),
                },
            },
            now,
        );
        assert!(h.engine.is_killed());
    }

    #[test]
    fn codec_list_priorities() {
        let audio_only = codec_list(false);
        assert_eq!(audio_only.len(), 1);
        assert_eq!(audio_only[0]["name"], "opus");
        assert_eq!(audio_only[0]["priority"], 1000);
        assert_eq!(audio_only[0]["payload_type"], 120);

        let with_video = codec_list(true);
        assert_eq!(with_video.len(), 4);
        assert_eq!(with_video[3]["name"], "H264");
        assert_eq!(with_video[3]["priority"], 3000);
        assert_eq!(with_video[3]["rtx_payload_type"], 0x69 + 1);
    }
}
