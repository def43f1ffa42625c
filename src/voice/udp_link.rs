use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::Bytes;
use tokio::{net::UdpSocket, sync::mpsc::UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    common::errors::{MediaPacketError, VoiceError},
    voice::{
        constants::{
            DISCOVERY_PACKET_SIZE, RTP_HEADER_LEN, SILENCE_FRAME, UDP_PACKET_BUF_CAPACITY,
            UDP_RECV_BUF_SIZE,
        },
        encryption::{CryptoProvider, PacketCipher},
        rtp::{
            EncryptionMode, FrameOptions, MediaCodec, MediaKind, RtpHeader, RtpNonce, is_rtcp,
            strip_extension, strip_padding,
        },
    },
};

/// A decrypted inbound media packet.
#[derive(Debug, Clone)]
pub struct TransportPacket {
    pub from: SocketAddr,
    pub header: RtpHeader,
    pub codec: MediaCodec,
    pub payload: Bytes,
    pub user_id: Option<String>,
}

impl TransportPacket {
    pub fn kind(&self) -> MediaKind {
        self.codec.kind()
    }
}

#[derive(Debug)]
pub enum UdpEventKind {
    /// The NAT-mapped address echoed by the discovery response.
    Discovered { ip: String, port: u16 },
    Datagram { from: SocketAddr, data: Bytes },
    Error(VoiceError),
}

/// Tagged with the generation of the transport that produced it.
#[derive(Debug)]
pub struct UdpEvent {
    pub generation: u64,
    pub kind: UdpEventKind,
}

/// Pooled header, nonce and packet buffer of one outbound stream.
struct StreamCache {
    header: RtpHeader,
    nonce: RtpNonce,
    buf: Vec<u8>,
}

impl StreamCache {
    fn new(payload_type: u8, ssrc: u32) -> Self {
        Self {
            header: RtpHeader::randomized(payload_type, ssrc),
            nonce: RtpNonce::randomized(),
            buf: Vec::with_capacity(UDP_PACKET_BUF_CAPACITY),
        }
    }
}

pub struct TransportOptions {
    pub ssrc: u32,
    pub remote: SocketAddr,
    pub mode: EncryptionMode,
    pub video: bool,
    pub receive: bool,
    pub provider: Arc<dyn CryptoProvider>,
}

/// The UDP half of a voice session: discovery, RTP framing and packet crypto.
pub struct MediaTransport {
    ssrc: u32,
    video: bool,
    receive: bool,
    mode: EncryptionMode,
    remote: SocketAddr,
    local: Option<(String, u16)>,
    provider: Arc<dyn CryptoProvider>,
    cipher: Option<Box<dyn PacketCipher>>,
    audio_codec: Option<MediaCodec>,
    video_codec: Option<MediaCodec>,
    transport_id: Option<String>,
    audio: StreamCache,
    video_cache: Option<StreamCache>,
    scratch: Vec<u8>,
    socket: Option<Arc<UdpSocket>>,
    cancel: CancellationToken,
}

impl MediaTransport {
    pub fn new(opts: TransportOptions) -> Self {
        let video_cache = opts
            .video
            .then(|| StreamCache::new(MediaCodec::Vp8.payload_type(), opts.ssrc.wrapping_add(1)));
        Self {
            ssrc: opts.ssrc,
            video: opts.video,
            receive: opts.receive,
            mode: opts.mode,
            remote: opts.remote,
            local: None,
            provider: opts.provider,
            cipher: None,
            audio_codec: None,
            video_codec: None,
            transport_id: None,
            audio: StreamCache::new(MediaCodec::Opus.payload_type(), opts.ssrc),
            video_cache,
            scratch: Vec::with_capacity(UDP_PACKET_BUF_CAPACITY),
            socket: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn video_ssrc(&self) -> u32 {
        self.ssrc.wrapping_add(1)
    }

    pub fn rtx_ssrc(&self) -> u32 {
        self.ssrc.wrapping_add(2)
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: EncryptionMode) {
        self.mode = mode;
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local(&self) -> Option<(&str, u16)> {
        self.local.as_ref().map(|(ip, port)| (ip.as_str(), *port))
    }

    pub fn set_local(&mut self, ip: String, port: u16) {
        self.local = Some((ip, port));
    }

    pub fn video_enabled(&self) -> bool {
        self.video
    }

    pub fn audio_codec(&self) -> Option<MediaCodec> {
        self.audio_codec
    }

    pub fn video_codec(&self) -> Option<MediaCodec> {
        self.video_codec
    }

    pub fn transport_id(&self) -> Option<&str> {
        self.transport_id.as_deref()
    }

    pub fn set_transport_id(&mut self, id: Option<String>) {
        if id.is_some() {
            self.transport_id = id;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// True once the session key arrived.
    pub fn is_ready(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn set_key(&mut self, key: &[u8]) -> Result<(), VoiceError> {
        self.cipher = Some(self.provider.cipher(key)?);
        Ok(())
    }

    /// Applies the negotiated codec names. A name we can't frame is an error;
    /// a missing one keeps the current codec.
    pub fn set_codecs(
        &mut self,
        audio: Option<&str>,
        video: Option<&str>,
    ) -> Result<(), VoiceError> {
        if let Some(name) = audio.filter(|n| !n.is_empty()) {
            match MediaCodec::from_name(name).filter(|c| c.kind() == MediaKind::Audio) {
                Some(codec) => self.audio_codec = Some(codec),
                None => {
                    return Err(VoiceError::UnsupportedCodec {
                        kind: "audio",
                        codec: name.to_string(),
                    });
                }
            }
        }
        if let Some(name) = video.filter(|n| !n.is_empty()) {
            match MediaCodec::from_name(name).filter(|c| c.kind() == MediaKind::Video) {
                Some(codec) => self.video_codec = Some(codec),
                None => {
                    return Err(VoiceError::UnsupportedCodec {
                        kind: "video",
                        codec: name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Binds a local socket, sends the discovery probe and starts the receive
    /// loop. Results come back through `events`.
    pub fn connect(
        &mut self,
        generation: u64,
        events: UnboundedSender<UdpEvent>,
    ) -> Result<(), VoiceError> {
        self.close();
        self.cancel = CancellationToken::new();

        let bind: SocketAddr = match self.remote.ip() {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let std_socket = std::net::UdpSocket::bind(bind).map_err(udp_err)?;
        std_socket.set_nonblocking(true).map_err(udp_err)?;
        let socket = Arc::new(UdpSocket::from_std(std_socket).map_err(udp_err)?);

        socket
            .try_send_to(&discovery_packet(self.ssrc), self.remote)
            .map_err(udp_err)?;
        debug!(
            "Sent ip discovery to {} (ssrc {})",
            self.remote, self.ssrc
        );

        tokio::spawn(recv_loop(
            socket.clone(),
            self.ssrc,
            generation,
            events,
            self.cancel.clone(),
        ));
        self.socket = Some(socket);
        Ok(())
    }

    /// Stops the receive loop and drops the socket. The pooled counters survive
    /// so a reconnect continues the same streams.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.socket = None;
    }

    /// Builds the wire packet for one frame into a pooled buffer.
    pub fn encode_frame(
        &mut self,
        kind: MediaKind,
        payload: &[u8],
        opts: FrameOptions,
    ) -> Result<&[u8], VoiceError> {
        let cipher = self
            .cipher
            .as_deref()
            .ok_or(VoiceError::NoSessionDescription)?;
        let (codec, cache) = match kind {
            MediaKind::Audio => (self.audio_codec, &mut self.audio),
            MediaKind::Video => match self.video_cache.as_mut() {
                Some(cache) if self.video => (self.video_codec, cache),
                _ => return Err(VoiceError::VideoDisabled),
            },
        };
        let codec = codec.ok_or(VoiceError::NoSessionDescription)?;
        let step = kind.timestamp_step();

        let (header, mut nonce, buf) = if opts.use_cache {
            cache.header.set_payload_type(codec.payload_type());
            cache
                .header
                .advance_sequence(opts.sequence, opts.increment_sequence);
            cache
                .header
                .advance_timestamp(opts.timestamp, opts.increment_timestamp, step);
            (cache.header, cache.nonce, &mut cache.buf)
        } else {
            let mut header = cache.header;
            header.set_payload_type(codec.payload_type());
            if opts.sequence.is_some() {
                header.advance_sequence(opts.sequence, opts.increment_sequence);
            }
            if opts.timestamp.is_some() {
                header.advance_timestamp(opts.timestamp, opts.increment_timestamp, step);
            }
            (header, RtpNonce::randomized(), &mut self.scratch)
        };

        buf.clear();
        buf.extend_from_slice(header.as_bytes());
        match self.mode {
            EncryptionMode::Lite => {
                let counter = nonce.advance_counter(opts.nonce, opts.increment_nonce);
                cipher.seal_into(nonce.as_bytes(), payload, buf)?;
                buf.extend_from_slice(&counter);
            }
            EncryptionMode::Suffix => {
                let bytes = *nonce.fill_random();
                cipher.seal_into(&bytes, payload, buf)?;
                buf.extend_from_slice(&bytes);
            }
            EncryptionMode::Plain => {
                let bytes = *nonce.copy_header(&header);
                cipher.seal_into(&bytes, payload, buf)?;
            }
        }

        if opts.use_cache {
            cache.nonce = nonce;
        }
        Ok(buf.as_slice())
    }

    /// Encodes and transmits one frame. Returns the bytes written.
    pub fn send_frame(
        &mut self,
        kind: MediaKind,
        payload: &[u8],
        opts: FrameOptions,
    ) -> Result<usize, VoiceError> {
        let socket = self.socket.clone().ok_or(VoiceError::NotConnected)?;
        let remote = self.remote;
        let packet = self.encode_frame(kind, payload, opts)?;
        socket.try_send_to(packet, remote).map_err(udp_err)
    }

    pub fn send_audio_silence_frame(&mut self) -> Result<usize, VoiceError> {
        self.send_frame(MediaKind::Audio, &SILENCE_FRAME, FrameOptions::default())
    }

    /// Validates and decrypts one inbound datagram. `Ok(None)` is a packet we
    /// intentionally skip.
    pub fn decode_packet<F>(
        &self,
        from: SocketAddr,
        packet: &[u8],
        lookup: F,
    ) -> Result<Option<TransportPacket>, MediaPacketError>
    where
        F: FnOnce(u32, MediaKind) -> Option<String>,
    {
        if !self.receive {
            return Ok(None);
        }
        if from != self.remote {
            return Err(MediaPacketError::UnknownPeer(from));
        }
        let cipher = self
            .cipher
            .as_deref()
            .ok_or(MediaPacketError::NoSessionDescription)?;
        if packet.len() <= RTP_HEADER_LEN {
            return Err(MediaPacketError::TooSmall(packet.len()));
        }
        let header =
            RtpHeader::from_slice(packet).ok_or(MediaPacketError::TooSmall(packet.len()))?;
        if header.version() != 2 {
            return Err(MediaPacketError::InvalidVersion(header.version()));
        }
        if is_rtcp(packet) {
            return Ok(None);
        }

        let codec = MediaCodec::from_payload_type(header.payload_type())
            .ok_or(MediaPacketError::UnknownPayloadType(header.payload_type()))?;
        if codec.kind() == MediaKind::Video && !self.video {
            return Err(MediaPacketError::VideoDisabled);
        }

        let (nonce, sealed) = RtpNonce::from_packet(self.mode, packet)
            .ok_or(MediaPacketError::TooSmall(packet.len()))?;
        let data = cipher.open(nonce.as_bytes(), sealed)?;

        let mut payload = data.as_slice();
        if header.padding() {
            payload = strip_padding(payload)?;
        }
        if header.extension() {
            payload = strip_extension(payload)?;
        }

        Ok(Some(TransportPacket {
            from,
            header,
            codec,
            payload: Bytes::copy_from_slice(payload),
            user_id: lookup(header.ssrc(), codec.kind()),
        }))
    }
}

impl Drop for MediaTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn udp_err(e: std::io::Error) -> VoiceError {
    VoiceError::Udp(e.to_string())
}

/// The 70-byte probe: our ssrc big-endian, zeros after.
pub fn discovery_packet(ssrc: u32) -> [u8; DISCOVERY_PACKET_SIZE] {
    let mut packet = [0u8; DISCOVERY_PACKET_SIZE];
    BigEndian::write_u32(&mut packet[..4], ssrc);
    packet
}

/// Reads the echoed address: ssrc (4, big-endian), NUL-terminated ASCII ip,
/// port in the last two bytes (little-endian).
pub fn parse_discovery(ssrc: u32, packet: &[u8]) -> Result<(String, u16), VoiceError> {
    if packet.len() < 8 {
        return Err(VoiceError::MalformedDiscovery);
    }
    if BigEndian::read_u32(&packet[..4]) != ssrc {
        return Err(VoiceError::DiscoveryMismatch);
    }

    let body = &packet[4..packet.len() - 2];
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    let ip = std::str::from_utf8(&body[..end])
        .map_err(|_| VoiceError::MalformedDiscovery)?
        .to_string();
    if ip.is_empty() {
        return Err(VoiceError::MalformedDiscovery);
    }
    let port = LittleEndian::read_u16(&packet[packet.len() - 2..]);
    Ok((ip, port))
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    ssrc: u32,
    generation: u64,
    events: UnboundedSender<UdpEvent>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; UDP_RECV_BUF_SIZE];
    let mut discovered = false;

    loop {
        let (len, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(e) => {
                    warn!("UDP receive failed: {e}");
                    let _ = events.send(UdpEvent {
                        generation,
                        kind: UdpEventKind::Error(udp_err(e)),
                    });
                    break;
                }
            },
        };

        let kind = if discovered {
            UdpEventKind::Datagram {
                from,
                data: Bytes::copy_from_slice(&buf[..len]),
            }
        } else {
            match parse_discovery(ssrc, &buf[..len]) {
                Ok((ip, port)) => {
                    discovered = true;
                    UdpEventKind::Discovered { ip, port }
                }
                Err(e) => UdpEventKind::Error(e),
            }
        };

        if events.send(UdpEvent { generation, kind }).is_err() {
            break;
        }
    }

    debug!("UDP receive loop for ssrc {ssrc} stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::{constants::KEY_LEN, encryption::XSalsaProvider};

    const REMOTE: &str = "127.0.0.1:50000";

    fn transport(mode: EncryptionMode, video: bool) -> MediaTransport {
        let mut transport = MediaTransport::new(TransportOptions {
            ssrc: 0x1234_5678,
            remote: REMOTE.parse().unwrap(),
            mode,
            video,
            receive: true,
            provider: Arc::new(XSalsaProvider),
        });
        transport.set_key(&[9u8; KEY_LEN]).unwrap();
        transport.set_codecs(Some("opus"), Some("VP8")).unwrap();
        transport
    }

    fn roundtrip(transport: &mut MediaTransport, kind: MediaKind, payload: &[u8]) -> TransportPacket {
        let packet = transport
            .encode_frame(kind, payload, FrameOptions::default())
            .unwrap()
            .to_vec();
        transport
            .decode_packet(REMOTE.parse().unwrap(), &packet, |ssrc, kind| {
                (ssrc == 0x1234_5678 && kind == MediaKind::Audio).then(|| "42".to_string())
            })
            .unwrap()
            .unwrap()
    }

    #[test]
    fn frames_survive_every_mode() {
        let payload: Vec<u8> = (0..100u8).collect();
        for mode in [EncryptionMode::Lite, EncryptionMode::Suffix, EncryptionMode::Plain] {
            let mut transport = transport(mode, false);
            let decoded = roundtrip(&mut transport, MediaKind::Audio, &payload);
            assert_eq!(decoded.payload.as_ref(), payload.as_slice(), "{mode}");
            assert_eq!(decoded.codec, MediaCodec::Opus);
            assert_eq!(decoded.user_id.as_deref(), Some("42"));
        }
    }

    #[test]
    fn lite_packet_layout() {
        let mut transport = transport(EncryptionMode::Lite, false);
        let payload = [0xAAu8; 100];
        let packet = transport
            .encode_frame(MediaKind::Audio, &payload, FrameOptions::default())
            .unwrap()
            .to_vec();

        // header + tag + payload + 4-byte counter
        assert_eq!(packet.len(), 12 + 16 + 100 + 4);
        let header = RtpHeader::from_slice(&packet).unwrap();
        assert_eq!(header.ssrc(), 0x1234_5678);
        assert_eq!(header.payload_type(), 0x78);

        let next = transport
            .encode_frame(MediaKind::Audio, &payload, FrameOptions::default())
            .unwrap()
            .to_vec();
        let counter = |p: &[u8]| BigEndian::read_u32(&p[p.len() - 4..]);
        assert_eq!(counter(&next), counter(&packet).wrapping_add(1));
        let next_header = RtpHeader::from_slice(&next).unwrap();
        assert_eq!(next_header.sequence(), header.sequence().wrapping_add(1));
        assert_eq!(next_header.timestamp(), header.timestamp().wrapping_add(960));
    }

    #[test]
    fn uncached_frames_leave_the_stream_alone() {
        let mut transport = transport(EncryptionMode::Suffix, false);
        let first = transport
            .encode_frame(MediaKind::Audio, b"a", FrameOptions::default())
            .unwrap()
            .to_vec();
        let one_off = transport
            .encode_frame(
                MediaKind::Audio,
                b"b",
                FrameOptions {
                    sequence: Some(7),
                    use_cache: false,
                    ..Default::default()
                },
            )
            .unwrap()
            .to_vec();
        let second = transport
            .encode_frame(MediaKind::Audio, b"c", FrameOptions::default())
            .unwrap()
            .to_vec();

        let seq = |p: &[u8]| RtpHeader::from_slice(p).unwrap().sequence();
        assert_eq!(seq(&one_off), 7);
        assert_eq!(seq(&second), seq(&first).wrapping_add(1));
    }

    #[test]
    fn video_needs_video_enabled() {
        let mut transport = transport(EncryptionMode::Lite, false);
        assert_eq!(
            transport
                .encode_frame(MediaKind::Video, b"frame", FrameOptions::default())
                .unwrap_err(),
            VoiceError::VideoDisabled
        );

        let mut transport = self::transport(EncryptionMode::Lite, true);
        let decoded = roundtrip(&mut transport, MediaKind::Video, b"frame");
        assert_eq!(decoded.codec, MediaCodec::Vp8);
        assert_eq!(decoded.header.ssrc(), 0x1234_5679);
        assert_eq!(decoded.user_id, None);
    }

    #[test]
    fn user_lookup_is_keyed_by_media_kind() {
        let mut transport = transport(EncryptionMode::Suffix, true);
        let packet = transport
            .encode_frame(MediaKind::Video, b"frame", FrameOptions::default())
            .unwrap()
            .to_vec();
        let mut seen = None;
        let decoded = transport
            .decode_packet(REMOTE.parse().unwrap(), &packet, |ssrc, kind| {
                seen = Some((ssrc, kind));
                Some("7".to_string())
            })
            .unwrap()
            .unwrap();
        assert_eq!(seen, Some((0x1234_5679, MediaKind::Video)));
        assert_eq!(decoded.user_id.as_deref(), Some("7"));
    }

    #[test]
    fn inbound_guards() {
        let transport = transport(EncryptionMode::Lite, false);
        let remote: SocketAddr = REMOTE.parse().unwrap();

        let stranger: SocketAddr = "10.0.0.1:1".parse().unwrap();
        assert_eq!(
            transport.decode_packet(stranger, &[0x80; 40], |_, _| None).unwrap_err(),
            MediaPacketError::UnknownPeer(stranger)
        );
        assert_eq!(
            transport.decode_packet(remote, &[0x80; 12], |_, _| None).unwrap_err(),
            MediaPacketError::TooSmall(12)
        );
        assert_eq!(
            transport.decode_packet(remote, &[0x40; 40], |_, _| None).unwrap_err(),
            MediaPacketError::InvalidVersion(1)
        );

        let mut rtcp = [0u8; 40];
        rtcp[0] = 0x80;
        rtcp[1] = 200;
        assert!(transport.decode_packet(remote, &rtcp, |_, _| None).unwrap().is_none());

        let mut unknown = [0u8; 40];
        unknown[0] = 0x80;
        unknown[1] = 0x11;
        assert_eq!(
            transport.decode_packet(remote, &unknown, |_, _| None).unwrap_err(),
            MediaPacketError::UnknownPayloadType(0x11)
        );

        let mut garbage = [0u8; 40];
        garbage[0] = 0x80;
        garbage[1] = 0x78;
        assert!(matches!(
            transport.decode_packet(remote, &garbage, |_, _| None).unwrap_err(),
            MediaPacketError::Crypto(_)
        ));
    }

    #[test]
    fn padding_and_extension_are_stripped() {
        let mut transport = transport(EncryptionMode::Plain, false);
        // one-byte extension block of one word, then the payload, then 3 bytes
        // of padding.
        let mut body = vec![0xBE, 0xDE, 0x00, 0x01, 0x10, 0xFF, 0x00, 0x00];
        body.extend_from_slice(b"opus");
        body.extend_from_slice(&[0, 0, 3]);

        let mut packet = transport
            .encode_frame(MediaKind::Audio, &body, FrameOptions::default())
            .unwrap()
            .to_vec();
        // Flip padding and extension bits after sealing; plain mode rebuilds the
        // nonce from the header, so re-seal with the flipped header.
        let mut header = RtpHeader::from_slice(&packet).unwrap().as_bytes().to_owned();
        header[0] |= 0x30;
        let mut nonce = [0u8; 24];
        nonce[..12].copy_from_slice(&header);
        let mut sealed = header.to_vec();
        XSalsaProvider
            .cipher(&[9u8; KEY_LEN])
            .unwrap()
            .seal_into(&nonce, &body, &mut sealed)
            .unwrap();
        packet = sealed;

        let decoded = transport
            .decode_packet(REMOTE.parse().unwrap(), &packet, |_, _| None)
            .unwrap()
            .unwrap();
        assert_eq!(decoded.payload.as_ref(), b"opus");
    }

    #[test]
    fn unsupported_codecs_are_rejected() {
        let mut transport = transport(EncryptionMode::Lite, false);
        assert_eq!(
            transport.set_codecs(Some("pcm"), None).unwrap_err(),
            VoiceError::UnsupportedCodec {
                kind: "audio",
                codec: "pcm".into()
            }
        );
        assert!(transport.set_codecs(None, Some("h264")).is_ok());
        assert_eq!(transport.video_codec(), Some(MediaCodec::H264));
    }

    #[test]
    fn discovery_packets() {
        let probe = discovery_packet(0xCAFEBABE);
        assert_eq!(probe.len(), 70);
        assert_eq!(&probe[..4], &[0xCA, 0xFE, 0xBA, 0xBE]);

        let mut response = [0u8; 70];
        response[..4].copy_from_slice(&0xCAFEBABEu32.to_be_bytes());
        response[4..4 + 11].copy_from_slice(b"203.0.113.5");
        response[68..].copy_from_slice(&50004u16.to_le_bytes());
        assert_eq!(
            parse_discovery(0xCAFEBABE, &response).unwrap(),
            ("203.0.113.5".to_string(), 50004)
        );
        assert_eq!(
            parse_discovery(1, &response).unwrap_err(),
            VoiceError::DiscoveryMismatch
        );
        assert_eq!(
            parse_discovery(0xCAFEBABE, &[0u8; 5]).unwrap_err(),
            VoiceError::MalformedDiscovery
        );
    }

    #[tokio::test]
    async fn discovery_over_loopback() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = server.local_addr().unwrap();
        let mut transport = MediaTransport::new(TransportOptions {
            ssrc: 77,
            remote,
            mode: EncryptionMode::Lite,
            video: false,
            receive: true,
            provider: Arc::new(XSalsaProvider),
        });
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        transport.connect(3, tx).unwrap();

        let mut probe = [0u8; 128];
        let (len, client) = server.recv_from(&mut probe).await.unwrap();
        assert_eq!(len, 70);
        assert_eq!(BigEndian::read_u32(&probe[..4]), 77);

        let mut reply = [0u8; 70];
        reply[..4].copy_from_slice(&77u32.to_be_bytes());
        reply[4..13].copy_from_slice(b"127.0.0.1");
        reply[68..].copy_from_slice(&client.port().to_le_bytes());
        server.send_to(&reply, client).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.generation, 3);
        match event.kind {
            UdpEventKind::Discovered { ip, port } => {
                assert_eq!(ip, "127.0.0.1");
                assert_eq!(port, client.port());
            }
            other => panic!("unexpected event {other:?}"),
        }
        transport.close();
    }
}
