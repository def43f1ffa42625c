use std::{fmt, str::FromStr};

use byteorder::{BigEndian, ByteOrder};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::common::errors::{ConfigError, MediaPacketError};
use crate::voice::constants::{
    AUDIO_TIMESTAMP_STEP, EXTENSION_LOCAL_ID, EXTENSION_ONE_BYTE, NONCE_LEN, RTCP_PACKET_TYPES,
    RTP_HEADER_LEN, RTP_VERSION_BYTE, VIDEO_TIMESTAMP_STEP,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    pub fn timestamp_step(&self) -> u32 {
        match self {
            Self::Audio => AUDIO_TIMESTAMP_STEP,
            Self::Video => VIDEO_TIMESTAMP_STEP,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaCodec {
    Opus,
    Vp8,
    Vp9,
    H264,
}

pub const AUDIO_CODECS: [MediaCodec; 1] = [MediaCodec::Opus];
pub const VIDEO_CODECS: [MediaCodec; 3] = [MediaCodec::Vp8, MediaCodec::Vp9, MediaCodec::H264];

impl MediaCodec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Opus => "opus",
            Self::Vp8 => "VP8",
            Self::Vp9 => "VP9",
            Self::H264 => "H264",
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Opus => MediaKind::Audio,
            Self::Vp8 | Self::Vp9 | Self::H264 => MediaKind::Video,
        }
    }

    pub fn payload_type(&self) -> u8 {
        match self {
            Self::Opus => 0x78,
            Self::Vp8 => 0x65,
            Self::Vp9 => 0x67,
            Self::H264 => 0x69,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [AUDIO_CODECS.as_slice(), VIDEO_CODECS.as_slice()]
            .concat()
            .into_iter()
            .find(|codec| codec.name().eq_ignore_ascii_case(name))
    }

    pub fn from_payload_type(payload_type: u8) -> Option<Self> {
        match payload_type {
            0x78 => Some(Self::Opus),
            0x65 => Some(Self::Vp8),
            0x67 => Some(Self::Vp9),
            0x69 => Some(Self::H264),
            _ => None,
        }
    }
}

/// How the 24-byte nonce of each packet is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionMode {
    /// 4-byte incrementing counter appended to the packet.
    Lite,
    /// 24 random bytes appended to the packet.
    Suffix,
    /// The RTP header itself, zero padded.
    Plain,
}

impl EncryptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lite => "xsalsa20_poly1305_lite",
            Self::Suffix => "xsalsa20_poly1305_suffix",
            Self::Plain => "xsalsa20_poly1305",
        }
    }

    /// Bytes appended after the sealed payload.
    pub fn trailer_len(&self) -> usize {
        match self {
            Self::Lite => 4,
            Self::Suffix => NONCE_LEN,
            Self::Plain => 0,
        }
    }

    /// Chooses the forced mode if there is one, else the first offered mode we
    /// understand.
    pub fn select(forced: Option<EncryptionMode>, offered: &[String]) -> Option<EncryptionMode> {
        forced.or_else(|| offered.iter().find_map(|m| m.parse().ok()))
    }
}

impl FromStr for EncryptionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xsalsa20_poly1305_lite" => Ok(Self::Lite),
            "xsalsa20_poly1305_suffix" => Ok(Self::Suffix),
            "xsalsa20_poly1305" => Ok(Self::Plain),
            other => Err(ConfigError::UnknownEncryptionMode(other.to_string())),
        }
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Applies the sequence/timestamp/nonce rule shared by every counter:
/// no value advances by `step`, an incremental value is added, and an absolute
/// value replaces the counter.
macro_rules! advance {
    ($current:expr, $value:expr, $increment:expr, $step:expr) => {
        match $value {
            None => $current.wrapping_add($step),
            Some(v) if $increment => $current.wrapping_add(v),
            Some(v) => v,
        }
    };
}

/// The fixed 12-byte RTP header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader([u8; RTP_HEADER_LEN]);

impl fmt::Debug for RtpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpHeader")
            .field("version", &self.version())
            .field("padding", &self.padding())
            .field("extension", &self.extension())
            .field("payload_type", &self.payload_type())
            .field("sequence", &self.sequence())
            .field("timestamp", &self.timestamp())
            .field("ssrc", &self.ssrc())
            .finish()
    }
}

impl RtpHeader {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        let mut header = Self([0u8; RTP_HEADER_LEN]);
        header.0[0] = RTP_VERSION_BYTE;
        header.set_payload_type(payload_type);
        header.set_ssrc(ssrc);
        header
    }

    /// A header with random starting sequence and timestamp.
    pub fn randomized(payload_type: u8, ssrc: u32) -> Self {
        let mut rng = rand::thread_rng();
        let mut header = Self::new(payload_type, ssrc);
        header.set_sequence(rng.next_u32() as u16);
        header.set_timestamp(rng.next_u32());
        header
    }

    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let bytes: [u8; RTP_HEADER_LEN] = data.get(..RTP_HEADER_LEN)?.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; RTP_HEADER_LEN] {
        &self.0
    }

    pub fn version(&self) -> u8 {
        self.0[0] >> 6
    }

    pub fn padding(&self) -> bool {
        self.0[0] & 0x20 != 0
    }

    pub fn extension(&self) -> bool {
        self.0[0] & 0x10 != 0
    }

    pub fn csrc_count(&self) -> u8 {
        self.0[0] & 0x0F
    }

    pub fn marker(&self) -> bool {
        self.0[1] & 0x80 != 0
    }

    pub fn payload_type(&self) -> u8 {
        self.0[1] & 0x7F
    }

    pub fn sequence(&self) -> u16 {
        BigEndian::read_u16(&self.0[2..4])
    }

    pub fn timestamp(&self) -> u32 {
        BigEndian::read_u32(&self.0[4..8])
    }

    pub fn ssrc(&self) -> u32 {
        BigEndian::read_u32(&self.0[8..12])
    }

    pub fn set_payload_type(&mut self, payload_type: u8) {
        self.0[1] = (self.0[1] & 0x80) | (payload_type & 0x7F);
    }

    pub fn set_marker(&mut self, marker: bool) {
        if marker {
            self.0[1] |= 0x80;
        } else {
            self.0[1] &= 0x7F;
        }
    }

    pub fn set_sequence(&mut self, sequence: u16) {
        BigEndian::write_u16(&mut self.0[2..4], sequence);
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        BigEndian::write_u32(&mut self.0[4..8], timestamp);
    }

    pub fn set_ssrc(&mut self, ssrc: u32) {
        BigEndian::write_u32(&mut self.0[8..12], ssrc);
    }

    pub fn advance_sequence(&mut self, value: Option<u16>, increment: bool) -> u16 {
        let next = advance!(self.sequence(), value, increment, 1);
        self.set_sequence(next);
        next
    }

    pub fn advance_timestamp(&mut self, value: Option<u32>, increment: bool, step: u32) -> u32 {
        let next = advance!(self.timestamp(), value, increment, step);
        self.set_timestamp(next);
        next
    }
}

/// The 24-byte secretbox nonce.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RtpNonce([u8; NONCE_LEN]);

impl Default for RtpNonce {
    fn default() -> Self {
        Self([0u8; NONCE_LEN])
    }
}

impl RtpNonce {
    /// A nonce whose lite counter starts at a random value.
    pub fn randomized() -> Self {
        let mut nonce = Self::default();
        nonce.set_counter(rand::thread_rng().next_u32());
        nonce
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    pub fn counter(&self) -> u32 {
        BigEndian::read_u32(&self.0[..4])
    }

    pub fn set_counter(&mut self, value: u32) {
        BigEndian::write_u32(&mut self.0[..4], value);
    }

    /// Lite mode: bumps the counter and returns its 4 wire bytes.
    pub fn advance_counter(&mut self, value: Option<u32>, increment: bool) -> [u8; 4] {
        let next = advance!(self.counter(), value, increment, 1);
        self.set_counter(next);
        next.to_be_bytes()
    }

    /// Suffix mode: 24 fresh random bytes.
    pub fn fill_random(&mut self) -> &[u8; NONCE_LEN] {
        rand::thread_rng().fill_bytes(&mut self.0);
        &self.0
    }

    /// Plain mode: the header followed by zeros.
    pub fn copy_header(&mut self, header: &RtpHeader) -> &[u8; NONCE_LEN] {
        self.0 = [0u8; NONCE_LEN];
        self.0[..RTP_HEADER_LEN].copy_from_slice(header.as_bytes());
        &self.0
    }

    /// Rebuilds the nonce of an inbound packet. Returns the nonce and the
    /// sealed region between the header and the trailer.
    pub fn from_packet(mode: EncryptionMode, packet: &[u8]) -> Option<(Self, &[u8])> {
        let trailer = mode.trailer_len();
        if packet.len() < RTP_HEADER_LEN + trailer {
            return None;
        }
        let sealed_end = packet.len() - trailer;
        let mut nonce = Self::default();
        match mode {
            EncryptionMode::Lite | EncryptionMode::Suffix => {
                nonce.0[..trailer].copy_from_slice(&packet[sealed_end..]);
            }
            EncryptionMode::Plain => {
                nonce.0[..RTP_HEADER_LEN].copy_from_slice(&packet[..RTP_HEADER_LEN]);
            }
        }
        Some((nonce, &packet[RTP_HEADER_LEN..sealed_end]))
    }
}

/// Per-frame overrides for the outbound counters. `None` means advance by
/// the default step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOptions {
    pub sequence: Option<u16>,
    pub increment_sequence: bool,
    pub timestamp: Option<u32>,
    pub increment_timestamp: bool,
    pub nonce: Option<u32>,
    pub increment_nonce: bool,
    /// Use the pooled header/nonce of the stream. When false a one-off header
    /// is built and the pooled counters are left untouched.
    pub use_cache: bool,
}

impl Default for FrameOptions {
    fn default() -> Self {
        Self {
            sequence: None,
            increment_sequence: false,
            timestamp: None,
            increment_timestamp: false,
            nonce: None,
            increment_nonce: false,
            use_cache: true,
        }
    }
}

pub fn is_rtcp(packet: &[u8]) -> bool {
    packet
        .get(1)
        .is_some_and(|pt| RTCP_PACKET_TYPES.contains(pt))
}

/// Removes RFC 3550 padding: the last byte counts the padding bytes,
/// itself included.
pub fn strip_padding(data: &[u8]) -> Result<&[u8], MediaPacketError> {
    let len = data.len();
    let pad = data.last().copied().unwrap_or(0) as usize;
    if pad == 0 || pad > len {
        return Err(MediaPacketError::InvalidPadding { pad, len });
    }
    Ok(&data[..len - pad])
}

/// Skips an RFC 5285 header extension at the start of a decrypted payload.
///
/// The block is `profile(2) | length in 32-bit words(2) | elements`. One-byte
/// elements are walked to validate them; a two-byte profile is rejected.
pub fn strip_extension(data: &[u8]) -> Result<&[u8], MediaPacketError> {
    if data.len() < 4 {
        return Err(MediaPacketError::MalformedExtension);
    }
    if data[0] == 0x10 && data[1] >> 4 == 0 {
        return Err(MediaPacketError::UnsupportedExtension);
    }

    let words = BigEndian::read_u16(&data[2..4]) as usize;
    let end = 4 + words * 4;
    if end > data.len() {
        return Err(MediaPacketError::MalformedExtension);
    }

    if data[..2] == EXTENSION_ONE_BYTE {
        let mut offset = 4;
        while offset < end {
            let byte = data[offset];
            if byte == 0 {
                offset += 1;
                continue;
            }
            if byte >> 4 == EXTENSION_LOCAL_ID {
                break;
            }
            offset += 1 + (byte & 0x0F) as usize + 1;
        }
        if offset > end {
            return Err(MediaPacketError::MalformedExtension);
        }
    }

    Ok(&data[end..])
}
