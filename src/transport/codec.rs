use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::common::errors::{CodecError, ConfigError};
use crate::configs::Encoding;

/// An inbound frame: `{op, d, s?, t?}`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct GatewayPacket {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

/// An outbound frame: `{op, d}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundPacket {
    pub op: u8,
    pub d: Value,
}

impl OutboundPacket {
    pub fn new(op: u8, d: Value) -> Self {
        Self { op, d }
    }
}

/// Serializes gateway frames for one wire encoding.
pub trait PayloadCodec: Send + Sync {
    fn name(&self) -> &'static str;
    fn encode(&self, packet: &OutboundPacket) -> Result<Message, CodecError>;
    fn decode(&self, data: &[u8]) -> Result<GatewayPacket, CodecError>;
}

pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, packet: &OutboundPacket) -> Result<Message, CodecError> {
        let text = serde_json::to_string(packet)?;
        Ok(Message::Text(text.into()))
    }

    fn decode(&self, data: &[u8]) -> Result<GatewayPacket, CodecError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Picks the codec for `encoding`. ETF has no built-in implementation and is
/// only available when the caller injects one.
pub fn resolve_codec(
    encoding: Encoding,
    injected: Option<Arc<dyn PayloadCodec>>,
) -> Result<Arc<dyn PayloadCodec>, ConfigError> {
    match encoding {
        Encoding::Json => Ok(injected
            .filter(|codec| codec.name() == Encoding::Json.as_str())
            .unwrap_or_else(|| Arc::new(JsonCodec))),
        Encoding::Etf => injected
            .filter(|codec| codec.name() == Encoding::Etf.as_str())
            .ok_or(ConfigError::MissingEtfCodec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeEtf;

    impl PayloadCodec for FakeEtf {
        fn name(&self) -> &'static str {
            "etf"
        }

        fn encode(&self, _packet: &OutboundPacket) -> Result<Message, CodecError> {
            Ok(Message::Binary(vec![131].into()))
        }

        fn decode(&self, _data: &[u8]) -> Result<GatewayPacket, CodecError> {
            Err(CodecError::Unsupported("fake".into()))
        }
    }

    #[test]
    fn json_decodes_optional_fields() {
        let packet = JsonCodec
            .decode(br#"{"op":0,"d":{"a":1},"s":42,"t":"READY"}"#)
            .unwrap();
        assert_eq!(packet.op, 0);
        assert_eq!(packet.s, Some(42));
        assert_eq!(packet.t.as_deref(), Some("READY"));

        let hello = JsonCodec
            .decode(br#"{"op":10,"d":{"heartbeat_interval":1000},"s":null,"t":null}"#)
            .unwrap();
        assert_eq!(hello.s, None);
        assert_eq!(hello.d["heartbeat_interval"], 1000);
    }

    #[test]
    fn json_encodes_as_text() {
        let msg = JsonCodec
            .encode(&OutboundPacket::new(1, Value::Null))
            .unwrap();
        match msg {
            Message::Text(text) => assert_eq!(text.as_str(), r#"{"op":1,"d":null}"#),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn etf_requires_an_injected_codec() {
        assert_eq!(
            resolve_codec(Encoding::Etf, None).err(),
            Some(ConfigError::MissingEtfCodec)
        );
        let codec = resolve_codec(Encoding::Etf, Some(Arc::new(FakeEtf))).unwrap();
        assert_eq!(codec.name(), "etf");
        assert_eq!(resolve_codec(Encoding::Json, None).unwrap().name(), "json");
    }
}
