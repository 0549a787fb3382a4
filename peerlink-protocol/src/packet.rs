//! Network Packet and wire codec
//!
//! Packets are JSON objects terminated by a single newline. Every packet has
//! three mandatory fields:
//! - `id`: UNIX epoch timestamp in milliseconds, strictly increasing per sender
//! - `type`: packet type (`identity`, `pair`, `unpair`, or a capability type)
//! - `body`: JSON object with type-specific parameters
//!
//! [`Packet::to_bytes`] and [`Packet::from_bytes`] encode and decode a single
//! record. [`PacketCodec`] frames a byte stream into packets for use with
//! `tokio_util::codec::FramedRead` / `FramedWrite`.

use crate::{ProtocolError, Result};
use bytes::BytesMut;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio_util::codec::{Decoder, Encoder};

/// Identity announcement, sent over UDP and during channel establishment
pub const PACKET_TYPE_IDENTITY: &str = "identity";

/// Pairing request (`pair: true`) or rejection (`pair: false`)
pub const PACKET_TYPE_PAIR: &str = "pair";

/// Explicit removal of trust
pub const PACKET_TYPE_UNPAIR: &str = "unpair";

/// Default maximum size of one encoded record (1 MiB)
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

static LAST_PACKET_ID: AtomicI64 = AtomicI64::new(0);

/// A protocol packet
///
/// # Examples
///
/// ```
/// use peerlink_protocol::Packet;
/// use serde_json::json;
///
/// let packet = Packet::new("ping", json!({}));
/// let bytes = packet.to_bytes().unwrap();
/// assert_eq!(bytes.last(), Some(&b'\n'));
///
/// let parsed = Packet::from_bytes(&bytes).unwrap();
/// assert_eq!(parsed, packet);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    /// UNIX timestamp in milliseconds
    ///
    /// Some peers send this as a string; both forms are accepted.
    #[serde(deserialize_with = "deserialize_id")]
    pub id: i64,

    /// Packet type
    #[serde(rename = "type")]
    pub packet_type: String,

    /// Type-specific parameters
    pub body: Value,
}

impl Packet {
    /// Creates a new packet with the next packet id of this process
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: next_packet_id(),
            packet_type: packet_type.into(),
            body,
        }
    }

    /// Create a new packet with an explicit id
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id,
            packet_type: packet_type.into(),
            body,
        }
    }

    /// Serialize packet to one newline-terminated JSON record
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Deserialize a packet from one record
    ///
    /// Accepts `\n`, `\r\n` or no terminator. Every failure is reported as
    /// [`ProtocolError::MalformedPacket`].
    ///
    /// ```
    /// use peerlink_protocol::Packet;
    ///
    /// let packet = Packet::from_bytes(br#"{"id":"42","type":"ping","body":{}}"#).unwrap();
    /// assert_eq!(packet.id, 42);
    /// assert!(Packet::from_bytes(br#"{"id":1,"type":"ping"}"#).is_err());
    /// ```
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let trimmed = data
            .strip_suffix(b"\r\n")
            .or_else(|| data.strip_suffix(b"\n"))
            .unwrap_or(data);

        let packet: Packet = serde_json::from_slice(trimmed)
            .map_err(|e| ProtocolError::MalformedPacket(e.to_string()))?;

        if !packet.body.is_object() {
            return Err(ProtocolError::MalformedPacket(
                "body must be a JSON object".to_string(),
            ));
        }

        Ok(packet)
    }

    /// Builder pattern: add a key-value pair to the body
    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Value::Object(ref mut map) = self.body {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Check if packet is of a specific type
    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// True for `identity`, `pair` and `unpair`, the only packets allowed
    /// before a device is paired
    pub fn is_control(&self) -> bool {
        matches!(
            self.packet_type.as_str(),
            PACKET_TYPE_IDENTITY | PACKET_TYPE_PAIR | PACKET_TYPE_UNPAIR
        )
    }

    /// Get a field from the body as a specific type
    pub fn get_body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::custom("Invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("Invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

/// Generate current UNIX timestamp in milliseconds
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

/// Next packet id: the current timestamp, bumped past the previous id when
/// two packets are created within the same millisecond
pub fn next_packet_id() -> i64 {
    let now = current_timestamp();
    let mut last = LAST_PACKET_ID.load(Ordering::Relaxed);
    loop {
        let next = if now > last { now } else { last + 1 };
        match LAST_PACKET_ID.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Newline framing for packet streams
///
/// Each decoded item is itself a `Result`: a malformed record yields
/// `Some(Err(MalformedPacket))` and the stream continues with the next
/// record. A record longer than `max_size` is a stream error, after which the
/// stream must be closed.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_size: usize,
    next_index: usize,
}

impl PacketCodec {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            next_index: 0,
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl Decoder for PacketCodec {
    type Item = Result<Packet>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') else {
                if src.len() > self.max_size {
                    return Err(ProtocolError::PacketSizeExceeded(src.len(), self.max_size));
                }
                self.next_index = src.len();
                return Ok(None);
            };

            let end = self.next_index + offset + 1;
            self.next_index = 0;
            let record = src.split_to(end);

            if record.len() > self.max_size {
                return Err(ProtocolError::PacketSizeExceeded(record.len(), self.max_size));
            }

            // Blank lines carry nothing; skip them.
            if record.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            return Ok(Some(Packet::from_bytes(&record)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => {
                // An unterminated trailing record is discarded with the stream.
                src.clear();
                self.next_index = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        let bytes = item.to_bytes()?;
        if bytes.len() > self.max_size {
            return Err(ProtocolError::PacketSizeExceeded(bytes.len(), self.max_size));
        }
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use tokio_util::codec::FramedRead;

    #[test]
    fn test_new_packet() {
        let packet = Packet::new("ping", json!({}));
        assert_eq!(packet.packet_type, "ping");
        assert!(packet.body.is_object());
        assert!(packet.id > 0);
    }

    #[test]
    fn test_packet_serialization() {
        let packet = Packet::with_id(123, "pair", json!({"pair": true}));
        let bytes = packet.to_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
        assert!(text.contains("\"type\":\"pair\""));
    }

    #[test]
    fn test_roundtrip_nested_body() {
        let packet = Packet::new(
            "notification",
            json!({"title": "hi\nthere", "nested": {"list": [1, 2, 3], "flag": false}}),
        );
        let parsed = Packet::from_bytes(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_deserialization_with_crlf() {
        let packet = Packet::from_bytes(b"{\"id\":1,\"type\":\"ping\",\"body\":{}}\r\n").unwrap();
        assert_eq!(packet.id, 1);
    }

    #[test]
    fn test_malformed_inputs() {
        let cases: [&[u8]; 7] = [
            b"",
            b"not json",
            b"{\"id\":1,\"type\":\"ping\"}",
            b"{\"id\":1,\"body\":{}}",
            b"{\"type\":\"ping\",\"body\":{}}",
            b"{\"id\":1,\"type\":\"ping\",\"body\":[]}",
            b"{\"id\":true,\"type\":\"ping\",\"body\":{}}",
        ];
        for case in cases {
            assert!(
                matches!(Packet::from_bytes(case), Err(ProtocolError::MalformedPacket(_))),
                "expected MalformedPacket for {:?}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn test_packet_ids_strictly_increase() {
        let mut previous = next_packet_id();
        for _ in 0..1000 {
            let id = next_packet_id();
            assert!(id > previous);
            previous = id;
        }
    }

    #[test]
    fn test_control_packets() {
        assert!(Packet::new(PACKET_TYPE_IDENTITY, json!({})).is_control());
        assert!(Packet::new(PACKET_TYPE_UNPAIR, json!({})).is_control());
        assert!(!Packet::new("ping", json!({})).is_control());
    }

    #[test]
    fn test_get_body_field() {
        let packet = Packet::new("pair", json!({})).with_body_field("pair", true);
        assert_eq!(packet.get_body_field::<bool>("pair"), Some(true));
        assert_eq!(packet.get_body_field::<String>("pair"), None);
    }

    #[tokio::test]
    async fn test_codec_skips_malformed_record() {
        let stream = tokio_test::io::Builder::new()
            .read(b"{\"id\":1,\"type\":\"ping\",\"body\":{}}\nnot json\n{\"id\":2,")
            .read(b"\"type\":\"ping\",\"body\":{}}\n")
            .build();
        let mut framed = FramedRead::new(stream, PacketCodec::default());

        let first = framed.next().await.unwrap().unwrap().unwrap();
        assert_eq!(first.id, 1);

        let second = framed.next().await.unwrap().unwrap();
        assert!(matches!(second, Err(ProtocolError::MalformedPacket(_))));

        let third = framed.next().await.unwrap().unwrap().unwrap();
        assert_eq!(third.id, 2);

        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_codec_rejects_oversized_record() {
        let stream = tokio_test::io::Builder::new()
            .read(&[b'x'; 64])
            .build();
        let mut framed = FramedRead::new(stream, PacketCodec::new(32));

        let result = framed.next().await.unwrap();
        assert!(matches!(result, Err(ProtocolError::PacketSizeExceeded(64, 32))));
    }

    #[test]
    fn test_codec_encode() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::new();
        let packet = Packet::with_id(5, "ping", json!({}));
        codec.encode(packet.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }
}
