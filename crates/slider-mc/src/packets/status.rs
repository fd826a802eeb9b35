//! Status protocol packets.
//!
//! The status protocol is used by clients to query server information
//! without joining. This packet format is stable across all supported
//! protocol versions.

use bytes::{BufMut, Bytes, BytesMut};

use crate::buf::{read_i64, read_string, write_string};
use crate::error::Result;
use crate::packets::traits::{Body, Packet};
use crate::state::{Direction, Phase};

/// Maximum JSON response length (32 KiB).
const MAX_JSON_LENGTH: usize = 32 * 1024;

/// Status Request packet (client -> server).
///
/// This is an empty packet that requests server status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusRequest;

impl Body for StatusRequest {
    fn decode(_buf: &mut Bytes) -> Result<Self> {
        Ok(Self)
    }

    fn encode(&self, _buf: &mut BytesMut) {}
}

impl Packet for StatusRequest {
    const ID: i32 = 0x00;
    const PHASE: Phase = Phase::Status;
    const DIRECTION: Direction = Direction::Serverbound;
}

/// Status Response packet (server -> client).
///
/// Contains a JSON object with server information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    /// JSON response containing server status.
    pub json: String,
}

impl StatusResponse {
    /// Create a new status response.
    #[must_use]
    pub fn new(json: impl Into<String>) -> Self {
        Self { json: json.into() }
    }
}

impl Body for StatusResponse {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let json = read_string(buf, MAX_JSON_LENGTH)?;
        Ok(Self { json })
    }

    fn encode(&self, buf: &mut BytesMut) {
        write_string(buf, &self.json);
    }
}

impl Packet for StatusResponse {
    const ID: i32 = 0x00;
    const PHASE: Phase = Phase::Status;
    const DIRECTION: Direction = Direction::Clientbound;
}

/// Ping Request packet (client -> server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    /// Arbitrary value echoed back in the pong.
    pub payload: i64,
}

impl Ping {
    /// Create a new ping.
    #[must_use]
    pub const fn new(payload: i64) -> Self {
        Self { payload }
    }
}

impl Body for Ping {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            payload: read_i64(buf)?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64(self.payload);
    }
}

impl Packet for Ping {
    const ID: i32 = 0x01;
    const PHASE: Phase = Phase::Status;
    const DIRECTION: Direction = Direction::Serverbound;
}

/// Pong Response packet (server -> client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    /// The value from the ping.
    pub payload: i64,
}

impl Pong {
    /// Create a new pong.
    #[must_use]
    pub const fn new(payload: i64) -> Self {
        Self { payload }
    }
}

impl Body for Pong {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            payload: read_i64(buf)?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64(self.payload);
    }
}

impl Packet for Pong {
    const ID: i32 = 0x01;
    const PHASE: Phase = Phase::Status;
    const DIRECTION: Direction = Direction::Clientbound;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_request_is_empty() {
        let raw = StatusRequest.to_raw();
        assert_eq!(raw.id, StatusRequest::ID);
        assert!(raw.payload.is_empty());
        assert_eq!(StatusRequest::from_raw(&raw).unwrap(), StatusRequest);
    }

    #[test]
    fn test_status_response_roundtrip() {
        let json = r#"{"version":{"name":"1.21.8","protocol":772},"players":{"max":100,"online":0}}"#;
        let raw = StatusResponse::new(json).to_raw();
        let parsed = StatusResponse::from_raw(&raw).unwrap();
        assert_eq!(parsed.json, json);
    }

    #[test]
    #[allow(clippy::similar_names)]
    fn test_ping_pong() {
        let ping = Ping::new(-9_876_543_210);
        let parsed = Ping::from_raw(&ping.to_raw()).unwrap();
        assert_eq!(parsed, ping);

        let pong = Pong::new(parsed.payload);
        let raw = pong.to_raw();
        assert_eq!(raw.payload.len(), 8);
        assert_eq!(Pong::from_raw(&raw).unwrap().payload, ping.payload);
    }

    #[test]
    fn test_truncated_ping() {
        let raw = crate::codec::RawPacket::new(0x01, BytesMut::from(&[0u8; 4][..]));
        assert!(Ping::from_raw(&raw).is_err());
    }
}
