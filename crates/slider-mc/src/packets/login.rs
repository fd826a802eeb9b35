//! Login protocol packets.
//!
//! The login protocol handles player authentication. In online mode, this includes
//! encryption negotiation and Mojang session verification. This packet format is
//! stable across all supported protocol versions.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::buf::{
    read_bool, read_byte_array, read_string, read_uuid, write_byte_array, write_string, write_uuid,
};
use crate::error::{ProtocolError, Result};
use crate::packets::traits::{Body, Packet};
use crate::state::{Direction, Phase};
use crate::varint::{read_varint, write_varint};

/// Maximum username length (16 characters).
pub const MAX_USERNAME_LENGTH: usize = 16;

/// Maximum channel identifier length.
const MAX_CHANNEL_LENGTH: usize = 256;

/// Maximum public key length (512 bytes for RSA-1024).
const MAX_PUBLIC_KEY_LENGTH: usize = 512;

/// Maximum verify token length (typically 4 bytes).
const MAX_VERIFY_TOKEN_LENGTH: usize = 256;

/// Maximum disconnect reason length.
const MAX_DISCONNECT_REASON_LENGTH: usize = 262_144;

/// Maximum property string length.
const MAX_PROPERTY_LENGTH: usize = 32_767;

/// Upper bound on the number of profile properties accepted.
const MAX_PROPERTIES: usize = 16;

// =============================================================================
// LoginStart (Client -> Server, ID: 0x00)
// =============================================================================

/// Login Start packet (client -> server).
///
/// Sent by the client to begin the login process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStart {
    /// The player's username.
    pub name: String,
    /// The player's UUID (sent by client in 1.19.1+).
    pub uuid: Uuid,
}

impl LoginStart {
    /// Create a new login start packet.
    #[must_use]
    pub fn new(name: impl Into<String>, uuid: Uuid) -> Self {
        Self {
            name: name.into(),
            uuid,
        }
    }
}

impl Body for LoginStart {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let name = read_string(buf, MAX_USERNAME_LENGTH)?;
        let uuid = read_uuid(buf)?;
        Ok(Self { name, uuid })
    }

    fn encode(&self, buf: &mut BytesMut) {
        write_string(buf, &self.name);
        write_uuid(buf, self.uuid);
    }
}

impl Packet for LoginStart {
    const ID: i32 = 0x00;
    const PHASE: Phase = Phase::Login;
    const DIRECTION: Direction = Direction::Serverbound;
}

// =============================================================================
// EncryptionRequest (Server -> Client, ID: 0x01)
// =============================================================================

/// Encryption Request packet (server -> client).
///
/// Sent by the server to initiate encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionRequest {
    /// Server ID (empty string for online-mode servers).
    pub server_id: String,
    /// The server's public key (DER-encoded).
    pub public_key: Bytes,
    /// Random verify token.
    pub verify_token: Bytes,
    /// Whether the client should authenticate with Mojang (1.20.5+).
    pub should_authenticate: bool,
}

impl EncryptionRequest {
    /// Create a new encryption request.
    #[must_use]
    pub const fn new(public_key: Bytes, verify_token: Bytes) -> Self {
        Self {
            server_id: String::new(),
            public_key,
            verify_token,
            should_authenticate: true,
        }
    }
}

impl Body for EncryptionRequest {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let server_id = read_string(buf, 20)?;
        let public_key = read_byte_array(buf, MAX_PUBLIC_KEY_LENGTH)?;
        let verify_token = read_byte_array(buf, MAX_VERIFY_TOKEN_LENGTH)?;
        let should_authenticate = if buf.has_remaining() {
            read_bool(buf)?
        } else {
            true
        };

        Ok(Self {
            server_id,
            public_key,
            verify_token,
            should_authenticate,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        write_string(buf, &self.server_id);
        write_byte_array(buf, &self.public_key);
        write_byte_array(buf, &self.verify_token);
        buf.put_u8(u8::from(self.should_authenticate));
    }
}

impl Packet for EncryptionRequest {
    const ID: i32 = 0x01;
    const PHASE: Phase = Phase::Login;
    const DIRECTION: Direction = Direction::Clientbound;
}

// =============================================================================
// EncryptionResponse (Client -> Server, ID: 0x01)
// =============================================================================

/// Encryption Response packet (client -> server).
///
/// Sent by the client in response to an encryption request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionResponse {
    /// The shared secret, encrypted with the server's public key.
    pub shared_secret: Bytes,
    /// The verify token, encrypted with the server's public key.
    pub verify_token: Bytes,
}

impl Body for EncryptionResponse {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let shared_secret = read_byte_array(buf, 256)?;
        let verify_token = read_byte_array(buf, 256)?;
        Ok(Self {
            shared_secret,
            verify_token,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        write_byte_array(buf, &self.shared_secret);
        write_byte_array(buf, &self.verify_token);
    }
}

impl Packet for EncryptionResponse {
    const ID: i32 = 0x01;
    const PHASE: Phase = Phase::Login;
    const DIRECTION: Direction = Direction::Serverbound;
}

// =============================================================================
// LoginSuccess (Server -> Client, ID: 0x02)
// =============================================================================

/// A player property (e.g., textures).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// Property name.
    pub name: String,
    /// Property value.
    pub value: String,
    /// Optional signature.
    pub signature: Option<String>,
}

/// Login Success packet (server -> client).
///
/// Sent when login is complete. The client answers with
/// [`LoginAcknowledged`] and both sides enter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSuccess {
    /// The player's UUID.
    pub uuid: Uuid,
    /// The player's username.
    pub username: String,
    /// Player properties (e.g., skin textures).
    pub properties: Vec<Property>,
}

impl LoginSuccess {
    /// Create a new login success packet.
    #[must_use]
    pub fn new(uuid: Uuid, username: impl Into<String>) -> Self {
        Self {
            uuid,
            username: username.into(),
            properties: Vec::new(),
        }
    }

    /// Add a property to the login success.
    #[must_use]
    pub fn with_property(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        signature: Option<String>,
    ) -> Self {
        self.properties.push(Property {
            name: name.into(),
            value: value.into(),
            signature,
        });
        self
    }
}

impl Body for LoginSuccess {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let uuid = read_uuid(buf)?;
        let username = read_string(buf, MAX_USERNAME_LENGTH)?;

        let count = read_varint(buf)?;
        let count = usize::try_from(count)
            .ok()
            .filter(|&count| count <= MAX_PROPERTIES)
            .ok_or(ProtocolError::InvalidData("too many profile properties"))?;
        let mut properties = Vec::with_capacity(count);

        for _ in 0..count {
            let name = read_string(buf, MAX_PROPERTY_LENGTH)?;
            let value = read_string(buf, MAX_PROPERTY_LENGTH)?;
            let signature = if read_bool(buf)? {
                Some(read_string(buf, MAX_PROPERTY_LENGTH)?)
            } else {
                None
            };
            properties.push(Property {
                name,
                value,
                signature,
            });
        }

        Ok(Self {
            uuid,
            username,
            properties,
        })
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn encode(&self, buf: &mut BytesMut) {
        write_uuid(buf, self.uuid);
        write_string(buf, &self.username);

        write_varint(buf, self.properties.len() as i32);
        for prop in &self.properties {
            write_string(buf, &prop.name);
            write_string(buf, &prop.value);
            if let Some(sig) = &prop.signature {
                buf.put_u8(1);
                write_string(buf, sig);
            } else {
                buf.put_u8(0);
            }
        }
    }
}

impl Packet for LoginSuccess {
    const ID: i32 = 0x02;
    const PHASE: Phase = Phase::Login;
    const DIRECTION: Direction = Direction::Clientbound;
}

// =============================================================================
// SetCompression (Server -> Client, ID: 0x03)
// =============================================================================

/// Set Compression packet (server -> client).
///
/// Enables packet compression for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetCompression {
    /// Compression threshold. Packets at least this large will be compressed.
    /// A negative value disables compression.
    pub threshold: i32,
}

impl SetCompression {
    /// Create a new set compression packet.
    #[must_use]
    pub const fn new(threshold: i32) -> Self {
        Self { threshold }
    }
}

impl Body for SetCompression {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            threshold: read_varint(buf)?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        write_varint(buf, self.threshold);
    }
}

impl Packet for SetCompression {
    const ID: i32 = 0x03;
    const PHASE: Phase = Phase::Login;
    const DIRECTION: Direction = Direction::Clientbound;
}

// =============================================================================
// LoginPluginRequest (Server -> Client, ID: 0x04)
// =============================================================================

/// Login Plugin Request packet (server -> client).
///
/// Used for custom login flows like Velocity forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginPluginRequest {
    /// Message ID for correlating request/response.
    pub message_id: i32,
    /// Channel identifier (e.g., "velocity:player_info").
    pub channel: String,
    /// Plugin data.
    pub data: Bytes,
}

impl LoginPluginRequest {
    /// Create a new login plugin request.
    #[must_use]
    pub fn new(message_id: i32, channel: impl Into<String>, data: Bytes) -> Self {
        Self {
            message_id,
            channel: channel.into(),
            data,
        }
    }
}

impl Body for LoginPluginRequest {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let message_id = read_varint(buf)?;
        let channel = read_string(buf, MAX_CHANNEL_LENGTH)?;
        // Remaining bytes are the data
        let data = buf.split_off(0);

        Ok(Self {
            message_id,
            channel,
            data,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        write_varint(buf, self.message_id);
        write_string(buf, &self.channel);
        buf.extend_from_slice(&self.data);
    }
}

impl Packet for LoginPluginRequest {
    const ID: i32 = 0x04;
    const PHASE: Phase = Phase::Login;
    const DIRECTION: Direction = Direction::Clientbound;
}

// =============================================================================
// LoginPluginResponse (Client -> Server, ID: 0x02)
// =============================================================================

/// Login Plugin Response packet (client -> server).
///
/// Response to a login plugin request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginPluginResponse {
    /// Message ID from the request.
    pub message_id: i32,
    /// Response data, `None` if the request was not understood.
    pub data: Option<Bytes>,
}

impl LoginPluginResponse {
    /// Create a successful response with data.
    #[must_use]
    pub const fn success(message_id: i32, data: Bytes) -> Self {
        Self {
            message_id,
            data: Some(data),
        }
    }

    /// Create an unsuccessful response.
    #[must_use]
    pub const fn failure(message_id: i32) -> Self {
        Self {
            message_id,
            data: None,
        }
    }
}

impl Body for LoginPluginResponse {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let message_id = read_varint(buf)?;
        let data = read_bool(buf)?.then(|| buf.split_off(0));
        Ok(Self { message_id, data })
    }

    fn encode(&self, buf: &mut BytesMut) {
        write_varint(buf, self.message_id);
        buf.put_u8(u8::from(self.data.is_some()));
        if let Some(data) = &self.data {
            buf.extend_from_slice(data);
        }
    }
}

impl Packet for LoginPluginResponse {
    const ID: i32 = 0x02;
    const PHASE: Phase = Phase::Login;
    const DIRECTION: Direction = Direction::Serverbound;
}

// =============================================================================
// LoginAcknowledged (Client -> Server, ID: 0x03)
// =============================================================================

/// Login Acknowledged packet (client -> server).
///
/// Confirms [`LoginSuccess`]; the connection is in configuration afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoginAcknowledged;

impl Body for LoginAcknowledged {
    fn decode(_buf: &mut Bytes) -> Result<Self> {
        Ok(Self)
    }

    fn encode(&self, _buf: &mut BytesMut) {}
}

impl Packet for LoginAcknowledged {
    const ID: i32 = 0x03;
    const PHASE: Phase = Phase::Login;
    const DIRECTION: Direction = Direction::Serverbound;
}

// =============================================================================
// LoginDisconnect (Server -> Client, ID: 0x00)
// =============================================================================

/// Login Disconnect packet (server -> client).
///
/// Sent when the server disconnects the client during login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginDisconnect {
    /// The disconnect reason (JSON chat component).
    pub reason: String,
}

impl LoginDisconnect {
    /// Create a disconnect packet from a JSON chat component.
    #[must_use]
    pub fn from_json(json: impl Into<String>) -> Self {
        Self {
            reason: json.into(),
        }
    }
}

impl Body for LoginDisconnect {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            reason: read_string(buf, MAX_DISCONNECT_REASON_LENGTH)?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        write_string(buf, &self.reason);
    }
}

impl Packet for LoginDisconnect {
    const ID: i32 = 0x00;
    const PHASE: Phase = Phase::Login;
    const DIRECTION: Direction = Direction::Clientbound;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_start_roundtrip() {
        let uuid = Uuid::new_v4();
        let original = LoginStart::new("TestPlayer", uuid);
        let parsed = LoginStart::from_raw(&original.to_raw()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_login_start_name_too_long() {
        let original = LoginStart::new("x".repeat(100), Uuid::nil());
        assert!(matches!(
            LoginStart::from_raw(&original.to_raw()),
            Err(ProtocolError::StringTooLong { .. })
        ));
    }

    #[test]
    fn test_encryption_request_roundtrip() {
        let original = EncryptionRequest::new(
            Bytes::from_static(b"fake_public_key"),
            Bytes::from_static(b"token"),
        );
        let parsed = EncryptionRequest::from_raw(&original.to_raw()).unwrap();

        assert_eq!(parsed.server_id, "");
        assert_eq!(parsed, original);
        assert!(parsed.should_authenticate);
    }

    #[test]
    fn test_login_success_roundtrip() {
        let uuid = Uuid::new_v4();
        let original = LoginSuccess::new(uuid, "TestPlayer").with_property(
            "textures",
            "base64data",
            Some("signature".to_string()),
        );
        let parsed = LoginSuccess::from_raw(&original.to_raw()).unwrap();

        assert_eq!(parsed.uuid, uuid);
        assert_eq!(parsed.username, "TestPlayer");
        assert_eq!(parsed.properties.len(), 1);
        assert_eq!(
            parsed.properties[0].signature,
            Some("signature".to_string())
        );
    }

    #[test]
    fn test_set_compression_roundtrip() {
        let raw = SetCompression::new(256).to_raw();
        assert_eq!(raw.id, 0x03);
        assert_eq!(SetCompression::from_raw(&raw).unwrap().threshold, 256);
    }

    #[test]
    fn test_login_plugin_roundtrip() {
        let request = LoginPluginRequest::new(1, "velocity:player_info", Bytes::from_static(b"\x04"));
        let parsed = LoginPluginRequest::from_raw(&request.to_raw()).unwrap();
        assert_eq!(parsed, request);

        let response = LoginPluginResponse::success(1, Bytes::from_static(b"response_data"));
        let parsed = LoginPluginResponse::from_raw(&response.to_raw()).unwrap();
        assert_eq!(parsed.data, Some(Bytes::from_static(b"response_data")));

        let failure = LoginPluginResponse::failure(7);
        let parsed = LoginPluginResponse::from_raw(&failure.to_raw()).unwrap();
        assert_eq!(parsed, failure);
    }

    #[test]
    fn test_login_disconnect_roundtrip() {
        let original = LoginDisconnect::from_json(r#"{"text":"You are banned!"}"#);
        let parsed = LoginDisconnect::from_raw(&original.to_raw()).unwrap();
        assert_eq!(parsed.reason, r#"{"text":"You are banned!"}"#);
    }

    #[test]
    fn test_login_acknowledged_is_empty() {
        let raw = LoginAcknowledged.to_raw();
        assert_eq!(raw.id, 0x03);
        assert!(raw.payload.is_empty());
    }
}
