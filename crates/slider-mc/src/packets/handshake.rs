//! Handshake packet definitions.
//!
//! The handshake is the first packet sent by the client and determines
//! whether this is a status ping or a login attempt.

use bytes::{BufMut, Bytes, BytesMut};

use crate::buf::{read_string, read_u16, write_string};
use crate::error::{ProtocolError, Result};
use crate::packets::traits::{Body, Packet};
use crate::state::{Direction, Phase};
use crate::varint::{read_varint, write_varint};

/// Maximum server address length.
///
/// Legacy forwarding packs the player's address, UUID and profile into this
/// field, so it is much larger than a hostname needs.
const MAX_SERVER_ADDRESS: usize = 32_767;

/// The next state after handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    /// Status request (server list ping).
    Status = 1,
    /// Login request.
    Login = 2,
    /// Transfer (1.20.5+).
    Transfer = 3,
}

impl TryFrom<i32> for NextState {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            1 => Ok(Self::Status),
            2 => Ok(Self::Login),
            3 => Ok(Self::Transfer),
            _ => Err(ProtocolError::InvalidNextState(value)),
        }
    }
}

/// Handshake packet sent by the client.
///
/// This is always the first packet in a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// The protocol version the client is using.
    pub protocol_version: i32,
    /// The server address the client connected to.
    pub server_address: String,
    /// The server port the client connected to.
    pub server_port: u16,
    /// The next state: Status (1), Login (2) or Transfer (3).
    pub next_state: NextState,
}

impl Handshake {
    /// The address with any Forge/FML marker or trailing dot removed.
    #[must_use]
    pub fn clean_address(&self) -> &str {
        let host = self.server_address.split('\0').next().unwrap_or_default();
        host.strip_suffix('.').unwrap_or(host)
    }
}

impl Body for Handshake {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let protocol_version = read_varint(buf)?;
        let server_address = read_string(buf, MAX_SERVER_ADDRESS)?;
        let server_port = read_u16(buf)?;
        let next_state = NextState::try_from(read_varint(buf)?)?;

        Ok(Self {
            protocol_version,
            server_address,
            server_port,
            next_state,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        write_varint(buf, self.protocol_version);
        write_string(buf, &self.server_address);
        buf.put_u16(self.server_port);
        write_varint(buf, self.next_state as i32);
    }
}

impl Packet for Handshake {
    const ID: i32 = 0x00;
    const PHASE: Phase = Phase::Handshake;
    const DIRECTION: Direction = Direction::Serverbound;
}
