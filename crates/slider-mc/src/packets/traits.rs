//! Packet traits for serialization and deserialization.
//!
//! Every packet the proxy understands implements [`Body`]. Packets whose ID
//! never changes between protocol versions (handshake, status, login) also
//! implement [`Packet`]; the rest implement [`PhasedPacket`] and get their
//! ID from the registry, because configuration and play IDs move around
//! between versions and some bodies appear in more than one phase.

use bytes::{Bytes, BytesMut};

use crate::codec::RawPacket;
use crate::error::{ProtocolError, Result};
use crate::registry::{self, PacketKind};
use crate::state::{Direction, Phase};
use crate::version::ProtocolVersion;

/// The body of a packet, without its ID.
pub trait Body: Sized {
    /// Read the body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is malformed or truncated.
    fn decode(buf: &mut Bytes) -> Result<Self>;

    /// Write the body.
    fn encode(&self, buf: &mut BytesMut);
}

/// A packet with a fixed ID.
pub trait Packet: Body {
    /// The packet ID.
    const ID: i32;

    /// The phase this packet belongs to.
    const PHASE: Phase;

    /// Which way the packet travels.
    const DIRECTION: Direction;

    /// Parse from a raw packet.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID does not match or the body is malformed.
    fn from_raw(packet: &RawPacket) -> Result<Self> {
        if packet.id != Self::ID {
            return Err(ProtocolError::InvalidPacketId(packet.id));
        }
        Self::decode(&mut packet.payload.clone().freeze())
    }

    /// Encode to a raw packet.
    fn to_raw(&self) -> RawPacket {
        let mut payload = BytesMut::new();
        self.encode(&mut payload);
        RawPacket::new(Self::ID, payload)
    }
}

/// A packet whose ID depends on the version and phase it is sent in.
pub trait PhasedPacket: Body {
    /// The registry name of this packet.
    const KIND: PacketKind;

    /// Which way the packet travels.
    const DIRECTION: Direction;

    /// Parse from a raw packet already classified as [`Self::KIND`].
    ///
    /// # Errors
    ///
    /// Returns an error if the body is malformed.
    fn from_raw(packet: &RawPacket) -> Result<Self> {
        Self::decode(&mut packet.payload.clone().freeze())
    }

    /// Encode to a raw packet for the given phase.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnmappedPacket`] if this packet does not
    /// exist in `phase`.
    fn to_raw(&self, phase: Phase, version: ProtocolVersion) -> Result<RawPacket> {
        encode_as(self, Self::KIND, Self::DIRECTION, phase, version)
    }
}

/// Encode a body under the ID `kind` has in the given phase and direction.
///
/// # Errors
///
/// Returns [`ProtocolError::UnmappedPacket`] if there is no such ID.
pub fn encode_as(
    body: &impl Body,
    kind: PacketKind,
    direction: Direction,
    phase: Phase,
    version: ProtocolVersion,
) -> Result<RawPacket> {
    let id = registry::id_of(version, phase, direction, kind)
        .ok_or(ProtocolError::UnmappedPacket { kind, phase })?;
    let mut payload = BytesMut::new();
    body.encode(&mut payload);
    Ok(RawPacket::new(id, payload))
}
