//! Configuration phase packets the proxy reads or writes.
//!
//! Several of these bodies also travel in play under a different ID, so they
//! implement [`PhasedPacket`] and resolve their ID through the registry.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::buf::{read_bool, read_string, read_text_component, read_u8, write_string, write_text_component};
use crate::codec::RawPacket;
use crate::error::Result;
use crate::packets::traits::{Body, PhasedPacket};
use crate::registry::PacketKind;
use crate::state::{Direction, Phase};
use crate::varint::{read_varint, write_varint};
use crate::version::ProtocolVersion;

/// Maximum channel identifier length.
const MAX_CHANNEL_LENGTH: usize = 32_767;

/// Maximum locale length.
const MAX_LOCALE_LENGTH: usize = 16;

/// Channel the client announces its brand on.
pub const BRAND_CHANNEL: &str = "minecraft:brand";

/// Client settings, sent in configuration and again in play when they change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInformation {
    /// Locale such as `en_us`.
    pub locale: String,
    /// Render distance in chunks.
    pub view_distance: i8,
    /// 0 enabled, 1 commands only, 2 hidden.
    pub chat_mode: i32,
    /// Whether chat colours are shown.
    pub chat_colors: bool,
    /// Bit mask of displayed skin parts.
    pub skin_parts: u8,
    /// 0 left, 1 right.
    pub main_hand: i32,
    /// Whether text filtering is enabled.
    pub text_filtering: bool,
    /// Whether the player may appear in the server list sample.
    pub allow_listing: bool,
    /// 0 all, 1 decreased, 2 minimal.
    pub particle_status: i32,
}

impl Default for ClientInformation {
    fn default() -> Self {
        Self {
            locale: "en_us".to_string(),
            view_distance: 10,
            chat_mode: 0,
            chat_colors: true,
            skin_parts: 0x7F,
            main_hand: 1,
            text_filtering: false,
            allow_listing: true,
            particle_status: 0,
        }
    }
}

impl Body for ClientInformation {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let locale = read_string(buf, MAX_LOCALE_LENGTH)?;
        #[allow(clippy::cast_possible_wrap)]
        let view_distance = read_u8(buf)? as i8;
        let chat_mode = read_varint(buf)?;
        let chat_colors = read_bool(buf)?;
        let skin_parts = read_u8(buf)?;
        let main_hand = read_varint(buf)?;
        let text_filtering = read_bool(buf)?;
        let allow_listing = read_bool(buf)?;
        let particle_status = read_varint(buf)?;

        Ok(Self {
            locale,
            view_distance,
            chat_mode,
            chat_colors,
            skin_parts,
            main_hand,
            text_filtering,
            allow_listing,
            particle_status,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        write_string(buf, &self.locale);
        buf.put_i8(self.view_distance);
        write_varint(buf, self.chat_mode);
        buf.put_u8(u8::from(self.chat_colors));
        buf.put_u8(self.skin_parts);
        write_varint(buf, self.main_hand);
        buf.put_u8(u8::from(self.text_filtering));
        buf.put_u8(u8::from(self.allow_listing));
        write_varint(buf, self.particle_status);
    }
}

impl PhasedPacket for ClientInformation {
    const KIND: PacketKind = PacketKind::ClientInformation;
    const DIRECTION: Direction = Direction::Serverbound;
}

/// Plugin channel message.
///
/// Exists in both directions; [`PhasedPacket::to_raw`] targets the server,
/// use [`PluginMessage::to_raw_towards`] for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMessage {
    /// Namespaced channel identifier.
    pub channel: String,
    /// Channel specific payload.
    pub data: Bytes,
}

impl PluginMessage {
    /// Create a plugin message.
    #[must_use]
    pub fn new(channel: impl Into<String>, data: Bytes) -> Self {
        Self {
            channel: channel.into(),
            data,
        }
    }

    /// Whether this is the client brand announcement.
    #[must_use]
    pub fn is_brand(&self) -> bool {
        self.channel == BRAND_CHANNEL
    }

    /// Encode for an explicit direction.
    ///
    /// # Errors
    ///
    /// Returns an error if the packet does not exist in `phase`.
    pub fn to_raw_towards(
        &self,
        direction: Direction,
        phase: Phase,
        version: ProtocolVersion,
    ) -> Result<RawPacket> {
        crate::packets::traits::encode_as(self, Self::KIND, direction, phase, version)
    }
}

impl Body for PluginMessage {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let channel = read_string(buf, MAX_CHANNEL_LENGTH)?;
        let data = buf.copy_to_bytes(buf.remaining());
        Ok(Self { channel, data })
    }

    fn encode(&self, buf: &mut BytesMut) {
        write_string(buf, &self.channel);
        buf.put_slice(&self.data);
    }
}

impl PhasedPacket for PluginMessage {
    const KIND: PacketKind = PacketKind::PluginMessage;
    const DIRECTION: Direction = Direction::Serverbound;
}

/// Finish Configuration (server -> client).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinishConfiguration;

impl Body for FinishConfiguration {
    fn decode(_buf: &mut Bytes) -> Result<Self> {
        Ok(Self)
    }

    fn encode(&self, _buf: &mut BytesMut) {}
}

impl PhasedPacket for FinishConfiguration {
    const KIND: PacketKind = PacketKind::FinishConfiguration;
    const DIRECTION: Direction = Direction::Clientbound;
}

/// Acknowledge Finish Configuration (client -> server).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcknowledgeFinishConfiguration;

impl Body for AcknowledgeFinishConfiguration {
    fn decode(_buf: &mut Bytes) -> Result<Self> {
        Ok(Self)
    }

    fn encode(&self, _buf: &mut BytesMut) {}
}

impl PhasedPacket for AcknowledgeFinishConfiguration {
    const KIND: PacketKind = PacketKind::FinishConfiguration;
    const DIRECTION: Direction = Direction::Serverbound;
}

/// Keep alive (server -> client). The client echoes the same ID back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    /// Opaque ID.
    pub id: i64,
}

impl Body for KeepAlive {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            id: crate::buf::read_i64(buf)?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64(self.id);
    }
}

impl PhasedPacket for KeepAlive {
    const KIND: PacketKind = PacketKind::KeepAlive;
    const DIRECTION: Direction = Direction::Clientbound;
}

/// Disconnect (server -> client) outside of login.
///
/// Unlike the login variant, the reason is an NBT text component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Plain text reason.
    pub reason: String,
}

impl Disconnect {
    /// Create a disconnect packet with a plain text reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Body for Disconnect {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            reason: read_text_component(buf)?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        write_text_component(buf, &self.reason);
    }
}

impl PhasedPacket for Disconnect {
    const KIND: PacketKind = PacketKind::Disconnect;
    const DIRECTION: Direction = Direction::Clientbound;
}
