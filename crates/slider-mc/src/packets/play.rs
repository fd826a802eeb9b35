//! Play phase packets the proxy reads or writes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::buf::{read_bool, read_string, read_text_component, write_string, write_text_component};
use crate::error::Result;
use crate::packets::traits::{Body, PhasedPacket};
use crate::registry::PacketKind;
use crate::state::Direction;

/// Maximum chat command length.
const MAX_COMMAND_LENGTH: usize = 32_767;

/// Start Configuration (server -> client).
///
/// Sends a playing client back into configuration, which is how a backend
/// switch begins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartConfiguration;

impl Body for StartConfiguration {
    fn decode(_buf: &mut Bytes) -> Result<Self> {
        Ok(Self)
    }

    fn encode(&self, _buf: &mut BytesMut) {}
}

impl PhasedPacket for StartConfiguration {
    const KIND: PacketKind = PacketKind::StartConfiguration;
    const DIRECTION: Direction = Direction::Clientbound;
}

/// Configuration Acknowledged (client -> server).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigurationAcknowledged;

impl Body for ConfigurationAcknowledged {
    fn decode(_buf: &mut Bytes) -> Result<Self> {
        Ok(Self)
    }

    fn encode(&self, _buf: &mut BytesMut) {}
}

impl PhasedPacket for ConfigurationAcknowledged {
    const KIND: PacketKind = PacketKind::ConfigurationAcknowledged;
    const DIRECTION: Direction = Direction::Serverbound;
}

/// Unsigned chat command (client -> server), without the leading slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatCommand {
    /// The command line, e.g. `server lobby`.
    pub command: String,
}

impl Body for ChatCommand {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            command: read_string(buf, MAX_COMMAND_LENGTH)?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        write_string(buf, &self.command);
    }
}

impl PhasedPacket for ChatCommand {
    const KIND: PacketKind = PacketKind::ChatCommand;
    const DIRECTION: Direction = Direction::Serverbound;
}

/// System chat message (server -> client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemChat {
    /// Plain text content.
    pub content: String,
    /// Show above the hotbar instead of in chat.
    pub overlay: bool,
}

impl SystemChat {
    /// A chat line.
    #[must_use]
    pub fn message(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            overlay: false,
        }
    }
}

impl Body for SystemChat {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let content = read_text_component(buf)?;
        let overlay = read_bool(buf)?;
        Ok(Self { content, overlay })
    }

    fn encode(&self, buf: &mut BytesMut) {
        write_text_component(buf, &self.content);
        buf.put_u8(u8::from(self.overlay));
    }
}

impl PhasedPacket for SystemChat {
    const KIND: PacketKind = PacketKind::SystemChat;
    const DIRECTION: Direction = Direction::Clientbound;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Phase;
    use crate::version::ProtocolVersion;

    const V: ProtocolVersion = ProtocolVersion::LATEST;

    #[test]
    fn test_start_configuration_id() {
        let raw = StartConfiguration.to_raw(Phase::Play, V).unwrap();
        assert_eq!(raw.id, 0x6F);
        assert!(raw.payload.is_empty());

        let raw = ConfigurationAcknowledged.to_raw(Phase::Play, V).unwrap();
        assert_eq!(raw.id, 0x0F);
    }

    #[test]
    fn test_chat_command_roundtrip() {
        let command = ChatCommand {
            command: "server lobby".to_string(),
        };
        let raw = command.to_raw(Phase::Play, V).unwrap();
        assert_eq!(raw.id, 0x06);
        assert_eq!(ChatCommand::from_raw(&raw).unwrap(), command);
    }

    #[test]
    fn test_system_chat_roundtrip() {
        let chat = SystemChat::message("You are on lobby");
        let raw = chat.to_raw(Phase::Play, V).unwrap();
        assert_eq!(raw.id, 0x72);
        assert_eq!(SystemChat::from_raw(&raw).unwrap(), chat);
        assert!(chat.to_raw(Phase::Configuration, V).is_err());
    }
}
