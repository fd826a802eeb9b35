//! Static packet ID tables.
//!
//! For every supported protocol version, each `(phase, direction)` pair has a
//! contiguous range of legal packet IDs and a short list of the packets the
//! proxy understands by name. Anything else in range is relayed without being
//! parsed.

use crate::state::{Direction, Phase};
use crate::version::ProtocolVersion;

/// A packet the proxy gives a name to.
///
/// Names are only unique together with the phase and direction they were
/// looked up in (a `KeepAlive` exists in both directions and two phases).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Serverbound handshake declaring version and intent.
    Intention,
    /// Serverbound status request.
    StatusRequest,
    /// Serverbound status ping.
    PingRequest,
    /// Clientbound status document.
    StatusResponse,
    /// Clientbound status pong.
    PongResponse,
    /// Serverbound login start.
    Hello,
    /// Serverbound encryption response.
    Key,
    /// Serverbound login plugin response.
    LoginPluginResponse,
    /// Serverbound login acknowledgement.
    LoginAcknowledged,
    /// Clientbound login disconnect.
    LoginDisconnect,
    /// Clientbound encryption request.
    EncryptionRequest,
    /// Clientbound login success.
    LoginFinished,
    /// Clientbound compression threshold.
    SetCompression,
    /// Clientbound login plugin request.
    LoginPluginRequest,
    /// Serverbound client settings.
    ClientInformation,
    /// Plugin channel message, either direction.
    PluginMessage,
    /// Finish configuration (clientbound) or its acknowledgement (serverbound).
    FinishConfiguration,
    /// Keep alive, either direction.
    KeepAlive,
    /// Clientbound disconnect outside of login.
    Disconnect,
    /// Serverbound unsigned chat command.
    ChatCommand,
    /// Serverbound acknowledgement of a start configuration request.
    ConfigurationAcknowledged,
    /// Clientbound join game.
    LoginPlay,
    /// Clientbound request to re-enter configuration.
    StartConfiguration,
    /// Clientbound system chat message.
    SystemChat,
}

/// Legal IDs of one `(phase, direction)` pair.
#[derive(Debug)]
pub struct PhaseTable {
    /// Highest legal packet ID. The lowest is always 0.
    pub max_id: i32,
    /// Packets the proxy knows by name.
    pub named: &'static [(i32, PacketKind)],
}

impl PhaseTable {
    /// Whether `id` is inside the legal range.
    #[must_use]
    pub const fn contains(&self, id: i32) -> bool {
        id >= 0 && id <= self.max_id
    }

    /// The named packet with this ID, if any.
    #[must_use]
    pub fn kind(&self, id: i32) -> Option<PacketKind> {
        self.named
            .iter()
            .find_map(|&(named_id, kind)| (named_id == id).then_some(kind))
    }

    /// The ID of a named packet, if it exists in this table.
    #[must_use]
    pub fn id(&self, kind: PacketKind) -> Option<i32> {
        self.named
            .iter()
            .find_map(|&(id, named_kind)| (named_kind == kind).then_some(id))
    }
}

/// Result of looking an ID up in the tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The ID is a packet the proxy names.
    Named(PacketKind),
    /// The ID is legal but the proxy has no name for it.
    Unnamed,
    /// The ID does not exist in this phase and direction.
    OutOfRange,
}

/// The table for a `(version, phase, direction)` triple.
#[must_use]
pub const fn table(version: ProtocolVersion, phase: Phase, direction: Direction) -> &'static PhaseTable {
    match version {
        #[cfg(feature = "protocol-772")]
        ProtocolVersion::V772 => v772::table(phase, direction),
    }
}

/// Classify a packet ID.
#[must_use]
pub fn lookup(version: ProtocolVersion, phase: Phase, direction: Direction, id: i32) -> Lookup {
    let table = table(version, phase, direction);
    if !table.contains(id) {
        return Lookup::OutOfRange;
    }
    table.kind(id).map_or(Lookup::Unnamed, Lookup::Named)
}

/// Find the ID of a named packet.
#[must_use]
pub fn id_of(
    version: ProtocolVersion,
    phase: Phase,
    direction: Direction,
    kind: PacketKind,
) -> Option<i32> {
    table(version, phase, direction).id(kind)
}

#[cfg(feature = "protocol-772")]
mod v772 {
    use super::{PacketKind as K, PhaseTable};
    use crate::state::{Direction, Phase};

    const HANDSHAKE_SB: PhaseTable = PhaseTable {
        max_id: 0x00,
        named: &[(0x00, K::Intention)],
    };

    const STATUS_SB: PhaseTable = PhaseTable {
        max_id: 0x01,
        named: &[(0x00, K::StatusRequest), (0x01, K::PingRequest)],
    };

    const STATUS_CB: PhaseTable = PhaseTable {
        max_id: 0x01,
        named: &[(0x00, K::StatusResponse), (0x01, K::PongResponse)],
    };

    const LOGIN_SB: PhaseTable = PhaseTable {
        max_id: 0x04,
        named: &[
            (0x00, K::Hello),
            (0x01, K::Key),
            (0x02, K::LoginPluginResponse),
            (0x03, K::LoginAcknowledged),
        ],
    };

    const LOGIN_CB: PhaseTable = PhaseTable {
        max_id: 0x05,
        named: &[
            (0x00, K::LoginDisconnect),
            (0x01, K::EncryptionRequest),
            (0x02, K::LoginFinished),
            (0x03, K::SetCompression),
            (0x04, K::LoginPluginRequest),
        ],
    };

    const CONFIGURATION_SB: PhaseTable = PhaseTable {
        max_id: 0x08,
        named: &[
            (0x00, K::ClientInformation),
            (0x02, K::PluginMessage),
            (0x03, K::FinishConfiguration),
            (0x04, K::KeepAlive),
        ],
    };

    const CONFIGURATION_CB: PhaseTable = PhaseTable {
        max_id: 0x12,
        named: &[
            (0x01, K::PluginMessage),
            (0x02, K::Disconnect),
            (0x03, K::FinishConfiguration),
            (0x04, K::KeepAlive),
        ],
    };

    const PLAY_SB: PhaseTable = PhaseTable {
        max_id: 0x41,
        named: &[
            (0x06, K::ChatCommand),
            (0x0D, K::ClientInformation),
            (0x0F, K::ConfigurationAcknowledged),
            (0x15, K::PluginMessage),
            (0x1B, K::KeepAlive),
        ],
    };

    const PLAY_CB: PhaseTable = PhaseTable {
        max_id: 0x85,
        named: &[
            (0x18, K::PluginMessage),
            (0x1C, K::Disconnect),
            (0x26, K::KeepAlive),
            (0x2B, K::LoginPlay),
            (0x6F, K::StartConfiguration),
            (0x72, K::SystemChat),
        ],
    };

    // The server never speaks during the handshake
    const EMPTY: PhaseTable = PhaseTable {
        max_id: -1,
        named: &[],
    };

    pub(super) const fn table(phase: Phase, direction: Direction) -> &'static PhaseTable {
        match (phase, direction) {
            (Phase::Handshake, Direction::Serverbound) => &HANDSHAKE_SB,
            (Phase::Handshake, Direction::Clientbound) => &EMPTY,
            (Phase::Status, Direction::Serverbound) => &STATUS_SB,
            (Phase::Status, Direction::Clientbound) => &STATUS_CB,
            (Phase::Login, Direction::Serverbound) => &LOGIN_SB,
            (Phase::Login, Direction::Clientbound) => &LOGIN_CB,
            (Phase::Configuration, Direction::Serverbound) => &CONFIGURATION_SB,
            (Phase::Configuration, Direction::Clientbound) => &CONFIGURATION_CB,
            (Phase::Play, Direction::Serverbound) => &PLAY_SB,
            (Phase::Play, Direction::Clientbound) => &PLAY_CB,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_PHASES: [Phase; 5] = [
        Phase::Handshake,
        Phase::Status,
        Phase::Login,
        Phase::Configuration,
        Phase::Play,
    ];

    #[test]
    #[cfg(feature = "protocol-772")]
    fn test_named_ids_are_in_range_and_unique() {
        for phase in ALL_PHASES {
            for direction in [Direction::Serverbound, Direction::Clientbound] {
                let table = table(ProtocolVersion::V772, phase, direction);
                for (i, &(id, kind)) in table.named.iter().enumerate() {
                    assert!(table.contains(id), "{kind:?} out of range in {phase}");
                    assert!(
                        table.named[i + 1..].iter().all(|&(other, _)| other != id),
                        "duplicate id 0x{id:02X} in {phase} {direction}"
                    );
                }
            }
        }
    }

    #[test]
    #[cfg(feature = "protocol-772")]
    fn test_lookup() {
        let v = ProtocolVersion::V772;
        assert_eq!(
            lookup(v, Phase::Play, Direction::Clientbound, 0x6F),
            Lookup::Named(PacketKind::StartConfiguration)
        );
        assert_eq!(
            lookup(v, Phase::Play, Direction::Serverbound, 0x20),
            Lookup::Unnamed
        );
        assert_eq!(
            lookup(v, Phase::Play, Direction::Serverbound, 0x42),
            Lookup::OutOfRange
        );
        assert_eq!(
            lookup(v, Phase::Status, Direction::Serverbound, -1),
            Lookup::OutOfRange
        );
        assert_eq!(
            lookup(v, Phase::Handshake, Direction::Clientbound, 0x00),
            Lookup::OutOfRange
        );
    }

    #[test]
    #[cfg(feature = "protocol-772")]
    fn test_v772_range_boundaries() {
        let v = ProtocolVersion::V772;
        let last = [
            (Phase::Login, Direction::Serverbound, 0x04),
            (Phase::Login, Direction::Clientbound, 0x05),
            (Phase::Configuration, Direction::Serverbound, 0x08),
            (Phase::Configuration, Direction::Clientbound, 0x12),
            // use_item 0x40, custom_click_action 0x41
            (Phase::Play, Direction::Serverbound, 0x41),
            // clear_dialog 0x84, show_dialog 0x85
            (Phase::Play, Direction::Clientbound, 0x85),
        ];

        for (phase, direction, max) in last {
            let table = table(v, phase, direction);
            assert!(table.contains(max), "0x{max:02X} {direction} in {phase}");
            assert!(!table.contains(max + 1), "0x{:02X} {direction} in {phase}", max + 1);
        }

        for id in [0x40, 0x41] {
            assert_eq!(lookup(v, Phase::Play, Direction::Serverbound, id), Lookup::Unnamed);
        }
        for id in [0x84, 0x85] {
            assert_eq!(lookup(v, Phase::Play, Direction::Clientbound, id), Lookup::Unnamed);
        }
    }

    #[test]
    #[cfg(feature = "protocol-772")]
    fn test_id_of() {
        let v = ProtocolVersion::V772;
        assert_eq!(
            id_of(v, Phase::Configuration, Direction::Serverbound, PacketKind::KeepAlive),
            Some(0x04)
        );
        assert_eq!(
            id_of(v, Phase::Play, Direction::Serverbound, PacketKind::KeepAlive),
            Some(0x1B)
        );
        assert_eq!(
            id_of(v, Phase::Status, Direction::Serverbound, PacketKind::KeepAlive),
            None
        );
    }
}
