//! Per-connection protocol state machine.
//!
//! A connection starts in [`Phase::Handshake`] and moves forward through
//! status or login, configuration and play. The only way back is
//! `Play -> Configuration`, used when a backend (or the proxy) asks the
//! client to reconfigure.

use std::fmt;

use crate::error::{ProtocolError, Result};
use crate::packets::handshake::{Handshake, NextState};
use crate::packets::traits::Body;
use crate::registry::{self, Lookup, PacketKind};
use crate::version::ProtocolVersion;

/// Protocol phase of one direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Initial phase, a single packet declaring version and intent.
    Handshake,
    /// Server list ping.
    Status,
    /// Authentication and encryption setup.
    Login,
    /// Registry and feature exchange before (or between) play.
    Configuration,
    /// In game.
    Play,
}

impl Phase {
    /// Whether packets the proxy has no name for may pass through.
    #[must_use]
    pub const fn relays_unknown(self) -> bool {
        matches!(self, Self::Configuration | Self::Play)
    }

    /// Lowercase name used in logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Status => "status",
            Self::Login => "login",
            Self::Configuration => "configuration",
            Self::Play => "play",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way a packet travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to server.
    Serverbound,
    /// Server to client.
    Clientbound,
}

impl Direction {
    /// The other direction.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Serverbound => Self::Clientbound,
            Self::Clientbound => Self::Serverbound,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Serverbound => "serverbound",
            Self::Clientbound => "clientbound",
        })
    }
}

/// Something that moves a connection to another phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// The handshake packet was seen.
    Handshake {
        /// Raw protocol version declared by the client.
        protocol: i32,
        /// What the client wants to do next.
        intent: NextState,
    },
    /// Login finished (clientbound) or was acknowledged (serverbound).
    LoginComplete,
    /// Configuration finished (clientbound) or was acknowledged (serverbound).
    FinishConfiguration,
    /// Re-configuration was requested (clientbound) or acknowledged (serverbound).
    StartConfiguration,
}

impl StateEvent {
    const fn name(self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::LoginComplete => "login complete",
            Self::FinishConfiguration => "finish configuration",
            Self::StartConfiguration => "start configuration",
        }
    }
}

/// Phase, version and intent of one direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolState {
    phase: Phase,
    protocol: i32,
    intent: Option<NextState>,
}

impl Default for ProtocolState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolState {
    /// A fresh state waiting for the handshake.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: Phase::Handshake,
            protocol: ProtocolVersion::LATEST.as_raw(),
            intent: None,
        }
    }

    /// A state that is already past the handshake.
    ///
    /// Used for connections the proxy opens itself, where the handshake is
    /// outbound and the first inbound packet belongs to `phase`.
    #[must_use]
    pub const fn at(phase: Phase, version: ProtocolVersion) -> Self {
        Self {
            phase,
            protocol: version.as_raw(),
            intent: None,
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Raw protocol version number declared in the handshake.
    #[must_use]
    pub const fn protocol(&self) -> i32 {
        self.protocol
    }

    /// The declared version, if the proxy supports it.
    #[must_use]
    pub const fn version(&self) -> Option<ProtocolVersion> {
        ProtocolVersion::from_raw(self.protocol)
    }

    /// Handshake intent, once known.
    #[must_use]
    pub const fn intent(&self) -> Option<NextState> {
        self.intent
    }

    /// Version whose tables are used for validation.
    ///
    /// Handshake, status and login IDs are identical across versions, so a
    /// client with an unsupported version is validated against the newest
    /// tables until the proxy turns it away.
    #[must_use]
    pub const fn table_version(&self) -> ProtocolVersion {
        match self.version() {
            Some(version) => version,
            None => ProtocolVersion::LATEST,
        }
    }

    /// Apply an event, returning the next state.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::IllegalTransition`] if the event is not
    /// allowed in the current phase. `Status` accepts no events at all.
    pub fn transition(&self, event: StateEvent) -> Result<Self> {
        let mut next = *self;
        match (self.phase, event) {
            (Phase::Handshake, StateEvent::Handshake { protocol, intent }) => {
                next.protocol = protocol;
                next.intent = Some(intent);
                next.phase = match intent {
                    NextState::Status => Phase::Status,
                    NextState::Login | NextState::Transfer => Phase::Login,
                };
            }
            (Phase::Login, StateEvent::LoginComplete)
            | (Phase::Play, StateEvent::StartConfiguration) => next.phase = Phase::Configuration,
            (Phase::Configuration, StateEvent::FinishConfiguration) => next.phase = Phase::Play,
            (from, event) => {
                return Err(ProtocolError::IllegalTransition {
                    from,
                    event: event.name(),
                });
            }
        }
        Ok(next)
    }
}

/// Outcome of validating a packet ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    /// A packet the proxy knows by name.
    Known(PacketKind),
    /// A legal packet the proxy relays without parsing.
    Opaque,
}

impl PacketClass {
    /// The packet kind, if known.
    #[must_use]
    pub const fn kind(self) -> Option<PacketKind> {
        match self {
            Self::Known(kind) => Some(kind),
            Self::Opaque => None,
        }
    }
}

/// Check that `id` is legal for `direction` in the given state.
///
/// # Errors
///
/// Returns [`ProtocolError::ProtocolViolation`] for IDs outside the phase's
/// range, and for unnamed IDs in phases the proxy terminates itself.
pub fn validate(state: &ProtocolState, id: i32, direction: Direction) -> Result<PacketClass> {
    let phase = state.phase();
    match registry::lookup(state.table_version(), phase, direction, id) {
        Lookup::Named(kind) => Ok(PacketClass::Known(kind)),
        Lookup::Unnamed if phase.relays_unknown() => Ok(PacketClass::Opaque),
        Lookup::Unnamed | Lookup::OutOfRange => Err(ProtocolError::ProtocolViolation {
            phase,
            direction,
            id,
        }),
    }
}

/// The state event an inbound packet triggers on its own connection, if any.
///
/// Only the handshake needs its body parsed.
///
/// # Errors
///
/// Returns an error if a handshake body is malformed.
pub fn inbound_event(
    kind: PacketKind,
    direction: Direction,
    payload: &[u8],
) -> Result<Option<StateEvent>> {
    let event = match (direction, kind) {
        (Direction::Serverbound, PacketKind::Intention) => {
            let handshake = Handshake::decode(&mut bytes::Bytes::copy_from_slice(payload))?;
            Some(StateEvent::Handshake {
                protocol: handshake.protocol_version,
                intent: handshake.next_state,
            })
        }
        (Direction::Serverbound, PacketKind::LoginAcknowledged)
        | (Direction::Clientbound, PacketKind::LoginFinished) => Some(StateEvent::LoginComplete),
        (_, PacketKind::FinishConfiguration) => Some(StateEvent::FinishConfiguration),
        (Direction::Serverbound, PacketKind::ConfigurationAcknowledged)
        | (Direction::Clientbound, PacketKind::StartConfiguration) => {
            Some(StateEvent::StartConfiguration)
        }
        _ => None,
    };
    Ok(event)
}

/// Whether the reader must pause after this packet until its owner resumes it.
///
/// The answer to a login start or encryption response decides whether the
/// next inbound byte is encrypted, so nothing after them may be decoded yet.
#[must_use]
pub const fn is_barrier(kind: PacketKind, direction: Direction) -> bool {
    matches!(
        (direction, kind),
        (Direction::Serverbound, PacketKind::Hello | PacketKind::Key)
    )
}
