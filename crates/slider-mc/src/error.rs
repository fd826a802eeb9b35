//! Protocol error types.

use std::io;

use thiserror::Error;

use crate::registry::PacketKind;
use crate::state::{Direction, Phase};

/// Errors that can occur when reading or writing Minecraft protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A `VarInt` was longer than 5 bytes.
    #[error("Malformed VarInt (more than 5 bytes)")]
    MalformedVarInt,

    /// A frame declared a length above the configured maximum.
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// The declared frame length.
        len: usize,
        /// The maximum allowed length.
        max: usize,
    },

    /// A frame declared a negative length.
    #[error("Negative frame length: {0}")]
    NegativeLength(i32),

    /// The inflated body did not match the declared uncompressed size.
    #[error("Decompressed size mismatch: expected {expected} bytes, got {actual}")]
    DecompressionMismatch {
        /// Size declared in the frame header.
        expected: usize,
        /// Size actually produced by the inflater.
        actual: usize,
    },

    /// A packet body ended before a field could be read.
    #[error("Unexpected end of packet data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes the field needed.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// A string exceeded the maximum length.
    #[error("String too long: {len} bytes (max {max})")]
    StringTooLong {
        /// The actual length of the string.
        len: usize,
        /// The maximum allowed length.
        max: usize,
    },

    /// A packet ID is not valid for the packet being parsed.
    #[error("Invalid packet ID: {0}")]
    InvalidPacketId(i32),

    /// A packet ID is not legal in the current protocol state.
    #[error("Packet 0x{id:02X} is not legal for {direction} traffic in the {phase} phase")]
    ProtocolViolation {
        /// Phase the connection was in.
        phase: Phase,
        /// Direction the packet travelled.
        direction: Direction,
        /// The offending packet ID.
        id: i32,
    },

    /// A state transition is not allowed from the current phase.
    #[error("Illegal state transition from {from}: {event}")]
    IllegalTransition {
        /// Phase the connection was in.
        from: Phase,
        /// Description of the rejected event.
        event: &'static str,
    },

    /// A named packet has no ID in the requested phase and direction.
    #[error("Packet {kind:?} does not exist in the {phase} phase")]
    UnmappedPacket {
        /// The packet that was being encoded.
        kind: PacketKind,
        /// Phase it was encoded for.
        phase: Phase,
    },

    /// A field held a value outside what the proxy accepts.
    #[error("Invalid packet data: {0}")]
    InvalidData(&'static str),

    /// A text component used an NBT tag the proxy cannot read.
    #[error("Unsupported NBT tag type: {0}")]
    UnsupportedNbt(u8),

    /// An invalid next state was received in a handshake.
    #[error("Invalid next state: {0}")]
    InvalidNextState(i32),

    /// An unsupported protocol version was received.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocol(i32),
}

impl ProtocolError {
    /// Whether this error comes from the framing layer (length, varint, compression).
    #[must_use]
    pub const fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::MalformedVarInt
                | Self::FrameTooLarge { .. }
                | Self::NegativeLength(_)
                | Self::DecompressionMismatch { .. }
        )
    }

    /// Whether this error is a violation of the protocol state machine.
    #[must_use]
    pub const fn is_violation(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation { .. } | Self::IllegalTransition { .. }
        )
    }
}

/// Result type alias using [`ProtocolError`].
pub type Result<T> = std::result::Result<T, ProtocolError>;
