//! Minecraft protocol implementation for Slider.
//!
//! This crate provides the framing codec, the protocol state machine, the
//! packet ID tables and the handful of packets the proxy reads or writes.
//! Everything else is relayed as opaque [`RawPacket`]s.

#[cfg(not(feature = "protocol-772"))]
compile_error!("at least one protocol version feature must be enabled");

pub mod buf;
pub mod cipher;
pub mod codec;
pub mod error;
pub mod packets;
pub mod registry;
pub mod state;
pub mod varint;
pub mod version;

pub use codec::{PacketCodec, RawPacket};
pub use error::ProtocolError;
pub use registry::PacketKind;
pub use state::{Direction, PacketClass, Phase, ProtocolState, StateEvent};
pub use version::ProtocolVersion;
