//! Player-facing messages.

use slider_mc::packets::{Disconnect, LoginDisconnect, Packet, PhasedPacket};
use slider_mc::{Phase, ProtocolVersion, RawPacket};

/// A plain JSON text component.
#[must_use]
pub fn text_component(text: &str) -> String {
    serde_json::json!({ "text": text }).to_string()
}

/// The disconnect packet that shows `reason` to a client in `phase`.
///
/// Returns `None` for phases without a disconnect packet.
#[must_use]
pub fn disconnect_packet(phase: Phase, version: ProtocolVersion, reason: &str) -> Option<RawPacket> {
    match phase {
        Phase::Login => Some(LoginDisconnect::from_json(text_component(reason)).to_raw()),
        Phase::Configuration | Phase::Play => Disconnect::new(reason).to_raw(phase, version).ok(),
        Phase::Handshake | Phase::Status => None,
    }
}
