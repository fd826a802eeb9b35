//! Minecraft protocol packets.
//!
//! Packets are organized by phase:
//! - Handshake: Initial connection state
//! - Status: Server list ping
//! - Login: Authentication
//! - Configuration: Client settings and registry exchange
//! - Play: Only the few packets the proxy itself reads or writes

pub mod configuration;
pub mod handshake;
pub mod login;
pub mod play;
pub mod status;
pub mod traits;

pub use configuration::{
    AcknowledgeFinishConfiguration, ClientInformation, Disconnect, FinishConfiguration, KeepAlive,
    PluginMessage,
};
pub use handshake::{Handshake, NextState};
pub use login::{
    EncryptionRequest, EncryptionResponse, LoginAcknowledged, LoginDisconnect, LoginPluginRequest,
    LoginPluginResponse, LoginStart, LoginSuccess, Property, SetCompression,
};
pub use play::{ChatCommand, ConfigurationAcknowledged, StartConfiguration, SystemChat};
pub use status::{Ping, Pong, StatusRequest, StatusResponse};
pub use traits::{Body, Packet, PhasedPacket};
