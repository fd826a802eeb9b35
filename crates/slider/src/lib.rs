//! Slider: a Minecraft proxy with live backend switching.
//!
//! Players connect to the proxy, which authenticates them, logs them into a
//! backend server and relays their traffic. A player can be moved to another
//! backend at any time through the configuration phase without dropping the
//! client connection.

pub mod api;
pub mod auth;
pub mod backend;
pub mod chat;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod forwarding;
pub mod pipeline;
pub mod proxy;
pub mod session;
