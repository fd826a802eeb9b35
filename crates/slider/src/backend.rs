//! Logging a player into a backend server.
//!
//! The proxy plays the client role here: it sends the handshake and login
//! start, answers compression and forwarding requests, and acknowledges the
//! login so the backend enters the configuration phase.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use slider_mc::packets::{
    Handshake, LoginAcknowledged, LoginDisconnect, LoginPluginRequest, LoginStart, NextState,
    Packet, SetCompression,
};
use slider_mc::{PacketClass, PacketKind, ProtocolVersion, RawPacket};

use crate::config::SessionConfig;
use crate::connection::{CloseGuard, Connection, TrafficClass};
use crate::directory::BackendDirectory;
use crate::error::BackendError;
use crate::forwarding::Forwarding;
use crate::pipeline::{ConnectionEvent, EventStream};
use crate::session::Player;

/// Split `host:port`, defaulting the port to 25565.
///
/// IPv6 hosts lose their brackets; a bare IPv6 address is all host.
fn split_addr(addr: &str) -> (&str, u16) {
    let (host, port) = addr
        .rsplit_once(':')
        .and_then(|(host, port)| port.parse().ok().map(|port| (host, port)))
        .filter(|(host, _)| !host.contains(':') || host.starts_with('['))
        .unwrap_or((addr, 25565));

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    (host, port)
}

/// Run the login exchange on a freshly opened backend connection.
///
/// Returns once the backend has been told the login is acknowledged; the
/// next events on `events` belong to the configuration phase.
///
/// # Errors
///
/// Returns an error if the backend refuses the player, closes, misbehaves or
/// does not finish within `timeout`.
pub async fn login(
    conn: &Connection,
    events: &mut EventStream,
    server: &str,
    addr: &str,
    player: &Player,
    forwarding: &Forwarding,
    timeout: Duration,
) -> Result<(), BackendError> {
    let deadline = Instant::now() + timeout;
    let forwarded = player.forwarded();
    let (host, port) = split_addr(addr);

    let handshake = Handshake {
        protocol_version: ProtocolVersion::LATEST.as_raw(),
        server_address: forwarding.handshake_address(host, &forwarded),
        server_port: port,
        next_state: NextState::Login,
    };
    send(conn, server, handshake.to_raw())?;
    send(conn, server, LoginStart::new(player.name.clone(), player.uuid).to_raw())?;

    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| BackendError::Timeout {
                server: server.to_string(),
                after: timeout,
            })?;

        let (packet, kind) = match event {
            Some(ConnectionEvent::Packet {
                packet,
                class: PacketClass::Known(kind),
                ..
            }) => (packet, kind),
            Some(ConnectionEvent::Packet { packet, .. }) => {
                debug!(server, id = packet.id, "Ignoring unexpected login packet");
                continue;
            }
            Some(ConnectionEvent::Closed(reason)) => {
                debug!(server, %reason, "Backend closed during login");
                return Err(BackendError::Closed {
                    server: server.to_string(),
                });
            }
            None => {
                return Err(BackendError::Closed {
                    server: server.to_string(),
                });
            }
        };

        match kind {
            PacketKind::EncryptionRequest => {
                return Err(BackendError::Rejected {
                    server: server.to_string(),
                    reason: "backend is in online mode".to_string(),
                });
            }
            PacketKind::SetCompression => {
                let SetCompression { threshold } = SetCompression::from_raw(&packet)?;
                debug!(server, threshold, "Backend enabled compression");
                conn.enable_compression(threshold)
                    .map_err(|_| closed(server))?;
            }
            PacketKind::LoginPluginRequest => {
                let request = LoginPluginRequest::from_raw(&packet)?;
                debug!(server, channel = %request.channel, "Login plugin request");
                let response = forwarding.answer(&request, &forwarded)?;
                send(conn, server, response.to_raw())?;
            }
            PacketKind::LoginDisconnect => {
                let LoginDisconnect { reason } = LoginDisconnect::from_raw(&packet)?;
                return Err(BackendError::Rejected {
                    server: server.to_string(),
                    reason,
                });
            }
            PacketKind::LoginFinished => {
                send(conn, server, LoginAcknowledged.to_raw())?;
                info!(server, player = %player.name, "Logged in to backend");
                return Ok(());
            }
            other => debug!(server, ?other, "Ignoring unexpected login packet"),
        }
    }
}

fn send(conn: &Connection, server: &str, packet: RawPacket) -> Result<(), BackendError> {
    conn.send(packet, TrafficClass::Critical)
        .map_err(|_| closed(server))
}

fn closed(server: &str) -> BackendError {
    BackendError::Closed {
        server: server.to_string(),
    }
}

/// Connect to the backend called `server` and log `player` into it.
///
/// The connection is closed again if any step fails or the returned future
/// is dropped before it completes.
///
/// # Errors
///
/// Returns the first error of resolving, connecting or logging in.
pub async fn connect_and_login(
    directory: &BackendDirectory,
    server: &str,
    player: &Player,
    forwarding: &Forwarding,
    timeouts: &SessionConfig,
) -> Result<(Connection, EventStream), BackendError> {
    let target = directory.resolve(server)?;
    let (conn, mut events) = directory.connect(&target, timeouts.connect_timeout).await?;
    let guard = CloseGuard::new(conn.clone(), "backend login abandoned");

    if let Err(e) = login(
        &conn,
        &mut events,
        &target.name,
        &target.addr,
        player,
        forwarding,
        timeouts.login_timeout,
    )
    .await
    {
        directory.record_failure(&target.name, &e);
        return Err(e);
    }

    let conn = guard.disarm().unwrap_or(conn);
    Ok((conn, events))
}
