//! Player-facing side of the proxy: server list pings and logins.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{Instrument, debug, error, info, info_span, warn};

use slider_mc::packets::{
    EncryptionRequest, EncryptionResponse, Handshake, LoginStart, LoginSuccess, NextState, Packet,
    Ping, Pong, SetCompression, StatusResponse,
};
use slider_mc::{
    PacketClass, PacketKind, Phase, ProtocolError, ProtocolState, ProtocolVersion, RawPacket,
};

use crate::auth::{self, AuthKeys, Authenticator, PlayerProfile};
use crate::backend;
use crate::chat;
use crate::config::{NetworkConfig, ProxyConfig};
use crate::connection::{CloseGuard, Connection, Side, TrafficClass};
use crate::directory::BackendDirectory;
use crate::error::{BackendError, ProxyError, Result};
use crate::pipeline::{CloseReason, ConnectionEvent, EventStream};
use crate::session::{BackendLink, Player, Session, SessionContext, SessionHandle, SessionRegistry};

/// Minecraft proxy that handles connections.
pub struct Proxy {
    auth: Authenticator,
    registry: Arc<SessionRegistry>,
    ctx: Arc<SessionContext>,
    network: NetworkConfig,
    /// Backends tried for a new player, in order
    join_order: Vec<String>,
    compression_threshold: i32,
    max_players: u32,
    motd: String,
    /// Session counter for logging
    session_counter: AtomicUsize,
}

impl Proxy {
    /// Create a proxy sending players to the backends in `directory`.
    #[must_use]
    pub fn new(
        config: &ProxyConfig,
        directory: Arc<BackendDirectory>,
        registry: Arc<SessionRegistry>,
        auth: Authenticator,
    ) -> Self {
        Self {
            auth,
            registry,
            ctx: Arc::new(SessionContext {
                directory,
                forwarding: config.forwarding.clone(),
                settings: config.session.clone(),
            }),
            network: config.network.clone(),
            join_order: config.join_order(),
            compression_threshold: config.compression_threshold,
            max_players: config.max_players,
            motd: config.motd.clone(),
            session_counter: AtomicUsize::new(0),
        }
    }

    /// Run the proxy, accepting connections on the given listener.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((client, client_addr)) => {
                    if let Err(e) = client.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY: {e}");
                    }
                    let proxy = Arc::clone(&self);
                    tokio::spawn(async move {
                        proxy.handle_connection(client, client_addr).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {e}");
                }
            }
        }
    }

    /// Handle a single client connection.
    pub async fn handle_connection<S>(&self, stream: S, client_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session_id = self.session_counter.fetch_add(1, Ordering::Relaxed);

        async {
            let (client, events) = Connection::open(stream, Side::Client, &self.network);
            let _guard = CloseGuard::new(client.clone(), "connection handler ended");

            match self.serve(&client, events, client_addr).await {
                Ok(()) => {}
                Err(ProxyError::ConnectionClosed | ProxyError::PipelineClosed) => {
                    debug!("Client left before finishing");
                }
                Err(e) => info!("Connection ended: {e}"),
            }
        }
        .instrument(info_span!(
            "conn",
            sid = session_id,
            ip = %client_addr.ip(),
            port = client_addr.port()
        ))
        .await;
    }

    async fn serve(
        &self,
        client: &Connection,
        mut events: EventStream,
        client_addr: SocketAddr,
    ) -> Result<()> {
        let (packet, _, state) = next_packet(&mut events).await?;
        let handshake = Handshake::from_raw(&packet)?;

        debug!(
            protocol = handshake.protocol_version,
            address = %handshake.server_address,
            port = handshake.server_port,
            next_state = ?handshake.next_state,
            "Received handshake"
        );

        match handshake.next_state {
            NextState::Status => self.handle_status(client, &mut events).await,
            NextState::Login | NextState::Transfer => {
                let timeout = self.ctx.settings.login_timeout;
                let login = self.handle_login(client, &mut events, &handshake, state, client_addr);
                let admitted = tokio::time::timeout(timeout, login)
                    .await
                    .unwrap_or_else(|_| {
                        Err(ProxyError::LoginRefused("Timed out while logging in".to_string()))
                    });

                match admitted {
                    Ok((player, link)) => {
                        let (session, handle) =
                            Session::new(player, client.clone(), events, link, Arc::clone(&self.ctx));
                        self.play(session, handle).await;
                        Ok(())
                    }
                    Err(e) => {
                        let farewell = chat::disconnect_packet(
                            Phase::Login,
                            state.table_version(),
                            &e.disconnect_message(),
                        );
                        client.disconnect(farewell, CloseReason::Local(e.to_string()));
                        Err(e)
                    }
                }
            }
        }
    }

    /// Handle a status (server list ping) request.
    async fn handle_status(&self, client: &Connection, events: &mut EventStream) -> Result<()> {
        expect(events, PacketKind::StatusRequest).await?;
        debug!("Received status request");

        let version = ProtocolVersion::LATEST;
        let status_json = json!({
            "version": {
                "name": version.name(),
                "protocol": version.as_raw()
            },
            "players": {
                "max": self.max_players,
                "online": self.registry.len(),
                "sample": []
            },
            "description": {
                "text": self.motd
            },
            "enforcesSecureChat": false
        });

        let response = StatusResponse::new(status_json.to_string());
        client.send(response.to_raw(), TrafficClass::Critical)?;

        // Answer the ping and hang up
        let client_ping = Ping::from_raw(&expect(events, PacketKind::PingRequest).await?)?;
        debug!(payload = client_ping.payload, "Received ping");

        let pong = Pong::new(client_ping.payload);
        client.disconnect(
            Some(pong.to_raw()),
            CloseReason::Local("status answered".to_string()),
        );
        Ok(())
    }

    /// Authenticate the player and log them into the first backend that takes them.
    async fn handle_login(
        &self,
        client: &Connection,
        events: &mut EventStream,
        handshake: &Handshake,
        state: ProtocolState,
        client_addr: SocketAddr,
    ) -> Result<(Player, BackendLink)> {
        let latest = ProtocolVersion::LATEST;
        let Some(version) = state.version() else {
            let message = if handshake.protocol_version > latest.as_raw() {
                format!("Outdated server! I'm still on {}", latest.name())
            } else {
                format!("Outdated client! Please use {}", latest.name())
            };
            return Err(ProxyError::LoginRefused(message));
        };

        let start = LoginStart::from_raw(&expect(events, PacketKind::Hello).await?)?;
        info!(username = %start.name, "Login started");

        let profile = match &self.auth {
            Authenticator::Online(keys) => authenticate(client, events, keys, &start.name).await?,
            Authenticator::Offline => PlayerProfile::offline(&start.name),
        };

        // The reader is paused at the last login packet until the codec is in place
        let threshold = self.compression_threshold;
        if threshold >= 0 {
            client.send(SetCompression::new(threshold).to_raw(), TrafficClass::Critical)?;
            client.enable_compression(threshold)?;
            client.set_inbound_compression(threshold)?;
        }
        client.resume()?;

        if self.registry.len() >= usize::try_from(self.max_players).unwrap_or(usize::MAX) {
            return Err(ProxyError::LoginRefused("The server is full!".to_string()));
        }
        if self.registry.contains(&profile.uuid) {
            return Err(ProxyError::LoginRefused(
                "You are already connected to this proxy!".to_string(),
            ));
        }

        let player = Player {
            uuid: profile.uuid,
            name: profile.username,
            properties: profile.properties,
            addr: client_addr,
            virtual_host: handshake.clean_address().to_string(),
            virtual_port: handshake.server_port,
            version,
        };

        let link = self.connect_first_available(&player).await?;

        let success = LoginSuccess {
            uuid: player.uuid,
            username: player.name.clone(),
            properties: player.properties.clone(),
        };
        client.send(success.to_raw(), TrafficClass::Critical)?;
        info!(username = %player.name, uuid = %player.uuid, "Login complete");

        Ok((player, link))
    }

    async fn connect_first_available(&self, player: &Player) -> Result<BackendLink> {
        let mut last_error = None;

        for server in &self.join_order {
            match backend::connect_and_login(
                &self.ctx.directory,
                server,
                player,
                &self.ctx.forwarding,
                &self.ctx.settings,
            )
            .await
            {
                Ok((conn, events)) => return Ok(BackendLink::new(server.clone(), conn, events)),
                Err(e) => {
                    warn!(server = %server, username = %player.name, "Could not join backend: {e}");
                    last_error = Some(e);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| BackendError::UnknownServer(String::new()));
        Err(ProxyError::BackendUnavailable(err))
    }

    async fn play(&self, session: Session, handle: SessionHandle) {
        let uuid = handle.player().uuid;

        if self.registry.insert(handle.clone()) {
            session.run().await;
            self.registry.remove(&uuid);
        } else {
            // Lost a race with another login of the same player
            handle.kick("You are already connected to this proxy!");
            session.run().await;
        }
    }
}

/// Run the online-mode handshake and verify the session with Mojang.
async fn authenticate(
    client: &Connection,
    events: &mut EventStream,
    keys: &AuthKeys,
    username: &str,
) -> Result<PlayerProfile> {
    let request = EncryptionRequest::new(keys.public_key_der(), keys.verify_token());
    client.send(request.to_raw(), TrafficClass::Critical)?;
    client.resume()?;

    let response = EncryptionResponse::from_raw(&expect(events, PacketKind::Key).await?)?;
    let secret = keys.decrypt_response(&response.shared_secret, &response.verify_token)?;

    client.set_inbound_encryption(secret)?;
    client.enable_encryption(secret)?;
    debug!("Encryption enabled");

    let server_hash = keys.calculate_server_hash(&secret);
    let profile = auth::verify_session(username, &server_hash, None).await?;
    info!(username = %profile.username, uuid = %profile.uuid, "Player authenticated");
    Ok(profile)
}

async fn next_packet(events: &mut EventStream) -> Result<(RawPacket, PacketClass, ProtocolState)> {
    match events.recv().await {
        Some(ConnectionEvent::Packet {
            packet,
            class,
            state,
        }) => Ok((packet, class, state)),
        Some(ConnectionEvent::Closed(reason)) => {
            debug!(%reason, "Client connection closed");
            Err(ProxyError::ConnectionClosed)
        }
        None => Err(ProxyError::PipelineClosed),
    }
}

async fn expect(events: &mut EventStream, kind: PacketKind) -> Result<RawPacket> {
    let (packet, class, _) = next_packet(events).await?;
    if class.kind() == Some(kind) {
        Ok(packet)
    } else {
        Err(ProtocolError::InvalidPacketId(packet.id).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use slider_mc::PacketCodec;
    use slider_mc::packets::{
        FinishConfiguration, LoginAcknowledged, LoginDisconnect, PhasedPacket, StatusRequest,
    };
    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;

    use crate::config::SessionConfig;
    use crate::directory::BackendTarget;
    use crate::forwarding::Forwarding;

    fn config(max_players: u32, compression_threshold: i32) -> ProxyConfig {
        ProxyConfig {
            bind: "127.0.0.1:0".to_string(),
            servers: Vec::new(),
            default_server: "lobby".to_string(),
            fallback_servers: Vec::new(),
            online_mode: false,
            compression_threshold,
            max_players,
            motd: "Test proxy".to_string(),
            forwarding: Forwarding::None,
            api_bind: None,
            network: NetworkConfig::default(),
            session: SessionConfig {
                login_timeout: Duration::from_secs(5),
                ..SessionConfig::default()
            },
        }
    }

    struct Setup {
        proxy: Arc<Proxy>,
        directory: Arc<BackendDirectory>,
        registry: Arc<SessionRegistry>,
    }

    fn setup(max_players: u32, compression_threshold: i32) -> Setup {
        let directory = Arc::new(BackendDirectory::new(NetworkConfig::default()));
        let registry = Arc::new(SessionRegistry::new());
        let proxy = Arc::new(Proxy::new(
            &config(max_players, compression_threshold),
            Arc::clone(&directory),
            Arc::clone(&registry),
            Authenticator::Offline,
        ));
        Setup {
            proxy,
            directory,
            registry,
        }
    }

    fn connect(proxy: &Arc<Proxy>) -> Framed<DuplexStream, PacketCodec> {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let proxy = Arc::clone(proxy);
        tokio::spawn(async move {
            proxy
                .handle_connection(ours, SocketAddr::from(([127, 0, 0, 1], 40000)))
                .await;
        });
        Framed::new(theirs, PacketCodec::default())
    }

    fn handshake(protocol_version: i32, next_state: NextState) -> RawPacket {
        Handshake {
            protocol_version,
            server_address: "play.example.com".to_string(),
            server_port: 25565,
            next_state,
        }
        .to_raw()
    }

    async fn next<S>(peer: &mut Framed<S, PacketCodec>) -> RawPacket
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tokio::time::timeout(Duration::from_secs(5), peer.next())
            .await
            .expect("peer timed out")
            .expect("peer closed")
            .unwrap()
    }

    async fn refusal(client: &mut Framed<DuplexStream, PacketCodec>) -> String {
        let packet = next(client).await;
        assert_eq!(packet.id, 0x00);
        LoginDisconnect::from_raw(&packet).unwrap().reason
    }

    #[tokio::test]
    async fn test_status_and_ping() {
        let s = setup(20, -1);
        let mut client = connect(&s.proxy);

        client
            .send(handshake(ProtocolVersion::LATEST.as_raw(), NextState::Status))
            .await
            .unwrap();
        client.send(StatusRequest.to_raw()).await.unwrap();

        let response = StatusResponse::from_raw(&next(&mut client).await).unwrap();
        let status: serde_json::Value = serde_json::from_str(&response.json).unwrap();
        assert_eq!(status["version"]["protocol"], 772);
        assert_eq!(status["players"]["max"], 20);
        assert_eq!(status["players"]["online"], 0);
        assert_eq!(status["description"]["text"], "Test proxy");

        client.send(Ping::new(42).to_raw()).await.unwrap();
        let pong = Pong::from_raw(&next(&mut client).await).unwrap();
        assert_eq!(pong.payload, 42);
        assert!(client.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unsupported_version_is_refused() {
        let s = setup(20, -1);
        let mut client = connect(&s.proxy);

        client.send(handshake(47, NextState::Login)).await.unwrap();
        assert!(refusal(&mut client).await.contains("Outdated client"));
    }

    #[tokio::test]
    async fn test_full_server_is_refused() {
        let s = setup(0, -1);
        let mut client = connect(&s.proxy);

        client
            .send(handshake(ProtocolVersion::LATEST.as_raw(), NextState::Login))
            .await
            .unwrap();
        client
            .send(LoginStart::new("Steve", auth::offline_uuid("Steve")).to_raw())
            .await
            .unwrap();
        assert!(refusal(&mut client).await.contains("full"));
    }

    #[tokio::test]
    async fn test_no_backend_is_refused() {
        let s = setup(20, -1);
        s.directory.register(BackendTarget::new("lobby", "127.0.0.1:1"));
        let mut client = connect(&s.proxy);

        client
            .send(handshake(ProtocolVersion::LATEST.as_raw(), NextState::Login))
            .await
            .unwrap();
        client
            .send(LoginStart::new("Steve", auth::offline_uuid("Steve")).to_raw())
            .await
            .unwrap();
        assert!(refusal(&mut client).await.contains("No server"));
        assert!(s.registry.is_empty());
    }

    #[tokio::test]
    async fn test_offline_login_with_compression_reaches_backend() {
        let s = setup(20, 64);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        s.directory.register(BackendTarget::new("lobby", addr));

        let backend = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut peer = Framed::new(stream, PacketCodec::default());
            let handshake = Handshake::from_raw(&next(&mut peer).await).unwrap();
            assert_eq!(handshake.next_state, NextState::Login);
            let start = LoginStart::from_raw(&next(&mut peer).await).unwrap();
            peer.send(LoginSuccess::new(start.uuid, start.name.clone()).to_raw())
                .await
                .unwrap();
            assert_eq!(next(&mut peer).await.id, 0x03);
            peer.send(
                FinishConfiguration
                    .to_raw(Phase::Configuration, ProtocolVersion::LATEST)
                    .unwrap(),
            )
            .await
            .unwrap();
            (start, peer)
        });

        let mut client = connect(&s.proxy);
        client
            .send(handshake(ProtocolVersion::LATEST.as_raw(), NextState::Login))
            .await
            .unwrap();
        client
            .send(LoginStart::new("Steve", auth::offline_uuid("Steve")).to_raw())
            .await
            .unwrap();

        let compression = SetCompression::from_raw(&next(&mut client).await).unwrap();
        assert_eq!(compression.threshold, 64);
        client.codec_mut().set_compression(64);

        let success = LoginSuccess::from_raw(&next(&mut client).await).unwrap();
        assert_eq!(success.username, "Steve");
        assert_eq!(success.uuid, auth::offline_uuid("Steve"));
        client.send(LoginAcknowledged.to_raw()).await.unwrap();

        // Backend configuration flows once the client has acknowledged
        assert_eq!(next(&mut client).await.id, 0x03);

        let (start, _peer) = backend.await.unwrap();
        assert_eq!(start.name, "Steve");

        let handle = s.registry.find_by_name("steve").unwrap();
        assert_eq!(handle.current_server(), "lobby");
        assert_eq!(handle.player().virtual_host, "play.example.com");

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !s.registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
