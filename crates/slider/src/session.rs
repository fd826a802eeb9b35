//! Player sessions: one client, its backend, and live backend switching.
//!
//! A session task owns the client connection and the active backend
//! connection and relays packets between them in arrival order. Switching
//! backends walks an explicit state machine:
//!
//! ```text
//! Idle -> AwaitingNewBackend -> AwaitingHandshakeAck -> Active -> Idle
//! ```
//!
//! The client is sent back to the configuration phase, a new backend is
//! logged in next to the old one, and once both the client has acknowledged
//! and the new backend is ready the two are swapped and the old backend is
//! closed. Client packets meant for the new backend are held until the swap.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, trace, warn};
use uuid::Uuid;

use slider_mc::packets::{
    ChatCommand, ClientInformation, PhasedPacket, PluginMessage, Property, StartConfiguration,
    SystemChat,
};
use slider_mc::{PacketClass, PacketKind, Phase, ProtocolVersion, RawPacket};

use crate::backend;
use crate::chat;
use crate::config::SessionConfig;
use crate::connection::{Connection, TrafficClass};
use crate::directory::BackendDirectory;
use crate::error::{BackendError, ProxyError, Result};
use crate::forwarding::{ForwardedPlayer, Forwarding};
use crate::pipeline::{CloseReason, ConnectionEvent, EventStream};

/// Commands a session accepts from outside.
const COMMAND_QUEUE_CAPACITY: usize = 16;

/// A logged-in player.
#[derive(Debug, Clone)]
pub struct Player {
    /// Player UUID.
    pub uuid: Uuid,
    /// Player name.
    pub name: String,
    /// Profile properties such as skin textures.
    pub properties: Vec<Property>,
    /// Address the client connected from.
    pub addr: SocketAddr,
    /// Host the client typed in, without Forge markers.
    pub virtual_host: String,
    /// Port the client typed in.
    pub virtual_port: u16,
    /// Protocol version of the client.
    pub version: ProtocolVersion,
}

impl Player {
    /// Identity as forwarded to backends.
    #[must_use]
    pub fn forwarded(&self) -> ForwardedPlayer<'_> {
        ForwardedPlayer {
            addr: self.addr.ip(),
            uuid: self.uuid,
            name: &self.name,
            properties: &self.properties,
        }
    }

    #[cfg(test)]
    pub(crate) fn offline_for_test(name: &str) -> Self {
        Self {
            uuid: crate::auth::offline_uuid(name),
            name: name.to_string(),
            properties: Vec::new(),
            addr: SocketAddr::from(([127, 0, 0, 1], 50000)),
            virtual_host: "localhost".to_string(),
            virtual_port: 25565,
            version: ProtocolVersion::LATEST,
        }
    }
}

/// Everything sessions share.
#[derive(Debug)]
pub struct SessionContext {
    /// Backends players can be sent to.
    pub directory: Arc<BackendDirectory>,
    /// How identity reaches backends.
    pub forwarding: Forwarding,
    /// Timeouts and limits.
    pub settings: SessionConfig,
}

/// A backend connection together with its events.
#[derive(Debug)]
pub struct BackendLink {
    name: String,
    conn: Connection,
    events: EventStream,
}

impl BackendLink {
    /// Wrap a backend connection that has finished logging in.
    #[must_use]
    pub fn new(name: impl Into<String>, conn: Connection, events: EventStream) -> Self {
        Self {
            name: name.into(),
            conn,
            events,
        }
    }
}

type Reply = oneshot::Sender<Result<()>>;
type LoginResult = std::result::Result<(Connection, EventStream), BackendError>;

enum SessionCommand {
    Switch { server: String, reply: Reply },
    Kick { reason: String },
}

/// Handle used by the operator surface to control a session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    player: Arc<Player>,
    commands: mpsc::Sender<SessionCommand>,
    current_server: Arc<RwLock<String>>,
}

impl std::fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Switch { server, .. } => f.debug_struct("Switch").field("server", server).finish(),
            Self::Kick { reason } => f.debug_struct("Kick").field("reason", reason).finish(),
        }
    }
}

impl SessionHandle {
    /// The player this session belongs to.
    #[must_use]
    pub fn player(&self) -> &Player {
        &self.player
    }

    /// Name of the backend the player is on.
    #[must_use]
    pub fn current_server(&self) -> String {
        self.current_server.read().clone()
    }

    /// Move the player to another backend, waiting until the swap is done.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SwitchRejected`] if the switch cannot start, the
    /// error that aborted it otherwise, or [`ProxyError::ConnectionClosed`]
    /// if the session ended first.
    pub async fn switch_backend(&self, server: &str) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SessionCommand::Switch {
                server: server.to_string(),
                reply,
            })
            .await
            .map_err(|_| ProxyError::ConnectionClosed)?;
        response.await.map_err(|_| ProxyError::ConnectionClosed)?
    }

    /// Disconnect the player. Returns `false` if the session is gone or busy.
    pub fn kick(&self, reason: impl Into<String>) -> bool {
        self.commands
            .try_send(SessionCommand::Kick {
                reason: reason.into(),
            })
            .is_ok()
    }
}

/// Online players, by UUID.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Returns `false` if the UUID is already online.
    pub fn insert(&self, handle: SessionHandle) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&handle.player.uuid) {
            return false;
        }
        sessions.insert(handle.player.uuid, handle);
        true
    }

    /// Whether a player with this UUID is online.
    #[must_use]
    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.sessions.read().contains_key(uuid)
    }

    /// Remove a session.
    pub fn remove(&self, uuid: &Uuid) -> Option<SessionHandle> {
        self.sessions.write().remove(uuid)
    }

    /// Find a session by player name, ignoring case.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .values()
            .find(|s| s.player.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// All sessions.
    #[must_use]
    pub fn list(&self) -> Vec<SessionHandle> {
        self.sessions.read().values().cloned().collect()
    }

    /// Number of online players.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether nobody is online.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

enum SwitchState {
    Idle,
    /// The client was told to reconfigure and the new backend is logging in.
    AwaitingNewBackend {
        target: String,
        deadline: Instant,
        client_acked: bool,
        queue: VecDeque<(RawPacket, PacketClass)>,
        task: Option<JoinHandle<LoginResult>>,
        reply: Option<Reply>,
    },
    /// The new backend is ready; the client has not acknowledged yet.
    AwaitingHandshakeAck {
        pending: BackendLink,
        deadline: Instant,
        queue: VecDeque<(RawPacket, PacketClass)>,
        reply: Option<Reply>,
    },
    /// Backends are swapped; the client is configuring against the new one.
    Active,
}

impl SwitchState {
    const fn deadline(&self) -> Option<Instant> {
        match self {
            Self::AwaitingNewBackend { deadline, .. } | Self::AwaitingHandshakeAck { deadline, .. } => {
                Some(*deadline)
            }
            Self::Idle | Self::Active => None,
        }
    }

    const fn is_switching(&self) -> bool {
        matches!(
            self,
            Self::AwaitingNewBackend { .. } | Self::AwaitingHandshakeAck { .. }
        )
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingNewBackend { .. } => "awaiting new backend",
            Self::AwaitingHandshakeAck { .. } => "awaiting handshake ack",
            Self::Active => "active",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// The proxy side of one player's connection.
pub struct Session {
    player: Arc<Player>,
    client: Connection,
    client_events: EventStream,
    /// Phase the client is in for packets the proxy sends it.
    client_phase: Phase,
    /// Phase of the client's own traffic.
    client_inbound: Phase,
    backend: Option<BackendLink>,
    client_information: Option<ClientInformation>,
    brand: Option<PluginMessage>,
    switch: SwitchState,
    ctx: Arc<SessionContext>,
    current_server: Arc<RwLock<String>>,
    commands: mpsc::Receiver<SessionCommand>,
}

impl Session {
    /// Create a session for a client that has just been sent its login
    /// success, with a backend that has just acknowledged its login.
    #[must_use]
    pub fn new(
        player: Player,
        client: Connection,
        client_events: EventStream,
        backend: BackendLink,
        ctx: Arc<SessionContext>,
    ) -> (Self, SessionHandle) {
        let player = Arc::new(player);
        let current_server = Arc::new(RwLock::new(backend.name.clone()));
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE_CAPACITY);

        let handle = SessionHandle {
            player: Arc::clone(&player),
            commands: commands_tx,
            current_server: Arc::clone(&current_server),
        };

        let session = Self {
            player,
            client,
            client_events,
            client_phase: Phase::Login,
            client_inbound: Phase::Login,
            backend: Some(backend),
            client_information: None,
            brand: None,
            switch: SwitchState::Idle,
            ctx,
            current_server,
            commands,
        };
        (session, handle)
    }

    /// Relay until the client or its backend goes away.
    pub async fn run(mut self) {
        info!(player = %self.player.name, server = %self.current_server.read(), "Session started");

        loop {
            let deadline = self.switch.deadline();
            // Backend configuration must wait until the client has left login
            let relay_backend = self.client_phase != Phase::Login;

            let flow = tokio::select! {
                event = self.client_events.recv() => self.on_client_event(event),
                event = next_backend_event(&mut self.backend), if relay_backend => {
                    self.on_backend_event(event)
                }
                result = pending_login(&mut self.switch) => self.on_backend_ready(result),
                () = sleep_until(deadline) => {
                    let switch = mem::replace(&mut self.switch, SwitchState::Idle);
                    let timeout = self.ctx.settings.switch_timeout;
                    self.abort_switch(switch, ProxyError::BackendSwitchTimeout(timeout))
                }
                Some(command) = self.commands.recv() => self.on_command(command),
            };

            if flow == Flow::Stop {
                break;
            }
        }

        self.shutdown();
        info!(player = %self.player.name, "Session ended");
    }

    fn on_client_event(&mut self, event: Option<ConnectionEvent>) -> Flow {
        match event {
            Some(ConnectionEvent::Packet {
                packet,
                class,
                state,
            }) => {
                self.client_inbound = state.phase();
                self.route_serverbound(packet, class)
            }
            Some(ConnectionEvent::Closed(reason)) => {
                info!(player = %self.player.name, %reason, "Player disconnected");
                Flow::Stop
            }
            None => Flow::Stop,
        }
    }

    fn on_backend_event(&mut self, event: Option<ConnectionEvent>) -> Flow {
        match event {
            Some(ConnectionEvent::Packet { packet, class, .. }) => {
                if self.switch.is_switching() {
                    trace!(id = packet.id, "Dropping packet from the backend being left");
                    return Flow::Continue;
                }
                self.route_clientbound(packet, class)
            }
            Some(ConnectionEvent::Closed(reason)) => self.on_backend_closed(&reason),
            None => self.on_backend_closed(&CloseReason::PeerClosed),
        }
    }

    fn on_backend_closed(&mut self, reason: &CloseReason) -> Flow {
        let name = self
            .backend
            .take()
            .map(|b| b.name)
            .unwrap_or_default();

        if self.switch.is_switching() {
            debug!(server = %name, %reason, "Previous backend closed during switch");
            return Flow::Continue;
        }

        info!(player = %self.player.name, server = %name, %reason, "Backend connection lost");
        self.kick(
            &format!("Lost connection to {name}"),
            CloseReason::Local(format!("backend {name} {reason}")),
        );
        Flow::Stop
    }

    fn route_serverbound(&mut self, packet: RawPacket, class: PacketClass) -> Flow {
        let kind = class.kind();

        match kind {
            Some(PacketKind::LoginAcknowledged) => {
                debug!(player = %self.player.name, "Client entered configuration");
                self.client_phase = Phase::Configuration;
                return Flow::Continue;
            }
            Some(PacketKind::ClientInformation) => match ClientInformation::from_raw(&packet) {
                Ok(info) => self.client_information = Some(info),
                Err(e) => debug!("Unreadable client information: {e}"),
            },
            Some(PacketKind::PluginMessage) => {
                if let Ok(message) = PluginMessage::from_raw(&packet)
                    && message.is_brand()
                {
                    self.brand = Some(message);
                }
            }
            Some(PacketKind::ChatCommand) => {
                if let Ok(ChatCommand { command }) = ChatCommand::from_raw(&packet)
                    && let Some(target) = parse_server_command(&command)
                {
                    self.server_command(target);
                    return Flow::Continue;
                }
            }
            _ => {}
        }

        if self.switch.is_switching() {
            return self.route_during_switch(packet, class);
        }

        let finishes_switch = matches!(self.switch, SwitchState::Active)
            && kind == Some(PacketKind::FinishConfiguration);
        self.forward_to_backend(packet, class);
        if finishes_switch {
            info!(player = %self.player.name, server = %self.current_server.read(), "Switch complete");
            self.switch = SwitchState::Idle;
        }
        Flow::Continue
    }

    fn route_during_switch(&mut self, packet: RawPacket, class: PacketClass) -> Flow {
        if class.kind() == Some(PacketKind::ConfigurationAcknowledged) {
            match mem::replace(&mut self.switch, SwitchState::Idle) {
                SwitchState::AwaitingNewBackend {
                    target,
                    deadline,
                    queue,
                    task,
                    reply,
                    ..
                } => {
                    debug!(player = %self.player.name, "Client acknowledged reconfiguration");
                    self.switch = SwitchState::AwaitingNewBackend {
                        target,
                        deadline,
                        client_acked: true,
                        queue,
                        task,
                        reply,
                    };
                }
                SwitchState::AwaitingHandshakeAck {
                    pending,
                    queue,
                    reply,
                    ..
                } => return self.complete_switch(pending, queue, reply),
                other => self.switch = other,
            }
            return Flow::Continue;
        }

        // Play traffic sent before the acknowledgement still belongs to the old backend
        if self.client_inbound == Phase::Play {
            self.forward_to_backend(packet, class);
            return Flow::Continue;
        }

        let capacity = self.ctx.settings.switch_queue_capacity;
        let overflow = match &mut self.switch {
            SwitchState::AwaitingNewBackend { queue, .. }
            | SwitchState::AwaitingHandshakeAck { queue, .. } => {
                if queue.len() >= capacity {
                    true
                } else {
                    queue.push_back((packet, class));
                    false
                }
            }
            SwitchState::Idle | SwitchState::Active => false,
        };

        if overflow {
            let switch = mem::replace(&mut self.switch, SwitchState::Idle);
            return self.abort_switch(switch, ProxyError::QueueOverflow("switch queue"));
        }
        Flow::Continue
    }

    fn route_clientbound(&mut self, packet: RawPacket, class: PacketClass) -> Flow {
        match class.kind() {
            Some(PacketKind::Disconnect) => {
                info!(player = %self.player.name, server = %self.current_server.read(), "Backend disconnected player");
                self.client.disconnect(
                    Some(packet),
                    CloseReason::Local("disconnected by backend".to_string()),
                );
                return Flow::Stop;
            }
            Some(PacketKind::StartConfiguration) => self.client_phase = Phase::Configuration,
            Some(PacketKind::FinishConfiguration) => self.client_phase = Phase::Play,
            _ => {}
        }

        if let Err(e) = self.client.send(packet, TrafficClass::of(class)) {
            debug!("Dropping packet for client: {e}");
        }
        Flow::Continue
    }

    fn forward_to_backend(&self, packet: RawPacket, class: PacketClass) {
        let Some(backend) = &self.backend else {
            trace!(id = packet.id, "No backend, dropping packet");
            return;
        };
        if let Err(e) = backend.conn.send(packet, TrafficClass::of(class)) {
            debug!(server = %backend.name, "Dropping packet for backend: {e}");
        }
    }

    fn on_command(&mut self, command: SessionCommand) -> Flow {
        match command {
            SessionCommand::Switch { server, reply } => {
                if let Err(e) = self.start_switch(&server, Some(reply)) {
                    debug!(server = %server, "Switch not started: {e}");
                }
                Flow::Continue
            }
            SessionCommand::Kick { reason } => {
                info!(player = %self.player.name, %reason, "Kicking player");
                self.kick(&reason, CloseReason::Local(format!("kicked: {reason}")));
                Flow::Stop
            }
        }
    }

    /// `/server` lists backends, `/server <name>` switches to one.
    fn server_command(&mut self, target: Option<&str>) {
        let Some(target) = target else {
            let mut message = format!("You are connected to {}.", self.current_server.read());
            let servers: Vec<_> = self
                .ctx
                .directory
                .list()
                .into_iter()
                .filter(|s| s.enabled)
                .map(|s| s.name)
                .collect();
            let _ = write!(message, " Available servers: {}", servers.join(", "));
            self.tell(&message);
            return;
        };

        let target = target.to_string();
        if let Err(e) = self.start_switch(&target, None) {
            self.tell(&e.disconnect_message());
        }
    }

    fn tell(&self, message: &str) {
        if let Ok(packet) = SystemChat::message(message).to_raw(self.client_phase, self.player.version) {
            let _ = self.client.send(packet, TrafficClass::Critical);
        }
    }

    /// Start moving the player to `target`.
    ///
    /// Failures before anything was sent to the client leave the session
    /// untouched and are reported to `reply` as well.
    fn start_switch(&mut self, target: &str, reply: Option<Reply>) -> Result<()> {
        let rejected = ProxyError::SwitchRejected;

        let check = if self.switch.is_switching() || matches!(self.switch, SwitchState::Active) {
            Err(rejected("A server switch is already in progress".to_string()))
        } else if self.client_phase != Phase::Play || self.client_inbound != Phase::Play {
            Err(rejected("Player is not in game".to_string()))
        } else if self.backend.as_ref().is_some_and(|b| b.name == target) {
            Err(rejected(format!("Already connected to {target}")))
        } else {
            self.ctx
                .directory
                .resolve(target)
                .map_err(|e| rejected(e.to_string()))
                .and_then(|_| {
                    StartConfiguration
                        .to_raw(Phase::Play, self.player.version)
                        .map_err(ProxyError::from)
                })
                .and_then(|start| self.client.send(start, TrafficClass::Critical))
        };

        if let Err(e) = check {
            if let Some(reply) = reply {
                let _ = reply.send(Err(ProxyError::SwitchRejected(e.disconnect_message())));
            }
            return Err(e);
        }

        info!(player = %self.player.name, from = %self.current_server.read(), to = target, "Switching server");
        self.client_phase = Phase::Configuration;

        let ctx = Arc::clone(&self.ctx);
        let player = Arc::clone(&self.player);
        let server = target.to_string();
        let task = tokio::spawn(
            async move {
                backend::connect_and_login(
                    &ctx.directory,
                    &server,
                    &player,
                    &ctx.forwarding,
                    &ctx.settings,
                )
                .await
            }
            .in_current_span(),
        );

        self.switch = SwitchState::AwaitingNewBackend {
            target: target.to_string(),
            deadline: Instant::now() + self.ctx.settings.switch_timeout,
            client_acked: false,
            queue: VecDeque::new(),
            task: Some(task),
            reply,
        };
        Ok(())
    }

    fn on_backend_ready(&mut self, result: LoginResult) -> Flow {
        let switch = mem::replace(&mut self.switch, SwitchState::Idle);
        let SwitchState::AwaitingNewBackend {
            target,
            deadline,
            client_acked,
            queue,
            reply,
            ..
        } = switch
        else {
            self.switch = switch;
            return Flow::Continue;
        };

        match result {
            Ok((conn, events)) => {
                let pending = BackendLink::new(target, conn, events);
                if client_acked {
                    self.complete_switch(pending, queue, reply)
                } else {
                    debug!(server = %pending.name, "New backend ready, waiting for client");
                    self.switch = SwitchState::AwaitingHandshakeAck {
                        pending,
                        deadline,
                        queue,
                        reply,
                    };
                    Flow::Continue
                }
            }
            Err(e) => {
                let failed = SwitchState::AwaitingNewBackend {
                    target,
                    deadline,
                    client_acked,
                    queue,
                    task: None,
                    reply,
                };
                self.abort_switch(failed, ProxyError::BackendUnavailable(e))
            }
        }
    }

    /// Replay client state, flush held packets and swap backends.
    fn complete_switch(
        &mut self,
        pending: BackendLink,
        queue: VecDeque<(RawPacket, PacketClass)>,
        reply: Option<Reply>,
    ) -> Flow {
        let version = self.player.version;
        let mut replay = Vec::new();
        if let Some(info) = &self.client_information {
            replay.extend(info.to_raw(Phase::Configuration, version).ok());
        }
        if let Some(brand) = &self.brand {
            replay.extend(brand.to_raw(Phase::Configuration, version).ok());
        }

        let held = queue.len();
        let packets = replay
            .into_iter()
            .map(|packet| (packet, TrafficClass::Critical))
            .chain(queue.into_iter().map(|(packet, class)| (packet, TrafficClass::of(class))));
        for (packet, class) in packets {
            if let Err(e) = pending.conn.send(packet, class) {
                debug!(server = %pending.name, "Failed to hand packet to new backend: {e}");
            }
        }

        let name = pending.name.clone();
        if let Some(old) = self.backend.replace(pending) {
            old.conn.close(CloseReason::Local(format!("player moved to {name}")));
        }
        *self.current_server.write() = name.clone();
        self.switch = SwitchState::Active;

        info!(player = %self.player.name, server = %name, held, "Swapped backend");
        if let Some(reply) = reply {
            let _ = reply.send(Ok(()));
        }
        Flow::Continue
    }

    /// Give up on a switch: the player is disconnected and every backend
    /// connection of the session is closed.
    fn abort_switch(&mut self, switch: SwitchState, err: ProxyError) -> Flow {
        warn!(player = %self.player.name, state = switch.name(), "Server switch failed: {err}");

        let reply = match switch {
            SwitchState::AwaitingNewBackend { task, reply, .. } => {
                if let Some(task) = task {
                    abandon_login(task);
                }
                reply
            }
            SwitchState::AwaitingHandshakeAck { pending, reply, .. } => {
                pending.conn.close(CloseReason::Local("switch aborted".to_string()));
                reply
            }
            SwitchState::Idle | SwitchState::Active => None,
        };

        if let Some(old) = self.backend.take() {
            old.conn.close(CloseReason::Local("switch aborted".to_string()));
        }

        let message = err.disconnect_message();
        if let Some(reply) = reply {
            let _ = reply.send(Err(ProxyError::SwitchRejected(message.clone())));
        }
        self.kick(&message, CloseReason::from(err));
        Flow::Stop
    }

    fn kick(&self, reason: &str, close: CloseReason) {
        let farewell = chat::disconnect_packet(self.client_phase, self.player.version, reason);
        self.client.disconnect(farewell, close);
    }

    fn shutdown(&mut self) {
        match mem::replace(&mut self.switch, SwitchState::Idle) {
            SwitchState::AwaitingNewBackend {
                task: Some(task), ..
            } => abandon_login(task),
            SwitchState::AwaitingHandshakeAck { pending, .. } => {
                pending.conn.close(CloseReason::Local("session ended".to_string()));
            }
            _ => {}
        }
        if let Some(backend) = self.backend.take() {
            backend.conn.close(CloseReason::Local("session ended".to_string()));
        }
        self.client.close(CloseReason::Local("session ended".to_string()));
    }
}

/// Stop a backend login task, closing its connection if it already finished.
fn abandon_login(mut task: JoinHandle<LoginResult>) {
    task.abort();
    if let Some(Ok(Ok((conn, _)))) = (&mut task).now_or_never() {
        conn.close(CloseReason::Local("switch abandoned".to_string()));
    }
}

async fn next_backend_event(backend: &mut Option<BackendLink>) -> Option<ConnectionEvent> {
    match backend {
        Some(backend) => backend.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn pending_login(switch: &mut SwitchState) -> LoginResult {
    match switch {
        SwitchState::AwaitingNewBackend {
            target,
            task: Some(task),
            ..
        } => match task.await {
            Ok(result) => result,
            Err(e) => {
                debug!(server = %target, "Backend login task failed: {e}");
                Err(BackendError::Closed {
                    server: target.clone(),
                })
            }
        },
        _ => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// `Some(None)` for a bare `server`, `Some(Some(name))` with an argument.
fn parse_server_command(command: &str) -> Option<Option<&str>> {
    let mut parts = command.split_whitespace();
    (parts.next()? == "server").then(|| parts.next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use slider_mc::packets::{
        AcknowledgeFinishConfiguration, ConfigurationAcknowledged, Disconnect,
        FinishConfiguration, Handshake, LoginStart, LoginSuccess, NextState, Packet,
    };
    use slider_mc::PacketCodec;
    use tokio::io::DuplexStream;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::Framed;

    use crate::config::NetworkConfig;
    use crate::connection::Side;
    use crate::directory::BackendTarget;

    const V: ProtocolVersion = ProtocolVersion::LATEST;

    type Peer = Framed<DuplexStream, PacketCodec>;

    struct Harness {
        handle: SessionHandle,
        client: Peer,
        backend: Peer,
        directory: Arc<BackendDirectory>,
        task: JoinHandle<()>,
    }

    async fn next<S>(peer: &mut Framed<S, PacketCodec>) -> RawPacket
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        tokio::time::timeout(Duration::from_secs(5), peer.next())
            .await
            .expect("peer timed out")
            .expect("peer closed")
            .unwrap()
    }

    async fn until_eof(peer: &mut Peer) {
        while let Ok(Some(Ok(_))) = tokio::time::timeout(Duration::from_secs(5), peer.next()).await {}
    }

    /// A player in game on the backend called "old".
    async fn harness(settings: SessionConfig) -> Harness {
        let network = NetworkConfig::default();
        let player = Player::offline_for_test("Steve");

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (client, mut client_events) = Connection::open(ours, Side::Client, &network);
        let mut client_peer = Framed::new(theirs, PacketCodec::default());
        let handshake = Handshake {
            protocol_version: V.as_raw(),
            server_address: "localhost".to_string(),
            server_port: 25565,
            next_state: NextState::Login,
        };
        client_peer.send(handshake.to_raw()).await.unwrap();
        client_peer.send(LoginStart::new("Steve", player.uuid).to_raw()).await.unwrap();
        client_events.recv().await.unwrap();
        client_events.recv().await.unwrap();
        client.resume().unwrap();

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (backend, mut backend_events) = Connection::open(ours, Side::Backend, &network);
        let mut backend_peer = Framed::new(theirs, PacketCodec::default());
        backend_peer.send(LoginSuccess::new(player.uuid, "Steve").to_raw()).await.unwrap();
        backend_events.recv().await.unwrap();

        let directory = Arc::new(BackendDirectory::new(network));
        directory.register(BackendTarget::new("old", "127.0.0.1:1"));
        let ctx = Arc::new(SessionContext {
            directory: Arc::clone(&directory),
            forwarding: Forwarding::None,
            settings,
        });

        let link = BackendLink::new("old", backend, backend_events);
        let (session, handle) = Session::new(player, client, client_events, link, ctx);
        let task = tokio::spawn(session.run());

        // Finish the initial configuration through the proxy
        client_peer.send(RawPacket::empty(0x03)).await.unwrap();
        let info = ClientInformation::default().to_raw(Phase::Configuration, V).unwrap();
        client_peer.send(info).await.unwrap();
        assert_eq!(next(&mut backend_peer).await.id, 0x00);

        backend_peer
            .send(FinishConfiguration.to_raw(Phase::Configuration, V).unwrap())
            .await
            .unwrap();
        assert_eq!(next(&mut client_peer).await.id, 0x03);
        client_peer
            .send(AcknowledgeFinishConfiguration.to_raw(Phase::Configuration, V).unwrap())
            .await
            .unwrap();
        assert_eq!(next(&mut backend_peer).await.id, 0x03);

        Harness {
            handle,
            client: client_peer,
            backend: backend_peer,
            directory,
            task,
        }
    }

    async fn register_backend(directory: &BackendDirectory, name: &str) -> TcpListener {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        directory.register(BackendTarget::new(name, addr));
        listener
    }

    /// Accept a connection and play the backend side of the login.
    async fn accept_login(listener: &TcpListener) -> Framed<TcpStream, PacketCodec> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut peer = Framed::new(stream, PacketCodec::default());
        let handshake = Handshake::from_raw(&next(&mut peer).await).unwrap();
        assert_eq!(handshake.next_state, NextState::Login);
        let start = LoginStart::from_raw(&next(&mut peer).await).unwrap();
        peer.send(LoginSuccess::new(start.uuid, start.name).to_raw())
            .await
            .unwrap();
        assert_eq!(next(&mut peer).await.id, 0x03);
        peer
    }

    fn plugin(channel: &str) -> RawPacket {
        PluginMessage::new(channel, Bytes::from_static(b"data"))
            .to_raw(Phase::Configuration, V)
            .unwrap()
    }

    #[tokio::test]
    async fn test_steady_state_relay() {
        let mut h = harness(SessionConfig::default()).await;

        // Opaque play packets both ways, unchanged
        let chunk = RawPacket::new(0x27, bytes::BytesMut::from(&b"chunk"[..]));
        h.backend.send(chunk.clone()).await.unwrap();
        assert_eq!(next(&mut h.client).await, chunk);

        let movement = RawPacket::new(0x1D, bytes::BytesMut::from(&b"move"[..]));
        h.client.send(movement.clone()).await.unwrap();
        assert_eq!(next(&mut h.backend).await, movement);

        assert_eq!(h.handle.current_server(), "old");
        assert_eq!(h.handle.player().name, "Steve");
    }

    #[tokio::test]
    async fn test_backend_disconnect_is_relayed() {
        let mut h = harness(SessionConfig::default()).await;

        let kick = Disconnect::new("Server closed").to_raw(Phase::Play, V).unwrap();
        h.backend.send(kick.clone()).await.unwrap();

        assert_eq!(next(&mut h.client).await, kick);
        until_eof(&mut h.client).await;
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_backend_loss_kicks_client() {
        let mut h = harness(SessionConfig::default()).await;
        drop(h.backend);

        let farewell = next(&mut h.client).await;
        let reason = Disconnect::from_raw(&farewell).unwrap().reason;
        assert!(reason.contains("Lost connection to old"));
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_switch_delivers_held_packets_in_order() {
        let mut h = harness(SessionConfig::default()).await;
        let listener = register_backend(&h.directory, "new").await;

        let new_backend = tokio::spawn(async move {
            let mut peer = accept_login(&listener).await;
            let mut received = Vec::new();
            for _ in 0..4 {
                received.push(next(&mut peer).await);
            }
            peer.send(FinishConfiguration.to_raw(Phase::Configuration, V).unwrap())
                .await
                .unwrap();
            let ack = next(&mut peer).await;
            (received, ack, peer)
        });

        let handle = h.handle.clone();
        let switch = tokio::spawn(async move { handle.switch_backend("new").await });

        let start = next(&mut h.client).await;
        assert_eq!(start, StartConfiguration.to_raw(Phase::Play, V).unwrap());
        h.client
            .send(ConfigurationAcknowledged.to_raw(Phase::Play, V).unwrap())
            .await
            .unwrap();
        for channel in ["test:one", "test:two", "test:three"] {
            h.client.send(plugin(channel)).await.unwrap();
        }

        switch.await.unwrap().unwrap();
        assert_eq!(h.handle.current_server(), "new");

        // The new backend's configuration reaches the client
        assert_eq!(next(&mut h.client).await.id, 0x03);
        h.client
            .send(AcknowledgeFinishConfiguration.to_raw(Phase::Configuration, V).unwrap())
            .await
            .unwrap();

        let (received, ack, _peer) = new_backend.await.unwrap();
        assert_eq!(received[0].id, 0x00, "client information is replayed first");
        let channels: Vec<_> = received[1..]
            .iter()
            .map(|p| PluginMessage::from_raw(p).unwrap().channel)
            .collect();
        assert_eq!(channels, vec!["test:one", "test:two", "test:three"]);
        assert_eq!(ack.id, 0x03);

        // The old backend was closed
        until_eof(&mut h.backend).await;
    }

    #[tokio::test]
    async fn test_switch_timeout_disconnects_client() {
        let settings = SessionConfig {
            switch_timeout: Duration::from_millis(200),
            ..SessionConfig::default()
        };
        let mut h = harness(settings).await;
        let listener = register_backend(&h.directory, "stuck").await;

        // Accept and never answer
        let stuck = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut peer = Framed::new(stream, PacketCodec::default());
            while let Some(Ok(_)) = peer.next().await {}
        });

        let err = h.handle.switch_backend("stuck").await.unwrap_err();
        assert!(matches!(err, ProxyError::SwitchRejected(ref reason) if reason.contains("Timed out")));

        assert_eq!(next(&mut h.client).await.id, 0x6F);
        let farewell = next(&mut h.client).await;
        let reason = Disconnect::from_raw(&farewell).unwrap().reason;
        assert!(reason.contains("Timed out"));
        until_eof(&mut h.client).await;

        until_eof(&mut h.backend).await;
        h.task.await.unwrap();

        // The abandoned backend connection is closed too
        tokio::time::timeout(Duration::from_secs(5), stuck).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_switch_queue_overflow_disconnects_client() {
        let settings = SessionConfig {
            switch_queue_capacity: 2,
            ..SessionConfig::default()
        };
        let mut h = harness(settings).await;
        let listener = register_backend(&h.directory, "slow").await;

        // Accept and never answer, so every packet after the ack is held
        let slow = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut peer = Framed::new(stream, PacketCodec::default());
            while let Some(Ok(_)) = peer.next().await {}
        });

        let handle = h.handle.clone();
        let switch = tokio::spawn(async move { handle.switch_backend("slow").await });

        assert_eq!(next(&mut h.client).await.id, 0x6F);
        h.client
            .send(ConfigurationAcknowledged.to_raw(Phase::Play, V).unwrap())
            .await
            .unwrap();
        for channel in ["test:one", "test:two", "test:three"] {
            h.client.send(plugin(channel)).await.unwrap();
        }

        let err = switch.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::SwitchRejected(ref r) if r.contains("overloaded")));

        let farewell = next(&mut h.client).await;
        let reason = Disconnect::from_raw(&farewell).unwrap().reason;
        assert_eq!(reason, "Disconnected: connection overloaded");
        until_eof(&mut h.client).await;

        until_eof(&mut h.backend).await;
        h.task.await.unwrap();
        assert_eq!(h.handle.current_server(), "old");

        tokio::time::timeout(Duration::from_secs(5), slow).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_switch_to_refusing_backend_disconnects_client() {
        let mut h = harness(SessionConfig::default()).await;

        // Nothing listens on this port once the listener is gone
        let listener = register_backend(&h.directory, "down").await;
        drop(listener);

        let err = h.handle.switch_backend("down").await.unwrap_err();
        assert!(
            matches!(err, ProxyError::SwitchRejected(ref r) if r == "No server is available to join")
        );

        assert_eq!(next(&mut h.client).await.id, 0x6F);
        let farewell = next(&mut h.client).await;
        let reason = Disconnect::from_raw(&farewell).unwrap().reason;
        assert_eq!(reason, "No server is available to join");
        until_eof(&mut h.client).await;

        until_eof(&mut h.backend).await;
        h.task.await.unwrap();

        let health = h
            .directory
            .list()
            .into_iter()
            .find(|s| s.name == "down")
            .unwrap()
            .health;
        assert!(!health.available);
    }

    #[tokio::test]
    async fn test_switch_rejections() {
        let h = harness(SessionConfig::default()).await;

        let err = h.handle.switch_backend("old").await.unwrap_err();
        assert!(matches!(err, ProxyError::SwitchRejected(ref r) if r.contains("Already connected")));

        let err = h.handle.switch_backend("missing").await.unwrap_err();
        assert!(matches!(err, ProxyError::SwitchRejected(ref r) if r.contains("Unknown server")));

        assert_eq!(h.handle.current_server(), "old");
    }

    #[tokio::test]
    async fn test_server_command_lists_servers() {
        let mut h = harness(SessionConfig::default()).await;

        let command = ChatCommand {
            command: "server".to_string(),
        };
        h.client.send(command.to_raw(Phase::Play, V).unwrap()).await.unwrap();

        let reply = SystemChat::from_raw(&next(&mut h.client).await).unwrap();
        assert!(reply.content.contains("You are connected to old"));
    }

    #[tokio::test]
    async fn test_kick() {
        let mut h = harness(SessionConfig::default()).await;
        assert!(h.handle.kick("Maintenance"));

        let farewell = next(&mut h.client).await;
        assert_eq!(Disconnect::from_raw(&farewell).unwrap().reason, "Maintenance");
        until_eof(&mut h.backend).await;
        h.task.await.unwrap();
    }

    #[test]
    fn test_parse_server_command() {
        assert_eq!(parse_server_command("server"), Some(None));
        assert_eq!(parse_server_command("server lobby"), Some(Some("lobby")));
        assert_eq!(parse_server_command("serverx"), None);
        assert_eq!(parse_server_command("tp 0 0 0"), None);
    }

    #[test]
    fn test_registry() {
        let registry = SessionRegistry::new();
        let player = Arc::new(Player::offline_for_test("Alex"));
        let (commands, _rx) = mpsc::channel(1);
        let handle = SessionHandle {
            player,
            commands,
            current_server: Arc::new(RwLock::new("lobby".to_string())),
        };

        assert!(registry.insert(handle.clone()));
        assert!(!registry.insert(handle.clone()));
        assert_eq!(registry.len(), 1);
        assert!(registry.find_by_name("alex").is_some());
        assert!(registry.remove(&handle.player().uuid).is_some());
        assert!(registry.is_empty());
    }
}
