//! One framed Minecraft connection, client or backend.
//!
//! A connection owns two tasks. The reader pulls frames off the socket,
//! validates them against the inbound protocol state, applies the state
//! transitions they trigger and publishes them to the connection's
//! [`EventStream`]. The writer drains the send queue into the socket. Codec
//! changes reach each task through its own queue, so they take effect at the
//! exact byte offset they belong to.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{Notify, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, trace, warn};

use slider_mc::cipher::SHARED_SECRET_LEN;
use slider_mc::packets::{Packet, SetCompression};
use slider_mc::state::{self, inbound_event, is_barrier};
use slider_mc::{
    Direction, PacketClass, PacketCodec, PacketKind, Phase, ProtocolState, ProtocolVersion,
    RawPacket,
};

use crate::chat;
use crate::config::NetworkConfig;
use crate::error::{ProxyError, Result};
use crate::pipeline::{self, CloseReason, ConnectionEvent, EventStream, Publisher};

/// Time allowed for the farewell packet and socket shutdown.
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(1);

/// Which peer a connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// A player's client. Inbound traffic is serverbound.
    Client,
    /// A backend server. Inbound traffic is clientbound.
    Backend,
}

impl Side {
    /// Direction of inbound packets.
    #[must_use]
    pub const fn inbound(self) -> Direction {
        match self {
            Self::Client => Direction::Serverbound,
            Self::Backend => Direction::Clientbound,
        }
    }

    /// Inbound state when the connection opens.
    ///
    /// The proxy writes the handshake to backends itself, so their first
    /// inbound packet is already a login packet.
    #[must_use]
    pub const fn initial_state(self) -> ProtocolState {
        match self {
            Self::Client => ProtocolState::new(),
            Self::Backend => ProtocolState::at(Phase::Login, ProtocolVersion::LATEST),
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Backend => "backend",
        }
    }
}

/// Priority class of an outbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficClass {
    /// Packets the proxy understands: login, keep-alive, configuration.
    Critical,
    /// Opaque relayed traffic.
    Bulk,
}

impl TrafficClass {
    /// The class a relayed packet travels in.
    #[must_use]
    pub const fn of(class: PacketClass) -> Self {
        match class {
            PacketClass::Known(_) => Self::Critical,
            PacketClass::Opaque => Self::Bulk,
        }
    }
}

/// What `send` does when the send queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest queued packet of the same class.
    DropOldest,
    /// Close the connection with [`ProxyError::QueueOverflow`].
    Close,
}

/// Messages for the reader task.
#[derive(Debug)]
enum ReadControl {
    Resume,
    SetCompression(i32),
    EnableEncryption([u8; SHARED_SECRET_LEN]),
}

/// Entries of the send queue.
#[derive(Debug)]
enum WriteItem {
    Packet {
        packet: RawPacket,
        class: TrafficClass,
    },
    SetCompression(i32),
    EnableEncryption([u8; SHARED_SECRET_LEN]),
}

#[derive(Debug, Default)]
struct SendQueue {
    items: VecDeque<WriteItem>,
    packets: usize,
}

#[derive(Debug)]
struct Shared {
    side: Side,
    queue: Mutex<SendQueue>,
    notify: Notify,
    capacity: usize,
    bulk_overflow: OverflowPolicy,
    critical_overflow: OverflowPolicy,
    control: mpsc::UnboundedSender<ReadControl>,
    cancel: CancellationToken,
    closing: AtomicBool,
    reason: Mutex<Option<CloseReason>>,
    farewell: Mutex<Option<RawPacket>>,
    dropped: AtomicU64,
}

impl Shared {
    const fn policy(&self, class: TrafficClass) -> OverflowPolicy {
        match class {
            TrafficClass::Critical => self.critical_overflow,
            TrafficClass::Bulk => self.bulk_overflow,
        }
    }

    fn close(&self, reason: CloseReason) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }

        debug!(side = self.side.as_str(), %reason, "Closing connection");
        *self.reason.lock() = Some(reason);
        *self.queue.lock() = SendQueue::default();
        self.cancel.cancel();
        true
    }

    fn push(&self, item: WriteItem) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(ProxyError::ConnectionClosed);
        }
        self.queue.lock().items.push_back(item);
        self.notify.notify_one();
        Ok(())
    }

    fn control(&self, message: ReadControl) -> Result<()> {
        self.control
            .send(message)
            .map_err(|_| ProxyError::ConnectionClosed)
    }
}

/// Handle to an open connection. Cloning shares the connection.
#[derive(Debug, Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Start the reader and writer tasks for `stream`.
    ///
    /// The tasks run in the caller's tracing span.
    pub fn open<S>(stream: S, side: Side, config: &NetworkConfig) -> (Self, EventStream)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (publisher, events) = pipeline::channel(config.event_queue_capacity);

        let shared = Arc::new(Shared {
            side,
            queue: Mutex::new(SendQueue::default()),
            notify: Notify::new(),
            capacity: config.send_queue_capacity.max(1),
            bulk_overflow: config.bulk_overflow,
            critical_overflow: config.critical_overflow,
            control: control_tx,
            cancel: CancellationToken::new(),
            closing: AtomicBool::new(false),
            reason: Mutex::new(None),
            farewell: Mutex::new(None),
            dropped: AtomicU64::new(0),
        });

        let reader = FramedRead::new(read_half, PacketCodec::new(config.max_frame_len));
        let writer = FramedWrite::new(write_half, PacketCodec::new(config.max_frame_len));

        tokio::spawn(read_loop(reader, Arc::clone(&shared), publisher, control_rx).in_current_span());
        tokio::spawn(write_loop(writer, Arc::clone(&shared)).in_current_span());

        (Self { shared }, events)
    }

    /// Queue a packet. Never waits.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConnectionClosed`] after close, and
    /// [`ProxyError::QueueOverflow`] when the queue is full under
    /// [`OverflowPolicy::Close`] (the connection is closed as well).
    pub fn send(&self, packet: RawPacket, class: TrafficClass) -> Result<()> {
        let shared = &self.shared;
        if shared.closing.load(Ordering::Acquire) {
            return Err(ProxyError::ConnectionClosed);
        }

        let mut queue = shared.queue.lock();
        if queue.packets >= shared.capacity {
            match shared.policy(class) {
                OverflowPolicy::DropOldest => {
                    shared.dropped.fetch_add(1, Ordering::Relaxed);
                    let oldest = queue.items.iter().position(
                        |item| matches!(item, WriteItem::Packet { class: c, .. } if *c == class),
                    );
                    let Some(oldest) = oldest else {
                        debug!(side = shared.side.as_str(), id = packet.id, "Send queue full, dropping packet");
                        return Ok(());
                    };
                    queue.items.remove(oldest);
                    queue.packets -= 1;
                    debug!(side = shared.side.as_str(), "Send queue full, dropped oldest packet");
                }
                OverflowPolicy::Close => {
                    drop(queue);
                    warn!(side = shared.side.as_str(), ?class, "Send queue overflow");
                    shared.close(CloseReason::from(ProxyError::QueueOverflow("send queue")));
                    return Err(ProxyError::QueueOverflow("send queue"));
                }
            }
        }

        queue.items.push_back(WriteItem::Packet { packet, class });
        queue.packets += 1;
        drop(queue);

        shared.notify.notify_one();
        Ok(())
    }

    /// Compress outbound packets above `threshold` from this point of the
    /// queue on. A negative threshold disables compression.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConnectionClosed`] after close.
    pub fn enable_compression(&self, threshold: i32) -> Result<()> {
        self.shared.push(WriteItem::SetCompression(threshold))
    }

    /// Encrypt outbound bytes from this point of the queue on.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConnectionClosed`] after close.
    pub fn enable_encryption(&self, secret: [u8; SHARED_SECRET_LEN]) -> Result<()> {
        self.shared.push(WriteItem::EnableEncryption(secret))
    }

    /// Let a reader paused at a barrier packet continue.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConnectionClosed`] if the reader is gone.
    pub fn resume(&self) -> Result<()> {
        self.shared.control(ReadControl::Resume)
    }

    /// Change the inbound compression threshold while the reader is paused.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConnectionClosed`] if the reader is gone.
    pub fn set_inbound_compression(&self, threshold: i32) -> Result<()> {
        self.shared.control(ReadControl::SetCompression(threshold))
    }

    /// Decrypt inbound bytes once the paused reader resumes.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ConnectionClosed`] if the reader is gone.
    pub fn set_inbound_encryption(&self, secret: [u8; SHARED_SECRET_LEN]) -> Result<()> {
        self.shared.control(ReadControl::EnableEncryption(secret))
    }

    /// Close the connection. Returns `false` if it was already closing.
    ///
    /// Queued packets are discarded and the owner receives exactly one
    /// [`ConnectionEvent::Closed`].
    pub fn close(&self, reason: CloseReason) -> bool {
        self.shared.close(reason)
    }

    /// Close the connection after a best-effort write of `farewell`.
    pub fn disconnect(&self, farewell: Option<RawPacket>, reason: CloseReason) -> bool {
        if self.shared.closing.load(Ordering::Acquire) {
            return false;
        }
        if let Some(farewell) = farewell {
            self.shared.farewell.lock().get_or_insert(farewell);
        }
        self.shared.close(reason)
    }

    /// Whether close has started.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    /// Wait until close has started.
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await;
    }

    /// Which peer this connection talks to.
    #[must_use]
    pub fn side(&self) -> Side {
        self.shared.side
    }

    /// Packets waiting in the send queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().packets
    }

    /// Packets discarded because the send queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// Closes a connection when dropped, unless disarmed.
///
/// Login tasks hold one so that a cancelled or failed attempt never leaves a
/// half-open backend behind.
#[derive(Debug)]
pub struct CloseGuard {
    conn: Option<Connection>,
    reason: &'static str,
}

impl CloseGuard {
    /// Guard `conn`, closing it with `reason` on drop.
    #[must_use]
    pub const fn new(conn: Connection, reason: &'static str) -> Self {
        Self {
            conn: Some(conn),
            reason,
        }
    }

    /// Keep the connection open and hand it back.
    #[must_use]
    pub fn disarm(mut self) -> Option<Connection> {
        self.conn.take()
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close(CloseReason::Local(self.reason.to_string()));
        }
    }
}

async fn read_loop<R>(
    mut reader: FramedRead<ReadHalf<R>, PacketCodec>,
    shared: Arc<Shared>,
    publisher: Publisher,
    mut control: mpsc::UnboundedReceiver<ReadControl>,
) where
    R: AsyncRead + AsyncWrite,
{
    let mut state = shared.side.initial_state();

    match read_packets(&mut reader, &shared, &publisher, &mut control, &mut state).await {
        Ok(()) => {
            shared.close(CloseReason::PeerClosed);
        }
        Err(e) => {
            debug!(side = shared.side.as_str(), phase = %state.phase(), "Read failed: {e}");
            if shared.side == Side::Client {
                let farewell =
                    chat::disconnect_packet(state.phase(), state.table_version(), &e.disconnect_message());
                if let Some(farewell) = farewell {
                    shared.farewell.lock().get_or_insert(farewell);
                }
            }
            shared.close(CloseReason::from(e));
        }
    }

    let reason = shared.reason.lock().clone().unwrap_or(CloseReason::PeerClosed);
    let _ = publisher.publish(ConnectionEvent::Closed(reason)).await;
}

/// Returns `Ok` on end of stream or cancellation.
async fn read_packets<R>(
    reader: &mut FramedRead<ReadHalf<R>, PacketCodec>,
    shared: &Shared,
    publisher: &Publisher,
    control: &mut mpsc::UnboundedReceiver<ReadControl>,
    state: &mut ProtocolState,
) -> Result<()>
where
    R: AsyncRead + AsyncWrite,
{
    let inbound = shared.side.inbound();

    loop {
        let next = tokio::select! {
            biased;
            () = shared.cancel.cancelled() => return Ok(()),
            next = reader.next() => next,
        };
        let Some(packet) = next.transpose()? else {
            return Ok(());
        };

        let class = state::validate(state, packet.id, inbound)?;
        let mut barrier = false;

        if let PacketClass::Known(kind) = class {
            if let Some(event) = inbound_event(kind, inbound, &packet.payload)? {
                *state = state.transition(event)?;
            }
            if kind == PacketKind::SetCompression && inbound == Direction::Clientbound {
                let SetCompression { threshold } = SetCompression::from_raw(&packet)?;
                reader.decoder_mut().set_compression(threshold);
            }
            barrier = is_barrier(kind, inbound);
        }

        trace!(side = shared.side.as_str(), id = packet.id, phase = %state.phase(), "Inbound packet");

        let event = ConnectionEvent::Packet {
            packet,
            class,
            state: *state,
        };
        tokio::select! {
            biased;
            () = shared.cancel.cancelled() => return Ok(()),
            result = publisher.publish(event) => result?,
        }

        if barrier && !wait_for_resume(reader, shared, control).await {
            return Ok(());
        }
    }
}

/// Apply read-side controls until resumed. Returns `false` on cancellation.
async fn wait_for_resume<R>(
    reader: &mut FramedRead<ReadHalf<R>, PacketCodec>,
    shared: &Shared,
    control: &mut mpsc::UnboundedReceiver<ReadControl>,
) -> bool
where
    R: AsyncRead + AsyncWrite,
{
    loop {
        let message = tokio::select! {
            biased;
            () = shared.cancel.cancelled() => return false,
            message = control.recv() => message,
        };

        match message {
            Some(ReadControl::Resume) => return true,
            Some(ReadControl::SetCompression(threshold)) => {
                reader.decoder_mut().set_compression(threshold);
            }
            Some(ReadControl::EnableEncryption(secret)) => {
                reader.decoder_mut().enable_encryption(&secret);
            }
            None => return false,
        }
    }
}

async fn write_loop<W>(mut writer: FramedWrite<WriteHalf<W>, PacketCodec>, shared: Arc<Shared>)
where
    W: AsyncRead + AsyncWrite,
{
    if let Err(e) = write_packets(&mut writer, &shared).await {
        debug!(side = shared.side.as_str(), "Write failed: {e}");
        shared.close(CloseReason::from(e));
    }

    let farewell = shared.farewell.lock().take();
    if let Some(farewell) = farewell {
        let _ = tokio::time::timeout(FAREWELL_TIMEOUT, writer.send(farewell)).await;
    }
    let _ = tokio::time::timeout(FAREWELL_TIMEOUT, writer.close()).await;
}

/// Returns `Ok` on cancellation.
async fn write_packets<W>(
    writer: &mut FramedWrite<WriteHalf<W>, PacketCodec>,
    shared: &Shared,
) -> Result<()>
where
    W: AsyncRead + AsyncWrite,
{
    loop {
        let batch = {
            let mut queue = shared.queue.lock();
            queue.packets = 0;
            std::mem::take(&mut queue.items)
        };

        if batch.is_empty() {
            tokio::select! {
                biased;
                () = shared.cancel.cancelled() => return Ok(()),
                () = shared.notify.notified() => continue,
            }
        }

        for item in batch {
            match item {
                WriteItem::Packet { packet, .. } => {
                    tokio::select! {
                        biased;
                        () = shared.cancel.cancelled() => return Ok(()),
                        result = writer.feed(packet) => result?,
                    }
                }
                WriteItem::SetCompression(threshold) => {
                    writer.encoder_mut().set_compression(threshold);
                }
                WriteItem::EnableEncryption(secret) => {
                    writer.encoder_mut().enable_encryption(&secret);
                }
            }
        }

        tokio::select! {
            biased;
            () = shared.cancel.cancelled() => return Ok(()),
            result = writer.flush() => result?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use slider_mc::packets::{Handshake, LoginStart, NextState, Ping, StatusRequest};
    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;
    use uuid::Uuid;

    fn config() -> NetworkConfig {
        NetworkConfig::default()
    }

    fn open(side: Side, config: &NetworkConfig) -> (Connection, EventStream, Framed<DuplexStream, PacketCodec>) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (conn, events) = Connection::open(ours, side, config);
        (conn, events, Framed::new(theirs, PacketCodec::default()))
    }

    fn handshake(next_state: NextState) -> RawPacket {
        Handshake {
            protocol_version: ProtocolVersion::LATEST.as_raw(),
            server_address: "localhost".to_string(),
            server_port: 25565,
            next_state,
        }
        .to_raw()
    }

    fn raw(id: i32, body: &[u8]) -> RawPacket {
        RawPacket::new(id, BytesMut::from(body))
    }

    async fn next_packet(events: &mut EventStream) -> (RawPacket, ProtocolState) {
        match events.recv().await {
            Some(ConnectionEvent::Packet { packet, state, .. }) => (packet, state),
            other => panic!("expected a packet, got {other:?}"),
        }
    }

    async fn next_close(events: &mut EventStream) -> CloseReason {
        match events.recv().await {
            Some(ConnectionEvent::Closed(reason)) => reason,
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_events_follow_wire_order_and_state() {
        let (_conn, mut events, mut peer) = open(Side::Client, &config());

        peer.send(handshake(NextState::Status)).await.unwrap();
        peer.send(StatusRequest.to_raw()).await.unwrap();
        peer.send(Ping::new(42).to_raw()).await.unwrap();

        let (packet, state) = next_packet(&mut events).await;
        assert_eq!(packet.id, 0x00);
        assert_eq!(state.phase(), Phase::Status);

        let (packet, _) = next_packet(&mut events).await;
        assert_eq!(packet, StatusRequest.to_raw());

        let (packet, state) = next_packet(&mut events).await;
        assert_eq!(packet, Ping::new(42).to_raw());
        assert_eq!(state.phase(), Phase::Status);
    }

    #[tokio::test]
    async fn test_violation_closes_once() {
        let (conn, mut events, mut peer) = open(Side::Client, &config());

        peer.send(handshake(NextState::Status)).await.unwrap();
        peer.send(raw(0x05, &[])).await.unwrap();

        next_packet(&mut events).await;
        let reason = next_close(&mut events).await;
        assert!(matches!(
            reason,
            CloseReason::Failed(ref e) if matches!(**e, ProxyError::ProtocolViolation(_))
        ));
        assert!(events.recv().await.is_none());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_violation_sends_farewell_to_client() {
        let (_conn, mut events, mut peer) = open(Side::Client, &config());

        peer.send(handshake(NextState::Login)).await.unwrap();
        peer.send(raw(0x7F, &[])).await.unwrap();

        next_packet(&mut events).await;
        next_close(&mut events).await;

        let farewell = peer.next().await.unwrap().unwrap();
        assert_eq!(farewell.id, 0x00);
        assert!(peer.next().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_close_is_one_teardown() {
        let (conn, mut events, _peer) = open(Side::Client, &config());

        let closers: Vec<_> = (0..16)
            .map(|i| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.close(CloseReason::Local(format!("closer {i}"))) })
            })
            .collect();

        let mut winners = 0;
        for closer in closers {
            if closer.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        assert!(matches!(next_close(&mut events).await, CloseReason::Local(_)));
        assert!(events.recv().await.is_none());
        assert!(!conn.close(CloseReason::PeerClosed));
    }

    #[tokio::test]
    async fn test_peer_close() {
        let (_conn, mut events, peer) = open(Side::Backend, &config());
        drop(peer);
        assert!(matches!(next_close(&mut events).await, CloseReason::PeerClosed));
    }

    #[tokio::test]
    async fn test_barrier_pauses_reader() {
        let (conn, mut events, mut peer) = open(Side::Client, &config());

        peer.send(handshake(NextState::Login)).await.unwrap();
        peer.send(LoginStart::new("Steve", Uuid::nil()).to_raw()).await.unwrap();
        peer.send(raw(0x03, &[])).await.unwrap();

        next_packet(&mut events).await;
        let (hello, _) = next_packet(&mut events).await;
        assert_eq!(hello.id, 0x00);

        let pending = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        assert!(pending.is_err());

        conn.resume().unwrap();
        let (ack, state) = next_packet(&mut events).await;
        assert_eq!(ack.id, 0x03);
        assert_eq!(state.phase(), Phase::Configuration);
    }

    #[tokio::test]
    async fn test_inbound_encryption_installed_at_barrier() {
        let secret = [7u8; SHARED_SECRET_LEN];
        let (conn, mut events, mut peer) = open(Side::Client, &config());

        peer.send(handshake(NextState::Login)).await.unwrap();
        peer.send(LoginStart::new("Steve", Uuid::nil()).to_raw()).await.unwrap();
        peer.codec_mut().enable_encryption(&secret);
        peer.send(raw(0x03, &[])).await.unwrap();

        next_packet(&mut events).await;
        next_packet(&mut events).await;

        conn.set_inbound_encryption(secret).unwrap();
        conn.resume().unwrap();

        let (ack, state) = next_packet(&mut events).await;
        assert_eq!(ack.id, 0x03);
        assert_eq!(state.phase(), Phase::Configuration);
    }

    #[tokio::test]
    async fn test_outbound_codec_changes_apply_in_queue_order() {
        let secret = [9u8; SHARED_SECRET_LEN];
        let (conn, _events, mut peer) = open(Side::Client, &config());

        conn.send(raw(0x01, b"plain"), TrafficClass::Critical).unwrap();
        conn.enable_encryption(secret).unwrap();
        conn.enable_compression(0).unwrap();
        conn.send(raw(0x02, b"secret"), TrafficClass::Critical).unwrap();

        assert_eq!(peer.next().await.unwrap().unwrap(), raw(0x01, b"plain"));
        peer.codec_mut().enable_encryption(&secret);
        peer.codec_mut().set_compression(0);
        assert_eq!(peer.next().await.unwrap().unwrap(), raw(0x02, b"secret"));
    }

    #[tokio::test]
    async fn test_backend_set_compression_applies_to_reader() {
        let (_conn, mut events, mut peer) = open(Side::Backend, &config());

        peer.send(SetCompression::new(16).to_raw()).await.unwrap();
        peer.codec_mut().set_compression(16);
        peer.send(raw(0x02, &[0u8; 64])).await.unwrap();

        let (packet, _) = next_packet(&mut events).await;
        assert_eq!(packet.id, 0x03);
        let (packet, state) = next_packet(&mut events).await;
        assert_eq!(packet.payload.len(), 64);
        assert_eq!(state.phase(), Phase::Configuration);
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest_packets() {
        let config = NetworkConfig {
            send_queue_capacity: 2,
            bulk_overflow: OverflowPolicy::DropOldest,
            ..NetworkConfig::default()
        };
        let (conn, _events, mut peer) = open(Side::Client, &config);

        // No await between sends: the writer has not run yet
        for id in 1..=3 {
            conn.send(raw(id, &[]), TrafficClass::Bulk).unwrap();
        }
        assert_eq!(conn.queued(), 2);
        assert_eq!(conn.dropped(), 1);

        assert_eq!(peer.next().await.unwrap().unwrap().id, 2);
        assert_eq!(peer.next().await.unwrap().unwrap().id, 3);
    }

    #[tokio::test]
    async fn test_close_policy_overflow() {
        let config = NetworkConfig {
            send_queue_capacity: 1,
            critical_overflow: OverflowPolicy::Close,
            ..NetworkConfig::default()
        };
        let (conn, mut events, _peer) = open(Side::Backend, &config);

        conn.send(raw(1, &[]), TrafficClass::Critical).unwrap();
        assert!(matches!(
            conn.send(raw(2, &[]), TrafficClass::Critical),
            Err(ProxyError::QueueOverflow(_))
        ));
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send(raw(3, &[]), TrafficClass::Critical),
            Err(ProxyError::ConnectionClosed)
        ));

        let reason = next_close(&mut events).await;
        assert!(matches!(
            reason,
            CloseReason::Failed(ref e) if matches!(**e, ProxyError::QueueOverflow(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_writes_farewell_then_eof() {
        let (conn, mut events, mut peer) = open(Side::Client, &config());

        let farewell = raw(0x1C, b"bye");
        assert!(conn.disconnect(Some(farewell.clone()), CloseReason::Local("kick".into())));
        assert!(!conn.disconnect(None, CloseReason::Local("again".into())));

        assert_eq!(peer.next().await.unwrap().unwrap(), farewell);
        assert!(peer.next().await.is_none());
        assert!(matches!(next_close(&mut events).await, CloseReason::Local(_)));
    }

    #[tokio::test]
    async fn test_close_guard() {
        let (conn, _events, _peer) = open(Side::Backend, &config());
        let guard = CloseGuard::new(conn.clone(), "abandoned");
        drop(guard);
        assert!(conn.is_closed());

        let (conn, _events, _peer) = open(Side::Backend, &config());
        let kept = CloseGuard::new(conn.clone(), "abandoned").disarm();
        assert!(kept.is_some());
        assert!(!conn.is_closed());
    }
}
