//! Ordered, bounded delivery of connection events to their owner.
//!
//! Each connection's reader task is the only [`Publisher`]; the session (or
//! login task) owning the connection holds the [`EventStream`]. A full
//! pipeline makes `publish` wait, which keeps the reader from pulling more
//! bytes off the socket.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use slider_mc::{PacketClass, ProtocolState, RawPacket};

use crate::error::{ProxyError, Result};

/// Why a connection closed.
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// The peer closed the socket.
    PeerClosed,
    /// The proxy closed the connection on purpose.
    Local(String),
    /// The connection failed.
    Failed(Arc<ProxyError>),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("closed by peer"),
            Self::Local(reason) => write!(f, "closed by proxy: {reason}"),
            Self::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

impl From<ProxyError> for CloseReason {
    fn from(err: ProxyError) -> Self {
        Self::Failed(Arc::new(err))
    }
}

/// Something that happened on a connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A validated inbound packet.
    Packet {
        /// The packet as it came off the wire.
        packet: RawPacket,
        /// Whether the proxy knows the packet by name.
        class: PacketClass,
        /// Inbound state after the packet was applied.
        state: ProtocolState,
    },
    /// The connection is gone. Always the last event.
    Closed(CloseReason),
}

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    published: AtomicU64,
    consumed: AtomicU64,
    producer_waits: AtomicU64,
}

impl PipelineStats {
    /// Events accepted by the pipeline.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Events taken out by the consumer.
    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Times the producer found the pipeline full and had to wait.
    #[must_use]
    pub fn producer_waits(&self) -> u64 {
        self.producer_waits.load(Ordering::Relaxed)
    }
}

/// Create a pipeline holding at most `capacity` events.
#[must_use]
pub fn channel(capacity: usize) -> (Publisher, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stats = Arc::new(PipelineStats::default());
    (
        Publisher {
            tx,
            stats: Arc::clone(&stats),
        },
        EventStream { rx, stats },
    )
}

/// Producing half of a pipeline.
#[derive(Debug)]
pub struct Publisher {
    tx: mpsc::Sender<ConnectionEvent>,
    stats: Arc<PipelineStats>,
}

impl Publisher {
    /// Publish an event, waiting while the pipeline is full.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::PipelineClosed`] if the consumer is gone.
    pub async fn publish(&self, event: ConnectionEvent) -> Result<()> {
        let event = match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(TrySendError::Closed(_)) => return Err(ProxyError::PipelineClosed),
            Err(TrySendError::Full(event)) => event,
        };

        self.stats.producer_waits.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(event)
            .await
            .map_err(|_| ProxyError::PipelineClosed)?;
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Publish an event without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::QueueOverflow`] if the pipeline is full and
    /// [`ProxyError::PipelineClosed`] if the consumer is gone.
    pub fn try_publish(&self, event: ConnectionEvent) -> Result<()> {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(ProxyError::QueueOverflow("event pipeline")),
            Err(TrySendError::Closed(_)) => Err(ProxyError::PipelineClosed),
        }
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }
}

/// Consuming half of a pipeline.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<ConnectionEvent>,
    stats: Arc<PipelineStats>,
}

impl EventStream {
    /// Next event in publish order, `None` once the publisher is gone and
    /// everything has been consumed.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        let event = self.rx.recv().await;
        if event.is_some() {
            self.stats.consumed.fetch_add(1, Ordering::Relaxed);
        }
        event
    }

    /// Events waiting to be consumed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether no event is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }
}

impl Stream for EventStream {
    type Item = ConnectionEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let poll = self.rx.poll_recv(cx);
        if let std::task::Poll::Ready(Some(_)) = &poll {
            self.stats.consumed.fetch_add(1, Ordering::Relaxed);
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn packet(id: i32) -> ConnectionEvent {
        ConnectionEvent::Packet {
            packet: RawPacket::empty(id),
            class: PacketClass::Opaque,
            state: ProtocolState::new(),
        }
    }

    fn id_of(event: ConnectionEvent) -> i32 {
        match event {
            ConnectionEvent::Packet { packet, .. } => packet.id,
            ConnectionEvent::Closed(reason) => panic!("unexpected close: {reason}"),
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (publisher, mut stream) = channel(8);
        for id in 0..5 {
            publisher.publish(packet(id)).await.unwrap();
        }
        for id in 0..5 {
            assert_eq!(id_of(stream.recv().await.unwrap()), id);
        }
        assert_eq!(stream.stats().published(), 5);
        assert_eq!(stream.stats().consumed(), 5);
    }

    #[tokio::test]
    async fn test_publish_waits_when_full() {
        let (publisher, mut stream) = channel(1);
        publisher.publish(packet(1)).await.unwrap();

        // A full pipeline keeps the producer pending
        let blocked = tokio::time::timeout(Duration::from_millis(50), publisher.publish(packet(2)));
        assert!(blocked.await.is_err());
        assert!(matches!(
            publisher.try_publish(packet(3)),
            Err(ProxyError::QueueOverflow(_))
        ));

        let producer = tokio::spawn(async move {
            publisher.publish(packet(4)).await.unwrap();
            publisher
        });
        assert_eq!(id_of(stream.recv().await.unwrap()), 1);
        let publisher = producer.await.unwrap();
        assert_eq!(id_of(stream.recv().await.unwrap()), 4);
        assert!(publisher.stats().producer_waits() >= 1);
    }

    #[tokio::test]
    async fn test_closed_consumer() {
        let (publisher, stream) = channel(4);
        drop(stream);
        assert!(matches!(
            publisher.publish(packet(1)).await,
            Err(ProxyError::PipelineClosed)
        ));
        assert!(matches!(
            publisher.try_publish(packet(1)),
            Err(ProxyError::PipelineClosed)
        ));
    }

    #[tokio::test]
    async fn test_stream_ends_after_publisher_drops() {
        let (publisher, mut stream) = channel(4);
        publisher
            .publish(ConnectionEvent::Closed(CloseReason::PeerClosed))
            .await
            .unwrap();
        drop(publisher);
        assert!(matches!(
            stream.recv().await,
            Some(ConnectionEvent::Closed(CloseReason::PeerClosed))
        ));
        assert!(stream.recv().await.is_none());
    }
}
