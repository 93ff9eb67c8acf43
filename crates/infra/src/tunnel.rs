//! Tunnels: the per-subscriber push channel behind a singularity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use relativity_events::CommittedEventStream;

/// Identity of one tunnel; a tunnel is bound to exactly one accepted connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TunnelId(Uuid);

impl TunnelId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TunnelId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for TunnelId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Acknowledgement that a stream was handed to the subscriber's connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub tunnel: TunnelId,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The connection behind the tunnel is gone.
    #[error("tunnel closed")]
    Closed,

    #[error("delivery timed out after {0:?}")]
    TimedOut(Duration),

    #[error("write to subscriber failed: {0}")]
    Write(String),

    #[error("delivery task panicked")]
    Panicked,
}

/// Push channel towards one remote subscriber.
///
/// `deliver` must only affect this tunnel: a failure is reported to the
/// caller, which evicts the singularity, and never touches other tunnels.
#[async_trait]
pub trait Tunnel: Send + Sync {
    fn id(&self) -> TunnelId;

    async fn deliver(&self, stream: Arc<CommittedEventStream>) -> Result<Delivered, DeliveryError>;
}

/// Tunnel backed by a bounded queue drained by the connection's writer.
///
/// Streams are written in the order they were delivered.
#[derive(Debug, Clone)]
pub struct StreamTunnel {
    id: TunnelId,
    outbound: mpsc::Sender<Arc<CommittedEventStream>>,
}

impl StreamTunnel {
    /// Create a tunnel and the receiving end its connection writes from.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<CommittedEventStream>>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: TunnelId::new(),
                outbound,
            },
            rx,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

#[async_trait]
impl Tunnel for StreamTunnel {
    fn id(&self) -> TunnelId {
        self.id
    }

    async fn deliver(&self, stream: Arc<CommittedEventStream>) -> Result<Delivered, DeliveryError> {
        self.outbound
            .send(stream)
            .await
            .map_err(|_| DeliveryError::Closed)?;
        Ok(Delivered { tunnel: self.id })
    }
}
