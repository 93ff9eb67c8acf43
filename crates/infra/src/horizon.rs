//! Event horizon: the serving side of cross-boundary replication.
//!
//! ```text
//! event store ──pass_through──▶ ingress queue ──▶ dispatcher ──▶ registry.publish
//!                                                                   │
//!                          ┌────────────────────────────────────────┘
//!                          ▼
//!            tunnel queue per connection ──▶ socket ──▶ remote Connection
//! ```
//!
//! One task accepts sockets, one task per accepted socket performs the
//! handshake and then writes its tunnel's streams, and one dispatcher task
//! drains the ingress queue so streams are published in the order they were
//! passed through.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relativity_events::{CommittedEventStream, EventHorizonIngress};

use crate::config::HorizonConfig;
use crate::registry::{PublishReport, SingularityRegistry};
use crate::singularity::{RegistrationHandle, Singularity};
use crate::tunnel::StreamTunnel;
use crate::wire::{ClientMessage, ServerCodec, ServerMessage};

/// Pause after a failed `accept` so a persistent error (e.g. no free file
/// descriptors) does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// How long a closing tunnel may spend flushing to its peer.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum HorizonError {
    #[error("could not establish an event horizon on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("event horizon is shut down")]
    ShutDown,

    #[error("ingress queue is full")]
    IngressFull,
}

/// A running event horizon.
///
/// Dropping it cancels every task it started; `shutdown` additionally waits
/// for them, so all sockets are closed once it returns.
#[derive(Debug)]
pub struct EventHorizon {
    local_addr: SocketAddr,
    registry: Arc<SingularityRegistry>,
    ingress: mpsc::Sender<Arc<CommittedEventStream>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EventHorizon {
    /// Bind the listening endpoint and start serving.
    ///
    /// Must be called from within a Tokio runtime. Failure to bind is
    /// returned; nothing is left running in that case.
    pub async fn start(config: HorizonConfig) -> Result<Self, HorizonError> {
        let addr = config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| HorizonError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| HorizonError::Bind { addr, source })?;

        let registry = Arc::new(SingularityRegistry::new(
            config.generation_match,
            config.delivery_timeout,
        ));
        let cancel = CancellationToken::new();
        let (ingress, ingress_rx) = mpsc::channel(config.ingress_capacity.max(1));

        let dispatcher = tokio::spawn(dispatch(Arc::clone(&registry), ingress_rx, cancel.clone()));
        let acceptor = tokio::spawn(accept(
            listener,
            Arc::clone(&registry),
            Arc::new(config),
            cancel.clone(),
        ));

        info!(addr = %local_addr, "event horizon started");

        Ok(Self {
            local_addr,
            registry,
            ingress,
            cancel,
            tasks: vec![acceptor, dispatcher],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<SingularityRegistry> {
        &self.registry
    }

    /// Queue a committed stream for delivery. Never fails towards the caller.
    pub fn pass_through(&self, stream: CommittedEventStream) {
        if let Err(error) = self.try_pass_through(stream) {
            warn!(error = %error, "committed event stream not passed through the event horizon");
        }
    }

    /// Like `pass_through`, but reports why a stream could not be queued.
    pub fn try_pass_through(&self, stream: CommittedEventStream) -> Result<(), HorizonError> {
        if self.cancel.is_cancelled() {
            return Err(HorizonError::ShutDown);
        }
        self.ingress
            .try_send(Arc::new(stream))
            .map_err(|error| match error {
                mpsc::error::TrySendError::Full(_) => HorizonError::IngressFull,
                mpsc::error::TrySendError::Closed(_) => HorizonError::ShutDown,
            })
    }

    /// Publish immediately and wait for the outcome.
    ///
    /// Bypasses the ingress queue: a stream published here may overtake
    /// streams still queued by `pass_through`.
    pub async fn publish(&self, stream: CommittedEventStream) -> PublishReport {
        self.registry.publish(Arc::new(stream)).await
    }

    /// Register a singularity outside of the handshake path.
    pub fn gravitate_towards(&self, singularity: Singularity) -> RegistrationHandle {
        info!(
            application = %singularity.application(),
            bounded_context = %singularity.bounded_context(),
            "gravitating events towards singularity"
        );
        self.registry.register(singularity)
    }

    /// Evict a singularity; its connection, if any, is closed.
    pub fn collapse(&self, handle: &RegistrationHandle) -> bool {
        self.registry.evict(handle)
    }

    /// Stop accepting, close every tunnel and wait for all tasks to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(error) = task.await {
                error!(error = %error, "event horizon task failed during shutdown");
            }
        }
        info!(addr = %self.local_addr, "event horizon shut down");
    }
}

impl EventHorizonIngress for EventHorizon {
    fn pass_through(&self, stream: CommittedEventStream) {
        EventHorizon::pass_through(self, stream)
    }
}

impl Drop for EventHorizon {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn dispatch(
    registry: Arc<SingularityRegistry>,
    mut ingress: mpsc::Receiver<Arc<CommittedEventStream>>,
    cancel: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            next = ingress.recv() => match next {
                Some(stream) => stream,
                None => break,
            },
        };

        let commit_id = stream.commit_id();
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(commit_id = %commit_id, "publish cancelled by shutdown");
                break;
            }
            report = registry.publish(stream) => {
                if !report.evicted.is_empty() {
                    warn!(
                        commit_id = %commit_id,
                        evicted = report.evicted.len(),
                        "singularities collapsed after failed delivery"
                    );
                }
            }
        }
    }
    debug!("event horizon dispatcher stopped");
}

async fn accept(
    listener: TcpListener,
    registry: Arc<SingularityRegistry>,
    config: Arc<HorizonConfig>,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(peer = %peer, "connection accepted");
                    connections.spawn(serve(
                        socket,
                        peer,
                        Arc::clone(&registry),
                        Arc::clone(&config),
                        cancel.child_token(),
                    ));
                }
                Err(error) => {
                    warn!(error = %error, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(error) = finished {
                    error!(error = %error, "connection task failed");
                }
            }
        }
    }

    drop(listener);
    while let Some(finished) = connections.join_next().await {
        if let Err(error) = finished {
            error!(error = %error, "connection task failed");
        }
    }
}

/// Serve one accepted socket: handshake, register, pump, evict.
async fn serve(
    socket: TcpStream,
    peer: SocketAddr,
    registry: Arc<SingularityRegistry>,
    config: Arc<HorizonConfig>,
    cancel: CancellationToken,
) {
    if let Err(error) = socket.set_nodelay(true) {
        debug!(peer = %peer, error = %error, "set TCP_NODELAY failed");
    }
    let mut framed = Framed::new(socket, ServerCodec::new());

    let first = tokio::select! {
        _ = cancel.cancelled() => return,
        first = timeout(config.handshake_timeout, framed.next()) => first,
    };
    let open = match first {
        Ok(Some(Ok(ClientMessage::OpenTunnel(open)))) => open,
        Ok(Some(Err(error))) => {
            warn!(peer = %peer, error = %error, "malformed handshake");
            reject(&mut framed, error.to_string(), config.handshake_timeout).await;
            return;
        }
        Ok(None) => {
            debug!(peer = %peer, "connection closed before handshake");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, timeout = ?config.handshake_timeout, "handshake timed out");
            return;
        }
    };

    let interest = match open.validate() {
        Ok(interest) => interest,
        Err(reason) => {
            warn!(
                peer = %peer,
                application = %open.application,
                bounded_context = %open.bounded_context,
                reason = %reason,
                "handshake rejected"
            );
            reject(&mut framed, reason.to_string(), config.handshake_timeout).await;
            return;
        }
    };

    let (tunnel, mut outbound) = StreamTunnel::channel(config.tunnel_capacity);
    let singularity = Singularity::new(open.application, open.bounded_context, interest, Arc::new(tunnel));
    let collapse = singularity.collapse_token();
    let handle = registry.register(singularity);

    let confirmed = tokio::select! {
        _ = cancel.cancelled() => Err("event horizon shutting down".to_string()),
        sent = timeout(config.handshake_timeout, framed.send(ServerMessage::TunnelOpened)) => match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(format!("failed to confirm handshake: {error}")),
            Err(_) => Err("handshake confirmation stalled".to_string()),
        },
    };
    let reason = match confirmed {
        Ok(()) => {
            info!(
                peer = %peer,
                application = %open.application,
                bounded_context = %open.bounded_context,
                "quantum tunnel opened"
            );
            pump(&mut framed, &mut outbound, &collapse, &cancel, config.delivery_timeout).await
        }
        Err(reason) => reason,
    };

    registry.evict(&handle);
    close_within(&mut framed).await;
    info!(
        peer = %peer,
        application = %open.application,
        bounded_context = %open.bounded_context,
        reason = %reason,
        "quantum tunnel closed"
    );
}

async fn reject(framed: &mut Framed<TcpStream, ServerCodec>, reason: String, limit: Duration) {
    match timeout(limit, framed.send(ServerMessage::TunnelRejected { reason })).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => debug!(error = %error, "failed to send handshake rejection"),
        Err(_) => debug!("handshake rejection stalled"),
    }
    close_within(framed).await;
}

/// Flush and shut down the write half; a peer that stopped reading gets
/// `CLOSE_GRACE` before the socket is dropped regardless.
async fn close_within(framed: &mut Framed<TcpStream, ServerCodec>) {
    match timeout(CLOSE_GRACE, framed.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => debug!(error = %error, "closing tunnel socket failed"),
        Err(_) => debug!("tunnel socket did not drain before close"),
    }
}

/// Write tunnel traffic to the socket until something ends the connection.
/// Returns why it ended.
///
/// A single write taking longer than `write_timeout` ends the connection,
/// and shutdown or collapse abandon a write in flight.
async fn pump(
    framed: &mut Framed<TcpStream, ServerCodec>,
    outbound: &mut mpsc::Receiver<Arc<CommittedEventStream>>,
    collapse: &CancellationToken,
    cancel: &CancellationToken,
    write_timeout: Duration,
) -> String {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return "event horizon shutting down".to_string(),
            _ = collapse.cancelled() => return "singularity collapsed".to_string(),
            next = outbound.recv() => match next {
                Some(stream) => {
                    let write = timeout(write_timeout, framed.send(ServerMessage::Events { stream }));
                    tokio::select! {
                        _ = cancel.cancelled() => return "event horizon shutting down".to_string(),
                        _ = collapse.cancelled() => return "singularity collapsed".to_string(),
                        written = write => match written {
                            Ok(Ok(())) => {}
                            Ok(Err(error)) => return format!("write failed: {error}"),
                            Err(_) => return format!("write stalled for {write_timeout:?}"),
                        },
                    }
                }
                None => return "tunnel dropped".to_string(),
            },
            inbound = framed.next() => match inbound {
                None => return "closed by subscriber".to_string(),
                Some(Err(error)) => return format!("protocol error: {error}"),
                Some(Ok(message)) => {
                    debug!(?message, "ignoring unexpected message on open tunnel");
                }
            },
        }
    }
}
