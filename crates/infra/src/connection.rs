//! Outbound subscription towards a remote event horizon.
//!
//! A `Connection` keeps one tunnel open for as long as it lives:
//!
//! ```text
//! Disconnected ─▶ Handshaking ─▶ Streaming
//!                     ▲  │           │ any error
//!                     │  └─────┬─────┘
//!                     │        ▼
//!                     └──── BackingOff          close() ─▶ Closed (from any state)
//! ```
//!
//! There is no retry ceiling; only `close` (or dropping the connection)
//! stops it.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relativity_events::{CommittedEventStream, EventBus};

use crate::config::ConnectionConfig;
use crate::wire::{ClientCodec, ClientMessage, OpenTunnelMessage, ServerMessage, WireError};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Streaming,
    BackingOff,
    Closed,
}

impl ConnectionState {
    pub fn is_closed(self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

/// Why one attempt ended. Every variant except `Cancelled` leads to backoff.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("could not connect: {0}")]
    Connect(std::io::Error),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("no handshake answer within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("handshake rejected by event horizon: {0}")]
    Rejected(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    #[error("stream closed by event horizon")]
    RemoteClosed,

    #[error("connection cancelled")]
    Cancelled,
}

/// Handle to a running subscription.
#[derive(Debug)]
pub struct Connection {
    remote: String,
    cancel: CancellationToken,
    state: watch::Receiver<ConnectionState>,
    attempts: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Start connecting. Every received stream is published on `consumer`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open<B>(config: ConnectionConfig, consumer: B) -> Self
    where
        B: EventBus<Arc<CommittedEventStream>> + 'static,
    {
        let remote = config.remote.clone();
        let cancel = CancellationToken::new();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let attempts = Arc::new(AtomicU64::new(0));

        let supervisor = Supervisor {
            config,
            consumer,
            state: state_tx,
            attempts: Arc::clone(&attempts),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(supervisor.run());

        Self {
            remote,
            cancel,
            state,
            attempts,
            task: Some(task),
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Handshakes attempted so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Ask the supervisor to stop without waiting for it.
    pub fn request_close(&self) {
        self.cancel.cancel();
    }

    /// Stop reconnecting, cancel any pending wait and release the socket.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(remote = %self.remote, error = %error, "connection task failed");
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Supervisor<B> {
    config: ConnectionConfig,
    consumer: B,
    state: watch::Sender<ConnectionState>,
    attempts: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl<B> Supervisor<B>
where
    B: EventBus<Arc<CommittedEventStream>>,
{
    async fn run(self) {
        info!(remote = %self.config.remote, "establishing connection towards event horizon");

        loop {
            self.transition(ConnectionState::Handshaking);
            let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;

            match self.open_and_handle_stream().await {
                ConnectionError::Cancelled => break,
                error => warn!(
                    remote = %self.config.remote,
                    attempt,
                    error = %error,
                    "connection towards event horizon broken"
                ),
            }

            self.transition(ConnectionState::BackingOff);
            warn!(
                remote = %self.config.remote,
                delay = ?self.config.reconnect_delay,
                "backing off before reconnecting"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.config.reconnect_delay) => {}
            }
            info!(remote = %self.config.remote, "trying to reconnect");
        }

        self.transition(ConnectionState::Closed);
        info!(remote = %self.config.remote, "connection towards event horizon closed");
    }

    fn transition(&self, next: ConnectionState) {
        self.state.send_replace(next);
    }

    /// One attempt: connect, handshake, stream until something breaks.
    /// Always ends in an error; `Cancelled` means stop for good.
    async fn open_and_handle_stream(&self) -> ConnectionError {
        let config = &self.config;

        let socket = match self
            .cancellable(timeout(config.connect_timeout, TcpStream::connect(&config.remote)))
            .await
        {
            Err(cancelled) => return cancelled,
            Ok(Err(_elapsed)) => return ConnectionError::ConnectTimeout(config.connect_timeout),
            Ok(Ok(Err(error))) => return ConnectionError::Connect(error),
            Ok(Ok(Ok(socket))) => socket,
        };
        if let Err(error) = socket.set_nodelay(true) {
            debug!(error = %error, "set TCP_NODELAY failed");
        }
        let mut framed = Framed::new(socket, ClientCodec::new());

        let open = OpenTunnelMessage::new(config.application, config.bounded_context, &config.interest);
        match self
            .cancellable(timeout(config.handshake_timeout, framed.send(ClientMessage::OpenTunnel(open))))
            .await
        {
            Err(cancelled) => return cancelled,
            Ok(Err(_elapsed)) => return ConnectionError::HandshakeTimeout(config.handshake_timeout),
            Ok(Ok(Err(error))) => return error.into(),
            Ok(Ok(Ok(()))) => {}
        }

        let answer = match self
            .cancellable(timeout(config.handshake_timeout, framed.next()))
            .await
        {
            Err(cancelled) => return cancelled,
            Ok(Err(_elapsed)) => return ConnectionError::HandshakeTimeout(config.handshake_timeout),
            Ok(Ok(answer)) => answer,
        };
        match answer {
            Some(Ok(ServerMessage::TunnelOpened)) => {}
            Some(Ok(ServerMessage::TunnelRejected { reason })) => return ConnectionError::Rejected(reason),
            Some(Ok(ServerMessage::Events { .. })) => {
                return ConnectionError::UnexpectedMessage("events before handshake answer");
            }
            Some(Err(error)) => return error.into(),
            None => return ConnectionError::RemoteClosed,
        }

        self.transition(ConnectionState::Streaming);
        info!(remote = %config.remote, "quantum tunnel established");

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = framed.close().await;
                    return ConnectionError::Cancelled;
                }
                next = framed.next() => next,
            };
            match next {
                Some(Ok(ServerMessage::Events { stream })) => {
                    debug!(
                        remote = %config.remote,
                        commit_id = %stream.commit_id(),
                        events = stream.len(),
                        "committed event stream received"
                    );
                    if let Err(error) = self.consumer.publish(stream) {
                        warn!(error = ?error, "local consumer rejected committed event stream");
                    }
                }
                Some(Ok(_)) => return ConnectionError::UnexpectedMessage("handshake answer while streaming"),
                Some(Err(error)) => return error.into(),
                None => return ConnectionError::RemoteClosed,
            }
        }
    }

    async fn cancellable<F>(&self, work: F) -> Result<F::Output, ConnectionError>
    where
        F: Future,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ConnectionError::Cancelled),
            output = work => Ok(output),
        }
    }
}
