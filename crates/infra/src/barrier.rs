//! The barrier: every outbound connection a bounded context holds towards
//! remote event horizons.

use std::sync::Arc;

use tracing::info;

use relativity_events::{CommittedEventStream, EventBus};

use crate::config::ConnectionConfig;
use crate::connection::Connection;

/// Owns one `Connection` per remote horizon. Connections share the consumer
/// bus and nothing else.
#[derive(Debug)]
pub struct Barrier<B> {
    consumer: B,
    connections: Vec<Connection>,
}

impl<B> Barrier<B>
where
    B: EventBus<Arc<CommittedEventStream>> + Clone + 'static,
{
    pub fn new(consumer: B) -> Self {
        Self {
            consumer,
            connections: Vec::new(),
        }
    }

    /// Open a connection towards another horizon.
    pub fn penetrate(&mut self, config: ConnectionConfig) -> &Connection {
        info!(
            remote = %config.remote,
            events = config.interest.len(),
            "penetrating barrier towards event horizon"
        );
        self.connections.push(Connection::open(config, self.consumer.clone()));
        let index = self.connections.len() - 1;
        &self.connections[index]
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every connection. All are asked to stop before any is awaited.
    pub async fn close(self) {
        for connection in &self.connections {
            connection.request_close();
        }
        for connection in self.connections {
            connection.close().await;
        }
    }
}
