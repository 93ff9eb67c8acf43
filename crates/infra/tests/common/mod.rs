#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use relativity_core::{
    ApplicationId, ArtifactId, BoundedContextId, CommitId, CorrelationId, EventArtifact,
    EventSourceId, Generation,
};
use relativity_events::{CommittedEvent, CommittedEventStream, InMemoryEventBus, InterestSet, Subscription};
use relativity_infra::{Connection, ConnectionConfig, ConnectionState};
use uuid::Uuid;

pub type Bus = Arc<InMemoryEventBus>;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

pub fn artifact(generation: u32) -> EventArtifact {
    EventArtifact::new(ArtifactId::new(), Generation::new(generation).unwrap())
}

pub fn at_generation(artifact: EventArtifact, generation: u32) -> EventArtifact {
    EventArtifact::new(artifact.id(), Generation::new(generation).unwrap())
}

pub fn stream(sequence_number: u64, artifacts: &[EventArtifact]) -> CommittedEventStream {
    let source = EventSourceId::new();
    let events = artifacts
        .iter()
        .enumerate()
        .map(|(i, a)| {
            CommittedEvent::new(
                Uuid::now_v7(),
                *a,
                source,
                i as u64 + 1,
                Utc::now(),
                serde_json::json!({ "sequence": sequence_number }),
            )
        })
        .collect();
    CommittedEventStream::new(
        CommitId::new(),
        sequence_number,
        ApplicationId::new(),
        BoundedContextId::new(),
        CorrelationId::new(),
        events,
    )
}

/// A single-event stream whose payload is roughly `bytes` long.
pub fn bulky_stream(sequence_number: u64, artifact: EventArtifact, bytes: usize) -> CommittedEventStream {
    let event = CommittedEvent::new(
        Uuid::now_v7(),
        artifact,
        EventSourceId::new(),
        1,
        Utc::now(),
        serde_json::json!({ "sequence": sequence_number, "filler": "x".repeat(bytes) }),
    );
    CommittedEventStream::new(
        CommitId::new(),
        sequence_number,
        ApplicationId::new(),
        BoundedContextId::new(),
        CorrelationId::new(),
        vec![event],
    )
}

pub fn connection_config(remote: impl Into<String>, interest: &[EventArtifact]) -> ConnectionConfig {
    ConnectionConfig::new(
        ApplicationId::new(),
        BoundedContextId::new(),
        remote,
        InterestSet::new(interest.iter().copied()),
    )
    .with_reconnect_delay(Duration::from_millis(50))
    .with_connect_timeout(Duration::from_secs(1))
    .with_handshake_timeout(Duration::from_secs(1))
}

pub async fn wait_for_state(connection: &Connection, target: ConnectionState) {
    let mut states = connection.subscribe_state();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("connection never reached {target:?}"))
        .expect("connection state channel closed");
}

/// Poll a subscription without blocking the runtime.
pub async fn next_stream(subscription: &Subscription<Arc<CommittedEventStream>>) -> Arc<CommittedEventStream> {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Ok(stream) = subscription.try_recv() {
            return stream;
        }
        assert!(Instant::now() < deadline, "no committed event stream arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Assert nothing arrives within a short grace period.
pub async fn assert_quiet(subscription: &Subscription<Arc<CommittedEventStream>>) {
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(subscription.try_recv().is_err(), "unexpected committed event stream");
}
