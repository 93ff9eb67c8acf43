//! End-to-end tests: a real horizon on an ephemeral port, real connections.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relativity_core::{ApplicationId, BoundedContextId, EventArtifact};
use relativity_events::{EventBus, EventHorizonIngress, InMemoryEventBus, InterestSet};
use relativity_infra::wire::{ClientCodec, ClientMessage, OpenTunnelMessage, ServerMessage};
use relativity_infra::{
    Connection, ConnectionState, EventHorizon, HorizonConfig, HorizonError, Singularity,
    StreamTunnel,
};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use common::*;

fn ephemeral() -> HorizonConfig {
    HorizonConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        delivery_timeout: Duration::from_millis(500),
        ..HorizonConfig::default()
    }
}

/// A subscriber that completes the handshake and then never reads.
async fn stalled_subscriber(
    horizon: &EventHorizon,
    interest: EventArtifact,
) -> (Framed<TcpStream, ClientCodec>, BoundedContextId) {
    let socket = TcpStream::connect(horizon.local_addr()).await.unwrap();
    let mut framed = Framed::new(socket, ClientCodec::new());
    let bounded_context = BoundedContextId::new();
    let open = OpenTunnelMessage::new(ApplicationId::new(), bounded_context, &InterestSet::new([interest]));
    framed.send(ClientMessage::OpenTunnel(open)).await.unwrap();
    assert!(matches!(framed.next().await, Some(Ok(ServerMessage::TunnelOpened))));
    (framed, bounded_context)
}

/// Queue far more than the socket buffers hold, so the writer blocks.
async fn flood(horizon: &EventHorizon, interest: EventArtifact) {
    for n in 1..=40 {
        let report = horizon.publish(bulky_stream(n, interest, 1 << 20)).await;
        assert_eq!(report.delivered, 1, "stream {n} not queued");
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
}

async fn wait_for_subscribers(horizon: &EventHorizon, count: usize) {
    tokio::time::timeout(WAIT, async {
        while horizon.registry().len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber count never settled");
}

#[tokio::test]
async fn matching_streams_cross_the_horizon_in_order() {
    init_tracing();
    let horizon = EventHorizon::start(ephemeral()).await.unwrap();
    let x2 = artifact(2);
    let y2 = artifact(2);

    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let received = bus.subscribe();
    let connection = Connection::open(connection_config(horizon.local_addr().to_string(), &[x2]), bus.clone());
    wait_for_state(&connection, ConnectionState::Streaming).await;
    wait_for_subscribers(&horizon, 1).await;

    horizon.pass_through(stream(1, &[at_generation(x2, 1)]));
    horizon.pass_through(stream(2, &[x2]));
    horizon.pass_through(stream(3, &[y2]));
    horizon.pass_through(stream(4, &[y2, x2]));

    assert_eq!(next_stream(&received).await.sequence_number(), 2);
    let mixed = next_stream(&received).await;
    assert_eq!(mixed.sequence_number(), 4);
    assert_eq!(mixed.len(), 2, "streams are delivered whole");
    assert_quiet(&received).await;

    connection.close().await;
    horizon.shutdown().await;
}

#[tokio::test]
async fn each_subscriber_only_sees_its_interest() {
    init_tracing();
    let horizon = EventHorizon::start(ephemeral()).await.unwrap();
    let orders = artifact(1);
    let invoices = artifact(1);

    let order_bus: Bus = Arc::new(InMemoryEventBus::new());
    let invoice_bus: Bus = Arc::new(InMemoryEventBus::new());
    let order_events = order_bus.subscribe();
    let invoice_events = invoice_bus.subscribe();
    let addr = horizon.local_addr().to_string();
    let a = Connection::open(connection_config(addr.clone(), &[orders]), order_bus);
    let b = Connection::open(connection_config(addr, &[invoices]), invoice_bus);
    wait_for_state(&a, ConnectionState::Streaming).await;
    wait_for_state(&b, ConnectionState::Streaming).await;
    wait_for_subscribers(&horizon, 2).await;

    let report = horizon.publish(stream(1, &[orders])).await;
    assert_eq!((report.registered, report.matched, report.delivered), (2, 1, 1));
    EventHorizonIngress::pass_through(&horizon, stream(2, &[invoices]));

    assert_eq!(next_stream(&order_events).await.sequence_number(), 1);
    assert_eq!(next_stream(&invoice_events).await.sequence_number(), 2);
    assert_quiet(&order_events).await;
    assert_quiet(&invoice_events).await;

    a.close().await;
    b.close().await;
    horizon.shutdown().await;
}

#[tokio::test]
async fn closing_a_connection_evicts_its_singularity() {
    init_tracing();
    let horizon = EventHorizon::start(ephemeral()).await.unwrap();
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let connection = Connection::open(connection_config(horizon.local_addr().to_string(), &[artifact(1)]), bus);
    wait_for_state(&connection, ConnectionState::Streaming).await;
    wait_for_subscribers(&horizon, 1).await;

    connection.close().await;

    wait_for_subscribers(&horizon, 0).await;
    horizon.shutdown().await;
}

#[tokio::test]
async fn collapse_closes_the_tunnel_and_the_client_reconnects() {
    init_tracing();
    let horizon = EventHorizon::start(ephemeral()).await.unwrap();
    let interest = artifact(1);
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let received = bus.subscribe();
    let config = connection_config(horizon.local_addr().to_string(), &[interest]);
    let bounded_context = config.bounded_context;
    let connection = Connection::open(config, bus);
    wait_for_state(&connection, ConnectionState::Streaming).await;
    wait_for_subscribers(&horizon, 1).await;

    let handles = horizon.registry().handles_of(bounded_context);
    assert_eq!(handles.len(), 1);
    assert!(horizon.collapse(&handles[0]));
    assert!(!horizon.collapse(&handles[0]), "collapsing twice is a no-op");

    // The client notices the closed stream, backs off and opens a fresh tunnel.
    tokio::time::timeout(WAIT, async {
        while connection.attempts() < 2 || horizon.registry().len() != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection never re-established");
    wait_for_state(&connection, ConnectionState::Streaming).await;

    horizon.pass_through(stream(7, &[interest]));
    assert_eq!(next_stream(&received).await.sequence_number(), 7);

    connection.close().await;
    horizon.shutdown().await;
}

#[tokio::test]
async fn administrative_registration_is_idempotent() {
    let horizon = EventHorizon::start(ephemeral()).await.unwrap();
    let interest = artifact(1);
    let (tunnel, mut outbound) = StreamTunnel::channel(4);
    let tunnel = Arc::new(tunnel);
    let subscriber = || {
        Singularity::new(
            ApplicationId::new(),
            BoundedContextId::new(),
            InterestSet::new([interest]),
            tunnel.clone(),
        )
    };

    let first = horizon.gravitate_towards(subscriber());
    let second = horizon.gravitate_towards(subscriber());
    assert_eq!(first, second);
    assert_eq!(horizon.registry().len(), 1);

    let report = horizon.publish(stream(1, &[interest])).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(outbound.recv().await.unwrap().sequence_number(), 1);

    assert!(horizon.collapse(&first));
    assert!(horizon.registry().is_empty());
    horizon.shutdown().await;
}

#[tokio::test]
async fn shutdown_moves_connected_clients_to_backoff() {
    init_tracing();
    let horizon = EventHorizon::start(ephemeral()).await.unwrap();
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let connection = Connection::open(connection_config(horizon.local_addr().to_string(), &[artifact(1)]), bus);
    wait_for_state(&connection, ConnectionState::Streaming).await;

    let mut states = connection.subscribe_state();
    horizon.shutdown().await;

    tokio::time::timeout(WAIT, states.wait_for(|s| *s != ConnectionState::Streaming))
        .await
        .expect("connection never noticed the shutdown")
        .unwrap();
    connection.close().await;
}

#[tokio::test]
async fn rejected_handshake_creates_no_singularity() {
    init_tracing();
    let horizon = EventHorizon::start(ephemeral()).await.unwrap();

    let socket = TcpStream::connect(horizon.local_addr()).await.unwrap();
    let mut framed = Framed::new(socket, ClientCodec::new());
    let open = OpenTunnelMessage::new(ApplicationId::new(), BoundedContextId::new(), &InterestSet::default());
    framed.send(ClientMessage::OpenTunnel(open)).await.unwrap();

    match framed.next().await {
        Some(Ok(ServerMessage::TunnelRejected { reason })) => assert!(reason.contains("no events")),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(framed.next().await.is_none(), "rejected tunnel must be closed");
    assert!(horizon.registry().is_empty());

    horizon.shutdown().await;
}

#[tokio::test]
async fn binding_an_occupied_port_is_a_hard_error() {
    let first = EventHorizon::start(ephemeral()).await.unwrap();
    let taken = HorizonConfig {
        listen_addr: first.local_addr(),
        ..ephemeral()
    };

    match EventHorizon::start(taken).await {
        Err(HorizonError::Bind { addr, .. }) => assert_eq!(addr, first.local_addr()),
        Ok(_) => panic!("second horizon bound an occupied port"),
        Err(other) => panic!("unexpected error: {other}"),
    }
    first.shutdown().await;
}

#[tokio::test]
async fn shutdown_releases_the_listening_port() {
    let horizon = EventHorizon::start(ephemeral()).await.unwrap();
    let addr = horizon.local_addr();
    horizon.shutdown().await;

    let again = EventHorizon::start(HorizonConfig {
        listen_addr: addr,
        ..ephemeral()
    })
    .await
    .expect("port should be free after shutdown");
    again.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_not_held_up_by_a_subscriber_that_stopped_reading() {
    init_tracing();
    let horizon = EventHorizon::start(HorizonConfig {
        delivery_timeout: Duration::from_secs(60),
        ..ephemeral()
    })
    .await
    .unwrap();
    let interest = artifact(1);
    let (_client, _) = stalled_subscriber(&horizon, interest).await;
    flood(&horizon, interest).await;

    tokio::time::timeout(WAIT, horizon.shutdown())
        .await
        .expect("shutdown waited on a blocked socket write");
}

#[tokio::test]
async fn collapse_closes_the_socket_of_a_subscriber_that_stopped_reading() {
    init_tracing();
    let horizon = EventHorizon::start(HorizonConfig {
        delivery_timeout: Duration::from_secs(60),
        ..ephemeral()
    })
    .await
    .unwrap();
    let interest = artifact(1);
    let (mut client, bounded_context) = stalled_subscriber(&horizon, interest).await;
    flood(&horizon, interest).await;

    let handles = horizon.registry().handles_of(bounded_context);
    assert_eq!(handles.len(), 1);
    assert!(horizon.collapse(&handles[0]));

    // Whatever was already written drains, then the stream ends.
    tokio::time::timeout(WAIT, async {
        while let Some(Ok(_)) = client.next().await {}
    })
    .await
    .expect("collapsed tunnel left its socket open");
    assert!(horizon.registry().is_empty());

    tokio::time::timeout(WAIT, horizon.shutdown()).await.expect("shutdown hung");
}

#[tokio::test]
async fn a_write_that_never_completes_ends_the_tunnel() {
    init_tracing();
    let horizon = EventHorizon::start(ephemeral()).await.unwrap();
    let interest = artifact(1);
    let (_client, _) = stalled_subscriber(&horizon, interest).await;
    flood(&horizon, interest).await;

    wait_for_subscribers(&horizon, 0).await;
    horizon.shutdown().await;
}
