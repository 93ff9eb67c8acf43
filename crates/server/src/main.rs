use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use relativity_events::{EventBus, InMemoryEventBus};
use relativity_infra::{Barrier, ConnectionConfig, EventHorizon, HorizonConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relativity_observability::init();

    let config = HorizonConfig::from_env().context("invalid event horizon configuration")?;
    let remotes = ConnectionConfig::all_from_env().context("invalid remote horizon configuration")?;

    let horizon = EventHorizon::start(config).await?;
    tracing::info!("event horizon listening on {}", horizon.local_addr());

    let received = Arc::new(InMemoryEventBus::new());
    let subscription = received.subscribe();
    tokio::task::spawn_blocking(move || {
        loop {
            match subscription.recv_timeout(Duration::from_secs(1)) {
                Ok(stream) => tracing::info!(
                    commit_id = %stream.commit_id(),
                    application = %stream.application(),
                    bounded_context = %stream.bounded_context(),
                    events = stream.len(),
                    "committed event stream received from remote horizon"
                ),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    });

    let mut barrier = Barrier::new(received);
    for remote in remotes {
        barrier.penetrate(remote);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");

    barrier.close().await;
    horizon.shutdown().await;
    Ok(())
}
