//! Singularity registry: the set of connected subscribers and fan-out delivery.
//!
//! The active set sits behind a mutex that is held only to mutate it or to
//! take a snapshot of the matching entries. Deliveries run after the lock is
//! released, each in its own task, so a slow subscriber never blocks
//! registration, eviction or its siblings.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use relativity_core::BoundedContextId;
use relativity_events::{CommittedEventStream, GenerationMatch};

use crate::singularity::{RegistrationHandle, Singularity};
use crate::tunnel::{DeliveryError, TunnelId};

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Singularities registered when the snapshot was taken.
    pub registered: usize,
    /// Singularities whose interest matched the stream.
    pub matched: usize,
    /// Successful deliveries.
    pub delivered: usize,
    /// Singularities evicted because their delivery failed.
    pub evicted: Vec<RegistrationHandle>,
}

#[derive(Debug)]
pub struct SingularityRegistry {
    singularities: Mutex<HashMap<TunnelId, Arc<Singularity>>>,
    policy: GenerationMatch,
    delivery_timeout: Duration,
}

impl SingularityRegistry {
    pub fn new(policy: GenerationMatch, delivery_timeout: Duration) -> Self {
        Self {
            singularities: Mutex::new(HashMap::new()),
            policy,
            delivery_timeout,
        }
    }

    pub fn policy(&self) -> GenerationMatch {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn contains(&self, handle: &RegistrationHandle) -> bool {
        self.entries().contains_key(&handle.tunnel_id())
    }

    /// Handles of every singularity registered for `bounded_context`, for
    /// administrative collapse.
    pub fn handles_of(&self, bounded_context: BoundedContextId) -> Vec<RegistrationHandle> {
        self.entries()
            .values()
            .filter(|s| s.bounded_context() == bounded_context)
            .map(|s| s.handle())
            .collect()
    }

    /// Add a singularity. A tunnel is only ever registered once; registering
    /// the same tunnel again returns the existing handle.
    pub fn register(&self, singularity: Singularity) -> RegistrationHandle {
        let handle = singularity.handle();
        let application = singularity.application();
        let bounded_context = singularity.bounded_context();

        let (inserted, subscribers) = {
            let mut entries = self.entries();
            let inserted = match entries.entry(handle.tunnel_id()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(singularity));
                    true
                }
            };
            (inserted, entries.len())
        };

        if inserted {
            info!(
                application = %application,
                bounded_context = %bounded_context,
                tunnel = %handle.tunnel_id(),
                subscribers,
                "singularity registered"
            );
        } else {
            debug!(tunnel = %handle.tunnel_id(), "tunnel already registered");
        }
        handle
    }

    /// Remove a singularity and collapse it. Returns `false` when it was not
    /// registered; that case has no other effect.
    pub fn evict(&self, handle: &RegistrationHandle) -> bool {
        let (removed, subscribers) = {
            let mut entries = self.entries();
            let removed = entries.remove(&handle.tunnel_id());
            (removed, entries.len())
        };

        match removed {
            Some(singularity) => {
                singularity.collapse();
                info!(
                    application = %singularity.application(),
                    bounded_context = %singularity.bounded_context(),
                    tunnel = %handle.tunnel_id(),
                    subscribers,
                    "singularity collapsed"
                );
                true
            }
            None => false,
        }
    }

    /// Deliver `stream` to every registered singularity that can receive it.
    ///
    /// Deliveries run concurrently, each bounded by the delivery timeout and
    /// isolated from the others. A failed delivery evicts its singularity;
    /// the stream is not retried.
    pub async fn publish(&self, stream: Arc<CommittedEventStream>) -> PublishReport {
        let (registered, targets) = {
            let entries = self.entries();
            let targets: Vec<Arc<Singularity>> = entries
                .values()
                .filter(|s| s.can_receive(&stream, self.policy))
                .cloned()
                .collect();
            (entries.len(), targets)
        };

        let mut report = PublishReport {
            registered,
            matched: targets.len(),
            ..PublishReport::default()
        };
        debug!(
            commit_id = %stream.commit_id(),
            registered,
            matched = report.matched,
            "passing committed events through singularities"
        );
        if targets.is_empty() {
            return report;
        }

        let mut deliveries = JoinSet::new();
        for singularity in targets {
            let stream = Arc::clone(&stream);
            let limit = self.delivery_timeout;
            deliveries.spawn(async move {
                let handle = singularity.handle();
                let attempt = tokio::time::timeout(limit, singularity.tunnel().deliver(stream));
                let outcome = match AssertUnwindSafe(attempt).catch_unwind().await {
                    Ok(Ok(delivered)) => delivered.map(|_| ()),
                    Ok(Err(_elapsed)) => Err(DeliveryError::TimedOut(limit)),
                    Err(_panic) => Err(DeliveryError::Panicked),
                };
                (handle, outcome)
            });
        }

        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.delivered += 1,
                Ok((handle, Err(error))) => {
                    warn!(
                        tunnel = %handle.tunnel_id(),
                        commit_id = %stream.commit_id(),
                        error = %error,
                        "delivery to singularity failed; collapsing it"
                    );
                    if self.evict(&handle) {
                        report.evicted.push(handle);
                    }
                }
                // Panics are caught inside the task; this is a runtime abort.
                Err(join_error) => warn!(error = %join_error, "delivery task did not complete"),
            }
        }

        report
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TunnelId, Arc<Singularity>>> {
        // The map stays consistent even if a holder panicked; keep serving.
        self.singularities.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
