use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use relativity_core::{ApplicationId, BoundedContextId};
use relativity_events::{CommittedEventStream, GenerationMatch, InterestSet};

use crate::tunnel::{Tunnel, TunnelId};

/// Handle to a registered singularity; identifies it by its tunnel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationHandle(TunnelId);

impl RegistrationHandle {
    pub fn tunnel_id(&self) -> TunnelId {
        self.0
    }
}

/// A remote subscriber: who it is, what it wants, and the tunnel to reach it.
///
/// Collapsing a singularity (eviction from the registry) fires its collapse
/// token so the connection serving the tunnel shuts down as well.
pub struct Singularity {
    application: ApplicationId,
    bounded_context: BoundedContextId,
    interest: InterestSet,
    tunnel: Arc<dyn Tunnel>,
    collapse: CancellationToken,
}

impl Singularity {
    pub fn new(
        application: ApplicationId,
        bounded_context: BoundedContextId,
        interest: InterestSet,
        tunnel: Arc<dyn Tunnel>,
    ) -> Self {
        Self {
            application,
            bounded_context,
            interest,
            tunnel,
            collapse: CancellationToken::new(),
        }
    }

    pub fn application(&self) -> ApplicationId {
        self.application
    }

    pub fn bounded_context(&self) -> BoundedContextId {
        self.bounded_context
    }

    pub fn interest(&self) -> &InterestSet {
        &self.interest
    }

    pub fn tunnel(&self) -> &Arc<dyn Tunnel> {
        &self.tunnel
    }

    pub fn handle(&self) -> RegistrationHandle {
        RegistrationHandle(self.tunnel.id())
    }

    pub fn can_receive(&self, stream: &CommittedEventStream, policy: GenerationMatch) -> bool {
        self.interest.can_receive(stream, policy)
    }

    /// Token cancelled once this singularity has been collapsed.
    pub fn collapse_token(&self) -> CancellationToken {
        self.collapse.clone()
    }

    pub fn is_collapsed(&self) -> bool {
        self.collapse.is_cancelled()
    }

    pub(crate) fn collapse(&self) {
        self.collapse.cancel();
    }
}

impl core::fmt::Debug for Singularity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Singularity")
            .field("application", &self.application)
            .field("bounded_context", &self.bounded_context)
            .field("interest", &self.interest)
            .field("tunnel", &self.tunnel.id())
            .field("collapsed", &self.is_collapsed())
            .finish()
    }
}
