use crate::CommittedEventStream;

/// Ingress into an event horizon, called by the event store after a commit.
///
/// Delivery is best-effort: implementations absorb and log failures instead of
/// handing them back to the store, whose commit has already succeeded.
pub trait EventHorizonIngress: Send + Sync {
    fn pass_through(&self, stream: CommittedEventStream);
}

impl<T> EventHorizonIngress for std::sync::Arc<T>
where
    T: EventHorizonIngress + ?Sized,
{
    fn pass_through(&self, stream: CommittedEventStream) {
        (**self).pass_through(stream)
    }
}
