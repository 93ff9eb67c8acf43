use serde::{Deserialize, Serialize};

use relativity_core::{ApplicationId, BoundedContextId, CommitId, CorrelationId, EventArtifact};

use crate::CommittedEvent;

/// The ordered batch of events produced by one write in one bounded context.
///
/// A stream is immutable once built and is always delivered as a whole: the
/// horizon never splits it per subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedEventStream {
    commit_id: CommitId,

    /// Position of the commit in the originating store.
    sequence_number: u64,

    application: ApplicationId,
    bounded_context: BoundedContextId,
    correlation_id: CorrelationId,
    events: Vec<CommittedEvent>,
}

impl CommittedEventStream {
    pub fn new(
        commit_id: CommitId,
        sequence_number: u64,
        application: ApplicationId,
        bounded_context: BoundedContextId,
        correlation_id: CorrelationId,
        events: Vec<CommittedEvent>,
    ) -> Self {
        Self {
            commit_id,
            sequence_number,
            application,
            bounded_context,
            correlation_id,
            events,
        }
    }

    pub fn commit_id(&self) -> CommitId {
        self.commit_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn application(&self) -> ApplicationId {
        self.application
    }

    pub fn bounded_context(&self) -> BoundedContextId {
        self.bounded_context
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn events(&self) -> &[CommittedEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Artifacts of the contained events, in commit order (duplicates included).
    pub fn artifacts(&self) -> impl Iterator<Item = EventArtifact> + '_ {
        self.events.iter().map(CommittedEvent::artifact)
    }
}
