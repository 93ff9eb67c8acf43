use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use relativity_core::{EventArtifact, EventSourceId};

/// A single event as it was committed to the store.
///
/// Notes:
/// - `artifact` carries the event kind and the generation it was written with.
/// - `version` is the position of the event within its event source.
/// - `payload` is opaque here; the serialization layer owns its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedEvent {
    event_id: Uuid,
    artifact: EventArtifact,
    event_source_id: EventSourceId,

    /// Monotonically increasing position in the event source stream.
    version: u64,

    occurred_at: DateTime<Utc>,
    payload: JsonValue,
}

impl CommittedEvent {
    pub fn new(
        event_id: Uuid,
        artifact: EventArtifact,
        event_source_id: EventSourceId,
        version: u64,
        occurred_at: DateTime<Utc>,
        payload: JsonValue,
    ) -> Self {
        Self {
            event_id,
            artifact,
            event_source_id,
            version,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn artifact(&self) -> EventArtifact {
        self.artifact
    }

    pub fn event_source_id(&self) -> EventSourceId {
        self.event_source_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }
}
