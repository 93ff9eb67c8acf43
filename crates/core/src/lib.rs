//! `relativity-core` — identity and artifact primitives shared by both sides
//! of an event horizon.
//!
//! Nothing in here touches IO; identifiers are opaque values supplied by the
//! owning application.

pub mod artifact;
pub mod error;
pub mod id;

pub use artifact::{EventArtifact, Generation};
pub use error::{DomainError, DomainResult};
pub use id::{ApplicationId, ArtifactId, BoundedContextId, CommitId, CorrelationId, EventSourceId};
