//! Subscription predicate: which committed streams a subscriber wants.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use relativity_core::{DomainError, EventArtifact};

use crate::CommittedEventStream;

/// How an event's generation is compared against a declared interest.
///
/// A consumer's view binds one logical type to one generation, so `Exact` is
/// the default.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GenerationMatch {
    /// Event generation must equal the declared generation.
    #[default]
    Exact,
    /// Event generation must be equal to or newer than the declared one.
    AtLeast,
    /// Generation is ignored; any event of the declared kind matches.
    AnyGeneration,
}

impl GenerationMatch {
    pub fn matches(self, declared: &EventArtifact, event: &EventArtifact) -> bool {
        if !declared.is_same_kind_as(event) {
            return false;
        }
        match self {
            GenerationMatch::Exact => declared.generation() == event.generation(),
            GenerationMatch::AtLeast => event.generation() >= declared.generation(),
            GenerationMatch::AnyGeneration => true,
        }
    }
}

impl FromStr for GenerationMatch {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(GenerationMatch::Exact),
            "at-least" | "at_least" | "atleast" => Ok(GenerationMatch::AtLeast),
            "any" | "any-generation" => Ok(GenerationMatch::AnyGeneration),
            other => Err(DomainError::validation(format!(
                "unknown generation match policy `{other}` (expected exact, at-least or any)"
            ))),
        }
    }
}

/// The event artifacts a subscriber declared when it opened its tunnel.
///
/// Kept sorted and de-duplicated; never changes for the lifetime of a tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InterestSet(Vec<EventArtifact>);

impl InterestSet {
    pub fn new(artifacts: impl IntoIterator<Item = EventArtifact>) -> Self {
        let mut artifacts: Vec<_> = artifacts.into_iter().collect();
        artifacts.sort();
        artifacts.dedup();
        Self(artifacts)
    }

    pub fn artifacts(&self) -> &[EventArtifact] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether a single event artifact is covered by this set.
    pub fn covers(&self, artifact: &EventArtifact, policy: GenerationMatch) -> bool {
        self.0.iter().any(|declared| policy.matches(declared, artifact))
    }

    /// True iff at least one event in `stream` is covered by this set.
    ///
    /// Pure: reads both sides only, so it can run for many subscribers
    /// against the same stream concurrently.
    pub fn can_receive(&self, stream: &CommittedEventStream, policy: GenerationMatch) -> bool {
        stream.artifacts().any(|artifact| self.covers(&artifact, policy))
    }
}

impl FromIterator<EventArtifact> for InterestSet {
    fn from_iter<T: IntoIterator<Item = EventArtifact>>(iter: T) -> Self {
        Self::new(iter)
    }
}
