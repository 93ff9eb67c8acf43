//! Event artifacts: an event kind plus the schema generation it was written with.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::ArtifactId;

/// Schema generation of an event kind.
///
/// Generations start at 1 and only ever grow when an event's shape is migrated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(u32);

impl Generation {
    pub const FIRST: Generation = Generation(1);

    pub fn new(value: u32) -> DomainResult<Self> {
        if value == 0 {
            return Err(DomainError::invalid_generation("generation must be at least 1"));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Generation 0 only shows up when decoding data from a misbehaving peer.
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::FIRST
    }
}

impl core::fmt::Display for Generation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// One event kind at one generation.
///
/// Equality is by `(id, generation)`; the same event kind at two generations
/// is two distinct artifacts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventArtifact {
    id: ArtifactId,
    generation: Generation,
}

impl EventArtifact {
    pub fn new(id: ArtifactId, generation: Generation) -> Self {
        Self { id, generation }
    }

    pub fn id(&self) -> ArtifactId {
        self.id
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Same event kind, ignoring generation.
    pub fn is_same_kind_as(&self, other: &EventArtifact) -> bool {
        self.id == other.id
    }
}

impl core::fmt::Display for EventArtifact {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.id, self.generation)
    }
}

/// Parses the `artifact-uuid:generation` notation used in configuration.
impl FromStr for EventArtifact {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, generation) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| DomainError::validation(format!("expected `artifact:generation`, got `{s}`")))?;
        let id = ArtifactId::from_str(id)?;
        let generation = generation
            .parse::<u32>()
            .map_err(|e| DomainError::invalid_generation(format!("{generation}: {e}")))?;
        Ok(Self::new(id, Generation::new(generation)?))
    }
}
