//! Entity ID type representing a domain.object_id pair

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for invalid entity IDs
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntityIdError {
    #[error("entity id must contain exactly one '.' separator")]
    InvalidFormat,

    #[error("domain cannot be empty")]
    EmptyDomain,

    #[error("object_id cannot be empty")]
    EmptyObjectId,
}

/// An entity identifier of the form `domain.object_id` (e.g. "light.kitchen")
///
/// The remote service owns entity naming policy; the agent only requires the
/// structural split into a non-empty domain and object_id. The identifier is
/// stored in its canonical string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    full: String,
    sep: usize,
}

impl EntityId {
    /// Create a new EntityId from domain and object_id parts
    pub fn new(
        domain: impl AsRef<str>,
        object_id: impl AsRef<str>,
    ) -> Result<Self, EntityIdError> {
        format!("{}.{}", domain.as_ref(), object_id.as_ref()).parse()
    }

    /// The domain segment (e.g. "light")
    pub fn domain(&self) -> &str {
        &self.full[..self.sep]
    }

    /// The object_id segment (e.g. "kitchen")
    pub fn object_id(&self) -> &str {
        &self.full[self.sep + 1..]
    }

    /// The full identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut dots = s.match_indices('.');
        let sep = match (dots.next(), dots.next()) {
            (Some((idx, _)), None) => idx,
            _ => return Err(EntityIdError::InvalidFormat),
        };
        if sep == 0 {
            return Err(EntityIdError::EmptyDomain);
        }
        if sep + 1 == s.len() {
            return Err(EntityIdError::EmptyObjectId);
        }
        Ok(Self {
            full: s.to_string(),
            sep,
        })
    }
}

impl TryFrom<String> for EntityId {
    type Error = EntityIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> String {
        id.full
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}
