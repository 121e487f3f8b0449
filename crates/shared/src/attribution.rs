//! Attribution identities
//!
//! Every billable entity is identified by a single token of the form
//! `user:<id>` (an individual) or `team:<id>` (an organization).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The kind of entity usage is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A single user account
    Individual,
    /// A team; billing responsibility sits with its owners
    Organization,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Individual => "user",
            EntityKind::Organization => "team",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseAttributionIdError {
    #[error("attribution id `{0}` must have the form <entity>:<id>")]
    Malformed(String),

    #[error("unknown attribution entity `{0}`")]
    UnknownEntity(String),

    #[error("attribution id `{0}` has an empty entity id")]
    EmptyId(String),
}

/// Identity of a billable entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AttributionId {
    kind: EntityKind,
    id: String,
}

impl AttributionId {
    pub fn individual(user_id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Individual,
            id: user_id.into(),
        }
    }

    pub fn organization(team_id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Organization,
            id: team_id.into(),
        }
    }

    /// Parse a serialized attribution token.
    ///
    /// Never panics; anything other than exactly `user:<id>` or `team:<id>`
    /// with a non-empty id is rejected.
    pub fn parse(token: &str) -> Result<Self, ParseAttributionIdError> {
        let mut parts = token.split(':');
        let (entity, id) = match (parts.next(), parts.next(), parts.next()) {
            (Some(entity), Some(id), None) => (entity, id),
            _ => return Err(ParseAttributionIdError::Malformed(token.to_string())),
        };

        let kind = match entity {
            "user" => EntityKind::Individual,
            "team" => EntityKind::Organization,
            other => return Err(ParseAttributionIdError::UnknownEntity(other.to_string())),
        };

        if id.trim().is_empty() {
            return Err(ParseAttributionIdError::EmptyId(token.to_string()));
        }

        Ok(Self {
            kind,
            id: id.to_string(),
        })
    }

    /// Entity kind and raw entity id
    pub fn values(&self) -> (EntityKind, &str) {
        (self.kind, &self.id)
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn entity_id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for AttributionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

impl FromStr for AttributionId {
    type Err = ParseAttributionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AttributionId {
    type Error = ParseAttributionIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AttributionId> for String {
    fn from(value: AttributionId) -> Self {
        value.to_string()
    }
}
