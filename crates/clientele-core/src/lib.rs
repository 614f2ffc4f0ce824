//! Core domain records and fetch hand-off types for the clientele sync agent.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "clientele-core";

/// Identifier assigned by the upstream dashboard. The only key trusted for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExternalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ExternalId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl<'de> Deserialize<'de> for ExternalId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Text(String),
            Number(serde_json::Number),
        }

        match Wire::deserialize(deserializer)? {
            Wire::Text(text) => Ok(Self(text)),
            Wire::Number(number) => Ok(Self(number.to_string())),
        }
    }
}

/// The three dashboard endpoints, in the order they must be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Clients,
    Messages,
    Opportunities,
}

impl EndpointKind {
    /// Clients first: ownership of messages and opportunities resolves against them.
    pub const ORDERED: [EndpointKind; 3] = [
        EndpointKind::Clients,
        EndpointKind::Messages,
        EndpointKind::Opportunities,
    ];

    pub fn label(self) -> &'static str {
        match self {
            EndpointKind::Clients => "clients",
            EndpointKind::Messages => "messages",
            EndpointKind::Opportunities => "opportunities",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub external_id: ExternalId,
    pub name: Option<String>,
    /// Full upstream object, unknown fields included.
    pub raw: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub external_id: ExternalId,
    pub client_external_id: ExternalId,
    pub body: Option<String>,
    pub raw: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub external_id: ExternalId,
    pub client_external_id: ExternalId,
    pub raw: JsonValue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    pub clients: usize,
    pub messages: usize,
    pub opportunities: usize,
}

/// Everything one session produced, handed from the fetch phase to the writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub fetched_at: DateTime<Utc>,
    pub clients: Vec<Client>,
    pub messages: Vec<Message>,
    pub opportunities: Vec<Opportunity>,
    /// One entry per endpoint or parse failure, in the order encountered.
    pub errors: Vec<String>,
}

impl Default for FetchResult {
    fn default() -> Self {
        Self::empty(Utc::now())
    }
}

impl FetchResult {
    pub fn empty(fetched_at: DateTime<Utc>) -> Self {
        Self {
            fetched_at,
            clients: Vec::new(),
            messages: Vec::new(),
            opportunities: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn record_counts(&self) -> RecordCounts {
        RecordCounts {
            clients: self.clients.len(),
            messages: self.messages.len(),
            opportunities: self.opportunities.len(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}
