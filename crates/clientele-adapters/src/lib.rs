//! Endpoint payload normalization: envelope decoding + per-kind record adapters.

use clientele_core::{Client, EndpointKind, ExternalId, Message, Opportunity};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "clientele-adapters";

/// Outer JSON shapes a dashboard endpoint may wrap its records in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope {
    /// `[ {...}, {...} ]`
    BareArray,
    /// `{ "data": [ {...}, {...} ] }`
    DataField,
}

impl Envelope {
    /// Decoders are tried in this order; the first that succeeds wins.
    pub const ORDERED: [Envelope; 2] = [Envelope::BareArray, Envelope::DataField];

    fn likely_for(text: &str) -> Envelope {
        if text.trim_start().starts_with('{') {
            Envelope::DataField
        } else {
            Envelope::BareArray
        }
    }

    fn decode<R: EndpointRecord>(self, text: &str) -> Result<Vec<R>, serde_json::Error> {
        let objects = match self {
            Envelope::BareArray => serde_json::from_str::<Vec<JsonValue>>(text)?,
            Envelope::DataField => {
                #[derive(Deserialize)]
                struct DataEnvelope {
                    data: Vec<JsonValue>,
                }
                serde_json::from_str::<DataEnvelope>(text)?.data
            }
        };
        objects.into_iter().map(R::from_raw).collect()
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("{kind} payload matched no accepted envelope: {source}")]
    UnrecognizedShape {
        kind: EndpointKind,
        #[source]
        source: serde_json::Error,
    },
}

/// A record kind that can be decoded from a single upstream JSON object.
pub trait EndpointRecord: Sized {
    const KIND: EndpointKind;

    fn from_raw(raw: JsonValue) -> Result<Self, serde_json::Error>;
}

fn decode_fields<T: DeserializeOwned>(raw: &JsonValue) -> Result<T, serde_json::Error> {
    T::deserialize(raw)
}

#[derive(Deserialize)]
struct ClientFields {
    id: ExternalId,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct MessageFields {
    id: ExternalId,
    client_id: ExternalId,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Deserialize)]
struct OpportunityFields {
    id: ExternalId,
    client_id: ExternalId,
}

impl EndpointRecord for Client {
    const KIND: EndpointKind = EndpointKind::Clients;

    fn from_raw(raw: JsonValue) -> Result<Self, serde_json::Error> {
        let fields: ClientFields = decode_fields(&raw)?;
        Ok(Client {
            external_id: fields.id,
            name: fields.name,
            raw,
        })
    }
}

impl EndpointRecord for Message {
    const KIND: EndpointKind = EndpointKind::Messages;

    fn from_raw(raw: JsonValue) -> Result<Self, serde_json::Error> {
        let fields: MessageFields = decode_fields(&raw)?;
        Ok(Message {
            external_id: fields.id,
            client_external_id: fields.client_id,
            body: fields.body,
            raw,
        })
    }
}

impl EndpointRecord for Opportunity {
    const KIND: EndpointKind = EndpointKind::Opportunities;

    fn from_raw(raw: JsonValue) -> Result<Self, serde_json::Error> {
        let fields: OpportunityFields = decode_fields(&raw)?;
        Ok(Opportunity {
            external_id: fields.id,
            client_external_id: fields.client_id,
            raw,
        })
    }
}

/// Decode an endpoint body into records of kind `R`.
///
/// Empty bodies yield no records. Any record failing to decode rejects the whole payload.
pub fn normalize<R: EndpointRecord>(text: &str) -> Result<Vec<R>, NormalizeError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    // Report the failure of the envelope the body looks like, not of whichever ran first.
    let likely = Envelope::likely_for(text);
    let mut reported = None;
    for envelope in Envelope::ORDERED {
        match envelope.decode::<R>(text) {
            Ok(records) => return Ok(records),
            Err(err) => {
                if envelope == likely || reported.is_none() {
                    reported = Some(err);
                }
            }
        }
    }

    Err(NormalizeError::UnrecognizedShape {
        kind: R::KIND,
        source: reported.unwrap_or_else(|| {
            serde_json::Error::io(std::io::Error::other("no envelope decoders configured"))
        }),
    })
}
