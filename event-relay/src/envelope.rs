//! Decoding of push-delivered envelopes into events.
//!
//! The upstream broker POSTs a JSON envelope whose `message.data` field holds
//! the base64 encoded event document. Decoding is a pure transform: either the
//! whole event comes out or an [`EnvelopeError`] does.

use crate::errors::EnvelopeError;
use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Standard alphabet, accepting data with or without trailing padding.
const DATA_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Outer body of a push delivery.
#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    pub message: Option<PushMessage>,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub data: Option<String>,
    #[serde(default, alias = "message_id")]
    pub message_id: Option<String>,
    #[serde(default, alias = "publish_time")]
    pub publish_time: Option<String>,
    #[serde(default)]
    pub attributes: Option<HashMap<String, String>>,
}

/// Producer supplied timestamp, either textual or a unix seconds number.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CreatedTime {
    Text(String),
    Unix(serde_json::Number),
}

impl fmt::Display for CreatedTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreatedTime::Text(text) => f.write_str(text),
            CreatedTime::Unix(number) => write!(f, "{number}"),
        }
    }
}

/// Trace propagation headers and identity fields attached by the producer.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Carrier {
    #[serde(default)]
    pub traceparent: Option<String>,
    #[serde(default)]
    pub tracestate: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Carrier {
    /// Returns the first string valued identity field, if any.
    pub fn identity(&self) -> Option<&str> {
        ["uid", "user_id", "userId"]
            .iter()
            .find_map(|key| self.fields.get(*key).and_then(Value::as_str))
            .filter(|id| !id.is_empty())
    }
}

/// The decoded payload of a push message.
///
/// Field presence is checked later, when the record is built for the
/// warehouse; here only the JSON types of known fields are enforced.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub created_time: Option<CreatedTime>,
    #[serde(default = "empty_context")]
    pub event_context: Value,
    #[serde(default, deserialize_with = "lenient_carrier")]
    pub carrier: Option<Carrier>,
}

fn empty_context() -> Value {
    Value::Object(Map::new())
}

// A carrier that is not an object must not fail the request.
fn lenient_carrier<'de, D>(deserializer: D) -> Result<Option<Carrier>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .filter(Value::is_object)
        .and_then(|v| serde_json::from_value(v).ok()))
}

/// An event together with the delivery metadata it arrived with.
#[derive(Debug)]
pub struct DecodedMessage {
    pub event: Event,
    pub message_id: Option<String>,
    pub publish_time: Option<String>,
    pub subscription: Option<String>,
    pub attributes: HashMap<String, String>,
}

/// Decodes a raw push request body.
///
/// The envelope, `message` and the decoded event must all be JSON objects.
pub fn decode(body: &[u8]) -> Result<DecodedMessage, EnvelopeError> {
    let body: Value = serde_json::from_slice(body).map_err(EnvelopeError::InvalidJson)?;
    let Value::Object(fields) = &body else {
        return Err(EnvelopeError::NotAnObject("envelope"));
    };
    match fields.get("message") {
        None | Some(Value::Null) => return Err(EnvelopeError::MissingData),
        Some(Value::Object(_)) => {}
        Some(_) => return Err(EnvelopeError::NotAnObject("message")),
    }

    let envelope: PushEnvelope =
        serde_json::from_value(body).map_err(EnvelopeError::InvalidJson)?;
    let message = envelope.message.ok_or(EnvelopeError::MissingData)?;
    let data = message.data.as_deref().ok_or(EnvelopeError::MissingData)?;

    let event = decode_data(data)?;

    Ok(DecodedMessage {
        event,
        message_id: message.message_id,
        publish_time: message.publish_time,
        subscription: envelope.subscription,
        attributes: message.attributes.unwrap_or_default(),
    })
}

/// Decodes the base64 `data` field into an [`Event`].
pub fn decode_data(data: &str) -> Result<Event, EnvelopeError> {
    let bytes = DATA_ENGINE.decode(data.trim())?;
    let text = String::from_utf8(bytes)?;
    let value: Value = serde_json::from_str(&text).map_err(EnvelopeError::InvalidEvent)?;
    if !value.is_object() {
        return Err(EnvelopeError::NotAnObject("event"));
    }
    serde_json::from_value(value).map_err(EnvelopeError::InvalidEvent)
}

/// Wraps an event document the way the broker does. Used by producers and tests.
pub fn encode_data(event_json: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(event_json)
}
