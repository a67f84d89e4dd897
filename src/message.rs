//! Message envelope shared by the producer and consumer pipelines.
//!
//! A [`Message`] bundles an identifier, a header map and an opaque string
//! payload. The serde representation of the struct *is* the broker wire
//! format: a UTF-8 JSON object `{"id": ..., "headers": {...}, "payload": ...}`.
//!
//! ## Headers
//!
//! Headers carry routing and correlation metadata as `string → string`
//! pairs. A handful of names are reserved by the framework (see
//! [`headers`]); everything else is application-defined. Key order is
//! irrelevant and keys are unique, which is why the map is a `BTreeMap`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

/// Reserved header names.
///
/// `ID` and `DESTINATION` are always present on a message that reached the
/// wire; the producer stamps them at send time.
pub mod headers {
    /// Globally unique, time-ordered message identifier.
    pub const ID: &str = "ID";
    /// Topic / channel the message was sent to.
    pub const DESTINATION: &str = "DESTINATION";
    /// Send timestamp, RFC 3339.
    pub const DATE: &str = "DATE";
    /// Optional routing key; messages sharing it land in the same partition.
    pub const PARTITION_ID: &str = "PARTITION_ID";
    /// Event type name or user-chosen alias (domain events only).
    pub const EVENT_TYPE: &str = "EVENT_TYPE";
    /// Aggregate type the event belongs to (domain events only).
    pub const EVENT_AGGREGATE_TYPE: &str = "EVENT_AGGREGATE_TYPE";
    /// Aggregate instance the event belongs to (domain events only).
    pub const EVENT_AGGREGATE_ID: &str = "EVENT_AGGREGATE_ID";
}

/// Immutable-by-convention message envelope.
///
/// Constructed through [`Message::build`]; the `id` is assigned by the
/// producer when the message is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id, lexicographically sortable in creation order.
    pub id: String,
    /// Header map, keys unique.
    pub headers: BTreeMap<String, String>,
    /// Opaque UTF-8 payload, typically JSON.
    pub payload: String,
}

impl Message {
    /// Start building a message with the given payload.
    pub fn build(payload: impl Into<String>) -> MessageBuilder {
        MessageBuilder {
            headers: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    /// Look up a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Look up a header that must be present.
    pub fn required_header(&self, name: &str) -> Result<&str, MessageError> {
        self.header(name).ok_or_else(|| MessageError::missing(name))
    }

    /// Insert or replace a header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// The `DESTINATION` header, if stamped.
    pub fn destination(&self) -> Option<&str> {
        self.header(headers::DESTINATION)
    }

    /// The `PARTITION_ID` routing key, if any.
    pub fn partition_id(&self) -> Option<&str> {
        self.header(headers::PARTITION_ID)
    }

    /// Encode into the broker wire format.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(MessageError::codec)
    }

    /// Decode from the broker wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(MessageError::codec)
    }
}

/// Builder returned by [`Message::build`].
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    headers: BTreeMap<String, String>,
    payload: String,
}

impl MessageBuilder {
    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Finish building. The id stays empty until the producer assigns one.
    pub fn finish(self) -> Message {
        Message {
            id: String::new(),
            headers: self.headers,
            payload: self.payload,
        }
    }
}

impl From<MessageBuilder> for Message {
    fn from(builder: MessageBuilder) -> Self {
        builder.finish()
    }
}

/// Error produced by envelope accessors and the wire codec.
#[derive(Debug)]
pub struct MessageError {
    context: SpanTrace,
    kind: MessageErrorKind,
}

/// Kinds of envelope errors.
#[derive(Debug)]
pub enum MessageErrorKind {
    /// A required header was absent.
    MissingHeader(String),
    /// Wire (de)serialization failed.
    Codec(serde_json::Error),
}

impl MessageError {
    fn missing(name: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: MessageErrorKind::MissingHeader(name.to_owned()),
        }
    }

    fn codec(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: MessageErrorKind::Codec(err),
        }
    }
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            MessageErrorKind::MissingHeader(name) => writeln!(f, "Missing header: {name}"),
            MessageErrorKind::Codec(err) => writeln!(f, "Codec error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for MessageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            MessageErrorKind::MissingHeader(_) => None,
            MessageErrorKind::Codec(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip_preserves_envelope() {
        let mut message = Message::build(r#"{"answer":42}"#)
            .header(headers::DESTINATION, "orders")
            .header("trace", "abc")
            .finish();
        message.id = "0192f3a1".to_owned();
        message.set_header(headers::ID, "0192f3a1");

        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn wire_format_field_names() {
        let mut message = Message::build("p").finish();
        message.id = "m1".to_owned();

        let json: serde_json::Value =
            serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert_eq!(json["id"], "m1");
        assert_eq!(json["payload"], "p");
        assert!(json["headers"].is_object());
    }

    #[test]
    fn required_header_reports_absence() {
        let message = Message::build("p").finish();
        let err = message.required_header(headers::DESTINATION).unwrap_err();
        assert!(err.to_string().contains("DESTINATION"));
    }
}
