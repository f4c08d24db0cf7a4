use crate::model::outcome::Return;
use crate::model::request::Request;
use crate::model::window::Window;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// The canonical self-describing message exchanged between agents.
///
/// An envelope carries either a request (on the way in) or a reply (a
/// `result`, or an intermediate `status`, on the way out), together with the
/// metadata that makes correlation work: the serial number `sn`, the opaque
/// correlation blob `any` echoed back verbatim, and the `replyto` address.
///
/// The serial number is assigned exactly once, when the request originates,
/// and is never rewritten; replies carry the originating `sn` verbatim.
///
/// The wire form is a single self-delimiting JSON text, so an envelope
/// round-trips through any transport that can carry one byte string. Fields
/// unknown to this version of the protocol are preserved on re-encoding.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// The protocol tag, stamped by the sending [`Producer`](crate::Producer).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// The serial number: a UUID string, unique per request.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sn: String,

    /// Opaque caller data, echoed back to the caller on every reply.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub any: Value,

    /// The address to which replies must be sent, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replyto: Option<String>,

    /// The request payload, present on inbound requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Request>,

    /// The outcome payload, present on final replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Return>,

    /// An intermediate progress marker (e.g. `"started"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// The delivery-eligibility window of a request, if constrained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<Window>,

    /// Message time-to-live, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,

    /// An optional routing subject carried across from broker properties.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Fields unknown to this protocol version; round-trip unchanged.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Represents a failure to encode or decode an [`Envelope`].
#[derive(Error, Debug)]
pub enum CodecError {
    /// The bytes did not parse as an envelope.
    #[error("failed to decode an envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    /// The envelope did not serialize (practically unreachable for
    /// well-formed field values).
    #[error("failed to encode an envelope: {0}")]
    Unencodable(#[source] serde_json::Error),
}

impl Envelope {
    /// Creates an envelope carrying the given request.
    pub fn for_request(request: Request) -> Self {
        Self {
            request: Some(request),
            ..Self::default()
        }
    }

    /// Creates a final reply to the request with the given serial number,
    /// echoing the given caller data.
    pub fn for_reply(sn: impl AsRef<str>, any: Value, result: Return) -> Self {
        Self {
            sn: sn.as_ref().to_string(),
            any,
            result: Some(result),
            ..Self::default()
        }
    }

    /// Creates an intermediate status update for the request with the given
    /// serial number, echoing the given caller data.
    pub fn for_status(sn: impl AsRef<str>, any: Value, status: impl AsRef<str>) -> Self {
        Self {
            sn: sn.as_ref().to_string(),
            any,
            status: Some(status.as_ref().to_string()),
            ..Self::default()
        }
    }

    /// Sets the serial number.
    pub fn with_sn(mut self, sn: impl AsRef<str>) -> Self {
        self.sn = sn.as_ref().to_string();
        self
    }

    /// Sets the opaque caller data.
    pub fn with_any(mut self, any: Value) -> Self {
        self.any = any;
        self
    }

    /// Sets the reply address.
    pub fn with_replyto(mut self, replyto: impl AsRef<str>) -> Self {
        self.replyto = Some(replyto.as_ref().to_string());
        self
    }

    /// Sets the delivery window.
    pub fn with_window(mut self, window: Window) -> Self {
        self.window = Some(window);
        self
    }

    /// Sets the time-to-live, in seconds.
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

impl Envelope {
    /// Serializes this envelope into its textual wire form.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Unencodable)
    }

    /// Deserializes an envelope from its textual wire form. Unknown fields
    /// are tolerated and preserved.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Malformed)
    }

    /// Reports whether this envelope carries a final outcome.
    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn round_trip_request() {
        // Given
        let envelope = Envelope::for_request(Request::function("echo").with_args(vec![json!("hi")]))
            .with_sn("a3f1")
            .with_any(json!({"tag": 7}))
            .with_replyto("replies")
            .with_window(Window {
                begin: 100,
                duration: 60,
            })
            .with_ttl(10);

        // When
        let bytes = envelope.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();

        // Then
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn round_trip_reply() {
        // Given
        let envelope = Envelope::for_reply("a3f1", json!(null), Return::succeeded(json!([1, 2])));

        // When
        let bytes = envelope.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();

        // Then
        assert_eq!(decoded, envelope);
        assert!(decoded.has_result());
    }

    #[test]
    fn unknown_fields_survive_the_round_trip() {
        // Given
        let wire = br#"{"sn":"s1","status":"started","x-future-flag":true,"shard":12}"#;

        // When
        let decoded = Envelope::decode(wire).unwrap();
        let re_encoded = decoded.encode().unwrap();
        let re_decoded = Envelope::decode(&re_encoded).unwrap();

        // Then
        assert_eq!(decoded.extra.get("x-future-flag"), Some(&json!(true)));
        assert_eq!(decoded.extra.get("shard"), Some(&json!(12)));
        assert_eq!(re_decoded, decoded);
    }

    #[test]
    fn absent_fields_stay_absent() {
        // Given
        let envelope = Envelope::for_status("s2", json!(null), "started");

        // When
        let text = String::from_utf8(envelope.encode().unwrap()).unwrap();

        // Then
        assert!(!text.contains("replyto"));
        assert!(!text.contains("result"));
        assert!(!text.contains("window"));
        assert!(!text.contains("any"));
    }

    #[test]
    fn garbage_is_rejected() {
        // When
        let result = Envelope::decode(b"not an envelope");

        // Then
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }
}
