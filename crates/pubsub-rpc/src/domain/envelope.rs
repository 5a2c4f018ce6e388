//! JSON envelope exchanged on the wire.
//!
//! Every field is optional at the codec level. Missing fields decode as
//! `None`; only malformed JSON (or a non-object document) is an error.
//! Byte payloads travel as standard base64 with padding, typed payloads as
//! embedded JSON subtrees.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::correlation::CorrelationId;
use crate::error::{ChannelError, MessageError};

/// Wire field names.
pub mod keys {
    pub const CORRELATION_ID: &str = "correlationId";
    pub const MESSAGE: &str = "message";
    pub const REMOTE_TIMEOUT: &str = "remoteTimeout";
    pub const RESPONSE: &str = "response";
    pub const ERROR_CLASS_NAME: &str = "errorClassName";
    pub const ERROR_MESSAGE: &str = "errorMessage";
    pub const CLASS_NAME: &str = "className";
}

/// Suffix of the wire channel carrying requests.
pub const SENDER_SUFFIX: &str = ":sender";

/// Suffix of the wire channel carrying responses.
pub const RECEIVER_SUFFIX: &str = ":receiver";

/// Wire channels derived from one logical channel name.
///
/// Requests flow on `C:sender`, responses on `C:receiver`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelPair {
    logical: String,
    sender: String,
    receiver: String,
}

impl ChannelPair {
    pub fn new(logical: impl Into<String>) -> Self {
        let logical = logical.into();
        Self {
            sender: format!("{logical}{SENDER_SUFFIX}"),
            receiver: format!("{logical}{RECEIVER_SUFFIX}"),
            logical,
        }
    }

    pub fn logical(&self) -> &str {
        &self.logical
    }

    /// Channel the receiver subscribes to and the sender publishes requests on.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Channel the sender subscribes to and the receiver publishes responses on.
    pub fn receiver(&self) -> &str {
        &self.receiver
    }
}

/// Why a correlation id could not be recovered from an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    Missing,
    Malformed(String),
}

/// A request or response envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,

    /// Milliseconds; values <= 0 mean unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_timeout: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Envelope {
    /// Request skeleton: correlation id and remote timeout, payload still to be attached.
    pub fn request(correlation_id: CorrelationId, remote_timeout: Duration) -> Self {
        Self {
            correlation_id: Some(correlation_id.to_string()),
            remote_timeout: Some(duration_to_millis(remote_timeout)),
            ..Self::default()
        }
    }

    /// Response skeleton echoing the request's correlation id.
    pub fn response_to(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id: Some(correlation_id.to_string()),
            ..Self::default()
        }
    }

    /// Decode an envelope. The document must be a JSON object.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ChannelError> {
        let value: Value = serde_json::from_slice(bytes)?;
        if !value.is_object() {
            return Err(ChannelError::Serialization(format!(
                "envelope must be a JSON object, found {}",
                json_kind(&value)
            )));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, ChannelError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Recover and parse the correlation id.
    pub fn correlation(&self) -> Result<CorrelationId, CorrelationError> {
        let raw = self
            .correlation_id
            .as_deref()
            .ok_or(CorrelationError::Missing)?;
        CorrelationId::parse(raw).map_err(|e| CorrelationError::Malformed(e.to_string()))
    }

    /// Remote timeout carried by a request; zero when absent or not positive.
    pub fn remote_timeout(&self) -> Duration {
        match self.remote_timeout {
            Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
            _ => Duration::ZERO,
        }
    }

    /// Error descriptor, if the response reports a failure.
    pub fn error(&self) -> Option<MessageError> {
        if self.error_class_name.is_none() && self.error_message.is_none() {
            return None;
        }
        Some(MessageError::new(
            self.error_class_name.clone(),
            self.error_message.clone(),
        ))
    }

    pub fn set_error(&mut self, error: &MessageError) {
        self.error_class_name = error.class_name.clone();
        self.error_message = error.message.clone();
    }

    /// Attach a local failure as `{errorClassName, errorMessage}`.
    pub fn fail_with(&mut self, error: &ChannelError) {
        self.set_error(&error.to_message_error());
    }
}

/// Recover a correlation id from a document that did not decode as an
/// [`Envelope`], e.g. because one field carries the wrong JSON type.
pub fn salvage_correlation(bytes: &[u8]) -> Option<CorrelationId> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    let raw = value.get(keys::CORRELATION_ID)?.as_str()?;
    CorrelationId::parse(raw).ok()
}

/// Standard base64 (padded) form of a byte payload.
pub fn encode_bytes(bytes: &[u8]) -> Value {
    Value::String(STANDARD.encode(bytes))
}

/// Decode a byte payload carried as a base64 string.
pub fn decode_bytes(value: &Value) -> Result<Vec<u8>, ChannelError> {
    let text = value.as_str().ok_or_else(|| {
        ChannelError::Serialization(format!(
            "expected a base64 string, found {}",
            json_kind(value)
        ))
    })?;
    Ok(STANDARD.decode(text)?)
}

fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_pair_naming() {
        let pair = ChannelPair::new("rpc:bam");
        assert_eq!(pair.logical(), "rpc:bam");
        assert_eq!(pair.sender(), "rpc:bam:sender");
        assert_eq!(pair.receiver(), "rpc:bam:receiver");
    }

    #[test]
    fn test_request_wire_form() {
        let id = CorrelationId::new();
        let mut envelope = Envelope::request(id, Duration::from_millis(250));
        envelope.message = Some(encode_bytes(b"hi"));

        let wire: Value = serde_json::from_slice(&envelope.to_vec().unwrap()).unwrap();
        assert_eq!(
            wire,
            json!({
                "correlationId": id.to_string(),
                "message": "aGk=",
                "remoteTimeout": 250,
            })
        );
    }

    #[test]
    fn test_missing_fields_decode_as_absent() {
        let envelope = Envelope::from_slice(br#"{"correlationId":"x"}"#).unwrap();
        assert_eq!(envelope.correlation_id.as_deref(), Some("x"));
        assert!(envelope.message.is_none());
        assert!(envelope.response.is_none());
        assert!(envelope.error().is_none());
        assert_eq!(envelope.remote_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let envelope = Envelope::from_slice(br#"{"response":"AA==","extra":true}"#).unwrap();
        assert_eq!(envelope.response, Some(json!("AA==")));
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        assert!(matches!(
            Envelope::from_slice(b"{not json"),
            Err(ChannelError::Json(_))
        ));
        assert!(matches!(
            Envelope::from_slice(b"[1,2]"),
            Err(ChannelError::Serialization(_))
        ));
    }

    #[test]
    fn test_salvage_correlation_from_mistyped_fields() {
        let id = CorrelationId::new();
        let mistyped =
            format!(r#"{{"correlationId":"{id}","message":"aGk=","remoteTimeout":"100"}}"#);
        assert!(matches!(
            Envelope::from_slice(mistyped.as_bytes()),
            Err(ChannelError::Json(_))
        ));
        assert_eq!(salvage_correlation(mistyped.as_bytes()), Some(id));

        let numeric_class = format!(r#"{{"correlationId":"{id}","className":7}}"#);
        assert_eq!(salvage_correlation(numeric_class.as_bytes()), Some(id));

        assert_eq!(salvage_correlation(b"{not json"), None);
        assert_eq!(salvage_correlation(br#"{"correlationId":42}"#), None);
        assert_eq!(salvage_correlation(br#"{"correlationId":"nope"}"#), None);
    }

    #[test]
    fn test_correlation_recovery() {
        let id = CorrelationId::new();
        let envelope = Envelope::response_to(id);
        assert_eq!(envelope.correlation(), Ok(id));

        let missing = Envelope::default();
        assert_eq!(missing.correlation(), Err(CorrelationError::Missing));

        let malformed = Envelope {
            correlation_id: Some("nope".into()),
            ..Envelope::default()
        };
        assert!(matches!(
            malformed.correlation(),
            Err(CorrelationError::Malformed(_))
        ));
    }

    #[test]
    fn test_negative_remote_timeout_is_unbounded() {
        let envelope = Envelope {
            remote_timeout: Some(-5),
            ..Envelope::default()
        };
        assert_eq!(envelope.remote_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_error_fields() {
        let mut envelope = Envelope::default();
        envelope.fail_with(&ChannelError::EmptyMessage);
        let error = envelope.error().unwrap();
        assert_eq!(error.class_name.as_deref(), Some("EmptyMessage"));
        assert_eq!(error.message.as_deref(), Some("Empty message received"));
    }

    #[test]
    fn test_decode_bytes_rejects_bad_input() {
        assert!(matches!(
            decode_bytes(&json!("***")),
            Err(ChannelError::Base64(_))
        ));
        assert!(matches!(
            decode_bytes(&json!({"a": 1})),
            Err(ChannelError::Serialization(_))
        ));
        // URL-safe alphabet is not accepted
        assert!(decode_bytes(&json!("-_8=")).is_err());
        assert_eq!(decode_bytes(&json!("+/8=")).unwrap(), vec![0xfb, 0xff]);
    }
}
