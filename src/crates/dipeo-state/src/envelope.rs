//! The typed value carrier that flows along diagram edges.
//!
//! An [`Envelope`] is an immutable record: a JSON body, a closed
//! [`ContentType`] tag, the producing node id, a trace id, and free-form
//! metadata. Envelopes are the *only* thing edges carry at runtime, and the
//! only node output the state layer retains.
//!
//! Construction auto-classifies the content type from the body; declared
//! conversions go through [`Envelope::coerce_to`], which fails loudly on a
//! non-parseable `raw_text -> object` coercion instead of guessing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Stable node identifier within a diagram.
pub type NodeId = String;

/// Execution identifier (`exec_` + 32 hex).
pub type ExecutionId = String;

/// Closed set of envelope content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Plain text body (`Value::String`).
    RawText,
    /// Structured body (object, array, number, bool, null).
    Object,
    /// Binary body, carried base64-encoded in a string.
    Binary,
    /// Error marker; body describes the failure.
    Error,
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContentType::RawText => "raw_text",
            ContentType::Object => "object",
            ContentType::Binary => "binary",
            ContentType::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Immutable typed value passed along an edge at runtime.
///
/// Envelopes are value types: every method that "changes" one returns a new
/// envelope. Equality is structural, which makes them convenient to assert on
/// in tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The payload. Always a JSON value; binary payloads are base64 strings.
    pub body: Value,
    /// Content classification of `body`.
    pub content_type: ContentType,
    /// Node that produced this envelope.
    pub produced_by: NodeId,
    /// Trace id, usually the owning execution id.
    #[serde(default)]
    pub trace_id: String,
    /// Free-form metadata (branch taken, sub-execution id, token usage, ...).
    ///
    /// A `BTreeMap` so serialized envelopes are byte-stable.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
}

impl Envelope {
    /// Create an envelope, auto-classifying the content type from the body.
    ///
    /// Strings classify as [`ContentType::RawText`]; everything else
    /// (objects, arrays, numbers, booleans, null) as [`ContentType::Object`].
    /// Use [`Envelope::binary`] and [`Envelope::error`] for the remaining
    /// tags.
    pub fn new(body: Value, produced_by: impl Into<NodeId>, trace_id: impl Into<String>) -> Self {
        let content_type = match &body {
            Value::String(_) => ContentType::RawText,
            _ => ContentType::Object,
        };
        Self {
            body,
            content_type,
            produced_by: produced_by.into(),
            trace_id: trace_id.into(),
            meta: BTreeMap::new(),
        }
    }

    /// Create a binary envelope from raw bytes (stored base64-encoded).
    pub fn binary(bytes: &[u8], produced_by: impl Into<NodeId>, trace_id: impl Into<String>) -> Self {
        Self {
            body: Value::String(base64_encode(bytes)),
            content_type: ContentType::Binary,
            produced_by: produced_by.into(),
            trace_id: trace_id.into(),
            meta: BTreeMap::new(),
        }
    }

    /// Create an error envelope carrying a kind and message.
    pub fn error(
        kind: impl Into<String>,
        message: impl Into<String>,
        produced_by: impl Into<NodeId>,
        trace_id: impl Into<String>,
    ) -> Self {
        let kind = kind.into();
        let message = message.into();
        Self {
            body: serde_json::json!({ "error": message, "kind": kind }),
            content_type: ContentType::Error,
            produced_by: produced_by.into(),
            trace_id: trace_id.into(),
            meta: BTreeMap::new(),
        }
    }

    /// Return a copy of this envelope re-tagged as an error.
    pub fn as_error(&self, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Envelope::error(kind, message, self.produced_by.clone(), self.trace_id.clone())
    }

    /// Return a copy with one metadata entry added.
    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Whether this envelope carries an error body.
    pub fn is_error(&self) -> bool {
        self.content_type == ContentType::Error
    }

    /// The body as text, if the envelope is raw text.
    pub fn as_text(&self) -> Option<&str> {
        match (&self.content_type, &self.body) {
            (ContentType::RawText, Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Perform a declared content-type conversion.
    ///
    /// Supported conversions:
    /// - `object -> raw_text`: canonical JSON encoding of the body
    /// - `raw_text -> object`: JSON parse, failing loudly on invalid input
    /// - any type to itself: identity
    ///
    /// Anything else is a [`CoercionError`].
    pub fn coerce_to(&self, target: ContentType) -> std::result::Result<Envelope, CoercionError> {
        if self.content_type == target {
            return Ok(self.clone());
        }
        match (self.content_type, target) {
            (ContentType::Object, ContentType::RawText) => {
                let text = serde_json::to_string(&self.body).map_err(|e| CoercionError {
                    from: self.content_type,
                    to: target,
                    reason: e.to_string(),
                })?;
                let mut out = self.clone();
                out.body = Value::String(text);
                out.content_type = ContentType::RawText;
                Ok(out)
            }
            (ContentType::RawText, ContentType::Object) => {
                let text = self.body.as_str().unwrap_or_default();
                let parsed: Value = serde_json::from_str(text).map_err(|e| CoercionError {
                    from: self.content_type,
                    to: target,
                    reason: format!("body is not valid JSON: {e}"),
                })?;
                let mut out = self.clone();
                out.body = parsed;
                out.content_type = ContentType::Object;
                Ok(out)
            }
            (from, to) => Err(CoercionError {
                from,
                to,
                reason: "no declared conversion".to_string(),
            }),
        }
    }
}

/// A content-type conversion that is not declared or failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Cannot coerce envelope from {from} to {to}: {reason}")]
pub struct CoercionError {
    pub from: ContentType,
    pub to: ContentType,
    pub reason: String,
}

// Minimal base64 (standard alphabet, padded). Bodies are JSON, so binary
// payloads must survive a string field.
fn base64_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);
    for chunk in bytes.chunks(3) {
        let b = [
            chunk[0],
            chunk.get(1).copied().unwrap_or(0),
            chunk.get(2).copied().unwrap_or(0),
        ];
        let n = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
        out.push(ALPHABET[(n >> 18) as usize & 63] as char);
        out.push(ALPHABET[(n >> 12) as usize & 63] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(n >> 6) as usize & 63] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[n as usize & 63] as char
        } else {
            '='
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_auto_classification() {
        let e = Envelope::new(json!("hello"), "n1", "exec_1");
        assert_eq!(e.content_type, ContentType::RawText);

        let e = Envelope::new(json!({"a": 1}), "n1", "exec_1");
        assert_eq!(e.content_type, ContentType::Object);

        let e = Envelope::new(json!([1, 2]), "n1", "exec_1");
        assert_eq!(e.content_type, ContentType::Object);

        let e = Envelope::new(json!(42), "n1", "exec_1");
        assert_eq!(e.content_type, ContentType::Object);
    }

    #[test]
    fn test_error_envelope() {
        let e = Envelope::error("timeout", "deadline expired", "n1", "exec_1");
        assert!(e.is_error());
        assert_eq!(e.body["kind"], "timeout");
    }

    #[test]
    fn test_with_meta_is_a_copy() {
        let e = Envelope::new(json!("x"), "n1", "exec_1");
        let tagged = e.clone().with_meta("branch", json!("true"));
        assert!(e.meta.is_empty());
        assert_eq!(tagged.meta["branch"], "true");
    }

    #[test]
    fn test_coerce_object_to_text_and_back() {
        let e = Envelope::new(json!({"b": 2, "a": 1}), "n1", "exec_1");
        let text = e.coerce_to(ContentType::RawText).unwrap();
        assert_eq!(text.content_type, ContentType::RawText);
        // serde_json maps are sorted, so encoding is canonical
        assert_eq!(text.body, json!(r#"{"a":1,"b":2}"#));

        let back = text.coerce_to(ContentType::Object).unwrap();
        assert_eq!(back.body, e.body);
    }

    #[test]
    fn test_coerce_invalid_json_fails_loud() {
        let e = Envelope::new(json!("not json {"), "n1", "exec_1");
        assert!(e.coerce_to(ContentType::Object).is_err());
    }

    #[test]
    fn test_coerce_undeclared_conversion() {
        let e = Envelope::binary(b"\x01\x02", "n1", "exec_1");
        assert!(e.coerce_to(ContentType::Object).is_err());
    }

    #[test]
    fn test_binary_round_trip_encoding() {
        let e = Envelope::binary(b"abc", "n1", "exec_1");
        assert_eq!(e.body, json!("YWJj"));
        let e = Envelope::binary(b"ab", "n1", "exec_1");
        assert_eq!(e.body, json!("YWI="));
        let e = Envelope::binary(b"a", "n1", "exec_1");
        assert_eq!(e.body, json!("YQ=="));
    }
}
