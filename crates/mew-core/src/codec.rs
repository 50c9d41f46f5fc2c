// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire JSON parsing and canonical serialization.
//!
//! Parsing is tolerant by default: unknown top-level fields are accepted and
//! ignored. Strict mode rejects them. Serialization goes through
//! `serde_json::Value`, whose object representation sorts keys, so two
//! equal envelopes always produce byte-identical lines in the history log.

use crate::{Envelope, EnvelopeDraft, GatewayError};
use serde_json::Value;

/// Top-level fields the codec knows about.
const KNOWN_FIELDS: &[&str] = &[
    "protocol",
    "id",
    "ts",
    "from",
    "to",
    "kind",
    "correlation_id",
    "context",
    "payload",
];

/// Parsing knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Reject envelopes carrying unknown top-level fields.
    pub strict: bool,
}

/// Parse an inbound text frame into an [`EnvelopeDraft`].
///
/// Fails with [`GatewayError::MalformedEnvelope`] naming the offending field
/// when a required field is missing or a known field has the wrong type.
pub fn parse_draft(text: &str, opts: ParseOptions) -> Result<EnvelopeDraft, GatewayError> {
    let value: Value = serde_json::from_str(text).map_err(|e| GatewayError::MalformedEnvelope {
        detail: format!("invalid JSON: {e}"),
    })?;

    let obj = value.as_object().ok_or_else(|| GatewayError::MalformedEnvelope {
        detail: "envelope must be a JSON object".to_string(),
    })?;

    if opts.strict
        && let Some(unknown) = obj.keys().find(|k| !KNOWN_FIELDS.contains(&k.as_str()))
    {
        return Err(GatewayError::MalformedEnvelope {
            detail: format!("unknown field: {unknown}"),
        });
    }

    match obj.get("kind") {
        Some(Value::String(_)) => {}
        Some(_) => {
            return Err(GatewayError::MalformedEnvelope {
                detail: "field kind must be a string".to_string(),
            });
        }
        None => {
            return Err(GatewayError::MalformedEnvelope {
                detail: "missing required field: kind".to_string(),
            });
        }
    }

    serde_json::from_value(value).map_err(|e| GatewayError::MalformedEnvelope {
        detail: e.to_string(),
    })
}

/// Parse a sealed [`Envelope`], as participants do for gateway output.
pub fn parse_envelope(text: &str) -> Result<Envelope, GatewayError> {
    serde_json::from_str(text).map_err(|e| GatewayError::MalformedEnvelope {
        detail: e.to_string(),
    })
}

/// Serialize an envelope deterministically (recursively sorted object keys).
pub fn to_canonical_string(envelope: &Envelope) -> Result<String, GatewayError> {
    let value = serde_json::to_value(envelope).map_err(|e| GatewayError::Internal {
        detail: format!("serialize envelope: {e}"),
    })?;
    serde_json::to_string(&value).map_err(|e| GatewayError::Internal {
        detail: format!("serialize envelope: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lenient_mode_ignores_unknown_fields() {
        let text = json!({"kind": "chat", "payload": {"text": "hi"}, "x_custom": 1}).to_string();
        let draft = parse_draft(&text, ParseOptions::default()).unwrap();
        assert_eq!(draft.kind, "chat");
    }

    #[test]
    fn strict_mode_rejects_unknown_fields() {
        let text = json!({"kind": "chat", "x_custom": 1}).to_string();
        let err = parse_draft(&text, ParseOptions { strict: true }).unwrap_err();
        assert_eq!(err.reason_code(), "malformed_envelope");
        assert!(err.to_string().contains("x_custom"));
    }

    #[test]
    fn missing_kind_names_the_field() {
        let err = parse_draft("{}", ParseOptions::default()).unwrap_err();
        assert!(err.to_string().contains("kind"));
    }

    #[test]
    fn wrong_type_for_known_field_fails() {
        let text = json!({"kind": "chat", "to": "bob"}).to_string();
        assert!(parse_draft(&text, ParseOptions::default()).is_err());
    }

    #[test]
    fn canonical_output_is_stable_across_field_order() {
        let a = parse_draft(
            &json!({"kind": "chat", "to": ["bob"], "payload": {"b": 1, "a": 2}}).to_string(),
            ParseOptions::default(),
        )
        .unwrap()
        .seal("alice");
        let mut b = a.clone();
        b.payload = json!({"a": 2, "b": 1});

        assert_eq!(
            to_canonical_string(&a).unwrap(),
            to_canonical_string(&b).unwrap()
        );
        // Keys inside the payload come out sorted.
        let line = to_canonical_string(&a).unwrap();
        assert!(line.find("\"a\":2").unwrap() < line.find("\"b\":1").unwrap());
    }
}
