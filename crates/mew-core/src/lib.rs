// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! mew-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the mew gateway.
//!
//! If you only take one dependency, take this one.

/// Wire parsing and canonical serialization.
pub mod codec;
/// Gateway error taxonomy with stable reason codes.
pub mod error;
/// Canonical envelope kind catalog and family predicates.
pub mod kind;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use error::{ErrorCategory, GatewayError};

/// Protocol version tag embedded in every envelope.
///
/// # Examples
///
/// ```
/// assert_eq!(mew_core::PROTOCOL_VERSION, "mew/v0.4");
/// ```
pub const PROTOCOL_VERSION: &str = "mew/v0.4";

/// Legacy protocol tags the gateway still admits at join time.
pub const LEGACY_PROTOCOLS: &[&str] = &["mew/v0.3"];

/// Returns `true` if `tag` is the current protocol version or an accepted
/// legacy version.
#[must_use]
pub fn protocol_supported(tag: &str) -> bool {
    tag == PROTOCOL_VERSION || LEGACY_PROTOCOLS.contains(&tag)
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The universal message unit, immutable once sealed by the gateway.
///
/// `from`, `id`, and `ts` are authoritative: they are assigned (or, for
/// `id`, at least verified present) at ingress. Peers never see an envelope
/// without them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Envelope {
    /// Protocol version tag, e.g. `mew/v0.4`.
    pub protocol: String,

    /// Globally unique envelope id.
    pub id: Uuid,

    /// Ingress timestamp (RFC-3339 UTC).
    pub ts: DateTime<Utc>,

    /// Sending participant id, assigned from the authenticated connection.
    pub from: String,

    /// Explicit recipients. Empty means broadcast to the space.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,

    /// Namespaced meaning of this envelope (see [`kind`]).
    pub kind: String,

    /// Envelope ids this one responds to, fulfills, or cancels.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "one_or_many_uuid"
    )]
    pub correlation_id: Vec<Uuid>,

    /// Sub-conversation scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,

    /// Kind-specific payload. Opaque to the routing layer.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    /// True when `participant` is an explicit recipient, or the envelope is
    /// a broadcast.
    #[must_use]
    pub fn addresses(&self, participant: &str) -> bool {
        self.to.is_empty() || self.to.iter().any(|p| p == participant)
    }

    /// True when the envelope has no explicit recipients.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.to.is_empty()
    }

    /// First correlation entry, if any.
    #[must_use]
    pub fn correlates_to(&self) -> Option<Uuid> {
        self.correlation_id.first().copied()
    }
}

/// An envelope as received from a client, before the gateway seals it.
///
/// Server-assigned fields are optional here; any client-supplied `from` is
/// discarded by [`EnvelopeDraft::seal`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EnvelopeDraft {
    /// Protocol version tag. Defaults to the current version when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Client-chosen envelope id. Assigned by the gateway when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    /// Client timestamp. Overwritten at ingress when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,

    /// Ignored. The gateway always assigns `from` itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Explicit recipients.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,

    /// Namespaced envelope kind.
    pub kind: String,

    /// Correlated envelope ids. A bare string is accepted on the wire.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "one_or_many_uuid"
    )]
    pub correlation_id: Vec<Uuid>,

    /// Sub-conversation scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,

    /// Kind-specific payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl EnvelopeDraft {
    /// Minimal draft with a kind and payload.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            ..Self::default()
        }
    }

    /// Address the draft to the given participants.
    #[must_use]
    pub fn to(mut self, recipients: Vec<String>) -> Self {
        self.to = recipients;
        self
    }

    /// Correlate the draft to a prior envelope.
    #[must_use]
    pub fn correlated(mut self, id: Uuid) -> Self {
        self.correlation_id.push(id);
        self
    }

    /// Seal the draft into an [`Envelope`], stamping the authenticated
    /// sender and filling any absent server-assigned fields.
    #[must_use]
    pub fn seal(self, from: impl Into<String>) -> Envelope {
        Envelope {
            protocol: self.protocol.unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
            id: self.id.unwrap_or_else(Uuid::new_v4),
            ts: self.ts.unwrap_or_else(Utc::now),
            from: from.into(),
            to: self.to,
            kind: self.kind,
            correlation_id: self.correlation_id,
            context: self.context,
            payload: self.payload,
        }
    }
}

/// Build a sealed system envelope (sender [`SYSTEM_PARTICIPANT`]).
#[must_use]
pub fn system_envelope(kind: impl Into<String>, to: Vec<String>, payload: Value) -> Envelope {
    EnvelopeDraft::new(kind, payload).to(to).seal(SYSTEM_PARTICIPANT)
}

/// Reserved sender id for gateway-synthesized envelopes.
pub const SYSTEM_PARTICIPANT: &str = "system";

fn one_or_many_uuid<'de, D>(deserializer: D) -> Result<Vec<Uuid>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(Uuid),
        Many(Vec<Uuid>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(id) => vec![id],
        OneOrMany::Many(ids) => ids,
    })
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Sub-conversation scope: a bare topic label or a structured operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Context {
    /// Plain topic label.
    Topic(String),
    /// Structured push/pop/resume operation.
    Operation(ContextOperation),
}

/// Structured context operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ContextOperation {
    /// The operation to apply to the conversation chain.
    pub operation: ContextOp,
    /// Topic being pushed, popped, or resumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Envelope id the operation refers back to. A `pop` must reference an
    /// earlier `push` with a matching topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

/// Context chain operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContextOp {
    /// Open a nested sub-conversation.
    Push,
    /// Close the current sub-conversation.
    Pop,
    /// Return to a previously pushed topic.
    Resume,
}

/// One participant's open sub-conversations, innermost last.
///
/// A `pop` must name the innermost open `push` (by topic, and by
/// correlation id when it carries one); a `resume` returns to any open
/// topic, abandoning everything nested inside it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextStack {
    open: Vec<(String, Uuid)>,
}

impl ContextStack {
    /// Empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Topics currently open, outermost first.
    #[must_use]
    pub fn open_topics(&self) -> Vec<&str> {
        self.open.iter().map(|(t, _)| t.as_str()).collect()
    }

    /// Apply an envelope's context operation, validating the chain.
    /// Envelopes without a structured operation are no-ops.
    pub fn apply(&mut self, envelope: &Envelope) -> Result<(), GatewayError> {
        let Some(Context::Operation(op)) = &envelope.context else {
            return Ok(());
        };
        match op.operation {
            ContextOp::Push => {
                let Some(topic) = &op.topic else {
                    return Err(GatewayError::MalformedEnvelope {
                        detail: "context push requires a topic".to_string(),
                    });
                };
                self.open.push((topic.clone(), envelope.id));
                Ok(())
            }
            ContextOp::Pop => {
                let Some((topic, push_id)) = self.open.last() else {
                    return Err(GatewayError::MalformedEnvelope {
                        detail: "context pop with no open push".to_string(),
                    });
                };
                if let Some(wanted) = &op.topic
                    && wanted != topic
                {
                    return Err(GatewayError::MalformedEnvelope {
                        detail: format!("context pop names {wanted}, innermost push is {topic}"),
                    });
                }
                if let Some(correlated) = op.correlation_id
                    && correlated != *push_id
                {
                    return Err(GatewayError::MalformedEnvelope {
                        detail: "context pop does not correlate to the innermost push".to_string(),
                    });
                }
                self.open.pop();
                Ok(())
            }
            ContextOp::Resume => {
                let position = self.open.iter().rposition(|(topic, push_id)| {
                    op.topic.as_deref().is_some_and(|t| t == topic)
                        || op.correlation_id.is_some_and(|id| id == *push_id)
                });
                match position {
                    Some(idx) => {
                        self.open.truncate(idx + 1);
                        Ok(())
                    }
                    None => Err(GatewayError::MalformedEnvelope {
                        detail: "context resume names no open topic".to_string(),
                    }),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Capabilities (data shape; matching lives in mew-capability)
// ---------------------------------------------------------------------------

/// A declarative pattern authorizing a participant to emit envelopes of a
/// given shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Capability {
    /// Stable identifier, used in diagnostics and revocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Kind pattern with left-anchored `*` wildcard segments,
    /// e.g. `mcp/request:tools/*`.
    pub kind: String,

    /// Recipient pattern(s). Absent means any recipient set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PatternSet>,

    /// Shallow JSON payload pattern. Absent fields are wildcards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Capability {
    /// Capability for a bare kind pattern, any recipients, any payload.
    #[must_use]
    pub fn for_kind(kind: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            to: None,
            payload: None,
        }
    }
}

/// One pattern or a list of patterns, as written in config and on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum PatternSet {
    /// A single pattern.
    One(String),
    /// Any of several patterns.
    Many(Vec<String>),
}

impl PatternSet {
    /// Iterate the contained patterns.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice = match self {
            Self::One(p) => std::slice::from_ref(p),
            Self::Many(ps) => ps.as_slice(),
        };
        slice.iter().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Participants & presence
// ---------------------------------------------------------------------------

/// Connection state of a participant within a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    /// Live connection, delivery active.
    Connected,
    /// Live connection, delivery suspended by `participant/pause`.
    Paused,
    /// No connection; record retained for the reconnect grace window.
    Disconnected,
}

/// Public descriptor of a participant, as shared in welcome and presence
/// envelopes. Never carries tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParticipantInfo {
    /// Participant id, unique within the space.
    pub id: String,
    /// Effective capability list.
    pub capabilities: Vec<Capability>,
    /// Current presence.
    pub presence: Presence,
}

// ---------------------------------------------------------------------------
// Streams (wire-facing metadata; the engine lives in mew-gateway)
// ---------------------------------------------------------------------------

/// Direction requested by `stream/request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StreamDirection {
    /// Owner writes, target(s) (or the space) read.
    Upload,
    /// Target(s) write, owner reads.
    Download,
}

/// Lifecycle of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// Requested, `stream/open` not yet emitted.
    Opening,
    /// Frames flowing.
    Open,
    /// Terminated; frames are dropped.
    Closed,
}

/// Server-authoritative stream metadata, as carried by `stream/open` and the
/// welcome snapshot. `owner` and `authorized_writers` are always derived
/// from the authenticated connection, never from client payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StreamInfo {
    /// Server-assigned, unforgeable stream id.
    pub stream_id: Uuid,
    /// Participant that requested the stream.
    pub owner: String,
    /// Participants allowed to write frames.
    pub authorized_writers: Vec<String>,
    /// Explicit frame recipients. Absent means the whole space.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Vec<String>>,
    /// Frame encoding hint, e.g. `binary`.
    pub encoding: String,
    /// Current lifecycle state.
    pub status: StreamStatus,
}

// ---------------------------------------------------------------------------
// System payloads
// ---------------------------------------------------------------------------

/// Payload of `system/welcome`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WelcomePayload {
    /// The joining participant's own descriptor.
    pub you: ParticipantInfo,
    /// Other participants currently present in the space.
    pub participants: Vec<ParticipantInfo>,
    /// Streams currently open in the space.
    pub streams: Vec<StreamInfo>,
    /// Protocol version the gateway accepted for this connection.
    pub protocol: String,
}

/// Join/leave discriminant for `system/presence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PresenceEvent {
    /// Participant joined the space.
    Join,
    /// Participant left the space.
    Leave,
}

/// Payload of `system/presence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PresencePayload {
    /// What happened.
    pub event: PresenceEvent,
    /// Who it happened to.
    pub participant: ParticipantInfo,
}

/// Payload of `system/error`, correlated to the offending envelope when one
/// exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SystemErrorPayload {
    /// Stable machine-readable reason code (see [`error::GatewayError`]).
    pub reason: String,
    /// Human-readable description.
    pub message: String,
    /// Kind the sender attempted, for capability violations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted_kind: Option<String>,
    /// Ids of the sender's effective capabilities at decision time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_ids: Option<Vec<String>>,
    /// Id of the envelope that triggered the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope_id: Option<Uuid>,
}

impl SystemErrorPayload {
    /// Build an error payload from a [`GatewayError`].
    #[must_use]
    pub fn from_error(err: &GatewayError) -> Self {
        Self {
            reason: err.reason_code().to_string(),
            message: err.to_string(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seal_overwrites_client_from() {
        let wire: EnvelopeDraft = serde_json::from_value(json!({
            "kind": "chat",
            "from": "impostor",
            "payload": {"text": "hi"}
        }))
        .unwrap();
        let sealed = wire.seal("alice");
        assert_eq!(sealed.from, "alice");
        assert_eq!(sealed.protocol, PROTOCOL_VERSION);
    }

    #[test]
    fn seal_preserves_client_id_and_assigns_missing() {
        let id = Uuid::new_v4();
        let kept = EnvelopeDraft {
            id: Some(id),
            ..EnvelopeDraft::new("chat", json!({"text": "x"}))
        }
        .seal("alice");
        assert_eq!(kept.id, id);

        let assigned = EnvelopeDraft::new("chat", json!({"text": "y"})).seal("alice");
        assert_ne!(assigned.id, Uuid::nil());
    }

    #[test]
    fn correlation_accepts_string_or_list() {
        let id = Uuid::new_v4();
        let single: EnvelopeDraft = serde_json::from_value(json!({
            "kind": "mcp/response",
            "correlation_id": id.to_string(),
        }))
        .unwrap();
        assert_eq!(single.correlation_id, vec![id]);

        let many: EnvelopeDraft = serde_json::from_value(json!({
            "kind": "mcp/response",
            "correlation_id": [id.to_string()],
        }))
        .unwrap();
        assert_eq!(many.correlation_id, vec![id]);
    }

    #[test]
    fn context_parses_both_shapes() {
        let topic: Context = serde_json::from_value(json!("planning")).unwrap();
        assert_eq!(topic, Context::Topic("planning".into()));

        let op: Context = serde_json::from_value(json!({
            "operation": "push",
            "topic": "planning"
        }))
        .unwrap();
        match op {
            Context::Operation(op) => {
                assert_eq!(op.operation, ContextOp::Push);
                assert_eq!(op.topic.as_deref(), Some("planning"));
            }
            other => panic!("expected operation context, got {other:?}"),
        }
    }

    #[test]
    fn broadcast_addresses_everyone() {
        let env = EnvelopeDraft::new("chat", json!({})).seal("alice");
        assert!(env.is_broadcast());
        assert!(env.addresses("bob"));

        let direct = EnvelopeDraft::new("chat", json!({}))
            .to(vec!["bob".into()])
            .seal("alice");
        assert!(direct.addresses("bob"));
        assert!(!direct.addresses("carol"));
    }

    #[test]
    fn context_pop_must_match_the_innermost_push() {
        let mut stack = ContextStack::new();
        let push = EnvelopeDraft {
            context: Some(Context::Operation(ContextOperation {
                operation: ContextOp::Push,
                topic: Some("planning".into()),
                correlation_id: None,
            })),
            ..EnvelopeDraft::new("chat", json!({}))
        }
        .seal("alice");
        stack.apply(&push).unwrap();
        assert_eq!(stack.open_topics(), vec!["planning"]);

        let bad_pop = EnvelopeDraft {
            context: Some(Context::Operation(ContextOperation {
                operation: ContextOp::Pop,
                topic: Some("review".into()),
                correlation_id: None,
            })),
            ..EnvelopeDraft::new("chat", json!({}))
        }
        .seal("alice");
        assert!(stack.apply(&bad_pop).is_err());

        let good_pop = EnvelopeDraft {
            context: Some(Context::Operation(ContextOperation {
                operation: ContextOp::Pop,
                topic: Some("planning".into()),
                correlation_id: Some(push.id),
            })),
            ..EnvelopeDraft::new("chat", json!({}))
        }
        .seal("alice");
        stack.apply(&good_pop).unwrap();
        assert!(stack.open_topics().is_empty());

        // Popping an empty chain is malformed.
        assert!(stack.apply(&good_pop).is_err());
    }

    #[test]
    fn context_resume_truncates_nested_topics() {
        let mut stack = ContextStack::new();
        for topic in ["outer", "middle", "inner"] {
            let push = EnvelopeDraft {
                context: Some(Context::Operation(ContextOperation {
                    operation: ContextOp::Push,
                    topic: Some(topic.into()),
                    correlation_id: None,
                })),
                ..EnvelopeDraft::new("chat", json!({}))
            }
            .seal("alice");
            stack.apply(&push).unwrap();
        }

        let resume = EnvelopeDraft {
            context: Some(Context::Operation(ContextOperation {
                operation: ContextOp::Resume,
                topic: Some("outer".into()),
                correlation_id: None,
            })),
            ..EnvelopeDraft::new("chat", json!({}))
        }
        .seal("alice");
        stack.apply(&resume).unwrap();
        assert_eq!(stack.open_topics(), vec!["outer"]);
    }

    #[test]
    fn protocol_version_gate() {
        assert!(protocol_supported("mew/v0.4"));
        assert!(protocol_supported("mew/v0.3"));
        assert!(!protocol_supported("mew/v1.0"));
        assert!(!protocol_supported("other/v1"));
    }
}
