// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable reason codes.
//!
//! Every gateway error carries a machine-readable reason code that is
//! embedded in `system/error` payloads and history records, and is
//! guaranteed not to change across patch releases.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family a [`GatewayError`] belongs to, mirroring the propagation
/// policy: sender-fault errors are surfaced, delivery-side errors are only
/// logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Wire-format and version errors.
    Protocol,
    /// Token resolution failures.
    Authentication,
    /// Admission denials.
    Capability,
    /// Delivery-side failures (recipient gone, queue overflow).
    Routing,
    /// Proposal lifecycle violations.
    Proposal,
    /// Stream sub-protocol violations.
    Stream,
    /// Unexpected internal failures. Never leaked verbatim to peers.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Protocol => "protocol",
            Self::Authentication => "authentication",
            Self::Capability => "capability",
            Self::Routing => "routing",
            Self::Proposal => "proposal",
            Self::Stream => "stream",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// GatewayError
// ---------------------------------------------------------------------------

/// Everything that can go wrong between ingress and delivery.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// Envelope failed to parse or is missing a required field.
    #[error("malformed envelope: {detail}")]
    MalformedEnvelope {
        /// What was wrong, naming the offending field where known.
        detail: String,
    },

    /// Envelope carried a protocol tag the gateway does not speak.
    #[error("unsupported protocol version: {version}")]
    UnsupportedProtocol {
        /// The offending version tag.
        version: String,
    },

    /// Bearer token did not resolve to a participant.
    #[error("authentication failed for space {space}")]
    AuthenticationFailed {
        /// Space the join targeted.
        space: String,
    },

    /// No capability matched the attempted envelope.
    #[error("capability violation: {participant} may not send {attempted_kind}")]
    CapabilityViolation {
        /// Sending participant.
        participant: String,
        /// Kind of the denied envelope.
        attempted_kind: String,
        /// Ids of the sender's effective capabilities at decision time.
        capability_ids: Vec<String>,
    },

    /// An explicit recipient is not currently connected.
    #[error("delivery failed: {recipient} is not connected")]
    DeliveryFailed {
        /// The absent recipient.
        recipient: String,
    },

    /// Outbound queue overflow evicted an envelope.
    #[error("dropped: outbound queue for {recipient} overflowed")]
    Dropped {
        /// Whose queue overflowed.
        recipient: String,
    },

    /// Proposal passed its TTL before reaching a terminal state.
    #[error("proposal {proposal_id} expired")]
    ProposalExpired {
        /// The expired proposal id.
        proposal_id: uuid::Uuid,
    },

    /// Fulfillment arrived after the proposal reached a terminal state.
    #[error("duplicate fulfillment for proposal {proposal_id}")]
    DuplicateFulfillment {
        /// The already-terminal proposal id.
        proposal_id: uuid::Uuid,
    },

    /// Granter does not hold the powers it tried to hand out.
    #[error("unauthorized grant by {granter}: {detail}")]
    UnauthorizedGrant {
        /// The offending granter.
        granter: String,
        /// Which check failed.
        detail: String,
    },

    /// Frame arrived for a stream that is already closed.
    #[error("stream {stream_id} is closed")]
    StreamClosed {
        /// The closed stream id.
        stream_id: uuid::Uuid,
    },

    /// Frame sender is not in the server-computed writer set.
    #[error("{writer} is not an authorized writer for stream {stream_id}")]
    UnauthorizedWriter {
        /// The rejected writer.
        writer: String,
        /// Target stream id.
        stream_id: uuid::Uuid,
    },

    /// Stream frame queue overflowed; the stream is closed.
    #[error("stream {stream_id} overflowed and was closed")]
    StreamOverflow {
        /// The overflowed stream id.
        stream_id: uuid::Uuid,
    },

    /// Catch-all for unexpected internal failures.
    #[error("internal error: {detail}")]
    Internal {
        /// Description for the log. Peers only ever see the reason code.
        detail: String,
    },
}

impl GatewayError {
    /// Stable snake_case reason code for wire payloads and history records.
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::MalformedEnvelope { .. } => "malformed_envelope",
            Self::UnsupportedProtocol { .. } => "unsupported_protocol",
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::CapabilityViolation { .. } => "capability_violation",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::Dropped { .. } => "dropped",
            Self::ProposalExpired { .. } => "proposal_expired",
            Self::DuplicateFulfillment { .. } => "duplicate_fulfillment",
            Self::UnauthorizedGrant { .. } => "unauthorized_grant",
            Self::StreamClosed { .. } => "stream_closed",
            Self::UnauthorizedWriter { .. } => "unauthorized_writer",
            Self::StreamOverflow { .. } => "stream_overflow",
            Self::Internal { .. } => "internal",
        }
    }

    /// Category the error belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MalformedEnvelope { .. } | Self::UnsupportedProtocol { .. } => {
                ErrorCategory::Protocol
            }
            Self::AuthenticationFailed { .. } => ErrorCategory::Authentication,
            Self::CapabilityViolation { .. } => ErrorCategory::Capability,
            Self::DeliveryFailed { .. } | Self::Dropped { .. } => ErrorCategory::Routing,
            Self::ProposalExpired { .. }
            | Self::DuplicateFulfillment { .. }
            | Self::UnauthorizedGrant { .. } => ErrorCategory::Proposal,
            Self::StreamClosed { .. }
            | Self::UnauthorizedWriter { .. }
            | Self::StreamOverflow { .. } => ErrorCategory::Stream,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// True when the propagation policy surfaces this error to the sender
    /// as a `system/error` envelope.
    #[must_use]
    pub fn is_sender_fault(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Protocol | ErrorCategory::Capability | ErrorCategory::Proposal
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_stable() {
        let err = GatewayError::CapabilityViolation {
            participant: "restricted".into(),
            attempted_kind: "mcp/request".into(),
            capability_ids: vec!["cap-1".into()],
        };
        assert_eq!(err.reason_code(), "capability_violation");
        assert_eq!(err.category(), ErrorCategory::Capability);
        assert!(err.is_sender_fault());
    }

    #[test]
    fn delivery_errors_stay_quiet() {
        let err = GatewayError::Dropped {
            recipient: "slow".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Routing);
        assert!(!err.is_sender_fault());
    }
}
