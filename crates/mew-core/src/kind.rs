// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical envelope kind catalog and family predicates.
//!
//! Kinds are namespaced strings. The routing layer matches on the kind only;
//! payloads stay opaque.

/// Initial participant snapshot, server to the joining peer.
pub const SYSTEM_WELCOME: &str = "system/welcome";
/// Capability or protocol error with diagnostics.
pub const SYSTEM_ERROR: &str = "system/error";
/// Join/leave notification, server to the space.
pub const SYSTEM_PRESENCE: &str = "system/presence";

/// Free-form human-readable text.
pub const CHAT: &str = "chat";
/// Chat receipt acknowledgement.
pub const CHAT_ACKNOWLEDGE: &str = "chat/acknowledge";
/// Chat cancellation.
pub const CHAT_CANCEL: &str = "chat/cancel";

/// Bridged tool invocation request.
pub const MCP_REQUEST: &str = "mcp/request";
/// Bridged tool invocation response.
pub const MCP_RESPONSE: &str = "mcp/response";
/// Bridged tool notification (no response expected).
pub const MCP_NOTIFICATION: &str = "mcp/notification";
/// Request that a privileged peer perform an action on the sender's behalf.
pub const MCP_PROPOSAL: &str = "mcp/proposal";
/// Decline a proposal.
pub const MCP_REJECT: &str = "mcp/reject";
/// Proposer retracts its own proposal.
pub const MCP_WITHDRAW: &str = "mcp/withdraw";

/// Grant capabilities to a peer.
pub const CAPABILITY_GRANT: &str = "capability/grant";
/// Revoke previously granted capabilities.
pub const CAPABILITY_REVOKE: &str = "capability/revoke";
/// Acknowledgement of a grant or revoke.
pub const CAPABILITY_GRANT_ACK: &str = "capability/grant-ack";

/// Ask the gateway to open a byte stream.
pub const STREAM_REQUEST: &str = "stream/request";
/// Server announcement of an opened stream with authoritative metadata.
pub const STREAM_OPEN: &str = "stream/open";
/// Terminate a stream.
pub const STREAM_CLOSE: &str = "stream/close";

/// Agent reasoning visibility markers.
pub const REASONING_START: &str = "reasoning/start";
/// A single reasoning step.
pub const REASONING_THOUGHT: &str = "reasoning/thought";
/// Reasoning outcome.
pub const REASONING_CONCLUSION: &str = "reasoning/conclusion";
/// Abort an in-progress reasoning sequence.
pub const REASONING_CANCEL: &str = "reasoning/cancel";

/// Suspend delivery to the addressed participant.
pub const PARTICIPANT_PAUSE: &str = "participant/pause";
/// Resume delivery and drain the queue.
pub const PARTICIPANT_RESUME: &str = "participant/resume";
/// Status report from a participant.
pub const PARTICIPANT_STATUS: &str = "participant/status";
/// Elicit a `participant/status` from the addressee.
pub const PARTICIPANT_REQUEST_STATUS: &str = "participant/request-status";
/// Advisory: drop remembered context about a topic.
pub const PARTICIPANT_FORGET: &str = "participant/forget";
/// Advisory: reduce context.
pub const PARTICIPANT_COMPACT: &str = "participant/compact";
/// Compaction finished.
pub const PARTICIPANT_COMPACT_DONE: &str = "participant/compact-done";
/// Advisory: clear participant state.
pub const PARTICIPANT_CLEAR: &str = "participant/clear";
/// Advisory: restart the participant process.
pub const PARTICIPANT_RESTART: &str = "participant/restart";
/// Advisory: shut the participant down.
pub const PARTICIPANT_SHUTDOWN: &str = "participant/shutdown";

/// True for the `mcp/response` family (including sub-kinds such as
/// `mcp/response:tools/call`).
#[must_use]
pub fn is_mcp_response(kind: &str) -> bool {
    kind == MCP_RESPONSE || kind.starts_with("mcp/response:")
}

/// True for the `mcp/request` family.
#[must_use]
pub fn is_mcp_request(kind: &str) -> bool {
    kind == MCP_REQUEST || kind.starts_with("mcp/request:")
}

/// True for kinds the proposal engine must observe.
#[must_use]
pub fn is_proposal_kind(kind: &str) -> bool {
    matches!(kind, MCP_PROPOSAL | MCP_REJECT | MCP_WITHDRAW)
}

/// True for kinds the stream engine must observe.
#[must_use]
pub fn is_stream_kind(kind: &str) -> bool {
    matches!(kind, STREAM_REQUEST | STREAM_CLOSE)
}

/// True for kinds the grant engine must observe.
#[must_use]
pub fn is_capability_kind(kind: &str) -> bool {
    matches!(kind, CAPABILITY_GRANT | CAPABILITY_REVOKE)
}

/// True for the `participant/*` control plane.
#[must_use]
pub fn is_control_kind(kind: &str) -> bool {
    kind.starts_with("participant/")
}
