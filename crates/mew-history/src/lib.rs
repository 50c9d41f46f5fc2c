// SPDX-License-Identifier: MIT OR Apache-2.0
//! mew-history
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Append-only JSONL logs for a space: the envelope history (every
//! admission decision and delivery attempt) and the capability decision
//! log. Records are funneled through a single writer task per log, stamped
//! with a monotonic sequence number, flushed on a short timer and on
//! shutdown, and rotated by size into numbered siblings.
//!
//! The history log is the authoritative test oracle for the gateway.

mod reader;
mod writer;

pub use reader::HistoryReader;
pub use writer::{LogHandle, LogWriterConfig, spawn_log_writer};

use chrono::{DateTime, Utc};
use mew_core::Envelope;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default rotation threshold: 8 MiB per JSONL file.
pub const DEFAULT_ROTATE_BYTES: u64 = 8 * 1024 * 1024;

/// Default flush interval for the writer task.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 250;

/// File stem of the envelope history log.
pub const HISTORY_STEM: &str = "envelope-history";

/// File stem of the capability decision log.
pub const DECISIONS_STEM: &str = "capability-decisions";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// What happened to an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventKind {
    /// Envelope was admitted at ingress.
    Received,
    /// Envelope was enqueued to one recipient.
    Delivered,
    /// Delivery to one recipient failed (recipient absent, or admission
    /// denied the envelope entirely).
    Failed,
    /// Envelope was evicted by queue overflow, or a frame was discarded.
    Dropped,
}

/// One line of the envelope history log.
///
/// `seq` is stamped by the writer task; construct records through
/// [`HistoryRecord::received`] and friends, which leave it zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Per-space monotonic sequence number.
    #[serde(default)]
    pub seq: u64,
    /// What happened.
    pub event: HistoryEventKind,
    /// When it happened.
    pub ts: DateTime<Utc>,
    /// Envelope this record describes.
    pub envelope_id: Uuid,
    /// Sender of that envelope.
    pub from: String,
    /// Recipient, for per-recipient delivery records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Envelope kind.
    pub kind: String,
    /// Failure or drop reason code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Correlated envelope ids carried by the envelope.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub correlation_id: Vec<Uuid>,
}

impl HistoryRecord {
    fn base(event: HistoryEventKind, envelope: &Envelope) -> Self {
        Self {
            seq: 0,
            event,
            ts: Utc::now(),
            envelope_id: envelope.id,
            from: envelope.from.clone(),
            to: None,
            kind: envelope.kind.clone(),
            reason: None,
            correlation_id: envelope.correlation_id.clone(),
        }
    }

    /// Envelope admitted at ingress.
    #[must_use]
    pub fn received(envelope: &Envelope) -> Self {
        Self::base(HistoryEventKind::Received, envelope)
    }

    /// Envelope enqueued to `recipient`.
    #[must_use]
    pub fn delivered(envelope: &Envelope, recipient: &str) -> Self {
        Self {
            to: Some(recipient.to_string()),
            ..Self::base(HistoryEventKind::Delivered, envelope)
        }
    }

    /// Delivery to `recipient` failed with `reason`.
    #[must_use]
    pub fn failed(envelope: &Envelope, recipient: Option<&str>, reason: &str) -> Self {
        Self {
            to: recipient.map(str::to_string),
            reason: Some(reason.to_string()),
            ..Self::base(HistoryEventKind::Failed, envelope)
        }
    }

    /// Envelope evicted or frame discarded with `reason`.
    #[must_use]
    pub fn dropped(envelope: &Envelope, recipient: Option<&str>, reason: &str) -> Self {
        Self {
            to: recipient.map(str::to_string),
            reason: Some(reason.to_string()),
            ..Self::base(HistoryEventKind::Dropped, envelope)
        }
    }
}

/// One line of the capability decision log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Per-space monotonic sequence number, stamped by the writer.
    #[serde(default)]
    pub seq: u64,
    /// When the decision was made.
    pub ts: DateTime<Utc>,
    /// Participant whose envelope was checked.
    pub participant: String,
    /// Attempted envelope kind.
    pub kind: String,
    /// Whether the envelope was admitted.
    pub allowed: bool,
    /// Label of the matching capability, when admitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    /// Denial reason, when denied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DecisionRecord {
    /// Record an admission decision.
    #[must_use]
    pub fn new(
        participant: &str,
        kind: &str,
        allowed: bool,
        capability: Option<String>,
        reason: Option<String>,
    ) -> Self {
        Self {
            seq: 0,
            ts: Utc::now(),
            participant: participant.to_string(),
            kind: kind.to_string(),
            allowed,
            capability,
            reason,
        }
    }
}

/// Errors from the history subsystem.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// Filesystem failure.
    #[error("history io: {0}")]
    Io(#[from] std::io::Error),
    /// A log line failed to serialize or parse.
    #[error("history record: {0}")]
    Record(#[from] serde_json::Error),
    /// The writer task is gone.
    #[error("history writer closed")]
    WriterClosed,
}
