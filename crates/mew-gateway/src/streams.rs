// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stream sub-protocol engine.
//!
//! Streams carry framed opaque bytes over the same connection, out-of-band
//! from envelopes. Stream ids, owners, and writer sets are always
//! server-determined; client-supplied values for those fields are ignored.

use mew_core::{Envelope, GatewayError, StreamDirection, StreamInfo, StreamStatus};
use serde::Deserialize;
use std::collections::HashMap;
use uuid::Uuid;

/// The fields of `stream/request` the engine reads. Anything else in the
/// payload (`authorizedWriters`, `participantId`, `owner`, …) is
/// deliberately not represented here and thus never consulted.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamRequestPayload {
    /// Who writes: the owner (`upload`) or the targets (`download`).
    pub direction: StreamDirection,
    /// Restrict frames to these participants. Absent means the whole space.
    #[serde(default)]
    pub target: Option<Vec<String>>,
    /// Human-readable purpose.
    #[serde(default)]
    pub description: Option<String>,
}

/// Where the frames of a stream go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameAudience {
    /// Every space member, owner included.
    Space,
    /// Exactly these participants.
    Targets(Vec<String>),
}

/// All streams of one space.
#[derive(Debug, Default)]
pub struct StreamEngine {
    streams: HashMap<Uuid, StreamInfo>,
}

impl StreamEngine {
    /// Empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a stream for a `stream/request` envelope. The owner is the
    /// authenticated sender; the writer set is computed from the direction.
    /// Returns the authoritative metadata for the `stream/open`
    /// announcement.
    pub fn open(&mut self, envelope: &Envelope) -> Result<StreamInfo, GatewayError> {
        let payload: StreamRequestPayload = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| GatewayError::MalformedEnvelope {
                detail: format!("stream/request payload: {e}"),
            })?;

        let owner = envelope.from.clone();
        let authorized_writers = match payload.direction {
            StreamDirection::Upload => vec![owner.clone()],
            StreamDirection::Download => payload.target.clone().unwrap_or_default(),
        };

        let info = StreamInfo {
            stream_id: Uuid::new_v4(),
            owner,
            authorized_writers,
            target: payload.target,
            encoding: "binary".to_string(),
            status: StreamStatus::Open,
        };
        self.streams.insert(info.stream_id, info.clone());
        Ok(info)
    }

    /// Authorize a data frame from `sender` and resolve its audience.
    pub fn authorize_frame(
        &self,
        stream_id: Uuid,
        sender: &str,
    ) -> Result<FrameAudience, GatewayError> {
        let Some(info) = self.streams.get(&stream_id) else {
            return Err(GatewayError::StreamClosed { stream_id });
        };
        if info.status == StreamStatus::Closed {
            return Err(GatewayError::StreamClosed { stream_id });
        }
        if !info.authorized_writers.iter().any(|w| w == sender) {
            return Err(GatewayError::UnauthorizedWriter {
                writer: sender.to_string(),
                stream_id,
            });
        }
        Ok(match &info.target {
            Some(targets) => FrameAudience::Targets(targets.clone()),
            None => FrameAudience::Space,
        })
    }

    /// Close a stream. Only the owner may close; the gateway itself closes
    /// through [`StreamEngine::force_close`].
    pub fn close(&mut self, stream_id: Uuid, sender: &str) -> Result<StreamInfo, GatewayError> {
        let Some(info) = self.streams.get_mut(&stream_id) else {
            return Err(GatewayError::StreamClosed { stream_id });
        };
        if info.status == StreamStatus::Closed {
            return Err(GatewayError::StreamClosed { stream_id });
        }
        if info.owner != sender {
            return Err(GatewayError::UnauthorizedWriter {
                writer: sender.to_string(),
                stream_id,
            });
        }
        info.status = StreamStatus::Closed;
        Ok(info.clone())
    }

    /// Close a stream from the gateway side (overflow, shutdown).
    pub fn force_close(&mut self, stream_id: Uuid) -> Option<StreamInfo> {
        let info = self.streams.get_mut(&stream_id)?;
        if info.status == StreamStatus::Closed {
            return None;
        }
        info.status = StreamStatus::Closed;
        Some(info.clone())
    }

    /// Streams that are currently open, for the welcome snapshot.
    pub fn active(&self) -> Vec<StreamInfo> {
        let mut open: Vec<StreamInfo> = self
            .streams
            .values()
            .filter(|s| s.status == StreamStatus::Open)
            .cloned()
            .collect();
        open.sort_by_key(|s| s.stream_id);
        open
    }

    /// Number of open streams.
    pub fn open_count(&self) -> usize {
        self.streams
            .values()
            .filter(|s| s.status == StreamStatus::Open)
            .count()
    }
}
