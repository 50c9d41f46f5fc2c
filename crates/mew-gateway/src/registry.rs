// SPDX-License-Identifier: MIT OR Apache-2.0
//! Participant registry for one space.
//!
//! Keyed by participant id. A second live connection with the same id takes
//! over (last-writer-wins): the older writer is superseded and its socket
//! closed. Disconnected participants are retained for the reconnect grace
//! window so a returning connection re-attaches to the same queue and
//! pending proposals.

use crate::outbound::OutboundQueue;
use mew_capability::CapabilitySet;
use mew_core::{ContextStack, ParticipantInfo, Presence};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Registry entry for one participant.
#[derive(Debug)]
pub struct ParticipantEntry {
    /// Participant id, unique within the space.
    pub id: String,
    /// Effective capabilities (initial set plus live grants).
    pub capabilities: CapabilitySet,
    /// Current presence.
    pub presence: Presence,
    /// Outbound queue, shared with the connection's writer task.
    pub queue: Arc<OutboundQueue>,
    /// Open sub-conversation chain, validated on every context operation.
    pub context: ContextStack,
    /// When the participant disconnected, for grace-window expiry.
    pub disconnected_at: Option<Instant>,
}

impl ParticipantEntry {
    /// Public descriptor for welcome/presence payloads.
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id.clone(),
            capabilities: self.capabilities.snapshot(),
            presence: self.presence,
        }
    }

    /// True while a live connection is attached.
    pub fn is_connected(&self) -> bool {
        matches!(self.presence, Presence::Connected | Presence::Paused)
    }
}

/// Outcome of a join, telling the connection task what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// First connection for this id.
    Fresh,
    /// Reconnect within the grace window; queue retained.
    Reattached,
    /// An older live connection was superseded.
    TookOver,
}

/// All participants of one space.
#[derive(Debug, Default)]
pub struct Registry {
    participants: HashMap<String, ParticipantEntry>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a participant, creating or re-attaching its entry. Returns the
    /// outcome and the writer generation token for the new connection.
    pub fn join(
        &mut self,
        id: &str,
        capabilities: CapabilitySet,
        envelope_bound: usize,
        stream_bound: usize,
    ) -> (JoinOutcome, Arc<OutboundQueue>, u64) {
        match self.participants.get_mut(id) {
            Some(entry) => {
                let outcome = if entry.is_connected() {
                    JoinOutcome::TookOver
                } else {
                    JoinOutcome::Reattached
                };
                // A reconnect keeps grants it accumulated; a takeover keeps
                // them too, since it is the same authenticated identity.
                entry.presence = Presence::Connected;
                entry.disconnected_at = None;
                let generation = entry.queue.attach_writer();
                (outcome, entry.queue.clone(), generation)
            }
            None => {
                let queue = Arc::new(OutboundQueue::new(envelope_bound, stream_bound));
                let generation = queue.attach_writer();
                self.participants.insert(
                    id.to_string(),
                    ParticipantEntry {
                        id: id.to_string(),
                        capabilities,
                        presence: Presence::Connected,
                        queue: queue.clone(),
                        context: ContextStack::new(),
                        disconnected_at: None,
                    },
                );
                (JoinOutcome::Fresh, queue, generation)
            }
        }
    }

    /// Mark a participant disconnected, starting the grace window.
    pub fn disconnect(&mut self, id: &str) {
        if let Some(entry) = self.participants.get_mut(id) {
            entry.presence = Presence::Disconnected;
            entry.disconnected_at = Some(Instant::now());
        }
    }

    /// Drop entries whose grace window has expired. Returns their ids.
    pub fn expire_disconnected(&mut self, grace: std::time::Duration) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .participants
            .iter()
            .filter(|(_, e)| {
                e.disconnected_at
                    .is_some_and(|at| now.duration_since(at) >= grace)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.participants.remove(id);
        }
        expired
    }

    /// Entry lookup.
    pub fn get(&self, id: &str) -> Option<&ParticipantEntry> {
        self.participants.get(id)
    }

    /// Mutable entry lookup.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut ParticipantEntry> {
        self.participants.get_mut(id)
    }

    /// Ids of currently connected participants, in insertion-independent
    /// sorted order.
    pub fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .participants
            .values()
            .filter(|e| e.is_connected())
            .map(|e| e.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Descriptors of all present participants (connected or in grace).
    pub fn infos(&self) -> Vec<ParticipantInfo> {
        let mut infos: Vec<ParticipantInfo> =
            self.participants.values().map(ParticipantEntry::info).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Number of live connections.
    pub fn connected_count(&self) -> usize {
        self.participants.values().filter(|e| e.is_connected()).count()
    }
}
