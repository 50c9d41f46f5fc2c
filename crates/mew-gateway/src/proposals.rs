// SPDX-License-Identifier: MIT OR Apache-2.0
//! Proposal lifecycle engine.
//!
//! A participant without direct capability for an action broadcasts an
//! `mcp/proposal`; any peer holding the capability may fulfill it by
//! sending the real request correlated to the proposal id. Each proposal is
//! an explicit state machine stored by id; a background sweeper expires
//! stale ones. The engine also remembers which fulfillment request belongs
//! to which proposer so the eventual `mcp/response` reaches both parties.

use chrono::{DateTime, Utc};
use mew_core::{Envelope, GatewayError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ProposalStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a proposal. Exactly one terminal state is ever reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    /// Waiting for a fulfillment, rejection, or withdrawal.
    Pending,
    /// A capable peer sent a fulfillment request.
    Accepted,
    /// A peer declined.
    Rejected,
    /// The proposer retracted it.
    Withdrawn,
    /// The TTL elapsed first.
    Expired,
}

impl ProposalStatus {
    /// Returns `true` if this status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Returns the set of statuses that are valid successors of `self`.
    pub fn valid_transitions(&self) -> &'static [ProposalStatus] {
        match self {
            Self::Pending => &[
                Self::Accepted,
                Self::Rejected,
                Self::Withdrawn,
                Self::Expired,
            ],
            _ => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    pub fn can_transition_to(&self, next: ProposalStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

// ---------------------------------------------------------------------------
// Proposal
// ---------------------------------------------------------------------------

/// One tracked proposal.
#[derive(Debug, Clone)]
pub struct Proposal {
    /// Proposal id (= the proposing envelope's id).
    pub id: Uuid,
    /// Who proposed.
    pub proposer: String,
    /// Recipients the proposal was addressed to (empty = whole space).
    pub intended_recipients: Vec<String>,
    /// The payload the proposer wants executed.
    pub payload: serde_json::Value,
    /// Current state.
    pub status: ProposalStatus,
    /// Deadline for reaching a terminal state.
    pub expires_at: DateTime<Utc>,
    /// Who fulfilled it, once accepted.
    pub fulfiller: Option<String>,
}

// ---------------------------------------------------------------------------
// ProposalEngine
// ---------------------------------------------------------------------------

/// All proposals of one space, plus the response routing table.
#[derive(Debug, Default)]
pub struct ProposalEngine {
    proposals: HashMap<Uuid, Proposal>,
    /// Fulfillment request id → proposer, so responses fan out to both.
    response_routes: HashMap<Uuid, String>,
}

impl ProposalEngine {
    /// Empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new proposal from its envelope.
    pub fn register(&mut self, envelope: &Envelope, ttl: chrono::Duration) {
        self.proposals.insert(
            envelope.id,
            Proposal {
                id: envelope.id,
                proposer: envelope.from.clone(),
                intended_recipients: envelope.to.clone(),
                payload: envelope.payload.clone(),
                status: ProposalStatus::Pending,
                expires_at: envelope.ts + ttl,
                fulfiller: None,
            },
        );
    }

    /// Observe a potential fulfillment: a request envelope whose
    /// correlation set names a tracked proposal.
    ///
    /// Returns the proposal id on first fulfillment. A fulfillment of an
    /// already-terminal proposal is reported as
    /// [`GatewayError::DuplicateFulfillment`]; envelopes unrelated to any
    /// proposal return `Ok(None)`.
    pub fn on_fulfillment(&mut self, envelope: &Envelope) -> Result<Option<Uuid>, GatewayError> {
        for correlated in &envelope.correlation_id {
            let Some(proposal) = self.proposals.get_mut(correlated) else {
                continue;
            };
            if proposal.status.is_terminal() {
                return Err(GatewayError::DuplicateFulfillment {
                    proposal_id: proposal.id,
                });
            }
            proposal.status = ProposalStatus::Accepted;
            proposal.fulfiller = Some(envelope.from.clone());
            let proposer = proposal.proposer.clone();
            self.response_routes.insert(envelope.id, proposer);
            return Ok(Some(*correlated));
        }
        Ok(None)
    }

    /// Observe an `mcp/reject`. The first reject of a pending proposal
    /// terminates it.
    pub fn on_reject(&mut self, envelope: &Envelope) -> Option<Uuid> {
        self.terminate_correlated(envelope, ProposalStatus::Rejected, None)
    }

    /// Observe an `mcp/withdraw`. Only the proposer may withdraw.
    pub fn on_withdraw(&mut self, envelope: &Envelope) -> Option<Uuid> {
        self.terminate_correlated(
            envelope,
            ProposalStatus::Withdrawn,
            Some(envelope.from.as_str()),
        )
    }

    fn terminate_correlated(
        &mut self,
        envelope: &Envelope,
        status: ProposalStatus,
        required_proposer: Option<&str>,
    ) -> Option<Uuid> {
        for correlated in &envelope.correlation_id {
            if let Some(proposal) = self.proposals.get_mut(correlated) {
                if let Some(required) = required_proposer
                    && proposal.proposer != required
                {
                    continue;
                }
                if proposal.status.can_transition_to(status) {
                    proposal.status = status;
                    return Some(*correlated);
                }
            }
        }
        None
    }

    /// Extra delivery targets for a response envelope: when it correlates
    /// to a fulfillment request, the original proposer gets a copy.
    pub fn extra_recipients(&self, envelope: &Envelope) -> Vec<String> {
        envelope
            .correlation_id
            .iter()
            .filter_map(|id| self.response_routes.get(id))
            .cloned()
            .collect()
    }

    /// Expire pending proposals past their deadline. Returns the expired
    /// proposals for notice emission.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<Proposal> {
        let mut expired = Vec::new();
        for proposal in self.proposals.values_mut() {
            if proposal.status == ProposalStatus::Pending && proposal.expires_at <= now {
                proposal.status = ProposalStatus::Expired;
                expired.push(proposal.clone());
            }
        }
        expired
    }

    /// Look up a proposal.
    pub fn get(&self, id: Uuid) -> Option<&Proposal> {
        self.proposals.get(&id)
    }

    /// Number of pending proposals.
    pub fn open_count(&self) -> usize {
        self.proposals
            .values()
            .filter(|p| p.status == ProposalStatus::Pending)
            .count()
    }
}
