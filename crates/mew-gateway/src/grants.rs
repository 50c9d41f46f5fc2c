// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dynamic capability grant and revoke.
//!
//! A grant is authorized only when the granter holds the `capability/grant`
//! meta-capability (enforced by normal admission) AND every granted
//! capability is subsumed by the granter's own set, so nobody can hand out
//! powers they do not hold themselves.

use crate::registry::Registry;
use mew_core::{Capability, Envelope, GatewayError, SYSTEM_PARTICIPANT, kind, system_envelope};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

/// Payload of `capability/grant`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantPayload {
    /// Participant receiving the capabilities.
    pub recipient: String,
    /// Capabilities being granted.
    pub capabilities: Vec<Capability>,
    /// Caller-chosen grant id; assigned when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_id: Option<Uuid>,
    /// Free-form justification, echoed in the ack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload of `capability/revoke`. Matches on `grant_id` when present,
/// otherwise on the capability set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokePayload {
    /// Participant losing the capabilities.
    pub recipient: String,
    /// Grant to undo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_id: Option<Uuid>,
    /// Capability shapes to remove when no grant id is given.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<Capability>,
}

/// Record of one applied grant.
#[derive(Debug, Clone)]
pub struct GrantRecord {
    /// Grant id, referenced by revokes.
    pub grant_id: Uuid,
    /// Who granted.
    pub granter: String,
    /// Who received.
    pub recipient: String,
    /// What was granted.
    pub capabilities: Vec<Capability>,
}

/// Applied grants of one space.
#[derive(Debug, Default)]
pub struct GrantEngine {
    grants: HashMap<Uuid, GrantRecord>,
}

impl GrantEngine {
    /// Empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a `capability/grant` envelope: authorize, mutate the
    /// recipient's capability set, and return the ack envelope.
    pub fn apply_grant(
        &mut self,
        registry: &mut Registry,
        envelope: &Envelope,
    ) -> Result<Envelope, GatewayError> {
        let payload: GrantPayload =
            serde_json::from_value(envelope.payload.clone()).map_err(|e| {
                GatewayError::MalformedEnvelope {
                    detail: format!("capability/grant payload: {e}"),
                }
            })?;
        if payload.capabilities.is_empty() {
            return Err(GatewayError::MalformedEnvelope {
                detail: "capability/grant with empty capability list".to_string(),
            });
        }

        let granter = registry.get(&envelope.from).ok_or_else(|| {
            GatewayError::Internal {
                detail: format!("granter {} not in registry", envelope.from),
            }
        })?;
        for cap in &payload.capabilities {
            let covered =
                granter
                    .capabilities
                    .covers(cap)
                    .map_err(|e| GatewayError::MalformedEnvelope {
                        detail: format!("granted capability pattern: {e}"),
                    })?;
            if !covered {
                return Err(GatewayError::UnauthorizedGrant {
                    granter: envelope.from.clone(),
                    detail: format!("granter's own powers do not cover {}", cap.kind),
                });
            }
        }

        let recipient = registry.get_mut(&payload.recipient).ok_or_else(|| {
            GatewayError::DeliveryFailed {
                recipient: payload.recipient.clone(),
            }
        })?;
        let grant_id = payload.grant_id.unwrap_or_else(Uuid::new_v4);
        recipient
            .capabilities
            .extend_granted(&payload.capabilities, grant_id)
            .map_err(|e| GatewayError::MalformedEnvelope {
                detail: format!("granted capability pattern: {e}"),
            })?;

        self.grants.insert(
            grant_id,
            GrantRecord {
                grant_id,
                granter: envelope.from.clone(),
                recipient: payload.recipient.clone(),
                capabilities: payload.capabilities.clone(),
            },
        );

        Ok(ack_envelope(
            envelope,
            grant_id,
            &payload.recipient,
            &payload.capabilities,
            "granted",
        ))
    }

    /// Apply a `capability/revoke` envelope and return the ack envelope.
    pub fn apply_revoke(
        &mut self,
        registry: &mut Registry,
        envelope: &Envelope,
    ) -> Result<Envelope, GatewayError> {
        let payload: RevokePayload =
            serde_json::from_value(envelope.payload.clone()).map_err(|e| {
                GatewayError::MalformedEnvelope {
                    detail: format!("capability/revoke payload: {e}"),
                }
            })?;

        let recipient = registry.get_mut(&payload.recipient).ok_or_else(|| {
            GatewayError::DeliveryFailed {
                recipient: payload.recipient.clone(),
            }
        })?;

        let (grant_id, removed_caps) = match payload.grant_id {
            Some(grant_id) => {
                let removed = recipient.capabilities.revoke_grant(grant_id);
                if removed == 0 {
                    return Err(GatewayError::MalformedEnvelope {
                        detail: format!("no live grant {grant_id} on {}", payload.recipient),
                    });
                }
                let caps = self
                    .grants
                    .remove(&grant_id)
                    .map(|g| g.capabilities)
                    .unwrap_or_default();
                (grant_id, caps)
            }
            None => {
                if payload.capabilities.is_empty() {
                    return Err(GatewayError::MalformedEnvelope {
                        detail: "capability/revoke needs grant_id or capabilities".to_string(),
                    });
                }
                recipient.capabilities.revoke_matching(&payload.capabilities);
                self.grants.retain(|_, g| {
                    !(g.recipient == payload.recipient && g.capabilities == payload.capabilities)
                });
                (Uuid::nil(), payload.capabilities.clone())
            }
        };

        Ok(ack_envelope(
            envelope,
            grant_id,
            &payload.recipient,
            &removed_caps,
            "revoked",
        ))
    }

    /// Number of live grants.
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    /// True when no grants are live.
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

/// `capability/grant-ack` to both parties, correlated to the triggering
/// envelope.
fn ack_envelope(
    trigger: &Envelope,
    grant_id: Uuid,
    recipient: &str,
    capabilities: &[Capability],
    status: &str,
) -> Envelope {
    let mut ack = system_envelope(
        kind::CAPABILITY_GRANT_ACK,
        vec![trigger.from.clone(), recipient.to_string()],
        json!({
            "grant_id": grant_id,
            "recipient": recipient,
            "capabilities": capabilities,
            "status": status,
        }),
    );
    ack.correlation_id = vec![trigger.id];
    debug_assert_eq!(ack.from, SYSTEM_PARTICIPANT);
    ack
}
