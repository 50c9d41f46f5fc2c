// SPDX-License-Identifier: MIT OR Apache-2.0
//! The space router: admission, sub-engine hooks, and fan-out.
//!
//! Both ingress paths (WebSocket frames and HTTP injection) funnel through
//! [`ingress`], so admission cannot diverge between surfaces. Every
//! admission decision lands in the decision log and every delivery attempt
//! (enqueue, failure, drop) lands in the envelope history, exactly once.

use crate::outbound::{OutboundFrame, StreamPush};
use crate::space::{SpaceHandle, SpaceState};
use crate::streams::FrameAudience;
use crate::{Counters, control};
use chrono::Utc;
use mew_core::{
    Envelope, EnvelopeDraft, GatewayError, SYSTEM_PARTICIPANT, SystemErrorPayload, kind,
    protocol_supported, system_envelope,
};
use mew_history::{DecisionRecord, HistoryEventKind, HistoryRecord};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

/// Admit and route one inbound envelope from an authenticated sender.
///
/// Returns the sealed envelope on success. A returned error means the
/// envelope was not routed; whether it is surfaced back to the sender is
/// the caller's call, per [`GatewayError::is_sender_fault`].
pub async fn ingress(
    handle: &SpaceHandle,
    sender: &str,
    draft: EnvelopeDraft,
) -> Result<Envelope, GatewayError> {
    if let Some(tag) = &draft.protocol
        && !protocol_supported(tag)
    {
        return Err(GatewayError::UnsupportedProtocol {
            version: tag.clone(),
        });
    }
    let envelope = draft.seal(sender);

    let mut guard = handle.state.lock().await;
    let state = &mut *guard;

    // Admission against the sender's capabilities at this instant. Grants
    // and revokes from earlier envelopes of the same sender are already
    // visible because ingress is serialized per sender. A sender with no
    // registry entry is an HTTP injection while offline; admission then
    // uses the declared set from the descriptor.
    let (decision, labels) = match state.registry.get(sender) {
        Some(entry) => (entry.capabilities.admit(&envelope), entry.capabilities.labels()),
        None => {
            let declared = state
                .descriptor
                .participants
                .get(sender)
                .map(|p| p.capabilities.clone())
                .unwrap_or_default();
            let set = mew_capability::CapabilitySet::compile(&declared).map_err(|e| {
                GatewayError::Internal {
                    detail: format!("declared capabilities for {sender}: {e}"),
                }
            })?;
            (set.admit(&envelope), set.labels())
        }
    };
    append_decision(
        handle,
        DecisionRecord::new(
            sender,
            &envelope.kind,
            decision.allowed,
            decision.capability.clone(),
            decision.reason.clone(),
        ),
    );
    if !decision.allowed {
        Counters::incr(&handle.counters.denied);
        return Err(GatewayError::CapabilityViolation {
            participant: sender.to_string(),
            attempted_kind: envelope.kind.clone(),
            capability_ids: labels,
        });
    }

    // Shape invariants the codec cannot see: responses must correlate to a
    // request, and context pops must close the matching push.
    if kind::is_mcp_response(&envelope.kind) && envelope.correlation_id.is_empty() {
        return Err(GatewayError::MalformedEnvelope {
            detail: "mcp/response without a correlation_id".to_string(),
        });
    }
    if let Some(entry) = state.registry.get_mut(sender)
        && let Err(err) = entry.context.apply(&envelope)
    {
        return Err(err);
    }

    Counters::incr(&handle.counters.received);
    append_history(handle, HistoryRecord::received(&envelope));

    // Sub-engine hooks: after admission, before delivery. They may refuse
    // the envelope, synthesize follow-ups, or widen the delivery set.
    let mut followups: Vec<Envelope> = Vec::new();
    let mut extra_recipients: Vec<String> = Vec::new();

    match envelope.kind.as_str() {
        kind::MCP_PROPOSAL => {
            let ttl = chrono::Duration::from_std(handle.config.proposal_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
            state.proposals.register(&envelope, ttl);
        }
        kind::MCP_REJECT => {
            state.proposals.on_reject(&envelope);
        }
        kind::MCP_WITHDRAW => {
            state.proposals.on_withdraw(&envelope);
        }
        kind::CAPABILITY_GRANT => {
            match state.grants.apply_grant(&mut state.registry, &envelope) {
                Ok(ack) => followups.push(ack),
                Err(err) => {
                    append_history(
                        handle,
                        HistoryRecord::failed(&envelope, None, err.reason_code()),
                    );
                    return Err(err);
                }
            }
        }
        kind::CAPABILITY_REVOKE => {
            match state.grants.apply_revoke(&mut state.registry, &envelope) {
                Ok(ack) => followups.push(ack),
                Err(err) => {
                    append_history(
                        handle,
                        HistoryRecord::failed(&envelope, None, err.reason_code()),
                    );
                    return Err(err);
                }
            }
        }
        kind::STREAM_REQUEST => match state.streams.open(&envelope) {
            Ok(info) => {
                // Targeted opens go to the target set plus the owner, who
                // needs the server-assigned stream id; untargeted opens go
                // to the whole space.
                let to = match info.target.clone() {
                    Some(mut targets) => {
                        if !targets.contains(&info.owner) {
                            targets.push(info.owner.clone());
                        }
                        targets
                    }
                    None => Vec::new(),
                };
                let mut open = system_envelope(
                    kind::STREAM_OPEN,
                    to,
                    serde_json::to_value(&info).unwrap_or_default(),
                );
                open.correlation_id = vec![envelope.id];
                followups.push(open);
            }
            Err(err) => {
                append_history(
                    handle,
                    HistoryRecord::failed(&envelope, None, err.reason_code()),
                );
                return Err(err);
            }
        },
        kind::STREAM_CLOSE => {
            #[derive(Deserialize)]
            struct ClosePayload {
                stream_id: Uuid,
            }
            let parsed: Result<ClosePayload, _> =
                serde_json::from_value(envelope.payload.clone());
            match parsed {
                Ok(p) => {
                    if let Err(err) = state.streams.close(p.stream_id, sender) {
                        append_history(
                            handle,
                            HistoryRecord::failed(&envelope, None, err.reason_code()),
                        );
                        return Err(err);
                    }
                }
                Err(e) => {
                    let err = GatewayError::MalformedEnvelope {
                        detail: format!("stream/close payload: {e}"),
                    };
                    append_history(
                        handle,
                        HistoryRecord::failed(&envelope, None, err.reason_code()),
                    );
                    return Err(err);
                }
            }
        }
        k if kind::is_mcp_request(k) && !envelope.correlation_id.is_empty() => {
            match state.proposals.on_fulfillment(&envelope) {
                Ok(Some(proposal_id)) => {
                    debug!(space = %state.id, proposal = %proposal_id, fulfiller = %sender, "proposal fulfilled");
                }
                Ok(None) => {}
                Err(err) => {
                    // The request still routes; only the state transition
                    // is refused.
                    warn!(space = %state.id, error = %err, "late fulfillment ignored");
                    append_history(
                        handle,
                        HistoryRecord::failed(&envelope, None, err.reason_code()),
                    );
                }
            }
        }
        k if kind::is_mcp_response(k) => {
            extra_recipients = state.proposals.extra_recipients(&envelope);
        }
        k if kind::is_control_kind(k) => {
            control::apply(state, &envelope);
        }
        _ => {}
    }

    deliver_locked(state, handle, &envelope, &extra_recipients);
    for followup in followups {
        deliver_locked(state, handle, &followup, &[]);
    }

    Ok(envelope)
}

/// Route a gateway-synthesized envelope (welcome, presence, error notices).
/// System envelopes bypass admission; they still produce history records.
pub async fn route_system(handle: &SpaceHandle, envelope: Envelope) {
    let mut guard = handle.state.lock().await;
    let state = &mut *guard;
    deliver_locked(state, handle, &envelope, &[]);
}

/// Resolve recipients and enqueue once per recipient, under the space lock.
fn deliver_locked(
    state: &mut SpaceState,
    handle: &SpaceHandle,
    envelope: &Envelope,
    extras: &[String],
) {
    let mut recipients: Vec<String> = if envelope.to.is_empty() {
        state
            .registry
            .connected_ids()
            .into_iter()
            .filter(|id| handle.config.echo_to_self || id != &envelope.from)
            .collect()
    } else {
        envelope.to.clone()
    };
    for extra in extras {
        if !recipients.contains(extra) {
            recipients.push(extra.clone());
        }
    }

    let mut unreachable: Vec<String> = Vec::new();
    for recipient in &recipients {
        match state.registry.get(recipient) {
            Some(entry) => {
                let evicted = entry
                    .queue
                    .push(OutboundFrame::Envelope(Box::new(envelope.clone())));
                append_history(handle, HistoryRecord::delivered(envelope, recipient));
                Counters::incr(&handle.counters.delivered);
                record_eviction(handle, recipient, evicted);
            }
            None => {
                append_history(
                    handle,
                    HistoryRecord::failed(envelope, Some(recipient), "delivery_failed"),
                );
                if envelope.from != SYSTEM_PARTICIPANT
                    && handle
                        .config
                        .notify_sender_kinds
                        .iter()
                        .any(|k| k == &envelope.kind)
                {
                    unreachable.push(recipient.clone());
                }
            }
        }
    }

    // Fire-and-forget by default; critical kinds report back to the sender.
    for recipient in unreachable {
        let error = GatewayError::DeliveryFailed { recipient };
        let mut payload = SystemErrorPayload::from_error(&error);
        payload.envelope_id = Some(envelope.id);
        let mut notice = system_envelope(
            kind::SYSTEM_ERROR,
            vec![envelope.from.clone()],
            serde_json::to_value(payload).unwrap_or_default(),
        );
        notice.correlation_id = vec![envelope.id];
        deliver_locked(state, handle, &notice, &[]);
    }
}

fn record_eviction(handle: &SpaceHandle, recipient: &str, evicted: Option<OutboundFrame>) {
    match evicted {
        Some(OutboundFrame::Envelope(old)) => {
            append_history(
                handle,
                HistoryRecord::dropped(&old, Some(recipient), "queue_overflow"),
            );
            Counters::incr(&handle.counters.dropped);
        }
        Some(OutboundFrame::StreamData {
            stream_id, from, ..
        }) => {
            append_history(
                handle,
                stream_frame_record(
                    HistoryEventKind::Dropped,
                    stream_id,
                    &from,
                    Some(recipient),
                    Some("queue_overflow"),
                ),
            );
            Counters::incr(&handle.counters.dropped);
        }
        Some(OutboundFrame::Close { .. }) | None => {}
    }
}

// ---------------------------------------------------------------------------
// Stream data frames
// ---------------------------------------------------------------------------

/// Authorize and fan out one raw stream frame.
///
/// Unauthorized frames are dropped silently (logged, never surfaced to the
/// writer). A frame that overflows any recipient's stream bound closes the
/// whole stream with a `stream/close` notice.
pub async fn ingress_stream_frame(
    handle: &SpaceHandle,
    sender: &str,
    stream_id: Uuid,
    data: Vec<u8>,
) {
    let mut guard = handle.state.lock().await;
    let state = &mut *guard;

    let audience = match state.streams.authorize_frame(stream_id, sender) {
        Ok(audience) => audience,
        Err(err) => {
            debug!(space = %state.id, stream = %stream_id, writer = %sender, reason = err.reason_code(), "stream frame refused");
            append_history(
                handle,
                stream_frame_record(
                    HistoryEventKind::Dropped,
                    stream_id,
                    sender,
                    None,
                    Some(err.reason_code()),
                ),
            );
            Counters::incr(&handle.counters.dropped);
            return;
        }
    };

    let recipients = match audience {
        FrameAudience::Space => state.registry.connected_ids(),
        FrameAudience::Targets(targets) => targets,
    };

    let mut overflowed = false;
    for recipient in &recipients {
        match state.registry.get(recipient) {
            Some(entry) => match entry.queue.push_stream(stream_id, sender, data.clone()) {
                StreamPush::Enqueued => {
                    append_history(
                        handle,
                        stream_frame_record(
                            HistoryEventKind::Delivered,
                            stream_id,
                            sender,
                            Some(recipient),
                            None,
                        ),
                    );
                    Counters::incr(&handle.counters.delivered);
                }
                StreamPush::Overflow => {
                    overflowed = true;
                    append_history(
                        handle,
                        stream_frame_record(
                            HistoryEventKind::Dropped,
                            stream_id,
                            sender,
                            Some(recipient),
                            Some("stream_overflow"),
                        ),
                    );
                    Counters::incr(&handle.counters.dropped);
                }
            },
            None => {
                append_history(
                    handle,
                    stream_frame_record(
                        HistoryEventKind::Failed,
                        stream_id,
                        sender,
                        Some(recipient),
                        Some("delivery_failed"),
                    ),
                );
            }
        }
    }

    if overflowed && let Some(info) = state.streams.force_close(stream_id) {
        let close = system_envelope(
            kind::STREAM_CLOSE,
            info.target.unwrap_or_default(),
            json!({"stream_id": stream_id, "reason": "stream_overflow"}),
        );
        deliver_locked(state, handle, &close, &[]);
    }
}

/// History record for a raw stream frame; frames have no envelope id, so
/// the stream id stands in.
fn stream_frame_record(
    event: HistoryEventKind,
    stream_id: Uuid,
    from: &str,
    to: Option<&str>,
    reason: Option<&str>,
) -> HistoryRecord {
    HistoryRecord {
        seq: 0,
        event,
        ts: Utc::now(),
        envelope_id: stream_id,
        from: from.to_string(),
        to: to.map(str::to_string),
        kind: "stream/data".to_string(),
        reason: reason.map(str::to_string),
        correlation_id: Vec::new(),
    }
}

fn append_history(handle: &SpaceHandle, record: HistoryRecord) {
    if let Err(e) = handle.history.append(&record) {
        warn!(space = %handle.id, error = %e, "history append failed");
    }
}

fn append_decision(handle: &SpaceHandle, record: DecisionRecord) {
    if let Err(e) = handle.decisions.append(&record) {
        warn!(space = %handle.id, error = %e, "decision append failed");
    }
}
