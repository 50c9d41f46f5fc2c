// SPDX-License-Identifier: MIT OR Apache-2.0
//! WebSocket connection manager.
//!
//! Accepts the upgrade, resolves the bearer token to an identity and
//! capability set, registers the participant, sends `system/welcome`, and
//! runs the two per-connection tasks: a reader consuming inbound frames and
//! a writer draining the outbound queue. Text frames carry envelope JSON;
//! binary frames (or `#stream:`-prefixed text frames) carry stream data
//! tagged with the stream id.

use crate::outbound::{OutboundFrame, OutboundQueue, PopOutcome};
use crate::registry::JoinOutcome;
use crate::{AppState, Counters, SpaceHandle, router};
use axum::{
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use mew_capability::CapabilitySet;
use mew_core::{
    GatewayError, PresenceEvent, PresencePayload, SystemErrorPayload, WelcomePayload, codec, kind,
    system_envelope,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Close code for authentication failures, per the error design.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;
/// Close code for protocol errors (malformed frames, bad version).
pub const CLOSE_PROTOCOL_ERROR: u16 = 4400;
/// Normal supersession by a newer connection with the same identity.
pub const CLOSE_SUPERSEDED: u16 = 4409;

/// Reserved prefix marking a text frame as stream data:
/// `#stream:<stream-id>:<bytes>`.
const STREAM_TEXT_PREFIX: &str = "#stream:";

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Bearer token, as an alternative to the `Authorization` header.
    token: Option<String>,
    /// Requested participant id, needed for `[defaults]` fallback tokens.
    participant: Option<String>,
}

/// `GET /ws/{space}` upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(space_id): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(handle) = state.spaces.get(&space_id).await else {
        return (StatusCode::NOT_FOUND, "unknown space").into_response();
    };

    let Some(token) = bearer_token(&headers).or(query.token) else {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };

    let resolution = {
        let space = handle.state.lock().await;
        space
            .descriptor
            .resolve_token(&token, query.participant.as_deref())
    };
    let Some(resolution) = resolution else {
        debug!(space = %space_id, "token did not resolve; rejecting join");
        return (StatusCode::UNAUTHORIZED, "authentication failed").into_response();
    };

    let capabilities = match CapabilitySet::compile(&resolution.capabilities) {
        Ok(set) => set,
        Err(e) => {
            warn!(space = %space_id, participant = %resolution.participant_id, error = %e, "capability compile failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "bad capability config").into_response();
        }
    };

    let participant_id = resolution.participant_id;
    ws.on_upgrade(move |socket| {
        run_connection(state, handle, participant_id, capabilities, socket)
    })
}

/// Extract a bearer token from the `Authorization` header.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

async fn run_connection(
    state: Arc<AppState>,
    handle: Arc<SpaceHandle>,
    participant_id: String,
    capabilities: CapabilitySet,
    socket: WebSocket,
) {
    Counters::incr(&state.counters.connections);

    // Join and snapshot the space in one critical section so the welcome
    // is consistent with the presence everyone else sees.
    let (outcome, queue, generation, welcome) = {
        let mut space = handle.state.lock().await;
        let (outcome, queue, generation) = space.registry.join(
            &participant_id,
            capabilities,
            handle.config.envelope_queue_bound,
            handle.config.stream_queue_bound,
        );
        let you = space
            .registry
            .get(&participant_id)
            .map(|e| e.info())
            .expect("joined participant present");
        let participants = space
            .registry
            .infos()
            .into_iter()
            .filter(|p| p.id != participant_id)
            .collect();
        let welcome = WelcomePayload {
            you,
            participants,
            streams: space.streams.active(),
            protocol: mew_core::PROTOCOL_VERSION.to_string(),
        };
        (outcome, queue, generation, welcome)
    };

    info!(space = %handle.id, participant = %participant_id, ?outcome, "participant joined");

    let welcome_envelope = system_envelope(
        kind::SYSTEM_WELCOME,
        vec![participant_id.clone()],
        serde_json::to_value(&welcome).unwrap_or_default(),
    );
    router::route_system(&handle, welcome_envelope).await;

    // A takeover replaces the socket of a still-present participant, so
    // peers never saw a leave and get no second join.
    if outcome != JoinOutcome::TookOver {
        broadcast_presence(&handle, &participant_id, PresenceEvent::Join).await;
    }

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(writer_task(
        sink,
        queue.clone(),
        generation,
        handle.config.heartbeat_interval,
    ));

    // Reader loop: serialized admission per sender, idle timeout enforced
    // across heartbeats.
    loop {
        let next = tokio::time::timeout(handle.config.idle_timeout, stream.next()).await;
        let message = match next {
            Err(_) => {
                debug!(space = %handle.id, participant = %participant_id, "idle timeout");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                if let Some((stream_id, data)) = parse_text_stream_frame(&text) {
                    router::ingress_stream_frame(&handle, &participant_id, stream_id, data).await;
                } else if !handle_envelope_text(&handle, &participant_id, &queue, &text).await {
                    break;
                }
            }
            Message::Binary(bytes) => match parse_binary_stream_frame(&bytes) {
                Some((stream_id, data)) => {
                    router::ingress_stream_frame(&handle, &participant_id, stream_id, data).await;
                }
                None => {
                    debug!(space = %handle.id, participant = %participant_id, "undersized binary frame ignored");
                }
            },
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }

    // If a newer connection took the queue over, the participant is still
    // present; only the superseded socket goes away.
    let still_current = {
        let mut space = handle.state.lock().await;
        let current = space
            .registry
            .get(&participant_id)
            .is_some_and(|e| e.queue.generation() == generation);
        if current {
            space.registry.disconnect(&participant_id);
        }
        current
    };
    if still_current {
        broadcast_presence(&handle, &participant_id, PresenceEvent::Leave).await;
        info!(space = %handle.id, participant = %participant_id, "participant disconnected");
    }

    writer.abort();
    Counters::decr(&state.counters.connections);
}

/// Parse and route one inbound envelope text frame. Returns `false` when
/// the connection must close (protocol errors).
async fn handle_envelope_text(
    handle: &SpaceHandle,
    participant_id: &str,
    queue: &Arc<OutboundQueue>,
    text: &str,
) -> bool {
    let opts = codec::ParseOptions {
        strict: handle.config.strict_envelopes,
    };
    let draft = match codec::parse_draft(text, opts) {
        Ok(draft) => draft,
        Err(err) => {
            emit_error(handle, participant_id, &err, None).await;
            queue.push(OutboundFrame::Close {
                code: CLOSE_PROTOCOL_ERROR,
                reason: err.reason_code().to_string(),
            });
            return false;
        }
    };
    let offending_id = draft.id;

    match router::ingress(handle, participant_id, draft).await {
        Ok(_) => true,
        Err(err) => match &err {
            GatewayError::MalformedEnvelope { .. } | GatewayError::UnsupportedProtocol { .. } => {
                emit_error(handle, participant_id, &err, offending_id).await;
                queue.push(OutboundFrame::Close {
                    code: CLOSE_PROTOCOL_ERROR,
                    reason: err.reason_code().to_string(),
                });
                false
            }
            _ if err.is_sender_fault() => {
                emit_error(handle, participant_id, &err, offending_id).await;
                true
            }
            _ => {
                // Delivery-side problems are logged, never surfaced.
                debug!(participant = %participant_id, error = %err, "envelope not routed");
                true
            }
        },
    }
}

/// Route a `system/error` diagnostic back to the offending sender, through
/// the router so the delivery is in the history log like any other.
async fn emit_error(
    handle: &SpaceHandle,
    participant_id: &str,
    err: &GatewayError,
    offending_id: Option<Uuid>,
) {
    let mut payload = SystemErrorPayload::from_error(err);
    payload.envelope_id = offending_id;
    if let GatewayError::CapabilityViolation {
        attempted_kind,
        capability_ids,
        ..
    } = err
    {
        payload.attempted_kind = Some(attempted_kind.clone());
        payload.capability_ids = Some(capability_ids.clone());
    }
    let mut envelope = system_envelope(
        kind::SYSTEM_ERROR,
        vec![participant_id.to_string()],
        serde_json::to_value(payload).unwrap_or_default(),
    );
    if let Some(id) = offending_id {
        envelope.correlation_id = vec![id];
    }
    router::route_system(handle, envelope).await;
}

/// Tell everyone else about a join or leave. The subject already knows:
/// joiners get the welcome snapshot, leavers are gone.
async fn broadcast_presence(handle: &SpaceHandle, participant_id: &str, event: PresenceEvent) {
    let (participant, audience) = {
        let space = handle.state.lock().await;
        let audience: Vec<String> = space
            .registry
            .connected_ids()
            .into_iter()
            .filter(|id| id != participant_id)
            .collect();
        (space.registry.get(participant_id).map(|e| e.info()), audience)
    };
    let Some(participant) = participant else {
        return;
    };
    if audience.is_empty() {
        return;
    }
    let payload = PresencePayload { event, participant };
    let envelope = system_envelope(
        kind::SYSTEM_PRESENCE,
        audience,
        serde_json::to_value(payload).unwrap_or_default(),
    );
    router::route_system(handle, envelope).await;
}

// ---------------------------------------------------------------------------
// Frame codecs
// ---------------------------------------------------------------------------

/// Binary stream frame: 16-byte stream id, then the payload.
fn parse_binary_stream_frame(bytes: &[u8]) -> Option<(Uuid, Vec<u8>)> {
    if bytes.len() < 16 {
        return None;
    }
    let id = Uuid::from_slice(&bytes[..16]).ok()?;
    Some((id, bytes[16..].to_vec()))
}

/// Text stream frame: `#stream:<uuid>:<payload>`.
fn parse_text_stream_frame(text: &str) -> Option<(Uuid, Vec<u8>)> {
    let rest = text.strip_prefix(STREAM_TEXT_PREFIX)?;
    let (id, payload) = rest.split_once(':')?;
    let id = Uuid::parse_str(id).ok()?;
    Some((id, payload.as_bytes().to_vec()))
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    queue: Arc<OutboundQueue>,
    generation: u64,
    heartbeat: std::time::Duration,
) {
    let mut ping = tokio::time::interval(heartbeat);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            outcome = queue.pop(generation) => match outcome {
                PopOutcome::Frame(OutboundFrame::Envelope(envelope)) => {
                    let Ok(text) = codec::to_canonical_string(&envelope) else {
                        continue;
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                PopOutcome::Frame(OutboundFrame::StreamData { stream_id, data, .. }) => {
                    let mut frame = Vec::with_capacity(16 + data.len());
                    frame.extend_from_slice(stream_id.as_bytes());
                    frame.extend_from_slice(&data);
                    if sink.send(Message::Binary(frame.into())).await.is_err() {
                        break;
                    }
                }
                PopOutcome::Frame(OutboundFrame::Close { code, reason }) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                PopOutcome::Superseded => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_SUPERSEDED,
                            reason: "superseded by a newer connection".into(),
                        })))
                        .await;
                    break;
                }
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_frames_carry_the_stream_id_prefix() {
        let id = Uuid::new_v4();
        let mut frame = id.as_bytes().to_vec();
        frame.extend_from_slice(b"position-1");
        let (parsed, data) = parse_binary_stream_frame(&frame).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(data, b"position-1");

        assert!(parse_binary_stream_frame(&[0u8; 8]).is_none());
    }

    #[test]
    fn text_frames_use_the_reserved_prefix() {
        let id = Uuid::new_v4();
        let text = format!("#stream:{id}:payload:with:colons");
        let (parsed, data) = parse_text_stream_frame(&text).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(data, b"payload:with:colons");

        assert!(parse_text_stream_frame("{\"kind\":\"chat\"}").is_none());
        assert!(parse_text_stream_frame("#stream:not-a-uuid:x").is_none());
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer shh".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("shh"));

        let mut basic = HeaderMap::new();
        basic.insert("authorization", "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&basic), None);
    }
}
