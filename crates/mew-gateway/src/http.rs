// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP ingress: health reporting and authenticated envelope injection.
//!
//! Injection shares the WebSocket admission pipeline ([`router::ingress`])
//! so the two surfaces cannot diverge: a capability violation over HTTP
//! returns 403 carrying the same diagnostic envelope a socket client would
//! receive as `system/error`.

use crate::{AppState, Counters, router};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use mew_core::{GatewayError, SystemErrorPayload, codec, kind, system_envelope};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Typed HTTP error with a JSON `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    /// Response status.
    pub status: StatusCode,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// Construct an error response.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

/// `GET /health`.
pub async fn cmd_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let spaces = state.spaces.ids().await;
    let connections = state.spaces.total_connections().await;

    let mut open_proposals = 0;
    let mut open_streams = 0;
    for id in &spaces {
        if let Some(handle) = state.spaces.get(id).await {
            let space = handle.state.lock().await;
            open_proposals += space.proposals.open_count();
            open_streams += space.streams.open_count();
        }
    }

    Json(json!({
        "status": "ok",
        "protocol": mew_core::PROTOCOL_VERSION,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "spaces": spaces,
        "connections": connections,
        "open_proposals": open_proposals,
        "open_streams": open_streams,
        "counters": {
            "received": Counters::get(&state.counters.received),
            "delivered": Counters::get(&state.counters.delivered),
            "dropped": Counters::get(&state.counters.dropped),
            "denied": Counters::get(&state.counters.denied),
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct InjectQuery {
    /// Target space id.
    space: String,
}

/// `POST /participants/{id}/messages?space={space}`.
///
/// Synthesizes an envelope with server-assigned `from`, `id`, and `ts`,
/// merging `kind`, `to`, `payload`, `correlation_id`, and `context` from
/// the request body, then runs it through the shared admission pipeline.
pub async fn cmd_inject_message(
    Path(participant_id): Path<String>,
    Query(query): Query<InjectQuery>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(handle) = state.spaces.get(&query.space).await else {
        return ApiError::new(StatusCode::NOT_FOUND, "unknown space").into_response();
    };

    let Some(token) = bearer_token(&headers) else {
        return ApiError::new(StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };
    let resolution = {
        let space = handle.state.lock().await;
        space
            .descriptor
            .resolve_token(&token, Some(&participant_id))
    };
    if resolution.is_none() {
        return ApiError::new(StatusCode::UNAUTHORIZED, "authentication failed").into_response();
    }

    let opts = codec::ParseOptions {
        strict: state.config.strict_envelopes,
    };
    let draft = match codec::parse_draft(&body, opts) {
        Ok(draft) => draft,
        Err(err) => return ApiError::new(StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    match router::ingress(&handle, &participant_id, draft).await {
        Ok(envelope) => (
            StatusCode::ACCEPTED,
            Json(json!({ "id": envelope.id, "ts": envelope.ts })),
        )
            .into_response(),
        Err(err @ GatewayError::CapabilityViolation { .. }) => {
            // Same diagnostic envelope a WebSocket sender would receive.
            let mut payload = SystemErrorPayload::from_error(&err);
            if let GatewayError::CapabilityViolation {
                attempted_kind,
                capability_ids,
                ..
            } = &err
            {
                payload.attempted_kind = Some(attempted_kind.clone());
                payload.capability_ids = Some(capability_ids.clone());
            }
            let envelope = system_envelope(
                kind::SYSTEM_ERROR,
                vec![participant_id],
                serde_json::to_value(payload).unwrap_or_default(),
            );
            (StatusCode::FORBIDDEN, Json(envelope)).into_response()
        }
        Err(err @ GatewayError::MalformedEnvelope { .. })
        | Err(err @ GatewayError::UnsupportedProtocol { .. }) => {
            ApiError::new(StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        Err(err) => {
            ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, err.reason_code()).into_response()
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}
