// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! mew-participant
#![deny(unsafe_code)]

pub mod backoff;
pub mod session;
pub mod tools;

pub use backoff::ReconnectPolicy;
pub use tools::{ToolError, ToolHandler, ToolRegistry};

use mew_core::{
    Envelope, EnvelopeDraft, GatewayError, StreamDirection, StreamInfo, WelcomePayload, kind,
};
use serde_json::{Value, json};
use session::OutboundMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors & config
// ---------------------------------------------------------------------------

/// Everything that can go wrong on the participant side.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level failure.
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// The gateway refused the join or never sent a welcome.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The connection dropped; in-flight requests are not replayed.
    #[error("connection closed")]
    Disconnected,

    /// A malformed envelope came off the wire.
    #[error(transparent)]
    Envelope(#[from] GatewayError),
}

/// How to reach the gateway.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL, e.g. `ws://127.0.0.1:8700`.
    pub url: String,
    /// Space to join.
    pub space: String,
    /// Bearer token.
    pub token: String,
    /// Requested participant id, required for `[defaults]` tokens.
    pub participant: Option<String>,
    /// Reconnection behavior.
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    /// Config with default reconnect policy.
    pub fn new(
        url: impl Into<String>,
        space: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            space: space.into(),
            token: token.into(),
            participant: None,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Request a specific participant id at join.
    #[must_use]
    pub fn with_participant(mut self, id: impl Into<String>) -> Self {
        self.participant = Some(id.into());
        self
    }

    /// Disable automatic reconnection.
    #[must_use]
    pub fn without_reconnect(mut self) -> Self {
        self.reconnect.enabled = false;
        self
    }

    pub(crate) fn ws_url(&self) -> String {
        match &self.participant {
            Some(id) => format!("{}/ws/{}?participant={id}", self.url, self.space),
            None => format!("{}/ws/{}", self.url, self.space),
        }
    }
}

/// Things the runtime surfaces to the application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The session (re)connected and received its welcome.
    Connected(WelcomePayload),
    /// Any inbound envelope, after correlation handling.
    Envelope(Envelope),
    /// A raw stream data frame.
    StreamData {
        /// Stream the frame belongs to.
        stream_id: Uuid,
        /// Frame bytes.
        data: Vec<u8>,
    },
    /// The connection dropped; pending requests were failed.
    Disconnected,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub(crate) struct ClientShared {
    pub(crate) out_tx: mpsc::UnboundedSender<OutboundMessage>,
    pub(crate) pending: Mutex<HashMap<Uuid, oneshot::Sender<Envelope>>>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) welcome: Mutex<Option<WelcomePayload>>,
    pub(crate) tools: ToolRegistry,
}

impl ClientShared {
    /// Fail every in-flight request; called on disconnect. The runtime
    /// never replays requests across reconnects.
    pub(crate) fn fail_pending(&self) {
        self.pending.lock().expect("pending poisoned").clear();
    }
}

/// Handle to a running participant session.
#[derive(Clone)]
pub struct MewClient {
    shared: Arc<ClientShared>,
}

impl MewClient {
    /// Connect, join the space, and wait for `system/welcome`. The returned
    /// client is live; inbound traffic is processed on background tasks.
    pub async fn connect(config: ClientConfig, tools: ToolRegistry) -> Result<Self, ClientError> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(ClientShared {
            out_tx,
            pending: Mutex::new(HashMap::new()),
            events,
            welcome: Mutex::new(None),
            tools,
        });
        session::start(config, shared.clone(), out_rx).await?;
        Ok(Self { shared })
    }

    /// Subscribe to client events. Slow subscribers may observe lag.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// The welcome payload of the current session.
    pub fn welcome(&self) -> Option<WelcomePayload> {
        self.shared.welcome.lock().expect("welcome poisoned").clone()
    }

    /// Our own participant id, once welcomed.
    pub fn participant_id(&self) -> Option<String> {
        self.welcome().map(|w| w.you.id)
    }

    // -- plain sends --------------------------------------------------------

    /// Send a draft envelope, fire-and-forget. Returns the envelope id.
    pub fn send(&self, mut draft: EnvelopeDraft) -> Result<Uuid, ClientError> {
        let id = *draft.id.get_or_insert_with(Uuid::new_v4);
        let text = serde_json::to_string(&draft).map_err(|e| {
            ClientError::Envelope(GatewayError::Internal {
                detail: format!("serialize draft: {e}"),
            })
        })?;
        self.shared
            .out_tx
            .send(OutboundMessage::Text(text))
            .map_err(|_| ClientError::Disconnected)?;
        Ok(id)
    }

    /// Free-form chat, broadcast or targeted.
    pub fn chat(&self, text: &str, to: Vec<String>) -> Result<Uuid, ClientError> {
        self.send(EnvelopeDraft::new(kind::CHAT, json!({"text": text})).to(to))
    }

    /// Acknowledge a chat envelope back to its sender.
    pub fn chat_acknowledge(&self, chat: &Envelope) -> Result<Uuid, ClientError> {
        self.send(
            EnvelopeDraft::new(kind::CHAT_ACKNOWLEDGE, Value::Null)
                .to(vec![chat.from.clone()])
                .correlated(chat.id),
        )
    }

    /// Cancel one of our own earlier chat envelopes.
    pub fn chat_cancel(&self, chat_id: Uuid) -> Result<Uuid, ClientError> {
        self.send(EnvelopeDraft::new(kind::CHAT_CANCEL, Value::Null).correlated(chat_id))
    }

    /// Reasoning visibility markers (`reasoning/start`, `/thought`, …).
    pub fn reasoning(&self, reasoning_kind: &str, message: &str) -> Result<Uuid, ClientError> {
        self.send(EnvelopeDraft::new(
            reasoning_kind,
            json!({"message": message}),
        ))
    }

    /// Reply to a `participant/request-status` with our status.
    pub fn status_reply(
        &self,
        request: &Envelope,
        status: Value,
    ) -> Result<Uuid, ClientError> {
        self.send(
            EnvelopeDraft::new(kind::PARTICIPANT_STATUS, status)
                .to(vec![request.from.clone()])
                .correlated(request.id),
        )
    }

    // -- correlated requests ------------------------------------------------

    /// Send an `mcp/request` and wait for the correlated `mcp/response`.
    pub async fn request(
        &self,
        to: Vec<String>,
        payload: Value,
    ) -> Result<Envelope, ClientError> {
        self.correlated_call(EnvelopeDraft::new(kind::MCP_REQUEST, payload).to(to))
            .await
    }

    /// Broadcast an `mcp/proposal`. Returns the proposal id for later
    /// withdraw or fulfillment tracking.
    pub fn propose(&self, payload: Value) -> Result<Uuid, ClientError> {
        self.send(EnvelopeDraft::new(kind::MCP_PROPOSAL, payload))
    }

    /// Reject a peer's proposal.
    pub fn reject(&self, proposal_id: Uuid) -> Result<Uuid, ClientError> {
        self.send(EnvelopeDraft::new(kind::MCP_REJECT, Value::Null).correlated(proposal_id))
    }

    /// Withdraw our own proposal.
    pub fn withdraw(&self, proposal_id: Uuid) -> Result<Uuid, ClientError> {
        self.send(EnvelopeDraft::new(kind::MCP_WITHDRAW, Value::Null).correlated(proposal_id))
    }

    /// Fulfill a peer's proposal: send the real request correlated to the
    /// proposal id and wait for the response.
    pub async fn fulfill(
        &self,
        proposal_id: Uuid,
        to: Vec<String>,
        payload: Value,
    ) -> Result<Envelope, ClientError> {
        self.correlated_call(
            EnvelopeDraft::new(kind::MCP_REQUEST, payload)
                .to(to)
                .correlated(proposal_id),
        )
        .await
    }

    /// Ask the gateway to open a stream; resolves with the authoritative
    /// `stream/open` metadata.
    pub async fn stream_request(
        &self,
        direction: StreamDirection,
        target: Option<Vec<String>>,
        description: Option<&str>,
    ) -> Result<StreamInfo, ClientError> {
        let payload = json!({
            "direction": direction,
            "target": target,
            "description": description,
        });
        let open = self
            .correlated_call(EnvelopeDraft::new(kind::STREAM_REQUEST, payload))
            .await?;
        serde_json::from_value(open.payload).map_err(|e| {
            ClientError::Envelope(GatewayError::MalformedEnvelope {
                detail: format!("stream/open payload: {e}"),
            })
        })
    }

    /// Write a raw frame to a stream we are authorized on.
    pub fn send_stream_frame(&self, stream_id: Uuid, data: &[u8]) -> Result<(), ClientError> {
        let mut frame = Vec::with_capacity(16 + data.len());
        frame.extend_from_slice(stream_id.as_bytes());
        frame.extend_from_slice(data);
        self.shared
            .out_tx
            .send(OutboundMessage::Binary(frame))
            .map_err(|_| ClientError::Disconnected)
    }

    /// Close one of our streams.
    pub fn close_stream(&self, stream_id: Uuid) -> Result<Uuid, ClientError> {
        self.send(EnvelopeDraft::new(
            kind::STREAM_CLOSE,
            json!({"stream_id": stream_id}),
        ))
    }

    async fn correlated_call(&self, mut draft: EnvelopeDraft) -> Result<Envelope, ClientError> {
        let id = *draft.id.get_or_insert_with(Uuid::new_v4);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("pending poisoned")
            .insert(id, tx);
        if let Err(e) = self.send(draft) {
            self.shared.pending.lock().expect("pending poisoned").remove(&id);
            return Err(e);
        }
        rx.await.map_err(|_| ClientError::Disconnected)
    }
}
