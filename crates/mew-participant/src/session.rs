// SPDX-License-Identifier: MIT OR Apache-2.0
//! Session plumbing: connect, welcome handshake, the read/write loop, and
//! the reconnect supervisor.

use crate::{ClientConfig, ClientError, ClientEvent, ClientShared};
use futures::{SinkExt, StreamExt};
use mew_core::{EnvelopeDraft, WelcomePayload, codec, kind};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tracing::{debug, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long the welcome may take before the handshake is abandoned.
const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages from the client API to the socket writer.
#[derive(Debug)]
pub(crate) enum OutboundMessage {
    /// Envelope JSON.
    Text(String),
    /// Stream frame: 16-byte stream id, then payload.
    Binary(Vec<u8>),
}

/// Establish the first session and hand it to the supervisor.
pub(crate) async fn start(
    config: ClientConfig,
    shared: Arc<ClientShared>,
    out_rx: mpsc::UnboundedReceiver<OutboundMessage>,
) -> Result<(), ClientError> {
    let (ws, welcome) = establish(&config).await?;
    *shared.welcome.lock().expect("welcome poisoned") = Some(welcome.clone());
    let _ = shared.events.send(ClientEvent::Connected(welcome));
    tokio::spawn(supervise(config, shared, out_rx, ws));
    Ok(())
}

/// Connect and wait for `system/welcome`.
async fn establish(config: &ClientConfig) -> Result<(WsStream, WelcomePayload), ClientError> {
    let mut request = config.ws_url().into_client_request()?;
    let header = format!("Bearer {}", config.token)
        .parse()
        .map_err(|_| ClientError::Handshake("token is not a valid header value".to_string()))?;
    request.headers_mut().insert("authorization", header);

    let (mut ws, _resp) = tokio_tungstenite::connect_async(request).await?;

    let deadline = tokio::time::Instant::now() + WELCOME_TIMEOUT;
    loop {
        let next = tokio::time::timeout_at(deadline, ws.next())
            .await
            .map_err(|_| ClientError::Handshake("welcome timed out".to_string()))?;
        let message = match next {
            None => return Err(ClientError::Handshake("closed before welcome".to_string())),
            Some(msg) => msg?,
        };
        let Message::Text(text) = message else {
            continue;
        };
        let envelope = codec::parse_envelope(&text)?;
        if envelope.kind != kind::SYSTEM_WELCOME {
            debug!(kind = %envelope.kind, "pre-welcome envelope skipped");
            continue;
        }
        let welcome: WelcomePayload = serde_json::from_value(envelope.payload)
            .map_err(|e| ClientError::Handshake(format!("welcome payload: {e}")))?;
        return Ok((ws, welcome));
    }
}

/// Run sessions until the connection drops for good.
async fn supervise(
    config: ClientConfig,
    shared: Arc<ClientShared>,
    mut out_rx: mpsc::UnboundedReceiver<OutboundMessage>,
    first: WsStream,
) {
    let mut session = Some(first);
    loop {
        let Some(ws) = session.take() else { break };
        run_session(ws, &shared, &mut out_rx).await;

        // In-flight requests are failed, never replayed.
        shared.fail_pending();
        let _ = shared.events.send(ClientEvent::Disconnected);

        if !config.reconnect.enabled {
            break;
        }
        let mut delays = config.reconnect.delays();
        session = loop {
            let delay = delays.next().expect("backoff is infinite");
            debug!(?delay, "reconnecting");
            tokio::time::sleep(delay).await;
            match establish(&config).await {
                Ok((ws, welcome)) => {
                    *shared.welcome.lock().expect("welcome poisoned") = Some(welcome.clone());
                    let _ = shared.events.send(ClientEvent::Connected(welcome));
                    break Some(ws);
                }
                Err(e) => {
                    debug!(error = %e, "reconnect attempt failed");
                }
            }
        };
    }
}

/// One connected session: pump outbound messages and dispatch inbound
/// frames until either side closes.
async fn run_session(
    ws: WsStream,
    shared: &Arc<ClientShared>,
    out_rx: &mut mpsc::UnboundedReceiver<OutboundMessage>,
) {
    let me = shared
        .welcome
        .lock()
        .expect("welcome poisoned")
        .as_ref()
        .map(|w| w.you.id.clone())
        .unwrap_or_default();
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(message) = outbound else { break };
                let result = match message {
                    OutboundMessage::Text(text) => sink.send(Message::Text(text.into())).await,
                    OutboundMessage::Binary(frame) => sink.send(Message::Binary(frame.into())).await,
                };
                if result.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                let Some(Ok(message)) = inbound else { break };
                match message {
                    Message::Text(text) => handle_text(shared, &me, &text),
                    Message::Binary(bytes) => handle_binary(shared, &bytes),
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }
        }
    }
}

fn handle_text(shared: &Arc<ClientShared>, me: &str, text: &str) {
    let envelope = match codec::parse_envelope(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "unparseable envelope from gateway");
            return;
        }
    };

    // Resolve any in-flight request this envelope correlates to. A
    // `system/error` resolves its request too, so callers fail fast.
    for correlated in &envelope.correlation_id {
        let waiter = shared
            .pending
            .lock()
            .expect("pending poisoned")
            .remove(correlated);
        if let Some(tx) = waiter {
            let _ = tx.send(envelope.clone());
        }
    }

    // Inbound tool invocations addressed to us.
    if mew_core::kind::is_mcp_request(&envelope.kind)
        && envelope.addresses(me)
        && !shared.tools.is_empty()
    {
        let shared = shared.clone();
        let request = envelope.clone();
        tokio::spawn(async move {
            let body = shared.tools.dispatch(&request.payload).await;
            let draft = EnvelopeDraft::new(kind::MCP_RESPONSE, body)
                .to(vec![request.from.clone()])
                .correlated(request.id);
            match serde_json::to_string(&draft) {
                Ok(text) => {
                    let _ = shared.out_tx.send(OutboundMessage::Text(text));
                }
                Err(e) => warn!(error = %e, "serialize tool response"),
            }
        });
    }

    let _ = shared.events.send(ClientEvent::Envelope(envelope));
}

fn handle_binary(shared: &Arc<ClientShared>, bytes: &[u8]) {
    if bytes.len() < 16 {
        return;
    }
    let Ok(stream_id) = Uuid::from_slice(&bytes[..16]) else {
        return;
    };
    let _ = shared.events.send(ClientEvent::StreamData {
        stream_id,
        data: bytes[16..].to_vec(),
    });
}
