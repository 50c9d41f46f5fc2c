// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cross-crate end-to-end tests: the participant runtime talking to a real
//! gateway, covering correlation, tool dispatch, proposals, and streams.

use mew_config::SpaceConfig;
use mew_core::{Capability, StreamDirection, kind};
use mew_gateway::{AppState, GatewayConfig, build_app};
use mew_participant::{ClientConfig, ClientEvent, MewClient, ToolError, ToolRegistry};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DESCRIPTOR: &str = r#"
    [space]
    id = "workshop"

    [participants.operator]
    tokens = ["operator-token"]
    capabilities = [
        { kind = "chat" },
        { kind = "mcp/*" },
        { kind = "stream/*" },
        { kind = "participant/*" },
    ]

    [participants.calculator]
    tokens = ["calculator-token"]
    capabilities = [
        { kind = "mcp/*" },
        { kind = "chat" },
        { kind = "participant/status" },
    ]

    [participants.intern]
    tokens = ["intern-token"]
    capabilities = [{ kind = "mcp/proposal" }, { kind = "mcp/withdraw" }, { kind = "chat" }]
"#;

async fn spawn_gateway(data_dir: &Path) -> (SocketAddr, Arc<AppState>) {
    let state = Arc::new(AppState::new(GatewayConfig::default()));
    let descriptor = SpaceConfig::from_toml_str(DESCRIPTOR).unwrap();
    state.spaces.create_space(descriptor, data_dir).await.unwrap();

    let app = build_app(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn client_config(addr: SocketAddr, token: &str) -> ClientConfig {
    ClientConfig::new(
        format!("ws://127.0.0.1:{}", addr.port()),
        "workshop",
        token,
    )
    .without_reconnect()
}

fn calculator_tools() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register("add", |arguments: Value| {
        let a = arguments.get("a").and_then(Value::as_i64);
        let b = arguments.get("b").and_then(Value::as_i64);
        match (a, b) {
            (Some(a), Some(b)) => Ok(json!({"value": a + b})),
            _ => Err(ToolError::invalid_params("a and b must be integers")),
        }
    });
    tools
}

#[tokio::test]
async fn request_response_correlation_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, _state) = spawn_gateway(tmp.path()).await;

    let _calculator = MewClient::connect(
        client_config(addr, "calculator-token"),
        calculator_tools(),
    )
    .await
    .unwrap();
    let operator = MewClient::connect(client_config(addr, "operator-token"), ToolRegistry::new())
        .await
        .unwrap();
    assert_eq!(operator.participant_id().as_deref(), Some("operator"));

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        operator.request(
            vec!["calculator".into()],
            json!({"method": "tools/call", "params": {"name": "add", "arguments": {"a": 2, "b": 3}}}),
        ),
    )
    .await
    .expect("response within timeout")
    .unwrap();

    assert_eq!(response.kind, kind::MCP_RESPONSE);
    assert_eq!(response.from, "calculator");
    assert_eq!(response.payload, json!({"result": {"value": 5}}));
}

#[tokio::test]
async fn unknown_tool_reports_a_jsonrpc_error() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, _state) = spawn_gateway(tmp.path()).await;

    let _calculator = MewClient::connect(
        client_config(addr, "calculator-token"),
        calculator_tools(),
    )
    .await
    .unwrap();
    let operator = MewClient::connect(client_config(addr, "operator-token"), ToolRegistry::new())
        .await
        .unwrap();

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        operator.request(
            vec!["calculator".into()],
            json!({"method": "tools/call", "params": {"name": "subtract", "arguments": {}}}),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(response.payload["error"]["code"], json!(-32601));
}

#[tokio::test]
async fn proposal_is_fulfilled_on_behalf_of_the_intern() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, _state) = spawn_gateway(tmp.path()).await;

    let _calculator = MewClient::connect(
        client_config(addr, "calculator-token"),
        calculator_tools(),
    )
    .await
    .unwrap();
    let operator = MewClient::connect(client_config(addr, "operator-token"), ToolRegistry::new())
        .await
        .unwrap();
    let intern = MewClient::connect(client_config(addr, "intern-token"), ToolRegistry::new())
        .await
        .unwrap();

    let mut operator_events = operator.subscribe();
    let mut intern_events = intern.subscribe();

    let payload = json!({"method": "tools/call", "params": {"name": "add", "arguments": {"a": 20, "b": 22}}});
    let proposal_id = intern.propose(payload.clone()).unwrap();

    // The operator sees the proposal and fulfills it against the tool.
    let proposal = wait_for_envelope(&mut operator_events, |e| e.kind == kind::MCP_PROPOSAL).await;
    assert_eq!(proposal.id, proposal_id);
    assert_eq!(proposal.from, "intern");

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        operator.fulfill(proposal_id, vec!["calculator".into()], proposal.payload),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(response.payload["result"]["value"], json!(42));

    // The proposer receives the same response without having had the
    // capability to ask directly.
    let echoed = wait_for_envelope(&mut intern_events, |e| e.kind == kind::MCP_RESPONSE).await;
    assert_eq!(echoed.payload["result"]["value"], json!(42));
}

#[tokio::test]
async fn stream_request_resolves_with_server_metadata_and_frames_flow() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, _state) = spawn_gateway(tmp.path()).await;

    let operator = MewClient::connect(client_config(addr, "operator-token"), ToolRegistry::new())
        .await
        .unwrap();
    let calculator = MewClient::connect(
        client_config(addr, "calculator-token"),
        ToolRegistry::new(),
    )
    .await
    .unwrap();
    let mut calculator_events = calculator.subscribe();

    let info = tokio::time::timeout(
        Duration::from_secs(5),
        operator.stream_request(
            StreamDirection::Upload,
            Some(vec!["calculator".into()]),
            Some("progress feed"),
        ),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(info.owner, "operator");
    assert_eq!(info.authorized_writers, vec!["operator"]);

    operator.send_stream_frame(info.stream_id, b"tick-1").unwrap();
    operator.send_stream_frame(info.stream_id, b"tick-2").unwrap();

    for expected in [b"tick-1".as_slice(), b"tick-2".as_slice()] {
        let (stream_id, data) = wait_for_stream(&mut calculator_events).await;
        assert_eq!(stream_id, info.stream_id);
        assert_eq!(data, expected);
    }
}

#[tokio::test]
async fn status_request_gets_a_correlated_reply() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, _state) = spawn_gateway(tmp.path()).await;

    let operator = MewClient::connect(client_config(addr, "operator-token"), ToolRegistry::new())
        .await
        .unwrap();
    let calculator = MewClient::connect(
        client_config(addr, "calculator-token"),
        ToolRegistry::new(),
    )
    .await
    .unwrap();

    let mut operator_events = operator.subscribe();
    let mut calculator_events = calculator.subscribe();

    let request_id = operator
        .send(
            mew_core::EnvelopeDraft::new(kind::PARTICIPANT_REQUEST_STATUS, Value::Null)
                .to(vec!["calculator".into()]),
        )
        .unwrap();

    let request =
        wait_for_envelope(&mut calculator_events, |e| e.kind == kind::PARTICIPANT_REQUEST_STATUS)
            .await;
    calculator
        .status_reply(&request, json!({"state": "idle", "queued": 0}))
        .unwrap();

    let status =
        wait_for_envelope(&mut operator_events, |e| e.kind == kind::PARTICIPANT_STATUS).await;
    assert_eq!(status.correlation_id, vec![request_id]);
    assert_eq!(status.payload["state"], json!("idle"));
}

#[tokio::test]
async fn welcome_snapshot_lists_existing_peers() {
    let tmp = tempfile::tempdir().unwrap();
    let (addr, _state) = spawn_gateway(tmp.path()).await;

    let _operator = MewClient::connect(client_config(addr, "operator-token"), ToolRegistry::new())
        .await
        .unwrap();
    let intern = MewClient::connect(client_config(addr, "intern-token"), ToolRegistry::new())
        .await
        .unwrap();

    let welcome = intern.welcome().unwrap();
    assert_eq!(welcome.you.id, "intern");
    assert!(welcome.participants.iter().any(|p| p.id == "operator"));
    assert!(
        welcome.you.capabilities.contains(&Capability::for_kind("mcp/proposal")),
        "welcome reflects the declared capability set"
    );
}

// ---------------------------------------------------------------------------
// Event helpers
// ---------------------------------------------------------------------------

async fn wait_for_envelope(
    events: &mut tokio::sync::broadcast::Receiver<ClientEvent>,
    pred: impl Fn(&mew_core::Envelope) -> bool,
) -> mew_core::Envelope {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let ClientEvent::Envelope(envelope) = events.recv().await.expect("event stream") {
                if pred(&envelope) {
                    return envelope;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for envelope")
}

async fn wait_for_stream(
    events: &mut tokio::sync::broadcast::Receiver<ClientEvent>,
) -> (uuid::Uuid, Vec<u8>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let ClientEvent::StreamData { stream_id, data } =
                events.recv().await.expect("event stream")
            {
                return (stream_id, data);
            }
        }
    })
    .await
    .expect("timed out waiting for stream frame")
}
