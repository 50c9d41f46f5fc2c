// SPDX-License-Identifier: MIT OR Apache-2.0
//! Router behavior tests driven directly against a space, without sockets:
//! echo, sender notification, pause accumulation, grant serialization, and
//! proposal expiry.

use mew_capability::CapabilitySet;
use mew_config::SpaceConfig;
use mew_core::{Capability, EnvelopeDraft, kind};
use mew_gateway::outbound::{OutboundFrame, OutboundQueue, PopOutcome};
use mew_gateway::{AppState, GatewayConfig, SpaceHandle, router};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DESCRIPTOR: &str = r#"
    [space]
    id = "engine"

    [participants.operator]
    tokens = ["operator-token"]
    capabilities = [{ kind = "*" }]

    [participants.worker]
    tokens = ["worker-token"]
    capabilities = [{ kind = "chat" }]
"#;

async fn spawn_space(config: GatewayConfig, data_dir: &Path) -> Arc<SpaceHandle> {
    let state = Arc::new(AppState::new(config));
    let descriptor = SpaceConfig::from_toml_str(DESCRIPTOR).unwrap();
    let handle = state.spaces.create_space(descriptor, data_dir).await.unwrap();
    handle
}

/// Join a participant without a socket; returns its queue and generation.
async fn join(
    handle: &SpaceHandle,
    id: &str,
    kinds: &[&str],
) -> (Arc<OutboundQueue>, u64) {
    let caps: Vec<Capability> = kinds
        .iter()
        .map(|k| Capability::for_kind(k.to_string()))
        .collect();
    let mut space = handle.state.lock().await;
    let (_, queue, generation) = space.registry.join(
        id,
        CapabilitySet::compile(&caps).unwrap(),
        handle.config.envelope_queue_bound,
        handle.config.stream_queue_bound,
    );
    (queue, generation)
}

async fn pop_envelope(queue: &OutboundQueue, generation: u64) -> mew_core::Envelope {
    match tokio::time::timeout(Duration::from_secs(2), queue.pop(generation))
        .await
        .expect("queue pop timed out")
    {
        PopOutcome::Frame(OutboundFrame::Envelope(envelope)) => *envelope,
        other => panic!("expected envelope frame, got {other:?}"),
    }
}

#[tokio::test]
async fn broadcast_skips_the_sender_unless_echo_is_on() {
    let tmp = tempfile::tempdir().unwrap();

    let handle = spawn_space(GatewayConfig::default(), tmp.path()).await;
    let (operator_q, _) = join(&handle, "operator", &["*"]).await;
    let (worker_q, _) = join(&handle, "worker", &["chat"]).await;

    router::ingress(
        &handle,
        "operator",
        EnvelopeDraft::new("chat", json!({"text": "all hands"})),
    )
    .await
    .unwrap();
    assert_eq!(worker_q.len(), 1);
    assert!(operator_q.is_empty());

    let echo_dir = tempfile::tempdir().unwrap();
    let handle = spawn_space(
        GatewayConfig {
            echo_to_self: true,
            ..GatewayConfig::default()
        },
        echo_dir.path(),
    )
    .await;
    let (operator_q, _) = join(&handle, "operator", &["*"]).await;
    join(&handle, "worker", &["chat"]).await;

    router::ingress(
        &handle,
        "operator",
        EnvelopeDraft::new("chat", json!({"text": "all hands"})),
    )
    .await
    .unwrap();
    assert_eq!(operator_q.len(), 1);
}

#[tokio::test]
async fn critical_kinds_report_unreachable_recipients() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_space(GatewayConfig::default(), tmp.path()).await;
    let (operator_q, generation) = join(&handle, "operator", &["*"]).await;

    // `chat` is fire-and-forget: no feedback.
    router::ingress(
        &handle,
        "operator",
        EnvelopeDraft::new("chat", json!({})).to(vec!["ghost".into()]),
    )
    .await
    .unwrap();
    assert!(operator_q.is_empty());

    // `mcp/request` is in the default notify list: the sender hears back.
    let sent = router::ingress(
        &handle,
        "operator",
        EnvelopeDraft::new(kind::MCP_REQUEST, json!({"method": "tools/list"}))
            .to(vec!["ghost".into()]),
    )
    .await
    .unwrap();

    let notice = pop_envelope(&operator_q, generation).await;
    assert_eq!(notice.kind, kind::SYSTEM_ERROR);
    assert_eq!(notice.payload["reason"], json!("delivery_failed"));
    assert_eq!(notice.correlation_id, vec![sent.id]);
}

#[tokio::test]
async fn pause_accumulates_and_resume_releases() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_space(GatewayConfig::default(), tmp.path()).await;
    join(&handle, "operator", &["*"]).await;
    let (worker_q, generation) = join(&handle, "worker", &["chat"]).await;

    router::ingress(
        &handle,
        "operator",
        EnvelopeDraft::new(kind::PARTICIPANT_PAUSE, json!({})).to(vec!["worker".into()]),
    )
    .await
    .unwrap();
    assert!(worker_q.is_paused());

    for n in 0..3 {
        router::ingress(
            &handle,
            "operator",
            EnvelopeDraft::new("chat", json!({"n": n})).to(vec!["worker".into()]),
        )
        .await
        .unwrap();
    }
    // The pause envelope itself plus three chats are queued, none popped.
    assert_eq!(worker_q.len(), 4);

    router::ingress(
        &handle,
        "operator",
        EnvelopeDraft::new(kind::PARTICIPANT_RESUME, json!({})).to(vec!["worker".into()]),
    )
    .await
    .unwrap();
    assert!(!worker_q.is_paused());
    let first = pop_envelope(&worker_q, generation).await;
    assert_eq!(first.kind, kind::PARTICIPANT_PAUSE);
}

#[tokio::test]
async fn grant_is_visible_to_the_very_next_envelope() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_space(GatewayConfig::default(), tmp.path()).await;
    join(&handle, "operator", &["*"]).await;
    join(&handle, "worker", &["chat"]).await;

    let denied = router::ingress(
        &handle,
        "worker",
        EnvelopeDraft::new(kind::MCP_PROPOSAL, json!({})),
    )
    .await;
    assert!(denied.is_err());

    router::ingress(
        &handle,
        "operator",
        EnvelopeDraft::new(
            kind::CAPABILITY_GRANT,
            json!({"recipient": "worker", "capabilities": [{"kind": "mcp/proposal"}]}),
        )
        .to(vec!["worker".into()]),
    )
    .await
    .unwrap();

    // Admission for the worker's next envelope sees the mutated set.
    router::ingress(
        &handle,
        "worker",
        EnvelopeDraft::new(kind::MCP_PROPOSAL, json!({})),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn expired_proposals_produce_a_notice_to_the_proposer() {
    let tmp = tempfile::tempdir().unwrap();
    let handle = spawn_space(
        GatewayConfig {
            proposal_ttl: Duration::ZERO,
            sweep_interval: Duration::from_millis(50),
            ..GatewayConfig::default()
        },
        tmp.path(),
    )
    .await;
    join(&handle, "operator", &["*"]).await;
    let (worker_q, generation) = join(&handle, "worker", &["mcp/proposal"]).await;

    let proposal = router::ingress(
        &handle,
        "worker",
        EnvelopeDraft::new(kind::MCP_PROPOSAL, json!({"method": "tools/call"})),
    )
    .await
    .unwrap();

    let notice = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match worker_q.pop(generation).await {
                PopOutcome::Frame(OutboundFrame::Envelope(envelope))
                    if envelope.kind == kind::SYSTEM_ERROR =>
                {
                    return *envelope;
                }
                _ => continue,
            }
        }
    })
    .await
    .expect("expiry notice within the sweep window");

    assert_eq!(notice.payload["reason"], json!("proposal_expired"));
    assert_eq!(notice.correlation_id, vec![proposal.id]);
}
