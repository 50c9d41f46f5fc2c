// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! mew-gateway
#![deny(unsafe_code)]

pub mod connection;
pub mod control;
pub mod grants;
pub mod http;
pub mod middleware;
pub mod outbound;
pub mod proposals;
pub mod registry;
pub mod router;
pub mod space;
pub mod streams;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::time::Instant;

pub use space::{SpaceHandle, SpaceManager};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Gateway-wide tuning knobs. One instance is shared by every space.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Reject envelopes carrying unknown top-level fields.
    pub strict_envelopes: bool,
    /// Per-participant outbound envelope queue bound.
    pub envelope_queue_bound: usize,
    /// Per-participant in-queue stream frame bound.
    pub stream_queue_bound: usize,
    /// Deliver broadcasts back to their sender.
    pub echo_to_self: bool,
    /// Kinds for which a `delivery_failed` also produces a `system/error`
    /// back to the sender.
    pub notify_sender_kinds: Vec<String>,
    /// Proposal time-to-live.
    pub proposal_ttl: Duration,
    /// Proposal sweeper period.
    pub sweep_interval: Duration,
    /// How long a disconnected participant's queues and pending proposals
    /// are retained for re-attach.
    pub grace_window: Duration,
    /// WebSocket ping cadence.
    pub heartbeat_interval: Duration,
    /// Close connections with no inbound traffic for this long.
    pub idle_timeout: Duration,
    /// How long shutdown waits for outbound queues to drain.
    pub drain_grace: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            strict_envelopes: false,
            envelope_queue_bound: 256,
            stream_queue_bound: 64,
            echo_to_self: false,
            notify_sender_kinds: vec![mew_core::kind::MCP_REQUEST.to_string()],
            proposal_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(1),
            grace_window: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(60),
            drain_grace: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Process-wide counters surfaced by `GET /health`.
#[derive(Debug, Default)]
pub struct Counters {
    /// Envelopes admitted at ingress.
    pub received: AtomicU64,
    /// Per-recipient enqueue successes.
    pub delivered: AtomicU64,
    /// Envelopes evicted by queue overflow and frames discarded.
    pub dropped: AtomicU64,
    /// Admission denials.
    pub denied: AtomicU64,
    /// Currently live WebSocket connections.
    pub connections: AtomicU64,
}

impl Counters {
    /// Bump a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement a gauge by one.
    pub fn decr(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    /// Read a counter.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// AppState & router
// ---------------------------------------------------------------------------

/// Shared state behind every HTTP and WebSocket handler.
#[derive(Clone)]
pub struct AppState {
    /// All live spaces.
    pub spaces: SpaceManager,
    /// Gateway configuration.
    pub config: Arc<GatewayConfig>,
    /// Process-wide counters.
    pub counters: Arc<Counters>,
    /// Startup instant, for uptime reporting.
    pub started_at: Instant,
}

impl AppState {
    /// Fresh state with the given configuration.
    pub fn new(config: GatewayConfig) -> Self {
        let config = Arc::new(config);
        let counters = Arc::new(Counters::default());
        Self {
            spaces: SpaceManager::new(config.clone(), counters.clone()),
            config,
            counters,
            started_at: Instant::now(),
        }
    }
}

/// Build the Axum router with all gateway routes and middleware.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(http::cmd_health))
        .route("/ws/{space}", get(connection::ws_handler))
        .route(
            "/participants/{id}/messages",
            post(http::cmd_inject_message),
        )
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(axum::middleware::from_fn(middleware::RequestLogger::layer))
        .layer(middleware::cors_layer())
        .with_state(state)
}
