// SPDX-License-Identifier: MIT OR Apache-2.0
//! Space lifetime: per-space state under a single lock, history writers,
//! and the background sweeper.

use crate::grants::GrantEngine;
use crate::proposals::ProposalEngine;
use crate::registry::Registry;
use crate::streams::StreamEngine;
use crate::{Counters, GatewayConfig, router};
use mew_config::SpaceConfig;
use mew_core::{SystemErrorPayload, kind, system_envelope};
use mew_history::{DECISIONS_STEM, HISTORY_STEM, HistoryError, LogHandle, LogWriterConfig};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Mutable state of one space. The router owns this exclusively for the
/// space's lifetime; everything mutates under the one lock in
/// [`SpaceHandle`].
pub struct SpaceState {
    /// Space id.
    pub id: String,
    /// Connected and in-grace participants.
    pub registry: Registry,
    /// Proposal lifecycle tracking.
    pub proposals: ProposalEngine,
    /// Live capability grants.
    pub grants: GrantEngine,
    /// Stream metadata and write authority.
    pub streams: StreamEngine,
    /// The declarative descriptor, for token resolution.
    pub descriptor: SpaceConfig,
}

/// Shared handle to one space.
pub struct SpaceHandle {
    /// Space id.
    pub id: String,
    /// All mutable space state, behind the single space lock.
    pub state: Mutex<SpaceState>,
    /// Envelope history writer.
    pub history: LogHandle,
    /// Capability decision writer.
    pub decisions: LogHandle,
    /// Gateway configuration.
    pub config: Arc<GatewayConfig>,
    /// Process-wide counters.
    pub counters: Arc<Counters>,
}

impl SpaceHandle {
    /// Flush both logs to disk.
    pub async fn flush_logs(&self) -> Result<(), HistoryError> {
        self.history.flush().await?;
        self.decisions.flush().await
    }
}

/// All live spaces of the process.
#[derive(Clone)]
pub struct SpaceManager {
    spaces: Arc<RwLock<HashMap<String, Arc<SpaceHandle>>>>,
    config: Arc<GatewayConfig>,
    counters: Arc<Counters>,
}

impl SpaceManager {
    /// Empty manager.
    pub fn new(config: Arc<GatewayConfig>, counters: Arc<Counters>) -> Self {
        Self {
            spaces: Arc::new(RwLock::new(HashMap::new())),
            config,
            counters,
        }
    }

    /// Create a space from its descriptor, with logs under
    /// `<data_dir>/<space_id>/`.
    pub async fn create_space(
        &self,
        descriptor: SpaceConfig,
        data_dir: &Path,
    ) -> Result<Arc<SpaceHandle>, HistoryError> {
        let id = descriptor.space.id.clone();
        let space_dir = data_dir.join(&id);
        let history =
            mew_history::spawn_log_writer(&space_dir, HISTORY_STEM, LogWriterConfig::default())
                .await?;
        let decisions =
            mew_history::spawn_log_writer(&space_dir, DECISIONS_STEM, LogWriterConfig::default())
                .await?;

        let handle = Arc::new(SpaceHandle {
            id: id.clone(),
            state: Mutex::new(SpaceState {
                id: id.clone(),
                registry: Registry::new(),
                proposals: ProposalEngine::new(),
                grants: GrantEngine::new(),
                streams: StreamEngine::new(),
                descriptor,
            }),
            history,
            decisions,
            config: self.config.clone(),
            counters: self.counters.clone(),
        });

        tokio::spawn(sweeper(Arc::downgrade(&handle)));

        self.spaces.write().await.insert(id.clone(), handle.clone());
        info!(space = %id, dir = %space_dir.display(), "space created");
        Ok(handle)
    }

    /// Look up a space.
    pub async fn get(&self, id: &str) -> Option<Arc<SpaceHandle>> {
        self.spaces.read().await.get(id).cloned()
    }

    /// Ids of all live spaces, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.spaces.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Total live connections across spaces.
    pub async fn total_connections(&self) -> usize {
        let spaces = self.spaces.read().await;
        let mut total = 0;
        for handle in spaces.values() {
            total += handle.state.lock().await.registry.connected_count();
        }
        total
    }

    /// Flush every space's logs, for shutdown.
    pub async fn flush_all(&self) {
        let handles: Vec<Arc<SpaceHandle>> =
            self.spaces.read().await.values().cloned().collect();
        for handle in handles {
            if let Err(e) = handle.flush_logs().await {
                debug!(space = %handle.id, error = %e, "flush on shutdown failed");
            }
        }
    }
}

/// Background task: expire stale proposals and drop participants whose
/// grace window lapsed. Ends when the space handle is dropped.
async fn sweeper(handle: Weak<SpaceHandle>) {
    let interval = match handle.upgrade() {
        Some(h) => h.config.sweep_interval,
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let Some(handle) = handle.upgrade() else {
            return;
        };

        let expired = {
            let mut state = handle.state.lock().await;
            state.registry.expire_disconnected(handle.config.grace_window);
            state.proposals.sweep(chrono::Utc::now())
        };

        for proposal in expired {
            debug!(space = %handle.id, proposal = %proposal.id, "proposal expired");
            let error = mew_core::GatewayError::ProposalExpired {
                proposal_id: proposal.id,
            };
            let mut notice = system_envelope(
                kind::SYSTEM_ERROR,
                vec![proposal.proposer.clone()],
                serde_json::to_value(SystemErrorPayload::from_error(&error))
                    .unwrap_or_default(),
            );
            notice.correlation_id = vec![proposal.id];
            router::route_system(&handle, notice).await;
        }
    }
}
