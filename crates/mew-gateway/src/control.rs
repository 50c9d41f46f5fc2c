// SPDX-License-Identifier: MIT OR Apache-2.0
//! Participant control plane.
//!
//! `participant/pause` and `participant/resume` take effect inside the
//! gateway: delivery *to* the addressed participants is suspended or
//! resumed on their outbound queues. Every other control kind is advisory
//! and simply routed; its effect depends on the target's runtime.

use crate::space::SpaceState;
use mew_core::{Envelope, Presence, kind};
use tracing::debug;

/// Apply gateway-side control effects. Called after admission, before
/// delivery; the envelope is always routed afterwards.
pub fn apply(state: &mut SpaceState, envelope: &Envelope) {
    match envelope.kind.as_str() {
        kind::PARTICIPANT_PAUSE => set_paused(state, envelope, true),
        kind::PARTICIPANT_RESUME => set_paused(state, envelope, false),
        // Advisory kinds: request-status/status/forget/compact/
        // compact-done/clear/restart/shutdown have no gateway-side effect.
        _ => {}
    }
}

fn set_paused(state: &mut SpaceState, envelope: &Envelope, paused: bool) {
    for target in &envelope.to {
        let Some(entry) = state.registry.get_mut(target) else {
            continue;
        };
        if !entry.is_connected() {
            continue;
        }
        if paused {
            entry.queue.pause();
            entry.presence = Presence::Paused;
        } else {
            entry.queue.resume();
            entry.presence = Presence::Connected;
        }
        debug!(
            space = %state.id,
            participant = %target,
            paused,
            requested_by = %envelope.from,
            "delivery pause toggled"
        );
    }
}
