// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property-based tests for capability pattern compilation and matching.
//!
//! Covers invariants around prefix semantics, subsumption, first-match
//! stability, and grant/revoke round trips.

use mew_capability::{CapabilitySet, Pattern};
use mew_core::{Capability, EnvelopeDraft};
use proptest::prelude::*;
use serde_json::json;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════
// Strategies
// ═══════════════════════════════════════════════════════════════════════

/// Kind segment: lowercase, as canonical kinds use.
fn kind_segment() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,7}"
}

/// Namespaced kind with 1–4 `/`-joined segments.
fn kind() -> impl Strategy<Value = String> {
    prop::collection::vec(kind_segment(), 1..=4).prop_map(|segs| segs.join("/"))
}

fn envelope(kind: &str) -> mew_core::Envelope {
    EnvelopeDraft::new(kind, json!({})).seal("prop")
}

// ═══════════════════════════════════════════════════════════════════════
// Pattern properties
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    /// An exact pattern matches exactly its own string.
    #[test]
    fn exact_matches_only_itself(a in kind(), b in kind()) {
        let p = Pattern::compile(&a).unwrap();
        prop_assert!(p.matches(&a));
        prop_assert_eq!(p.matches(&b), a == b);
    }

    /// `prefix/*` matches every extension of the prefix.
    #[test]
    fn prefix_matches_all_extensions(base in kind(), ext in kind_segment()) {
        let p = Pattern::compile(&format!("{base}/*")).unwrap();
        prop_assert!(p.matches(&format!("{}/{}", base, ext)), "prefix pattern should match extension");
        prop_assert!(p.matches(&format!("{}/", base)), "prefix pattern should match trailing slash");
    }

    /// A compiled pattern always matches what it subsumes: if `a` subsumes
    /// `b`, every candidate matched by `b` is matched by `a`.
    #[test]
    fn subsumption_implies_matching(base in kind(), ext in kind_segment()) {
        let wide = Pattern::compile(&format!("{base}/*")).unwrap();
        let narrow_str = format!("{base}/{ext}");
        let narrow = Pattern::compile(&narrow_str).unwrap();
        prop_assert!(wide.subsumes(&narrow));
        prop_assert!(wide.matches(&narrow_str));
    }

    /// The bare wildcard matches and subsumes everything.
    #[test]
    fn star_is_top(k in kind()) {
        let star = Pattern::compile("*").unwrap();
        prop_assert!(star.matches(&k));
        prop_assert!(star.subsumes(&Pattern::compile(&k).unwrap()));
    }
}

// ═══════════════════════════════════════════════════════════════════════
// CapabilitySet properties
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    /// Admission is deterministic: the same set and envelope always yield
    /// the same decision.
    #[test]
    fn admission_is_deterministic(kinds in prop::collection::vec(kind(), 1..5), probe in kind()) {
        let caps: Vec<Capability> = kinds.iter().map(|k| Capability::for_kind(k.clone())).collect();
        let set = CapabilitySet::compile(&caps).unwrap();
        let env = envelope(&probe);
        let first = set.admit(&env);
        let second = set.admit(&env);
        prop_assert_eq!(first.allowed, second.allowed);
        prop_assert_eq!(first.capability, second.capability);
    }

    /// Granting then revoking by grant id restores the original decision
    /// for any envelope.
    #[test]
    fn grant_revoke_round_trip(base in kind(), granted in kind(), probe in kind()) {
        let mut set = CapabilitySet::compile(&[Capability::for_kind(base)]).unwrap();
        let env = envelope(&probe);
        let before = set.admit(&env).allowed;

        let grant_id = Uuid::new_v4();
        set.extend_granted(&[Capability::for_kind(granted)], grant_id).unwrap();
        set.revoke_grant(grant_id);

        prop_assert_eq!(set.admit(&env).allowed, before);
    }

    /// A set containing the bare wildcard admits every kind.
    #[test]
    fn wildcard_set_admits_everything(probe in kind()) {
        let set = CapabilitySet::compile(&[Capability::for_kind("*")]).unwrap();
        prop_assert!(set.admit(&envelope(&probe)).allowed);
    }
}
