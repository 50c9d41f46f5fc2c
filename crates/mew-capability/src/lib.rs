// SPDX-License-Identifier: MIT OR Apache-2.0
//! mew-capability
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Compiles capability declarations into matcher triples and decides
//! whether a participant may send a given envelope.
//!
//! Patterns are compiled once, at join or grant time, into a small tagged
//! enum; the admission path walks the compiled triple without allocating.

/// Shallow JSON payload matching.
pub mod payload;

use mew_core::{Capability, Envelope, PatternSet};
use uuid::Uuid;

pub use payload::{payload_matches, payload_subsumes};

// ---------------------------------------------------------------------------
// Pattern
// ---------------------------------------------------------------------------

/// Errors produced while compiling capability patterns.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    /// Wildcards are only supported as a trailing segment.
    #[error("unsupported wildcard position in pattern: {pattern}")]
    UnsupportedWildcard {
        /// The offending pattern.
        pattern: String,
    },
    /// Empty patterns match nothing and are almost certainly a config bug.
    #[error("empty pattern")]
    Empty,
}

/// A single compiled pattern. Left-anchored: a trailing `*` matches any
/// remainder, a bare `*` matches everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Matches any candidate.
    Any,
    /// Matches the candidate exactly.
    Exact(String),
    /// Matches candidates starting with the given prefix.
    Prefix(String),
}

impl Pattern {
    /// Compile a wire pattern string.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }
        if pattern == "*" {
            return Ok(Self::Any);
        }
        match pattern.find('*') {
            None => Ok(Self::Exact(pattern.to_string())),
            Some(pos) if pos == pattern.len() - 1 => {
                Ok(Self::Prefix(pattern[..pos].to_string()))
            }
            Some(_) => Err(PatternError::UnsupportedWildcard {
                pattern: pattern.to_string(),
            }),
        }
    }

    /// Check a candidate string against the pattern.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(s) => candidate == s,
            Self::Prefix(p) => candidate.starts_with(p.as_str()),
        }
    }

    /// True when every candidate matched by `other` is also matched by
    /// `self`. Used for the no-escalation check on grants.
    #[must_use]
    pub fn subsumes(&self, other: &Pattern) -> bool {
        match (self, other) {
            (Self::Any, _) => true,
            (_, Self::Any) => false,
            (Self::Prefix(p), Self::Exact(s)) => s.starts_with(p.as_str()),
            (Self::Prefix(p), Self::Prefix(q)) => q.starts_with(p.as_str()),
            (Self::Exact(a), Self::Exact(b)) => a == b,
            (Self::Exact(_), Self::Prefix(_)) => false,
        }
    }
}

fn compile_set(set: &PatternSet) -> Result<Vec<Pattern>, PatternError> {
    set.iter().map(Pattern::compile).collect()
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Outcome of a single admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Whether the envelope is admitted.
    pub allowed: bool,
    /// Label of the capability that matched (first match wins).
    pub capability: Option<String>,
    /// Denial reason, for history records and diagnostics.
    pub reason: Option<String>,
}

impl Decision {
    /// Admission via the given capability label.
    #[must_use]
    pub fn allow(capability: impl Into<String>) -> Self {
        Self {
            allowed: true,
            capability: Some(capability.into()),
            reason: None,
        }
    }

    /// Denial with a reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            capability: None,
            reason: Some(reason.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// CapabilitySet
// ---------------------------------------------------------------------------

/// One capability compiled into its matcher triple.
#[derive(Debug, Clone)]
struct Entry {
    source: Capability,
    kind: Pattern,
    to: Option<Vec<Pattern>>,
    grant_id: Option<Uuid>,
}

impl Entry {
    fn compile(source: Capability, grant_id: Option<Uuid>) -> Result<Self, PatternError> {
        let kind = Pattern::compile(&source.kind)?;
        let to = source.to.as_ref().map(|set| compile_set(set)).transpose()?;
        Ok(Self {
            source,
            kind,
            to,
            grant_id,
        })
    }

    /// Label shown in diagnostics: the declared id, or the kind pattern.
    fn label(&self) -> &str {
        self.source.id.as_deref().unwrap_or(&self.source.kind)
    }

    fn matches(&self, envelope: &Envelope) -> bool {
        if !self.kind.matches(&envelope.kind) {
            return false;
        }
        if let Some(to_patterns) = &self.to {
            // Every explicit recipient must match some pattern. A broadcast
            // (empty `to`) passes vacuously, as the admission rules specify.
            let all_match = envelope
                .to
                .iter()
                .all(|recipient| to_patterns.iter().any(|p| p.matches(recipient)));
            if !all_match {
                return false;
            }
        }
        if let Some(pattern) = &self.source.payload
            && !payload_matches(pattern, &envelope.payload)
        {
            return false;
        }
        true
    }
}

/// A participant's effective capabilities, compiled for admission.
///
/// Declaration order is preserved: the first matching capability wins, which
/// only influences which label lands in the logs, never the outcome.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    entries: Vec<Entry>,
}

impl CapabilitySet {
    /// Compile a list of declared capabilities.
    pub fn compile(capabilities: &[Capability]) -> Result<Self, PatternError> {
        let entries = capabilities
            .iter()
            .map(|cap| Entry::compile(cap.clone(), None))
            .collect::<Result<_, _>>()?;
        Ok(Self { entries })
    }

    /// Decide whether `envelope` may leave this participant.
    #[must_use]
    pub fn admit(&self, envelope: &Envelope) -> Decision {
        for entry in &self.entries {
            if entry.matches(envelope) {
                return Decision::allow(entry.label());
            }
        }
        Decision::deny(format!("no capability matches kind {}", envelope.kind))
    }

    /// True when some capability in this set subsumes the full shape of
    /// `cap`: its kind pattern, its recipient restriction, and its payload
    /// pattern. Grants must pass this check against the granter's own set,
    /// so a granter restricted to certain recipients or payloads cannot
    /// hand out the unrestricted form of the same kind.
    pub fn covers(&self, cap: &Capability) -> Result<bool, PatternError> {
        let wanted_kind = Pattern::compile(&cap.kind)?;
        let wanted_to = cap.to.as_ref().map(compile_set).transpose()?;
        Ok(self.entries.iter().any(|entry| {
            entry_subsumes(entry, &wanted_kind, wanted_to.as_deref(), cap.payload.as_ref())
        }))
    }

    /// Append granted capabilities, tagged with the grant id.
    pub fn extend_granted(
        &mut self,
        capabilities: &[Capability],
        grant_id: Uuid,
    ) -> Result<(), PatternError> {
        for cap in capabilities {
            self.entries.push(Entry::compile(cap.clone(), Some(grant_id))?);
        }
        Ok(())
    }

    /// Remove every capability tagged with `grant_id`. Returns how many
    /// entries were removed.
    pub fn revoke_grant(&mut self, grant_id: Uuid) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.grant_id != Some(grant_id));
        before - self.entries.len()
    }

    /// Remove capabilities structurally equal to any in `capabilities`.
    /// Returns how many entries were removed.
    pub fn revoke_matching(&mut self, capabilities: &[Capability]) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| !capabilities.iter().any(|cap| structurally_equal(&e.source, cap)));
        before - self.entries.len()
    }

    /// Diagnostic labels of the effective capabilities, in declaration
    /// order.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.label().to_string()).collect()
    }

    /// Snapshot of the declared capabilities, for welcome and presence
    /// payloads.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Capability> {
        self.entries.iter().map(|e| e.source.clone()).collect()
    }

    /// Number of effective capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the set is empty (everything is denied).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Structural equality on kind/to/payload; the declared id is ignored so a
/// revoke can name the same shape under a different id.
fn structurally_equal(a: &Capability, b: &Capability) -> bool {
    a.kind == b.kind && a.to == b.to && a.payload == b.payload
}

/// Does `entry` cover every envelope the wanted capability would admit?
///
/// An entry with a recipient or payload restriction only covers wanted
/// capabilities that carry an equal-or-narrower restriction of the same
/// dimension; an unrestricted entry covers anything of a subsumed kind.
fn entry_subsumes(
    entry: &Entry,
    wanted_kind: &Pattern,
    wanted_to: Option<&[Pattern]>,
    wanted_payload: Option<&serde_json::Value>,
) -> bool {
    if !entry.kind.subsumes(wanted_kind) {
        return false;
    }
    if let Some(own_to) = &entry.to {
        let Some(wanted_to) = wanted_to else {
            // The entry is recipient-restricted; an unrestricted wanted
            // capability would reach recipients the entry cannot.
            return false;
        };
        let contained = wanted_to
            .iter()
            .all(|wanted| own_to.iter().any(|own| own.subsumes(wanted)));
        if !contained {
            return false;
        }
    }
    if let Some(own_payload) = &entry.source.payload {
        let Some(wanted_payload) = wanted_payload else {
            return false;
        };
        if !payload_subsumes(own_payload, wanted_payload) {
            return false;
        }
    }
    true
}
