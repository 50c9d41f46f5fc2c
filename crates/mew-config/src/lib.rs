// SPDX-License-Identifier: MIT OR Apache-2.0
//! Space descriptor loading, validation, and token resolution.
//!
//! A space descriptor is a declarative TOML document enumerating the
//! participants of a space, their bearer tokens and initial capabilities,
//! and an optional fallback capability set for unmatched tokens. Keys aimed
//! at external process supervisors (`auto_start`, `command`, …) are parsed
//! and retained but never acted on here.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use mew_core::Capability;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors & warnings
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating a space descriptor.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The descriptor file was not found or unreadable.
    #[error("space descriptor not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file is not valid TOML for the descriptor shape.
    #[error("failed to parse space descriptor: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("space descriptor validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory findings that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The same token appears under more than one participant; resolution
    /// picks the first in declaration order.
    DuplicateToken {
        /// Participants sharing the token.
        participants: Vec<String>,
    },
    /// A participant has no tokens and therefore can never join.
    NoTokens {
        /// The unreachable participant.
        participant: String,
    },
    /// A participant has an empty capability list (everything denied).
    NoCapabilities {
        /// The silenced participant.
        participant: String,
    },
    /// The space has no participants at all.
    NoParticipants,
}

// ---------------------------------------------------------------------------
// Descriptor shape
// ---------------------------------------------------------------------------

/// Top-level space descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SpaceConfig {
    /// Space identity.
    pub space: SpaceMeta,
    /// Declared participants, keyed by participant id.
    #[serde(default)]
    pub participants: BTreeMap<String, ParticipantConfig>,
    /// Fallback behavior for unmatched tokens. Absent means reject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<Defaults>,
}

/// `[space]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SpaceMeta {
    /// Routing-domain id, used in URLs and data paths.
    pub id: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// `[participants.<id>]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ParticipantConfig {
    /// Bearer tokens that resolve to this participant.
    #[serde(default)]
    pub tokens: Vec<String>,
    /// Initial capability set at join.
    #[serde(default)]
    pub capabilities: Vec<Capability>,

    // Supervisor-only keys: consumed by an external process supervisor,
    // carried here so one descriptor can serve both.
    /// Launch this participant automatically.
    #[serde(default)]
    pub auto_start: bool,
    /// Supervisor launch command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Supervisor launch arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Supervisor environment overrides.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Supervisor output log path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_log: Option<String>,
    /// Supervisor FIFO toggle.
    #[serde(default)]
    pub fifo: bool,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Defaults {
    /// Capability set granted to unmatched tokens.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Successful `(token, requested id) → identity` resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenResolution {
    /// Resolved participant id.
    pub participant_id: String,
    /// Initial capabilities for the connection.
    pub capabilities: Vec<Capability>,
}

impl SpaceConfig {
    /// Parse a descriptor from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })
    }

    /// Load a descriptor from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    /// Semantic validation. Hard failures become [`ConfigError`]; advisory
    /// findings come back as warnings.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut reasons = Vec::new();
        if self.space.id.trim().is_empty() {
            reasons.push("space.id must not be empty".to_string());
        }
        for (id, participant) in &self.participants {
            if id.trim().is_empty() {
                reasons.push("participant id must not be empty".to_string());
            }
            for cap in &participant.capabilities {
                if cap.kind.trim().is_empty() {
                    reasons.push(format!("participant {id}: capability with empty kind"));
                }
            }
        }
        if !reasons.is_empty() {
            return Err(ConfigError::ValidationError { reasons });
        }

        let mut warnings = Vec::new();
        if self.participants.is_empty() {
            warnings.push(ConfigWarning::NoParticipants);
        }
        for (id, participant) in &self.participants {
            if participant.tokens.is_empty() {
                warnings.push(ConfigWarning::NoTokens {
                    participant: id.clone(),
                });
            }
            if participant.capabilities.is_empty() {
                warnings.push(ConfigWarning::NoCapabilities {
                    participant: id.clone(),
                });
            }
        }
        let mut token_owners: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for (id, participant) in &self.participants {
            for token in &participant.tokens {
                token_owners.entry(token).or_default().push(id.clone());
            }
        }
        for owners in token_owners.into_values() {
            if owners.len() > 1 {
                warnings.push(ConfigWarning::DuplicateToken {
                    participants: owners,
                });
            }
        }
        Ok(warnings)
    }

    /// Resolve a bearer token (plus the id the client asked for, when it
    /// provided one) to an identity.
    ///
    /// A token declared under a participant always resolves to that
    /// participant; a conflicting requested id fails. An unmatched token
    /// resolves through `[defaults]` under the requested id, and is
    /// rejected when no `[defaults]` section exists or no id was requested.
    #[must_use]
    pub fn resolve_token(&self, token: &str, requested_id: Option<&str>) -> Option<TokenResolution> {
        for (id, participant) in &self.participants {
            if participant.tokens.iter().any(|t| t == token) {
                if requested_id.is_some_and(|r| r != id) {
                    return None;
                }
                return Some(TokenResolution {
                    participant_id: id.clone(),
                    capabilities: participant.capabilities.clone(),
                });
            }
        }
        match (&self.defaults, requested_id) {
            (Some(defaults), Some(id)) if !self.participants.contains_key(id) => {
                Some(TokenResolution {
                    participant_id: id.to_string(),
                    capabilities: defaults.capabilities.clone(),
                })
            }
            _ => None,
        }
    }
}
