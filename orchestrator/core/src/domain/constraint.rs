// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Constraint Propagator
//!
//! Constraints travel with the packet. Every hop's constraints are merged into
//! the cycle's accumulated [`ConstraintSet`]; the accumulated set only ever
//! becomes more restrictive.
//!
//! ## Restrictiveness
//!
//! Policy tokens are mapped to `(key, value, rank)` by the [`PolicyCatalog`].
//! For catalogued keys a higher rank is more restrictive and wins a merge.
//! Uncatalogued `key=value` tokens are unranked: two different values for the
//! same key are a conflict and the merge is rejected. Conflicts are never
//! resolved automatically; the operator decides.
//!
//! ## Hard constraints
//!
//! Before a phase that mutates external state the accumulated set is checked
//! against [`HARD_CONSTRAINTS`] and the [`PlannedAction`] for that phase.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::cycle::{Approval, Phase};
use crate::domain::packet::PacketConstraints;

pub const HUMAN_APPROVAL_REQUIRED: &str = "human-approval-required";
pub const AUDIT_ALL_CHANGES: &str = "audit-all-changes";
pub const NO_EXTERNAL_APIS: &str = "no-external-apis";

/// Tokens whose presence in the accumulated set imposes a check on every
/// mutating phase.
pub const HARD_CONSTRAINTS: [&str; 3] = [HUMAN_APPROVAL_REQUIRED, AUDIT_ALL_CHANGES, NO_EXTERNAL_APIS];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintCategory {
    Style,
    Safety,
    Sovereignty,
}

impl fmt::Display for ConstraintCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConstraintCategory::Style => "style",
            ConstraintCategory::Safety => "safety",
            ConstraintCategory::Sovereignty => "sovereignty",
        };
        f.write_str(s)
    }
}

/// Current value for one policy key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintEntry {
    pub category: ConstraintCategory,
    pub value: String,
    /// `None` for uncatalogued keys, which have no ordering.
    pub rank: Option<u8>,
}

// ============================================================================
// Policy Catalog
// ============================================================================

struct PolicyKey {
    key: &'static str,
    /// Least restrictive first.
    values: &'static [&'static str],
}

const CATALOG: &[PolicyKey] = &[
    PolicyKey {
        key: "external-apis",
        values: &["external-apis-allowed", NO_EXTERNAL_APIS],
    },
    PolicyKey {
        key: "human-approval",
        values: &["human-approval-optional", HUMAN_APPROVAL_REQUIRED],
    },
    PolicyKey {
        key: "audit",
        values: &["audit-on-failure", AUDIT_ALL_CHANGES],
    },
    PolicyKey {
        key: "data-residency",
        values: &["data-residency-any", "data-residency-region", "data-residency-local"],
    },
];

/// Maps policy tokens to keys and restrictiveness ranks.
pub struct PolicyCatalog;

impl PolicyCatalog {
    /// Resolve a token to `(key, value, rank)`.
    pub fn classify(token: &str) -> (String, String, Option<u8>) {
        let token = token.trim();
        for policy in CATALOG {
            if let Some(rank) = policy.values.iter().position(|v| *v == token) {
                return (policy.key.to_string(), token.to_string(), Some(rank as u8));
            }
        }
        match token.split_once('=') {
            Some((key, value)) => (key.trim().to_string(), value.trim().to_string(), None),
            None => (token.to_string(), "on".to_string(), None),
        }
    }

    /// Every catalogued token, for tests and diagnostics.
    pub fn known_tokens() -> Vec<&'static str> {
        CATALOG.iter().flat_map(|p| p.values.iter().copied()).collect()
    }
}

// ============================================================================
// Value Object: ConstraintSet
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintSet {
    entries: BTreeMap<String, ConstraintEntry>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from a packet's policy tokens. Tokens inside one packet
    /// are merged with the same rules as across hops.
    pub fn from_packet(constraints: &PacketConstraints) -> Result<Self, ConstraintViolation> {
        let mut set = Self::new();
        let groups = [
            (ConstraintCategory::Style, &constraints.style),
            (ConstraintCategory::Safety, &constraints.safety),
            (ConstraintCategory::Sovereignty, &constraints.sovereignty),
        ];
        for (category, tokens) in groups {
            for token in tokens {
                set.insert(category, token)?;
            }
        }
        Ok(set)
    }

    /// Add one token, keeping the most restrictive value for its key.
    pub fn insert(&mut self, category: ConstraintCategory, token: &str) -> Result<(), ConstraintViolation> {
        let (key, value, rank) = PolicyCatalog::classify(token);
        let incoming = ConstraintEntry { category, value, rank };
        let merged = match self.entries.get(&key) {
            Some(existing) => Self::merge_entry(&key, existing, &incoming)?,
            None => incoming,
        };
        self.entries.insert(key, merged);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&ConstraintEntry> {
        self.entries.get(key)
    }

    /// True when some key currently holds exactly this token's value.
    pub fn contains_token(&self, token: &str) -> bool {
        let (key, value, _) = PolicyCatalog::classify(token);
        self.entries.get(&key).is_some_and(|e| e.value == value)
    }

    /// Render the set back into packet tokens, so the next provider sees
    /// everything accumulated so far. `from_packet` of the result yields an
    /// equal set.
    pub fn to_packet_constraints(&self) -> PacketConstraints {
        let mut out = PacketConstraints::default();
        for (key, entry) in &self.entries {
            let token = match (entry.rank, entry.value.as_str()) {
                (Some(_), value) => value.to_string(),
                (None, "on") => key.clone(),
                (None, value) => format!("{}={}", key, value),
            };
            let group = match entry.category {
                ConstraintCategory::Style => &mut out.style,
                ConstraintCategory::Safety => &mut out.safety,
                ConstraintCategory::Sovereignty => &mut out.sovereignty,
            };
            group.insert(token);
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConstraintEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Union-merge two sets. For shared keys the more restrictive value wins.
    pub fn merge(accumulated: &ConstraintSet, incoming: &ConstraintSet) -> Result<ConstraintSet, ConstraintViolation> {
        let mut merged = accumulated.clone();
        for (key, entry) in &incoming.entries {
            let value = match merged.entries.get(key) {
                Some(existing) => Self::merge_entry(key, existing, entry)?,
                None => entry.clone(),
            };
            merged.entries.insert(key.clone(), value);
        }
        Ok(merged)
    }

    fn merge_entry(
        key: &str,
        existing: &ConstraintEntry,
        incoming: &ConstraintEntry,
    ) -> Result<ConstraintEntry, ConstraintViolation> {
        match (existing.rank, incoming.rank) {
            (Some(a), Some(b)) => Ok(if b > a { incoming.clone() } else { existing.clone() }),
            _ if existing.value == incoming.value => Ok(existing.clone()),
            _ => Err(ConstraintViolation::Conflict {
                key: key.to_string(),
                existing: existing.value.clone(),
                incoming: incoming.value.clone(),
            }),
        }
    }

    /// True when `self` is at least as restrictive as `other` on every key of
    /// `other`.
    pub fn dominates(&self, other: &ConstraintSet) -> bool {
        other.entries.iter().all(|(key, theirs)| match self.entries.get(key) {
            Some(ours) => match (ours.rank, theirs.rank) {
                (Some(a), Some(b)) => a >= b,
                _ => ours.value == theirs.value,
            },
            None => false,
        })
    }

    /// Check the hard constraints against the action a mutating phase is
    /// about to take.
    pub fn check_hard(&self, action: &PlannedAction) -> Result<(), ConstraintViolation> {
        if !action.phase.mutates_external_state() {
            return Ok(());
        }
        if self.contains_token(HUMAN_APPROVAL_REQUIRED) && action.approval != Approval::Granted {
            return Err(ConstraintViolation::Unsatisfied {
                constraint: HUMAN_APPROVAL_REQUIRED.to_string(),
                phase: action.phase,
                reason: "phase was not approved by an operator".to_string(),
            });
        }
        if self.contains_token(AUDIT_ALL_CHANGES) && !action.ledger_durable {
            return Err(ConstraintViolation::Unsatisfied {
                constraint: AUDIT_ALL_CHANGES.to_string(),
                phase: action.phase,
                reason: "ledger backend is not durable".to_string(),
            });
        }
        if self.contains_token(NO_EXTERNAL_APIS) && action.provider_external {
            return Err(ConstraintViolation::Unsatisfied {
                constraint: NO_EXTERNAL_APIS.to_string(),
                phase: action.phase,
                reason: format!(
                    "provider '{}' reaches external APIs",
                    action.provider_id.as_deref().unwrap_or("<unknown>")
                ),
            });
        }
        Ok(())
    }
}

/// What a mutating phase is about to do, as far as hard constraints care.
#[derive(Debug, Clone)]
pub struct PlannedAction {
    pub phase: Phase,
    pub approval: Approval,
    pub provider_id: Option<String>,
    pub provider_external: bool,
    pub ledger_durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ConstraintViolation {
    #[error("conflicting values for constraint '{key}': '{existing}' vs '{incoming}'")]
    Conflict {
        key: String,
        existing: String,
        incoming: String,
    },

    #[error("hard constraint '{constraint}' not satisfiable in {phase}: {reason}")]
    Unsatisfied {
        constraint: String,
        phase: Phase,
        reason: String,
    },
}
