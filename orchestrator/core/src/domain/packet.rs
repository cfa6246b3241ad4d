// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Packet Schema & Validator
//!
//! The packet is the only unit of exchange between the Cycle Controller and a
//! capability provider. Providers never talk to each other; every packet they
//! produce comes back through the controller, is validated here and is hashed
//! into the ledger before anything else can read it.
//!
//! | Type | Role |
//! |------|------|
//! | [`Packet`] | Wire-level message (context, intent, constraints, artifacts, routing) |
//! | [`TraceId`], [`CycleId`] | Identifiers carried in [`Routing`] |
//! | [`SchemaVersion`] | `MAJOR.MINOR`; major mismatch is rejected outright |
//! | [`PacketValidator`] | Pure validation functions |

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::cycle::ErrorKind;

// ============================================================================
// Value Objects: Identifiers
// ============================================================================

/// Audit correlation identifier of a cycle. Always a UUIDv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraceId(Uuid);

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Accepts only version-4 UUIDs.
    pub fn from_uuid(uuid: Uuid) -> Result<Self, SchemaViolation> {
        if uuid.get_version_num() != 4 {
            return Err(SchemaViolation::InvalidTraceId(uuid.to_string()));
        }
        Ok(Self(uuid))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for TraceId {
    type Err = SchemaViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s).map_err(|_| SchemaViolation::InvalidTraceId(s.to_string()))?;
        Self::from_uuid(uuid)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one cycle record in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CycleId(pub Uuid);

impl CycleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CycleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Well-known role identifiers. Roles are free-form strings; these are the
/// ones the default routing table and the handshake itself refer to.
pub struct Role;

impl Role {
    /// The human operator driving the cycle.
    pub const SOVEREIGN: &'static str = "sovereign";
    pub const ARCHITECT: &'static str = "architect";
    pub const EXECUTOR: &'static str = "executor";
    pub const AUTOMATION: &'static str = "automation";
    pub const OBSERVER: &'static str = "observer";
    /// Hops the controller performs itself without contacting a provider.
    pub const CONTROLLER: &'static str = "controller";
}

// ============================================================================
// Value Objects: Schema Version
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaVersion {
    pub major: u16,
    pub minor: u16,
}

impl SchemaVersion {
    pub const CURRENT: SchemaVersion = SchemaVersion { major: 1, minor: 0 };

    pub fn is_compatible(&self) -> bool {
        self.major == Self::CURRENT.major
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for SchemaVersion {
    type Err = SchemaViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchemaViolation::InvalidVersion(s.to_string());
        let (major, minor) = match s.split_once('.') {
            Some((major, minor)) => (major, minor),
            None => (s, "0"),
        };
        Ok(Self {
            major: major.trim().parse().map_err(|_| invalid())?,
            minor: minor.trim().parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for SchemaVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SchemaVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Aggregate: Packet
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(default)]
    pub version: SchemaVersion,
    pub context: PacketContext,
    pub intent: Intent,
    #[serde(default)]
    pub constraints: PacketConstraints,
    /// References to diffs, snippets or outputs. Opaque to the engine.
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub routing: Routing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketContext {
    pub goal: String,
    /// Free-form pointers at external repo/cluster state, or at exported
    /// records of earlier cycles.
    #[serde(default)]
    pub references: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub action_type: ActionType,
    #[serde(default)]
    pub optimize_for: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Analyze,
    Generate,
    Transform,
    Review,
}

impl ActionType {
    pub const ALL: [ActionType; 4] = [
        ActionType::Analyze,
        ActionType::Generate,
        ActionType::Transform,
        ActionType::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Analyze => "analyze",
            ActionType::Generate => "generate",
            ActionType::Transform => "transform",
            ActionType::Review => "review",
        }
    }
}

impl FromStr for ActionType {
    type Err = SchemaViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| SchemaViolation::InvalidActionType(s.to_string()))
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy tokens grouped by concern. Interpreted by the constraint propagator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketConstraints {
    #[serde(default)]
    pub style: BTreeSet<String>,
    #[serde(default)]
    pub safety: BTreeSet<String>,
    #[serde(default)]
    pub sovereignty: BTreeSet<String>,
}

impl PacketConstraints {
    pub fn is_empty(&self) -> bool {
        self.style.is_empty() && self.safety.is_empty() && self.sovereignty.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    #[serde(default)]
    pub trace_id: Option<TraceId>,
    #[serde(default)]
    pub cycle_id: Option<CycleId>,
    #[serde(default)]
    pub hop_index: u64,
    #[serde(default)]
    pub current_hop: Option<String>,
    #[serde(default)]
    pub next_hop: Option<String>,
}

impl Packet {
    /// Minimal current-version packet with empty constraints and routing.
    pub fn new(goal: impl Into<String>, action_type: ActionType) -> Self {
        Self {
            version: SchemaVersion::CURRENT,
            context: PacketContext {
                goal: goal.into(),
                references: Vec::new(),
            },
            intent: Intent {
                action_type,
                optimize_for: String::new(),
            },
            constraints: PacketConstraints::default(),
            artifacts: Vec::new(),
            routing: Routing::default(),
        }
    }

    /// SHA-256 over the canonical JSON encoding, hex encoded.
    pub fn content_hash(&self) -> String {
        // All collections are ordered, so the encoding is stable.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

// ============================================================================
// Domain Service: PacketValidator
// ============================================================================

/// Pure packet checks. None of these functions touch the ledger or a cycle.
pub struct PacketValidator;

impl PacketValidator {
    /// Validate an untyped packet as received from an operator or provider.
    pub fn validate(raw: &serde_json::Value) -> Result<Packet, SchemaViolation> {
        let object = raw.as_object().ok_or(SchemaViolation::NotAnObject)?;

        if let Some(version) = object.get("version") {
            let version: SchemaVersion = version
                .as_str()
                .ok_or_else(|| SchemaViolation::InvalidVersion(version.to_string()))?
                .parse()?;
            if !version.is_compatible() {
                return Err(SchemaViolation::UnsupportedVersion {
                    found: version.to_string(),
                    supported: SchemaVersion::CURRENT.to_string(),
                });
            }
        }

        // Checked by hand first so the caller gets a precise reason instead
        // of a generic deserialization error.
        let goal = raw
            .pointer("/context/goal")
            .and_then(|g| g.as_str())
            .unwrap_or_default();
        if goal.trim().is_empty() {
            return Err(SchemaViolation::MissingGoal);
        }
        let action = raw
            .pointer("/intent/action_type")
            .and_then(|a| a.as_str())
            .ok_or_else(|| SchemaViolation::InvalidActionType("<missing>".to_string()))?;
        action.parse::<ActionType>()?;
        if let Some(trace) = raw.pointer("/routing/trace_id").and_then(|t| t.as_str()) {
            trace.parse::<TraceId>()?;
        }

        let packet: Packet = serde_json::from_value(raw.clone())
            .map_err(|e| SchemaViolation::Malformed(e.to_string()))?;
        Self::validate_packet(&packet)?;
        Ok(packet)
    }

    /// Validate a typed packet.
    pub fn validate_packet(packet: &Packet) -> Result<(), SchemaViolation> {
        if !packet.version.is_compatible() {
            return Err(SchemaViolation::UnsupportedVersion {
                found: packet.version.to_string(),
                supported: SchemaVersion::CURRENT.to_string(),
            });
        }
        if packet.context.goal.trim().is_empty() {
            return Err(SchemaViolation::MissingGoal);
        }
        if let Some(trace_id) = packet.routing.trace_id {
            TraceId::from_uuid(trace_id.as_uuid())?;
        }
        for artifact in &packet.artifacts {
            if let Some(path) = artifact.strip_prefix("file:") {
                if !path.starts_with('/') {
                    return Err(SchemaViolation::RelativeArtifactPath(artifact.clone()));
                }
            }
        }
        Ok(())
    }

    /// Validate a provider response against the routing of the cycle that
    /// issued the request.
    pub fn validate_response(packet: &Packet, expected: &Routing) -> Result<(), SchemaViolation> {
        Self::validate_packet(packet)?;
        if packet.routing.trace_id != expected.trace_id {
            return Err(SchemaViolation::TraceMismatch {
                expected: expected.trace_id.map(|t| t.to_string()).unwrap_or_default(),
                found: packet.routing.trace_id.map(|t| t.to_string()).unwrap_or_default(),
            });
        }
        if packet.routing.cycle_id != expected.cycle_id {
            return Err(SchemaViolation::CycleMismatch);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaViolation {
    #[error("packet must be a JSON object")]
    NotAnObject,

    #[error("context.goal must be a non-empty string")]
    MissingGoal,

    #[error("intent.action_type '{0}' is not one of analyze, generate, transform, review")]
    InvalidActionType(String),

    #[error("routing.trace_id '{0}' is not a valid UUIDv4")]
    InvalidTraceId(String),

    #[error("invalid schema version '{0}'")]
    InvalidVersion(String),

    #[error("unsupported schema version {found} (supported major: {supported})")]
    UnsupportedVersion { found: String, supported: String },

    #[error("trace_id mismatch: expected '{expected}', found '{found}'")]
    TraceMismatch { expected: String, found: String },

    #[error("cycle_id does not match the issuing cycle")]
    CycleMismatch,

    #[error("artifact '{0}' must reference an absolute path")]
    RelativeArtifactPath(String),

    #[error("malformed packet: {0}")]
    Malformed(String),
}

impl SchemaViolation {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchemaViolation::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
            _ => ErrorKind::SchemaViolation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn raw(goal: &str, action: &str) -> serde_json::Value {
        json!({
            "context": { "goal": goal },
            "intent": { "action_type": action }
        })
    }

    #[test]
    fn test_minimal_packet_is_valid() {
        let packet = PacketValidator::validate(&raw("refactor auth module", "transform")).unwrap();
        assert_eq!(packet.intent.action_type, ActionType::Transform);
        assert_eq!(packet.version, SchemaVersion::CURRENT);
        assert!(packet.routing.trace_id.is_none());
    }

    #[test]
    fn test_blank_goal_is_rejected() {
        assert_eq!(
            PacketValidator::validate(&raw("   ", "analyze")),
            Err(SchemaViolation::MissingGoal)
        );
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        assert!(matches!(
            PacketValidator::validate(&raw("x", "deploy")),
            Err(SchemaViolation::InvalidActionType(_))
        ));
    }

    #[test]
    fn test_major_version_mismatch() {
        let mut value = raw("x", "review");
        value["version"] = json!("2.0");
        let err = PacketValidator::validate(&value).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedVersion);
    }

    #[test]
    fn test_minor_version_accepted_with_defaults() {
        let mut value = raw("x", "review");
        value["version"] = json!("1.7");
        value["future_field"] = json!({"ignored": true});
        let packet = PacketValidator::validate(&value).unwrap();
        assert_eq!(packet.version, SchemaVersion { major: 1, minor: 7 });
        assert!(packet.constraints.is_empty());
    }

    #[test]
    fn test_trace_id_must_be_v4() {
        let mut value = raw("x", "generate");
        value["routing"] = json!({ "trace_id": "not-a-uuid" });
        assert!(matches!(
            PacketValidator::validate(&value),
            Err(SchemaViolation::InvalidTraceId(_))
        ));

        // Nil UUID parses but is not version 4.
        value["routing"] = json!({ "trace_id": Uuid::nil().to_string() });
        assert!(matches!(
            PacketValidator::validate(&value),
            Err(SchemaViolation::InvalidTraceId(_))
        ));

        let trace = TraceId::new();
        value["routing"] = json!({ "trace_id": trace.to_string() });
        let packet = PacketValidator::validate(&value).unwrap();
        assert_eq!(packet.routing.trace_id, Some(trace));
    }

    #[test]
    fn test_relative_file_artifact_rejected() {
        let mut packet = Packet::new("x", ActionType::Generate);
        packet.artifacts.push("file:src/lib.rs".to_string());
        assert!(matches!(
            PacketValidator::validate_packet(&packet),
            Err(SchemaViolation::RelativeArtifactPath(_))
        ));
        packet.artifacts = vec!["file:/srv/repo/src/lib.rs".into(), "diff:abc123".into()];
        assert!(PacketValidator::validate_packet(&packet).is_ok());
    }

    #[test]
    fn test_response_trace_must_match() {
        let expected = Routing {
            trace_id: Some(TraceId::new()),
            cycle_id: Some(CycleId::new()),
            ..Routing::default()
        };
        let mut response = Packet::new("x", ActionType::Analyze);
        response.routing = expected.clone();
        assert!(PacketValidator::validate_response(&response, &expected).is_ok());

        response.routing.trace_id = Some(TraceId::new());
        assert!(matches!(
            PacketValidator::validate_response(&response, &expected),
            Err(SchemaViolation::TraceMismatch { .. })
        ));
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = Packet::new("same", ActionType::Review);
        let b = Packet::new("same", ActionType::Review);
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), Packet::new("other", ActionType::Review).content_hash());
    }

    fn arb_action() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("analyze".to_string()),
            Just("generate".to_string()),
            Just("transform".to_string()),
            Just("review".to_string()),
            "[a-z]{0,10}",
        ]
    }

    proptest! {
        #[test]
        fn validate_iff_goal_and_action(goal in "[ a-z]{0,12}", action in arb_action()) {
            let expected = !goal.trim().is_empty() && action.parse::<ActionType>().is_ok();
            prop_assert_eq!(PacketValidator::validate(&raw(&goal, &action)).is_ok(), expected);
        }
    }
}
