// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Cycle Domain Model
//!
//! A cycle is one end-to-end handshake, driven through a fixed phase sequence
//! by the Cycle Controller. This module holds the aggregate and its value
//! objects; the tick loop lives in `application::controller`.
//!
//! # Phase sequence
//!
//! ```text
//! INIT -> SYN -> SYN_ACK -> ACK_FORWARD -> DATA -> ROUTE_BACK -> NEW_STATE -> CAPTURE_TRACE -> COMPLETED
//!                                  (FAILED | ABORTED reachable from any non-terminal phase)
//! ```
//!
//! # Invariants
//! - `trace_id` never changes after creation
//! - `hops` are ordered by `hop_index` 0, 1, 2, ... with no gaps
//! - `accumulated_constraints` only becomes more restrictive
//! - a cycle with recorded violations never reaches `Completed`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

use crate::domain::constraint::{ConstraintSet, ConstraintViolation};
use crate::domain::packet::{CycleId, Packet, TraceId};

// ============================================================================
// Value Objects: Phase & Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Init,
    Syn,
    SynAck,
    AckForward,
    Data,
    RouteBack,
    NewState,
    CaptureTrace,
    Completed,
    Failed,
    Aborted,
}

impl Phase {
    /// The phase that follows `self` on the happy path.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Init => Some(Phase::Syn),
            Phase::Syn => Some(Phase::SynAck),
            Phase::SynAck => Some(Phase::AckForward),
            Phase::AckForward => Some(Phase::Data),
            Phase::Data => Some(Phase::RouteBack),
            Phase::RouteBack => Some(Phase::NewState),
            Phase::NewState => Some(Phase::CaptureTrace),
            Phase::CaptureTrace => Some(Phase::Completed),
            Phase::Completed | Phase::Failed | Phase::Aborted => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Aborted)
    }

    /// Phases whose action is visible outside the engine.
    pub fn mutates_external_state(&self) -> bool {
        matches!(self, Phase::Data | Phase::NewState)
    }

    /// Phases that contact a capability provider when entered.
    pub fn dispatches(&self) -> bool {
        matches!(self, Phase::SynAck | Phase::Data | Phase::NewState)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::Syn => "SYN",
            Phase::SynAck => "SYN_ACK",
            Phase::AckForward => "ACK_FORWARD",
            Phase::Data => "DATA",
            Phase::RouteBack => "ROUTE_BACK",
            Phase::NewState => "NEW_STATE",
            Phase::CaptureTrace => "CAPTURE_TRACE",
            Phase::Completed => "COMPLETED",
            Phase::Failed => "FAILED",
            Phase::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStatus {
    Active,
    WaitingApproval,
    Completed,
    Failed,
    Aborted,
}

impl CycleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleStatus::Completed | CycleStatus::Failed | CycleStatus::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Active => "ACTIVE",
            CycleStatus::WaitingApproval => "WAITING_APPROVAL",
            CycleStatus::Completed => "COMPLETED",
            CycleStatus::Failed => "FAILED",
            CycleStatus::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Approval {
    None,
    Granted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SchemaViolation,
    UnsupportedVersion,
    RouteUnavailable,
    ProviderTimeout,
    ProviderError,
    ConstraintViolation,
    OperatorRejected,
    OperatorAbort,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::SchemaViolation => "SchemaViolation",
            ErrorKind::UnsupportedVersion => "UnsupportedVersion",
            ErrorKind::RouteUnavailable => "RouteUnavailable",
            ErrorKind::ProviderTimeout => "ProviderTimeout",
            ErrorKind::ProviderError => "ProviderError",
            ErrorKind::ConstraintViolation => "ConstraintViolation",
            ErrorKind::OperatorRejected => "OperatorRejected",
            ErrorKind::OperatorAbort => "OperatorAbort",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum HopResult {
    Ok,
    Error { kind: ErrorKind, detail: String },
}

impl HopResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, HopResult::Ok)
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            HopResult::Ok => None,
            HopResult::Error { kind, .. } => Some(*kind),
        }
    }
}

// ============================================================================
// Entity: HopRecord
// ============================================================================

/// One recorded phase transition. Sealed with a content hash at construction
/// and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopRecord {
    pub hop_index: u64,
    pub phase: Phase,
    pub agent_role: String,
    pub provider_id: Option<String>,
    pub input_packet_hash: String,
    pub output_packet_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    pub approval: Approval,
    pub result: HopResult,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub previous_hash: Option<String>,
    pub content_hash: String,
}

/// Fields of a hop before it is sealed.
#[derive(Debug, Clone)]
pub struct HopDraft {
    pub phase: Phase,
    pub agent_role: String,
    pub provider_id: Option<String>,
    pub input_packet_hash: String,
    pub output_packet_hash: Option<String>,
    pub latency: Duration,
    pub approval: Approval,
    pub result: HopResult,
    pub artifacts: Vec<String>,
}

impl HopRecord {
    pub fn seal(draft: HopDraft, hop_index: u64, previous_hash: Option<String>) -> Self {
        let mut record = Self {
            hop_index,
            phase: draft.phase,
            agent_role: draft.agent_role,
            provider_id: draft.provider_id,
            input_packet_hash: draft.input_packet_hash,
            output_packet_hash: draft.output_packet_hash,
            timestamp: Utc::now(),
            latency: draft.latency,
            approval: draft.approval,
            result: draft.result,
            artifacts: draft.artifacts,
            previous_hash,
            content_hash: String::new(),
        };
        record.content_hash = record.compute_hash();
        record
    }

    /// Hash of every field except `content_hash` itself.
    pub fn compute_hash(&self) -> String {
        let mut unsealed = self.clone();
        unsealed.content_hash = String::new();
        let bytes = serde_json::to_vec(&unsealed).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    pub fn is_intact(&self) -> bool {
        self.compute_hash() == self.content_hash
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ============================================================================
// Aggregate Root: Cycle
// ============================================================================

/// Why a cycle is suspended in `WaitingApproval`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PendingReason {
    /// Gate before a phase that mutates external state.
    ApprovalGate,
    /// Router had no registered target; operator must re-route.
    RouteUnavailable { detail: String },
    /// Retry budget exhausted.
    ProviderTimeout { detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pending {
    /// Phase that will be (re)attempted on approval.
    pub phase: Phase,
    /// The hop index an approval or rejection must name.
    pub hop_index: u64,
    #[serde(flatten)]
    pub reason: PendingReason,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cycle {
    pub cycle_id: CycleId,
    pub trace_id: TraceId,
    pub phase: Phase,
    pub status: CycleStatus,
    /// Loaded from the ledger's append-only hop store, never from the
    /// snapshot.
    #[serde(skip)]
    pub hops: Vec<HopRecord>,
    pub accumulated_constraints: ConstraintSet,
    /// Packet the next hop consumes.
    pub packet: Packet,
    pub pending: Option<Pending>,
    #[serde(default)]
    pub violations: Vec<ConstraintViolation>,
    /// Approval granted for the next hop, consumed when that hop is recorded.
    #[serde(default)]
    pub approved_hop: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cycle {
    /// New cycle in `SYN`: the initial packet is the synchronise message.
    pub fn new(packet: Packet, accumulated_constraints: ConstraintSet) -> Self {
        let now = Utc::now();
        let cycle_id = CycleId::new();
        let trace_id = TraceId::new();
        let mut packet = packet;
        packet.routing.trace_id = Some(trace_id);
        packet.routing.cycle_id = Some(cycle_id);
        packet.routing.hop_index = 0;
        packet.routing.current_hop = Some(crate::domain::packet::Role::SOVEREIGN.to_string());
        Self {
            cycle_id,
            trace_id,
            phase: Phase::Syn,
            status: CycleStatus::Active,
            hops: Vec::new(),
            accumulated_constraints,
            packet,
            pending: None,
            violations: Vec::new(),
            approved_hop: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn next_hop_index(&self) -> u64 {
        self.hops.len() as u64
    }

    pub fn last_hash(&self) -> Option<String> {
        self.hops.last().map(|h| h.content_hash.clone())
    }

    pub fn last_hop(&self) -> Option<&HopRecord> {
        self.hops.last()
    }

    /// Next phase on the happy path, or the phase a suspension will retry.
    pub fn target_phase(&self) -> Option<Phase> {
        match &self.pending {
            Some(pending) => Some(pending.phase),
            None => self.phase.next(),
        }
    }

    /// Seal a draft at the next index and append it. Returns the record for
    /// the ledger.
    pub fn record(&mut self, draft: HopDraft) -> HopRecord {
        let record = HopRecord::seal(draft, self.next_hop_index(), self.last_hash());
        self.hops.push(record.clone());
        self.updated_at = Utc::now();
        record
    }

    pub fn advance_to(&mut self, phase: Phase) {
        self.phase = phase;
        self.status = CycleStatus::Active;
        self.pending = None;
        self.updated_at = Utc::now();
    }

    pub fn park(&mut self, phase: Phase, reason: PendingReason) {
        self.status = CycleStatus::WaitingApproval;
        self.pending = Some(Pending {
            phase,
            hop_index: self.next_hop_index(),
            reason,
            since: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self) {
        self.phase = Phase::Failed;
        self.status = CycleStatus::Failed;
        self.pending = None;
        self.updated_at = Utc::now();
    }

    pub fn abort(&mut self) {
        self.phase = Phase::Aborted;
        self.status = CycleStatus::Aborted;
        self.pending = None;
        self.updated_at = Utc::now();
    }

    /// Only legal from `CaptureTrace` with no recorded violations.
    pub fn complete(&mut self) -> bool {
        if self.phase != Phase::CaptureTrace || !self.violations.is_empty() {
            return false;
        }
        self.phase = Phase::Completed;
        self.status = CycleStatus::Completed;
        self.pending = None;
        self.updated_at = Utc::now();
        true
    }

    /// Bring a snapshot that lags its own hop log up to the log. An `ok`
    /// hop past the snapshot's phase means that transition already
    /// happened and must not be dispatched again. Returns whether the
    /// snapshot changed.
    pub fn reconcile(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let next = self.next_hop_index();
        let mut changed = false;

        if self.approved_hop.is_some_and(|hop| hop < next) {
            self.approved_hop = None;
            changed = true;
        }
        let ahead = self
            .hops
            .last()
            .filter(|hop| hop.result.is_ok() && hop.phase > self.phase)
            .map(|hop| hop.phase);
        if let Some(phase) = ahead {
            self.advance_to(phase);
            changed = true;
        }
        changed
    }
}

// ============================================================================
// Result Codes
// ============================================================================

/// Process-level outcome codes for a cycle or an operator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Success = 0,
    SchemaViolation = 2,
    RouteUnavailable = 3,
    ProviderTimeout = 4,
    ConstraintViolation = 5,
    OperatorAbort = 6,
    /// A reachable provider refused the packet or failed internally.
    ProviderError = 7,
}

impl ResultCode {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    /// An operator refusing a gate counts as a constraint violation: the
    /// gate is the human-approval constraint, and the refusal is its verdict.
    pub fn from_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::SchemaViolation | ErrorKind::UnsupportedVersion => ResultCode::SchemaViolation,
            ErrorKind::RouteUnavailable => ResultCode::RouteUnavailable,
            ErrorKind::ProviderTimeout => ResultCode::ProviderTimeout,
            ErrorKind::ProviderError => ResultCode::ProviderError,
            ErrorKind::ConstraintViolation | ErrorKind::OperatorRejected => ResultCode::ConstraintViolation,
            ErrorKind::OperatorAbort => ResultCode::OperatorAbort,
        }
    }

    /// Outcome of a cycle as it currently stands. `None` while it is still
    /// running or waiting at a plain approval gate.
    pub fn for_cycle(cycle: &Cycle) -> Option<Self> {
        match cycle.status {
            CycleStatus::Completed => Some(ResultCode::Success),
            CycleStatus::Aborted => Some(ResultCode::OperatorAbort),
            CycleStatus::Active => None,
            CycleStatus::WaitingApproval => match cycle.pending.as_ref().map(|p| &p.reason) {
                Some(PendingReason::RouteUnavailable { .. }) => Some(ResultCode::RouteUnavailable),
                Some(PendingReason::ProviderTimeout { .. }) => Some(ResultCode::ProviderTimeout),
                _ => None,
            },
            CycleStatus::Failed => cycle
                .hops
                .iter()
                .rev()
                .find_map(|h| h.result.error_kind())
                .map(Self::from_kind)
                .or(Some(ResultCode::ConstraintViolation)),
        }
    }
}
