// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::cycle::{ErrorKind, HopResult, Phase};
use crate::domain::packet::{CycleId, TraceId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeEvent {
    CycleStarted {
        trace_id: TraceId,
        cycle_id: CycleId,
        goal: String,
        started_at: DateTime<Utc>,
    },
    HopRecorded {
        trace_id: TraceId,
        hop_index: u64,
        phase: Phase,
        agent_role: String,
        result: HopResult,
        recorded_at: DateTime<Utc>,
    },
    ApprovalRequested {
        trace_id: TraceId,
        hop_index: u64,
        phase: Phase,
        reason: String,
        requested_at: DateTime<Utc>,
    },
    CycleResumed {
        trace_id: TraceId,
        hop_index: u64,
        resumed_at: DateTime<Utc>,
    },
    CycleCompleted {
        trace_id: TraceId,
        total_hops: u64,
        completed_at: DateTime<Utc>,
    },
    CycleFailed {
        trace_id: TraceId,
        kind: ErrorKind,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    CycleAborted {
        trace_id: TraceId,
        hops_preserved: u64,
        aborted_at: DateTime<Utc>,
    },
    TelemetryAttached {
        trace_id: TraceId,
        hop_index: u64,
        digest: String,
        attached_at: DateTime<Utc>,
    },
}

impl HandshakeEvent {
    pub fn trace_id(&self) -> TraceId {
        match self {
            HandshakeEvent::CycleStarted { trace_id, .. }
            | HandshakeEvent::HopRecorded { trace_id, .. }
            | HandshakeEvent::ApprovalRequested { trace_id, .. }
            | HandshakeEvent::CycleResumed { trace_id, .. }
            | HandshakeEvent::CycleCompleted { trace_id, .. }
            | HandshakeEvent::CycleFailed { trace_id, .. }
            | HandshakeEvent::CycleAborted { trace_id, .. }
            | HandshakeEvent::TelemetryAttached { trace_id, .. } => *trace_id,
        }
    }
}
