// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Cycle Ledger Interface
//!
//! Persistence contract for cycles, following the repository pattern: the
//! interface lives in the domain layer, implementations in
//! `crate::infrastructure::ledger`.
//!
//! | Implementation | Durable | Use |
//! |----------------|---------|-----|
//! | `InMemoryLedger` | no | development and tests |
//! | `SledLedger` | yes | crash-safe approval suspension |
//!
//! Hop records are append-only. Within one cycle an append must carry
//! exactly `last + 1`; anything else is a [`LedgerError::WriteConflict`].
//! Cycle snapshots (phase, status, pending approval, current packet) are
//! overwritten on every transition so a suspended cycle can be resumed after
//! a restart. [`CycleLedger::commit`] writes a hop and the snapshot it
//! produced in one step, so the two never disagree after a crash.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::cycle::{Cycle, HopRecord};
use crate::domain::packet::{CycleId, TraceId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerQuery {
    Trace(TraceId),
    DateRange { from: DateTime<Utc>, to: DateTime<Utc> },
    Role(String),
}

/// One hop together with the cycle it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub trace_id: TraceId,
    pub cycle_id: CycleId,
    pub record: HopRecord,
}

/// Opaque runtime evidence bound to a recorded hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryArtifact {
    pub trace_id: TraceId,
    pub hop_index: u64,
    pub sequence: u64,
    pub source: Option<String>,
    pub digest: String,
    pub blob: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl TelemetryArtifact {
    /// Stable reference used in exports.
    pub fn reference(&self) -> String {
        format!("telemetry:sha256:{}", self.digest)
    }
}

#[async_trait]
pub trait CycleLedger: Send + Sync {
    /// Register a new cycle. Fails if the trace is already known.
    async fn open_cycle(&self, cycle: &Cycle) -> Result<(), LedgerError>;

    /// Append one sealed hop record.
    async fn append(&self, cycle_id: CycleId, record: &HopRecord) -> Result<(), LedgerError>;

    /// Overwrite the cycle snapshot. Hops are not part of the snapshot.
    async fn save_cycle(&self, cycle: &Cycle) -> Result<(), LedgerError>;

    /// Append `record` and overwrite the snapshot with `cycle` atomically.
    /// On error neither write is visible.
    async fn commit(&self, cycle: &Cycle, record: &HopRecord) -> Result<(), LedgerError>;

    /// Snapshot plus every appended hop, in order.
    async fn load_cycle(&self, trace_id: TraceId) -> Result<Option<Cycle>, LedgerError>;

    async fn list_cycles(&self) -> Result<Vec<Cycle>, LedgerError>;

    async fn query(&self, query: &LedgerQuery) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Store an artifact; assigns `sequence` and returns the stored value.
    async fn attach_artifact(&self, artifact: TelemetryArtifact) -> Result<TelemetryArtifact, LedgerError>;

    async fn artifacts(&self, trace_id: TraceId) -> Result<Vec<TelemetryArtifact>, LedgerError>;

    /// Whether writes survive a process restart.
    fn is_durable(&self) -> bool;

    /// Recompute every record hash and the chain between records.
    async fn verify(&self, trace_id: TraceId) -> Result<(), LedgerError> {
        let entries = self.query(&LedgerQuery::Trace(trace_id)).await?;
        verify_chain(entries.iter().map(|e| &e.record))
    }
}

/// Ordering and chaining rule shared by every backend. `last` is the most
/// recently stored record of the same cycle.
pub fn check_append(last: Option<&HopRecord>, record: &HopRecord) -> Result<(), LedgerError> {
    let expected = last.map(|l| l.hop_index + 1).unwrap_or(0);
    if record.hop_index != expected {
        return Err(LedgerError::WriteConflict {
            expected,
            found: record.hop_index,
        });
    }
    if !record.is_intact() {
        return Err(LedgerError::Tampered { hop_index: record.hop_index });
    }
    if record.previous_hash.as_deref() != last.map(|l| l.content_hash.as_str()) {
        return Err(LedgerError::BrokenChain { hop_index: record.hop_index });
    }
    Ok(())
}

pub fn verify_chain<'a>(records: impl IntoIterator<Item = &'a HopRecord>) -> Result<(), LedgerError> {
    let mut previous: Option<&HopRecord> = None;
    for record in records {
        if !record.is_intact() {
            return Err(LedgerError::Tampered { hop_index: record.hop_index });
        }
        let expected_prev = previous.map(|p| p.content_hash.as_str());
        if record.previous_hash.as_deref() != expected_prev {
            return Err(LedgerError::Tampered { hop_index: record.hop_index });
        }
        previous = Some(record);
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Write conflict: expected hop_index {expected}, got {found}")]
    WriteConflict { expected: u64, found: u64 },

    #[error("Hop record {hop_index} failed hash verification")]
    Tampered { hop_index: u64 },

    #[error("Hop record {hop_index} does not link to the previous record")]
    BrokenChain { hop_index: u64 },

    #[error("Unknown cycle: {0}")]
    UnknownCycle(String),

    #[error("Cycle already exists: {0}")]
    DuplicateCycle(TraceId),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

impl From<sled::Error> for LedgerError {
    fn from(err: sled::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}
