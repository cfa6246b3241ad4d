// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Durable ledger backed by an embedded sled database.
//!
//! | Tree | Key | Value |
//! |------|-----|-------|
//! | `cycles` | trace id (16 bytes) | cycle snapshot (JSON, no hops) |
//! | `cycle_index` | cycle id (16 bytes) | trace id (16 bytes) |
//! | `hops` | trace id ++ hop index (big endian) | hop record (JSON) |
//! | `artifacts` | trace id ++ sequence (big endian) | telemetry artifact (JSON) |
//!
//! Big-endian suffixes make prefix scans return records in index order.

use async_trait::async_trait;
use parking_lot::Mutex;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::cycle::{Cycle, HopRecord};
use crate::domain::ledger::{check_append, CycleLedger, LedgerEntry, LedgerError, LedgerQuery, TelemetryArtifact};
use crate::domain::packet::{CycleId, TraceId};

pub struct SledLedger {
    db: sled::Db,
    cycles: sled::Tree,
    cycle_index: sled::Tree,
    hops: sled::Tree,
    artifacts: sled::Tree,
    /// Serializes the read-last-then-insert sequence of appends.
    append_lock: Mutex<()>,
}

impl SledLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        info!(path = %path.as_ref().display(), "Opening sled ledger");
        Self::from_db(sled::open(path)?)
    }

    /// Throwaway database removed on drop.
    pub fn temporary() -> Result<Self, LedgerError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, LedgerError> {
        Ok(Self {
            cycles: db.open_tree("cycles")?,
            cycle_index: db.open_tree("cycle_index")?,
            hops: db.open_tree("hops")?,
            artifacts: db.open_tree("artifacts")?,
            db,
            append_lock: Mutex::new(()),
        })
    }

    fn key(trace_id: TraceId, index: u64) -> Vec<u8> {
        let mut key = trace_id.as_uuid().as_bytes().to_vec();
        key.extend_from_slice(&index.to_be_bytes());
        key
    }

    fn trace_for_cycle(&self, cycle_id: CycleId) -> Result<TraceId, LedgerError> {
        let raw = self
            .cycle_index
            .get(cycle_id.0.as_bytes())?
            .ok_or_else(|| LedgerError::UnknownCycle(cycle_id.to_string()))?;
        let uuid = Uuid::from_slice(&raw).map_err(|e| LedgerError::Serialization(e.to_string()))?;
        TraceId::from_uuid(uuid).map_err(|e| LedgerError::Serialization(e.to_string()))
    }

    fn hops_for(&self, trace_id: TraceId) -> Result<Vec<HopRecord>, LedgerError> {
        self.hops
            .scan_prefix(trace_id.as_uuid().as_bytes())
            .values()
            .map(|value| Ok(serde_json::from_slice(&value?)?))
            .collect()
    }

    fn last_hop(&self, trace_id: TraceId) -> Result<Option<HopRecord>, LedgerError> {
        match self.hops.scan_prefix(trace_id.as_uuid().as_bytes()).next_back() {
            Some(item) => {
                let (_, raw) = item?;
                Ok(Some(serde_json::from_slice(&raw)?))
            }
            None => Ok(None),
        }
    }

    fn snapshot(&self, trace_id: TraceId) -> Result<Option<Cycle>, LedgerError> {
        match self.cycles.get(trace_id.as_uuid().as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn all_entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut entries = Vec::new();
        for item in self.cycles.iter() {
            let (_, raw) = item?;
            let cycle: Cycle = serde_json::from_slice(&raw)?;
            for record in self.hops_for(cycle.trace_id)? {
                entries.push(LedgerEntry {
                    trace_id: cycle.trace_id,
                    cycle_id: cycle.cycle_id,
                    record,
                });
            }
        }
        entries.sort_by(|a, b| a.record.timestamp.cmp(&b.record.timestamp));
        Ok(entries)
    }

    async fn flush(&self) -> Result<(), LedgerError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl CycleLedger for SledLedger {
    async fn open_cycle(&self, cycle: &Cycle) -> Result<(), LedgerError> {
        let key = cycle.trace_id.as_uuid().as_bytes().to_vec();
        let value = serde_json::to_vec(cycle)?;
        let swapped = self
            .cycles
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))?;
        if swapped.is_err() {
            return Err(LedgerError::DuplicateCycle(cycle.trace_id));
        }
        self.cycle_index
            .insert(cycle.cycle_id.0.as_bytes(), cycle.trace_id.as_uuid().as_bytes().to_vec())?;
        self.flush().await
    }

    async fn append(&self, cycle_id: CycleId, record: &HopRecord) -> Result<(), LedgerError> {
        let trace_id = self.trace_for_cycle(cycle_id)?;
        {
            let _guard = self.append_lock.lock();
            check_append(self.last_hop(trace_id)?.as_ref(), record)?;
            self.hops
                .insert(Self::key(trace_id, record.hop_index), serde_json::to_vec(record)?)?;
        }
        debug!(trace_id = %trace_id, hop_index = record.hop_index, "Hop appended to sled ledger");
        self.flush().await
    }

    async fn commit(&self, cycle: &Cycle, record: &HopRecord) -> Result<(), LedgerError> {
        let cycle_key = cycle.trace_id.as_uuid().as_bytes().to_vec();
        let hop_key = Self::key(cycle.trace_id, record.hop_index);
        let snapshot = serde_json::to_vec(cycle)?;
        let hop = serde_json::to_vec(record)?;
        {
            let _guard = self.append_lock.lock();
            if !self.cycles.contains_key(&cycle_key)? {
                return Err(LedgerError::UnknownCycle(cycle.trace_id.to_string()));
            }
            check_append(self.last_hop(cycle.trace_id)?.as_ref(), record)?;
            (&self.hops, &self.cycles)
                .transaction(|(hops, cycles)| {
                    hops.insert(hop_key.as_slice(), hop.as_slice())?;
                    cycles.insert(cycle_key.as_slice(), snapshot.as_slice())?;
                    Ok::<(), ConflictableTransactionError<LedgerError>>(())
                })
                .map_err(|e| match e {
                    TransactionError::Abort(e) => e,
                    TransactionError::Storage(e) => LedgerError::from(e),
                })?;
        }
        debug!(
            trace_id = %cycle.trace_id,
            hop_index = record.hop_index,
            phase = %cycle.phase,
            "Hop and snapshot committed to sled ledger"
        );
        self.flush().await
    }

    async fn save_cycle(&self, cycle: &Cycle) -> Result<(), LedgerError> {
        let key = cycle.trace_id.as_uuid().as_bytes().to_vec();
        if !self.cycles.contains_key(&key)? {
            return Err(LedgerError::UnknownCycle(cycle.trace_id.to_string()));
        }
        self.cycles.insert(key, serde_json::to_vec(cycle)?)?;
        self.flush().await
    }

    async fn load_cycle(&self, trace_id: TraceId) -> Result<Option<Cycle>, LedgerError> {
        let Some(mut cycle) = self.snapshot(trace_id)? else {
            return Ok(None);
        };
        cycle.hops = self.hops_for(trace_id)?;
        Ok(Some(cycle))
    }

    async fn list_cycles(&self) -> Result<Vec<Cycle>, LedgerError> {
        let mut cycles = Vec::new();
        for item in self.cycles.iter() {
            let (_, raw) = item?;
            let mut cycle: Cycle = serde_json::from_slice(&raw)?;
            cycle.hops = self.hops_for(cycle.trace_id)?;
            cycles.push(cycle);
        }
        cycles.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(cycles)
    }

    async fn query(&self, query: &LedgerQuery) -> Result<Vec<LedgerEntry>, LedgerError> {
        match query {
            LedgerQuery::Trace(trace_id) => {
                let Some(cycle) = self.snapshot(*trace_id)? else {
                    return Ok(Vec::new());
                };
                Ok(self
                    .hops_for(*trace_id)?
                    .into_iter()
                    .map(|record| LedgerEntry {
                        trace_id: cycle.trace_id,
                        cycle_id: cycle.cycle_id,
                        record,
                    })
                    .collect())
            }
            LedgerQuery::DateRange { from, to } => Ok(self
                .all_entries()?
                .into_iter()
                .filter(|e| e.record.timestamp >= *from && e.record.timestamp <= *to)
                .collect()),
            LedgerQuery::Role(role) => Ok(self
                .all_entries()?
                .into_iter()
                .filter(|e| &e.record.agent_role == role)
                .collect()),
        }
    }

    async fn attach_artifact(&self, mut artifact: TelemetryArtifact) -> Result<TelemetryArtifact, LedgerError> {
        if self.snapshot(artifact.trace_id)?.is_none() {
            return Err(LedgerError::UnknownCycle(artifact.trace_id.to_string()));
        }
        {
            let _guard = self.append_lock.lock();
            artifact.sequence = self
                .artifacts
                .scan_prefix(artifact.trace_id.as_uuid().as_bytes())
                .count() as u64;
            self.artifacts.insert(
                Self::key(artifact.trace_id, artifact.sequence),
                serde_json::to_vec(&artifact)?,
            )?;
        }
        self.flush().await?;
        Ok(artifact)
    }

    async fn artifacts(&self, trace_id: TraceId) -> Result<Vec<TelemetryArtifact>, LedgerError> {
        self.artifacts
            .scan_prefix(trace_id.as_uuid().as_bytes())
            .values()
            .map(|value| Ok(serde_json::from_slice(&value?)?))
            .collect()
    }

    fn is_durable(&self) -> bool {
        true
    }
}
