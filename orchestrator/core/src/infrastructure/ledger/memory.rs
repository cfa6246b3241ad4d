// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::cycle::{Cycle, HopRecord};
use crate::domain::ledger::{check_append, CycleLedger, LedgerEntry, LedgerError, LedgerQuery, TelemetryArtifact};
use crate::domain::packet::{CycleId, TraceId};

struct CycleBook {
    snapshot: Cycle,
    hops: Vec<HopRecord>,
    artifacts: Vec<TelemetryArtifact>,
}

#[derive(Default)]
struct LedgerState {
    books: HashMap<TraceId, CycleBook>,
    by_cycle: HashMap<CycleId, TraceId>,
}

#[derive(Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

fn entry(book: &CycleBook, record: &HopRecord) -> LedgerEntry {
    LedgerEntry {
        trace_id: book.snapshot.trace_id,
        cycle_id: book.snapshot.cycle_id,
        record: record.clone(),
    }
}

#[async_trait]
impl CycleLedger for InMemoryLedger {
    async fn open_cycle(&self, cycle: &Cycle) -> Result<(), LedgerError> {
        let mut state = self.state.write();
        if state.books.contains_key(&cycle.trace_id) {
            return Err(LedgerError::DuplicateCycle(cycle.trace_id));
        }
        let mut snapshot = cycle.clone();
        snapshot.hops.clear();
        state.by_cycle.insert(cycle.cycle_id, cycle.trace_id);
        state.books.insert(
            cycle.trace_id,
            CycleBook {
                snapshot,
                hops: Vec::new(),
                artifacts: Vec::new(),
            },
        );
        Ok(())
    }

    async fn append(&self, cycle_id: CycleId, record: &HopRecord) -> Result<(), LedgerError> {
        let mut state = self.state.write();
        let trace_id = *state
            .by_cycle
            .get(&cycle_id)
            .ok_or_else(|| LedgerError::UnknownCycle(cycle_id.to_string()))?;
        let book = state
            .books
            .get_mut(&trace_id)
            .ok_or_else(|| LedgerError::UnknownCycle(trace_id.to_string()))?;
        check_append(book.hops.last(), record)?;
        book.hops.push(record.clone());
        Ok(())
    }

    async fn commit(&self, cycle: &Cycle, record: &HopRecord) -> Result<(), LedgerError> {
        // One write guard covers both, so readers never see one without the other.
        let mut state = self.state.write();
        let book = state
            .books
            .get_mut(&cycle.trace_id)
            .ok_or_else(|| LedgerError::UnknownCycle(cycle.trace_id.to_string()))?;
        check_append(book.hops.last(), record)?;
        let mut snapshot = cycle.clone();
        snapshot.hops.clear();
        book.hops.push(record.clone());
        book.snapshot = snapshot;
        Ok(())
    }

    async fn save_cycle(&self, cycle: &Cycle) -> Result<(), LedgerError> {
        let mut state = self.state.write();
        let book = state
            .books
            .get_mut(&cycle.trace_id)
            .ok_or_else(|| LedgerError::UnknownCycle(cycle.trace_id.to_string()))?;
        let mut snapshot = cycle.clone();
        snapshot.hops.clear();
        book.snapshot = snapshot;
        Ok(())
    }

    async fn load_cycle(&self, trace_id: TraceId) -> Result<Option<Cycle>, LedgerError> {
        let state = self.state.read();
        Ok(state.books.get(&trace_id).map(|book| {
            let mut cycle = book.snapshot.clone();
            cycle.hops = book.hops.clone();
            cycle
        }))
    }

    async fn list_cycles(&self) -> Result<Vec<Cycle>, LedgerError> {
        let state = self.state.read();
        let mut cycles: Vec<Cycle> = state
            .books
            .values()
            .map(|book| {
                let mut cycle = book.snapshot.clone();
                cycle.hops = book.hops.clone();
                cycle
            })
            .collect();
        cycles.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(cycles)
    }

    async fn query(&self, query: &LedgerQuery) -> Result<Vec<LedgerEntry>, LedgerError> {
        let state = self.state.read();
        let entries = match query {
            LedgerQuery::Trace(trace_id) => state
                .books
                .get(trace_id)
                .map(|book| book.hops.iter().map(|r| entry(book, r)).collect())
                .unwrap_or_default(),
            LedgerQuery::DateRange { from, to } => {
                let mut entries: Vec<LedgerEntry> = state
                    .books
                    .values()
                    .flat_map(|book| {
                        book.hops
                            .iter()
                            .filter(|r| r.timestamp >= *from && r.timestamp <= *to)
                            .map(|r| entry(book, r))
                    })
                    .collect();
                entries.sort_by(|a, b| a.record.timestamp.cmp(&b.record.timestamp));
                entries
            }
            LedgerQuery::Role(role) => {
                let mut entries: Vec<LedgerEntry> = state
                    .books
                    .values()
                    .flat_map(|book| {
                        book.hops
                            .iter()
                            .filter(|r| &r.agent_role == role)
                            .map(|r| entry(book, r))
                    })
                    .collect();
                entries.sort_by(|a, b| a.record.timestamp.cmp(&b.record.timestamp));
                entries
            }
        };
        Ok(entries)
    }

    async fn attach_artifact(&self, mut artifact: TelemetryArtifact) -> Result<TelemetryArtifact, LedgerError> {
        let mut state = self.state.write();
        let book = state
            .books
            .get_mut(&artifact.trace_id)
            .ok_or_else(|| LedgerError::UnknownCycle(artifact.trace_id.to_string()))?;
        artifact.sequence = book.artifacts.len() as u64;
        book.artifacts.push(artifact.clone());
        Ok(artifact)
    }

    async fn artifacts(&self, trace_id: TraceId) -> Result<Vec<TelemetryArtifact>, LedgerError> {
        let state = self.state.read();
        Ok(state
            .books
            .get(&trace_id)
            .map(|book| book.artifacts.clone())
            .unwrap_or_default())
    }

    fn is_durable(&self) -> bool {
        false
    }
}
