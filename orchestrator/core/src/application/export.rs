// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0

// Cycle Log Export
//
// Turns a cycle's hops into a stable, versioned record set (JSON lines) for
// audit and for feeding a later cycle, plus a plain-text report for humans.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::domain::cycle::{Approval, Cycle, HopResult, Phase, ResultCode};
use crate::domain::ledger::TelemetryArtifact;
use crate::domain::packet::{CycleId, TraceId};

pub const LOG_FORMAT_VERSION: u32 = 1;

/// One exported hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleLogRecord {
    pub format: u32,
    pub trace_id: TraceId,
    pub cycle_id: CycleId,
    pub hop_index: u64,
    pub agent_role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
    pub approval: Approval,
    pub result: HopResult,
    /// Exactly the hop's own artifact references.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Runtime evidence attached to this hop after it was recorded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub telemetry: Vec<String>,
    pub content_hash: String,
}

impl CycleLogRecord {
    /// Reference string for `context.references` of a follow-up packet.
    pub fn reference(&self) -> String {
        format!("handshake:{}#{}", self.trace_id, self.hop_index)
    }
}

/// One record per hop, in hop order. Telemetry references are listed
/// separately on the CAPTURE_TRACE record they are bound to.
pub fn export_records(cycle: &Cycle, telemetry: &[TelemetryArtifact]) -> Vec<CycleLogRecord> {
    cycle
        .hops
        .iter()
        .map(|hop| {
            let evidence = telemetry
                .iter()
                .filter(|t| t.hop_index == hop.hop_index)
                .map(TelemetryArtifact::reference)
                .collect();
            CycleLogRecord {
                format: LOG_FORMAT_VERSION,
                trace_id: cycle.trace_id,
                cycle_id: cycle.cycle_id,
                hop_index: hop.hop_index,
                agent_role: hop.agent_role.clone(),
                provider_id: hop.provider_id.clone(),
                phase: hop.phase,
                timestamp: hop.timestamp,
                approval: hop.approval,
                result: hop.result.clone(),
                artifacts: hop.artifacts.clone(),
                telemetry: evidence,
                content_hash: hop.content_hash.clone(),
            }
        })
        .collect()
}

pub fn to_jsonl(records: &[CycleLogRecord]) -> Result<String, ExportError> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    Ok(out)
}

pub fn from_jsonl(input: &str) -> Result<Vec<CycleLogRecord>, ExportError> {
    input
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            let record: CycleLogRecord =
                serde_json::from_str(line).map_err(|e| ExportError::Malformed { line: n + 1, reason: e.to_string() })?;
            if record.format > LOG_FORMAT_VERSION {
                return Err(ExportError::UnsupportedFormat(record.format));
            }
            Ok(record)
        })
        .collect()
}

/// Human-readable report of a cycle.
pub fn render_report(cycle: &Cycle, records: &[CycleLogRecord]) -> String {
    let mut out = String::new();
    let outcome = ResultCode::for_cycle(cycle)
        .map(|code| format!("{:?} ({})", code, code.code()))
        .unwrap_or_else(|| "pending".to_string());

    let _ = writeln!(out, "Swarm Handshake {}", cycle.trace_id);
    let _ = writeln!(out, "  cycle:   {}", cycle.cycle_id);
    let _ = writeln!(out, "  goal:    {}", cycle.packet.context.goal);
    let _ = writeln!(out, "  action:  {}", cycle.packet.intent.action_type);
    let _ = writeln!(out, "  status:  {} (phase {})", cycle.status, cycle.phase);
    let _ = writeln!(out, "  outcome: {}", outcome);
    let _ = writeln!(out, "  created: {}", cycle.created_at.to_rfc3339());

    if !cycle.accumulated_constraints.is_empty() {
        let _ = writeln!(out, "  constraints:");
        for (key, entry) in cycle.accumulated_constraints.iter() {
            let _ = writeln!(out, "    {} = {} [{}]", key, entry.value, entry.category);
        }
    }
    if let Some(pending) = &cycle.pending {
        let _ = writeln!(
            out,
            "  waiting: approve hop {} to enter {}",
            pending.hop_index, pending.phase
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "  #  phase          role         result");
    for record in records {
        let result = match &record.result {
            HopResult::Ok => "ok".to_string(),
            HopResult::Error { kind, detail } => format!("{}: {}", kind, detail),
        };
        let approval = match record.approval {
            Approval::Granted => " (approved)",
            Approval::Rejected => " (rejected)",
            Approval::None => "",
        };
        let _ = writeln!(
            out,
            "  {:<2} {:<14} {:<12} {}{}",
            record.hop_index,
            record.phase.as_str(),
            record.agent_role,
            result,
            approval
        );
        for artifact in record.artifacts.iter().chain(&record.telemetry) {
            let _ = writeln!(out, "       -> {}", artifact);
        }
    }
    out
}

/// References to hand to the next cycle as `context.references`.
pub fn feedback_context(records: &[CycleLogRecord]) -> Vec<String> {
    records
        .iter()
        .flat_map(|r| {
            std::iter::once(r.reference())
                .chain(r.artifacts.iter().cloned())
                .chain(r.telemetry.iter().cloned())
        })
        .collect()
}

/// Write `handshake_<trace_id>.jsonl` and `handshake_<trace_id>.txt` into
/// `dir`, creating it if needed. Returns both paths.
pub fn write_cycle_log(
    dir: impl AsRef<Path>,
    cycle: &Cycle,
    telemetry: &[TelemetryArtifact],
) -> Result<(PathBuf, PathBuf), ExportError> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let records = export_records(cycle, telemetry);
    let jsonl_path = dir.join(format!("handshake_{}.jsonl", cycle.trace_id));
    let report_path = dir.join(format!("handshake_{}.txt", cycle.trace_id));
    std::fs::write(&jsonl_path, to_jsonl(&records)?)?;
    std::fs::write(&report_path, render_report(cycle, &records))?;

    info!(trace_id = %cycle.trace_id, path = %jsonl_path.display(), "Cycle log written");
    Ok((jsonl_path, report_path))
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Malformed record on line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("Unsupported log format version {0}")]
    UnsupportedFormat(u32),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
