// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Telemetry Ingest Adapter
//!
//! Attaches opaque runtime evidence (logs, traces, cluster snapshots) to a
//! cycle after its CAPTURE_TRACE hop. Blobs are stored as ledger artifacts
//! next to the hop; the hop record itself is never touched.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;

use crate::domain::cycle::Phase;
use crate::domain::events::HandshakeEvent;
use crate::domain::ledger::{CycleLedger, LedgerError, TelemetryArtifact};
use crate::domain::packet::TraceId;
use crate::infrastructure::event_bus::EventBus;

#[derive(Clone)]
pub struct TelemetryIngestAdapter {
    ledger: Arc<dyn CycleLedger>,
    events: EventBus,
}

impl TelemetryIngestAdapter {
    pub fn new(ledger: Arc<dyn CycleLedger>, events: EventBus) -> Self {
        Self { ledger, events }
    }

    pub async fn attach(
        &self,
        trace_id: TraceId,
        blob: impl Into<Vec<u8>>,
    ) -> Result<TelemetryArtifact, TelemetryError> {
        self.attach_from(trace_id, None, blob).await
    }

    /// Attach a blob with a label naming where it came from (e.g. a cluster
    /// name or collector id).
    pub async fn attach_from(
        &self,
        trace_id: TraceId,
        source: Option<String>,
        blob: impl Into<Vec<u8>>,
    ) -> Result<TelemetryArtifact, TelemetryError> {
        let cycle = self
            .ledger
            .load_cycle(trace_id)
            .await?
            .ok_or(TelemetryError::UnknownTrace(trace_id))?;
        let capture = cycle
            .hops
            .iter()
            .find(|h| h.phase == Phase::CaptureTrace && h.result.is_ok())
            .ok_or(TelemetryError::NotCaptured(trace_id))?;

        let blob = blob.into();
        let artifact = TelemetryArtifact {
            trace_id,
            hop_index: capture.hop_index,
            sequence: 0,
            source,
            digest: hex::encode(Sha256::digest(&blob)),
            blob,
            received_at: Utc::now(),
        };
        let stored = self.ledger.attach_artifact(artifact).await?;

        info!(
            trace_id = %trace_id,
            hop_index = stored.hop_index,
            sequence = stored.sequence,
            bytes = stored.blob.len(),
            "Telemetry attached"
        );
        self.events.publish(HandshakeEvent::TelemetryAttached {
            trace_id,
            hop_index: stored.hop_index,
            digest: stored.digest.clone(),
            attached_at: stored.received_at,
        });
        Ok(stored)
    }

    pub async fn artifacts(&self, trace_id: TraceId) -> Result<Vec<TelemetryArtifact>, TelemetryError> {
        Ok(self.ledger.artifacts(trace_id).await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Unknown trace: {0}")]
    UnknownTrace(TraceId),

    #[error("Cycle {0} has not recorded CAPTURE_TRACE yet")]
    NotCaptured(TraceId),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
