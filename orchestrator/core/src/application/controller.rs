// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Cycle Controller Application Service
//!
//! Drives every cycle through the handshake phase sequence and is the only
//! component allowed to mutate a [`Cycle`].
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** FSM tick loop, approval gates, operator control surface
//! - **Dependencies:** Domain (Cycle, Packet, ConstraintSet), Router, Ledger, EventBus
//!
//! # Tick
//!
//! ```text
//! loop {
//!     target = cycle.phase.next()          // or the parked phase on resume
//!     if gated(target) && !approved        -> park (WAITING_APPROVAL)
//!     validate packet, merge constraints   -> violation: FAILED
//!     check hard constraints (DATA, NEW_STATE)
//!     dispatch via router (SYN_ACK, DATA, NEW_STATE)
//!     commit HopRecord + next snapshot     // always, error hops too
//! }
//! ```
//!
//! A hop and the cycle state it produces reach the ledger in a single
//! [`CycleLedger::commit`], so a restart never finds a recorded hop whose
//! transition is missing from the snapshot.
//!
//! One tokio task drives each cycle. A per-cycle mutex keeps that task the
//! single writer; operator calls (`approve`, `reject`, `abort`) take the same
//! mutex. Provider output only ever reaches the next provider through
//! `cycle.packet`, which is set after the hop carrying it is in the ledger.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::application::router::{CapabilityRouter, RouteError};
use crate::application::telemetry::TelemetryIngestAdapter;
use crate::domain::constraint::{ConstraintSet, ConstraintViolation, PlannedAction, HUMAN_APPROVAL_REQUIRED};
use crate::domain::cycle::{
    Approval, Cycle, CycleStatus, ErrorKind, HopDraft, HopResult, PendingReason, Phase, ResultCode,
};
use crate::domain::events::HandshakeEvent;
use crate::domain::ledger::{CycleLedger, LedgerError};
use crate::domain::packet::{Packet, PacketValidator, Role, SchemaViolation, TraceId};
use crate::infrastructure::config::{ApprovalConfig, HandshakeConfigManifest};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::ledger;

/// Per-cycle runtime state. Rebuilt from the ledger when a cycle is touched
/// for the first time in this process.
struct CycleSlot {
    cycle: Mutex<Cycle>,
    abort_requested: AtomicBool,
    status: watch::Sender<CycleStatus>,
}

impl CycleSlot {
    fn new(cycle: Cycle) -> Self {
        let (status, _) = watch::channel(cycle.status);
        Self {
            cycle: Mutex::new(cycle),
            abort_requested: AtomicBool::new(false),
            status,
        }
    }

    fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }
}

enum Step {
    Continue,
    Settled,
}

struct Inner {
    ledger: Arc<dyn CycleLedger>,
    router: Arc<CapabilityRouter>,
    events: EventBus,
    approval: ApprovalConfig,
    slots: DashMap<TraceId, Arc<CycleSlot>>,
}

#[derive(Clone)]
pub struct CycleController {
    inner: Arc<Inner>,
}

impl CycleController {
    pub fn new(
        ledger: Arc<dyn CycleLedger>,
        router: Arc<CapabilityRouter>,
        events: EventBus,
        approval: ApprovalConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                router,
                events,
                approval,
                slots: DashMap::new(),
            }),
        }
    }

    /// Wire ledger, router and event bus from a configuration manifest.
    pub fn from_config(config: &HandshakeConfigManifest) -> Result<Self, ControllerError> {
        let ledger = ledger::from_config(&config.spec.ledger)?;
        let router = Arc::new(CapabilityRouter::new(config.spec.router.clone()));
        let events = EventBus::new(config.spec.events.capacity);
        info!(
            name = %config.metadata.name,
            durable = ledger.is_durable(),
            "Cycle controller initialized"
        );
        Ok(Self::new(ledger, router, events, config.spec.approval.clone()))
    }

    pub fn router(&self) -> &Arc<CapabilityRouter> {
        &self.inner.router
    }

    pub fn ledger(&self) -> &Arc<dyn CycleLedger> {
        &self.inner.ledger
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn telemetry(&self) -> TelemetryIngestAdapter {
        TelemetryIngestAdapter::new(self.inner.ledger.clone(), self.inner.events.clone())
    }

    // ------------------------------------------------------------------------
    // Operator surface
    // ------------------------------------------------------------------------

    /// Validate an untyped initial packet and start a cycle from it.
    pub async fn start_cycle_raw(&self, raw: &serde_json::Value) -> Result<TraceId, ControllerError> {
        let packet = PacketValidator::validate(raw)?;
        self.start_cycle(packet).await
    }

    /// Create a cycle from the operator's initial packet (the SYN) and spawn
    /// its driver. Malformed packets are rejected before any cycle exists.
    pub async fn start_cycle(&self, packet: Packet) -> Result<TraceId, ControllerError> {
        PacketValidator::validate_packet(&packet)?;
        let constraints = ConstraintSet::from_packet(&packet.constraints)?;

        let cycle = Cycle::new(packet, constraints);
        let trace_id = cycle.trace_id;
        self.inner.ledger.open_cycle(&cycle).await?;

        info!(
            trace_id = %trace_id,
            cycle_id = %cycle.cycle_id,
            action = %cycle.packet.intent.action_type,
            "Cycle started"
        );
        metrics::counter!("handshake_cycles_started_total").increment(1);
        self.inner.events.publish(HandshakeEvent::CycleStarted {
            trace_id,
            cycle_id: cycle.cycle_id,
            goal: cycle.packet.context.goal.clone(),
            started_at: Utc::now(),
        });

        let slot = Arc::new(CycleSlot::new(cycle));
        self.inner.slots.insert(trace_id, slot.clone());
        tokio::spawn(self.clone().drive(slot));
        Ok(trace_id)
    }

    /// Grant the pending approval. `hop_index` must name the hop the cycle
    /// is waiting on.
    pub async fn approve(&self, trace_id: TraceId, hop_index: u64) -> Result<(), ControllerError> {
        let slot = self.slot(trace_id).await?;
        {
            let mut cycle = slot.cycle.lock().await;
            Self::expect_pending(&cycle, hop_index)?;

            cycle.approved_hop = Some(hop_index);
            let phase = cycle.phase;
            cycle.advance_to(phase);
            self.persist(&slot, &cycle).await?;

            info!(trace_id = %trace_id, hop_index, "Cycle approved, resuming");
            self.inner.events.publish(HandshakeEvent::CycleResumed {
                trace_id,
                hop_index,
                resumed_at: Utc::now(),
            });
        }
        tokio::spawn(self.clone().drive(slot));
        Ok(())
    }

    /// Refuse the pending approval. Records the refusal as a hop and fails
    /// the cycle.
    pub async fn reject(
        &self,
        trace_id: TraceId,
        hop_index: u64,
        reason: impl Into<String>,
    ) -> Result<(), ControllerError> {
        let reason = reason.into();
        let slot = self.slot(trace_id).await?;
        let mut cycle = slot.cycle.lock().await;
        let phase = Self::expect_pending(&cycle, hop_index)?;

        let draft = HopDraft {
            phase,
            agent_role: Role::SOVEREIGN.to_string(),
            provider_id: None,
            input_packet_hash: cycle.packet.content_hash(),
            output_packet_hash: None,
            latency: Duration::ZERO,
            approval: Approval::Rejected,
            result: HopResult::Error {
                kind: ErrorKind::OperatorRejected,
                detail: reason.clone(),
            },
            artifacts: Vec::new(),
        };
        self.commit(&slot, &mut cycle, draft, Cycle::fail).await?;
        self.announce_failure(&cycle, ErrorKind::OperatorRejected, reason);
        Ok(())
    }

    /// Abort a cycle. A parked or idle cycle is aborted immediately; a cycle
    /// with a provider call in flight is aborted when that call returns.
    pub async fn abort(&self, trace_id: TraceId) -> Result<(), ControllerError> {
        let slot = self.slot(trace_id).await?;
        slot.abort_requested.store(true, Ordering::SeqCst);

        match slot.cycle.try_lock() {
            Ok(mut cycle) => {
                if cycle.status.is_terminal() {
                    return Err(ControllerError::AlreadyTerminal {
                        trace_id,
                        status: cycle.status,
                    });
                }
                self.finish_abort(&slot, &mut cycle).await?;
            }
            Err(_) => {
                info!(trace_id = %trace_id, "Abort requested; takes effect at the next hop boundary");
                // The driver may be parking the cycle right now, after its
                // last flag check.
                let controller = self.clone();
                let slot = Arc::clone(&slot);
                tokio::spawn(async move {
                    let mut cycle = slot.cycle.lock().await;
                    if cycle.status == CycleStatus::WaitingApproval {
                        if let Err(e) = controller.finish_abort(&slot, &mut cycle).await {
                            error!(trace_id = %trace_id, error = %e, "Failed to persist aborted cycle");
                        }
                    }
                });
            }
        }
        Ok(())
    }

    /// Current snapshot of a cycle, hops included, as recorded in the ledger.
    pub async fn get_status(&self, trace_id: TraceId) -> Result<Cycle, ControllerError> {
        self.inner
            .ledger
            .load_cycle(trace_id)
            .await?
            .ok_or(ControllerError::UnknownTrace(trace_id))
    }

    /// Wait until the cycle is no longer `ACTIVE` (parked or terminal).
    pub async fn await_settled(&self, trace_id: TraceId) -> Result<Cycle, ControllerError> {
        let slot = self.slot(trace_id).await?;
        let mut status = slot.status.subscribe();
        // The sender lives in `slot`, which we hold, so this cannot close.
        let _ = status.wait_for(|s| *s != CycleStatus::Active).await;
        self.get_status(trace_id).await
    }

    /// Restart drivers for cycles a previous process left `ACTIVE`. Each
    /// resumes after its last recorded hop.
    pub async fn recover(&self) -> Result<Vec<TraceId>, ControllerError> {
        let mut resumed = Vec::new();
        for cycle in self.inner.ledger.list_cycles().await? {
            if cycle.status.is_terminal() || self.inner.slots.contains_key(&cycle.trace_id) {
                continue;
            }
            let trace_id = cycle.trace_id;
            let slot = self.slot(trace_id).await?;
            let phase = {
                let cycle = slot.cycle.lock().await;
                if cycle.status != CycleStatus::Active {
                    continue;
                }
                cycle.phase
            };
            info!(trace_id = %trace_id, phase = %phase, "Resuming interrupted cycle");
            tokio::spawn(self.clone().drive(slot));
            resumed.push(trace_id);
        }
        Ok(resumed)
    }

    // ------------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------------

    async fn drive(self, slot: Arc<CycleSlot>) {
        loop {
            let mut cycle = slot.cycle.lock().await;
            match self.step(&slot, &mut cycle).await {
                Ok(Step::Continue) => {}
                Ok(Step::Settled) => break,
                Err(e) => {
                    error!(
                        trace_id = %cycle.trace_id,
                        error = %e,
                        "Ledger write failed, stopping cycle driver"
                    );
                    cycle.fail();
                    if let Err(e) = self.inner.ledger.save_cycle(&cycle).await {
                        error!(trace_id = %cycle.trace_id, error = %e, "Failed to persist failed cycle");
                    }
                    slot.status.send_replace(cycle.status);
                    break;
                }
            }
        }
    }

    async fn step(&self, slot: &CycleSlot, cycle: &mut Cycle) -> Result<Step, LedgerError> {
        if cycle.status != CycleStatus::Active {
            return Ok(Step::Settled);
        }
        if slot.abort_requested() {
            self.finish_abort(slot, cycle).await?;
            return Ok(Step::Settled);
        }
        let Some(target) = cycle.target_phase() else {
            return Ok(Step::Settled);
        };

        if target == Phase::Completed {
            if cycle.complete() {
                self.persist(slot, cycle).await?;
                info!(trace_id = %cycle.trace_id, hops = cycle.hops.len(), "Cycle completed");
                metrics::counter!("handshake_cycles_finished_total", "status" => "completed").increment(1);
                self.inner.events.publish(HandshakeEvent::CycleCompleted {
                    trace_id: cycle.trace_id,
                    total_hops: cycle.next_hop_index(),
                    completed_at: Utc::now(),
                });
            } else {
                let detail = format!("{} unresolved constraint violation(s)", cycle.violations.len());
                self.fail_cycle(slot, cycle, ErrorKind::ConstraintViolation, detail).await?;
            }
            return Ok(Step::Settled);
        }

        let hop_index = cycle.next_hop_index();
        let approved = cycle.approved_hop == Some(hop_index);
        if self.requires_approval(cycle, target) && !approved {
            cycle.park(target, PendingReason::ApprovalGate);
            self.persist(slot, cycle).await?;
            info!(trace_id = %cycle.trace_id, hop_index, phase = %target, "Waiting for operator approval");
            self.inner.events.publish(HandshakeEvent::ApprovalRequested {
                trace_id: cycle.trace_id,
                hop_index,
                phase: target,
                reason: "approval gate".to_string(),
                requested_at: Utc::now(),
            });
            return Ok(Step::Settled);
        }
        let approval = if approved { Approval::Granted } else { Approval::None };

        let mut input = cycle.packet.clone();
        input.routing.hop_index = hop_index;
        input.constraints = cycle.accumulated_constraints.to_packet_constraints();

        if target.dispatches() {
            self.exchange(slot, cycle, target, input, approval).await
        } else {
            self.forward(slot, cycle, target, input, approval).await
        }
    }

    /// Controller-mediated hop: no provider is contacted.
    async fn forward(
        &self,
        slot: &CycleSlot,
        cycle: &mut Cycle,
        target: Phase,
        mut packet: Packet,
        approval: Approval,
    ) -> Result<Step, LedgerError> {
        let role = match target {
            Phase::RouteBack => Role::SOVEREIGN,
            Phase::CaptureTrace => Role::OBSERVER,
            _ => Role::CONTROLLER,
        };
        let input_hash = packet.content_hash();

        if let Err(violation) = PacketValidator::validate_packet(&packet) {
            return self
                .schema_failure(slot, cycle, target, role, None, input_hash, None, approval, violation)
                .await;
        }

        packet.routing.current_hop = Some(role.to_string());
        let draft = HopDraft {
            phase: target,
            agent_role: role.to_string(),
            provider_id: None,
            input_packet_hash: input_hash,
            output_packet_hash: Some(packet.content_hash()),
            latency: Duration::ZERO,
            approval,
            result: HopResult::Ok,
            artifacts: Vec::new(),
        };
        self.commit(slot, cycle, draft, |cycle| {
            cycle.packet = packet;
            cycle.advance_to(target);
        })
        .await?;
        Ok(Step::Continue)
    }

    /// Provider hop: resolve, check hard constraints, dispatch, validate and
    /// merge the response.
    async fn exchange(
        &self,
        slot: &CycleSlot,
        cycle: &mut Cycle,
        target: Phase,
        mut input: Packet,
        approval: Approval,
    ) -> Result<Step, LedgerError> {
        input.routing.current_hop = Some(Role::CONTROLLER.to_string());
        let input_hash = input.content_hash();

        let descriptor = match self.inner.router.resolve(&input) {
            Ok(descriptor) => descriptor,
            Err(e) => return self.park_on_route_error(slot, cycle, target, input_hash, approval, e).await,
        };

        if target.mutates_external_state() {
            let planned = PlannedAction {
                phase: target,
                approval,
                provider_id: Some(descriptor.id.clone()),
                provider_external: descriptor.external,
                ledger_durable: self.inner.ledger.is_durable(),
            };
            if let Err(violation) = cycle.accumulated_constraints.check_hard(&planned) {
                return self
                    .constraint_failure(
                        slot,
                        cycle,
                        target,
                        &descriptor.role,
                        Some(descriptor.id.clone()),
                        input_hash,
                        None,
                        approval,
                        violation,
                    )
                    .await;
            }
        }

        let dispatched = self.inner.router.dispatch(&input, target).await;

        if slot.abort_requested() {
            let (provider_id, latency) = match &dispatched {
                Ok(outcome) => (Some(outcome.provider.id.clone()), outcome.latency),
                Err(e) => (e.provider_id().map(str::to_string), Duration::ZERO),
            };
            let draft = HopDraft {
                phase: target,
                agent_role: descriptor.role.clone(),
                provider_id,
                input_packet_hash: input_hash,
                output_packet_hash: None,
                latency,
                approval,
                result: HopResult::Error {
                    kind: ErrorKind::OperatorAbort,
                    detail: "abort requested during dispatch; result discarded".to_string(),
                },
                artifacts: Vec::new(),
            };
            self.commit(slot, cycle, draft, Cycle::abort).await?;
            self.announce_abort(cycle);
            return Ok(Step::Settled);
        }

        let outcome = match dispatched {
            Ok(outcome) => outcome,
            Err(e @ RouteError::ProviderFailed { .. }) => {
                let draft = HopDraft {
                    phase: target,
                    agent_role: descriptor.role.clone(),
                    provider_id: e.provider_id().map(str::to_string),
                    input_packet_hash: input_hash,
                    output_packet_hash: None,
                    latency: Duration::ZERO,
                    approval,
                    result: HopResult::Error {
                        kind: e.kind(),
                        detail: e.to_string(),
                    },
                    artifacts: Vec::new(),
                };
                self.commit(slot, cycle, draft, Cycle::fail).await?;
                self.announce_failure(cycle, e.kind(), e.to_string());
                return Ok(Step::Settled);
            }
            Err(e) => return self.park_on_route_error(slot, cycle, target, input_hash, approval, e).await,
        };

        let provider = outcome.provider;
        let mut response = outcome.response;
        let output_hash = response.content_hash();

        if let Err(violation) = PacketValidator::validate_response(&response, &input.routing) {
            return self
                .schema_failure(
                    slot,
                    cycle,
                    target,
                    &provider.role,
                    Some(provider.id),
                    input_hash,
                    Some(output_hash),
                    approval,
                    violation,
                )
                .await;
        }

        let merged = ConstraintSet::from_packet(&response.constraints)
            .and_then(|incoming| ConstraintSet::merge(&cycle.accumulated_constraints, &incoming));
        let merged = match merged {
            Ok(merged) => merged,
            Err(violation) => {
                return self
                    .constraint_failure(
                        slot,
                        cycle,
                        target,
                        &provider.role,
                        Some(provider.id),
                        input_hash,
                        Some(output_hash),
                        approval,
                        violation,
                    )
                    .await;
            }
        };

        let draft = HopDraft {
            phase: target,
            agent_role: provider.role.clone(),
            provider_id: Some(provider.id.clone()),
            input_packet_hash: input_hash,
            output_packet_hash: Some(output_hash),
            latency: outcome.latency,
            approval,
            result: HopResult::Ok,
            artifacts: response.artifacts.clone(),
        };
        response.routing.hop_index = input.routing.hop_index;
        response.routing.current_hop = Some(provider.id);
        self.commit(slot, cycle, draft, |cycle| {
            cycle.accumulated_constraints = merged;
            cycle.packet = response;
            cycle.advance_to(target);
        })
        .await?;
        Ok(Step::Continue)
    }

    fn requires_approval(&self, cycle: &Cycle, target: Phase) -> bool {
        match target {
            Phase::Data => true,
            Phase::NewState if cycle.accumulated_constraints.contains_token(HUMAN_APPROVAL_REQUIRED) => true,
            _ => self.inner.approval.gated_phases.contains(&target),
        }
    }

    // ------------------------------------------------------------------------
    // Outcomes
    // ------------------------------------------------------------------------

    async fn park_on_route_error(
        &self,
        slot: &CycleSlot,
        cycle: &mut Cycle,
        target: Phase,
        input_hash: String,
        approval: Approval,
        error: RouteError,
    ) -> Result<Step, LedgerError> {
        let detail = error.to_string();
        let draft = HopDraft {
            phase: target,
            agent_role: Role::CONTROLLER.to_string(),
            provider_id: error.provider_id().map(str::to_string),
            input_packet_hash: input_hash,
            output_packet_hash: None,
            latency: Duration::ZERO,
            approval,
            result: HopResult::Error {
                kind: error.kind(),
                detail: detail.clone(),
            },
            artifacts: Vec::new(),
        };
        let reason = match error {
            RouteError::ProviderTimeout { .. } => PendingReason::ProviderTimeout { detail: detail.clone() },
            _ => PendingReason::RouteUnavailable { detail: detail.clone() },
        };
        self.commit(slot, cycle, draft, |cycle| cycle.park(target, reason)).await?;

        warn!(
            trace_id = %cycle.trace_id,
            phase = %target,
            hop_index = cycle.next_hop_index(),
            "Dispatch did not complete, waiting for operator: {}",
            detail
        );
        self.inner.events.publish(HandshakeEvent::ApprovalRequested {
            trace_id: cycle.trace_id,
            hop_index: cycle.next_hop_index(),
            phase: target,
            reason: detail,
            requested_at: Utc::now(),
        });
        Ok(Step::Settled)
    }

    #[allow(clippy::too_many_arguments)]
    async fn schema_failure(
        &self,
        slot: &CycleSlot,
        cycle: &mut Cycle,
        target: Phase,
        role: &str,
        provider_id: Option<String>,
        input_hash: String,
        output_hash: Option<String>,
        approval: Approval,
        violation: SchemaViolation,
    ) -> Result<Step, LedgerError> {
        let draft = HopDraft {
            phase: target,
            agent_role: role.to_string(),
            provider_id,
            input_packet_hash: input_hash,
            output_packet_hash: output_hash,
            latency: Duration::ZERO,
            approval,
            result: HopResult::Error {
                kind: violation.kind(),
                detail: violation.to_string(),
            },
            artifacts: Vec::new(),
        };
        self.commit(slot, cycle, draft, Cycle::fail).await?;
        self.announce_failure(cycle, violation.kind(), violation.to_string());
        Ok(Step::Settled)
    }

    #[allow(clippy::too_many_arguments)]
    async fn constraint_failure(
        &self,
        slot: &CycleSlot,
        cycle: &mut Cycle,
        target: Phase,
        role: &str,
        provider_id: Option<String>,
        input_hash: String,
        output_hash: Option<String>,
        approval: Approval,
        violation: ConstraintViolation,
    ) -> Result<Step, LedgerError> {
        let detail = violation.to_string();
        cycle.violations.push(violation);
        let draft = HopDraft {
            phase: target,
            agent_role: role.to_string(),
            provider_id,
            input_packet_hash: input_hash,
            output_packet_hash: output_hash,
            latency: Duration::ZERO,
            approval,
            result: HopResult::Error {
                kind: ErrorKind::ConstraintViolation,
                detail: detail.clone(),
            },
            artifacts: Vec::new(),
        };
        self.commit(slot, cycle, draft, Cycle::fail).await?;
        self.announce_failure(cycle, ErrorKind::ConstraintViolation, detail);
        Ok(Step::Settled)
    }

    async fn fail_cycle(
        &self,
        slot: &CycleSlot,
        cycle: &mut Cycle,
        kind: ErrorKind,
        reason: String,
    ) -> Result<(), LedgerError> {
        cycle.fail();
        self.persist(slot, cycle).await?;
        self.announce_failure(cycle, kind, reason);
        Ok(())
    }

    fn announce_failure(&self, cycle: &Cycle, kind: ErrorKind, reason: String) {
        warn!(trace_id = %cycle.trace_id, kind = %kind, "Cycle failed: {}", reason);
        metrics::counter!("handshake_cycles_finished_total", "status" => "failed").increment(1);
        self.inner.events.publish(HandshakeEvent::CycleFailed {
            trace_id: cycle.trace_id,
            kind,
            reason,
            failed_at: Utc::now(),
        });
    }

    async fn finish_abort(&self, slot: &CycleSlot, cycle: &mut Cycle) -> Result<(), LedgerError> {
        cycle.abort();
        self.persist(slot, cycle).await?;
        self.announce_abort(cycle);
        Ok(())
    }

    fn announce_abort(&self, cycle: &Cycle) {
        info!(trace_id = %cycle.trace_id, hops = cycle.hops.len(), "Cycle aborted by operator");
        metrics::counter!("handshake_cycles_finished_total", "status" => "aborted").increment(1);
        self.inner.events.publish(HandshakeEvent::CycleAborted {
            trace_id: cycle.trace_id,
            hops_preserved: cycle.next_hop_index(),
            aborted_at: Utc::now(),
        });
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Seal a hop at the next index, apply the transition it causes, and
    /// write both to the ledger as one commit.
    async fn commit(
        &self,
        slot: &CycleSlot,
        cycle: &mut Cycle,
        draft: HopDraft,
        transition: impl FnOnce(&mut Cycle),
    ) -> Result<(), LedgerError> {
        let record = cycle.record(draft);
        cycle.approved_hop = None;
        transition(&mut *cycle);
        self.inner.ledger.commit(cycle, &record).await?;

        debug!(
            trace_id = %cycle.trace_id,
            hop_index = record.hop_index,
            phase = %record.phase,
            provider = ?record.provider_id,
            "Hop recorded"
        );
        let outcome = if record.result.is_ok() { "ok" } else { "error" };
        metrics::counter!("handshake_hops_recorded_total", "result" => outcome).increment(1);
        self.inner.events.publish(HandshakeEvent::HopRecorded {
            trace_id: cycle.trace_id,
            hop_index: record.hop_index,
            phase: record.phase,
            agent_role: record.agent_role.clone(),
            result: record.result.clone(),
            recorded_at: record.timestamp,
        });
        slot.status.send_replace(cycle.status);
        Ok(())
    }

    async fn persist(&self, slot: &CycleSlot, cycle: &Cycle) -> Result<(), LedgerError> {
        self.inner.ledger.save_cycle(cycle).await?;
        slot.status.send_replace(cycle.status);
        Ok(())
    }

    /// Returns the phase the pending hop would enter.
    fn expect_pending(cycle: &Cycle, hop_index: u64) -> Result<Phase, ControllerError> {
        match &cycle.pending {
            Some(pending) if cycle.status == CycleStatus::WaitingApproval => {
                if pending.hop_index != hop_index {
                    return Err(ControllerError::HopMismatch {
                        expected: pending.hop_index,
                        found: hop_index,
                    });
                }
                Ok(pending.phase)
            }
            _ => Err(ControllerError::NotWaiting {
                trace_id: cycle.trace_id,
                status: cycle.status,
            }),
        }
    }

    async fn slot(&self, trace_id: TraceId) -> Result<Arc<CycleSlot>, ControllerError> {
        let existing = self.inner.slots.get(&trace_id).map(|slot| slot.value().clone());
        if let Some(slot) = existing {
            return Ok(slot);
        }
        let mut cycle = self
            .inner
            .ledger
            .load_cycle(trace_id)
            .await?
            .ok_or(ControllerError::UnknownTrace(trace_id))?;
        if cycle.reconcile() {
            warn!(
                trace_id = %trace_id,
                phase = %cycle.phase,
                hops = cycle.hops.len(),
                "Snapshot lagged its hop log; resuming after the last recorded hop"
            );
            self.inner.ledger.save_cycle(&cycle).await?;
        }
        debug!(trace_id = %trace_id, status = %cycle.status, "Hydrated cycle from ledger");
        let slot = self
            .inner
            .slots
            .entry(trace_id)
            .or_insert_with(|| Arc::new(CycleSlot::new(cycle)))
            .value()
            .clone();
        Ok(slot)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Schema(#[from] SchemaViolation),

    #[error(transparent)]
    Constraint(#[from] ConstraintViolation),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Unknown trace: {0}")]
    UnknownTrace(TraceId),

    #[error("Cycle {trace_id} is {status}, not waiting for approval")]
    NotWaiting { trace_id: TraceId, status: CycleStatus },

    #[error("Cycle is waiting on hop {expected}, approval named hop {found}")]
    HopMismatch { expected: u64, found: u64 },

    #[error("Cycle {trace_id} already finished as {status}")]
    AlreadyTerminal { trace_id: TraceId, status: CycleStatus },
}

impl ControllerError {
    /// Process-level result code, for errors that map onto one.
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            ControllerError::Schema(_) => Some(ResultCode::SchemaViolation),
            ControllerError::Constraint(_) => Some(ResultCode::ConstraintViolation),
            _ => None,
        }
    }
}
