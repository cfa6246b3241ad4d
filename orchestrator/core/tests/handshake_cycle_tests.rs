// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end handshake cycles against scripted providers.
//!
//! Covers:
//! 1. A clean run through all seven phases
//! 2. Route loss or an unreachable provider, operator re-route and resume
//! 3. Provider timeout suspension
//! 4. Concurrent cycles keeping independent, gap-free hop sequences
//! 5. Constraint and schema failures that must never complete
//! 6. Operator abort while a provider call is in flight

mod common;

use common::{memory_controller, run_with_approvals, wait_for_calls, Behavior, TestProvider};
use handshake_core::domain::cycle::{Approval, CycleStatus, ErrorKind, PendingReason, Phase, ResultCode};
use handshake_core::domain::events::HandshakeEvent;
use handshake_core::domain::ledger::{verify_chain, CycleLedger};
use handshake_core::domain::packet::{ActionType, Packet, Role};
use handshake_core::domain::provider::ProviderDescriptor;
use handshake_core::infrastructure::config::RouterConfig;
use handshake_core::infrastructure::ledger::InMemoryLedger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const HAPPY_PATH: [Phase; 6] = [
    Phase::SynAck,
    Phase::AckForward,
    Phase::Data,
    Phase::RouteBack,
    Phase::NewState,
    Phase::CaptureTrace,
];

#[tokio::test]
async fn test_clean_cycle_completes_with_six_hops() {
    let architect = TestProvider::echo("arch-1", Role::ARCHITECT);
    let controller = memory_controller(&[architect.clone()]);
    let mut events = controller.events().subscribe();

    let trace_id = controller
        .start_cycle(Packet::new("analyse the auth module", ActionType::Analyze))
        .await
        .unwrap();
    let cycle = run_with_approvals(&controller, trace_id).await;

    assert_eq!(cycle.status, CycleStatus::Completed);
    assert_eq!(cycle.phase, Phase::Completed);
    assert_eq!(ResultCode::for_cycle(&cycle), Some(ResultCode::Success));
    assert_eq!(cycle.hops.iter().map(|h| h.phase).collect::<Vec<_>>(), HAPPY_PATH);
    assert_eq!(
        cycle.hops.iter().map(|h| h.hop_index).collect::<Vec<_>>(),
        (0..6u64).collect::<Vec<_>>()
    );
    assert!(cycle.hops.iter().all(|h| h.result.is_ok()));
    assert!(cycle.hops.iter().all(|h| h.is_intact()));
    verify_chain(&cycle.hops).unwrap();

    // DATA always waits for the operator; NEW_STATE only under
    // human-approval-required.
    assert_eq!(cycle.hops[2].approval, Approval::Granted);
    assert_eq!(cycle.hops[4].approval, Approval::None);
    assert_eq!(architect.calls(), 3);
    assert_eq!(cycle.hops[1].agent_role, Role::CONTROLLER);
    assert_eq!(cycle.hops[3].agent_role, Role::SOVEREIGN);
    assert_eq!(cycle.hops[5].agent_role, Role::OBSERVER);
    assert_eq!(cycle.hops[0].provider_id.as_deref(), Some("arch-1"));

    // The trace id never changes, even in the packets handed around.
    assert_eq!(cycle.packet.routing.trace_id, Some(trace_id));
    controller.ledger().verify(trace_id).await.unwrap();

    let mut saw_gate = false;
    let mut saw_completion = false;
    while let Ok(event) = events.try_recv() {
        match event {
            HandshakeEvent::ApprovalRequested { hop_index, phase, .. } => {
                assert_eq!((hop_index, phase), (2, Phase::Data));
                saw_gate = true;
            }
            HandshakeEvent::CycleCompleted { total_hops, .. } => {
                assert_eq!(total_hops, 6);
                saw_completion = true;
            }
            _ => {}
        }
    }
    assert!(saw_gate && saw_completion);
}

#[tokio::test]
async fn test_human_approval_gates_new_state() {
    let architect = TestProvider::echo("arch-1", Role::ARCHITECT);
    let controller = memory_controller(&[architect]);

    let mut packet = Packet::new("rotate the signing keys", ActionType::Review);
    packet.constraints.safety.insert("human-approval-required".into());
    let trace_id = controller.start_cycle(packet).await.unwrap();

    let parked = controller.await_settled(trace_id).await.unwrap();
    assert_eq!(parked.pending.as_ref().map(|p| p.phase), Some(Phase::Data));
    controller.approve(trace_id, 2).await.unwrap();

    let parked = controller.await_settled(trace_id).await.unwrap();
    assert_eq!(parked.status, CycleStatus::WaitingApproval);
    let pending = parked.pending.unwrap();
    assert_eq!((pending.phase, pending.hop_index), (Phase::NewState, 4));
    controller.approve(trace_id, 4).await.unwrap();

    let cycle = controller.await_settled(trace_id).await.unwrap();
    assert_eq!(cycle.status, CycleStatus::Completed);
    assert_eq!(cycle.hops[4].approval, Approval::Granted);
    assert!(cycle.accumulated_constraints.contains_token("human-approval-required"));
}

#[tokio::test]
async fn test_route_unavailable_parks_then_resumes_after_reroute() {
    let architect = TestProvider::echo("arch-1", Role::ARCHITECT);
    let controller = memory_controller(&[architect]);

    // Generate routes to the executor role, which nobody fills yet.
    let trace_id = controller
        .start_cycle(Packet::new("generate the migration", ActionType::Generate))
        .await
        .unwrap();
    let parked = controller.await_settled(trace_id).await.unwrap();

    assert_eq!(parked.status, CycleStatus::WaitingApproval);
    assert_eq!(ResultCode::for_cycle(&parked), Some(ResultCode::RouteUnavailable));
    assert_eq!(parked.hops.len(), 1);
    assert_eq!(parked.hops[0].result.error_kind(), Some(ErrorKind::RouteUnavailable));
    let pending = parked.pending.clone().unwrap();
    assert_eq!((pending.phase, pending.hop_index), (Phase::SynAck, 1));
    assert!(matches!(pending.reason, PendingReason::RouteUnavailable { .. }));

    let executor = TestProvider::echo("exec-1", Role::EXECUTOR);
    controller.router().register(executor.clone());
    controller.approve(trace_id, 1).await.unwrap();

    let cycle = run_with_approvals(&controller, trace_id).await;
    assert_eq!(cycle.status, CycleStatus::Completed);
    assert_eq!(cycle.hops.len(), 7);
    assert_eq!(cycle.hops[1].phase, Phase::SynAck);
    assert_eq!(cycle.hops[1].approval, Approval::Granted);
    assert_eq!(cycle.hops[1].provider_id.as_deref(), Some("exec-1"));
    assert_eq!(executor.calls(), 3);
    verify_chain(&cycle.hops).unwrap();
}

#[tokio::test]
async fn test_unreachable_provider_parks_then_resumes() {
    let offline = TestProvider::new(ProviderDescriptor::new("exec-1", Role::EXECUTOR), Behavior::Unreachable);
    let controller = memory_controller(&[offline.clone()]);

    let trace_id = controller
        .start_cycle(Packet::new("transform the config", ActionType::Transform))
        .await
        .unwrap();
    let parked = controller.await_settled(trace_id).await.unwrap();

    assert_eq!(parked.status, CycleStatus::WaitingApproval);
    assert_eq!(ResultCode::for_cycle(&parked), Some(ResultCode::RouteUnavailable));
    assert_eq!(parked.hops.len(), 1);
    assert_eq!(parked.hops[0].result.error_kind(), Some(ErrorKind::RouteUnavailable));
    let pending = parked.pending.clone().unwrap();
    assert_eq!((pending.phase, pending.hop_index), (Phase::SynAck, 1));
    assert!(matches!(pending.reason, PendingReason::RouteUnavailable { .. }));
    // Unreachable is not a timeout: no retries.
    assert_eq!(offline.calls(), 1);

    // The backend comes back under the same id.
    let online = TestProvider::echo("exec-1", Role::EXECUTOR);
    controller.router().register(online.clone());
    controller.approve(trace_id, 1).await.unwrap();

    let cycle = run_with_approvals(&controller, trace_id).await;
    assert_eq!(cycle.status, CycleStatus::Completed);
    assert_eq!(cycle.hops.len(), 7);
    assert_eq!(cycle.hops[1].provider_id.as_deref(), Some("exec-1"));
    assert_eq!(online.calls(), 3);
    assert_eq!(offline.calls(), 1);
}

#[tokio::test]
async fn test_provider_timeout_suspends_cycle() {
    let slow = TestProvider::new(
        ProviderDescriptor::new("exec-slow", Role::EXECUTOR),
        Behavior::Delay(Duration::from_secs(10)),
    );
    let controller = common::controller_with(
        Arc::new(InMemoryLedger::new()),
        RouterConfig {
            dispatch_timeout: Duration::from_millis(20),
            max_retries: 1,
            backoff_base: Duration::from_millis(1),
            ..RouterConfig::default()
        },
        &[slow.clone()],
    );

    let trace_id = controller
        .start_cycle(Packet::new("transform the schema", ActionType::Transform))
        .await
        .unwrap();
    let cycle = controller.await_settled(trace_id).await.unwrap();

    assert_eq!(cycle.status, CycleStatus::WaitingApproval);
    assert_eq!(ResultCode::for_cycle(&cycle), Some(ResultCode::ProviderTimeout));
    let last = cycle.hops.last().unwrap();
    assert_eq!(last.result.error_kind(), Some(ErrorKind::ProviderTimeout));
    assert_eq!(last.provider_id.as_deref(), Some("exec-slow"));
    assert!(matches!(
        cycle.pending.unwrap().reason,
        PendingReason::ProviderTimeout { .. }
    ));
    assert_eq!(slow.calls(), 2);
}

#[tokio::test]
async fn test_concurrent_cycles_keep_independent_hop_sequences() {
    let architect = TestProvider::echo("arch-1", Role::ARCHITECT);
    let executor = TestProvider::echo("exec-1", Role::EXECUTOR);
    let controller = memory_controller(&[architect, executor]);

    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..8 {
        let controller = controller.clone();
        tasks.spawn(async move {
            let action = if n % 2 == 0 { ActionType::Analyze } else { ActionType::Generate };
            let trace_id = controller
                .start_cycle(Packet::new(format!("goal {}", n), action))
                .await
                .unwrap();
            run_with_approvals(&controller, trace_id).await
        });
    }

    let mut traces = std::collections::BTreeSet::new();
    while let Some(joined) = tasks.join_next().await {
        let cycle = joined.unwrap();
        assert_eq!(cycle.status, CycleStatus::Completed);
        assert_eq!(
            cycle.hops.iter().map(|h| h.hop_index).collect::<Vec<_>>(),
            (0..6u64).collect::<Vec<_>>()
        );
        verify_chain(&cycle.hops).unwrap();
        traces.insert(cycle.trace_id);
    }
    assert_eq!(traces.len(), 8);
    assert_eq!(controller.ledger().list_cycles().await.unwrap().len(), 8);
}

#[tokio::test]
async fn test_conflicting_provider_constraint_fails_cycle() {
    let architect = TestProvider::new(
        ProviderDescriptor::new("arch-1", Role::ARCHITECT),
        Behavior::AddStyle("indent=2".into()),
    );
    let controller = memory_controller(&[architect]);

    let mut packet = Packet::new("review formatting", ActionType::Review);
    packet.constraints.style.insert("indent=4".into());
    let trace_id = controller.start_cycle(packet).await.unwrap();
    let cycle = controller.await_settled(trace_id).await.unwrap();

    assert_eq!(cycle.status, CycleStatus::Failed);
    assert_eq!(cycle.hops.len(), 1);
    assert_eq!(cycle.hops[0].result.error_kind(), Some(ErrorKind::ConstraintViolation));
    assert_eq!(cycle.violations.len(), 1);
    assert_eq!(ResultCode::for_cycle(&cycle), Some(ResultCode::ConstraintViolation));
    // Losing value is never silently dropped from the accumulated set.
    assert_eq!(cycle.accumulated_constraints.get("indent").unwrap().value, "4");
}

#[tokio::test]
async fn test_external_provider_blocked_by_sovereignty_constraint() {
    let hosted = TestProvider::new(
        ProviderDescriptor::new("hosted-exec", Role::EXECUTOR).external(true),
        Behavior::Echo,
    );
    let controller = memory_controller(&[hosted.clone()]);

    let mut packet = Packet::new("generate release notes", ActionType::Generate);
    packet.constraints.sovereignty.insert("no-external-apis".into());
    let trace_id = controller.start_cycle(packet).await.unwrap();
    let cycle = run_with_approvals(&controller, trace_id).await;

    // SYN_ACK is not externally visible, so it goes through; DATA does not.
    assert_eq!(cycle.status, CycleStatus::Failed);
    assert_eq!(hosted.calls(), 1);
    let last = cycle.hops.last().unwrap();
    assert_eq!(last.phase, Phase::Data);
    assert_eq!(last.approval, Approval::Granted);
    assert_eq!(last.result.error_kind(), Some(ErrorKind::ConstraintViolation));
}

#[tokio::test]
async fn test_audit_constraint_requires_durable_ledger() {
    let architect = TestProvider::echo("arch-1", Role::ARCHITECT);
    let controller = memory_controller(&[architect]);

    let mut packet = Packet::new("analyse audit trail", ActionType::Analyze);
    packet.constraints.safety.insert("audit-all-changes".into());
    let trace_id = controller.start_cycle(packet).await.unwrap();
    let cycle = run_with_approvals(&controller, trace_id).await;

    assert_eq!(cycle.status, CycleStatus::Failed);
    let last = cycle.hops.last().unwrap();
    assert_eq!(last.phase, Phase::Data);
    assert!(last.result.error_kind() == Some(ErrorKind::ConstraintViolation));
}

#[tokio::test]
async fn test_response_for_wrong_trace_is_schema_violation() {
    let rogue = TestProvider::new(ProviderDescriptor::new("arch-1", Role::ARCHITECT), Behavior::WrongTrace);
    let controller = memory_controller(&[rogue]);

    let trace_id = controller
        .start_cycle(Packet::new("analyse", ActionType::Analyze))
        .await
        .unwrap();
    let cycle = controller.await_settled(trace_id).await.unwrap();

    assert_eq!(cycle.status, CycleStatus::Failed);
    assert_eq!(cycle.hops[0].result.error_kind(), Some(ErrorKind::SchemaViolation));
    assert_eq!(cycle.trace_id, trace_id);
}

#[tokio::test]
async fn test_provider_error_fails_without_retry() {
    let broken = TestProvider::new(ProviderDescriptor::new("arch-1", Role::ARCHITECT), Behavior::Fail);
    let controller = memory_controller(&[broken.clone()]);

    let trace_id = controller
        .start_cycle(Packet::new("analyse", ActionType::Analyze))
        .await
        .unwrap();
    let cycle = controller.await_settled(trace_id).await.unwrap();

    assert_eq!(cycle.status, CycleStatus::Failed);
    assert_eq!(cycle.hops[0].result.error_kind(), Some(ErrorKind::ProviderError));
    assert_eq!(ResultCode::for_cycle(&cycle), Some(ResultCode::ProviderError));
    assert_eq!(broken.calls(), 1);
}

#[tokio::test]
async fn test_abort_during_dispatch_records_in_flight_hop() {
    let release = Arc::new(Notify::new());
    let held = TestProvider::new(
        ProviderDescriptor::new("arch-1", Role::ARCHITECT),
        Behavior::Hold(release.clone()),
    );
    let controller = memory_controller(&[held.clone()]);

    let trace_id = controller
        .start_cycle(Packet::new("analyse", ActionType::Analyze))
        .await
        .unwrap();
    wait_for_calls(&held, 1).await;

    controller.abort(trace_id).await.unwrap();
    release.notify_one();

    let cycle = controller.await_settled(trace_id).await.unwrap();
    assert_eq!(cycle.status, CycleStatus::Aborted);
    assert_eq!(ResultCode::for_cycle(&cycle), Some(ResultCode::OperatorAbort));
    assert_eq!(cycle.hops.len(), 1);
    assert_eq!(cycle.hops[0].phase, Phase::SynAck);
    assert_eq!(cycle.hops[0].result.error_kind(), Some(ErrorKind::OperatorAbort));
    assert_eq!(held.calls(), 1);
}

#[tokio::test]
async fn test_raw_packet_with_future_major_version_is_refused() {
    let controller = memory_controller(&[TestProvider::echo("arch-1", Role::ARCHITECT)]);
    let err = controller
        .start_cycle_raw(&serde_json::json!({
            "version": "2.0",
            "context": {"goal": "analyse"},
            "intent": {"action_type": "analyze"}
        }))
        .await
        .unwrap_err();

    assert_eq!(err.result_code(), Some(ResultCode::SchemaViolation));
    assert!(controller.ledger().list_cycles().await.unwrap().is_empty());
}
