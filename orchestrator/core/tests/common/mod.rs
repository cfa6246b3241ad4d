// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Shared fixtures for the handshake integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use handshake_core::application::controller::CycleController;
use handshake_core::application::router::CapabilityRouter;
use handshake_core::domain::cycle::{Cycle, CycleStatus, PendingReason};
use handshake_core::domain::ledger::CycleLedger;
use handshake_core::domain::packet::{Packet, TraceId};
use handshake_core::domain::provider::{CapabilityProvider, ProviderDescriptor, ProviderError};
use handshake_core::infrastructure::config::{ApprovalConfig, RouterConfig};
use handshake_core::infrastructure::event_bus::EventBus;
use handshake_core::infrastructure::ledger::InMemoryLedger;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// How a [`TestProvider`] answers.
pub enum Behavior {
    /// Return the request unchanged.
    Echo,
    /// Echo after sleeping.
    Delay(Duration),
    /// Echo once `release` is notified.
    Hold(Arc<Notify>),
    /// Echo with one extra policy token in `constraints.style`.
    AddStyle(String),
    /// Echo with an artifact reference attached.
    Artifact(String),
    /// Answer for a different trace.
    WrongTrace,
    /// Report a provider error.
    Fail,
    /// Report that the backend cannot be reached.
    Unreachable,
}

pub struct TestProvider {
    descriptor: ProviderDescriptor,
    behavior: Behavior,
    calls: AtomicU32,
}

impl TestProvider {
    pub fn new(descriptor: ProviderDescriptor, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            behavior,
            calls: AtomicU32::new(0),
        })
    }

    pub fn echo(id: &str, role: &str) -> Arc<Self> {
        Self::new(ProviderDescriptor::new(id, role), Behavior::Echo)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityProvider for TestProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn submit(&self, mut packet: Packet) -> Result<Packet, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Echo => {}
            Behavior::Delay(delay) => tokio::time::sleep(*delay).await,
            Behavior::Hold(release) => release.notified().await,
            Behavior::AddStyle(token) => {
                packet.constraints.style.insert(token.clone());
            }
            Behavior::Artifact(reference) => packet.artifacts.push(reference.clone()),
            Behavior::WrongTrace => packet.routing.trace_id = Some(TraceId::new()),
            Behavior::Fail => return Err(ProviderError::Internal("model crashed".into())),
            Behavior::Unreachable => return Err(ProviderError::Unavailable("connection refused".into())),
        }
        Ok(packet)
    }
}

pub fn fast_router_config() -> RouterConfig {
    RouterConfig {
        dispatch_timeout: Duration::from_secs(5),
        max_retries: 1,
        backoff_base: Duration::from_millis(1),
        ..RouterConfig::default()
    }
}

pub fn controller_with(
    ledger: Arc<dyn CycleLedger>,
    router_config: RouterConfig,
    providers: &[Arc<TestProvider>],
) -> CycleController {
    let router = Arc::new(CapabilityRouter::new(router_config));
    for provider in providers {
        router.register(provider.clone());
    }
    CycleController::new(ledger, router, EventBus::default(), ApprovalConfig::default())
}

pub fn memory_controller(providers: &[Arc<TestProvider>]) -> CycleController {
    controller_with(Arc::new(InMemoryLedger::new()), fast_router_config(), providers)
}

/// Grant every plain approval gate until the cycle ends or stops on
/// something an operator has to look at (a route or timeout suspension).
pub async fn run_with_approvals(controller: &CycleController, trace_id: TraceId) -> Cycle {
    loop {
        let cycle = controller
            .await_settled(trace_id)
            .await
            .expect("cycle should exist");
        match &cycle.pending {
            Some(pending)
                if cycle.status == CycleStatus::WaitingApproval
                    && pending.reason == PendingReason::ApprovalGate =>
            {
                controller
                    .approve(trace_id, pending.hop_index)
                    .await
                    .expect("approve pending gate");
            }
            _ => return cycle,
        }
    }
}

/// Poll until `provider` has been called at least `n` times.
pub async fn wait_for_calls(provider: &TestProvider, n: u32) {
    for _ in 0..500 {
        if provider.calls() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("provider was not called {} times", n);
}
