// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Swarm Handshake Core
//!
//! A human-mediated, auditable engine that coordinates heterogeneous
//! capability providers through a fixed seven-phase handshake. Every hop is
//! recorded in an append-only, hash-chained ledger; steps that mutate
//! external state wait for the operator.
//!
//! # Architecture
//!
//! - **domain** - packets, constraints, cycles, the provider and ledger ports
//! - **application** - router, cycle controller, telemetry ingest, log export
//! - **infrastructure** - configuration, logging, event bus, ledger backends

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use application::controller::{CycleController, ControllerError};
pub use application::router::{CapabilityRouter, RouteError};
pub use domain::cycle::{Cycle, CycleStatus, Phase, ResultCode};
pub use domain::packet::{ActionType, Packet, PacketValidator, Role, TraceId};
pub use domain::provider::{CapabilityProvider, ProviderDescriptor, ProviderError};
