// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod router;
pub mod controller;
pub mod telemetry;
pub mod export;

pub use controller::{CycleController, ControllerError};
pub use router::{CapabilityRouter, DispatchOutcome, RouteError};
pub use telemetry::{TelemetryError, TelemetryIngestAdapter};
