// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod config;
pub mod logging;
pub mod event_bus;
pub mod ledger;

pub use config::HandshakeConfigManifest;
pub use event_bus::EventBus;
