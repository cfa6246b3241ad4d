// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Cycle Ledger Implementations
//!
//! Infrastructure implementations of [`crate::domain::ledger::CycleLedger`].
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist cycles and their append-only hop records
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **InMemoryLedger** - lock-protected maps; lost on restart
//! - **SledLedger** - embedded sled database; survives restarts, so a cycle
//!   parked in `WAITING_APPROVAL` can be approved by a later process

pub mod memory;
pub mod sled_store;

pub use self::memory::InMemoryLedger;
pub use self::sled_store::SledLedger;

use std::sync::Arc;

use crate::domain::ledger::{CycleLedger, LedgerError};
use crate::infrastructure::config::{LedgerBackend, LedgerConfig};

/// Build the ledger selected by configuration.
pub fn from_config(config: &LedgerConfig) -> Result<Arc<dyn CycleLedger>, LedgerError> {
    match config.backend {
        LedgerBackend::Memory => Ok(Arc::new(InMemoryLedger::new())),
        LedgerBackend::Sled => Ok(Arc::new(SledLedger::open(&config.path)?)),
    }
}
