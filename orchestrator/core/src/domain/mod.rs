// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Pure handshake types and the ports the application layer drives.

pub mod packet;
pub mod constraint;
pub mod cycle;
pub mod provider;
pub mod ledger;
pub mod events;
