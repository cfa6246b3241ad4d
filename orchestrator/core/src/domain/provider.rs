// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Capability Provider Domain Interface (Anti-Corruption Layer)
//!
//! A provider is any backend that fulfils a role: a hosted model, a local
//! model, a script runner. Vendor semantics stay behind this trait; the engine
//! only sees packets going in and packets coming out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::domain::packet::{ActionType, Packet};

/// Registration data for a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Unique provider id (e.g. "claude-executor", "local-llama")
    pub id: String,

    /// Role fulfilled (e.g. "architect", "executor", "automation")
    pub role: String,

    /// Action types this provider accepts
    pub accepts: BTreeSet<ActionType>,

    /// Whether calls leave the host (hosted vendor APIs)
    #[serde(default)]
    pub external: bool,
}

impl ProviderDescriptor {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            accepts: ActionType::ALL.into_iter().collect(),
            external: false,
        }
    }

    pub fn accepting(mut self, actions: impl IntoIterator<Item = ActionType>) -> Self {
        self.accepts = actions.into_iter().collect();
        self
    }

    pub fn external(mut self, external: bool) -> Self {
        self.external = external;
        self
    }
}

#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Handle one packet and return the response packet. The response must
    /// keep the request's `trace_id` and `cycle_id`.
    async fn submit(&self, packet: Packet) -> Result<Packet, ProviderError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider rejected packet: {0}")]
    Rejected(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Provider internal error: {0}")]
    Internal(String),
}
