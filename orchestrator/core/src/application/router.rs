// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0

// Capability Router - Target Resolution and Bounded Dispatch
//
// Resolves which registered provider handles a packet and performs exactly
// one logical outbound call per dispatch, bounded by a per-attempt timeout
// with exponential backoff between attempts. The router never substitutes
// a different target when the requested one is missing.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::domain::cycle::{ErrorKind, Phase};
use crate::domain::packet::Packet;
use crate::domain::provider::{CapabilityProvider, ProviderDescriptor, ProviderError};
use crate::infrastructure::config::RouterConfig;

/// Result of a successful dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub provider: ProviderDescriptor,
    pub response: Packet,
    /// Wall time across all attempts, backoff included
    pub latency: Duration,
    pub attempts: u32,
}

pub struct CapabilityRouter {
    providers: RwLock<BTreeMap<String, Arc<dyn CapabilityProvider>>>,
    config: RouterConfig,
}

impl CapabilityRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            providers: RwLock::new(BTreeMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Register a provider. An existing registration with the same id is
    /// replaced.
    pub fn register(&self, provider: Arc<dyn CapabilityProvider>) {
        let descriptor = provider.descriptor().clone();
        let replaced = self
            .providers
            .write()
            .insert(descriptor.id.clone(), provider)
            .is_some();
        info!(
            provider = %descriptor.id,
            role = %descriptor.role,
            external = descriptor.external,
            replaced,
            "Registered capability provider"
        );
    }

    pub fn deregister(&self, id: &str) -> bool {
        let removed = self.providers.write().remove(id).is_some();
        if removed {
            info!(provider = %id, "Deregistered capability provider");
        }
        removed
    }

    /// Descriptors of every registered provider, ordered by id.
    pub fn providers(&self) -> Vec<ProviderDescriptor> {
        self.providers
            .read()
            .values()
            .map(|p| p.descriptor().clone())
            .collect()
    }

    /// Pick the provider that would handle `packet`, without calling it.
    ///
    /// 1. `routing.next_hop` naming a registered provider id
    /// 2. `routing.next_hop` naming a role: lowest id of that role accepting the action
    /// 3. no `next_hop`: the configured default role for the action type
    pub fn resolve(&self, packet: &Packet) -> Result<ProviderDescriptor, RouteError> {
        self.select(packet).map(|p| p.descriptor().clone())
    }

    fn select(&self, packet: &Packet) -> Result<Arc<dyn CapabilityProvider>, RouteError> {
        let action = packet.intent.action_type;
        let providers = self.providers.read();

        let target = match packet.routing.next_hop.as_deref() {
            Some(hop) => hop.to_string(),
            None => self
                .config
                .default_routes
                .get(&action)
                .cloned()
                .ok_or_else(|| RouteError::RouteUnavailable {
                    target: action.to_string(),
                    reason: "no default route for action type".to_string(),
                })?,
        };

        if let Some(provider) = providers.get(&target) {
            if !provider.descriptor().accepts.contains(&action) {
                return Err(RouteError::RouteUnavailable {
                    target,
                    reason: format!("provider does not accept '{}'", action),
                });
            }
            return Ok(provider.clone());
        }

        let of_role: Vec<&Arc<dyn CapabilityProvider>> = providers
            .values()
            .filter(|p| p.descriptor().role == target)
            .collect();
        if of_role.is_empty() {
            return Err(RouteError::RouteUnavailable {
                target,
                reason: "no provider registered for this id or role".to_string(),
            });
        }
        match of_role.into_iter().find(|p| p.descriptor().accepts.contains(&action)) {
            Some(provider) => Ok(provider.clone()),
            None => Err(RouteError::RouteUnavailable {
                target,
                reason: format!("no provider of this role accepts '{}'", action),
            }),
        }
    }

    /// Hand `packet` to its resolved provider. Only timeouts are retried. A
    /// provider reporting itself unreachable is `RouteUnavailable`; any other
    /// provider-reported error ends the dispatch as `ProviderFailed`.
    pub async fn dispatch(&self, packet: &Packet, phase: Phase) -> Result<DispatchOutcome, RouteError> {
        let provider = self.select(packet)?;
        let descriptor = provider.descriptor().clone();
        let started = Instant::now();
        let total_attempts = self.config.max_retries.saturating_add(1);

        for attempt in 0..total_attempts {
            debug!(
                provider = %descriptor.id,
                phase = %phase,
                attempt = attempt + 1,
                "Dispatching packet"
            );

            match tokio::time::timeout(self.config.dispatch_timeout, provider.submit(packet.clone())).await {
                Ok(Ok(response)) => {
                    metrics::counter!("handshake_dispatch_total", "outcome" => "ok").increment(1);
                    return Ok(DispatchOutcome {
                        provider: descriptor,
                        response,
                        latency: started.elapsed(),
                        attempts: attempt + 1,
                    });
                }
                Ok(Err(ProviderError::Unavailable(reason))) => {
                    // Unreachable is a routing outcome: the operator re-routes.
                    warn!(provider = %descriptor.id, phase = %phase, %reason, "Provider unreachable");
                    metrics::counter!("handshake_dispatch_total", "outcome" => "unreachable").increment(1);
                    return Err(RouteError::RouteUnavailable {
                        target: descriptor.id,
                        reason: format!("provider unreachable: {}", reason),
                    });
                }
                Ok(Err(e)) => {
                    warn!(provider = %descriptor.id, phase = %phase, error = %e, "Provider returned an error");
                    metrics::counter!("handshake_dispatch_total", "outcome" => "error").increment(1);
                    return Err(RouteError::ProviderFailed {
                        provider_id: descriptor.id,
                        source: e,
                    });
                }
                Err(_) => {
                    warn!(
                        provider = %descriptor.id,
                        phase = %phase,
                        "Dispatch timed out (attempt {}/{})",
                        attempt + 1,
                        total_attempts
                    );
                    if attempt + 1 < total_attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        metrics::counter!("handshake_dispatch_total", "outcome" => "timeout").increment(1);
        Err(RouteError::ProviderTimeout {
            provider_id: descriptor.id,
            attempts: total_attempts,
            timeout: self.config.dispatch_timeout,
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config
            .backoff_base
            .saturating_mul(2_u32.saturating_pow(attempt))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("No route to '{target}': {reason}")]
    RouteUnavailable { target: String, reason: String },

    #[error("Provider '{provider_id}' timed out after {attempts} attempts of {timeout:?}")]
    ProviderTimeout {
        provider_id: String,
        attempts: u32,
        timeout: Duration,
    },

    #[error("Provider '{provider_id}' failed: {source}")]
    ProviderFailed {
        provider_id: String,
        #[source]
        source: ProviderError,
    },
}

impl RouteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouteError::RouteUnavailable { .. } => ErrorKind::RouteUnavailable,
            RouteError::ProviderTimeout { .. } => ErrorKind::ProviderTimeout,
            RouteError::ProviderFailed { .. } => ErrorKind::ProviderError,
        }
    }

    pub fn provider_id(&self) -> Option<&str> {
        match self {
            RouteError::RouteUnavailable { .. } => None,
            RouteError::ProviderTimeout { provider_id, .. }
            | RouteError::ProviderFailed { provider_id, .. } => Some(provider_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::packet::{ActionType, Role};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Echo {
        descriptor: ProviderDescriptor,
        calls: AtomicU32,
        delay: Duration,
    }

    impl Echo {
        fn new(descriptor: ProviderDescriptor) -> Arc<Self> {
            Self::slow(descriptor, Duration::ZERO)
        }

        fn slow(descriptor: ProviderDescriptor, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                descriptor,
                calls: AtomicU32::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl CapabilityProvider for Echo {
        fn descriptor(&self) -> &ProviderDescriptor {
            &self.descriptor
        }

        async fn submit(&self, packet: Packet) -> Result<Packet, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(packet)
        }
    }

    struct Offline(ProviderDescriptor, AtomicU32);

    #[async_trait]
    impl CapabilityProvider for Offline {
        fn descriptor(&self) -> &ProviderDescriptor {
            &self.0
        }

        async fn submit(&self, _packet: Packet) -> Result<Packet, ProviderError> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::Unavailable("connection refused".into()))
        }
    }

    fn router() -> CapabilityRouter {
        CapabilityRouter::new(RouterConfig {
            dispatch_timeout: Duration::from_millis(50),
            max_retries: 2,
            backoff_base: Duration::from_millis(1),
            ..RouterConfig::default()
        })
    }

    #[test]
    fn test_resolve_prefers_explicit_id_then_role() {
        let router = router();
        router.register(Echo::new(ProviderDescriptor::new("exec-b", Role::EXECUTOR)));
        router.register(Echo::new(ProviderDescriptor::new("exec-a", Role::EXECUTOR)));
        router.register(Echo::new(ProviderDescriptor::new("arch", Role::ARCHITECT)));

        let mut packet = Packet::new("goal", ActionType::Generate);
        assert_eq!(router.resolve(&packet).unwrap().id, "exec-a");

        packet.routing.next_hop = Some("exec-b".into());
        assert_eq!(router.resolve(&packet).unwrap().id, "exec-b");

        packet.routing.next_hop = Some(Role::ARCHITECT.into());
        assert_eq!(router.resolve(&packet).unwrap().id, "arch");
    }

    #[test]
    fn test_no_silent_substitution() {
        let router = router();
        router.register(Echo::new(
            ProviderDescriptor::new("arch", Role::ARCHITECT).accepting([ActionType::Review]),
        ));

        let mut packet = Packet::new("goal", ActionType::Generate);
        packet.routing.next_hop = Some("missing".into());
        assert!(matches!(router.resolve(&packet), Err(RouteError::RouteUnavailable { .. })));

        packet.routing.next_hop = Some("arch".into());
        let err = router.resolve(&packet).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RouteUnavailable);
    }

    #[tokio::test]
    async fn test_dispatch_retries_then_times_out() {
        let router = router();
        let slow = Echo::slow(ProviderDescriptor::new("slow", Role::EXECUTOR), Duration::from_secs(5));
        router.register(slow.clone());

        let packet = Packet::new("goal", ActionType::Transform);
        let err = router.dispatch(&packet, Phase::Data).await.unwrap_err();
        assert!(matches!(err, RouteError::ProviderTimeout { attempts: 3, .. }));
        assert_eq!(err.provider_id(), Some("slow"));
        assert_eq!(slow.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dispatch_success_and_deregister() {
        let router = router();
        router.register(Echo::new(ProviderDescriptor::new("arch", Role::ARCHITECT)));
        let packet = Packet::new("goal", ActionType::Analyze);

        let outcome = router.dispatch(&packet, Phase::SynAck).await.unwrap();
        assert_eq!(outcome.provider.id, "arch");
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.response, packet);

        assert!(router.deregister("arch"));
        assert!(router.providers().is_empty());
        assert!(matches!(
            router.dispatch(&packet, Phase::SynAck).await,
            Err(RouteError::RouteUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_route_unavailable() {
        let router = router();
        let offline = Arc::new(Offline(ProviderDescriptor::new("exec", Role::EXECUTOR), AtomicU32::new(0)));
        router.register(offline.clone());

        let packet = Packet::new("goal", ActionType::Transform);
        let err = router.dispatch(&packet, Phase::SynAck).await.unwrap_err();
        assert!(matches!(&err, RouteError::RouteUnavailable { target, .. } if target == "exec"));
        assert_eq!(err.kind(), ErrorKind::RouteUnavailable);
        assert_eq!(offline.1.load(Ordering::SeqCst), 1);
    }
}
