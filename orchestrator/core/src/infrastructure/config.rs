// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0

// Handshake Configuration Manifest
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) for a handshake
// engine instance:
// - Router timeouts, retries and the default action -> role table
// - Extra approval gates
// - Ledger backend selection
// - Event bus sizing and logging

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::cycle::Phase;
use crate::domain::packet::{ActionType, Role};

pub const API_VERSION: &str = "swarm-handshake/v1";
pub const KIND: &str = "HandshakeConfig";

/// Top-level handshake configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfigManifest {
    /// API version (must be "swarm-handshake/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "HandshakeConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: HandshakeConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Instance name, used in log output
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandshakeConfigSpec {
    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub approval: ApprovalConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Upper bound on one provider call
    #[serde(default = "default_dispatch_timeout", with = "humantime_serde")]
    pub dispatch_timeout: Duration,

    /// Retries after the first timed-out attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before retry n is `backoff_base * 2^n`
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Role used when a packet names no `next_hop`
    #[serde(default = "default_routes")]
    pub default_routes: BTreeMap<ActionType, String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: default_dispatch_timeout(),
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            default_routes: default_routes(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Phases gated in addition to DATA (always) and NEW_STATE (when
    /// `human-approval-required` is in force)
    #[serde(default)]
    pub gated_phases: Vec<Phase>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Memory,
    Sled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackend,

    /// Database directory for the sled backend
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::default(),
            path: default_ledger_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive (e.g. "info", "handshake_core=debug")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_dispatch_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(500)
}

fn default_routes() -> BTreeMap<ActionType, String> {
    BTreeMap::from([
        (ActionType::Analyze, Role::ARCHITECT.to_string()),
        (ActionType::Generate, Role::EXECUTOR.to_string()),
        (ActionType::Transform, Role::EXECUTOR.to_string()),
        (ActionType::Review, Role::ARCHITECT.to_string()),
    ])
}

fn default_ledger_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("swarm-handshake")
        .join("ledger")
}

fn default_event_capacity() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for HandshakeConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "swarm-handshake".to_string(),
                labels: None,
            },
            spec: HandshakeConfigSpec::default(),
        }
    }
}

impl HandshakeConfigManifest {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Discover configuration file using precedence order
    /// 1. SWARM_HANDSHAKE_CONFIG environment variable
    /// 2. ./handshake-config.yaml (working directory)
    /// 3. ~/.swarm-handshake/config.yaml (user home)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("SWARM_HANDSHAKE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./handshake-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        dirs::home_dir()
            .map(|home| home.join(".swarm-handshake").join("config.yaml"))
            .filter(|p| p.exists())
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(explicit: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = if let Some(path) = explicit {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?
        } else if let Some(path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", path);
            Self::from_yaml_file(path)?
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SWARM_HANDSHAKE_DISPATCH_TIMEOUT") {
            match humantime_serde::re::humantime::parse_duration(&val) {
                Ok(timeout) => {
                    tracing::info!("Environment override: SWARM_HANDSHAKE_DISPATCH_TIMEOUT={}", val);
                    self.spec.router.dispatch_timeout = timeout;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for SWARM_HANDSHAKE_DISPATCH_TIMEOUT: '{}'. Expected a duration like '30s'. Ignoring.",
                    val
                ),
            }
        }

        if let Ok(val) = std::env::var("SWARM_HANDSHAKE_MAX_RETRIES") {
            match val.parse::<u32>() {
                Ok(retries) => {
                    tracing::info!("Environment override: SWARM_HANDSHAKE_MAX_RETRIES={}", retries);
                    self.spec.router.max_retries = retries;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for SWARM_HANDSHAKE_MAX_RETRIES: '{}'. Ignoring.",
                    val
                ),
            }
        }

        if let Ok(val) = std::env::var("SWARM_HANDSHAKE_LEDGER_PATH") {
            tracing::info!("Environment override: SWARM_HANDSHAKE_LEDGER_PATH={}", val);
            self.spec.ledger.backend = LedgerBackend::Sled;
            self.spec.ledger.path = PathBuf::from(val);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.router.dispatch_timeout.is_zero() {
            anyhow::bail!("spec.router.dispatch_timeout must be greater than zero");
        }

        for (action, role) in &self.spec.router.default_routes {
            if role.trim().is_empty() {
                anyhow::bail!("spec.router.default_routes.{} cannot be empty", action);
            }
        }

        for phase in &self.spec.approval.gated_phases {
            if matches!(phase, Phase::Init | Phase::Syn) || phase.is_terminal() {
                anyhow::bail!("spec.approval.gated_phases: {} cannot be gated", phase);
            }
        }

        if self.spec.events.capacity == 0 {
            anyhow::bail!("spec.events.capacity must be greater than zero");
        }

        if !matches!(self.spec.observability.logging.format.as_str(), "json" | "text") {
            anyhow::bail!(
                "spec.observability.logging.format must be 'json' or 'text', got '{}'",
                self.spec.observability.logging.format
            );
        }

        Ok(())
    }
}
