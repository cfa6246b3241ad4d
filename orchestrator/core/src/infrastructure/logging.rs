// Copyright (c) 2026 Sovereign Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::infrastructure::config::LoggingConfig;

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level. Fails if a subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}
