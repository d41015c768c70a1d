// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Implementation of the `run` command.

use std::time::Duration;

use harvest_config::load_config;
use tracing::info;

use crate::cli::{Cli, RunArgs};
use crate::error::{BinError, BinResult};
use crate::logging::init_logging;
use crate::runtime::RuntimeBuilder;

/// Executes the `run` command.
///
/// Logging is configured from the file, so the file is loaded before
/// anything is logged.
pub async fn run(cli: &Cli, args: RunArgs) -> BinResult<()> {
    let config = load_config(&cli.config).map_err(|e| {
        BinError::from(e).with_context(format!("Failed to load {}", cli.config.display()))
    })?;

    init_logging(
        &cli.effective_log_level(config.logging.level),
        cli.effective_log_format(config.logging.format),
    )?;
    info!(config = %cli.config.display(), "Starting harvest");

    let mut builder = RuntimeBuilder::new().config(config);
    if let Some(secs) = args.status_interval {
        builder = builder.status_interval(Duration::from_secs(secs));
    }

    builder.build()?.run().await
}
