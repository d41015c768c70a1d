// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # harvest-config
//!
//! Configuration management for the harvest data collector.
//!
//! ## Features
//!
//! - **Multi-Format Support**: YAML, TOML, and JSON configuration files
//! - **Placeholders**: `${VAR}` and `${VAR:default}` resolved before parsing
//! - **Environment Overrides**: `HARVEST_CONNECTION_STRING`,
//!   `HARVEST_AUTO_ACCEPT` and `HARVEST_LOG_LEVEL`
//! - **Validation**: adapter settings and tag bindings are checked on load
//!
//! ## Quick Start
//!
//! ```no_run
//! use harvest_config::loader::load_config;
//!
//! let config = load_config("harvest.yaml").unwrap();
//!
//! println!("Device: {}", config.adapter.name);
//! println!("Measurements: {}", config.measurements.len());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

// =============================================================================
// Modules
// =============================================================================

pub mod error;
pub mod loader;
pub mod schema;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_config, load_config_str, ConfigFormat, ConfigLoader, EnvLookup};
pub use schema::{HarvestConfig, LogFormat, LogLevel, LoggingConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
