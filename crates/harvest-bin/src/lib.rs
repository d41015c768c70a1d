// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # harvest-bin
//!
//! CLI binary for the harvest OPC UA data collector.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────┐
//!                    │   main.rs   │
//!                    └──────┬──────┘
//!                    ┌──────▼──────┐
//!                    │   cli.rs    │
//!                    └──────┬──────┘
//!               ┌───────────┼───────────┐
//!               ▼           ▼           ▼
//!        ┌──────────┐ ┌──────────┐ ┌──────────┐
//!        │ commands │ │ runtime  │ │ logging  │
//!        └──────────┘ └────┬─────┘ └──────────┘
//!                    ┌─────▼──────┐
//!                    │  shutdown  │
//!                    └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Start collecting (default command)
//! harvest -c /etc/harvest/harvest.yaml
//!
//! # Validate configuration
//! harvest validate --format json --strict
//!
//! # Show version
//! harvest version
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

// =============================================================================
// Modules
// =============================================================================

pub mod cli;
pub mod commands;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod shutdown;

// =============================================================================
// Re-exports
// =============================================================================

pub use cli::{Cli, Commands};
pub use error::{BinError, BinResult};
pub use logging::init_logging;
pub use runtime::{CollectorRuntime, RuntimeBuilder};
pub use shutdown::{ShutdownCoordinator, ShutdownGuard};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
