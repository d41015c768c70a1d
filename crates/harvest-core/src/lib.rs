// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # harvest-core
//!
//! Host-side measurement model for the harvest data collector.
//!
//! Protocol adapters produce [`Measurement`] records and hand them to a
//! [`MeasurementSink`] one batch at a time. The collecting system polls the
//! adapter's [`ReceivedCounter`] and short status string.
//!
//! ```text
//! adapter ──(Vec<Measurement>)──▶ MeasurementSink ──▶ time-series pipeline
//!    │
//!    └── ReceivedCounter ──▶ statistics / status polling
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod sink;
pub mod stats;
pub mod types;

pub use sink::{ChannelSink, MeasurementSink, MemorySink};
pub use stats::{short_status, ReceivedCounter};
pub use types::{Measurement, MeasurementKey, MeasurementQuality};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
