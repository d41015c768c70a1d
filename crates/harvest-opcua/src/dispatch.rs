// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Notification to measurement pipeline.
//!
//! [`ValueChangeDispatcher`] is the [`DataChangeListener`] attached to every
//! monitored item. Each invocation turns the queued values of one item into
//! measurements and forwards them as a single batch.
//!
//! Values whose item has no binding or whose value is not numeric are
//! dropped individually; the rest of the batch is still forwarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use harvest_core::{Measurement, MeasurementSink, ReceivedCounter};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::client::{DataChangeListener, DataValue};
use crate::error::OpcUaError;
use crate::subscription::MonitoredItem;
use crate::tags::TagBindingTable;

// =============================================================================
// MeasurementPipeline
// =============================================================================

/// Adapter-lifetime output side shared by every dispatcher.
///
/// Owns the sink, the received counter and the lock that keeps two batches
/// from interleaving at the sink.
pub struct MeasurementPipeline {
    sink: Arc<dyn MeasurementSink>,
    received: ReceivedCounter,
    dropped: AtomicU64,
    forward: Mutex<()>,
}

impl MeasurementPipeline {
    /// Creates a pipeline feeding `sink`.
    pub fn new(sink: Arc<dyn MeasurementSink>) -> Self {
        Self {
            sink,
            received: ReceivedCounter::new(),
            dropped: AtomicU64::new(0),
            forward: Mutex::new(()),
        }
    }

    /// Forwards a batch and counts it. Empty batches are not forwarded.
    pub fn forward(&self, batch: Vec<Measurement>) -> usize {
        let size = batch.len();
        if size == 0 {
            return 0;
        }
        let _guard = self.forward.lock();
        self.sink.publish(batch);
        self.received.add(size as u64);
        size
    }

    /// Total measurements forwarded.
    #[inline]
    pub fn received(&self) -> u64 {
        self.received.get()
    }

    /// Total values dropped.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_dropped(&self, n: usize) {
        if n > 0 {
            self.dropped.fetch_add(n as u64, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for MeasurementPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasurementPipeline")
            .field("received", &self.received())
            .field("dropped", &self.dropped())
            .finish()
    }
}

// =============================================================================
// DispatchOutcome
// =============================================================================

/// What happened to one notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Measurements forwarded in the batch.
    pub forwarded: usize,
    /// Values dropped because the item has no binding.
    pub unresolved: usize,
    /// Values dropped because they are not numeric.
    pub unconvertible: usize,
}

impl DispatchOutcome {
    /// Values dropped for any reason.
    #[inline]
    pub fn dropped(&self) -> usize {
        self.unresolved + self.unconvertible
    }
}

// =============================================================================
// ValueChangeDispatcher
// =============================================================================

/// Converts notifications into measurement batches.
#[derive(Debug, Clone)]
pub struct ValueChangeDispatcher {
    bindings: Arc<TagBindingTable>,
    pipeline: Arc<MeasurementPipeline>,
}

impl ValueChangeDispatcher {
    /// Creates a dispatcher for one connection attempt's bindings.
    pub fn new(bindings: Arc<TagBindingTable>, pipeline: Arc<MeasurementPipeline>) -> Self {
        Self { bindings, pipeline }
    }

    /// Handles all values queued for `item`, in arrival order.
    pub fn dispatch(&self, item: &MonitoredItem, values: Vec<DataValue>) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        let mut batch = Vec::with_capacity(values.len());
        let binding = self.bindings.resolve_canonical(&item.canonical_id);

        for value in values {
            let Some(binding) = binding else {
                warn!(key = %item.canonical_id, "OPC key {} not found.", item.canonical_id);
                outcome.unresolved += 1;
                continue;
            };

            let number = match value.value.to_f64() {
                Ok(number) => number,
                Err(e) => {
                    let error = OpcUaError::from(e);
                    warn!(
                        node_id = %item.node_id,
                        key = %binding.key,
                        error_code = %error.error_code(),
                        "Dropping value: {error}"
                    );
                    outcome.unconvertible += 1;
                    continue;
                }
            };

            batch.push(Measurement::normal(
                binding.key.clone(),
                number,
                measurement_time(item, &value),
            ));
        }

        self.pipeline.record_dropped(outcome.dropped());
        outcome.forwarded = self.pipeline.forward(batch);

        trace!(
            node_id = %item.node_id,
            forwarded = outcome.forwarded,
            dropped = outcome.dropped(),
            "Notification dispatched"
        );
        outcome
    }
}

impl DataChangeListener for ValueChangeDispatcher {
    fn on_data_change(&self, item: &MonitoredItem, values: Vec<DataValue>) {
        self.dispatch(item, values);
    }
}

/// Source time in UTC, falling back to the server time and then to now.
fn measurement_time(item: &MonitoredItem, value: &DataValue) -> DateTime<Utc> {
    if let Some(source) = value.source_timestamp {
        return source.with_timezone(&Utc);
    }
    if let Some(server) = value.server_timestamp {
        debug!(node_id = %item.node_id, "No source timestamp, using server timestamp");
        return server.with_timezone(&Utc);
    }
    debug!(node_id = %item.node_id, "No timestamps, using receive time");
    Utc::now()
}

// =============================================================================
// Tests
// =============================================================================
