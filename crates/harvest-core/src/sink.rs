// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Downstream measurement sinks.
//!
//! A sink receives whole batches. Delivery is fire-and-forget: the adapter
//! never waits for an acknowledgment and a sink must not block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::Measurement;

// =============================================================================
// MeasurementSink
// =============================================================================

/// Receiver of measurement batches.
///
/// Implementations must treat a batch as one unit: consumers observe the
/// whole batch or none of it.
pub trait MeasurementSink: Send + Sync {
    /// Publishes a batch of measurements.
    fn publish(&self, batch: Vec<Measurement>);
}

impl<T: MeasurementSink + ?Sized> MeasurementSink for Arc<T> {
    fn publish(&self, batch: Vec<Measurement>) {
        (**self).publish(batch)
    }
}

// =============================================================================
// ChannelSink
// =============================================================================

/// Sink that forwards each batch as a single message on a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<Vec<Measurement>>,
    undelivered: Arc<AtomicU64>,
}

impl ChannelSink {
    /// Creates a sink and the receiver that drains it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<Measurement>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                undelivered: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    /// Number of measurements discarded because the receiver was gone.
    pub fn undelivered(&self) -> u64 {
        self.undelivered.load(Ordering::Relaxed)
    }
}

impl MeasurementSink for ChannelSink {
    fn publish(&self, batch: Vec<Measurement>) {
        let len = batch.len() as u64;
        if self.sender.send(batch).is_err() {
            self.undelivered.fetch_add(len, Ordering::Relaxed);
            warn!(count = len, "Measurement receiver closed, batch discarded");
        }
    }
}

// =============================================================================
// MemorySink
// =============================================================================

/// Sink that keeps every batch in memory, in publication order.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<Measurement>>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all batches received so far.
    pub fn batches(&self) -> Vec<Vec<Measurement>> {
        self.batches.lock().clone()
    }

    /// Returns all measurements received so far, flattened.
    pub fn measurements(&self) -> Vec<Measurement> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    /// Number of batches received.
    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    /// Total number of measurements received.
    pub fn len(&self) -> usize {
        self.batches.lock().iter().map(Vec::len).sum()
    }

    /// Returns `true` if nothing has been received.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns all batches.
    pub fn drain(&self) -> Vec<Vec<Measurement>> {
        std::mem::take(&mut *self.batches.lock())
    }
}

impl MeasurementSink for MemorySink {
    fn publish(&self, batch: Vec<Measurement>) {
        self.batches.lock().push(batch);
    }
}

// =============================================================================
// Tests
// =============================================================================
