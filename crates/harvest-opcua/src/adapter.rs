// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Host-facing adapter.
//!
//! [`OpcUaAdapter`] is what the collecting system holds: it is initialized
//! once, driven by [`OpcUaAdapter::run`] until cancelled, and polled for
//! status and the received-measurement count.

use std::fmt;
use std::sync::Arc;

use harvest_core::MeasurementSink;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::OpcUaTransport;
use crate::config::AdapterConfig;
use crate::connection::{ConnectionManager, ConnectionPhase};
use crate::error::OpcUaResult;
use crate::supervisor::{ReconnectStats, SupervisorState};
use crate::tags::{TagBinding, TagBindingTable};

// =============================================================================
// AdapterStatus
// =============================================================================

/// Point-in-time view of the adapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterStatus {
    /// Device name.
    pub name: String,
    /// Connection lifecycle phase.
    #[serde(serialize_with = "display")]
    pub connection: ConnectionPhase,
    /// Reconnect state machine state.
    #[serde(serialize_with = "display")]
    pub supervisor: SupervisorState,
    /// Endpoint URL of the active session.
    pub endpoint: Option<String>,
    /// Monitored items on the active subscription.
    pub monitored_items: usize,
    /// Measurements forwarded to the sink.
    pub received: u64,
    /// Values dropped before reaching the sink.
    pub dropped: u64,
    /// Reconnect counters of the current connection.
    #[serde(skip)]
    pub reconnects: ReconnectStats,
}

fn display<T: fmt::Display, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

impl fmt::Display for AdapterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}) items={} received={} dropped={}",
            self.name,
            self.connection,
            self.supervisor,
            self.monitored_items,
            self.received,
            self.dropped
        )
    }
}

// =============================================================================
// OpcUaAdapter
// =============================================================================

/// OPC UA acquisition adapter.
pub struct OpcUaAdapter {
    manager: ConnectionManager,
    linked_tags: usize,
}

impl OpcUaAdapter {
    /// Validates the configuration, checks the application identity and
    /// prepares the adapter. Nothing touches the network here.
    pub fn initialize(
        config: AdapterConfig,
        bindings: Vec<TagBinding>,
        transport: Arc<dyn OpcUaTransport>,
        sink: Arc<dyn MeasurementSink>,
    ) -> OpcUaResult<Self> {
        info!("Initialising OPC for device {}", config.name);
        config.validate()?;

        if let Err(e) = config.application.check() {
            error!(
                certificate = %config.application.certificate_path.display(),
                "Application instance certificate invalid!"
            );
            return Err(e.into());
        }

        let linked_tags = TagBindingTable::build(&bindings).len();
        info!("OPC Initialised ({})", config.connection_string);

        Ok(Self {
            manager: ConnectionManager::new(config, bindings, transport, sink),
            linked_tags,
        })
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.manager.config().name
    }

    /// Number of distinct tag bindings.
    pub fn linked_tags(&self) -> usize {
        self.linked_tags
    }

    /// Connection manager, for observing the session.
    pub fn connection(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Runs one connection attempt.
    pub async fn attempt_connection(&self) -> OpcUaResult<()> {
        self.manager.connect().await.map(|_| ())
    }

    /// Closes the subscription and session.
    pub async fn attempt_disconnection(&self) {
        self.manager.disconnect().await;
    }

    /// Connects and keeps the adapter connected until `cancel` fires.
    ///
    /// Recoverable failures are retried according to the configured retry
    /// policy. A fatal error, or running out of attempts, ends the loop with
    /// that error. Once connected, session loss is handled by the reconnect
    /// supervisor.
    pub async fn run(&self, cancel: CancellationToken) -> OpcUaResult<()> {
        let policy = self.manager.config().retry.clone();
        let mut failures: u32 = 0;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.attempt_connection() => result,
            };

            match result {
                Ok(()) => {
                    cancel.cancelled().await;
                    break;
                }
                Err(e) if e.is_fatal() => {
                    e.log("connect");
                    self.attempt_disconnection().await;
                    return Err(e);
                }
                Err(e) => {
                    e.log("connect");
                    failures = failures.saturating_add(1);
                    if !policy.allows(failures) {
                        warn!(attempts = failures, "Giving up on connection");
                        self.attempt_disconnection().await;
                        return Err(e);
                    }
                    let delay = policy.delay_for_attempt(failures - 1);
                    info!(attempt = failures, delay = ?delay, "Retrying connection");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.attempt_disconnection().await;
        info!(device = %self.name(), "Adapter stopped");
        Ok(())
    }

    /// Total measurements forwarded to the sink.
    pub fn received_count(&self) -> u64 {
        self.manager.pipeline().received()
    }

    /// One-line status for the host, `max_len` characters wide.
    pub fn short_status(&self, max_len: usize) -> String {
        harvest_core::short_status(self.received_count(), max_len)
    }

    /// Current status.
    pub fn status(&self) -> AdapterStatus {
        AdapterStatus {
            name: self.name().to_string(),
            connection: self.manager.phase(),
            supervisor: self.manager.supervisor_state(),
            endpoint: self.manager.endpoint().map(|e| e.url),
            monitored_items: self.manager.monitored_items(),
            received: self.received_count(),
            dropped: self.manager.pipeline().dropped(),
            reconnects: self.manager.reconnect_stats(),
        }
    }
}

impl fmt::Debug for OpcUaAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpcUaAdapter")
            .field("name", &self.name())
            .field("linked_tags", &self.linked_tags)
            .field("manager", &self.manager)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::ApplicationIdentity;
    use crate::client::mock::{test_identity, MockTransport, MockTree};
    use crate::client::{DataValue, OpcUaValue};
    use crate::config::RetryPolicy;
    use crate::error::{CertificateError, OpcUaError};
    use crate::types::{NodeClass, NodeId};
    use chrono::{FixedOffset, TimeZone};
    use harvest_core::MemorySink;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn tree() -> MockTree {
        let mut tree = MockTree::default();
        let device = tree.add(
            &NodeId::OBJECTS_FOLDER,
            NodeId::string(2, "Device1"),
            "Device1",
            NodeClass::Object,
        );
        tree.add(&device, NodeId::string(2, "Temp1"), "Temp1", NodeClass::Variable);
        tree
    }

    fn config(identity: ApplicationIdentity) -> AdapterConfig {
        AdapterConfig::builder()
            .name("Boiler")
            .connection_string("opc.tcp://boiler:4840")
            .application(identity)
            .retry(RetryPolicy::fixed(Duration::from_millis(10)))
            .build()
            .unwrap()
    }

    fn bindings() -> Vec<TagBinding> {
        vec![TagBinding::new("DEVICE1:TEMP1", "NS=2;S=Temp1")]
    }

    async fn until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_initialize_rejects_missing_certificate() {
        let transport = MockTransport::new(tree());
        let identity = ApplicationIdentity::new("/nonexistent/cert.der", "/nonexistent/key.pem");

        let err = OpcUaAdapter::initialize(
            config(identity),
            bindings(),
            transport.clone(),
            Arc::new(MemorySink::new()),
        )
        .unwrap_err();

        assert!(matches!(err, OpcUaError::Certificate(CertificateError::Missing { .. })));
        assert!(err.is_fatal());
        assert_eq!(transport.discover_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_initialize_and_status() {
        let (_dir, identity) = test_identity();
        let adapter = OpcUaAdapter::initialize(
            config(identity),
            bindings(),
            MockTransport::new(tree()),
            Arc::new(MemorySink::new()),
        )
        .unwrap();

        assert_eq!(adapter.name(), "Boiler");
        assert_eq!(adapter.linked_tags(), 1);
        let status = adapter.status();
        assert_eq!(status.connection, ConnectionPhase::Disconnected);
        assert_eq!(status.supervisor, SupervisorState::Closed);
        assert_eq!(status.received, 0);
        assert_eq!(adapter.short_status(25), "Total sent measurements 0");
        assert_eq!(adapter.short_status(29), "  Total sent measurements 0  ");
    }

    #[tokio::test]
    async fn test_notifications_reach_sink() {
        let (_dir, identity) = test_identity();
        let transport = MockTransport::new(tree());
        let sink = Arc::new(MemorySink::new());
        let adapter =
            OpcUaAdapter::initialize(config(identity), bindings(), transport.clone(), sink.clone())
                .unwrap();

        adapter.attempt_connection().await.unwrap();
        let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();
        let source = tokyo.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        transport.session(0).push(
            &NodeId::string(2, "Temp1"),
            vec![
                DataValue::new(OpcUaValue::Double(71.5), source),
                DataValue::new(OpcUaValue::String("n/a".into()), source),
            ],
        );

        assert_eq!(adapter.received_count(), 1);
        let measurements = sink.measurements();
        assert_eq!(measurements[0].key.as_str(), "DEVICE1:TEMP1");
        assert_eq!(measurements[0].timestamp, source.with_timezone(&chrono::Utc));

        let status = adapter.status();
        assert_eq!(status.connection, ConnectionPhase::Connected);
        assert_eq!(status.monitored_items, 1);
        assert_eq!(status.dropped, 1);
        assert_eq!(status.endpoint.as_deref(), Some("opc.tcp://boiler:4840"));

        adapter.attempt_disconnection().await;
        assert_eq!(adapter.status().connection, ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_run_retries_until_connected() {
        let (_dir, identity) = test_identity();
        let transport = MockTransport::new(tree());
        transport.fail_sessions.store(true, Ordering::SeqCst);
        let adapter = Arc::new(
            OpcUaAdapter::initialize(
                config(identity),
                bindings(),
                transport.clone(),
                Arc::new(MemorySink::new()),
            )
            .unwrap(),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let adapter = adapter.clone();
            let cancel = cancel.clone();
            async move { adapter.run(cancel).await }
        });

        until(|| transport.requests.lock().len() >= 2).await;
        transport.fail_sessions.store(false, Ordering::SeqCst);
        until(|| adapter.status().connection.is_connected()).await;

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(adapter.status().connection, ConnectionPhase::Disconnected);
        let last = transport.sessions.lock().last().cloned().unwrap();
        assert!(last.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_gives_up_after_max_attempts() {
        let (_dir, identity) = test_identity();
        let transport = MockTransport::new(tree());
        transport.fail_sessions.store(true, Ordering::SeqCst);
        let mut config = config(identity);
        config.retry = RetryPolicy::fixed(Duration::from_millis(1)).with_max_attempts(2);
        let sink = Arc::new(MemorySink::new());
        let adapter =
            OpcUaAdapter::initialize(config, bindings(), transport.clone(), sink).unwrap();

        let err = adapter.run(CancellationToken::new()).await.unwrap_err();

        assert!(!err.is_fatal());
        assert_eq!(transport.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_fatal_error() {
        let (dir, identity) = test_identity();
        let transport = MockTransport::new(tree());
        let adapter = OpcUaAdapter::initialize(
            config(identity),
            bindings(),
            transport.clone(),
            Arc::new(MemorySink::new()),
        )
        .unwrap();
        drop(dir);

        let err = adapter.run(CancellationToken::new()).await.unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(transport.discover_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_returns_when_cancelled_before_connecting() {
        let (_dir, identity) = test_identity();
        let adapter = OpcUaAdapter::initialize(
            config(identity),
            bindings(),
            MockTransport::new(tree()),
            Arc::new(MemorySink::new()),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        adapter.run(cancel).await.unwrap();
        assert_eq!(adapter.status().connection, ConnectionPhase::Disconnected);
    }
}
