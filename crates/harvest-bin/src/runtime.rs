// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Collector runtime orchestration.
//!
//! - Adapter initialization from the loaded configuration
//! - Draining the measurement channel
//! - Periodic status lines
//! - Graceful shutdown coordination

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use harvest_config::{load_config, HarvestConfig};
use harvest_core::{ChannelSink, Measurement};
use harvest_opcua::{OpcUaAdapter, OpcUaTransport};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info};

use crate::error::{BinError, BinResult};
use crate::shutdown::ShutdownCoordinator;

/// Width of the status line.
pub const STATUS_WIDTH: usize = 80;

// =============================================================================
// CollectorRuntime
// =============================================================================

/// Runs one adapter until shutdown is signaled or the adapter gives up.
pub struct CollectorRuntime {
    config: HarvestConfig,
    transport: Arc<dyn OpcUaTransport>,
    shutdown: ShutdownCoordinator,
}

impl CollectorRuntime {
    /// Creates a runtime.
    pub fn new(config: HarvestConfig, transport: Arc<dyn OpcUaTransport>) -> Self {
        Self {
            config,
            transport,
            shutdown: ShutdownCoordinator::new(),
        }
    }

    /// Returns the shutdown coordinator.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Runs until an OS signal, a manual shutdown, or a fatal adapter error.
    pub async fn run(self) -> BinResult<()> {
        info!("Starting harvest v{}", harvest_core::VERSION);

        let (sink, mut measurements) = ChannelSink::new();
        let adapter = Arc::new(OpcUaAdapter::initialize(
            self.config.adapter.clone(),
            self.config.bindings(),
            self.transport.clone(),
            Arc::new(sink),
        )?);
        info!(
            device = %adapter.name(),
            tags = adapter.linked_tags(),
            transport = %self.transport.display_name(),
            "Adapter ready"
        );

        let signals = tokio::spawn({
            let shutdown = self.shutdown.clone();
            async move { shutdown.wait_for_shutdown().await }
        });

        let mut adapter_task = tokio::spawn({
            let adapter = adapter.clone();
            let cancel = self.shutdown.token();
            async move { adapter.run(cancel).await }
        });

        let mut status = tokio::time::interval(self.config.status_interval);
        status.tick().await;

        let joined = loop {
            tokio::select! {
                joined = &mut adapter_task => break joined,
                Some(batch) = measurements.recv() => log_batch(&batch),
                _ = status.tick() => log_status(&adapter),
            }
        };

        signals.abort();
        drain(&mut measurements);
        log_status(&adapter);

        match joined {
            Ok(Ok(())) => {
                info!("harvest shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Adapter stopped");
                Err(e.into())
            }
            Err(e) => Err(BinError::runtime(format!("Adapter task failed: {e}"))),
        }
    }
}

fn log_batch(batch: &[Measurement]) {
    for measurement in batch {
        debug!(
            key = %measurement.key,
            value = measurement.value,
            timestamp = %measurement.timestamp,
            quality = %measurement.quality,
            "Measurement"
        );
    }
}

fn log_status(adapter: &OpcUaAdapter) {
    let status = adapter.status();
    info!(
        connection = %status.connection,
        supervisor = %status.supervisor,
        monitored_items = status.monitored_items,
        dropped = status.dropped,
        "{}",
        adapter.short_status(STATUS_WIDTH).trim()
    );
}

fn drain(measurements: &mut UnboundedReceiver<Vec<Measurement>>) {
    while let Ok(batch) = measurements.try_recv() {
        log_batch(&batch);
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for constructing the collector runtime.
#[derive(Default)]
pub struct RuntimeBuilder {
    config_path: Option<PathBuf>,
    config: Option<HarvestConfig>,
    transport: Option<Arc<dyn OpcUaTransport>>,
    status_interval: Option<Duration>,
}

impl RuntimeBuilder {
    /// Creates a new runtime builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration file path.
    pub fn config_path(mut self, path: impl AsRef<Path>) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the configuration directly.
    pub fn config(mut self, config: HarvestConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses `transport` instead of the built-in one.
    pub fn transport(mut self, transport: Arc<dyn OpcUaTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Overrides the configured status interval.
    pub fn status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = Some(interval);
        self
    }

    /// Builds the runtime.
    pub fn build(self) -> BinResult<CollectorRuntime> {
        let mut config = match self.config {
            Some(config) => config,
            None => {
                let path = self
                    .config_path
                    .ok_or_else(|| BinError::config("No configuration provided"))?;
                load_config(&path).map_err(|e| {
                    BinError::from(e).with_context(format!("Failed to load {}", path.display()))
                })?
            }
        };

        if let Some(interval) = self.status_interval {
            if interval.is_zero() {
                return Err(BinError::config("status interval must be greater than 0"));
            }
            config.status_interval = interval;
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(&config)?,
        };

        Ok(CollectorRuntime::new(config, transport))
    }
}

#[cfg(feature = "real-transport")]
fn default_transport(config: &HarvestConfig) -> BinResult<Arc<dyn OpcUaTransport>> {
    Ok(Arc::new(harvest_opcua::RealOpcUaTransport::new(
        config.adapter.application.clone(),
    )))
}

#[cfg(not(feature = "real-transport"))]
fn default_transport(_config: &HarvestConfig) -> BinResult<Arc<dyn OpcUaTransport>> {
    Err(BinError::config(
        "this build has no OPC UA transport; rebuild with `--features real-transport`",
    ))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use harvest_opcua::client::SessionRequest;
    use harvest_opcua::{
        AdapterConfig, ApplicationIdentity, Endpoint, EndpointError, OpcUaResult, OpcUaSession,
        RetryPolicy, TagBinding,
    };

    /// Transport for a server that never answers discovery.
    struct UnreachableServer;

    #[async_trait]
    impl OpcUaTransport for UnreachableServer {
        async fn discover_endpoints(&self, server_url: &str) -> OpcUaResult<Vec<Endpoint>> {
            Err(EndpointError::discovery_failed(server_url, "connection refused").into())
        }

        async fn create_session(
            &self,
            _request: &SessionRequest,
        ) -> OpcUaResult<Arc<dyn OpcUaSession>> {
            Err(harvest_opcua::OpcUaError::not_connected())
        }

        async fn reconnect(
            &self,
            _previous: Arc<dyn OpcUaSession>,
        ) -> OpcUaResult<Arc<dyn OpcUaSession>> {
            Err(harvest_opcua::OpcUaError::not_connected())
        }

        fn display_name(&self) -> String {
            "unreachable".to_string()
        }
    }

    fn config(dir: &tempfile::TempDir, max_attempts: u32) -> HarvestConfig {
        let der = [0x30u8, 0x03, 0x02, 0x01, 0x00];
        let cert = dir.path().join("cert.der");
        let key = dir.path().join("key.der");
        std::fs::write(&cert, der).unwrap();
        std::fs::write(&key, der).unwrap();

        let adapter = AdapterConfig::builder()
            .name("Device1")
            .connection_string("opc.tcp://plc-1:4840")
            .application(ApplicationIdentity::new(cert, key).with_pki_dir(dir.path()))
            .retry(RetryPolicy::fixed(Duration::from_millis(5)).with_max_attempts(max_attempts))
            .build()
            .unwrap();

        HarvestConfig {
            adapter,
            measurements: vec![TagBinding::new("DEVICE1:TEMP1", "ns=2;s=Temp1")],
            ..Default::default()
        }
    }

    #[test]
    fn test_runtime_builder_requires_config() {
        let result = RuntimeBuilder::new().build();
        assert!(matches!(result, Err(BinError::Configuration(_))));
    }

    #[test]
    fn test_runtime_builder_rejects_zero_interval() {
        let dir = tempfile::tempdir().unwrap();
        let result = RuntimeBuilder::new()
            .config(config(&dir, 0))
            .transport(Arc::new(UnreachableServer))
            .status_interval(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[cfg(not(feature = "real-transport"))]
    #[test]
    fn test_runtime_builder_without_transport() {
        let dir = tempfile::tempdir().unwrap();
        let result = RuntimeBuilder::new().config(config(&dir, 0)).build();
        match result {
            Err(e) => assert_eq!(e.exit_code(), 1),
            Ok(_) => panic!("expected a configuration error"),
        }
    }

    #[tokio::test]
    async fn test_runtime_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RuntimeBuilder::new()
            .config(config(&dir, 0))
            .transport(Arc::new(UnreachableServer))
            .status_interval(Duration::from_millis(10))
            .build()
            .unwrap();

        let shutdown = runtime.shutdown().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            shutdown.initiate_shutdown();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), runtime.run())
            .await
            .expect("runtime should stop");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_runtime_reports_adapter_giving_up() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RuntimeBuilder::new()
            .config(config(&dir, 2))
            .transport(Arc::new(UnreachableServer))
            .build()
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), runtime.run())
            .await
            .expect("runtime should stop");
        let err = result.unwrap_err();
        assert!(matches!(err, BinError::Adapter { .. }));
        assert_eq!(err.exit_code(), crate::error::EXIT_ADAPTER);
    }

    #[tokio::test]
    async fn test_runtime_rejects_missing_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir, 0);
        std::fs::remove_file(&config.adapter.application.certificate_path).unwrap();

        let runtime = RuntimeBuilder::new()
            .config(config)
            .transport(Arc::new(UnreachableServer))
            .build()
            .unwrap();

        let err = runtime.run().await.unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
