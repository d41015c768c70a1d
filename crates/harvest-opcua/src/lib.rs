// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! OPC UA acquisition adapter for the harvest data collector.
//!
//! The adapter connects to one OPC UA server, walks its address space for
//! variables, subscribes to those that have a configured tag binding and
//! forwards every value change as a [`harvest_core::Measurement`]. A
//! reconnect supervisor keeps the session alive without blocking the
//! protocol threads.
//!
//! ```text
//!                 ┌──────────────────────┐
//!  AdapterConfig ─┤   ConnectionManager  ├── Session ──► ReconnectSupervisor
//!                 └──────────────────────┘                (keep-alive driven)
//!                            │ once per connection
//!                            ▼
//!                 NodeDiscoverer ──► SubscriptionBuilder
//!                                          │
//!                                          ▼
//!                 ValueChangeDispatcher ──► MeasurementSink
//! ```
//!
//! # Error Handling
//!
//! ```text
//! OpcUaError
//! ├── Configuration - Invalid settings (fatal)
//! ├── Certificate   - Local application identity unusable (fatal)
//! ├── Endpoint      - Endpoint resolution
//! ├── Session       - Session creation and reconnection
//! ├── Browse        - Address space discovery
//! ├── Subscription  - Subscription and monitored item creation
//! ├── Conversion    - Value not representable as a number
//! └── Timeout       - Bounded operation elapsed
//! ```
//!
//! Only fatal errors stop the adapter; everything else is logged and
//! retried.
//!
//! # Example
//!
//! ```rust,ignore
//! use harvest_opcua::{AdapterConfig, OpcUaAdapter, RealOpcUaTransport, TagBinding};
//!
//! let config = AdapterConfig::new("opc.tcp://plc-1:4840");
//! let transport = Arc::new(RealOpcUaTransport::new(config.application.clone()));
//! let bindings = vec![TagBinding::new("DEVICE1:TEMP1", "ns=2;s=Temp1")];
//! let (sink, mut rx) = harvest_core::ChannelSink::new();
//!
//! let adapter = OpcUaAdapter::initialize(config, bindings, transport, Arc::new(sink))?;
//! adapter.run(cancel).await?;
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod adapter;
pub mod browse;
pub mod certificate;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod subscription;
pub mod supervisor;
pub mod tags;
pub mod types;

pub use error::{
    BrowseError, CertificateError, ConfigurationError, ConversionError, EndpointError, ErrorCode,
    ErrorSeverity, OpcUaError, OpcUaResult, SessionError, SubscriptionError, TimeoutError,
};

pub use types::{
    canonicalize_identifier, NodeClass, NodeClassMask, NodeId, NodeIdentifier, SecurityMode,
    SecurityPolicy,
};

pub use adapter::{AdapterStatus, OpcUaAdapter};
pub use browse::{DiscoveredNode, DiscoveryStats, NodeDiscoverer};
pub use certificate::{
    ApplicationIdentity, CertificateTrust, PeerCertificate, TrustDecision, TrustPolicy,
};
pub use client::{
    DataChangeListener, DataValue, Endpoint, KeepAliveObserver, OpcUaSession, OpcUaTransport,
    OpcUaValue, SessionId, StatusCode,
};
pub use config::{AdapterConfig, ConnectionSpec, RetryPolicy, RetryStrategy, SubscriptionSettings};
pub use connection::{select_endpoint, ConnectionManager, ConnectionPhase};
pub use dispatch::{DispatchOutcome, MeasurementPipeline, ValueChangeDispatcher};
pub use subscription::{MonitoredItem, Subscription, SubscriptionBuilder};
pub use supervisor::{ReconnectStats, ReconnectSupervisor, SupervisorState};
pub use tags::{TagBinding, TagBindingTable};

#[cfg(feature = "real-transport")]
pub use client::RealOpcUaTransport;
