// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Protocol client seam.
//!
//! Everything above this module talks to a server only through the
//! [`OpcUaTransport`] and [`OpcUaSession`] traits:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   ConnectionManager / ReconnectSupervisor    │
//! └──────────────────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────┐
//! │     OpcUaTransport  ──►  OpcUaSession        │
//! │  (discover, create, reconnect) (browse, sub) │
//! └──────────────────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────┐
//! │  RealOpcUaTransport (feature real-transport) │
//! └──────────────────────────────────────────────┘
//! ```

mod transport;

#[cfg(test)]
pub(crate) mod mock;

#[cfg(feature = "real-transport")]
mod real_transport;

pub use transport::{
    DataChangeListener, DataValue, Endpoint, KeepAliveObserver, MonitoredItemResult, OpcUaSession,
    OpcUaTransport, OpcUaValue, ReferenceDescription, SessionId, SessionRequest, StatusCode,
};

#[cfg(feature = "real-transport")]
pub use real_transport::RealOpcUaTransport;
