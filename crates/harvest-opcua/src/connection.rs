// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Connection lifecycle.
//!
//! One [`ConnectionManager::connect`] call runs a full connection attempt:
//!
//! 1. check the local application identity (fatal on failure)
//! 2. parse the connection string
//! 3. resolve an endpoint under a bounded discovery timeout
//! 4. open an anonymous session and start reconnect supervision
//! 5. discover variables and subscribe the bound ones
//!
//! A failure after the session exists tears the session down again, so an
//! attempt either ends connected or leaves nothing behind.

use std::fmt;
use std::sync::Arc;

use harvest_core::MeasurementSink;
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::browse::{DiscoveryStats, NodeDiscoverer};
use crate::client::{Endpoint, OpcUaSession, OpcUaTransport, SessionRequest};
use crate::config::{AdapterConfig, ConnectionSpec};
use crate::dispatch::{MeasurementPipeline, ValueChangeDispatcher};
use crate::error::{EndpointError, OpcUaResult};
use crate::subscription::{Subscription, SubscriptionBuilder};
use crate::supervisor::{
    ActiveSession, ReconnectStats, ReconnectSupervisor, SessionSlot, SupervisorState,
};
use crate::tags::{TagBinding, TagBindingTable};
use crate::types::NodeId;

// =============================================================================
// ConnectionPhase
// =============================================================================

/// Where the manager is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// No session.
    #[default]
    Disconnected,
    /// Resolving the endpoint and opening the session.
    Connecting,
    /// Session open, discovering and subscribing.
    Subscribing,
    /// Session open and subscription active.
    Connected,
}

impl ConnectionPhase {
    /// Returns `true` once the subscription is active.
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Subscribing => write!(f, "Subscribing"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

// =============================================================================
// Endpoint selection
// =============================================================================

/// Picks the endpoint to open a session on.
///
/// Without security the first unsecured endpoint wins; with security the
/// secured endpoint with the highest security level wins. Endpoints whose
/// URL scheme matches `server_url` rank ahead of the others. When nothing is
/// eligible the first advertised endpoint is used.
pub fn select_endpoint(
    candidates: &[Endpoint],
    server_url: &str,
    use_security: bool,
) -> OpcUaResult<Endpoint> {
    let Some(first) = candidates.first() else {
        return Err(EndpointError::no_endpoints(server_url).into());
    };

    let wanted_scheme = scheme_of(server_url);
    let scheme_rank = |endpoint: &Endpoint| u8::from(scheme_of(&endpoint.url) == wanted_scheme);

    let selected = if use_security {
        candidates
            .iter()
            .filter(|e| e.is_secured())
            .max_by_key(|e| (scheme_rank(e), e.security_level))
    } else {
        let mut unsecured = candidates.iter().filter(|e| !e.is_secured());
        let fallback = unsecured.clone().next();
        unsecured.find(|e| scheme_rank(e) == 1).or(fallback)
    };

    Ok(selected.unwrap_or(first).clone())
}

fn scheme_of(url: &str) -> String {
    url.split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .unwrap_or_default()
}

// =============================================================================
// ConnectionManager
// =============================================================================

/// Owns the session slot and runs connection attempts.
pub struct ConnectionManager {
    config: AdapterConfig,
    bindings: Vec<TagBinding>,
    transport: Arc<dyn OpcUaTransport>,
    pipeline: Arc<MeasurementPipeline>,
    slot: Arc<SessionSlot>,
    supervisor: Mutex<Option<Arc<ReconnectSupervisor>>>,
    phase: Mutex<ConnectionPhase>,
    discovery: Mutex<Option<DiscoveryStats>>,
}

impl ConnectionManager {
    /// Creates a disconnected manager.
    pub fn new(
        config: AdapterConfig,
        bindings: Vec<TagBinding>,
        transport: Arc<dyn OpcUaTransport>,
        sink: Arc<dyn MeasurementSink>,
    ) -> Self {
        Self {
            config,
            bindings,
            transport,
            pipeline: Arc::new(MeasurementPipeline::new(sink)),
            slot: Arc::new(SessionSlot::empty()),
            supervisor: Mutex::new(None),
            phase: Mutex::new(ConnectionPhase::Disconnected),
            discovery: Mutex::new(None),
        }
    }

    /// Adapter configuration.
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Measurement pipeline shared by every subscription of this manager.
    pub fn pipeline(&self) -> &Arc<MeasurementPipeline> {
        &self.pipeline
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.lock()
    }

    /// The active session and subscription, if any.
    pub fn active(&self) -> Option<Arc<ActiveSession>> {
        self.slot.load_full()
    }

    /// Endpoint of the active session.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.slot.load().as_ref().map(|a| a.session.endpoint().clone())
    }

    /// Number of monitored items on the active subscription.
    pub fn monitored_items(&self) -> usize {
        self.slot
            .load()
            .as_ref()
            .and_then(|a| a.subscription.as_ref().map(|s| s.len()))
            .unwrap_or(0)
    }

    /// Statistics of the last discovery pass.
    pub fn discovery_stats(&self) -> Option<DiscoveryStats> {
        *self.discovery.lock()
    }

    /// State of the reconnect supervisor; `Closed` while disconnected.
    pub fn supervisor_state(&self) -> SupervisorState {
        self.supervisor
            .lock()
            .as_ref()
            .map_or(SupervisorState::Closed, |s| s.state())
    }

    /// Reconnect counters of the current connection.
    pub fn reconnect_stats(&self) -> ReconnectStats {
        self.supervisor
            .lock()
            .as_ref()
            .map(|s| s.stats())
            .unwrap_or_default()
    }

    /// Current supervisor, for observing reconnects.
    pub fn supervisor(&self) -> Option<Arc<ReconnectSupervisor>> {
        self.supervisor.lock().clone()
    }

    /// Runs one connection attempt.
    ///
    /// Any previous session is disconnected first. The identity check runs
    /// before the network is touched.
    #[instrument(skip(self), fields(transport = %self.transport.display_name()))]
    pub async fn connect(&self) -> OpcUaResult<Arc<ActiveSession>> {
        self.config.application.check()?;
        let spec = self.config.connection_spec()?;

        self.disconnect().await;
        self.set_phase(ConnectionPhase::Connecting);
        info!("Connecting to OPC {}", spec.server_url);

        match self.establish(&spec).await {
            Ok(active) => {
                self.set_phase(ConnectionPhase::Connected);
                info!("OPC Connected to {}", spec.server_url);
                Ok(active)
            }
            Err(e) => {
                self.disconnect().await;
                Err(e)
            }
        }
    }

    async fn establish(&self, spec: &ConnectionSpec) -> OpcUaResult<Arc<ActiveSession>> {
        let bindings = Arc::new(TagBindingTable::build(&self.bindings));

        let timeout = self.config.endpoint_discovery_timeout;
        let endpoints = tokio::time::timeout(
            timeout,
            self.transport.discover_endpoints(&spec.server_url),
        )
        .await
        .map_err(|_| EndpointError::timed_out(spec.server_url.clone(), timeout))??;
        let endpoint = select_endpoint(&endpoints, &spec.server_url, self.config.use_security)?;
        debug!(endpoint = %endpoint, candidates = endpoints.len(), "Endpoint selected");

        let request = SessionRequest {
            endpoint,
            session_name: self.config.session_name.clone(),
            session_timeout: self.config.session_timeout,
            application: self.config.application.clone(),
            trust: self.config.trust_policy(),
        };
        let session = self.transport.create_session(&request).await?;
        debug!(session = %session.id(), "Session created");

        self.slot.store(Some(Arc::new(ActiveSession::new(session.clone()))));
        let supervisor = ReconnectSupervisor::new(
            self.transport.clone(),
            self.slot.clone(),
            self.config.reconnect_grace_period,
        )?;
        session.set_keep_alive_observer(supervisor.observer());
        *self.supervisor.lock() = Some(supervisor);

        self.set_phase(ConnectionPhase::Subscribing);
        let subscription = Arc::new(self.subscribe(session.as_ref(), bindings).await?);

        self.slot.rcu(|current| {
            current
                .as_ref()
                .map(|active| Arc::new(active.with_subscription(subscription.clone())))
        });
        self.slot.load_full().ok_or_else(crate::error::OpcUaError::not_connected)
    }

    async fn subscribe(
        &self,
        session: &dyn OpcUaSession,
        bindings: Arc<TagBindingTable>,
    ) -> OpcUaResult<Subscription> {
        let (candidates, stats) = NodeDiscoverer::new()
            .discover(session, &NodeId::OBJECTS_FOLDER)
            .await?;
        *self.discovery.lock() = Some(stats);

        let dispatcher = Arc::new(ValueChangeDispatcher::new(
            bindings.clone(),
            self.pipeline.clone(),
        ));
        SubscriptionBuilder::new(&bindings, &self.config.subscription)
            .build(candidates, session, dispatcher)
            .await
    }

    /// Closes the subscription and session. Safe to call repeatedly and
    /// concurrently with a reconnect attempt.
    pub async fn disconnect(&self) {
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.close();
        }

        let Some(active) = self.slot.swap(None) else {
            self.set_phase(ConnectionPhase::Disconnected);
            return;
        };

        if let Some(subscription) = &active.subscription {
            if let Err(e) = active.session.delete_subscription(subscription.id()).await {
                e.log("disconnect");
            }
        }
        if let Err(e) = active.session.close().await {
            e.log("disconnect");
        }
        self.set_phase(ConnectionPhase::Disconnected);
        info!(session = %active.session.id(), "Disconnected");
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        let previous = std::mem::replace(&mut *self.phase.lock(), phase);
        if previous != phase {
            debug!(from = %previous, to = %phase, "Connection phase changed");
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connection_string", &self.config.connection_string)
            .field("phase", &self.phase())
            .field("active", &self.active())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
