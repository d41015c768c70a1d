// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Transport backed by the `opcua` crate.
//!
//! The `opcua` client API is synchronous; every service call runs on the
//! blocking pool. Each session gets a background run loop that processes
//! publish responses and reports connection status, which is forwarded to
//! the installed [`KeepAliveObserver`].
//!
//! Server-assigned client handles are not under our control, so
//! notifications are routed back to [`MonitoredItem`]s by node id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use opcua::client::prelude::{
    AttributeId, BrowseDescription, BrowseDescriptionResultMask, BrowseDirection, Client,
    ClientBuilder, ConnectionStatusCallback, DataChangeCallback, ExtensionObject, IdentityToken,
    MessageSecurityMode, MonitoredItemCreateRequest, MonitoredItemService, MonitoringMode,
    MonitoringParameters, ReadValueId, ReferenceTypeId, Session, SessionCommand,
    SubscriptionService, TimestampsToReturn, ViewService,
};
use opcua::sync::RwLock as UaRwLock;

use super::transport::{
    DataChangeListener, DataValue, Endpoint, KeepAliveObserver, MonitoredItemResult, OpcUaSession,
    OpcUaTransport, OpcUaValue, ReferenceDescription, SessionId, SessionRequest, StatusCode,
};
use crate::certificate::{ApplicationIdentity, CertificateTrust};
use crate::config::SubscriptionSettings;
use crate::error::{
    BrowseError, EndpointError, OpcUaError, OpcUaResult, SessionError, SubscriptionError,
};
use crate::subscription::MonitoredItem;
use crate::types::{NodeClass, NodeClassMask, NodeId, NodeIdentifier, SecurityMode, SecurityPolicy};

type Route = (Arc<MonitoredItem>, Arc<dyn DataChangeListener>);
type RouteTable = Arc<Mutex<HashMap<opcua::types::NodeId, Route>>>;
type ObserverCell = Arc<Mutex<Option<Arc<dyn KeepAliveObserver>>>>;

// =============================================================================
// RealOpcUaTransport
// =============================================================================

/// Production transport.
pub struct RealOpcUaTransport {
    application: ApplicationIdentity,
    next_session: AtomicU64,
    sessions: Mutex<HashMap<SessionId, Weak<RealSession>>>,
}

impl RealOpcUaTransport {
    /// Creates a transport for the given local application identity.
    pub fn new(application: ApplicationIdentity) -> Self {
        Self {
            application,
            next_session: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn build_client(
        application: &ApplicationIdentity,
        request: Option<&SessionRequest>,
        trust_server_certs: bool,
    ) -> OpcUaResult<Client> {
        let mut builder = ClientBuilder::new()
            .application_name(application.application_name.clone())
            .application_uri(application.effective_application_uri())
            .pki_dir(application.pki_dir.clone())
            .certificate_path(application.certificate_path.clone())
            .private_key_path(application.private_key_path.clone())
            .create_sample_keypair(false)
            .trust_server_certs(trust_server_certs)
            .session_retry_limit(0);

        if let Some(request) = request {
            builder = builder
                .session_name(request.session_name.clone())
                .session_timeout(millis_u32(request.session_timeout));
        }

        builder.client().ok_or_else(|| {
            OpcUaError::session_failed(
                request.map(|r| r.endpoint.url.clone()).unwrap_or_default(),
                "client configuration rejected by the protocol stack",
            )
        })
    }

    fn connect(
        application: &ApplicationIdentity,
        request: &SessionRequest,
        trust_server_certs: bool,
    ) -> Result<Arc<UaRwLock<Session>>, opcua::types::StatusCode> {
        let mut client = Self::build_client(application, Some(request), trust_server_certs)
            .map_err(|_| opcua::types::StatusCode::BadConfigurationError)?;
        let endpoint = &request.endpoint;
        client.connect_to_endpoint(
            (
                endpoint.url.as_str(),
                endpoint.security_policy.uri(),
                to_ua_security_mode(endpoint.security_mode),
            ),
            IdentityToken::Anonymous,
        )
    }

    fn register(&self, session: RealSession) -> Arc<RealSession> {
        let session = Arc::new(session);
        session.install_status_callback();
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, s| s.strong_count() > 0);
        sessions.insert(session.id, Arc::downgrade(&session));
        session
    }

    fn next_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl OpcUaTransport for RealOpcUaTransport {
    async fn discover_endpoints(&self, server_url: &str) -> OpcUaResult<Vec<Endpoint>> {
        let application = self.application.clone();
        let url = server_url.to_string();
        blocking(move || {
            let client = Self::build_client(&application, None, false)?;
            let endpoints = client
                .get_server_endpoints_from_url(url.as_str())
                .map_err(|e| EndpointError::discovery_failed(url.clone(), e.to_string()))?;
            for e in &endpoints {
                debug!(
                    endpoint_url = %e.endpoint_url,
                    security_policy_uri = %e.security_policy_uri,
                    security_mode = ?e.security_mode,
                    "Discovered endpoint"
                );
            }
            Ok(endpoints
                .iter()
                .map(|e| Endpoint {
                    url: e.endpoint_url.as_ref().to_string(),
                    security_mode: from_ua_security_mode(e.security_mode),
                    security_policy: SecurityPolicy::from_uri(e.security_policy_uri.as_ref()),
                    security_level: e.security_level,
                    server_certificate: e.server_certificate.value.clone(),
                })
                .collect())
        })
        .await
    }

    async fn create_session(&self, request: &SessionRequest) -> OpcUaResult<Arc<dyn OpcUaSession>> {
        let application = self.application.clone();
        let request = request.clone();
        let endpoint = request.endpoint.clone();

        let inner = blocking(move || {
            let untrusted = StatusCode::BAD_CERTIFICATE_UNTRUSTED;
            match Self::connect(&application, &request, false) {
                Ok(inner) => Ok(inner),
                Err(e) if StatusCode(e.bits()) == untrusted => {
                    let peer = request.endpoint.peer_certificate();
                    if !request.trust.decide(&peer).is_accept() {
                        return Err(SessionError::certificate_rejected(peer.subject).into());
                    }
                    Self::connect(&application, &request, true).map_err(|e| {
                        OpcUaError::session_failed(request.endpoint.url.clone(), e.to_string())
                    })
                }
                Err(e) => Err(OpcUaError::session_failed(
                    request.endpoint.url.clone(),
                    e.to_string(),
                )),
            }
        })
        .await?;

        let session = self.register(RealSession {
            id: self.next_id(),
            endpoint,
            inner,
            observer: Arc::new(Mutex::new(None)),
            routes: Arc::new(Mutex::new(HashMap::new())),
            run_loop: Arc::new(Mutex::new(None)),
            closed: AtomicBool::new(false),
        });
        session.start_run_loop();
        info!(session = %session.id, endpoint = %session.endpoint, "Session activated");
        Ok(session)
    }

    async fn reconnect(
        &self,
        previous: Arc<dyn OpcUaSession>,
    ) -> OpcUaResult<Arc<dyn OpcUaSession>> {
        let known = self.sessions.lock().get(&previous.id()).and_then(Weak::upgrade);
        let Some(previous) = known else {
            return Err(SessionError::reconnect_failed(format!(
                "{} was not created by this transport",
                previous.id()
            ))
            .into());
        };

        let inner = previous.inner.clone();
        blocking(move || {
            inner
                .write()
                .reconnect_and_activate()
                .map_err(|e| SessionError::reconnect_failed(e.to_string()).into())
        })
        .await?;

        let session = self.register(RealSession {
            id: self.next_id(),
            endpoint: previous.endpoint.clone(),
            inner: previous.inner.clone(),
            observer: Arc::new(Mutex::new(None)),
            routes: previous.routes.clone(),
            run_loop: previous.run_loop.clone(),
            closed: AtomicBool::new(false),
        });
        info!(previous = %previous.id, session = %session.id, "Session reactivated");
        Ok(session)
    }

    fn display_name(&self) -> String {
        format!("RealOpcUaTransport({})", self.application.application_name)
    }
}

// =============================================================================
// RealSession
// =============================================================================

struct RealSession {
    id: SessionId,
    endpoint: Endpoint,
    inner: Arc<UaRwLock<Session>>,
    observer: ObserverCell,
    routes: RouteTable,
    run_loop: Arc<Mutex<Option<oneshot::Sender<SessionCommand>>>>,
    closed: AtomicBool,
}

impl RealSession {
    fn install_status_callback(&self) {
        let observer = self.observer.clone();
        let id = self.id;
        self.inner
            .write()
            .set_connection_status_callback(ConnectionStatusCallback::new(move |connected| {
                let status = if connected {
                    StatusCode::GOOD
                } else {
                    StatusCode::BAD_CONNECTION_CLOSED
                };
                let current = observer.lock().clone();
                if let Some(current) = current {
                    current.on_keep_alive(id, status);
                }
            }));
    }

    fn start_run_loop(&self) {
        let stop = Session::run_async(self.inner.clone());
        *self.run_loop.lock() = Some(stop);
    }
}

#[async_trait]
impl OpcUaSession for RealSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn set_keep_alive_observer(&self, observer: Arc<dyn KeepAliveObserver>) {
        *self.observer.lock() = Some(observer);
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.inner.read().is_connected()
    }

    async fn browse(
        &self,
        node_id: &NodeId,
        node_class_mask: NodeClassMask,
    ) -> OpcUaResult<Vec<ReferenceDescription>> {
        let inner = self.inner.clone();
        let target = to_ua_node_id(node_id);
        let label = node_id.to_string();
        trace!(node_id = %node_id, "Browsing node");

        blocking(move || {
            let description = BrowseDescription {
                node_id: target,
                browse_direction: BrowseDirection::Forward,
                reference_type_id: ReferenceTypeId::HierarchicalReferences.into(),
                include_subtypes: true,
                node_class_mask: node_class_mask.bits(),
                result_mask: BrowseDescriptionResultMask::all().bits(),
            };
            let results = inner
                .read()
                .browse(&[description])
                .map_err(|e| BrowseError::browse_failed(label.clone(), e.to_string()))?
                .ok_or_else(|| BrowseError::browse_failed(label.clone(), "no browse result"))?;

            let Some(result) = results.first() else {
                return Ok(Vec::new());
            };
            if !result.status_code.is_good() {
                let status = result.status_code.to_string();
                return Err(BrowseError::browse_failed(label, status).into());
            }
            Ok(result
                .references
                .as_deref()
                .unwrap_or_default()
                .iter()
                .filter_map(|r| {
                    let class = NodeClass::from_value(r.node_class as u32)?;
                    let mut reference = ReferenceDescription::new(
                        from_ua_node_id(&r.node_id.node_id),
                        r.display_name.text.as_ref(),
                        class,
                    );
                    reference.browse_name = r.browse_name.name.as_ref().to_string();
                    Some(reference)
                })
                .collect())
        })
        .await
    }

    async fn create_subscription(&self, settings: &SubscriptionSettings) -> OpcUaResult<u32> {
        let inner = self.inner.clone();
        let routes = self.routes.clone();
        let settings = settings.clone();

        blocking(move || {
            let callback = DataChangeCallback::new(move |changed| {
                for item in changed {
                    let route = routes.lock().get(&item.item_to_monitor().node_id).cloned();
                    let Some((monitored, listener)) = route else {
                        continue;
                    };
                    let values = item.values().iter().map(from_ua_data_value).collect();
                    listener.on_data_change(&monitored, values);
                }
            });
            inner
                .read()
                .create_subscription(
                    millis_f64(settings.publishing_interval),
                    settings.lifetime_count,
                    settings.keepalive_count,
                    settings.max_notifications_per_publish,
                    settings.priority,
                    settings.publishing_enabled,
                    callback,
                )
                .map_err(|e| SubscriptionError::creation_failed(e.to_string()).into())
        })
        .await
    }

    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        items: &[Arc<MonitoredItem>],
        settings: &SubscriptionSettings,
        listener: Arc<dyn DataChangeListener>,
    ) -> OpcUaResult<Vec<MonitoredItemResult>> {
        let inner = self.inner.clone();
        let routes = self.routes.clone();
        let items = items.to_vec();
        let settings = settings.clone();

        blocking(move || {
            let requests: Vec<MonitoredItemCreateRequest> = items
                .iter()
                .map(|item| MonitoredItemCreateRequest {
                    item_to_monitor: ReadValueId {
                        node_id: to_ua_node_id(&item.node_id),
                        attribute_id: AttributeId::Value as u32,
                        index_range: opcua::types::UAString::null(),
                        data_encoding: opcua::types::QualifiedName::null(),
                    },
                    monitoring_mode: MonitoringMode::Reporting,
                    requested_parameters: MonitoringParameters {
                        client_handle: item.client_handle,
                        sampling_interval: millis_f64(settings.sampling_interval),
                        filter: ExtensionObject::null(),
                        queue_size: settings.queue_size,
                        discard_oldest: true,
                    },
                })
                .collect();

            {
                let mut table = routes.lock();
                for item in &items {
                    table.insert(to_ua_node_id(&item.node_id), (item.clone(), listener.clone()));
                }
            }

            let results = inner
                .read()
                .create_monitored_items(subscription_id, TimestampsToReturn::Both, &requests)
                .map_err(|e| {
                    routes.lock().clear();
                    SubscriptionError::monitored_items_failed(items.len(), e.to_string())
                })?;

            let mut out = Vec::with_capacity(items.len());
            for (item, result) in items.iter().zip(results.iter()) {
                let status = StatusCode(result.status_code.bits());
                if !status.is_good() {
                    routes.lock().remove(&to_ua_node_id(&item.node_id));
                }
                out.push(MonitoredItemResult {
                    client_handle: item.client_handle,
                    status,
                    monitored_item_id: result.monitored_item_id,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn delete_subscription(&self, subscription_id: u32) -> OpcUaResult<()> {
        let inner = self.inner.clone();
        self.routes.lock().clear();
        blocking(move || {
            inner
                .read()
                .delete_subscription(subscription_id)
                .map(|_| ())
                .map_err(|e| {
                    SubscriptionError::delete_failed(subscription_id, e.to_string()).into()
                })
        })
        .await
    }

    async fn close(&self) -> OpcUaResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.observer.lock() = None;
        if let Some(stop) = self.run_loop.lock().take() {
            let _ = stop.send(SessionCommand::Stop);
        }
        let inner = self.inner.clone();
        blocking(move || {
            inner.read().disconnect();
            Ok(())
        })
        .await?;
        debug!(session = %self.id, "Session closed");
        Ok(())
    }
}

// =============================================================================
// Conversions
// =============================================================================

async fn blocking<T, F>(f: F) -> OpcUaResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> OpcUaResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.unwrap_or_else(|e| {
        warn!(error = %e, "Blocking protocol call aborted");
        Err(OpcUaError::not_connected())
    })
}

fn millis_u32(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

fn millis_f64(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn to_ua_security_mode(mode: SecurityMode) -> MessageSecurityMode {
    match mode {
        SecurityMode::None => MessageSecurityMode::None,
        SecurityMode::Sign => MessageSecurityMode::Sign,
        SecurityMode::SignAndEncrypt => MessageSecurityMode::SignAndEncrypt,
    }
}

fn from_ua_security_mode(mode: MessageSecurityMode) -> SecurityMode {
    match mode {
        MessageSecurityMode::Sign => SecurityMode::Sign,
        MessageSecurityMode::SignAndEncrypt => SecurityMode::SignAndEncrypt,
        _ => SecurityMode::None,
    }
}

fn to_ua_node_id(node_id: &NodeId) -> opcua::types::NodeId {
    let ns = node_id.namespace_index;
    match &node_id.identifier {
        NodeIdentifier::Numeric(v) => opcua::types::NodeId::new(ns, *v),
        NodeIdentifier::String(v) => opcua::types::NodeId::new(ns, v.clone()),
        NodeIdentifier::Guid(v) => opcua::types::NodeId::new(ns, opcua::types::Guid::from(*v)),
        NodeIdentifier::Opaque(v) => {
            opcua::types::NodeId::new(ns, opcua::types::ByteString::from(v.as_slice()))
        }
    }
}

fn from_ua_node_id(node_id: &opcua::types::NodeId) -> NodeId {
    let ns = node_id.namespace;
    match &node_id.identifier {
        opcua::types::Identifier::Numeric(v) => NodeId::numeric(ns, *v),
        opcua::types::Identifier::String(v) => NodeId::string(ns, v.as_ref()),
        opcua::types::Identifier::Guid(v) => {
            NodeId::guid(ns, uuid::Uuid::from_bytes(*v.as_bytes()))
        }
        opcua::types::Identifier::ByteString(v) => {
            NodeId::opaque(ns, v.value.clone().unwrap_or_default())
        }
    }
}

fn from_ua_data_value(value: &opcua::types::DataValue) -> DataValue {
    DataValue {
        value: value
            .value
            .as_ref()
            .map(from_ua_variant)
            .unwrap_or(OpcUaValue::Null),
        status: value
            .status
            .map(|s| StatusCode(s.bits()))
            .unwrap_or(StatusCode::GOOD),
        source_timestamp: value.source_timestamp.map(|t| t.as_chrono().into()),
        server_timestamp: value.server_timestamp.map(|t| t.as_chrono().into()),
    }
}

fn from_ua_variant(variant: &opcua::types::Variant) -> OpcUaValue {
    use opcua::types::Variant;

    match variant {
        Variant::Empty => OpcUaValue::Null,
        Variant::Boolean(v) => OpcUaValue::Boolean(*v),
        Variant::SByte(v) => OpcUaValue::SByte(*v),
        Variant::Byte(v) => OpcUaValue::Byte(*v),
        Variant::Int16(v) => OpcUaValue::Int16(*v),
        Variant::UInt16(v) => OpcUaValue::UInt16(*v),
        Variant::Int32(v) => OpcUaValue::Int32(*v),
        Variant::UInt32(v) => OpcUaValue::UInt32(*v),
        Variant::Int64(v) => OpcUaValue::Int64(*v),
        Variant::UInt64(v) => OpcUaValue::UInt64(*v),
        Variant::Float(v) => OpcUaValue::Float(*v),
        Variant::Double(v) => OpcUaValue::Double(*v),
        Variant::String(v) => OpcUaValue::String(v.as_ref().to_string()),
        Variant::DateTime(v) => OpcUaValue::DateTime(v.as_chrono()),
        Variant::Guid(v) => OpcUaValue::Guid(uuid::Uuid::from_bytes(*v.as_bytes())),
        Variant::ByteString(v) => OpcUaValue::ByteString(v.value.clone().unwrap_or_default()),
        Variant::Array(array) => {
            OpcUaValue::Array(array.values.iter().map(from_ua_variant).collect())
        }
        other => OpcUaValue::String(format!("{other:?}")),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_node_id_conversion() {
        for node in [
            NodeId::numeric(2, 1001),
            NodeId::string(2, "Line1.Temp1"),
            NodeId::OBJECTS_FOLDER,
        ] {
            assert_eq!(from_ua_node_id(&to_ua_node_id(&node)), node);
        }
    }

    fn assert_session_services<S: ViewService + SubscriptionService + MonitoredItemService>() {}

    #[test]
    fn test_session_provides_adapter_services() {
        assert_session_services::<Session>();
    }

    #[test]
    fn test_duration_conversion_saturates() {
        assert_eq!(millis_u32(Duration::from_secs(60)), 60_000);
        assert_eq!(millis_u32(Duration::from_secs(u64::MAX)), u32::MAX);
        assert_eq!(millis_f64(Duration::from_millis(500)), 500.0);
        assert!((millis_f64(Duration::from_micros(2500)) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_security_mode_conversion() {
        for mode in [SecurityMode::None, SecurityMode::Sign, SecurityMode::SignAndEncrypt] {
            assert_eq!(from_ua_security_mode(to_ua_security_mode(mode)), mode);
        }
    }

    #[test]
    fn test_data_value_conversion() {
        let source = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let ua = opcua::types::DataValue {
            value: Some(opcua::types::Variant::Double(21.5)),
            status: None,
            source_timestamp: Some(opcua::types::DateTime::from(source)),
            source_picoseconds: None,
            server_timestamp: None,
            server_picoseconds: None,
        };

        let value = from_ua_data_value(&ua);

        assert_eq!(value.value, OpcUaValue::Double(21.5));
        assert!(value.status.is_good());
        assert_eq!(value.source_timestamp.map(|t| t.with_timezone(&Utc)), Some(source));
        assert!(value.server_timestamp.is_none());
    }
}
