// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! In-memory transport for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::transport::{
    DataChangeListener, DataValue, Endpoint, KeepAliveObserver, MonitoredItemResult,
    OpcUaSession, OpcUaTransport, ReferenceDescription, SessionId, SessionRequest, StatusCode,
};
use crate::certificate::ApplicationIdentity;
use crate::config::SubscriptionSettings;
use crate::error::{BrowseError, OpcUaError, OpcUaResult, SessionError, SubscriptionError};
use crate::subscription::MonitoredItem;
use crate::types::{NodeClass, NodeClassMask, NodeId};

/// Writes a minimal DER certificate and key pair into a temporary PKI dir.
pub fn test_identity() -> (tempfile::TempDir, ApplicationIdentity) {
    let dir = tempfile::tempdir().unwrap();
    let der = [0x30u8, 0x03, 0x02, 0x01, 0x00];
    let cert = dir.path().join("cert.der");
    let key = dir.path().join("key.der");
    std::fs::write(&cert, der).unwrap();
    std::fs::write(&key, der).unwrap();
    let identity = ApplicationIdentity::new(cert, key).with_pki_dir(dir.path());
    (dir, identity)
}

/// Browse tree shared by every session of a [`MockTransport`].
#[derive(Default)]
pub struct MockTree {
    children: HashMap<NodeId, Vec<ReferenceDescription>>,
    failing: HashSet<NodeId>,
}

impl MockTree {
    pub fn add(
        &mut self,
        parent: &NodeId,
        node_id: NodeId,
        name: &str,
        class: NodeClass,
    ) -> NodeId {
        self.children
            .entry(parent.clone())
            .or_default()
            .push(ReferenceDescription::new(node_id.clone(), name, class));
        node_id
    }

    pub fn fail(&mut self, node_id: NodeId) {
        self.failing.insert(node_id);
    }
}

type Registered = (Arc<MonitoredItem>, Arc<dyn DataChangeListener>);

pub struct MockSession {
    id: SessionId,
    endpoint: Endpoint,
    tree: Arc<Mutex<MockTree>>,
    observer: Mutex<Option<Arc<dyn KeepAliveObserver>>>,
    items: Arc<Mutex<Vec<Registered>>>,
    pub rejected: Mutex<HashSet<NodeId>>,
    pub fail_subscription: AtomicBool,
    pub fail_monitored_items: AtomicBool,
    pub deleted: Mutex<Vec<u32>>,
    pub closed: AtomicBool,
    pub browse_calls: AtomicUsize,
}

impl MockSession {
    fn new(id: u64, endpoint: Endpoint, tree: Arc<Mutex<MockTree>>) -> Self {
        Self {
            id: SessionId(id),
            endpoint,
            tree,
            observer: Mutex::new(None),
            items: Arc::new(Mutex::new(Vec::new())),
            rejected: Mutex::new(HashSet::new()),
            fail_subscription: AtomicBool::new(false),
            fail_monitored_items: AtomicBool::new(false),
            deleted: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            browse_calls: AtomicUsize::new(0),
        }
    }

    pub fn standalone(tree: MockTree) -> Arc<Self> {
        Arc::new(Self::new(
            1,
            Endpoint::unsecured("opc.tcp://mock:4840"),
            Arc::new(Mutex::new(tree)),
        ))
    }

    pub fn keep_alive(&self, status: StatusCode) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer.on_keep_alive(self.id, status);
        }
    }

    pub fn has_observer(&self) -> bool {
        self.observer.lock().is_some()
    }

    pub fn push(&self, node_id: &NodeId, values: Vec<DataValue>) {
        let target = self
            .items
            .lock()
            .iter()
            .find(|(item, _)| &item.node_id == node_id)
            .cloned();
        if let Some((item, listener)) = target {
            listener.on_data_change(&item, values);
        }
    }

    pub fn monitored_nodes(&self) -> Vec<NodeId> {
        self.items.lock().iter().map(|(item, _)| item.node_id.clone()).collect()
    }
}

#[async_trait]
impl OpcUaSession for MockSession {
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
        !self.closed.load(Ordering::SeqCst)
    }

    async fn browse(
        &self,
        node_id: &NodeId,
        node_class_mask: NodeClassMask,
    ) -> OpcUaResult<Vec<ReferenceDescription>> {
        self.browse_calls.fetch_add(1, Ordering::SeqCst);
        let tree = self.tree.lock();
        if tree.failing.contains(node_id) {
            return Err(BrowseError::browse_failed(node_id.to_string(), "BadNodeIdUnknown").into());
        }
        Ok(tree
            .children
            .get(node_id)
            .map(|refs| {
                refs.iter()
                    .filter(|r| node_class_mask.contains(r.node_class))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_subscription(&self, _settings: &SubscriptionSettings) -> OpcUaResult<u32> {
        if self.fail_subscription.load(Ordering::SeqCst) {
            return Err(SubscriptionError::creation_failed("BadTooManySubscriptions").into());
        }
        Ok(7)
    }

    async fn create_monitored_items(
        &self,
        _subscription_id: u32,
        items: &[Arc<MonitoredItem>],
        _settings: &SubscriptionSettings,
        listener: Arc<dyn DataChangeListener>,
    ) -> OpcUaResult<Vec<MonitoredItemResult>> {
        if self.fail_monitored_items.load(Ordering::SeqCst) {
            let reason = "BadTooManyOperations";
            return Err(SubscriptionError::monitored_items_failed(items.len(), reason).into());
        }
        let rejected = self.rejected.lock().clone();
        let mut results = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let status = if rejected.contains(&item.node_id) {
                StatusCode::BAD_NODE_ID_UNKNOWN
            } else {
                self.items.lock().push((item.clone(), listener.clone()));
                StatusCode::GOOD
            };
            results.push(MonitoredItemResult {
                client_handle: item.client_handle,
                status,
                monitored_item_id: 100 + i as u32,
            });
        }
        Ok(results)
    }

    async fn delete_subscription(&self, subscription_id: u32) -> OpcUaResult<()> {
        self.deleted.lock().push(subscription_id);
        Ok(())
    }

    async fn close(&self) -> OpcUaResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Transport whose reconnects are released one at a time by the test.
pub struct MockTransport {
    tree: Arc<Mutex<MockTree>>,
    next_id: AtomicU64,
    pub sessions: Mutex<Vec<Arc<MockSession>>>,
    pub reconnect_calls: AtomicUsize,
    reconnect_results: Mutex<VecDeque<bool>>,
    pub reconnect_gate: Notify,
    gated: AtomicBool,
    pub discover_calls: AtomicUsize,
    pub endpoints: Mutex<Option<Vec<Endpoint>>>,
    pub discovery_delay: Mutex<Option<Duration>>,
    pub fail_sessions: AtomicBool,
    pub requests: Mutex<Vec<SessionRequest>>,
    /// Applied to every session this transport opens.
    pub session_setup: Mutex<Option<Box<dyn Fn(&MockSession) + Send + Sync>>>,
}

impl MockTransport {
    pub fn new(tree: MockTree) -> Arc<Self> {
        Arc::new(Self {
            tree: Arc::new(Mutex::new(tree)),
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(Vec::new()),
            reconnect_calls: AtomicUsize::new(0),
            reconnect_results: Mutex::new(VecDeque::new()),
            reconnect_gate: Notify::new(),
            gated: AtomicBool::new(false),
            discover_calls: AtomicUsize::new(0),
            endpoints: Mutex::new(None),
            discovery_delay: Mutex::new(None),
            fail_sessions: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            session_setup: Mutex::new(None),
        })
    }

    /// Holds every reconnect until `reconnect_gate` is notified.
    pub fn gate_reconnects(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// Queues reconnect outcomes; an empty queue means success.
    pub fn script_reconnects(&self, outcomes: &[bool]) {
        self.reconnect_results.lock().extend(outcomes.iter().copied());
    }

    pub fn open_session(&self) -> Arc<MockSession> {
        self.open_session_at(Endpoint::unsecured("opc.tcp://mock:4840"))
    }

    pub fn open_session_at(&self, endpoint: Endpoint) -> Arc<MockSession> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(MockSession::new(id, endpoint, self.tree.clone()));
        if let Some(setup) = self.session_setup.lock().as_ref() {
            setup(&session);
        }
        self.sessions.lock().push(session.clone());
        session
    }

    pub fn session(&self, index: usize) -> Arc<MockSession> {
        self.sessions.lock()[index].clone()
    }
}

#[async_trait]
impl OpcUaTransport for MockTransport {
    async fn discover_endpoints(&self, server_url: &str) -> OpcUaResult<Vec<Endpoint>> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.discovery_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let configured = self.endpoints.lock().clone();
        Ok(configured.unwrap_or_else(|| vec![Endpoint::unsecured(server_url)]))
    }

    async fn create_session(&self, request: &SessionRequest) -> OpcUaResult<Arc<dyn OpcUaSession>> {
        self.requests.lock().push(request.clone());
        if self.fail_sessions.load(Ordering::SeqCst) {
            return Err(SessionError::creation_failed(
                request.endpoint.url.clone(),
                "BadSecureChannelClosed",
            )
            .into());
        }
        Ok(self.open_session_at(request.endpoint.clone()))
    }

    async fn reconnect(
        &self,
        previous: Arc<dyn OpcUaSession>,
    ) -> OpcUaResult<Arc<dyn OpcUaSession>> {
        self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            self.reconnect_gate.notified().await;
        }
        let succeed = self.reconnect_results.lock().pop_front().unwrap_or(true);
        if !succeed {
            return Err(OpcUaError::Session(SessionError::reconnect_failed(format!(
                "{} unreachable",
                previous.endpoint().url
            ))));
        }
        Ok(self.open_session_at(previous.endpoint().clone()))
    }

    fn display_name(&self) -> String {
        "MockTransport".to_string()
    }
}
