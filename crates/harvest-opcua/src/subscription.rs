// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Subscription construction.
//!
//! [`SubscriptionBuilder`] intersects discovered variables with the tag
//! binding table and registers one monitored item per match on a single
//! change-notification subscription.
//!
//! ```text
//! discovered variables ──┐
//!                        ├── plan() ──► [MonitoredItem] ──► build() ──► Subscription
//! TagBindingTable ───────┘   (match + dedup)               (server calls)
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::browse::DiscoveredNode;
use crate::client::{DataChangeListener, OpcUaSession};
use crate::config::SubscriptionSettings;
use crate::error::OpcUaResult;
use crate::tags::TagBindingTable;
use crate::types::NodeId;

// =============================================================================
// MonitoredItem
// =============================================================================

/// A point under change monitoring. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MonitoredItem {
    /// Client handle correlating notifications with this item.
    pub client_handle: u32,
    /// Monitored node.
    pub node_id: NodeId,
    /// Display name reported during discovery.
    pub display_name: String,
    /// Canonical identifier used for tag lookup.
    pub canonical_id: String,
}

impl MonitoredItem {
    /// Creates an item for `node_id`.
    pub fn new(client_handle: u32, node_id: NodeId, display_name: impl Into<String>) -> Self {
        Self {
            client_handle,
            canonical_id: node_id.canonical(),
            node_id,
            display_name: display_name.into(),
        }
    }
}

impl fmt::Display for MonitoredItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.node_id, self.display_name)
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// An active change-notification subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u32,
    publishing_interval: Duration,
    items: Vec<Arc<MonitoredItem>>,
}

impl Subscription {
    /// Server subscription id.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Publishing interval requested at creation.
    #[inline]
    pub fn publishing_interval(&self) -> Duration {
        self.publishing_interval
    }

    /// Monitored items accepted by the server.
    #[inline]
    pub fn items(&self) -> &[Arc<MonitoredItem>] {
        &self.items
    }

    /// Number of monitored items.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if no item is monitored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns `true` if `node_id` is monitored.
    pub fn contains(&self, node_id: &NodeId) -> bool {
        let canonical = node_id.canonical();
        self.items.iter().any(|item| item.canonical_id == canonical)
    }
}

// =============================================================================
// SubscriptionPlan
// =============================================================================

/// Outcome of matching candidates against bindings.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPlan {
    /// One item per matched point.
    pub items: Vec<Arc<MonitoredItem>>,
    /// Candidates without a binding.
    pub unmatched: usize,
    /// Candidates whose point was already planned.
    pub duplicates: usize,
}

// =============================================================================
// SubscriptionBuilder
// =============================================================================

/// Builds the subscription for one connection attempt.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionBuilder<'a> {
    bindings: &'a TagBindingTable,
    settings: &'a SubscriptionSettings,
}

impl<'a> SubscriptionBuilder<'a> {
    /// Creates a builder.
    pub fn new(bindings: &'a TagBindingTable, settings: &'a SubscriptionSettings) -> Self {
        Self { bindings, settings }
    }

    /// Matches candidates against the binding table.
    ///
    /// Unbound candidates are excluded silently. A point reached more than
    /// once is planned once.
    pub fn plan(&self, candidates: impl IntoIterator<Item = DiscoveredNode>) -> SubscriptionPlan {
        let mut plan = SubscriptionPlan::default();
        let mut planned = HashSet::new();

        for candidate in candidates {
            let canonical = candidate.node_id.canonical();
            let Some(binding) = self.bindings.resolve_canonical(&canonical) else {
                plan.unmatched += 1;
                continue;
            };
            if !planned.insert(canonical) {
                plan.duplicates += 1;
                continue;
            }

            let client_handle = plan.items.len() as u32 + 1;
            info!(
                node_id = %candidate.node_id,
                key = %binding.key,
                "OPC item {} linked.",
                candidate.node_id
            );
            plan.items.push(Arc::new(MonitoredItem::new(
                client_handle,
                candidate.node_id,
                candidate.display_name,
            )));
        }

        debug!(
            items = plan.items.len(),
            unmatched = plan.unmatched,
            duplicates = plan.duplicates,
            "Subscription planned"
        );
        plan
    }

    /// Creates the subscription and its monitored items on `session`.
    ///
    /// A service-level failure is returned as an error and the partially
    /// created subscription is deleted. Items rejected individually by the
    /// server are logged and left out.
    pub async fn build(
        &self,
        candidates: impl IntoIterator<Item = DiscoveredNode>,
        session: &dyn OpcUaSession,
        listener: Arc<dyn DataChangeListener>,
    ) -> OpcUaResult<Subscription> {
        let plan = self.plan(candidates);
        let id = session.create_subscription(self.settings).await?;

        if plan.items.is_empty() {
            warn!(subscription_id = id, "No configured tag matched a discovered variable");
            return Ok(Subscription {
                id,
                publishing_interval: self.settings.publishing_interval,
                items: Vec::new(),
            });
        }

        let results = match session
            .create_monitored_items(id, &plan.items, self.settings, listener)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                if let Err(delete_error) = session.delete_subscription(id).await {
                    debug!(
                        subscription_id = id,
                        error = %delete_error,
                        "Cleanup of subscription failed"
                    );
                }
                return Err(e);
            }
        };

        let mut items = Vec::with_capacity(plan.items.len());
        for item in plan.items {
            let status = results
                .iter()
                .find(|r| r.client_handle == item.client_handle)
                .map(|r| r.status);
            match status {
                Some(status) if status.is_good() => items.push(item),
                Some(status) => warn!(
                    node_id = %item.node_id,
                    status = %status,
                    "Server rejected monitored item"
                ),
                None => warn!(node_id = %item.node_id, "No result for monitored item"),
            }
        }

        info!(
            subscription_id = id,
            items = items.len(),
            publishing_interval = ?self.settings.publishing_interval,
            "Subscription created"
        );

        Ok(Subscription {
            id,
            publishing_interval: self.settings.publishing_interval,
            items,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{MockSession, MockTree};
    use crate::client::DataValue;
    use crate::error::OpcUaError;
    use crate::tags::TagBinding;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingListener(AtomicUsize);

    impl DataChangeListener for CountingListener {
        fn on_data_change(&self, _item: &MonitoredItem, values: Vec<DataValue>) {
            self.0.fetch_add(values.len(), Ordering::SeqCst);
        }
    }

    fn candidate(node_id: NodeId) -> DiscoveredNode {
        DiscoveredNode {
            display_name: node_id.to_string(),
            node_id,
            depth: 1,
        }
    }

    fn table() -> TagBindingTable {
        TagBindingTable::build(&[
            TagBinding::new("DEVICE1:TEMP1", "NS=2;S=Temp1"),
            TagBinding::new("DEVICE1:TEMP2", "ns=2;s=Temp2"),
        ])
    }

    #[test]
    fn test_plan_intersects_and_dedups() {
        let bindings = table();
        let settings = SubscriptionSettings::default();
        let plan = SubscriptionBuilder::new(&bindings, &settings).plan(vec![
            candidate(NodeId::string(2, "Temp1")),
            candidate(NodeId::string(2, "Other")),
            candidate(NodeId::string(2, "TEMP1")),
            candidate(NodeId::string(2, "Temp2")),
        ]);

        assert_eq!(plan.items.len(), 2);
        assert_eq!(plan.unmatched, 1);
        assert_eq!(plan.duplicates, 1);
        assert_eq!(plan.items[0].client_handle, 1);
        assert_eq!(plan.items[1].client_handle, 2);
        assert_eq!(plan.items[0].canonical_id, "NS=2;S=TEMP1");
    }

    #[tokio::test]
    async fn test_build_creates_items() {
        let bindings = table();
        let settings = SubscriptionSettings::default();
        let session = MockSession::standalone(MockTree::default());
        let listener = Arc::new(CountingListener::default());

        let subscription = SubscriptionBuilder::new(&bindings, &settings)
            .build(
                vec![candidate(NodeId::string(2, "Temp1"))],
                session.as_ref(),
                listener.clone(),
            )
            .await
            .unwrap();

        assert_eq!(subscription.len(), 1);
        assert_eq!(subscription.publishing_interval(), Duration::from_millis(500));
        assert!(subscription.contains(&NodeId::string(2, "temp1")));

        session.push(
            &NodeId::string(2, "Temp1"),
            vec![DataValue::without_timestamps(crate::client::OpcUaValue::Double(1.0))],
        );
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_build_excludes_rejected_item() {
        let bindings = table();
        let settings = SubscriptionSettings::default();
        let session = MockSession::standalone(MockTree::default());
        session.rejected.lock().insert(NodeId::string(2, "Temp2"));

        let subscription = SubscriptionBuilder::new(&bindings, &settings)
            .build(
                vec![
                    candidate(NodeId::string(2, "Temp1")),
                    candidate(NodeId::string(2, "Temp2")),
                ],
                session.as_ref(),
                Arc::new(CountingListener::default()),
            )
            .await
            .unwrap();

        assert_eq!(subscription.len(), 1);
        assert!(!subscription.contains(&NodeId::string(2, "Temp2")));
    }

    #[tokio::test]
    async fn test_build_service_failure_deletes_subscription() {
        let bindings = table();
        let settings = SubscriptionSettings::default();
        let session = MockSession::standalone(MockTree::default());
        session.fail_monitored_items.store(true, Ordering::SeqCst);

        let result = SubscriptionBuilder::new(&bindings, &settings)
            .build(
                vec![candidate(NodeId::string(2, "Temp1"))],
                session.as_ref(),
                Arc::new(CountingListener::default()),
            )
            .await;

        assert!(matches!(result, Err(OpcUaError::Subscription(_))));
        assert_eq!(*session.deleted.lock(), vec![7]);
    }

    #[tokio::test]
    async fn test_build_subscription_rejected() {
        let bindings = table();
        let settings = SubscriptionSettings::default();
        let session = MockSession::standalone(MockTree::default());
        session.fail_subscription.store(true, Ordering::SeqCst);

        let result = SubscriptionBuilder::new(&bindings, &settings)
            .build(Vec::new(), session.as_ref(), Arc::new(CountingListener::default()))
            .await;
        assert!(result.unwrap_err().is_retryable());
    }
}
