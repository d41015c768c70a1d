// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Address space discovery.
//!
//! [`NodeDiscoverer`] walks forward hierarchical references from a root
//! container and yields every reachable variable. The walk is an explicit
//! worklist with a visited set, so deep or cyclic hierarchies cannot exhaust
//! the stack or loop forever.
//!
//! ```text
//! Objects ──┬── Server            (skipped with everything beneath it)
//!           ├── Line1 (Object) ──┬── Temp1 (Variable)   → yielded
//!           │                    └── Reset  (Method)    → observed only
//!           └── Level (Variable)                        → yielded
//! ```

use std::collections::{HashSet, VecDeque};
use std::fmt;

use tracing::{debug, info, warn};

use crate::client::{OpcUaSession, ReferenceDescription};
use crate::error::{BrowseError, OpcUaError, OpcUaResult};
use crate::types::{NodeClass, NodeClassMask, NodeId};

/// Display name of the server's self-description branch.
pub const SERVER_BRANCH_NAME: &str = "Server";

// =============================================================================
// DiscoveredNode / DiscoveryStats
// =============================================================================

/// A variable found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredNode {
    /// Node identifier as reported by the server.
    pub node_id: NodeId,
    /// Display name.
    pub display_name: String,
    /// Depth below the root (direct children are depth 1).
    pub depth: usize,
}

/// Counters of one discovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    /// References examined.
    pub nodes_visited: u64,
    /// Variables yielded.
    pub variables_yielded: u64,
    /// Objects browsed into.
    pub objects_expanded: u64,
    /// Methods seen and ignored.
    pub methods_seen: u64,
    /// Branches skipped by display name.
    pub branches_skipped: u64,
    /// Branches whose browse failed.
    pub branches_failed: u64,
    /// References to already visited nodes.
    pub revisits: u64,
}

impl fmt::Display for DiscoveryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "visited={} variables={} objects={} methods={} skipped={} failed={}",
            self.nodes_visited,
            self.variables_yielded,
            self.objects_expanded,
            self.methods_seen,
            self.branches_skipped,
            self.branches_failed
        )
    }
}

// =============================================================================
// NodeDiscoverer
// =============================================================================

/// Discovers subscribable variables below a root node.
#[derive(Debug, Clone)]
pub struct NodeDiscoverer {
    node_class_mask: NodeClassMask,
    skip_branch: String,
}

impl Default for NodeDiscoverer {
    fn default() -> Self {
        Self {
            node_class_mask: NodeClassMask::DATA_HIERARCHY,
            skip_branch: SERVER_BRANCH_NAME.to_string(),
        }
    }
}

impl NodeDiscoverer {
    /// Creates a discoverer restricted to variables, objects and methods
    /// that skips the `Server` branch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a pass by browsing `root`.
    ///
    /// Failure to browse the root aborts the pass; failures further down
    /// only skip the affected branch.
    pub async fn start<'s>(
        &self,
        session: &'s dyn OpcUaSession,
        root: &NodeId,
    ) -> OpcUaResult<DiscoveryWalk<'s>> {
        let children = session
            .browse(root, self.node_class_mask)
            .await
            .map_err(|e| match e {
                OpcUaError::Browse(_) => e,
                other => BrowseError::browse_failed(root.to_string(), other.to_string()).into(),
            })?;

        debug!(root = %root, children = children.len(), "Discovery started");

        let mut visited = HashSet::new();
        visited.insert(root.clone());

        Ok(DiscoveryWalk {
            session,
            node_class_mask: self.node_class_mask,
            skip_branch: self.skip_branch.clone(),
            frames: vec![children.into()],
            visited,
            stats: DiscoveryStats::default(),
            finished: false,
        })
    }

    /// Runs a whole pass and collects the variables.
    pub async fn discover(
        &self,
        session: &dyn OpcUaSession,
        root: &NodeId,
    ) -> OpcUaResult<(Vec<DiscoveredNode>, DiscoveryStats)> {
        let mut walk = self.start(session, root).await?;
        let mut nodes = Vec::new();
        while let Some(node) = walk.next().await {
            nodes.push(node);
        }
        Ok((nodes, walk.stats()))
    }
}

// =============================================================================
// DiscoveryWalk
// =============================================================================

/// A lazy, finite, single-use discovery pass.
///
/// Each frame holds the not yet examined children of one browsed node; the
/// top frame belongs to the most recently expanded object.
pub struct DiscoveryWalk<'s> {
    session: &'s dyn OpcUaSession,
    node_class_mask: NodeClassMask,
    skip_branch: String,
    frames: Vec<VecDeque<ReferenceDescription>>,
    visited: HashSet<NodeId>,
    stats: DiscoveryStats,
    finished: bool,
}

impl DiscoveryWalk<'_> {
    /// Returns the next variable, or `None` once the pass is exhausted.
    pub async fn next(&mut self) -> Option<DiscoveredNode> {
        loop {
            let Some(frame) = self.frames.last_mut() else {
                self.finish();
                return None;
            };
            let Some(reference) = frame.pop_front() else {
                self.frames.pop();
                continue;
            };
            let depth = self.frames.len();

            self.stats.nodes_visited += 1;

            if reference.display_name == self.skip_branch {
                self.stats.branches_skipped += 1;
                debug!(node_id = %reference.node_id, "Skipping {} branch", self.skip_branch);
                continue;
            }

            if !self.visited.insert(reference.node_id.clone()) {
                self.stats.revisits += 1;
                continue;
            }

            match reference.node_class {
                NodeClass::Variable => {
                    self.stats.variables_yielded += 1;
                    return Some(DiscoveredNode {
                        node_id: reference.node_id,
                        display_name: reference.display_name,
                        depth,
                    });
                }
                NodeClass::Object => self.expand(&reference).await,
                NodeClass::Method => self.stats.methods_seen += 1,
                _ => {}
            }
        }
    }

    async fn expand(&mut self, reference: &ReferenceDescription) {
        match self
            .session
            .browse(&reference.node_id, self.node_class_mask)
            .await
        {
            Ok(children) => {
                self.stats.objects_expanded += 1;
                if !children.is_empty() {
                    self.frames.push(children.into());
                }
            }
            Err(e) => {
                self.stats.branches_failed += 1;
                warn!(
                    node_id = %reference.node_id,
                    display_name = %reference.display_name,
                    error = %e,
                    "Browse failed, skipping branch"
                );
            }
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            info!(
                variables = self.stats.variables_yielded,
                objects = self.stats.objects_expanded,
                skipped = self.stats.branches_skipped,
                failed = self.stats.branches_failed,
                "Discovery finished"
            );
        }
    }

    /// Returns the counters so far.
    pub fn stats(&self) -> DiscoveryStats {
        self.stats
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{MockSession, MockTree};

    fn plant_tree() -> MockTree {
        let mut tree = MockTree::default();
        let objects = NodeId::OBJECTS_FOLDER;
        let server = tree.add(&objects, NodeId::SERVER, "Server", NodeClass::Object);
        tree.add(&server, NodeId::string(2, "Hidden"), "Hidden", NodeClass::Variable);
        let line = tree.add(&objects, NodeId::string(2, "Line1"), "Line1", NodeClass::Object);
        tree.add(&line, NodeId::string(2, "Temp1"), "Temp1", NodeClass::Variable);
        tree.add(&line, NodeId::string(2, "Reset"), "Reset", NodeClass::Method);
        let cell = tree.add(&line, NodeId::string(2, "Cell"), "Cell", NodeClass::Object);
        tree.add(&cell, NodeId::string(2, "Pressure"), "Pressure", NodeClass::Variable);
        tree.add(&objects, NodeId::string(2, "Level"), "Level", NodeClass::Variable);
        tree
    }

    #[tokio::test]
    async fn test_discover_variables_in_order() {
        let session = MockSession::standalone(plant_tree());
        let (nodes, stats) = NodeDiscoverer::new()
            .discover(session.as_ref(), &NodeId::OBJECTS_FOLDER)
            .await
            .unwrap();

        let names: Vec<_> = nodes.iter().map(|n| n.display_name.as_str()).collect();
        assert_eq!(names, vec!["Temp1", "Pressure", "Level"]);
        assert_eq!(nodes[1].depth, 3);
        assert_eq!(stats.variables_yielded, 3);
        assert_eq!(stats.objects_expanded, 2);
        assert_eq!(stats.methods_seen, 1);
        assert_eq!(stats.branches_skipped, 1);
    }

    #[tokio::test]
    async fn test_server_branch_never_browsed() {
        let session = MockSession::standalone(plant_tree());
        let (nodes, _) = NodeDiscoverer::new()
            .discover(session.as_ref(), &NodeId::OBJECTS_FOLDER)
            .await
            .unwrap();
        assert!(nodes.iter().all(|n| n.node_id != NodeId::string(2, "Hidden")));
        // Objects, Line1 and Cell only.
        assert_eq!(session.browse_calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cycle_terminates() {
        let mut tree = MockTree::default();
        let a = tree.add(&NodeId::OBJECTS_FOLDER, NodeId::string(2, "A"), "A", NodeClass::Object);
        let b = tree.add(&a, NodeId::string(2, "B"), "B", NodeClass::Object);
        tree.add(&b, a.clone(), "A", NodeClass::Object);
        tree.add(&b, NodeId::string(2, "V"), "V", NodeClass::Variable);
        tree.add(&a, NodeId::string(2, "V"), "V", NodeClass::Variable);

        let session = MockSession::standalone(tree);
        let (nodes, stats) = NodeDiscoverer::new()
            .discover(session.as_ref(), &NodeId::OBJECTS_FOLDER)
            .await
            .unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(stats.revisits, 2);
    }

    #[tokio::test]
    async fn test_failed_branch_is_skipped() {
        let mut tree = plant_tree();
        tree.fail(NodeId::string(2, "Line1"));
        let session = MockSession::standalone(tree);

        let (nodes, stats) = NodeDiscoverer::new()
            .discover(session.as_ref(), &NodeId::OBJECTS_FOLDER)
            .await
            .unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].display_name, "Level");
        assert_eq!(stats.branches_failed, 1);
    }

    #[tokio::test]
    async fn test_failed_root_aborts() {
        let mut tree = plant_tree();
        tree.fail(NodeId::OBJECTS_FOLDER);
        let session = MockSession::standalone(tree);

        let result = NodeDiscoverer::new()
            .start(session.as_ref(), &NodeId::OBJECTS_FOLDER)
            .await;
        assert!(matches!(result, Err(OpcUaError::Browse(_))));
    }

    #[tokio::test]
    async fn test_walk_is_lazy() {
        let session = MockSession::standalone(plant_tree());
        let discoverer = NodeDiscoverer::new();
        let mut walk = discoverer
            .start(session.as_ref(), &NodeId::OBJECTS_FOLDER)
            .await
            .unwrap();

        let first = walk.next().await.unwrap();
        assert_eq!(first.display_name, "Temp1");
        // Cell has not been browsed yet.
        assert_eq!(session.browse_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(walk.stats().variables_yielded, 1);
    }
}
