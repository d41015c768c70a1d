// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Tag bindings: which server point feeds which measurement key.

use std::collections::HashMap;

use harvest_core::MeasurementKey;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{canonicalize_identifier, NodeId};

// =============================================================================
// TagBinding
// =============================================================================

/// Binds a signal reference (node identifier) to a measurement key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagBinding {
    /// Destination measurement key.
    pub key: MeasurementKey,

    /// Node identifier as configured, e.g. `ns=2;s=Temp1`.
    pub signal_reference: String,

    /// Human-readable tag name used in diagnostics.
    #[serde(default)]
    pub label: String,
}

impl TagBinding {
    /// Creates a binding labelled with its key.
    pub fn new(key: impl Into<String>, signal_reference: impl Into<String>) -> Self {
        let key = MeasurementKey::new(key);
        Self {
            label: key.to_string(),
            key,
            signal_reference: signal_reference.into(),
        }
    }

    /// Sets the label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Returns the canonical form of the signal reference.
    pub fn canonical_reference(&self) -> String {
        canonicalize_identifier(&self.signal_reference)
    }
}

// =============================================================================
// TagBindingTable
// =============================================================================

/// Lookup table from canonical node identifier to binding.
///
/// Built once per connection attempt and read-only afterward.
#[derive(Debug, Clone, Default)]
pub struct TagBindingTable {
    bindings: HashMap<String, TagBinding>,
}

impl TagBindingTable {
    /// Builds the table, logging each link.
    ///
    /// If two bindings share a canonical reference the first one wins.
    pub fn build<'a>(bindings: impl IntoIterator<Item = &'a TagBinding>) -> Self {
        let mut table = HashMap::new();
        for binding in bindings {
            let canonical = binding.canonical_reference();
            if table.contains_key(&canonical) {
                warn!(
                    reference = %binding.signal_reference,
                    key = %binding.key,
                    "Duplicate OPC item reference {} ignored for tag {}",
                    binding.signal_reference,
                    binding.label
                );
                continue;
            }
            info!(
                reference = %binding.signal_reference,
                key = %binding.key,
                "Linking OPC item {} with tag {}",
                binding.signal_reference,
                binding.label
            );
            table.insert(canonical, binding.clone());
        }
        Self { bindings: table }
    }

    /// Resolves a node reported by the server.
    #[inline]
    pub fn resolve(&self, node_id: &NodeId) -> Option<&TagBinding> {
        self.bindings.get(&node_id.canonical())
    }

    /// Resolves an already canonical identifier.
    #[inline]
    pub fn resolve_canonical(&self, canonical_id: &str) -> Option<&TagBinding> {
        self.bindings.get(canonical_id)
    }

    /// Returns `true` if `node_id` is bound.
    #[inline]
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.resolve(node_id).is_some()
    }

    /// Number of bindings.
    #[inline]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns `true` if there are no bindings.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Iterates over the bindings in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &TagBinding> {
        self.bindings.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_case_insensitive() {
        let bindings = vec![TagBinding::new("DEVICE1:TEMP1", "NS=2;S=Temp1")];
        let table = TagBindingTable::build(&bindings);

        let binding = table.resolve(&NodeId::string(2, "Temp1")).unwrap();
        assert_eq!(binding.key.as_str(), "DEVICE1:TEMP1");
        assert!(table.contains(&NodeId::string(2, "TEMP1")));
        assert!(table.resolve_canonical("NS=2;S=TEMP1").is_some());
        assert!(!table.contains(&NodeId::string(3, "Temp1")));
    }

    #[test]
    fn test_namespace_zero_reference() {
        let bindings = vec![TagBinding::new("SERVER:STATE", "ns=0;i=2259")];
        let table = TagBindingTable::build(&bindings);
        assert!(table.contains(&NodeId::numeric(0, 2259)));
    }

    #[test]
    fn test_duplicate_first_wins() {
        let bindings = vec![
            TagBinding::new("A", "ns=2;s=x"),
            TagBinding::new("B", "NS=2;S=X"),
        ];
        let table = TagBindingTable::build(&bindings);
        assert_eq!(table.len(), 1);
        assert_eq!(table.resolve(&NodeId::string(2, "x")).unwrap().key.as_str(), "A");
    }

    #[test]
    fn test_label_defaults_to_key() {
        let binding = TagBinding::new("K", "i=1");
        assert_eq!(binding.label, "K");
        assert_eq!(binding.with_label("Pump speed").label, "Pump speed");
        assert!(TagBindingTable::default().is_empty());
    }
}
