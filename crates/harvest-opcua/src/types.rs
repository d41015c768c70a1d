// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! OPC UA identifiers and protocol enums.
//!
//! - **NodeId**: node identifiers with parsing and the canonical form used
//!   for tag matching
//! - **NodeClass / NodeClassMask**: node classes and browse filters
//! - **SecurityMode / SecurityPolicy**: endpoint security descriptors
//!
//! # Examples
//!
//! ```
//! use harvest_opcua::types::{canonicalize_identifier, NodeId};
//!
//! let node: NodeId = "ns=2;s=Temp1".parse().unwrap();
//! assert_eq!(node.canonical(), "NS=2;S=TEMP1");
//! assert_eq!(canonicalize_identifier("ns=2;s=Temp1"), node.canonical());
//! ```

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigurationError, OpcUaError};

// =============================================================================
// Identifier canonicalization
// =============================================================================

/// Returns the canonical form of a point identifier.
///
/// The same function is applied to configured signal references when the
/// binding table is built and to node identifiers reported by the server at
/// lookup time, so casing differences between the two never matter.
///
/// The canonical form is trimmed and upper-cased. An explicit `ns=0;` prefix
/// is dropped because servers report namespace 0 identifiers without it.
pub fn canonicalize_identifier(identifier: &str) -> String {
    let upper = identifier.trim().to_uppercase();
    match upper.strip_prefix("NS=0;") {
        Some(rest) => rest.to_string(),
        None => upper,
    }
}

// =============================================================================
// NodeId
// =============================================================================

/// OPC UA node identifier.
///
/// # Examples
///
/// ```
/// use harvest_opcua::types::NodeId;
///
/// let numeric = NodeId::numeric(0, 85);
/// assert_eq!(numeric.to_string(), "i=85");
///
/// let parsed: NodeId = "ns=2;s=Line1.Temp".parse().unwrap();
/// assert_eq!(parsed, NodeId::string(2, "Line1.Temp"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    /// Namespace index (0 = OPC UA standard namespace).
    pub namespace_index: u16,

    /// The node identifier.
    pub identifier: NodeIdentifier,
}

impl NodeId {
    /// Creates a numeric node ID.
    #[inline]
    pub fn numeric(namespace_index: u16, value: u32) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Numeric(value),
        }
    }

    /// Creates a string node ID.
    #[inline]
    pub fn string(namespace_index: u16, value: impl Into<String>) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::String(value.into()),
        }
    }

    /// Creates a GUID node ID.
    #[inline]
    pub fn guid(namespace_index: u16, value: Uuid) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Guid(value),
        }
    }

    /// Creates an opaque (byte string) node ID.
    #[inline]
    pub fn opaque(namespace_index: u16, value: Vec<u8>) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Opaque(value),
        }
    }

    // =========================================================================
    // Standard Node IDs
    // =========================================================================

    /// Root folder node (ns=0, i=84).
    pub const ROOT_FOLDER: NodeId = NodeId {
        namespace_index: 0,
        identifier: NodeIdentifier::Numeric(84),
    };

    /// Objects folder node (ns=0, i=85).
    pub const OBJECTS_FOLDER: NodeId = NodeId {
        namespace_index: 0,
        identifier: NodeIdentifier::Numeric(85),
    };

    /// Server node (ns=0, i=2253).
    pub const SERVER: NodeId = NodeId {
        namespace_index: 0,
        identifier: NodeIdentifier::Numeric(2253),
    };

    /// HierarchicalReferences reference type (ns=0, i=33).
    pub const HIERARCHICAL_REFERENCES: NodeId = NodeId {
        namespace_index: 0,
        identifier: NodeIdentifier::Numeric(33),
    };

    /// Returns the string value if this is a string identifier.
    #[inline]
    pub fn as_string(&self) -> Option<&str> {
        match &self.identifier {
            NodeIdentifier::String(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the numeric value if this is a numeric identifier.
    #[inline]
    pub fn as_numeric(&self) -> Option<u32> {
        match &self.identifier {
            NodeIdentifier::Numeric(v) => Some(*v),
            _ => None,
        }
    }

    /// Converts to the OPC UA string format.
    ///
    /// Format: `ns=<namespace>;{i|s|g|b}=<identifier>`, with the namespace
    /// omitted for namespace 0.
    pub fn to_opc_string(&self) -> String {
        if self.namespace_index == 0 {
            self.identifier.to_string()
        } else {
            format!("ns={};{}", self.namespace_index, self.identifier)
        }
    }

    /// Returns the canonical identifier used for tag matching.
    pub fn canonical(&self) -> String {
        canonicalize_identifier(&self.to_opc_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_opc_string())
    }
}

impl FromStr for NodeId {
    type Err = OpcUaError;

    /// Parses a NodeId from OPC UA string format.
    ///
    /// Prefixes are matched case-insensitively (`NS=2;S=Temp1` is accepted);
    /// the identifier value keeps its case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |reason: String| {
            OpcUaError::Configuration(ConfigurationError::invalid_node_id(s, reason))
        };

        let (namespace_index, identifier_part) = if has_prefix(s, "ns=") {
            let Some((ns_part, rest)) = s.split_once(';') else {
                return Err(invalid("Missing identifier after namespace".into()));
            };
            let ns = ns_part[3..]
                .parse::<u16>()
                .map_err(|_| invalid("Invalid namespace index".into()))?;
            (ns, rest)
        } else {
            (0, s)
        };

        if identifier_part.len() < 2 || identifier_part.as_bytes()[1] != b'=' {
            return Err(invalid(
                "Unknown identifier type. Expected i=, s=, g=, or b=".into(),
            ));
        }
        let value = &identifier_part[2..];

        let identifier = match identifier_part.as_bytes()[0].to_ascii_lowercase() {
            b'i' => NodeIdentifier::Numeric(
                value
                    .parse()
                    .map_err(|_| invalid("Invalid numeric identifier".into()))?,
            ),
            b's' => NodeIdentifier::String(value.to_string()),
            b'g' => NodeIdentifier::Guid(
                Uuid::parse_str(value).map_err(|e| invalid(format!("Invalid GUID: {e}")))?,
            ),
            b'b' => NodeIdentifier::Opaque(
                BASE64
                    .decode(value)
                    .map_err(|e| invalid(format!("Invalid base64: {e}")))?,
            ),
            _ => {
                return Err(invalid(
                    "Unknown identifier type. Expected i=, s=, g=, or b=".into(),
                ));
            }
        };

        Ok(Self {
            namespace_index,
            identifier,
        })
    }
}

fn has_prefix(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}

// =============================================================================
// NodeIdentifier
// =============================================================================

/// The four OPC UA identifier kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum NodeIdentifier {
    /// Numeric identifier.
    Numeric(u32),
    /// String identifier.
    String(String),
    /// GUID identifier.
    Guid(Uuid),
    /// Opaque byte string identifier.
    Opaque(Vec<u8>),
}

impl fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(v) => write!(f, "i={v}"),
            Self::String(v) => write!(f, "s={v}"),
            Self::Guid(v) => write!(f, "g={v}"),
            Self::Opaque(v) => write!(f, "b={}", BASE64.encode(v)),
        }
    }
}

// =============================================================================
// NodeClass
// =============================================================================

/// OPC UA node class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeClass {
    /// Object node.
    Object,
    /// Variable node.
    Variable,
    /// Method node.
    Method,
    /// Object type node.
    ObjectType,
    /// Variable type node.
    VariableType,
    /// Reference type node.
    ReferenceType,
    /// Data type node.
    DataType,
    /// View node.
    View,
}

impl NodeClass {
    /// Returns the OPC UA bit mask value.
    pub const fn value(&self) -> u32 {
        match self {
            Self::Object => 1,
            Self::Variable => 2,
            Self::Method => 4,
            Self::ObjectType => 8,
            Self::VariableType => 16,
            Self::ReferenceType => 32,
            Self::DataType => 64,
            Self::View => 128,
        }
    }

    /// Creates from OPC UA value.
    pub fn from_value(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Object),
            2 => Some(Self::Variable),
            4 => Some(Self::Method),
            8 => Some(Self::ObjectType),
            16 => Some(Self::VariableType),
            32 => Some(Self::ReferenceType),
            64 => Some(Self::DataType),
            128 => Some(Self::View),
            _ => None,
        }
    }
}

/// Node class filter for browse requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeClassMask(u32);

impl NodeClassMask {
    /// Matches every node class.
    pub const ALL: NodeClassMask = NodeClassMask(0);

    /// Variables, objects and methods.
    pub const DATA_HIERARCHY: NodeClassMask = NodeClassMask(
        NodeClass::Variable.value() | NodeClass::Object.value() | NodeClass::Method.value(),
    );

    /// Creates a mask from node classes.
    pub fn of(classes: &[NodeClass]) -> Self {
        Self(classes.iter().fold(0, |mask, class| mask | class.value()))
    }

    /// Returns the raw OPC UA mask.
    #[inline]
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Returns `true` if `class` passes the filter.
    pub fn contains(&self, class: NodeClass) -> bool {
        self.0 == 0 || self.0 & class.value() != 0
    }
}

// =============================================================================
// SecurityMode
// =============================================================================

/// Message security mode of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// No security.
    #[default]
    None,
    /// Messages are signed.
    Sign,
    /// Messages are signed and encrypted.
    SignAndEncrypt,
}

impl SecurityMode {
    /// Returns `true` if this mode provides no security.
    #[inline]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Returns the display name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Sign => "Sign",
            Self::SignAndEncrypt => "SignAndEncrypt",
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// SecurityPolicy
// =============================================================================

/// Security policy of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityPolicy {
    /// No security policy.
    #[default]
    None,
    /// Basic128Rsa15 (deprecated).
    Basic128Rsa15,
    /// Basic256 (deprecated).
    Basic256,
    /// Basic256Sha256.
    Basic256Sha256,
    /// Aes128Sha256RsaOaep.
    Aes128Sha256RsaOaep,
    /// Aes256Sha256RsaPss.
    Aes256Sha256RsaPss,
    /// A policy this crate does not know, kept by URI.
    Other(String),
}

impl SecurityPolicy {
    /// Returns the OPC UA policy URI.
    pub fn uri(&self) -> &str {
        match self {
            Self::None => "http://opcfoundation.org/UA/SecurityPolicy#None",
            Self::Basic128Rsa15 => "http://opcfoundation.org/UA/SecurityPolicy#Basic128Rsa15",
            Self::Basic256 => "http://opcfoundation.org/UA/SecurityPolicy#Basic256",
            Self::Basic256Sha256 => "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256",
            Self::Aes128Sha256RsaOaep => {
                "http://opcfoundation.org/UA/SecurityPolicy#Aes128_Sha256_RsaOaep"
            }
            Self::Aes256Sha256RsaPss => {
                "http://opcfoundation.org/UA/SecurityPolicy#Aes256_Sha256_RsaPss"
            }
            Self::Other(uri) => uri,
        }
    }

    /// Creates from URI.
    pub fn from_uri(uri: &str) -> Self {
        match uri {
            s if s.ends_with("#None") => Self::None,
            s if s.ends_with("#Basic128Rsa15") => Self::Basic128Rsa15,
            s if s.ends_with("#Basic256") => Self::Basic256,
            s if s.ends_with("#Basic256Sha256") => Self::Basic256Sha256,
            s if s.contains("Aes128_Sha256_RsaOaep") => Self::Aes128Sha256RsaOaep,
            s if s.contains("Aes256_Sha256_RsaPss") => Self::Aes256Sha256RsaPss,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.uri().rsplit_once('#') {
            Some((_, name)) => f.write_str(name),
            None => f.write_str(self.uri()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_identifier() {
        assert_eq!(canonicalize_identifier("ns=2;s=Temp1"), "NS=2;S=TEMP1");
        assert_eq!(canonicalize_identifier("  NS=2;S=Temp1 "), "NS=2;S=TEMP1");
        assert_eq!(canonicalize_identifier("ns=0;i=2253"), "I=2253");
        assert_eq!(canonicalize_identifier("i=2253"), "I=2253");
        assert_eq!(
            canonicalize_identifier(&canonicalize_identifier("ns=2;s=a")),
            canonicalize_identifier("ns=2;s=a")
        );
    }

    #[test]
    fn test_node_canonical_matches_reference() {
        let node = NodeId::string(2, "Temp1");
        assert_eq!(node.canonical(), canonicalize_identifier("NS=2;S=Temp1"));
        assert_eq!(NodeId::SERVER.canonical(), canonicalize_identifier("ns=0;i=2253"));
    }

    #[test]
    fn test_parse_node_id() {
        assert_eq!("ns=2;i=1001".parse::<NodeId>().unwrap(), NodeId::numeric(2, 1001));
        assert_eq!("i=85".parse::<NodeId>().unwrap(), NodeId::OBJECTS_FOLDER);
        assert_eq!(
            "NS=2;S=Temp1".parse::<NodeId>().unwrap(),
            NodeId::string(2, "Temp1")
        );
        assert_eq!(
            "ns=1;b=SGVsbG8=".parse::<NodeId>().unwrap(),
            NodeId::opaque(1, b"Hello".to_vec())
        );
        let guid = "ns=3;g=550e8400-e29b-41d4-a716-446655440000"
            .parse::<NodeId>()
            .unwrap();
        assert!(matches!(guid.identifier, NodeIdentifier::Guid(_)));
    }

    #[test]
    fn test_parse_node_id_errors() {
        assert!("ns=2".parse::<NodeId>().is_err());
        assert!("ns=x;i=1".parse::<NodeId>().is_err());
        assert!("ns=2;x=1".parse::<NodeId>().is_err());
        assert!("ns=2;i=abc".parse::<NodeId>().is_err());
        assert!("".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for text in ["ns=2;s=Line.1", "i=85", "ns=4;i=7"] {
            let node: NodeId = text.parse().unwrap();
            assert_eq!(node.to_string(), text);
        }
    }

    #[test]
    fn test_node_class_mask() {
        let mask = NodeClassMask::DATA_HIERARCHY;
        assert_eq!(mask.bits(), 7);
        assert!(mask.contains(NodeClass::Variable));
        assert!(mask.contains(NodeClass::Method));
        assert!(!mask.contains(NodeClass::View));
        assert!(NodeClassMask::ALL.contains(NodeClass::View));
        assert_eq!(NodeClassMask::of(&[NodeClass::Object, NodeClass::Variable]).bits(), 3);
    }

    #[test]
    fn test_security_policy_uri() {
        let policy =
            SecurityPolicy::from_uri("http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256");
        assert_eq!(policy, SecurityPolicy::Basic256Sha256);
        assert_eq!(policy.to_string(), "Basic256Sha256");
        assert_eq!(SecurityPolicy::from_uri(SecurityPolicy::None.uri()), SecurityPolicy::None);
        assert!(matches!(SecurityPolicy::from_uri("urn:custom"), SecurityPolicy::Other(_)));
    }
}
