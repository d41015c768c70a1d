// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! OPC UA transport abstraction layer.
//!
//! The adapter consumes the protocol client as an opaque capability through
//! two traits: [`OpcUaTransport`] opens sessions and re-establishes them, and
//! [`OpcUaSession`] exposes the handful of services the adapter needs.
//! Notifications travel the other way through the synchronous
//! [`KeepAliveObserver`] and [`DataChangeListener`] callbacks, which the
//! protocol layer may invoke from any thread.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::certificate::{ApplicationIdentity, PeerCertificate, TrustPolicy};
use crate::config::SubscriptionSettings;
use crate::error::{ConversionError, OpcUaResult};
use crate::subscription::MonitoredItem;
use crate::types::{NodeClass, NodeClassMask, NodeId, SecurityMode, SecurityPolicy};

// =============================================================================
// StatusCode
// =============================================================================

/// OPC UA status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

impl StatusCode {
    /// Good.
    pub const GOOD: StatusCode = StatusCode(0);
    /// Generic bad status.
    pub const BAD: StatusCode = StatusCode(0x8000_0000);
    /// BadCommunicationError.
    pub const BAD_COMMUNICATION_ERROR: StatusCode = StatusCode(0x8005_0000);
    /// BadTimeout.
    pub const BAD_TIMEOUT: StatusCode = StatusCode(0x800A_0000);
    /// BadNodeIdUnknown.
    pub const BAD_NODE_ID_UNKNOWN: StatusCode = StatusCode(0x8034_0000);
    /// BadNotConnected.
    pub const BAD_NOT_CONNECTED: StatusCode = StatusCode(0x808A_0000);
    /// BadConnectionClosed.
    pub const BAD_CONNECTION_CLOSED: StatusCode = StatusCode(0x80AE_0000);
    /// BadCertificateUntrusted.
    pub const BAD_CERTIFICATE_UNTRUSTED: StatusCode = StatusCode(0x801A_0000);
    /// UncertainNoCommunicationLastUsableValue.
    pub const UNCERTAIN_LAST_USABLE_VALUE: StatusCode = StatusCode(0x408F_0000);

    /// Returns `true` if the severity bits are Good.
    #[inline]
    pub const fn is_good(&self) -> bool {
        self.0 >> 30 == 0
    }

    /// Returns `true` if the severity bits are Uncertain.
    #[inline]
    pub const fn is_uncertain(&self) -> bool {
        self.0 >> 30 == 1
    }

    /// Returns `true` if the severity bits are Bad.
    #[inline]
    pub const fn is_bad(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

// =============================================================================
// Endpoint
// =============================================================================

/// An endpoint advertised by a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Endpoint URL.
    pub url: String,
    /// Message security mode.
    pub security_mode: SecurityMode,
    /// Security policy.
    pub security_policy: SecurityPolicy,
    /// Server-assigned relative security level; higher is stronger.
    pub security_level: u8,
    /// DER certificate the server advertised for this endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_certificate: Option<Vec<u8>>,
}

impl Endpoint {
    /// Creates an unsecured endpoint.
    pub fn unsecured(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            security_mode: SecurityMode::None,
            security_policy: SecurityPolicy::None,
            security_level: 0,
            server_certificate: None,
        }
    }

    /// Creates a secured endpoint.
    pub fn secured(
        url: impl Into<String>,
        security_mode: SecurityMode,
        security_policy: SecurityPolicy,
        security_level: u8,
    ) -> Self {
        Self {
            url: url.into(),
            security_mode,
            security_policy,
            security_level,
            server_certificate: None,
        }
    }

    /// Attaches the server certificate advertised with this endpoint.
    pub fn with_server_certificate(mut self, der: impl Into<Vec<u8>>) -> Self {
        self.server_certificate = Some(der.into());
        self
    }

    /// Describes the advertised server certificate for a trust decision.
    ///
    /// Falls back to the endpoint URL when the server sent no parsable
    /// certificate.
    pub fn peer_certificate(&self) -> PeerCertificate {
        self.server_certificate
            .as_deref()
            .and_then(PeerCertificate::from_der)
            .unwrap_or_else(|| PeerCertificate::new(format!("unidentified server at {}", self.url)))
    }

    /// Returns `true` if messages on this endpoint are signed or encrypted.
    #[inline]
    pub fn is_secured(&self) -> bool {
        !self.security_mode.is_none()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}/{}]",
            self.url, self.security_mode, self.security_policy
        )
    }
}

// =============================================================================
// SessionId / SessionRequest
// =============================================================================

/// Identity of a session instance.
///
/// Every session object the transport hands out gets a fresh id, including
/// sessions produced by [`OpcUaTransport::reconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Everything the transport needs to open a session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Selected endpoint.
    pub endpoint: Endpoint,
    /// Session name announced to the server.
    pub session_name: String,
    /// Requested session timeout.
    pub session_timeout: Duration,
    /// Local application identity.
    pub application: ApplicationIdentity,
    /// Decision for untrusted server certificates.
    pub trust: TrustPolicy,
}

// =============================================================================
// ReferenceDescription
// =============================================================================

/// A node reached through a forward hierarchical reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceDescription {
    /// Target node.
    pub node_id: NodeId,
    /// Browse name.
    pub browse_name: String,
    /// Display name.
    pub display_name: String,
    /// Node class.
    pub node_class: NodeClass,
}

impl ReferenceDescription {
    /// Creates a reference description.
    pub fn new(node_id: NodeId, display_name: impl Into<String>, node_class: NodeClass) -> Self {
        let display_name = display_name.into();
        Self {
            node_id,
            browse_name: display_name.clone(),
            display_name,
            node_class,
        }
    }
}

// =============================================================================
// OpcUaValue / DataValue
// =============================================================================

/// Value carried by a notification.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OpcUaValue {
    /// Boolean value.
    Boolean(bool),
    /// Signed byte.
    SByte(i8),
    /// Unsigned byte.
    Byte(u8),
    /// 16-bit signed integer.
    Int16(i16),
    /// 16-bit unsigned integer.
    UInt16(u16),
    /// 32-bit signed integer.
    Int32(i32),
    /// 32-bit unsigned integer.
    UInt32(u32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit unsigned integer.
    UInt64(u64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit double.
    Double(f64),
    /// String value.
    String(String),
    /// Date/time value.
    DateTime(DateTime<Utc>),
    /// GUID value.
    Guid(uuid::Uuid),
    /// Byte string.
    ByteString(Vec<u8>),
    /// Array of values.
    Array(Vec<OpcUaValue>),
    /// Null value.
    #[default]
    Null,
}

impl OpcUaValue {
    /// Returns the variant type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "Boolean",
            Self::SByte(_) => "SByte",
            Self::Byte(_) => "Byte",
            Self::Int16(_) => "Int16",
            Self::UInt16(_) => "UInt16",
            Self::Int32(_) => "Int32",
            Self::UInt32(_) => "UInt32",
            Self::Int64(_) => "Int64",
            Self::UInt64(_) => "UInt64",
            Self::Float(_) => "Float",
            Self::Double(_) => "Double",
            Self::String(_) => "String",
            Self::DateTime(_) => "DateTime",
            Self::Guid(_) => "Guid",
            Self::ByteString(_) => "ByteString",
            Self::Array(_) => "Array",
            Self::Null => "Null",
        }
    }

    /// Attempts to get the value as an f64 without parsing strings.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::SByte(v) => Some(*v as f64),
            Self::Byte(v) => Some(*v as f64),
            Self::Int16(v) => Some(*v as f64),
            Self::UInt16(v) => Some(*v as f64),
            Self::Int32(v) => Some(*v as f64),
            Self::UInt32(v) => Some(*v as f64),
            Self::Int64(v) => Some(*v as f64),
            Self::UInt64(v) => Some(*v as f64),
            Self::Float(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Converts the value to floating point.
    ///
    /// Numeric and boolean values convert directly; strings are parsed.
    pub fn to_f64(&self) -> Result<f64, ConversionError> {
        if let Some(v) = self.as_f64() {
            return Ok(v);
        }
        match self {
            Self::String(s) => s.trim().parse::<f64>().map_err(|_| ConversionError::Unparsable {
                value: s.clone(),
            }),
            other => Err(ConversionError::NotNumeric {
                type_name: other.type_name(),
            }),
        }
    }
}

impl fmt::Display for OpcUaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(v) => write!(f, "{v}"),
            Self::SByte(v) => write!(f, "{v}"),
            Self::Byte(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::UInt16(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::UInt32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
            Self::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            Self::Guid(v) => write!(f, "{v}"),
            Self::ByteString(v) => write!(f, "<{} bytes>", v.len()),
            Self::Array(v) => write!(f, "[{} items]", v.len()),
            Self::Null => write!(f, "null"),
        }
    }
}

/// One queued value of a monitored item.
#[derive(Debug, Clone, PartialEq)]
pub struct DataValue {
    /// The value.
    pub value: OpcUaValue,
    /// Status of the value.
    pub status: StatusCode,
    /// Time the source produced the value, with the offset it was reported in.
    pub source_timestamp: Option<DateTime<FixedOffset>>,
    /// Time the server processed the value.
    pub server_timestamp: Option<DateTime<FixedOffset>>,
}

impl DataValue {
    /// Creates a good value with a source timestamp.
    pub fn new(value: OpcUaValue, source_timestamp: DateTime<FixedOffset>) -> Self {
        Self {
            value,
            status: StatusCode::GOOD,
            source_timestamp: Some(source_timestamp),
            server_timestamp: None,
        }
    }

    /// Creates a good value without timestamps.
    pub fn without_timestamps(value: OpcUaValue) -> Self {
        Self {
            value,
            status: StatusCode::GOOD,
            source_timestamp: None,
            server_timestamp: None,
        }
    }

    /// Sets the server timestamp.
    pub fn with_server_timestamp(mut self, timestamp: DateTime<FixedOffset>) -> Self {
        self.server_timestamp = Some(timestamp);
        self
    }
}

// =============================================================================
// MonitoredItemResult
// =============================================================================

/// Server answer for one requested monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitoredItemResult {
    /// Client handle of the request.
    pub client_handle: u32,
    /// Per-item status.
    pub status: StatusCode,
    /// Server-assigned monitored item id.
    pub monitored_item_id: u32,
}

// =============================================================================
// Callbacks
// =============================================================================

/// Receives keep-alive signals of a session.
///
/// Invoked on a protocol-layer thread. Implementations must return quickly
/// and never wait for a reconnection.
pub trait KeepAliveObserver: Send + Sync {
    /// Called for each keep-alive with the session's health status.
    fn on_keep_alive(&self, session: SessionId, status: StatusCode);
}

/// Receives value-change notifications.
///
/// Invocations for different items may run concurrently.
pub trait DataChangeListener: Send + Sync {
    /// Called with every value queued for `item` since the last call, in
    /// arrival order.
    fn on_data_change(&self, item: &MonitoredItem, values: Vec<DataValue>);
}

// =============================================================================
// OpcUaSession / OpcUaTransport
// =============================================================================

/// A live session.
#[async_trait]
pub trait OpcUaSession: Send + Sync {
    /// Returns the identity of this session instance.
    fn id(&self) -> SessionId;

    /// Returns the endpoint the session is bound to.
    fn endpoint(&self) -> &Endpoint;

    /// Installs the keep-alive observer, replacing any previous one.
    fn set_keep_alive_observer(&self, observer: Arc<dyn KeepAliveObserver>);

    /// Returns `true` while the session is usable.
    fn is_connected(&self) -> bool;

    /// Browses forward hierarchical references of `node_id`.
    async fn browse(
        &self,
        node_id: &NodeId,
        node_class_mask: NodeClassMask,
    ) -> OpcUaResult<Vec<ReferenceDescription>>;

    /// Creates a subscription and returns its server id.
    async fn create_subscription(&self, settings: &SubscriptionSettings) -> OpcUaResult<u32>;

    /// Creates monitored items on a subscription.
    ///
    /// A service-level failure is an error. Otherwise one result per item is
    /// returned and only items with a good status deliver notifications to
    /// `listener`.
    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        items: &[Arc<MonitoredItem>],
        settings: &SubscriptionSettings,
        listener: Arc<dyn DataChangeListener>,
    ) -> OpcUaResult<Vec<MonitoredItemResult>>;

    /// Deletes a subscription and its monitored items.
    async fn delete_subscription(&self, subscription_id: u32) -> OpcUaResult<()>;

    /// Closes the session. Closing a closed session is a no-op.
    async fn close(&self) -> OpcUaResult<()>;
}

/// Entry point into the protocol stack.
#[async_trait]
pub trait OpcUaTransport: Send + Sync {
    /// Returns the endpoints advertised at `server_url`.
    async fn discover_endpoints(&self, server_url: &str) -> OpcUaResult<Vec<Endpoint>>;

    /// Opens an anonymous session.
    async fn create_session(&self, request: &SessionRequest) -> OpcUaResult<Arc<dyn OpcUaSession>>;

    /// Re-establishes `previous`, transferring its subscriptions to the
    /// returned session.
    async fn reconnect(
        &self,
        previous: Arc<dyn OpcUaSession>,
    ) -> OpcUaResult<Arc<dyn OpcUaSession>>;

    /// Returns the transport display name for logging.
    fn display_name(&self) -> String;
}

// =============================================================================
// Tests
// =============================================================================
