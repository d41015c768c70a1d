// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Adapter configuration.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use harvest_opcua::config::AdapterConfig;
//!
//! let config = AdapterConfig::builder()
//!     .connection_string("opc.tcp://plc-1:4840;reserved")
//!     .reconnect_grace_period(Duration::from_secs(5))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.connection_spec().unwrap().server_url, "opc.tcp://plc-1:4840");
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::certificate::{ApplicationIdentity, TrustPolicy};
use crate::error::{ConfigurationError, OpcUaError, OpcUaResult};

// =============================================================================
// ConnectionSpec
// =============================================================================

/// The parsed connection string.
///
/// The first `;`-separated field is the server address. Further fields are
/// reserved and kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSpec {
    /// Server discovery URL.
    pub server_url: String,
    /// Remaining fields, unused.
    pub reserved: Vec<String>,
}

impl ConnectionSpec {
    /// Parses a connection string.
    pub fn parse(connection_string: &str) -> OpcUaResult<Self> {
        let mut fields = connection_string.split(';').map(str::trim);
        let server_url = fields.next().unwrap_or_default();

        if server_url.is_empty() {
            return Err(ConfigurationError::invalid_connection_string(
                connection_string,
                "server address is empty",
            )
            .into());
        }

        let Some(rest) = strip_scheme(server_url) else {
            return Err(ConfigurationError::invalid_server_url(
                server_url,
                "address must start with opc.tcp://",
            )
            .into());
        };
        if rest.is_empty() || rest.starts_with(':') || rest.starts_with('/') {
            return Err(
                ConfigurationError::invalid_server_url(server_url, "missing host").into(),
            );
        }

        Ok(Self {
            server_url: server_url.to_string(),
            reserved: fields
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }
}

fn strip_scheme(url: &str) -> Option<&str> {
    const SCHEME: &str = "opc.tcp://";
    if url.len() >= SCHEME.len() && url[..SCHEME.len()].eq_ignore_ascii_case(SCHEME) {
        Some(&url[SCHEME.len()..])
    } else {
        None
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.server_url)
    }
}

// =============================================================================
// SubscriptionSettings
// =============================================================================

/// Parameters of the change-notification subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    /// Publishing interval.
    #[serde(default = "default_publishing_interval", with = "humantime_serde")]
    pub publishing_interval: Duration,

    /// Lifetime count (publishing intervals before the subscription expires).
    #[serde(default = "default_lifetime_count")]
    pub lifetime_count: u32,

    /// Max keep-alive count.
    #[serde(default = "default_keepalive_count")]
    pub keepalive_count: u32,

    /// Maximum notifications per publish (0 = unlimited).
    #[serde(default)]
    pub max_notifications_per_publish: u32,

    /// Priority.
    #[serde(default)]
    pub priority: u8,

    /// Publishing enabled.
    #[serde(default = "default_true")]
    pub publishing_enabled: bool,

    /// Sampling interval requested for each monitored item.
    #[serde(default = "default_sampling_interval", with = "humantime_serde")]
    pub sampling_interval: Duration,

    /// Server-side queue size per monitored item.
    #[serde(default = "default_queue_size")]
    pub queue_size: u32,
}

fn default_publishing_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_lifetime_count() -> u32 {
    60
}

fn default_keepalive_count() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_sampling_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_queue_size() -> u32 {
    10
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            publishing_interval: default_publishing_interval(),
            lifetime_count: default_lifetime_count(),
            keepalive_count: default_keepalive_count(),
            max_notifications_per_publish: 0,
            priority: 0,
            publishing_enabled: true,
            sampling_interval: default_sampling_interval(),
            queue_size: default_queue_size(),
        }
    }
}

impl SubscriptionSettings {
    /// Sets the publishing interval.
    pub fn with_publishing_interval(mut self, interval: Duration) -> Self {
        self.publishing_interval = interval;
        self
    }
}

// =============================================================================
// RetryPolicy
// =============================================================================

/// Strategy for delays between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Fixed delay.
    Fixed,

    /// Linear backoff (delay * attempt).
    Linear,

    /// Exponential backoff (delay * 2^attempt).
    #[default]
    Exponential,
}

impl RetryStrategy {
    /// Calculates the delay for a zero-based attempt number.
    pub fn delay(&self, base_delay: Duration, attempt: u32) -> Duration {
        match self {
            Self::Fixed => base_delay,
            Self::Linear => base_delay.saturating_mul(attempt.saturating_add(1)),
            Self::Exponential => base_delay.saturating_mul(2u32.saturating_pow(attempt)),
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed => write!(f, "Fixed"),
            Self::Linear => write!(f, "Linear"),
            Self::Exponential => write!(f, "Exponential"),
        }
    }
}

/// Retry policy of the outer connection loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Strategy.
    #[serde(default)]
    pub strategy: RetryStrategy,

    /// Base delay.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Attempts before giving up; 0 retries forever.
    #[serde(default)]
    pub max_attempts: u32,
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            max_attempts: 0,
        }
    }
}

impl RetryPolicy {
    /// Creates a fixed-delay policy.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
            max_attempts: 0,
        }
    }

    /// Sets the attempt limit.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Calculates the delay after the given zero-based failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.strategy.delay(self.base_delay, attempt).min(self.max_delay)
    }

    /// Returns `true` if another attempt is allowed after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }
}

// =============================================================================
// AdapterConfig
// =============================================================================

/// Complete configuration of one adapter instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Device name used in status messages.
    #[serde(default = "default_name")]
    pub name: String,

    /// Connection string; the first `;` field is the server address.
    pub connection_string: String,

    /// Local application identity.
    #[serde(default)]
    pub application: ApplicationIdentity,

    /// Accept server certificates that do not chain to a trusted root.
    #[serde(default)]
    pub auto_accept_untrusted_certificates: bool,

    /// Session name announced to the server.
    #[serde(default = "default_session_name")]
    pub session_name: String,

    /// Requested session timeout.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Bound on endpoint discovery.
    #[serde(default = "default_discovery_timeout", with = "humantime_serde")]
    pub endpoint_discovery_timeout: Duration,

    /// Prefer secured endpoints.
    #[serde(default)]
    pub use_security: bool,

    /// Subscription parameters.
    #[serde(default)]
    pub subscription: SubscriptionSettings,

    /// Wait before asking the protocol layer to re-establish a session.
    #[serde(default = "default_reconnect_grace_period", with = "humantime_serde")]
    pub reconnect_grace_period: Duration,

    /// Outer connection loop retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_name() -> String {
    "opcua".to_string()
}

fn default_session_name() -> String {
    "OpenHistorian Data Collector".to_string()
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_discovery_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_reconnect_grace_period() -> Duration {
    Duration::from_secs(10)
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            connection_string: String::new(),
            application: ApplicationIdentity::default(),
            auto_accept_untrusted_certificates: false,
            session_name: default_session_name(),
            session_timeout: default_session_timeout(),
            endpoint_discovery_timeout: default_discovery_timeout(),
            use_security: false,
            subscription: SubscriptionSettings::default(),
            reconnect_grace_period: default_reconnect_grace_period(),
            retry: RetryPolicy::default(),
        }
    }
}

impl AdapterConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> AdapterConfigBuilder {
        AdapterConfigBuilder::default()
    }

    /// Creates a configuration with defaults for everything but the
    /// connection string.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Default::default()
        }
    }

    /// Parses the connection string.
    pub fn connection_spec(&self) -> OpcUaResult<ConnectionSpec> {
        ConnectionSpec::parse(&self.connection_string)
    }

    /// Returns the server certificate trust policy.
    pub fn trust_policy(&self) -> TrustPolicy {
        TrustPolicy::new(self.auto_accept_untrusted_certificates)
    }

    /// Validates this configuration.
    ///
    /// Credential files are not inspected here; that happens when the
    /// adapter initializes and before every connection attempt.
    pub fn validate(&self) -> Result<(), OpcUaError> {
        self.connection_spec()?;

        if self.name.trim().is_empty() {
            return Err(invalid("name", "must not be empty"));
        }
        if self.session_name.trim().is_empty() {
            return Err(invalid("session_name", "must not be empty"));
        }
        if self.session_timeout.is_zero() {
            return Err(invalid("session_timeout", "must be greater than 0"));
        }
        if self.endpoint_discovery_timeout.is_zero() {
            return Err(invalid("endpoint_discovery_timeout", "must be greater than 0"));
        }
        if self.subscription.publishing_interval.is_zero() {
            return Err(invalid(
                "subscription.publishing_interval",
                "must be greater than 0",
            ));
        }
        if self.subscription.queue_size == 0 {
            return Err(invalid("subscription.queue_size", "must be at least 1"));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(invalid("retry.base_delay", "must not exceed retry.max_delay"));
        }
        if self.application.application_name.trim().is_empty() {
            return Err(invalid("application.application_name", "must not be empty"));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> OpcUaError {
    ConfigurationError::invalid_value(field, reason).into()
}

// =============================================================================
// AdapterConfigBuilder
// =============================================================================

/// Builder for [`AdapterConfig`].
#[derive(Debug, Default)]
pub struct AdapterConfigBuilder {
    config: AdapterConfig,
}

impl AdapterConfigBuilder {
    /// Sets the device name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Sets the connection string.
    pub fn connection_string(mut self, value: impl Into<String>) -> Self {
        self.config.connection_string = value.into();
        self
    }

    /// Sets the application identity.
    pub fn application(mut self, identity: ApplicationIdentity) -> Self {
        self.config.application = identity;
        self
    }

    /// Sets the auto-accept flag.
    pub fn auto_accept_untrusted_certificates(mut self, auto_accept: bool) -> Self {
        self.config.auto_accept_untrusted_certificates = auto_accept;
        self
    }

    /// Sets the session name.
    pub fn session_name(mut self, name: impl Into<String>) -> Self {
        self.config.session_name = name.into();
        self
    }

    /// Sets the session timeout.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    /// Sets the endpoint discovery timeout.
    pub fn endpoint_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.endpoint_discovery_timeout = timeout;
        self
    }

    /// Prefers secured endpoints.
    pub fn use_security(mut self, use_security: bool) -> Self {
        self.config.use_security = use_security;
        self
    }

    /// Sets the subscription settings.
    pub fn subscription(mut self, settings: SubscriptionSettings) -> Self {
        self.config.subscription = settings;
        self
    }

    /// Sets the reconnect grace period.
    pub fn reconnect_grace_period(mut self, period: Duration) -> Self {
        self.config.reconnect_grace_period = period;
        self
    }

    /// Sets the retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<AdapterConfig, OpcUaError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// =============================================================================
// Tests
// =============================================================================
