// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! On-disk configuration document.
//!
//! ```yaml
//! adapter:
//!   name: Device1
//!   connection_string: "opc.tcp://plc-1:4840"
//!   application:
//!     certificate_path: pki/own/cert.der
//!     private_key_path: pki/private/private.pem
//!   auto_accept_untrusted_certificates: false
//!   reconnect_grace_period: 10s
//!
//! measurements:
//!   - key: "DEVICE1:TEMP1"
//!     signal_reference: "ns=2;s=Temp1"
//!     label: "Boiler temperature"
//!
//! logging:
//!   level: info
//!   format: text
//!
//! status_interval: 30s
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use harvest_opcua::{AdapterConfig, TagBinding};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

// =============================================================================
// HarvestConfig
// =============================================================================

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Adapter settings.
    pub adapter: AdapterConfig,

    /// Tag bindings.
    #[serde(default)]
    pub measurements: Vec<TagBinding>,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// How often the status line is logged.
    #[serde(default = "default_status_interval", with = "humantime_serde")]
    pub status_interval: Duration,
}

fn default_status_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterConfig::default(),
            measurements: Vec::new(),
            logging: LoggingConfig::default(),
            status_interval: default_status_interval(),
        }
    }
}

impl HarvestConfig {
    /// Validates the whole document.
    pub fn validate(&self) -> ConfigResult<()> {
        self.adapter.validate()?;

        if self.status_interval.is_zero() {
            return Err(ConfigError::validation(
                "status_interval",
                "must be greater than 0",
            ));
        }

        let mut seen: HashMap<String, &TagBinding> = HashMap::new();
        for (i, binding) in self.measurements.iter().enumerate() {
            if binding.key.as_str().trim().is_empty() {
                return Err(ConfigError::validation(
                    format!("measurements[{i}].key"),
                    "must not be empty",
                ));
            }
            if binding.signal_reference.trim().is_empty() {
                return Err(ConfigError::validation(
                    format!("measurements[{i}].signal_reference"),
                    "must not be empty",
                ));
            }
            if let Some(first) = seen.insert(binding.canonical_reference(), binding) {
                return Err(ConfigError::duplicate_reference(
                    &binding.signal_reference,
                    first.key.as_str(),
                    binding.key.as_str(),
                ));
            }
        }

        Ok(())
    }

    /// Returns the tag bindings, labelling unlabelled ones with their key.
    pub fn bindings(&self) -> Vec<TagBinding> {
        self.measurements
            .iter()
            .map(|binding| {
                if binding.label.trim().is_empty() {
                    binding.clone().with_label(binding.key.as_str())
                } else {
                    binding.clone()
                }
            })
            .collect()
    }
}

// =============================================================================
// Logging Configuration
// =============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default)]
    pub level: LogLevel,

    /// Log format.
    #[serde(default)]
    pub format: LogFormat,
}

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl LogLevel {
    /// Returns the filter directive for this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
    /// Compact single-line text.
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> AdapterConfig {
        AdapterConfig::new("opc.tcp://plc-1:4840")
    }

    #[test]
    fn test_default_status_interval() {
        let config = HarvestConfig::default();
        assert_eq!(config.status_interval, Duration::from_secs(30));
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_validate_accepts_bindings() {
        let config = HarvestConfig {
            adapter: adapter(),
            measurements: vec![
                TagBinding::new("DEVICE1:TEMP1", "ns=2;s=Temp1"),
                TagBinding::new("DEVICE1:TEMP2", "ns=2;s=Temp2"),
            ],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_key() {
        let config = HarvestConfig {
            adapter: adapter(),
            measurements: vec![TagBinding::new(" ", "ns=2;s=Temp1")],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Validation { ref field, .. } if field == "measurements[0].key"
        ));
    }

    #[test]
    fn test_validate_rejects_empty_reference() {
        let config = HarvestConfig {
            adapter: adapter(),
            measurements: vec![
                TagBinding::new("A", "ns=2;s=A"),
                TagBinding::new("B", ""),
            ],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Validation { ref field, .. } if field == "measurements[1].signal_reference"
        ));
    }

    #[test]
    fn test_validate_rejects_duplicates_ignoring_case() {
        let config = HarvestConfig {
            adapter: adapter(),
            measurements: vec![
                TagBinding::new("K1", "ns=2;s=Temp1"),
                TagBinding::new("K2", "NS=2;S=TEMP1"),
            ],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::DuplicateReference { ref first, ref second, .. }
                if first == "K1" && second == "K2"
        ));
    }

    #[test]
    fn test_validate_adapter_section() {
        let config = HarvestConfig {
            adapter: AdapterConfig::new("http://plc-1"),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Adapter(_))));
    }

    #[test]
    fn test_validate_rejects_zero_status_interval() {
        let config = HarvestConfig {
            adapter: adapter(),
            status_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bindings_default_label() {
        let mut unlabelled = TagBinding::new("DEVICE1:TEMP1", "ns=2;s=Temp1");
        unlabelled.label.clear();
        let config = HarvestConfig {
            adapter: adapter(),
            measurements: vec![
                unlabelled,
                TagBinding::new("DEVICE1:TEMP2", "ns=2;s=Temp2").with_label("Outlet"),
            ],
            ..Default::default()
        };

        let bindings = config.bindings();
        assert_eq!(bindings[0].label, "DEVICE1:TEMP1");
        assert_eq!(bindings[1].label, "Outlet");
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("TRACE".parse::<LogLevel>(), Ok(LogLevel::Trace));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!(" error ".parse::<LogLevel>(), Ok(LogLevel::Error));
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Debug.to_string(), "debug");
    }
}
