// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Measurement records handed to the downstream pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// MeasurementKey
// =============================================================================

/// Destination key of a measurement in the time-series pipeline.
///
/// Keys are opaque to the adapter; they are compared verbatim.
///
/// # Examples
///
/// ```
/// use harvest_core::types::MeasurementKey;
///
/// let key = MeasurementKey::new("DEVICE1:TEMP1");
/// assert_eq!(key.as_str(), "DEVICE1:TEMP1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeasurementKey(String);

impl MeasurementKey {
    /// Creates a new measurement key.
    #[inline]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the key and returns the inner string.
    #[inline]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for MeasurementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MeasurementKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MeasurementKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for MeasurementKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// MeasurementQuality
// =============================================================================

/// Quality flag attached to a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementQuality {
    /// Value was received normally from the source.
    Normal,

    /// Quality could not be determined.
    #[default]
    Unknown,
}

impl MeasurementQuality {
    /// Returns `true` for [`MeasurementQuality::Normal`].
    #[inline]
    pub fn is_normal(&self) -> bool {
        matches!(self, Self::Normal)
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MeasurementQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Measurement
// =============================================================================

/// A single timestamped value bound for the time-series pipeline.
///
/// Measurements are created per notification and handed straight to the
/// sink; the adapter keeps no reference to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Destination key.
    pub key: MeasurementKey,

    /// Value converted to floating point.
    pub value: f64,

    /// Source time reported by the server, in UTC.
    pub timestamp: DateTime<Utc>,

    /// Quality flag.
    pub quality: MeasurementQuality,
}

impl Measurement {
    /// Creates a measurement with [`MeasurementQuality::Normal`].
    pub fn normal(key: MeasurementKey, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            key,
            value,
            timestamp,
            quality: MeasurementQuality::Normal,
        }
    }

    /// Creates a measurement with an explicit quality flag.
    pub fn with_quality(
        key: MeasurementKey,
        value: f64,
        timestamp: DateTime<Utc>,
        quality: MeasurementQuality,
    ) -> Self {
        Self {
            key,
            value,
            timestamp,
            quality,
        }
    }

    /// Returns the age of this measurement relative to now.
    #[inline]
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.timestamp
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} = {} [{}] @ {}",
            self.key,
            self.value,
            self.quality,
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f")
        )
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_measurement_key() {
        let key = MeasurementKey::from("DEVICE1:TEMP1");
        assert_eq!(key.as_str(), "DEVICE1:TEMP1");
        assert_eq!(key.to_string(), "DEVICE1:TEMP1");
        assert_ne!(key, MeasurementKey::new("device1:temp1"));
    }

    #[test]
    fn test_quality_default_is_unknown() {
        assert_eq!(MeasurementQuality::default(), MeasurementQuality::Unknown);
        assert!(MeasurementQuality::Normal.is_normal());
        assert!(!MeasurementQuality::Unknown.is_normal());
    }

    #[test]
    fn test_measurement_display() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let m = Measurement::normal(MeasurementKey::new("PPA:1"), 21.5, ts);
        assert_eq!(m.to_string(), "PPA:1 = 21.5 [normal] @ 2024-03-01 12:30:00.000");
    }

    #[test]
    fn test_measurement_serde() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let m = Measurement::normal(MeasurementKey::new("PPA:1"), 1.0, ts);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["key"], "PPA:1");
        assert_eq!(json["quality"], "normal");

        let back: Measurement = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }
}
