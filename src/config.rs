//! Registry configuration.

use crate::bus::WireFormat;
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Durations are written as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Defaults applied to writes that don't override them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationDefaults {
    /// Apply writes to local observers before the bus round-trip.
    pub optimistic: bool,
    /// Publish writes on the bus.
    pub push_to_bus: bool,
}

impl Default for MutationDefaults {
    fn default() -> Self {
        Self {
            optimistic: true,
            push_to_bus: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceDetectionConfig {
    pub enabled: bool,
    /// How long touched fields are remembered per document.
    #[serde(with = "millis")]
    pub window: Duration,
    #[serde(with = "millis")]
    pub correction_delay_min: Duration,
    #[serde(with = "millis")]
    pub correction_delay_max: Duration,
    /// Fields never considered for collisions, per collection.
    pub fields_to_ignore: HashMap<String, Vec<String>>,
}

impl Default for RaceDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_millis(300),
            correction_delay_min: Duration::from_millis(100),
            correction_delay_max: Duration::from_millis(600),
            fields_to_ignore: HashMap::new(),
        }
    }
}

impl RaceDetectionConfig {
    /// History entries are garbage-collected on this interval.
    pub fn gc_interval(&self) -> Duration {
        self.window * 10
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Prepended to every channel name.
    pub channel_prefix: Option<String>,
    /// Unpinned entries idle for longer than this are evicted.
    #[serde(with = "millis")]
    pub cache_timeout: Duration,
    #[serde(with = "millis")]
    pub cache_sweep_interval: Duration,
    pub cache_max_entries: Option<usize>,
    pub mutation_defaults: MutationDefaults,
    pub race_detection: RaceDetectionConfig,
    pub wire_format: WireFormat,
    /// Another process publishes changes; this one only applies them locally.
    pub external_publisher: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel_prefix: None,
            cache_timeout: Duration::from_secs(60 * 60),
            cache_sweep_interval: Duration::from_secs(10 * 60),
            cache_max_entries: None,
            mutation_defaults: MutationDefaults::default(),
            race_detection: RaceDetectionConfig::default(),
            wire_format: WireFormat::default(),
            external_publisher: false,
        }
    }
}

impl SyncConfig {
    /// Parse from a JSON settings document. Missing keys take defaults.
    pub fn from_json(settings: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(settings)
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_sweep_interval.is_zero() {
            return Err(SyncError::InvalidConfig(
                "cache_sweep_interval must be positive".to_string(),
            ));
        }
        if self.cache_max_entries == Some(0) {
            return Err(SyncError::InvalidConfig(
                "cache_max_entries must be positive".to_string(),
            ));
        }
        let race = &self.race_detection;
        if race.enabled && race.window.is_zero() {
            return Err(SyncError::InvalidConfig(
                "race_detection.window must be positive".to_string(),
            ));
        }
        if race.correction_delay_min > race.correction_delay_max {
            return Err(SyncError::InvalidConfig(
                "race_detection.correction_delay_min exceeds correction_delay_max".to_string(),
            ));
        }
        Ok(())
    }
}
