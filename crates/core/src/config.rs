//! Store tunables.
//!
//! All durations are stored as integer seconds / milliseconds so the
//! config round-trips through JSON without a custom duration format.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::{CorrectionError, Result};

/// Default distance between "now" and the cutoff instant: one hour of data
/// is assumed to already be committed to downstream processing.
pub const DEFAULT_CUTOFF_OFFSET_SECS: i64 = 3600;
/// Default ε used when pinning the cutoff sample.
pub const DEFAULT_FREEZE_BUFFER_MS: i64 = 1000;
/// Default half-width of the window searched by the interval fallback.
pub const DEFAULT_BOUNDARY_TOLERANCE_MS: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Seconds between "now" and the cutoff instant.
    pub cutoff_offset_secs: i64,
    /// Distance past the cutoff at which the freeze sample is pinned.
    pub freeze_buffer_ms: i64,
    /// Interval lookups that miss every interval retry with a window of
    /// this half-width around the query instant.
    pub boundary_tolerance_ms: i64,
    /// Minimum distance between two samples of the same group.
    /// `0` disables the check.
    pub min_sample_spacing_ms: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cutoff_offset_secs: DEFAULT_CUTOFF_OFFSET_SECS,
            freeze_buffer_ms: DEFAULT_FREEZE_BUFFER_MS,
            boundary_tolerance_ms: DEFAULT_BOUNDARY_TOLERANCE_MS,
            min_sample_spacing_ms: 0,
        }
    }
}

impl StoreConfig {
    /// Reject settings that would make the policies meaningless.
    ///
    /// The cutoff offset may be negative (probing a window before "now"),
    /// but the freeze buffer must place the pinned sample strictly after
    /// the cutoff, otherwise an ONLINE insert could never pass its own
    /// cutoff check after pinning.
    pub fn validate(&self) -> Result<()> {
        if self.freeze_buffer_ms <= 0 {
            return Err(CorrectionError::InvalidConfig(format!(
                "freeze_buffer_ms must be > 0, got {}",
                self.freeze_buffer_ms
            )));
        }
        if self.boundary_tolerance_ms < 0 {
            return Err(CorrectionError::InvalidConfig(format!(
                "boundary_tolerance_ms must be >= 0, got {}",
                self.boundary_tolerance_ms
            )));
        }
        if self.min_sample_spacing_ms < 0 {
            return Err(CorrectionError::InvalidConfig(format!(
                "min_sample_spacing_ms must be >= 0, got {}",
                self.min_sample_spacing_ms
            )));
        }
        Ok(())
    }

    pub fn cutoff_offset(&self) -> Duration {
        Duration::seconds(self.cutoff_offset_secs)
    }

    pub fn freeze_buffer(&self) -> Duration {
        Duration::milliseconds(self.freeze_buffer_ms)
    }

    pub fn boundary_tolerance(&self) -> Duration {
        Duration::milliseconds(self.boundary_tolerance_ms)
    }

    pub fn min_sample_spacing(&self) -> Duration {
        Duration::milliseconds(self.min_sample_spacing_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = StoreConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cutoff_offset(), Duration::hours(1));
        assert_eq!(config.freeze_buffer(), Duration::seconds(1));
        assert_eq!(config.min_sample_spacing(), Duration::zero());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: StoreConfig =
            serde_json::from_str(r#"{ "min_sample_spacing_ms": 10000 }"#).unwrap();
        assert_eq!(config.min_sample_spacing(), Duration::seconds(10));
        assert_eq!(config.cutoff_offset_secs, DEFAULT_CUTOFF_OFFSET_SECS);
    }

    #[test]
    fn non_positive_freeze_buffer_is_rejected() {
        let config = StoreConfig {
            freeze_buffer_ms: 0,
            ..StoreConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CorrectionError::InvalidConfig(_))
        ));
    }
}
