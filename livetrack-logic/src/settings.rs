use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, specta::Type)]
#[serde(default)]
/// Tuning knobs for location sharing
pub struct TrackingSettings {
    /// Minimum time between two location fixes
    pub min_interval_ms: u32,
    /// Minimum movement before a new fix is emitted
    pub min_distance_meters: f64,
    /// Fixes less accurate than this are dropped once the session has a position
    pub accuracy_threshold_meters: f64,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            min_interval_ms: 2000,
            min_distance_meters: 5.0,
            accuracy_threshold_meters: 200.0,
        }
    }
}
