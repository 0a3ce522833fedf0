//! Incremental distance and speed for a new fix relative to the user's track.

use crate::config::TrackingConfig;
use crate::geo::{haversine_distance, Coordinate};
use crate::models::LocationSample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Why a sample's movement was not counted. The sample itself is still stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseReason {
    /// Displacement below the minimum distance threshold.
    TooClose,
    /// Less than the minimum interval since the previous fix.
    TooSoon,
}

impl NoiseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            NoiseReason::TooClose => "too_close",
            NoiseReason::TooSoon => "too_soon",
        }
    }
}

impl fmt::Display for NoiseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NoiseReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "too_close" => Ok(NoiseReason::TooClose),
            "too_soon" => Ok(NoiseReason::TooSoon),
            other => Err(format!("unknown noise reason '{other}'")),
        }
    }
}

/// Movement attributed to one new fix.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Movement {
    /// Distance credited to the user's totals; 0 when suppressed.
    pub distance_km: f64,
    /// Speed from the previous fix, clamped to the configured maximum.
    pub speed_kmh: f64,
    pub noise: Option<NoiseReason>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementEstimator {
    min_distance_threshold_km: f64,
    min_sample_interval_s: f64,
    max_speed_kmh: f64,
}

impl Default for MovementEstimator {
    fn default() -> Self {
        Self::new(&TrackingConfig::default())
    }
}

impl MovementEstimator {
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            min_distance_threshold_km: config.min_distance_threshold_km,
            min_sample_interval_s: config.min_sample_interval_s as f64,
            max_speed_kmh: config.max_speed_kmh,
        }
    }

    /// Estimates movement from `last` to `sample` at ingestion time `now`.
    ///
    /// Without a previous fix there is no movement at all. Elapsed time is
    /// measured from the stored timestamp to `now`; a clock that went
    /// backwards counts as zero elapsed time.
    pub fn estimate(
        &self,
        last: Option<&LocationSample>,
        sample: Coordinate,
        now: DateTime<Utc>,
    ) -> Movement {
        let Some(last) = last else {
            return Movement::default();
        };

        let raw_km = haversine_distance(last.coordinate(), sample);
        let elapsed_s = ((now - last.timestamp).num_milliseconds() as f64 / 1000.0).max(0.0);

        let noise = if raw_km < self.min_distance_threshold_km {
            Some(NoiseReason::TooClose)
        } else if elapsed_s < self.min_sample_interval_s {
            Some(NoiseReason::TooSoon)
        } else {
            None
        };

        let movement = Movement {
            distance_km: if noise.is_some() { 0.0 } else { raw_km },
            speed_kmh: self.speed_kmh(raw_km, elapsed_s / 3600.0),
            noise,
        };
        debug!(
            "Movement for user {}: raw {:.4} km over {:.1}s -> {:?}",
            last.user_id, raw_km, elapsed_s, movement
        );
        movement
    }

    /// Speed in km/h, clamped to `[0, max_speed_kmh]`. Zero elapsed time gives 0.
    pub fn speed_kmh(&self, distance_km: f64, elapsed_hours: f64) -> f64 {
        if elapsed_hours <= 0.0 {
            return 0.0;
        }
        let speed = distance_km / elapsed_hours;
        if speed.is_nan() {
            return 0.0;
        }
        speed.clamp(0.0, self.max_speed_kmh)
    }
}
