//! Accept/reject decisions for raw GPS fixes.

use crate::config::TrackingConfig;
use crate::geo::{haversine_distance, Coordinate};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Why a sample was discarded. Reported back to the caller; nothing is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    LatitudeOutOfRange,
    LongitudeOutOfRange,
    /// Reported accuracy radius is above the threshold.
    LowAccuracy,
    /// Too far from the previous fix for a single hop; glitch or spoofing.
    ImplausibleJump,
}

impl RejectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionReason::LatitudeOutOfRange => "latitude_out_of_range",
            RejectionReason::LongitudeOutOfRange => "longitude_out_of_range",
            RejectionReason::LowAccuracy => "low_accuracy",
            RejectionReason::ImplausibleJump => "implausible_jump",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stateless sample validator. Cheap to copy and safe to share across tasks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationValidator {
    accuracy_threshold_m: f64,
    max_plausible_jump_km: f64,
}

impl Default for LocationValidator {
    fn default() -> Self {
        Self::new(&TrackingConfig::default())
    }
}

impl LocationValidator {
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            accuracy_threshold_m: config.accuracy_threshold_m,
            max_plausible_jump_km: config.max_plausible_jump_km,
        }
    }

    /// Checks a fix against the bounds, accuracy and jump rules, in that
    /// order. The first failing rule decides the reason.
    ///
    /// A non-finite accuracy value counts as low accuracy.
    pub fn validate(
        &self,
        sample: Coordinate,
        accuracy_m: Option<f64>,
        previous: Option<Coordinate>,
    ) -> Result<(), RejectionReason> {
        if !(-90.0..=90.0).contains(&sample.latitude) {
            return Err(RejectionReason::LatitudeOutOfRange);
        }
        if !(-180.0..=180.0).contains(&sample.longitude) {
            return Err(RejectionReason::LongitudeOutOfRange);
        }

        if let Some(accuracy) = accuracy_m {
            if !(accuracy <= self.accuracy_threshold_m) {
                debug!("Low GPS precision: {}m (threshold {}m)", accuracy, self.accuracy_threshold_m);
                return Err(RejectionReason::LowAccuracy);
            }
        }

        if let Some(previous) = previous {
            let jump_km = haversine_distance(previous, sample);
            if jump_km > self.max_plausible_jump_km {
                debug!("Implausible jump of {:.2} km from previous fix", jump_km);
                return Err(RejectionReason::ImplausibleJump);
            }
        }

        Ok(())
    }

    /// Boolean form of [`validate`](Self::validate).
    pub fn is_acceptable(
        &self,
        sample: Coordinate,
        accuracy_m: Option<f64>,
        previous: Option<Coordinate>,
    ) -> bool {
        self.validate(sample, accuracy_m, previous).is_ok()
    }
}
