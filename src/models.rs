use crate::geo::Coordinate;
use crate::movement::NoiseReason;
use crate::validator::RejectionReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type UserId = i64;

/// Rank label derived from cumulative points. Ordered lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankTier {
    #[default]
    Bronze,
    Silver,
    Gold,
    Platinum,
    Diamond,
}

impl RankTier {
    pub const ALL: [RankTier; 5] = [
        RankTier::Bronze,
        RankTier::Silver,
        RankTier::Gold,
        RankTier::Platinum,
        RankTier::Diamond,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RankTier::Bronze => "bronze",
            RankTier::Silver => "silver",
            RankTier::Gold => "gold",
            RankTier::Platinum => "platinum",
            RankTier::Diamond => "diamond",
        }
    }
}

impl fmt::Display for RankTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown rank tier '{0}'")]
pub struct UnknownTier(pub String);

impl FromStr for RankTier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RankTier::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownTier(s.to_string()))
    }
}

/// Inbound event from the chat layer: one raw GPS fix.
///
/// `received_at` is the ingestion instant. It becomes the stored sample's
/// timestamp and is the "now" against which elapsed time is measured. Input
/// lines that omit it are stamped on arrival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationReceived {
    pub user_id: UserId,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl LocationReceived {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// An accepted sample as held by the track store. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub id: i64,
    pub user_id: UserId,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub derived_speed_kmh: f64,
    /// Distance this sample added to the user's totals (0 when suppressed).
    pub distance_km: f64,
    pub noise: Option<NoiseReason>,
    pub is_valid: bool,
}

impl LocationSample {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// A sample about to be appended; the store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSample {
    pub user_id: UserId,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub derived_speed_kmh: f64,
    pub distance_km: f64,
    pub noise: Option<NoiseReason>,
}

impl NewSample {
    pub fn into_sample(self, id: i64) -> LocationSample {
        LocationSample {
            id,
            user_id: self.user_id,
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy_meters: self.accuracy_meters,
            timestamp: self.timestamp,
            derived_speed_kmh: self.derived_speed_kmh,
            distance_km: self.distance_km,
            noise: self.noise,
            is_valid: true,
        }
    }
}

/// Cumulative movement and ranking state for one user.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UserTotals {
    pub distance_km: f64,
    pub steps: u64,
    pub points: u64,
    pub tier: RankTier,
}

/// A user's place in the overall ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Standing {
    pub points: u64,
    pub tier: RankTier,
    /// 1-based; `None` until the user has earned any points.
    pub position: Option<u32>,
}

/// Outcome of one ingestion, handed back to the chat layer for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub user_id: UserId,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectionReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noise: Option<NoiseReason>,
    pub distance_km: f64,
    pub speed_kmh: f64,
    pub points_earned: u64,
    pub total_points: u64,
    pub new_tier: Option<RankTier>,
}

impl IngestResponse {
    pub fn rejected(user_id: UserId, reason: RejectionReason) -> Self {
        Self {
            user_id,
            accepted: false,
            reason: Some(reason),
            noise: None,
            distance_km: 0.0,
            speed_kmh: 0.0,
            points_earned: 0,
            total_points: 0,
            new_tier: None,
        }
    }
}
