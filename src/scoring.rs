//! Points and rank tiers.
//!
//! Tier is never stored on its own: every write that changes a user's points
//! recomputes the tier from the new total in the same transaction.

use crate::config::ScoringConfig;
use crate::models::RankTier;
use crate::store::{StoreError, UserTransaction};
use tracing::info;

/// Fixed platinum threshold. Not configurable.
pub const PLATINUM_THRESHOLD: u64 = 2500;
/// Fixed diamond threshold. Not configurable.
pub const DIAMOND_THRESHOLD: u64 = 5000;

/// Ascending point thresholds. Bronze, silver and gold come from
/// configuration; platinum and diamond are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierThresholds {
    pub bronze: u64,
    pub silver: u64,
    pub gold: u64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            bronze: 100,
            silver: 500,
            gold: 1000,
        }
    }
}

impl TierThresholds {
    pub fn threshold(&self, tier: RankTier) -> u64 {
        match tier {
            RankTier::Bronze => self.bronze,
            RankTier::Silver => self.silver,
            RankTier::Gold => self.gold,
            RankTier::Platinum => PLATINUM_THRESHOLD,
            RankTier::Diamond => DIAMOND_THRESHOLD,
        }
    }

    /// Highest tier whose threshold is reached; bronze below every threshold.
    pub fn tier_for(&self, points: u64) -> RankTier {
        RankTier::ALL
            .into_iter()
            .rev()
            .find(|tier| points >= self.threshold(*tier))
            .unwrap_or(RankTier::Bronze)
    }
}

/// Result of crediting distance to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Award {
    pub points_earned: u64,
    pub total_points: u64,
    pub tier: RankTier,
    pub previous_tier: RankTier,
}

impl Award {
    pub fn tier_changed(&self) -> bool {
        self.tier != self.previous_tier
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringEngine {
    points_per_km: f64,
    thresholds: TierThresholds,
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self::new(&ScoringConfig::default())
    }
}

impl ScoringEngine {
    pub fn new(config: &ScoringConfig) -> Self {
        Self {
            points_per_km: config.points_per_km,
            thresholds: config.thresholds(),
        }
    }

    pub fn thresholds(&self) -> &TierThresholds {
        &self.thresholds
    }

    pub fn tier_for(&self, points: u64) -> RankTier {
        self.thresholds.tier_for(points)
    }

    /// Points for a distance, truncated toward zero. Non-positive and NaN
    /// distances earn nothing.
    pub fn points_for(&self, distance_km: f64) -> u64 {
        let raw = distance_km * self.points_per_km;
        if raw > 0.0 {
            raw.floor() as u64
        } else {
            0
        }
    }

    /// Credits `distance_km` to the user owning `tx`.
    ///
    /// Must run inside a store transaction so the read of the current points
    /// and the ranking upsert form one read-modify-write. Movement that earns
    /// no points writes nothing and reports the unchanged standing.
    pub fn award(
        &self,
        tx: &mut dyn UserTransaction,
        distance_km: f64,
    ) -> Result<Award, StoreError> {
        let current = tx.get_user_totals()?;
        let points_earned = self.points_for(distance_km);
        if points_earned == 0 {
            return Ok(Award {
                points_earned: 0,
                total_points: current.points,
                tier: current.tier,
                previous_tier: current.tier,
            });
        }

        let total_points = current.points.saturating_add(points_earned);
        let tier = self.tier_for(total_points);
        tx.upsert_ranking(total_points, tier)?;

        let award = Award {
            points_earned,
            total_points,
            tier,
            previous_tier: current.tier,
        };
        if award.tier_changed() {
            info!(
                "User {} moved from {} to {} at {} points",
                tx.user_id(),
                current.tier,
                tier,
                total_points
            );
        } else {
            info!("User {} earned {} points ({} total)", tx.user_id(), points_earned, total_points);
        }
        Ok(award)
    }
}
