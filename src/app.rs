//! The ingestion service.
//!
//! [`App`] wires the pure components to a [`TrackStore`]. One inbound fix is
//! one store transaction: read the latest sample, validate, estimate, append,
//! update totals, update ranking. Concurrent fixes for the same user are
//! serialized by the store; a [`StoreError::Conflict`] from a competing writer
//! is retried with fresh data a bounded number of times.

use crate::config::Config;
use crate::export::{self, ExportError};
use crate::models::{IngestResponse, LocationReceived, NewSample, Standing, UserId, UserTotals};
use crate::movement::MovementEstimator;
use crate::scoring::{Award, ScoringEngine};
use crate::store::{StoreError, TrackStore, UserTransaction};
use crate::validator::LocationValidator;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

const RETRY_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum IngestError {
    /// Nothing was written. The caller may replay the whole event.
    #[error("store failure after {attempts} attempt(s): {source}")]
    StoreFailure {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

/// The stateless half of ingestion. Copied into each store transaction.
#[derive(Debug, Clone, Copy)]
struct Pipeline {
    validator: LocationValidator,
    estimator: MovementEstimator,
    scoring: ScoringEngine,
    steps_per_km: f64,
}

impl Pipeline {
    fn ingest(
        &self,
        tx: &mut dyn UserTransaction,
        event: &LocationReceived,
    ) -> Result<IngestResponse, StoreError> {
        let coordinate = event.coordinate();
        let previous = tx.latest(1)?.into_iter().next();

        if let Err(reason) = self.validator.validate(
            coordinate,
            event.accuracy,
            previous.as_ref().map(|p| p.coordinate()),
        ) {
            warn!("Rejected fix from user {}: {}", event.user_id, reason);
            return Ok(IngestResponse::rejected(event.user_id, reason));
        }

        let movement = self
            .estimator
            .estimate(previous.as_ref(), coordinate, event.received_at);

        tx.append(NewSample {
            user_id: event.user_id,
            latitude: event.latitude,
            longitude: event.longitude,
            accuracy_meters: event.accuracy,
            timestamp: event.received_at,
            derived_speed_kmh: movement.speed_kmh,
            distance_km: movement.distance_km,
            noise: movement.noise,
        })?;

        let award = if movement.distance_km > 0.0 {
            let steps = (movement.distance_km * self.steps_per_km).floor() as u64;
            tx.apply_totals_delta(movement.distance_km, steps)?;
            self.scoring.award(tx, movement.distance_km)?
        } else {
            let totals = tx.get_user_totals()?;
            Award {
                points_earned: 0,
                total_points: totals.points,
                tier: totals.tier,
                previous_tier: totals.tier,
            }
        };

        if let Some(noise) = movement.noise {
            debug!("Fix from user {} stored without movement ({})", event.user_id, noise);
        }

        Ok(IngestResponse {
            user_id: event.user_id,
            accepted: true,
            reason: None,
            noise: movement.noise,
            distance_km: movement.distance_km,
            speed_kmh: movement.speed_kmh,
            points_earned: award.points_earned,
            total_points: award.total_points,
            new_tier: Some(award.tier),
        })
    }
}

pub struct App<S> {
    store: Arc<S>,
    pipeline: Pipeline,
    max_conflict_retries: u32,
}

impl<S> Clone for App<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            pipeline: self.pipeline,
            max_conflict_retries: self.max_conflict_retries,
        }
    }
}

impl<S: TrackStore> App<S> {
    pub fn new(config: &Config, store: S) -> Self {
        Self::with_shared_store(config, Arc::new(store))
    }

    pub fn with_shared_store(config: &Config, store: Arc<S>) -> Self {
        Self {
            store,
            pipeline: Pipeline {
                validator: LocationValidator::new(&config.tracking),
                estimator: MovementEstimator::new(&config.tracking),
                scoring: ScoringEngine::new(&config.scoring),
                steps_per_km: config.tracking.steps_per_km,
            },
            max_conflict_retries: config.storage.max_conflict_retries,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn scoring(&self) -> &ScoringEngine {
        &self.pipeline.scoring
    }

    /// Processes one inbound fix as a single atomic unit.
    ///
    /// Rejections and noise suppression are part of the returned response.
    /// An `Err` means nothing was written.
    pub async fn handle_location(
        &self,
        event: LocationReceived,
    ) -> Result<IngestResponse, IngestError> {
        // Bounds and accuracy need no history; reject those without touching the store.
        if let Err(reason) =
            self.pipeline
                .validator
                .validate(event.coordinate(), event.accuracy, None)
        {
            warn!("Rejected fix from user {}: {}", event.user_id, reason);
            return Ok(IngestResponse::rejected(event.user_id, reason));
        }

        let pipeline = self.pipeline;
        let user_id = event.user_id;
        let response = self
            .with_retries(user_id, move |tx| pipeline.ingest(tx, &event))
            .await?;

        if response.accepted {
            debug!(
                "User {}: +{:.3} km at {:.1} km/h, +{} points",
                user_id, response.distance_km, response.speed_kmh, response.points_earned
            );
        }
        Ok(response)
    }

    /// Credits `distance_km` to a user outside the GPS pipeline, as one
    /// atomic read-modify-write of their points and tier.
    pub async fn award_points(&self, user_id: UserId, distance_km: f64) -> Result<Award, IngestError> {
        let scoring = self.pipeline.scoring;
        self.with_retries(user_id, move |tx| scoring.award(tx, distance_km))
            .await
    }

    pub async fn totals(&self, user_id: UserId) -> Result<UserTotals, StoreError> {
        self.store.get_user_totals(user_id).await
    }

    pub async fn standing(&self, user_id: UserId) -> Result<Standing, StoreError> {
        self.store.standing(user_id).await
    }

    /// Writes the user's whole track as CSV. Returns the number of rows written.
    pub async fn export_track<W: Write>(&self, user_id: UserId, writer: W) -> Result<usize, ExportError> {
        let samples = self.store.track(user_id).await?;
        export::write_track(writer, &samples)
    }

    async fn with_retries<T, F>(&self, user_id: UserId, op: F) -> Result<T, IngestError>
    where
        T: Send + 'static,
        F: Fn(&mut dyn UserTransaction) -> Result<T, StoreError> + Clone + Send + 'static,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.store.transaction(user_id, op.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempts <= self.max_conflict_retries => {
                    warn!(
                        "Conflict updating user {} (attempt {}): {}. Retrying.",
                        user_id, attempts, e
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempts).await;
                }
                Err(e) => {
                    error!("Store failure for user {} after {} attempt(s): {}", user_id, attempts, e);
                    return Err(IngestError::StoreFailure { attempts, source: e });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RankTier;
    use crate::movement::NoiseReason;
    use crate::store::MemoryTrackStore;
    use crate::validator::RejectionReason;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn fix(user_id: UserId, lat: f64, lon: f64, at: DateTime<Utc>) -> LocationReceived {
        LocationReceived {
            user_id,
            latitude: lat,
            longitude: lon,
            accuracy: Some(10.0),
            received_at: at,
        }
    }

    fn app() -> App<MemoryTrackStore> {
        App::new(&Config::default(), MemoryTrackStore::new())
    }

    #[tokio::test]
    async fn test_first_fix_is_stored_without_movement() {
        let app = app();
        let response = app.handle_location(fix(1, 50.0, 30.0, t0())).await.unwrap();
        assert!(response.accepted);
        assert_eq!(response.distance_km, 0.0);
        assert_eq!(response.speed_kmh, 0.0);
        assert_eq!(response.new_tier, Some(RankTier::Bronze));
        assert_eq!(app.store().latest(1, 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_fix_is_not_stored() {
        let app = app();
        let response = app.handle_location(fix(1, 91.0, 30.0, t0())).await.unwrap();
        assert_eq!(response.reason, Some(RejectionReason::LatitudeOutOfRange));
        assert!(app.store().track(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_jump_rejection_uses_stored_history() {
        let app = app();
        app.handle_location(fix(1, 50.0, 30.0, t0())).await.unwrap();
        let response = app
            .handle_location(fix(1, 50.02, 30.0, t0() + ChronoDuration::minutes(5)))
            .await
            .unwrap();
        assert_eq!(response.reason, Some(RejectionReason::ImplausibleJump));
        assert_eq!(app.store().track(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_movement_updates_totals_and_points() {
        let app = app();
        app.handle_location(fix(1, 50.0, 30.0, t0())).await.unwrap();
        // ~0.89 km north, 10 minutes later
        let response = app
            .handle_location(fix(1, 50.008, 30.0, t0() + ChronoDuration::minutes(10)))
            .await
            .unwrap();
        assert!(response.accepted);
        assert_eq!(response.noise, None);
        assert_eq!(response.points_earned, 8);
        assert!((response.speed_kmh - response.distance_km * 6.0).abs() < 1e-9);

        let totals = app.totals(1).await.unwrap();
        assert_eq!(totals.distance_km, response.distance_km);
        assert_eq!(totals.steps, (response.distance_km * 1300.0).floor() as u64);
        assert_eq!(totals.points, 8);
    }

    #[tokio::test]
    async fn test_noise_keeps_sample_for_next_distance() {
        let app = app();
        app.handle_location(fix(1, 50.0, 30.0, t0())).await.unwrap();
        // ~5 m away one second later
        let noisy = app
            .handle_location(fix(1, 50.00005, 30.0, t0() + ChronoDuration::seconds(1)))
            .await
            .unwrap();
        assert_eq!(noisy.distance_km, 0.0);
        assert_eq!(noisy.noise, Some(NoiseReason::TooClose));
        assert_eq!(app.store().track(1).await.unwrap().len(), 2);

        // Next distance is measured from the noisy fix, not the first one
        let next = app
            .handle_location(fix(1, 50.00095, 30.0, t0() + ChronoDuration::minutes(2)))
            .await
            .unwrap();
        assert!((next.distance_km - 0.1001).abs() < 0.001, "got {}", next.distance_km);
        assert_eq!(app.totals(1).await.unwrap().distance_km, next.distance_km);
    }

    #[tokio::test]
    async fn test_award_points_crosses_into_gold() {
        let app = app();
        let first = app.award_points(7, 99.95).await.unwrap();
        assert_eq!(first.total_points, 999);
        assert_eq!(first.tier, RankTier::Silver);

        let second = app.award_points(7, 0.1).await.unwrap();
        assert_eq!(second.total_points, 1000);
        assert_eq!(second.tier, RankTier::Gold);
        assert!(second.tier_changed());

        let standing = app.standing(7).await.unwrap();
        assert_eq!(standing.tier, RankTier::Gold);
        assert_eq!(standing.position, Some(1));
    }

    #[tokio::test]
    async fn test_zero_award_writes_nothing() {
        let app = app();
        let award = app.award_points(3, 0.05).await.unwrap();
        assert_eq!(award.points_earned, 0);
        assert_eq!(app.standing(3).await.unwrap().position, None);
    }
}
