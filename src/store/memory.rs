//! In-memory [`TrackStore`]. Used by tests and by the `memory` backend.

use super::{StoreError, TrackStore, UserTransaction};
use crate::models::{LocationSample, NewSample, RankTier, Standing, UserId, UserTotals};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Default)]
struct UserRecord {
    /// Sorted by (timestamp, id) ascending.
    samples: Vec<LocationSample>,
    totals: UserTotals,
    ranked: bool,
}

impl UserRecord {
    fn insert_sample(&mut self, sample: LocationSample) {
        let key = (sample.timestamp, sample.id);
        let at = self.samples.partition_point(|s| (s.timestamp, s.id) <= key);
        self.samples.insert(at, sample);
    }
}

/// Each user's rows sit behind their own mutex, so transactions for one user
/// run one at a time while other users are untouched.
#[derive(Debug)]
pub struct MemoryTrackStore {
    users: RwLock<HashMap<UserId, Arc<Mutex<UserRecord>>>>,
    next_id: AtomicI64,
}

impl Default for MemoryTrackStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".to_string())
}

impl MemoryTrackStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    fn record(&self, user_id: UserId) -> Result<Option<Arc<Mutex<UserRecord>>>, StoreError> {
        Ok(self.users.read().map_err(poisoned)?.get(&user_id).cloned())
    }

    fn record_or_insert(&self, user_id: UserId) -> Result<Arc<Mutex<UserRecord>>, StoreError> {
        if let Some(record) = self.record(user_id)? {
            return Ok(record);
        }
        let mut users = self.users.write().map_err(poisoned)?;
        Ok(users.entry(user_id).or_default().clone())
    }

    fn read_record<T>(
        &self,
        user_id: UserId,
        default: T,
        f: impl FnOnce(&UserRecord) -> T,
    ) -> Result<T, StoreError> {
        match self.record(user_id)? {
            Some(record) => Ok(f(&*record.lock().map_err(poisoned)?)),
            None => Ok(default),
        }
    }

    fn standing_now(&self, user_id: UserId) -> Result<Standing, StoreError> {
        let (totals, ranked) =
            self.read_record(user_id, (UserTotals::default(), false), |r| (r.totals, r.ranked))?;
        if !ranked {
            return Ok(Standing {
                points: totals.points,
                tier: totals.tier,
                position: None,
            });
        }

        let records: Vec<Arc<Mutex<UserRecord>>> =
            self.users.read().map_err(poisoned)?.values().cloned().collect();
        let mut ahead = 0u32;
        for record in records {
            let record = record.lock().map_err(poisoned)?;
            if record.ranked && record.totals.points > totals.points {
                ahead += 1;
            }
        }
        Ok(Standing {
            points: totals.points,
            tier: totals.tier,
            position: Some(ahead + 1),
        })
    }

    fn run_transaction<T, F>(&self, user_id: UserId, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn UserTransaction) -> Result<T, StoreError>,
    {
        let record = self.record_or_insert(user_id)?;
        let mut committed = record.lock().map_err(poisoned)?;

        let mut tx = MemoryTransaction {
            user_id,
            totals: committed.totals,
            ranked: committed.ranked,
            committed: &*committed,
            staged: Vec::new(),
            next_id: &self.next_id,
        };
        let value = f(&mut tx)?;

        let MemoryTransaction {
            totals,
            ranked,
            staged,
            ..
        } = tx;
        committed.totals = totals;
        committed.ranked = ranked;
        for sample in staged {
            committed.insert_sample(sample);
        }
        Ok(value)
    }
}

struct MemoryTransaction<'a> {
    user_id: UserId,
    totals: UserTotals,
    ranked: bool,
    committed: &'a UserRecord,
    staged: Vec<LocationSample>,
    next_id: &'a AtomicI64,
}

fn newest_first(
    committed: &[LocationSample],
    staged: &[LocationSample],
    n: usize,
) -> Vec<LocationSample> {
    let mut candidates: Vec<&LocationSample> = committed
        .iter()
        .rev()
        .filter(|s| s.is_valid)
        .take(n)
        .chain(staged.iter())
        .collect();
    candidates.sort_by_key(|s| Reverse((s.timestamp, s.id)));
    candidates.into_iter().take(n).cloned().collect()
}

impl UserTransaction for MemoryTransaction<'_> {
    fn user_id(&self) -> UserId {
        self.user_id
    }

    fn latest(&mut self, n: usize) -> Result<Vec<LocationSample>, StoreError> {
        Ok(newest_first(&self.committed.samples, &self.staged, n))
    }

    fn get_user_totals(&mut self) -> Result<UserTotals, StoreError> {
        Ok(self.totals)
    }

    fn append(&mut self, sample: NewSample) -> Result<LocationSample, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sample = sample.into_sample(id);
        self.staged.push(sample.clone());
        Ok(sample)
    }

    fn apply_totals_delta(&mut self, distance_km: f64, steps: u64) -> Result<(), StoreError> {
        self.totals.distance_km += distance_km;
        self.totals.steps = self.totals.steps.saturating_add(steps);
        Ok(())
    }

    fn upsert_ranking(&mut self, points: u64, tier: RankTier) -> Result<(), StoreError> {
        self.totals.points = points;
        self.totals.tier = tier;
        self.ranked = true;
        Ok(())
    }
}

impl TrackStore for MemoryTrackStore {
    fn latest(
        &self,
        user_id: UserId,
        n: usize,
    ) -> impl Future<Output = Result<Vec<LocationSample>, StoreError>> + Send {
        async move { self.read_record(user_id, Vec::new(), |r| newest_first(&r.samples, &[], n)) }
    }

    fn get_user_totals(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<UserTotals, StoreError>> + Send {
        async move { self.read_record(user_id, UserTotals::default(), |r| r.totals) }
    }

    fn standing(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Standing, StoreError>> + Send {
        async move { self.standing_now(user_id) }
    }

    fn track(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Vec<LocationSample>, StoreError>> + Send {
        async move { self.read_record(user_id, Vec::new(), |r| r.samples.clone()) }
    }

    fn transaction<T, F>(
        &self,
        user_id: UserId,
        f: F,
    ) -> impl Future<Output = Result<T, StoreError>> + Send
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn UserTransaction) -> Result<T, StoreError> + Send + 'static,
    {
        async move { self.run_transaction(user_id, f) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn new_sample(user_id: UserId, minute: i64) -> NewSample {
        NewSample {
            user_id,
            latitude: 50.0 + minute as f64 * 0.001,
            longitude: 30.0,
            accuracy_meters: None,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::minutes(minute),
            derived_speed_kmh: 0.0,
            distance_km: 0.0,
            noise: None,
        }
    }

    #[tokio::test]
    async fn test_commit_applies_all_writes() {
        let store = MemoryTrackStore::new();
        store
            .transaction(1, |tx| {
                tx.append(new_sample(1, 0))?;
                tx.apply_totals_delta(0.5, 650)?;
                tx.upsert_ranking(5, RankTier::Bronze)?;
                Ok(())
            })
            .await
            .unwrap();

        let totals = store.get_user_totals(1).await.unwrap();
        assert_eq!(totals.steps, 650);
        assert_eq!(totals.points, 5);
        assert_eq!(store.latest(1, 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_rolls_back_everything() {
        let store = MemoryTrackStore::new();
        let result: Result<(), _> = store
            .transaction(1, |tx| {
                tx.append(new_sample(1, 0))?;
                tx.apply_totals_delta(0.5, 650)?;
                Err(StoreError::Unavailable("disk on fire".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(store.latest(1, 5).await.unwrap().is_empty());
        assert_eq!(store.get_user_totals(1).await.unwrap(), UserTotals::default());
    }

    #[tokio::test]
    async fn test_latest_is_newest_first_and_sees_staged_rows() {
        let store = MemoryTrackStore::new();
        store
            .transaction(1, |tx| {
                tx.append(new_sample(1, 2))?;
                tx.append(new_sample(1, 0))?;
                let latest = tx.latest(1)?;
                assert_eq!(latest[0].timestamp.format("%M").to_string(), "02");
                Ok(())
            })
            .await
            .unwrap();
        store.transaction(1, |tx| tx.append(new_sample(1, 1)).map(|_| ())).await.unwrap();

        let latest = store.latest(1, 2).await.unwrap();
        let minutes: Vec<String> = latest.iter().map(|s| s.timestamp.format("%M").to_string()).collect();
        assert_eq!(minutes, ["02", "01"]);

        let track = store.track(1).await.unwrap();
        assert_eq!(track.len(), 3);
        assert!(track.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_standing_positions() {
        let store = MemoryTrackStore::new();
        for (user, points) in [(1, 300), (2, 900), (3, 300)] {
            store
                .transaction(user, move |tx| tx.upsert_ranking(points, RankTier::Bronze))
                .await
                .unwrap();
        }
        assert_eq!(store.standing(2).await.unwrap().position, Some(1));
        assert_eq!(store.standing(1).await.unwrap().position, Some(2));
        assert_eq!(store.standing(3).await.unwrap().position, Some(2));
        assert_eq!(store.standing(4).await.unwrap().position, None);
    }
}
