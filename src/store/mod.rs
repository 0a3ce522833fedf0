//! The track store: append-only sample history plus per-user totals and rankings.
//!
//! Reads can happen anywhere, but every write goes through
//! [`TrackStore::transaction`]. A transaction gives the closure exclusive access
//! to one user's rows; the closure's writes are committed together when it
//! returns `Ok` and discarded together when it returns `Err`. Callers are
//! therefore serialized per user while different users proceed in parallel.

pub mod memory;

pub use memory::MemoryTrackStore;

use crate::models::{LocationSample, NewSample, RankTier, Standing, UserId, UserTotals};
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend unreachable or failed mid-operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Another writer holds or changed the user's rows. Safe to retry.
    #[error("concurrent update conflict: {0}")]
    Conflict(String),
    /// Stored data could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("store worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// One user's view of the store inside a transaction.
pub trait UserTransaction {
    fn user_id(&self) -> UserId;

    /// Up to `n` most recent valid samples, newest first.
    fn latest(&mut self, n: usize) -> Result<Vec<LocationSample>, StoreError>;

    /// Totals as of this transaction, including its own uncommitted writes.
    fn get_user_totals(&mut self) -> Result<UserTotals, StoreError>;

    fn append(&mut self, sample: NewSample) -> Result<LocationSample, StoreError>;

    fn apply_totals_delta(&mut self, distance_km: f64, steps: u64) -> Result<(), StoreError>;

    fn upsert_ranking(&mut self, points: u64, tier: RankTier) -> Result<(), StoreError>;
}

pub trait TrackStore: Send + Sync + 'static {
    fn latest(
        &self,
        user_id: UserId,
        n: usize,
    ) -> impl Future<Output = Result<Vec<LocationSample>, StoreError>> + Send;

    fn get_user_totals(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<UserTotals, StoreError>> + Send;

    /// Points, tier and 1-based position among all ranked users.
    fn standing(&self, user_id: UserId)
        -> impl Future<Output = Result<Standing, StoreError>> + Send;

    /// Every stored sample for the user, oldest first.
    fn track(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Vec<LocationSample>, StoreError>> + Send;

    /// Runs `f` as one atomic unit over `user_id`'s rows.
    fn transaction<T, F>(
        &self,
        user_id: UserId,
        f: F,
    ) -> impl Future<Output = Result<T, StoreError>> + Send
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn UserTransaction) -> Result<T, StoreError> + Send + 'static;
}
