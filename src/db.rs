//! SQLite-backed [`TrackStore`].
//!
//! One connection sits behind a mutex and all work runs on tokio's blocking
//! pool. Each unit of work opens a `BEGIN IMMEDIATE` transaction, so the write
//! lock is taken before the user's rows are read; a second process writing to
//! the same file makes us wait up to the busy timeout and then surfaces a
//! [`StoreError::Conflict`].

use crate::models::{LocationSample, NewSample, RankTier, Standing, UserId, UserTotals};
use crate::movement::NoiseReason;
use crate::store::{StoreError, TrackStore, UserTransaction};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

const CURRENT_VERSION: i32 = 1;

const SCHEMA_VERSION_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY,
    total_distance REAL NOT NULL DEFAULT 0.0,
    total_steps INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS rankings (
    user_id INTEGER PRIMARY KEY,
    points INTEGER NOT NULL DEFAULT 0,
    rank_level TEXT NOT NULL DEFAULT 'bronze',
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS gps_tracks (
    track_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    accuracy_m REAL,
    timestamp_ms INTEGER NOT NULL,
    speed_kmh REAL NOT NULL DEFAULT 0.0,
    distance_km REAL NOT NULL DEFAULT 0.0,
    noise TEXT,
    is_valid INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_gps_tracks_user_time ON gps_tracks(user_id, timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_rankings_points ON rankings(points);
";

const SAMPLE_COLUMNS: &str = "track_id, user_id, latitude, longitude, accuracy_m, timestamp_ms, \
                              speed_kmh, distance_km, noise, is_valid";

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref err, _)
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                StoreError::Conflict(e.to_string())
            }
            rusqlite::Error::SqliteFailure(ref err, _)
                if matches!(
                    err.code,
                    ErrorCode::CannotOpen | ErrorCode::DiskFull | ErrorCode::SystemIoFailure
                ) =>
            {
                StoreError::Unavailable(e.to_string())
            }
            e => StoreError::Sqlite(e),
        }
    }
}

fn to_db_int(value: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{what} {value} exceeds i64")))
}

fn from_db_int(value: i64, what: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {what}: {value}")))
}

fn parse_tier(raw: &str) -> Result<RankTier, StoreError> {
    raw.parse().map_err(|e| StoreError::Corrupt(format!("{e}")))
}

/// Raw row before domain decoding, so decoding errors are ours and not rusqlite's.
struct SampleRow {
    id: i64,
    user_id: i64,
    latitude: f64,
    longitude: f64,
    accuracy_m: Option<f64>,
    timestamp_ms: i64,
    speed_kmh: f64,
    distance_km: f64,
    noise: Option<String>,
    is_valid: bool,
}

impl SampleRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            latitude: row.get(2)?,
            longitude: row.get(3)?,
            accuracy_m: row.get(4)?,
            timestamp_ms: row.get(5)?,
            speed_kmh: row.get(6)?,
            distance_km: row.get(7)?,
            noise: row.get(8)?,
            is_valid: row.get(9)?,
        })
    }

    fn decode(self) -> Result<LocationSample, StoreError> {
        let timestamp = DateTime::<Utc>::from_timestamp_millis(self.timestamp_ms).ok_or_else(|| {
            StoreError::Corrupt(format!("timestamp {} out of range", self.timestamp_ms))
        })?;
        let noise = self
            .noise
            .as_deref()
            .map(str::parse::<NoiseReason>)
            .transpose()
            .map_err(StoreError::Corrupt)?;
        Ok(LocationSample {
            id: self.id,
            user_id: self.user_id,
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy_meters: self.accuracy_m,
            timestamp,
            derived_speed_kmh: self.speed_kmh,
            distance_km: self.distance_km,
            noise,
            is_valid: self.is_valid,
        })
    }
}

fn query_samples(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<LocationSample>, StoreError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, SampleRow::from_row)?;
    rows.map(|row| row.map_err(StoreError::from).and_then(SampleRow::decode))
        .collect()
}

fn latest_samples(
    conn: &Connection,
    user_id: UserId,
    n: usize,
) -> Result<Vec<LocationSample>, StoreError> {
    let sql = format!(
        "SELECT {SAMPLE_COLUMNS} FROM gps_tracks
         WHERE user_id = ?1 AND is_valid = 1
         ORDER BY timestamp_ms DESC, track_id DESC
         LIMIT ?2"
    );
    let limit = i64::try_from(n).unwrap_or(i64::MAX);
    query_samples(conn, &sql, params![user_id, limit])
}

fn all_samples(conn: &Connection, user_id: UserId) -> Result<Vec<LocationSample>, StoreError> {
    let sql = format!(
        "SELECT {SAMPLE_COLUMNS} FROM gps_tracks
         WHERE user_id = ?1
         ORDER BY timestamp_ms ASC, track_id ASC"
    );
    query_samples(conn, &sql, params![user_id])
}

fn user_totals(conn: &Connection, user_id: UserId) -> Result<UserTotals, StoreError> {
    let (distance_km, steps, points, tier): (f64, i64, i64, String) = conn.query_row(
        "SELECT COALESCE(u.total_distance, 0.0),
                COALESCE(u.total_steps, 0),
                COALESCE(r.points, 0),
                COALESCE(r.rank_level, 'bronze')
         FROM (SELECT ?1 AS user_id) k
         LEFT JOIN users u ON u.user_id = k.user_id
         LEFT JOIN rankings r ON r.user_id = k.user_id",
        params![user_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;
    Ok(UserTotals {
        distance_km,
        steps: from_db_int(steps, "steps")?,
        points: from_db_int(points, "points")?,
        tier: parse_tier(&tier)?,
    })
}

fn user_standing(conn: &Connection, user_id: UserId) -> Result<Standing, StoreError> {
    let row: Option<(i64, String, i64)> = conn
        .query_row(
            "SELECT points, rank_level,
                    (SELECT COUNT(*) + 1 FROM rankings r2 WHERE r2.points > r1.points)
             FROM rankings r1
             WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    match row {
        Some((points, tier, position)) => Ok(Standing {
            points: from_db_int(points, "points")?,
            tier: parse_tier(&tier)?,
            position: Some(u32::try_from(position).unwrap_or(u32::MAX)),
        }),
        None => Ok(Standing::default()),
    }
}

struct SqliteTransaction<'a> {
    conn: &'a Connection,
    user_id: UserId,
}

impl UserTransaction for SqliteTransaction<'_> {
    fn user_id(&self) -> UserId {
        self.user_id
    }

    fn latest(&mut self, n: usize) -> Result<Vec<LocationSample>, StoreError> {
        latest_samples(self.conn, self.user_id, n)
    }

    fn get_user_totals(&mut self) -> Result<UserTotals, StoreError> {
        user_totals(self.conn, self.user_id)
    }

    fn append(&mut self, sample: NewSample) -> Result<LocationSample, StoreError> {
        self.conn
            .prepare_cached(
                "INSERT INTO gps_tracks
                    (user_id, latitude, longitude, accuracy_m, timestamp_ms, speed_kmh, distance_km, noise, is_valid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)",
            )?
            .execute(params![
                sample.user_id,
                sample.latitude,
                sample.longitude,
                sample.accuracy_meters,
                sample.timestamp.timestamp_millis(),
                sample.derived_speed_kmh,
                sample.distance_km,
                sample.noise.map(|n| n.as_str()),
            ])?;
        let id = self.conn.last_insert_rowid();
        Ok(sample.into_sample(id))
    }

    fn apply_totals_delta(&mut self, distance_km: f64, steps: u64) -> Result<(), StoreError> {
        self.conn
            .prepare_cached(
                "INSERT INTO users (user_id, total_distance, total_steps) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                    total_distance = total_distance + excluded.total_distance,
                    total_steps = total_steps + excluded.total_steps",
            )?
            .execute(params![self.user_id, distance_km, to_db_int(steps, "steps")?])?;
        Ok(())
    }

    fn upsert_ranking(&mut self, points: u64, tier: RankTier) -> Result<(), StoreError> {
        self.conn
            .prepare_cached(
                "INSERT INTO rankings (user_id, points, rank_level, updated_at)
                 VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
                 ON CONFLICT(user_id) DO UPDATE SET
                    points = excluded.points,
                    rank_level = excluded.rank_level,
                    updated_at = excluded.updated_at",
            )?
            .execute(params![self.user_id, to_db_int(points, "points")?, tier.as_str()])?;
        Ok(())
    }
}

/// SQLite database wrapper implementing [`TrackStore`].
#[derive(Clone)]
pub struct SqliteTrackStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTrackStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::initialize(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_VERSION_TABLE)?;
        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

        if current_version < 1 {
            conn.execute_batch(SCHEMA)?;
            conn.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
                [CURRENT_VERSION],
            )?;
            info!("Database migrated to version {}", CURRENT_VERSION);
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".into()))?;
            f(&mut conn)
        })
        .await?
    }
}

impl TrackStore for SqliteTrackStore {
    fn latest(
        &self,
        user_id: UserId,
        n: usize,
    ) -> impl Future<Output = Result<Vec<LocationSample>, StoreError>> + Send {
        self.with_conn(move |conn| latest_samples(conn, user_id, n))
    }

    fn get_user_totals(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<UserTotals, StoreError>> + Send {
        self.with_conn(move |conn| user_totals(conn, user_id))
    }

    fn standing(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Standing, StoreError>> + Send {
        self.with_conn(move |conn| user_standing(conn, user_id))
    }

    fn track(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Vec<LocationSample>, StoreError>> + Send {
        self.with_conn(move |conn| all_samples(conn, user_id))
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
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&mut SqliteTransaction {
                conn: &tx,
                user_id,
            })?;
            tx.commit()?;
            Ok(value)
        })
    }
}
