//! End-to-end ingestion against both store backends.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::time::Duration as StdDuration;
use stridepoint::app::App;
use stridepoint::config::Config;
use stridepoint::db::SqliteTrackStore;
use stridepoint::models::{LocationReceived, RankTier, UserId};
use stridepoint::movement::NoiseReason;
use stridepoint::store::{MemoryTrackStore, TrackStore};
use stridepoint::validator::RejectionReason;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 7, 30, 0).unwrap()
}

fn fix(user_id: UserId, lat: f64, lon: f64, accuracy: Option<f64>, at: DateTime<Utc>) -> LocationReceived {
    LocationReceived {
        user_id,
        latitude: lat,
        longitude: lon,
        accuracy,
        received_at: at,
    }
}

/// Walks north in 0.8 km steps, five minutes apart.
async fn walk<S: TrackStore>(app: &App<S>, user_id: UserId, steps: usize) {
    for i in 0..=steps {
        let response = app
            .handle_location(fix(
                user_id,
                50.0 + i as f64 * 0.0072,
                30.0,
                Some(5.0),
                t0() + Duration::minutes(5 * i as i64),
            ))
            .await
            .unwrap();
        assert!(response.accepted, "step {i} rejected: {response:?}");
    }
}

#[tokio::test]
async fn test_rejections_are_reported_and_not_stored() {
    let app = App::new(&Config::default(), MemoryTrackStore::new());

    let cases = [
        (fix(1, 91.0, 30.0, None, t0()), RejectionReason::LatitudeOutOfRange),
        (fix(1, 50.0, 200.0, None, t0()), RejectionReason::LongitudeOutOfRange),
        (fix(1, 50.0, 30.0, Some(51.0), t0()), RejectionReason::LowAccuracy),
    ];
    for (event, reason) in cases {
        let response = app.handle_location(event).await.unwrap();
        assert!(!response.accepted);
        assert_eq!(response.reason, Some(reason));
        assert_eq!(response.new_tier, None);
    }
    assert!(app.store().track(1).await.unwrap().is_empty());

    // A 2 km hop from the stored fix is refused; a 0.2 km one is fine
    app.handle_location(fix(1, 50.0, 30.0, Some(10.0), t0())).await.unwrap();
    let jump = app
        .handle_location(fix(1, 50.018, 30.0, Some(10.0), t0() + Duration::minutes(3)))
        .await
        .unwrap();
    assert_eq!(jump.reason, Some(RejectionReason::ImplausibleJump));
    let hop = app
        .handle_location(fix(1, 50.0018, 30.0, Some(10.0), t0() + Duration::minutes(3)))
        .await
        .unwrap();
    assert!(hop.accepted);
    assert_eq!(app.store().track(1).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_first_fix_never_moves() {
    let app = App::new(&Config::default(), MemoryTrackStore::new());
    let response = app
        .handle_location(fix(5, -33.8688, 151.2093, Some(3.0), t0()))
        .await
        .unwrap();
    assert!(response.accepted);
    assert_eq!(response.distance_km, 0.0);
    assert_eq!(response.speed_kmh, 0.0);
    assert_eq!(response.points_earned, 0);
}

#[tokio::test]
async fn test_noise_suppressed_fix_is_retained() {
    let app = App::new(&Config::default(), MemoryTrackStore::new());
    app.handle_location(fix(2, 50.0, 30.0, None, t0())).await.unwrap();

    // ~10 m away, one second later
    let noisy = app
        .handle_location(fix(2, 50.00009, 30.0, None, t0() + Duration::seconds(1)))
        .await
        .unwrap();
    assert!(noisy.accepted);
    assert_eq!(noisy.distance_km, 0.0);
    assert!(noisy.noise.is_some());
    assert_eq!(app.totals(2).await.unwrap().distance_km, 0.0);

    let latest = app.store().latest(2, 1).await.unwrap();
    assert_eq!(latest[0].latitude, 50.00009);
    assert_eq!(latest[0].noise, noisy.noise);
}

#[tokio::test]
async fn test_tier_flips_with_the_points_update() {
    let app = App::new(&Config::default(), MemoryTrackStore::new());
    let before = app.award_points(3, 99.5).await.unwrap();
    assert_eq!(before.total_points, 995);
    assert_eq!(before.tier, RankTier::Silver);

    app.handle_location(fix(3, 50.0, 30.0, None, t0())).await.unwrap();
    let response = app
        .handle_location(fix(3, 50.006, 30.0, None, t0() + Duration::minutes(6)))
        .await
        .unwrap();
    assert_eq!(response.points_earned, 6);
    assert_eq!(response.total_points, 1001);
    assert_eq!(response.new_tier, Some(RankTier::Gold));

    let totals = app.totals(3).await.unwrap();
    assert_eq!((totals.points, totals.tier), (1001, RankTier::Gold));
    // Tier is always re-derivable from the stored points
    assert_eq!(app.scoring().tier_for(totals.points), totals.tier);
}

#[tokio::test]
async fn test_speed_is_clamped_but_sample_kept() {
    let mut config = Config::default();
    config.tracking.max_plausible_jump_km = 50.0;
    let app = App::new(&config, MemoryTrackStore::new());

    app.handle_location(fix(4, 50.0, 30.0, None, t0())).await.unwrap();
    // ~20 km in 36 seconds
    let response = app
        .handle_location(fix(4, 50.18, 30.0, None, t0() + Duration::seconds(36)))
        .await
        .unwrap();
    assert!(response.accepted);
    assert_eq!(response.speed_kmh, 100.0);
    assert_eq!(app.store().latest(4, 1).await.unwrap()[0].derived_speed_kmh, 100.0);
}

#[tokio::test]
async fn test_standings_across_users() {
    let app = App::new(&Config::default(), MemoryTrackStore::new());
    walk(&app, 10, 4).await;
    walk(&app, 11, 2).await;
    app.handle_location(fix(12, 50.0, 30.0, None, t0())).await.unwrap();

    let leader = app.standing(10).await.unwrap();
    let runner_up = app.standing(11).await.unwrap();
    assert_eq!(leader.position, Some(1));
    assert_eq!(runner_up.position, Some(2));
    assert!(leader.points > runner_up.points);
    assert_eq!(app.standing(12).await.unwrap().position, None);
}

#[tokio::test]
async fn test_sqlite_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tracks.db");
    let config = Config::default();

    let first_totals = {
        let store = SqliteTrackStore::open(&path, StdDuration::from_secs(1)).unwrap();
        let app = App::new(&config, store);
        walk(&app, 1, 3).await;
        app.totals(1).await.unwrap()
    };
    assert_eq!(first_totals.points, 24);
    assert!((first_totals.distance_km - 2.4).abs() < 0.01);

    let store = SqliteTrackStore::open(&path, StdDuration::from_secs(1)).unwrap();
    let app = App::new(&config, store);
    assert_eq!(app.totals(1).await.unwrap(), first_totals);
    assert_eq!(app.store().track(1).await.unwrap().len(), 4);

    // History survives too: the next fix measures from the last stored one
    let next = app
        .handle_location(fix(1, 50.0216 + 0.0072, 30.0, None, t0() + Duration::minutes(20)))
        .await
        .unwrap();
    assert_eq!(next.noise, None);
    assert!((next.distance_km - 0.8).abs() < 0.01);
}

#[tokio::test]
async fn test_sqlite_noise_reason_is_recorded() {
    let store = SqliteTrackStore::open_in_memory().unwrap();
    let app = App::new(&Config::default(), store);
    app.handle_location(fix(1, 50.0, 30.0, None, t0())).await.unwrap();
    app.handle_location(fix(1, 50.002, 30.0, None, t0() + Duration::seconds(4)))
        .await
        .unwrap();

    let track = app.store().track(1).await.unwrap();
    assert_eq!(track.len(), 2);
    assert_eq!(track[1].noise, Some(NoiseReason::TooSoon));
    assert_eq!(track[1].distance_km, 0.0);
}

#[tokio::test]
async fn test_export_track_csv() {
    let app = App::new(&Config::default(), MemoryTrackStore::new());
    walk(&app, 8, 2).await;

    let mut out = Vec::new();
    let rows = app.export_track(8, &mut out).await.unwrap();
    assert_eq!(rows, 3);
    let text = String::from_utf8(out).unwrap();
    assert_eq!(text.lines().count(), 4);
    assert!(text.starts_with("timestamp,latitude,longitude"));
}
