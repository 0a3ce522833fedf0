//! CSV export of a user's stored track.

use crate::models::LocationSample;
use crate::store::StoreError;
use serde::Serialize;
use std::io::Write;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Serialize)]
struct TrackRow<'a> {
    timestamp: String,
    latitude: f64,
    longitude: f64,
    accuracy_m: Option<f64>,
    speed_kmh: f64,
    distance_km: f64,
    noise: &'a str,
}

impl<'a> From<&'a LocationSample> for TrackRow<'a> {
    fn from(sample: &'a LocationSample) -> Self {
        Self {
            timestamp: sample.timestamp.to_rfc3339(),
            latitude: sample.latitude,
            longitude: sample.longitude,
            accuracy_m: sample.accuracy_meters,
            speed_kmh: sample.derived_speed_kmh,
            distance_km: sample.distance_km,
            noise: sample.noise.map(|n| n.as_str()).unwrap_or(""),
        }
    }
}

/// Writes one header row plus one row per sample, in the given order.
pub fn write_track<W: Write>(writer: W, samples: &[LocationSample]) -> Result<usize, ExportError> {
    let mut wtr = csv::WriterBuilder::new().has_headers(true).from_writer(writer);
    for sample in samples {
        wtr.serialize(TrackRow::from(sample))?;
    }
    wtr.flush()?;
    Ok(samples.len())
}
